// Template Parser
// Loads and validates declarative job template documents

use crate::template::models::JobTemplate;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors for malformed templates. All of these are fatal before scheduling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid template YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("matrix axis '{0}' has no values")]
    EmptyAxis(String),

    #[error("duplicate matrix axis '{0}'")]
    DuplicateAxis(String),

    #[error("template declares no steps")]
    NoSteps,

    #[error("step {0} has an empty name")]
    UnnamedStep(usize),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{0}' has an empty run body")]
    EmptyRun(String),

    #[error("coverage sink declares neither an endpoint nor a directory")]
    SinkTarget,
}

/// Parser for job template documents.
pub struct TemplateParser;

impl TemplateParser {
    /// Parse and validate a template from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<JobTemplate, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse and validate a template from YAML content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<JobTemplate, ConfigError> {
        let template: JobTemplate = serde_yaml::from_str(content)?;
        validate(&template)?;
        Ok(template)
    }
}

/// Validate a parsed template. Separate from deserialization so
/// programmatically built templates go through the same checks.
pub fn validate(template: &JobTemplate) -> Result<(), ConfigError> {
    let mut axis_names = HashSet::new();
    for axis in &template.axes {
        if axis.values.is_empty() {
            return Err(ConfigError::EmptyAxis(axis.name.clone()));
        }
        if !axis_names.insert(axis.name.as_str()) {
            return Err(ConfigError::DuplicateAxis(axis.name.clone()));
        }
    }

    if template.steps.is_empty() {
        return Err(ConfigError::NoSteps);
    }

    let mut step_names = HashSet::new();
    for (index, step) in template.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(ConfigError::UnnamedStep(index));
        }
        if !step_names.insert(step.name.as_str()) {
            return Err(ConfigError::DuplicateStep(step.name.clone()));
        }
        if step.run.trim().is_empty() {
            return Err(ConfigError::EmptyRun(step.name.clone()));
        }
    }

    if let Some(sink) = &template.coverage_sink {
        if sink.endpoint.is_none() && sink.directory.is_none() {
            return Err(ConfigError::SinkTarget);
        }
    }

    Ok(())
}
