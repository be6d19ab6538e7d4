// Matrix Expansion
// Expands a job template across its declared axes into concrete instances

use crate::template::models::JobTemplate;
use crate::template::parser::ConfigError;

/// A single concrete job instance: one assignment of every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInstance {
    /// Display name (axis values joined with '-')
    pub name: String,
    /// Axis assignment in declaration order
    pub selection: Vec<(String, String)>,
}

impl JobInstance {
    pub fn new(selection: Vec<(String, String)>) -> Self {
        let name = if selection.is_empty() {
            "default".to_string()
        } else {
            selection
                .iter()
                .map(|(_, value)| value.as_str())
                .collect::<Vec<_>>()
                .join("-")
        };
        Self { name, selection }
    }

    /// Value assigned for a named axis.
    pub fn axis_value(&self, axis: &str) -> Option<&str> {
        self.selection
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    /// Platform label: the "platform" axis when declared, else the
    /// template-level platform field, else "local".
    pub fn platform<'a>(&'a self, template: &'a JobTemplate) -> &'a str {
        self.axis_value("platform")
            .or(template.platform.as_deref())
            .unwrap_or("local")
    }

    /// Label the environment cache is keyed under. The full selection
    /// participates: environments differ across every axis.
    pub fn cache_label(&self) -> String {
        if self.selection.is_empty() {
            return "default".to_string();
        }
        self.selection
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Filesystem-safe directory name for per-instance state.
    pub fn dir_name(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Matrix expander for job templates.
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into one instance per element of the cartesian
    /// product of its axes. Order is lexicographic over axis declaration
    /// order then value order; the expansion is deterministic and pure.
    /// A template with no axes yields a single instance.
    pub fn expand(template: &JobTemplate) -> Result<Vec<JobInstance>, ConfigError> {
        for axis in &template.axes {
            if axis.values.is_empty() {
                return Err(ConfigError::EmptyAxis(axis.name.clone()));
            }
        }

        let mut instances = vec![Vec::new()];
        for axis in &template.axes {
            let mut next = Vec::with_capacity(instances.len() * axis.values.len());
            for prefix in &instances {
                for value in &axis.values {
                    let mut selection: Vec<(String, String)> = prefix.clone();
                    selection.push((axis.name.clone(), value.clone()));
                    next.push(selection);
                }
            }
            instances = next;
        }

        Ok(instances.into_iter().map(JobInstance::new).collect())
    }
}
