// Template Module
// Declarative job template document: models, parsing, validation

pub mod models;
pub mod parser;

// Re-export key types
pub use models::{
    CoverageArtifact, EnvironmentSpec, JobResult, JobStatus, JobTemplate, MatrixAxis,
    PipelineResult, SinkConfig, StepResult, StepSpec,
};
pub use parser::{validate, ConfigError, TemplateParser};
