// Crucible Engine Library
// Generic CI test-orchestration: matrix expansion, cached environment
// provisioning, staged step execution, and coverage aggregation

pub mod cache;
pub mod coverage;
pub mod execution;
pub mod provision;
pub mod runners;
pub mod template;

// Re-export template types
pub use template::{
    validate, ConfigError, CoverageArtifact, EnvironmentSpec, JobResult, JobStatus, JobTemplate,
    MatrixAxis, PipelineResult, SinkConfig, StepResult, StepSpec, TemplateParser,
};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, JobExecutor, JobInstance, MatrixExpander,
    PipelineController, ProgressReceiver, ProgressSender,
};

// Re-export cache and provisioning types
pub use cache::{CacheError, CacheKey, CacheKeyResolver, CacheStore, CacheStoreConfig};
pub use provision::{Activation, Environment, EnvironmentProvisioner, ProvisionError};

// Re-export runner types
pub use runners::{Shell, StepRunner};

// Re-export coverage types
pub use coverage::{
    CoverageAggregator, CoverageReport, CoverageSink, FsSink, HttpSink, MergedReport, UploadError,
};
