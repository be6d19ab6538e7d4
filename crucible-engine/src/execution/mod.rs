// Execution Engine Module
// Matrix expansion, job execution, and pipeline orchestration

pub mod controller;
pub mod events;
pub mod executor;
pub mod matrix;

// Re-export key types
pub use controller::PipelineController;
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::JobExecutor;
pub use matrix::{JobInstance, MatrixExpander};
