// Execution Events
// Progress reporting for pipeline execution

use crate::template::models::JobStatus;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted {
        pipeline_name: String,
        total_jobs: usize,
    },

    /// Pipeline execution completed
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// Environment provisioning started for a job
    ProvisioningStarted { job_name: String },

    /// Environment provisioning finished for a job
    ProvisioningCompleted {
        job_name: String,
        cache_hit: bool,
        duration: Duration,
    },

    /// Job execution started
    JobStarted {
        job_name: String,
        total_steps: usize,
    },

    /// Job execution completed
    JobCompleted {
        job_name: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Job was abandoned by fail-fast before completing
    JobCanceled { job_name: String, reason: String },

    /// Step execution started
    StepStarted {
        job_name: String,
        step_name: String,
        step_index: usize,
    },

    /// Step execution completed
    StepCompleted {
        job_name: String,
        step_name: String,
        step_index: usize,
        exit_code: Option<i32>,
        tolerated: bool,
        duration: Duration,
    },

    /// Merged coverage report upload finished
    UploadCompleted { success: bool },
}

impl ExecutionEvent {
    /// Create a pipeline started event
    pub fn pipeline_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_jobs,
        }
    }

    /// Create a pipeline completed event
    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    /// Create a job started event
    pub fn job_started(job_name: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
            total_steps,
        }
    }

    /// Create a job completed event
    pub fn job_completed(
        job_name: impl Into<String>,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            status,
            duration,
        }
    }

    /// Create a step completed event
    pub fn step_completed(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        exit_code: Option<i32>,
        tolerated: bool,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            exit_code,
            tolerated,
            duration,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
