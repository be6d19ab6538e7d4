// Pipeline Controller
// Top-level orchestrator: expansion, parallel scheduling, aggregation

use crate::cache::CacheStore;
use crate::coverage::sink::{sink_for, CoverageSink};
use crate::coverage::CoverageAggregator;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::JobExecutor;
use crate::execution::matrix::MatrixExpander;
use crate::provision::EnvironmentProvisioner;
use crate::template::models::{JobResult, JobStatus, JobTemplate, PipelineResult};
use crate::template::parser::{validate, ConfigError};

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Drives a template through expansion, parallel job execution, coverage
/// aggregation, and upload. Never panics; every failure surfaces in the
/// returned PipelineResult, except malformed templates which abort
/// before any job is scheduled.
pub struct PipelineController {
    store: Arc<CacheStore>,
    /// Directory steps run in by default
    workspace: PathBuf,
    /// Directory per-instance environments are materialized under
    env_root: PathBuf,
    events: Option<ProgressSender>,
    /// Sink override; when unset the sink is chosen from the template
    sink: Option<Arc<dyn CoverageSink>>,
}

impl PipelineController {
    pub fn new() -> Self {
        let env_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crucible")
            .join("envs");

        Self {
            store: Arc::new(CacheStore::new()),
            workspace: PathBuf::from("."),
            env_root,
            events: None,
            sink: None,
        }
    }

    /// Set the directory steps run in.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Use a specific cache store.
    pub fn with_cache_store(mut self, store: Arc<CacheStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the directory environments are materialized under.
    pub fn with_env_root(mut self, env_root: impl Into<PathBuf>) -> Self {
        self.env_root = env_root.into();
        self
    }

    /// Set progress event sender.
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Override the coverage sink (used by tests and embedders).
    pub fn with_sink(mut self, sink: Arc<dyn CoverageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run the pipeline described by the template.
    pub async fn run(&self, template: JobTemplate) -> Result<PipelineResult, ConfigError> {
        validate(&template)?;
        let instances = MatrixExpander::expand(&template)?;

        let start = Instant::now();
        let pipeline_name = template.display_name().to_string();
        self.events.send_event(ExecutionEvent::pipeline_started(
            pipeline_name.clone(),
            instances.len(),
        ));
        info!(pipeline = %pipeline_name, jobs = instances.len(), "pipeline started");

        let template = Arc::new(template);
        let cancel = Arc::new(AtomicBool::new(false));
        let provisioner = Arc::new(EnvironmentProvisioner::new(
            self.store.clone(),
            &self.env_root,
        ));
        let permits = template.max_parallel.unwrap_or(instances.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        // One independent task per matrix combination; steps within a
        // job stay strictly sequential inside its executor.
        let mut handles = Vec::with_capacity(instances.len());
        for instance in &instances {
            let template = template.clone();
            let instance = instance.clone();
            let workspace = self.workspace.clone();
            let semaphore = semaphore.clone();
            let executor = JobExecutor::new(provisioner.clone(), cancel.clone())
                .with_progress(self.events.clone());

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                executor.execute(&template, &instance, &workspace).await
            }));
        }

        // Collect in expansion order; aggregation happens after each
        // job's local completion, so the aggregator needs no locking.
        let mut aggregator = CoverageAggregator::new();
        let mut jobs = Vec::with_capacity(handles.len());
        for (instance, handle) in instances.iter().zip(handles) {
            let (result, report) = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => (
                    JobResult {
                        instance_name: instance.name.clone(),
                        selection: instance.selection.clone(),
                        status: JobStatus::Failed,
                        steps: Vec::new(),
                        duration: Duration::ZERO,
                        error: Some(format!("job task aborted: {}", e)),
                    },
                    Default::default(),
                ),
            };

            if result.success() || result.degraded() {
                aggregator.record(result.instance_name.clone(), report);
            }
            jobs.push(result);
        }

        // Finalize and hand the merged report to the sink.
        let merged = aggregator.finalize();
        let mut upload_error = None;
        if let Some(config) = &template.coverage_sink {
            let outcome = match &self.sink {
                Some(sink) => sink.upload(&merged, config).await,
                None => match sink_for(config) {
                    Ok(sink) => sink.upload(&merged, config).await,
                    Err(e) => Err(e),
                },
            };

            match outcome {
                Ok(()) => {
                    self.events
                        .send_event(ExecutionEvent::UploadCompleted { success: true });
                }
                Err(e) => {
                    self.events
                        .send_event(ExecutionEvent::UploadCompleted { success: false });
                    if config.fail_ci_if_error {
                        upload_error = Some(e.to_string());
                    } else {
                        warn!(error = %e, "coverage upload failed; continuing");
                    }
                }
            }
        }

        let jobs_ok = jobs
            .iter()
            .all(|j| !matches!(j.status, JobStatus::Failed | JobStatus::Canceled));
        let success = jobs_ok && upload_error.is_none();
        let duration = start.elapsed();

        self.events.send_event(ExecutionEvent::pipeline_completed(
            pipeline_name.clone(),
            success,
            duration,
        ));
        info!(pipeline = %pipeline_name, success, "pipeline finished");

        Ok(PipelineResult {
            pipeline_name,
            jobs,
            duration,
            upload_error,
            success,
        })
    }
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}
