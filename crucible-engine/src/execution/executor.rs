// Job Executor
// Drives one job instance through provisioning and its step sequence

use crate::coverage::CoverageReport;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobInstance;
use crate::provision::EnvironmentProvisioner;
use crate::runners::StepRunner;
use crate::template::models::{JobResult, JobStatus, JobTemplate, StepResult};

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::info;

/// Executes a single job instance: provisions its environment once, then
/// runs the template's steps strictly in order. The per-instance state
/// machine is Pending -> Provisioning -> Running(i) -> terminal, where
/// terminal is Succeeded, SucceededWithIssues, Failed, or Canceled.
/// The JobResult is emitted exactly once.
pub struct JobExecutor {
    runner: StepRunner,
    provisioner: Arc<EnvironmentProvisioner>,
    /// Shared fail-fast flag; set when any sibling fails
    cancel: Arc<AtomicBool>,
    events: Option<ProgressSender>,
}

impl JobExecutor {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            runner: StepRunner::new(),
            provisioner,
            cancel,
            events: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.events = tx;
        self
    }

    /// Execute the instance and return its result plus the coverage
    /// report its test stages accumulated.
    pub async fn execute(
        &self,
        template: &JobTemplate,
        instance: &JobInstance,
        workspace: &Path,
    ) -> (JobResult, CoverageReport) {
        let start = Instant::now();
        let job_name = instance.name.clone();
        let mut report = CoverageReport::new();

        // Cooperative fail-fast: a job that has not started yet is
        // abandoned outright.
        if template.fail_fast && self.cancel.load(Ordering::SeqCst) {
            self.events.send_event(ExecutionEvent::JobCanceled {
                job_name: job_name.clone(),
                reason: "a sibling job failed".to_string(),
            });
            return (
                self.terminal(instance, JobStatus::Canceled, Vec::new(), start, None),
                report,
            );
        }

        // Pending -> Provisioning
        let environment = match &template.environment {
            Some(spec) => {
                self.events.send_event(ExecutionEvent::ProvisioningStarted {
                    job_name: job_name.clone(),
                });
                let provision_start = Instant::now();

                match self
                    .provisioner
                    .provision(spec, instance, template.cache_generation)
                    .await
                {
                    Ok(environment) => {
                        self.events
                            .send_event(ExecutionEvent::ProvisioningCompleted {
                                job_name: job_name.clone(),
                                cache_hit: environment.from_cache,
                                duration: provision_start.elapsed(),
                            });
                        Some(environment)
                    }
                    Err(e) => {
                        // Fatal to this job only; no steps run.
                        return (
                            self.fail(template, instance, Vec::new(), start, e.to_string()),
                            report,
                        );
                    }
                }
            }
            None => None,
        };

        let activation = environment.as_ref().map(|e| e.activate());
        let base_env: HashMap<String, String> = activation
            .as_ref()
            .map(|a| a.env().clone())
            .unwrap_or_default();

        // Install the unit under test into the environment before any
        // step runs. The install command is an opaque collaborator.
        if let Some(command) = environment.as_ref().and_then(|e| e.install_command()) {
            if let Err(message) = run_install(command, &base_env, workspace).await {
                return (
                    self.fail(template, instance, Vec::new(), start, message),
                    report,
                );
            }
        }

        // Provisioning -> Running(0)
        self.events.send_event(ExecutionEvent::job_started(
            job_name.clone(),
            template.steps.len(),
        ));
        info!(job = %job_name, steps = template.steps.len(), "job started");

        let mut steps = Vec::new();
        let mut status = JobStatus::Succeeded;

        for (step_index, step) in template.steps.iter().enumerate() {
            // In-flight steps finish, but no new step starts once a
            // sibling trips fail-fast.
            if template.fail_fast && self.cancel.load(Ordering::SeqCst) {
                status = JobStatus::Canceled;
                break;
            }

            self.events.send_event(ExecutionEvent::StepStarted {
                job_name: job_name.clone(),
                step_name: step.name.clone(),
                step_index,
            });

            let result = self
                .runner
                .run(step, &base_env, workspace, &mut report)
                .await;

            self.events.send_event(ExecutionEvent::step_completed(
                job_name.clone(),
                step.name.clone(),
                step_index,
                result.exit_code,
                step.continue_on_error && !result.succeeded(),
                result.duration,
            ));

            let succeeded = result.succeeded();
            steps.push(result);

            if !succeeded {
                if step.continue_on_error {
                    // Tolerated: the job continues but is permanently
                    // degraded.
                    status = JobStatus::SucceededWithIssues;
                } else {
                    // Short-circuit: remaining steps never run and
                    // produce no results.
                    status = JobStatus::Failed;
                    break;
                }
            }
        }

        drop(activation);

        if status == JobStatus::Failed {
            return (self.fail_with_steps(template, instance, steps, start), report);
        }

        (self.terminal(instance, status, steps, start, None), report)
    }

    fn fail(
        &self,
        template: &JobTemplate,
        instance: &JobInstance,
        steps: Vec<StepResult>,
        start: Instant,
        error: String,
    ) -> JobResult {
        if template.fail_fast {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.terminal(instance, JobStatus::Failed, steps, start, Some(error))
    }

    fn fail_with_steps(
        &self,
        template: &JobTemplate,
        instance: &JobInstance,
        steps: Vec<StepResult>,
        start: Instant,
    ) -> JobResult {
        if template.fail_fast {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.terminal(instance, JobStatus::Failed, steps, start, None)
    }

    fn terminal(
        &self,
        instance: &JobInstance,
        status: JobStatus,
        steps: Vec<StepResult>,
        start: Instant,
        error: Option<String>,
    ) -> JobResult {
        let duration = start.elapsed();
        self.events.send_event(ExecutionEvent::job_completed(
            instance.name.clone(),
            status,
            duration,
        ));
        info!(job = %instance.name, status = ?status, "job finished");

        JobResult {
            instance_name: instance.name.clone(),
            selection: instance.selection.clone(),
            status,
            steps,
            duration,
            error,
        }
    }
}

/// Run the opaque install command; a non-zero exit fails the job before
/// any step runs.
async fn run_install(
    command: &str,
    env: &HashMap<String, String>,
    workspace: &Path,
) -> Result<(), String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env)
        .current_dir(workspace)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to spawn install command: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "install command failed with exit code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::template::models::{EnvironmentSpec, StepSpec};
    use crate::template::TemplateParser;
    use tempfile::tempdir;

    fn executor(dir: &Path) -> JobExecutor {
        let store = Arc::new(CacheStore::with_root(dir.join("cache")));
        let provisioner = Arc::new(EnvironmentProvisioner::new(store, dir.join("envs")));
        JobExecutor::new(provisioner, Arc::new(AtomicBool::new(false)))
    }

    fn instance() -> JobInstance {
        JobInstance::new(vec![("python".to_string(), "3.9".to_string())])
    }

    fn step(name: &str, run: &str, continue_on_error: bool) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            shell: Default::default(),
            run: run.to_string(),
            working_directory: None,
            env: HashMap::new(),
            continue_on_error,
            timeout_seconds: None,
            coverage: None,
        }
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let dir = tempdir().unwrap();
        let template = JobTemplate {
            steps: vec![step("a", "echo a", false), step("b", "echo b", false)],
            ..Default::default()
        };

        let (result, _) = executor(dir.path())
            .execute(&template, &instance(), dir.path())
            .await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert!(result.success());
        assert_eq!(result.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_tolerated_failure_runs_all_steps() {
        let dir = tempdir().unwrap();
        let template = JobTemplate {
            steps: vec![
                step("a", "echo a", false),
                step("b", "exit 1", true),
                step("c", "echo c", false),
            ],
            ..Default::default()
        };

        let (result, _) = executor(dir.path())
            .execute(&template, &instance(), dir.path())
            .await;

        assert_eq!(result.status, JobStatus::SucceededWithIssues);
        assert!(!result.success());
        assert!(result.degraded());
        assert_eq!(result.steps.len(), 3, "execution must not short-circuit");
        assert!(result.steps[2].succeeded());
    }

    #[tokio::test]
    async fn test_hard_failure_short_circuits() {
        let dir = tempdir().unwrap();
        let template = JobTemplate {
            steps: vec![
                step("a", "echo a", false),
                step("b", "exit 1", false),
                step("c", "echo c", false),
            ],
            ..Default::default()
        };

        let (result, _) = executor(dir.path())
            .execute(&template, &instance(), dir.path())
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.steps.len(), 2, "step c must not run");
        assert!(result.steps.iter().all(|s| s.step_name != "c"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_runs_no_steps() {
        let dir = tempdir().unwrap();
        let template = JobTemplate {
            environment: Some(EnvironmentSpec {
                descriptor: dir.path().join("absent.yml"),
                provision: None,
                install: None,
            }),
            steps: vec![step("a", "echo a", false)],
            ..Default::default()
        };

        let (result, _) = executor(dir.path())
            .execute(&template, &instance(), dir.path())
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.steps.is_empty());
        assert!(result.error.as_deref().unwrap().contains("descriptor"));
    }

    #[tokio::test]
    async fn test_install_failure_runs_no_steps() {
        let dir = tempdir().unwrap();
        let descriptor = dir.path().join("environment.yml");
        std::fs::write(&descriptor, b"deps").unwrap();

        let template = JobTemplate {
            environment: Some(EnvironmentSpec {
                descriptor,
                provision: None,
                install: Some("exit 3".to_string()),
            }),
            steps: vec![step("a", "echo a", false)],
            ..Default::default()
        };

        let (result, _) = executor(dir.path())
            .execute(&template, &instance(), dir.path())
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.steps.is_empty());
        assert!(result.error.as_deref().unwrap().contains("install"));
    }

    #[tokio::test]
    async fn test_failing_job_sets_fail_fast_flag() {
        let dir = tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = Arc::new(EnvironmentProvisioner::new(store, dir.path().join("envs")));
        let executor = JobExecutor::new(provisioner, cancel.clone());

        let template = TemplateParser::from_str(
            r#"
failFast: true
steps:
  - name: broken
    run: exit 1
"#,
        )
        .unwrap();

        executor.execute(&template, &instance(), dir.path()).await;
        assert!(cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_canceled_before_start() {
        let dir = tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let store = Arc::new(CacheStore::with_root(dir.path().join("cache")));
        let provisioner = Arc::new(EnvironmentProvisioner::new(store, dir.path().join("envs")));
        let executor = JobExecutor::new(provisioner, cancel);

        let template = TemplateParser::from_str(
            r#"
failFast: true
steps:
  - name: never
    run: echo never
"#,
        )
        .unwrap();

        let (result, _) = executor.execute(&template, &instance(), dir.path()).await;
        assert_eq!(result.status, JobStatus::Canceled);
        assert!(result.steps.is_empty());
    }
}
