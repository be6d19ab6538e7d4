// Step Runner
// Executes one template step under its declared shell

use crate::coverage::CoverageReport;
use crate::template::models::{StepResult, StepSpec};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Shells a step can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    #[default]
    Default,
    /// Bash shell
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (falls back to pwsh off Windows)
    Powershell,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::Powershell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
        }
    }

    /// Locate the shell binary on PATH.
    fn resolve(&self) -> Result<PathBuf, which::Error> {
        which::which(self.get_command().0)
    }
}

/// Executes steps within an activated environment. Never raises past its
/// own boundary: spawn failures, timeouts, and non-zero exits are all
/// captured into the StepResult.
pub struct StepRunner;

impl StepRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run one step. Environment-variable and working-directory overrides
    /// apply to this invocation only; nothing leaks to sibling steps. If
    /// the step declares a coverage artifact, the produced file is folded
    /// into the job's accumulated report after execution.
    pub async fn run(
        &self,
        spec: &StepSpec,
        base_env: &HashMap<String, String>,
        workspace: &Path,
        report: &mut CoverageReport,
    ) -> StepResult {
        let start = Instant::now();

        let (shell_cmd, shell_args) = spec.shell.get_command();
        if let Err(e) = spec.shell.resolve() {
            return self.failure(spec, start, format!("shell '{}' not found: {}", shell_cmd, e));
        }

        let work_dir = match &spec.working_directory {
            Some(dir) => {
                let path = Path::new(dir);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    workspace.join(path)
                }
            }
            None => workspace.to_path_buf(),
        };

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&spec.run);
        cmd.current_dir(&work_dir);
        cmd.envs(base_env);
        cmd.envs(&spec.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Spawn the process
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.failure(
                    spec,
                    start,
                    format!("failed to spawn shell process '{}': {}", shell_cmd, e),
                );
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Read output streams concurrently
        let stdout_handle = tokio::spawn(collect_lines(BufReader::new(stdout)));
        let stderr_handle = tokio::spawn(collect_lines(BufReader::new(stderr)));

        // Wait for completion with optional timeout
        let wait_result = if let Some(timeout) = spec.timeout() {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    return StepResult {
                        step_name: spec.name.clone(),
                        exit_code: None,
                        allowed_failure: spec.continue_on_error,
                        duration: start.elapsed(),
                        stdout: stdout_handle.await.unwrap_or_default(),
                        stderr: format!("step timed out after {:?}", timeout),
                    };
                }
            }
        } else {
            child.wait().await
        };

        let exit_code = wait_result.ok().and_then(|s| s.code());
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        self.collect_coverage(spec, &work_dir, report);

        StepResult {
            step_name: spec.name.clone(),
            exit_code,
            allowed_failure: spec.continue_on_error,
            duration: start.elapsed(),
            stdout,
            stderr,
        }
    }

    /// Fold a declared coverage artifact into the job's report:
    /// append-style steps merge, the rest replace.
    fn collect_coverage(&self, spec: &StepSpec, work_dir: &Path, report: &mut CoverageReport) {
        let Some(artifact) = &spec.coverage else {
            return;
        };

        let path = {
            let declared = Path::new(&artifact.file);
            if declared.is_absolute() {
                declared.to_path_buf()
            } else {
                work_dir.join(declared)
            }
        };

        match std::fs::read(&path) {
            Ok(data) => {
                if artifact.append {
                    report.append(&spec.name, data);
                } else {
                    report.replace(&spec.name, data);
                }
            }
            Err(e) => {
                // A failed test stage may legitimately leave no artifact.
                debug!(step = %spec.name, path = %path.display(), "no coverage artifact: {}", e);
            }
        }
    }

    fn failure(&self, spec: &StepSpec, start: Instant, message: String) -> StepResult {
        StepResult {
            step_name: spec.name.clone(),
            exit_code: None,
            allowed_failure: spec.continue_on_error,
            duration: start.elapsed(),
            stdout: String::new(),
            stderr: message,
        }
    }
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain an output stream into a newline-joined string.
async fn collect_lines<R>(reader: BufReader<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn step(name: &str, run: &str) -> StepSpec {
        StepSpec {
            name: name.to_string(),
            shell: Shell::Default,
            run: run.to_string(),
            working_directory: None,
            env: HashMap::new(),
            continue_on_error: false,
            timeout_seconds: None,
            coverage: None,
        }
    }

    #[tokio::test]
    async fn test_run_echo() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let result = runner
            .run(&step("unit", "echo hello"), &HashMap::new(), dir.path(), &mut report)
            .await;

        assert_eq!(result.exit_code, Some(0));
        assert!(result.succeeded());
        assert!(result.stdout.contains("hello"));
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let result = runner
            .run(&step("unit", "exit 42"), &HashMap::new(), dir.path(), &mut report)
            .await;

        assert_eq!(result.exit_code, Some(42));
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_env_override_scoped_to_step() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut base = HashMap::new();
        base.insert("WORKERS".to_string(), "8".to_string());

        let mut serial = step("serial", "echo workers=$WORKERS");
        serial.env.insert("WORKERS".to_string(), "1".to_string());

        let result = runner.run(&serial, &base, dir.path(), &mut report).await;
        assert!(result.stdout.contains("workers=1"));

        // The override did not touch the base environment.
        let sibling = step("main", "echo workers=$WORKERS");
        let result = runner.run(&sibling, &base, dir.path(), &mut report).await;
        assert!(result.stdout.contains("workers=8"));
    }

    #[tokio::test]
    async fn test_working_directory_override() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut spec = step("pwd", "pwd");
        spec.working_directory = Some("sub".to_string());

        let result = runner
            .run(&spec, &HashMap::new(), dir.path(), &mut report)
            .await;
        assert!(result.stdout.trim_end().ends_with("sub"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut spec = step("slow", "sleep 30");
        spec.timeout_seconds = Some(1);

        let result = runner
            .run(&spec, &HashMap::new(), dir.path(), &mut report)
            .await;
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_coverage_append() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut main = step("main", "printf main-cov > cov.out");
        main.coverage = Some(crate::template::models::CoverageArtifact {
            file: "cov.out".to_string(),
            append: false,
        });
        runner
            .run(&main, &HashMap::new(), dir.path(), &mut report)
            .await;

        let mut slow = step("slow", "printf slow-cov > cov.out");
        slow.coverage = Some(crate::template::models::CoverageArtifact {
            file: "cov.out".to_string(),
            append: true,
        });
        runner
            .run(&slow, &HashMap::new(), dir.path(), &mut report)
            .await;

        assert_eq!(report.chunks().len(), 2);
        assert_eq!(report.chunks()[0].data, b"main-cov");
        assert_eq!(report.chunks()[1].data, b"slow-cov");
    }

    #[tokio::test]
    async fn test_coverage_replace() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();
        report.append("stale", b"old".to_vec());

        let mut main = step("main", "printf fresh > cov.out");
        main.coverage = Some(crate::template::models::CoverageArtifact {
            file: "cov.out".to_string(),
            append: false,
        });
        runner
            .run(&main, &HashMap::new(), dir.path(), &mut report)
            .await;

        assert_eq!(report.chunks().len(), 1);
        assert_eq!(report.chunks()[0].data, b"fresh");
    }

    #[tokio::test]
    async fn test_missing_coverage_artifact_ignored() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut spec = step("main", "exit 1");
        spec.coverage = Some(crate::template::models::CoverageArtifact {
            file: "never-written.out".to_string(),
            append: true,
        });
        let result = runner
            .run(&spec, &HashMap::new(), dir.path(), &mut report)
            .await;

        assert!(!result.succeeded());
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_bash_shell() {
        let dir = tempdir().unwrap();
        let runner = StepRunner::new();
        let mut report = CoverageReport::new();

        let mut spec = step("bash", "echo $0");
        spec.shell = Shell::Bash;
        let result = runner
            .run(&spec, &HashMap::new(), dir.path(), &mut report)
            .await;

        // Tolerate hosts without bash; the runner reports it in-band.
        if result.exit_code == Some(0) {
            assert!(result.stdout.contains("bash"));
        } else {
            assert!(result.stderr.contains("bash"));
        }
    }
}
