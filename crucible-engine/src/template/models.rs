// Job Template Data Models
// Types representing the declarative pipeline template document

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::runners::Shell;

/// A named matrix dimension with an ordered list of discrete values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixAxis {
    /// Axis name (e.g. "platform", "python")
    pub name: String,
    /// Ordered candidate values; must be non-empty
    pub values: Vec<String>,
}

/// Coverage artifact declaration for a test-stage step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoverageArtifact {
    /// Path of the report file the step produces, relative to the job workspace
    pub file: String,
    /// Merge into the job's accumulated report instead of replacing it
    #[serde(default)]
    pub append: bool,
}

/// One step in a job's ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step name, unique within the template
    pub name: String,

    /// Shell used to run the command body
    #[serde(default)]
    pub shell: Shell,

    /// Multi-line command body
    pub run: String,

    /// Working directory override, resolved against the job workspace
    pub working_directory: Option<String>,

    /// Environment variable overrides, applied for this invocation only
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Tolerate a non-zero exit without halting the job
    #[serde(default)]
    pub continue_on_error: bool,

    /// Wall-clock limit in seconds; the process is killed on expiry
    pub timeout_seconds: Option<u64>,

    /// Coverage report file this step produces, if any
    pub coverage: Option<CoverageArtifact>,
}

impl StepSpec {
    /// Step timeout as a Duration, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Environment block: how a job's execution environment is materialized.
/// The provisioning and install commands are opaque external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Dependency manifest; its content hash participates in the cache key
    pub descriptor: PathBuf,

    /// Command that builds the environment on a cache miss
    pub provision: Option<String>,

    /// Command that installs the unit under test into the environment
    pub install: Option<String>,
}

/// Coverage sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    /// Remote upload endpoint; mutually exclusive with `directory`
    pub endpoint: Option<String>,

    /// Local directory sink; mutually exclusive with `endpoint`
    pub directory: Option<PathBuf>,

    /// Upload credential
    pub token: Option<String>,

    /// Report label ("flags"/"name" in the sink's terms)
    pub name: Option<String>,

    /// Treat an upload failure as a pipeline failure
    #[serde(default)]
    pub fail_ci_if_error: bool,
}

/// Root template document: matrix axes, ordered steps, and pipeline policy.
/// Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    /// Pipeline name
    pub name: Option<String>,

    /// Platform label used when no "platform" axis is declared
    pub platform: Option<String>,

    /// Matrix axes, expanded combinatorially into job instances
    #[serde(default, deserialize_with = "deserialize_axes")]
    pub axes: Vec<MatrixAxis>,

    /// Ordered steps every job instance runs
    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// Stop starting new work once any job fails
    #[serde(default)]
    pub fail_fast: bool,

    /// Explicit cache-busting counter for provisioning artifacts
    #[serde(default)]
    pub cache_generation: u32,

    /// Maximum job instances running concurrently (None = unlimited)
    pub max_parallel: Option<usize>,

    /// Execution environment block
    pub environment: Option<EnvironmentSpec>,

    /// Coverage sink for the merged report
    pub coverage_sink: Option<SinkConfig>,
}

impl JobTemplate {
    /// Pipeline name, or a placeholder for unnamed templates.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// Custom deserializer for axes supporting both list and map forms:
///
/// ```yaml
/// axes:
///   - name: python
///     values: ["3.9", "3.10"]
/// ```
///
/// ```yaml
/// axes:
///   python: ["3.9", "3.10"]
/// ```
///
/// Map form preserves document order.
fn deserialize_axes<'de, D>(deserializer: D) -> Result<Vec<MatrixAxis>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{MapAccess, SeqAccess, Visitor};

    struct AxesVisitor;

    impl<'de> Visitor<'de> for AxesVisitor {
        type Value = Vec<MatrixAxis>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of axis names to value lists or a list of axis definitions")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut axes = Vec::new();
            while let Some(axis) = seq.next_element::<MatrixAxis>()? {
                axes.push(axis);
            }
            Ok(axes)
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut axes = Vec::new();
            while let Some((name, values)) = map.next_entry::<String, Vec<String>>()? {
                axes.push(MatrixAxis { name, values });
            }
            Ok(axes)
        }
    }

    deserializer.deserialize_any(AxesVisitor)
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a single executed step. Immutable once produced.
/// Steps skipped by a short-circuit produce no result at all.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_name: String,
    /// Exit status; None when the process could not be spawned or was killed
    pub exit_code: Option<i32>,
    /// Whether a failure here was tolerated via continue-on-error
    pub allowed_failure: bool,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl StepResult {
    /// Whether the step exited cleanly.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Terminal state of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    /// Only tolerated failures occurred; the job ran to completion degraded
    SucceededWithIssues,
    Failed,
    /// Abandoned by fail-fast before completing
    Canceled,
}

/// Aggregated outcome of one job instance, emitted exactly once.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Instance display name (matrix values joined)
    pub instance_name: String,
    /// Axis assignment that produced this instance, in declaration order
    pub selection: Vec<(String, String)>,
    pub status: JobStatus,
    /// Results of the steps that actually ran, in order
    pub steps: Vec<StepResult>,
    pub duration: Duration,
    /// Provisioning or install failure detail, when the job never ran steps
    pub error: Option<String>,
}

impl JobResult {
    /// Strict success: every step exited cleanly.
    pub fn success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Degraded: only tolerated failures occurred.
    pub fn degraded(&self) -> bool {
        self.status == JobStatus::SucceededWithIssues
    }
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub pipeline_name: String,
    /// Per-instance results in expansion order
    pub jobs: Vec<JobResult>,
    pub duration: Duration,
    /// Upload failure detail when the sink rejected the merged report
    pub upload_error: Option<String>,
    /// Aggregate status: no failed or canceled jobs, and the upload
    /// succeeded if it was configured as pipeline-fatal
    pub success: bool,
}

impl PipelineResult {
    /// Number of jobs that fully succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.success()).count()
    }

    /// Number of jobs that failed outright.
    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count()
    }
}
