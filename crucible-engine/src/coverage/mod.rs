// Coverage Module
// Per-job report accumulation and cross-job aggregation

pub mod sink;

// Re-export key types
pub use sink::{CoverageSink, FsSink, HttpSink, UploadError};

use serde_json::json;
use std::collections::BTreeMap;

/// An opaque coverage artifact accumulated by one job. Test stages
/// contribute sections with append semantics; a non-append stage starts
/// the report over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    chunks: Vec<CoverageChunk>,
}

/// One stage's contribution to a job's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageChunk {
    /// Step that produced the data
    pub step: String,
    /// Raw report bytes, opaque to the engine
    pub data: Vec<u8>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[CoverageChunk] {
        &self.chunks
    }

    /// Merge a stage's report into the accumulated artifact.
    pub fn append(&mut self, step: impl Into<String>, data: Vec<u8>) {
        self.chunks.push(CoverageChunk {
            step: step.into(),
            data,
        });
    }

    /// Replace the accumulated artifact with a stage's report.
    pub fn replace(&mut self, step: impl Into<String>, data: Vec<u8>) {
        self.chunks.clear();
        self.append(step, data);
    }
}

/// Merged report across all jobs in a pipeline run, keyed by job so
/// there is no cross-job interference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedReport {
    jobs: BTreeMap<String, CoverageReport>,
}

impl MergedReport {
    /// Number of jobs that contributed a report.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = (&String, &CoverageReport)> {
        self.jobs.iter()
    }

    /// Serialize the merged report into the sink payload format.
    pub fn to_payload(&self, name: Option<&str>) -> serde_json::Value {
        json!({
            "name": name,
            "jobs": self
                .jobs
                .iter()
                .map(|(job, report)| {
                    json!({
                        "job": job,
                        "chunks": report
                            .chunks()
                            .iter()
                            .map(|chunk| {
                                json!({
                                    "step": chunk.step,
                                    "data": hex::encode(&chunk.data),
                                })
                            })
                            .collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

/// Collects finalized per-job reports and merges them once all jobs
/// reach a terminal state. Merge is keyed by job, so it is associative
/// and commutative across job-completion order, and recording the same
/// report twice is a no-op.
#[derive(Debug, Default)]
pub struct CoverageAggregator {
    reports: BTreeMap<String, CoverageReport>,
}

impl CoverageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job's finalized report. Empty reports are kept out of the
    /// merge; re-recording an identical report changes nothing.
    pub fn record(&mut self, job: impl Into<String>, report: CoverageReport) {
        if report.is_empty() {
            return;
        }
        self.reports.entry(job.into()).or_insert(report);
    }

    /// Merge all recorded reports. Called once per pipeline run after
    /// every job is terminal.
    pub fn finalize(self) -> MergedReport {
        MergedReport { jobs: self.reports }
    }
}
