// Coverage Sinks
// Upload targets for the merged report: local directory or remote endpoint

use crate::coverage::MergedReport;
use crate::template::models::SinkConfig;

use std::io;
use thiserror::Error;

/// Errors from the upload sink. Whether these fail the pipeline is
/// decided by the sink config's `fail_ci_if_error` flag.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("coverage sink rejected payload with status {0}")]
    Rejected(u16),

    #[error("failed to reach coverage sink: {0}")]
    Transport(String),

    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode report payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("coverage sink declares neither an endpoint nor a directory")]
    NotConfigured,
}

/// An upload target for the merged coverage report.
#[async_trait::async_trait]
pub trait CoverageSink: Send + Sync {
    async fn upload(&self, report: &MergedReport, config: &SinkConfig) -> Result<(), UploadError>;
}

/// Writes the report payload into a local directory. Used for local runs
/// and as the test double for the remote service.
pub struct FsSink;

#[async_trait::async_trait]
impl CoverageSink for FsSink {
    async fn upload(&self, report: &MergedReport, config: &SinkConfig) -> Result<(), UploadError> {
        let dir = config.directory.as_ref().ok_or(UploadError::NotConfigured)?;
        std::fs::create_dir_all(dir)?;

        let file = format!("{}.json", config.name.as_deref().unwrap_or("coverage"));
        let payload = serde_json::to_vec_pretty(&report.to_payload(config.name.as_deref()))?;
        std::fs::write(dir.join(file), payload)?;
        Ok(())
    }
}

/// Posts the report payload to a remote endpoint with an optional bearer
/// token. The service behind the endpoint is an opaque collaborator.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CoverageSink for HttpSink {
    async fn upload(&self, report: &MergedReport, config: &SinkConfig) -> Result<(), UploadError> {
        let endpoint = config.endpoint.as_ref().ok_or(UploadError::NotConfigured)?;

        let mut request = self
            .client
            .post(endpoint)
            .json(&report.to_payload(config.name.as_deref()));
        if let Some(token) = &config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Build the sink matching a config: endpoint wins over directory.
pub fn sink_for(config: &SinkConfig) -> Result<Box<dyn CoverageSink>, UploadError> {
    if config.endpoint.is_some() {
        Ok(Box::new(HttpSink::new()))
    } else if config.directory.is_some() {
        Ok(Box::new(FsSink))
    } else {
        Err(UploadError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageAggregator, CoverageReport};
    use tempfile::tempdir;

    fn merged() -> MergedReport {
        let mut report = CoverageReport::new();
        report.append("main", b"data".to_vec());
        let mut aggregator = CoverageAggregator::new();
        aggregator.record("linux-3.9", report);
        aggregator.finalize()
    }

    #[tokio::test]
    async fn test_fs_sink_writes_payload() {
        let dir = tempdir().unwrap();
        let config = SinkConfig {
            endpoint: None,
            directory: Some(dir.path().to_path_buf()),
            token: None,
            name: Some("suite".to_string()),
            fail_ci_if_error: false,
        };

        FsSink.upload(&merged(), &config).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("suite.json")).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(payload["jobs"][0]["job"], "linux-3.9");
    }

    #[tokio::test]
    async fn test_fs_sink_requires_directory() {
        let config = SinkConfig {
            endpoint: None,
            directory: None,
            token: None,
            name: None,
            fail_ci_if_error: false,
        };

        let err = FsSink.upload(&merged(), &config).await.unwrap_err();
        assert!(matches!(err, UploadError::NotConfigured));
    }

    #[test]
    fn test_sink_selection() {
        let http = SinkConfig {
            endpoint: Some("https://cov.example".to_string()),
            directory: Some("/tmp".into()),
            token: None,
            name: None,
            fail_ci_if_error: false,
        };
        assert!(sink_for(&http).is_ok());

        let none = SinkConfig {
            endpoint: None,
            directory: None,
            token: None,
            name: None,
            fail_ci_if_error: false,
        };
        assert!(matches!(sink_for(&none), Err(UploadError::NotConfigured)));
    }
}
