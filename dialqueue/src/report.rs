//! Delivery of final call results to the downstream backend.
//!
//! Reporting is strictly best-effort: the job's own record always carries
//! the result, so callers log reporter failures and move on rather than
//! failing the job.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::env_or;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("report endpoint returned {status}")]
    Api { status: u16 },
}

/// Push-delivery of one finished call's result bag.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report(&self, result: &Value) -> Result<(), ReportError>;
}

/// Connection settings for the results endpoint.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub results_url: String,
    pub timeout: std::time::Duration,
}

impl ReporterConfig {
    pub fn from_env() -> Self {
        Self {
            results_url: env_or(
                "RESULTS_WEBHOOK_URL",
                "http://localhost:8000/api/calls/results",
            ),
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// [`ResultReporter`] implementation posting to a REST endpoint.
///
/// The endpoint ingests batches, so the single result is wrapped in an
/// array. Delivery is idempotent downstream; repeats after a partial
/// failure are safe.
#[derive(Debug, Clone)]
pub struct HttpResultReporter {
    config: ReporterConfig,
    client: reqwest::Client,
}

impl HttpResultReporter {
    pub fn new(config: ReporterConfig) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ResultReporter for HttpResultReporter {
    async fn report(&self, result: &Value) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.config.results_url)
            .json(&[result])
            .send()
            .await?;
        if response.status().is_success() {
            tracing::debug!("Delivered call result");
            Ok(())
        } else {
            Err(ReportError::Api {
                status: response.status().as_u16(),
            })
        }
    }
}
