use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single accessibility rule violation reported by the scan engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub impact: Option<String>,
    pub description: String,
    pub help: String,
    pub help_url: String,
    #[serde(default)]
    pub nodes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub violations: Vec<Violation>,
}

impl ScanReport {
    pub fn issues_found(&self) -> i64 {
        self.violations.len() as i64
    }
}

/// Performs the actual test of a URL.
///
/// Any error is treated as a retryable failure by the worker pool.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    async fn perform_scan(&self, url: &str) -> Result<ScanReport, Error>;
}

/// Bounds every scan of the wrapped executor in wall-clock time.
pub struct TimeoutExecutor<E> {
    inner: E,
    timeout: Duration,
}

impl<E> TimeoutExecutor<E> {
    pub fn new(inner: E, timeout: Duration) -> Self {
        TimeoutExecutor { inner, timeout }
    }
}

#[async_trait]
impl<E: ScanExecutor> ScanExecutor for TimeoutExecutor<E> {
    async fn perform_scan(&self, url: &str) -> Result<ScanReport, Error> {
        tokio::time::timeout(self.timeout, self.inner.perform_scan(url))
            .await
            .map_err(|_| anyhow!("scan of {} timed out after {:?}", url, self.timeout))?
    }
}
