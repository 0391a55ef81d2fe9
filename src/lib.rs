use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod batch;
pub mod db;
pub mod executor;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use server::{AdmissionError, QueueConfig, QueueStats, ScanQueue};

/// Retry budget applied to every job unless the policy says otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Admission payload: one URL bound to an already persisted scan record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub scan_id: Uuid,
    pub url: String,
    pub user_id: String,
    pub batch_id: Option<Uuid>,
}

impl JobRequest {
    pub fn for_scan(scan: &Scan) -> Self {
        JobRequest {
            scan_id: scan.id,
            url: scan.url.clone(),
            user_id: scan.user_id.clone(),
            batch_id: scan.batch_id,
        }
    }
}

/// A queued unit of work. Only the worker holding it mutates it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub url: String,
    pub user_id: String,
    pub batch_id: Option<Uuid>,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: JobRequest, max_retries: u32) -> Self {
        Job {
            id: Uuid::new_v4(),
            scan_id: request.scan_id,
            url: request.url,
            user_id: request.user_id,
            batch_id: request.batch_id,
            retries: 0,
            max_retries,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle status shared by scans and batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scan_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// Externally owned record of a single URL test.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Scan {
    pub id: Uuid,
    pub url: String,
    pub user_id: String,
    pub batch_id: Option<Uuid>,
    pub status: Status,
    pub results: Option<serde_json::Value>,
    pub issues_found: i64,
    pub error: Option<String>,
}

impl Scan {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>, batch_id: Option<Uuid>) -> Self {
        Scan {
            id: Uuid::new_v4(),
            url: url.into(),
            user_id: user_id.into(),
            batch_id,
            status: Status::Pending,
            results: None,
            issues_found: 0,
            error: None,
        }
    }
}

/// Externally owned aggregate over the scans submitted together.
///
/// `completed_urls + failed_urls` never exceeds `total_urls`, and reaches it
/// exactly when `status` becomes terminal.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Batch {
    pub id: Uuid,
    pub user_id: String,
    pub total_urls: i64,
    pub completed_urls: i64,
    pub failed_urls: i64,
    pub status: Status,
    pub completed_at: Option<DateTime<Utc>>,
    pub notified: bool,
}

impl Batch {
    pub fn new(user_id: impl Into<String>, total_urls: i64) -> Self {
        Batch {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            total_urls,
            completed_urls: 0,
            failed_urls: 0,
            status: Status::Pending,
            completed_at: None,
            notified: false,
        }
    }

    pub fn resolved(&self) -> i64 {
        self.completed_urls + self.failed_urls
    }
}
