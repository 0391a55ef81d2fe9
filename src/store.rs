use crate::executor::ScanReport;
use crate::{Batch, Scan, Status};
use anyhow::{anyhow, ensure, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Field changes written to a scan as a job moves through the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanUpdate {
    pub status: Status,
    pub results: Option<serde_json::Value>,
    pub issues_found: Option<i64>,
    pub error: Option<String>,
}

impl ScanUpdate {
    pub fn processing() -> Self {
        ScanUpdate {
            status: Status::Processing,
            results: None,
            issues_found: None,
            error: None,
        }
    }

    pub fn completed(report: &ScanReport) -> Result<Self, Error> {
        Ok(ScanUpdate {
            status: Status::Completed,
            results: Some(serde_json::to_value(&report.violations)?),
            issues_found: Some(report.issues_found()),
            error: None,
        })
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ScanUpdate {
            status: Status::Failed,
            results: None,
            issues_found: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchUpdate {
    pub completed_urls: i64,
    pub failed_urls: i64,
    pub status: Status,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistence collaborator owning scan and batch records.
///
/// Each call is expected to be atomic for the record it touches; nothing here
/// spans records.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn update_scan(&self, id: Uuid, update: ScanUpdate) -> Result<(), Error>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, Error>;

    async fn batch_scans(&self, batch_id: Uuid) -> Result<Vec<Scan>, Error>;

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> Result<(), Error>;

    /// Sets the batch's `notified` flag, returning false if it was already set.
    async fn mark_batch_notified(&self, id: Uuid) -> Result<bool, Error>;
}

/// Process-local store, used by tests and by runs without a database.
#[derive(Default)]
pub struct MemoryStore {
    scans: Mutex<HashMap<Uuid, Scan>>,
    batches: Mutex<HashMap<Uuid, Batch>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn insert_scan(&self, scan: Scan) {
        self.scans.lock().insert(scan.id, scan);
    }

    pub fn insert_batch(&self, batch: Batch) {
        self.batches.lock().insert(batch.id, batch);
    }

    /// Creates a pending batch with one pending scan per URL.
    pub fn create_batch(
        &self,
        user_id: &str,
        urls: &[String],
    ) -> Result<(Batch, Vec<Scan>), Error> {
        ensure!(!urls.is_empty(), "a batch needs at least one url");
        let batch = Batch::new(user_id, urls.len() as i64);
        let scans: Vec<_> = urls
            .iter()
            .map(|url| Scan::new(url.as_str(), user_id, Some(batch.id)))
            .collect();

        self.insert_batch(batch.clone());
        for scan in &scans {
            self.insert_scan(scan.clone());
        }
        Ok((batch, scans))
    }

    pub fn scan(&self, id: Uuid) -> Option<Scan> {
        self.scans.lock().get(&id).cloned()
    }

    pub fn batch(&self, id: Uuid) -> Option<Batch> {
        self.batches.lock().get(&id).cloned()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn update_scan(&self, id: Uuid, update: ScanUpdate) -> Result<(), Error> {
        let mut scans = self.scans.lock();
        let scan = scans
            .get_mut(&id)
            .ok_or_else(|| anyhow!("scan {} not found", id))?;

        scan.status = update.status;
        if let Some(results) = update.results {
            scan.results = Some(results);
        }
        if let Some(issues_found) = update.issues_found {
            scan.issues_found = issues_found;
        }
        scan.error = update.error;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, Error> {
        Ok(self.batch(id))
    }

    async fn batch_scans(&self, batch_id: Uuid) -> Result<Vec<Scan>, Error> {
        Ok(self
            .scans
            .lock()
            .values()
            .filter(|scan| scan.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> Result<(), Error> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| anyhow!("batch {} not found", id))?;

        batch.completed_urls = update.completed_urls;
        batch.failed_urls = update.failed_urls;
        batch.status = update.status;
        if batch.completed_at.is_none() {
            batch.completed_at = update.completed_at;
        }
        Ok(())
    }

    async fn mark_batch_notified(&self, id: Uuid) -> Result<bool, Error> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| anyhow!("batch {} not found", id))?;

        Ok(!std::mem::replace(&mut batch.notified, true))
    }
}
