use crate::store::{BatchUpdate, ScanStore};
use crate::{Batch, Status};
use anyhow::{anyhow, ensure, Error};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Terminal result of a single job, as seen by its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batch: Batch,
    /// Set only for the call that moved the batch into a terminal status.
    pub became_terminal: bool,
}

/// Status a batch should hold for the given counters.
pub fn resolve_status(total: i64, completed: i64, failed: i64) -> Status {
    let resolved = completed + failed;
    if resolved == 0 {
        Status::Pending
    } else if resolved >= total {
        if failed >= total {
            Status::Failed
        } else {
            Status::Completed
        }
    } else {
        Status::Processing
    }
}

/// Rolls job outcomes into batch counters.
///
/// Writers of the same batch are serialized through a per-batch async lock and
/// each outcome is one increment, so concurrent completions never lose
/// updates. Terminal batches are left untouched.
///
/// Once a batch has been reconciled its counters are recounted from the scans
/// on every later outcome instead of incremented, so outcomes already visible
/// in the scans are never counted twice.
pub struct BatchTracker {
    store: Arc<dyn ScanStore>,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    recounted: Mutex<HashSet<Uuid>>,
}

impl BatchTracker {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        BatchTracker {
            store,
            locks: Mutex::new(HashMap::new()),
            recounted: Mutex::new(HashSet::new()),
        }
    }

    fn lock_for(&self, batch_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(batch_id).or_default().clone()
    }

    /// Drops the bookkeeping of a batch that reached a terminal status.
    fn forget(&self, batch_id: Uuid) {
        self.locks.lock().remove(&batch_id);
        self.recounted.lock().remove(&batch_id);
    }

    /// Number of batches with live bookkeeping.
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }

    async fn load(&self, batch_id: Uuid) -> Result<Batch, Error> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| anyhow!("batch {} not found", batch_id))
    }

    async fn write(&self, batch: &Batch) -> Result<(), Error> {
        self.store
            .update_batch(
                batch.id,
                BatchUpdate {
                    completed_urls: batch.completed_urls,
                    failed_urls: batch.failed_urls,
                    status: batch.status,
                    completed_at: batch.completed_at,
                },
            )
            .await
    }

    fn finished(&self, batch: &Batch) {
        info!(
            batch_id = %batch.id,
            status = ?batch.status,
            completed = batch.completed_urls,
            failed = batch.failed_urls,
            "Batch finished"
        );
        self.forget(batch.id);
    }

    /// Moves a pending batch to processing once its first job starts.
    pub async fn mark_started(&self, batch_id: Uuid) -> Result<bool, Error> {
        let lock = self.lock_for(batch_id);
        let _guard = lock.lock().await;

        let mut batch = self.load(batch_id).await?;
        if batch.status != Status::Pending {
            return Ok(false);
        }

        batch.status = Status::Processing;
        self.write(&batch).await?;
        debug!(batch_id = %batch_id, "Batch processing");
        Ok(true)
    }

    pub async fn record_outcome(
        &self,
        batch_id: Uuid,
        outcome: Outcome,
    ) -> Result<BatchProgress, Error> {
        let lock = self.lock_for(batch_id);
        let _guard = lock.lock().await;

        let mut batch = self.load(batch_id).await?;
        if batch.status.is_terminal() {
            debug!(batch_id = %batch_id, status = ?batch.status, "Ignoring outcome for finished batch");
            self.forget(batch_id);
            return Ok(BatchProgress {
                batch,
                became_terminal: false,
            });
        }

        if self.recounted.lock().contains(&batch_id) {
            return self.recount(batch).await;
        }

        match outcome {
            Outcome::Completed => batch.completed_urls += 1,
            Outcome::Failed => batch.failed_urls += 1,
        }
        ensure!(
            batch.resolved() <= batch.total_urls,
            "batch {} resolved {} of {} urls",
            batch_id,
            batch.resolved(),
            batch.total_urls
        );

        // A recorded outcome means at least one job ran, so never back to pending.
        batch.status = match resolve_status(batch.total_urls, batch.completed_urls, batch.failed_urls) {
            Status::Pending => Status::Processing,
            status => status,
        };
        let became_terminal = batch.status.is_terminal();
        if became_terminal {
            batch.completed_at = Some(Utc::now());
        }

        self.write(&batch).await?;
        if became_terminal {
            self.finished(&batch);
        }

        Ok(BatchProgress {
            batch,
            became_terminal,
        })
    }

    /// Recomputes a batch's counters from its scans and writes them back.
    ///
    /// Later outcomes of the batch are recounted the same way.
    pub async fn reconcile(&self, batch_id: Uuid) -> Result<BatchProgress, Error> {
        let lock = self.lock_for(batch_id);
        let _guard = lock.lock().await;

        let batch = self.load(batch_id).await?;
        if batch.status.is_terminal() {
            self.forget(batch_id);
            return Ok(BatchProgress {
                batch,
                became_terminal: false,
            });
        }

        self.recounted.lock().insert(batch_id);
        self.recount(batch).await
    }

    /// Caller holds the batch lock.
    async fn recount(&self, mut batch: Batch) -> Result<BatchProgress, Error> {
        let scans = self.store.batch_scans(batch.id).await?;

        batch.completed_urls = scans
            .iter()
            .filter(|scan| scan.status == Status::Completed)
            .count() as i64;
        batch.failed_urls = scans
            .iter()
            .filter(|scan| scan.status == Status::Failed)
            .count() as i64;

        let in_flight = scans.iter().any(|scan| scan.status == Status::Processing);
        batch.status = match resolve_status(batch.total_urls, batch.completed_urls, batch.failed_urls) {
            Status::Pending if in_flight => Status::Processing,
            status => status,
        };
        let became_terminal = batch.status.is_terminal();
        if became_terminal && batch.completed_at.is_none() {
            batch.completed_at = Some(Utc::now());
        }

        self.write(&batch).await?;
        if became_terminal {
            self.finished(&batch);
        }

        Ok(BatchProgress {
            batch,
            became_terminal,
        })
    }
}
