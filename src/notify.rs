use crate::store::ScanStore;
use crate::{Batch, Scan, Status};
use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOP_URLS: usize = 5;

/// Outbound delivery of batch summaries (e.g. email).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, summary: &BatchSummary) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlIssues {
    pub url: String,
    pub issues_found: i64,
}

/// Completion summary of a finished batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: Status,
    pub total_urls: i64,
    pub completed_urls: i64,
    pub failed_urls: i64,
    pub total_issues: i64,
    /// Mean issues per successfully scanned URL, rounded.
    pub average_issues: i64,
    pub top_urls: Vec<UrlIssues>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchSummary {
    pub fn new(batch: &Batch, scans: &[Scan]) -> Self {
        let mut completed: Vec<_> = scans
            .iter()
            .filter(|scan| scan.status == Status::Completed)
            .collect();

        let total_issues: i64 = completed.iter().map(|scan| scan.issues_found).sum();
        let average_issues = if completed.is_empty() {
            0
        } else {
            (total_issues as f64 / completed.len() as f64).round() as i64
        };

        completed.sort_by(|a, b| {
            b.issues_found
                .cmp(&a.issues_found)
                .then_with(|| a.url.cmp(&b.url))
        });
        let top_urls = completed
            .into_iter()
            .take(TOP_URLS)
            .map(|scan| UrlIssues {
                url: scan.url.clone(),
                issues_found: scan.issues_found,
            })
            .collect();

        BatchSummary {
            batch_id: batch.id,
            status: batch.status,
            total_urls: batch.total_urls,
            completed_urls: batch.completed_urls,
            failed_urls: batch.failed_urls,
            total_issues,
            average_issues,
            top_urls,
            completed_at: batch.completed_at,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Batch {} {:?}", self.batch_id, self.status);
        let _ = writeln!(
            out,
            "Scanned {} of {} URLs ({} failed)",
            self.completed_urls, self.total_urls, self.failed_urls
        );
        let _ = writeln!(
            out,
            "Issues found: {} (average {} per URL)",
            self.total_issues, self.average_issues
        );
        if !self.top_urls.is_empty() {
            let _ = writeln!(out, "Most issues:");
            for entry in &self.top_urls {
                let _ = writeln!(out, "  {:>4}  {}", entry.issues_found, entry.url);
            }
        }
        out
    }
}

/// Sends one summary per finished batch, best effort.
pub struct NotificationDispatcher {
    store: Arc<dyn ScanStore>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn ScanStore>, notifier: Arc<dyn Notifier>) -> Self {
        NotificationDispatcher { store, notifier }
    }

    /// Returns true if a summary was delivered by this call.
    pub async fn dispatch(&self, batch: &Batch) -> bool {
        if !batch.status.is_terminal() {
            return false;
        }

        match self.store.mark_batch_notified(batch.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(batch_id = %batch.id, "Batch already notified");
                return false;
            }
            Err(err) => {
                warn!(batch_id = %batch.id, error = %err, "Failed to claim batch notification");
                return false;
            }
        }

        let scans = match self.store.batch_scans(batch.id).await {
            Ok(scans) => scans,
            Err(err) => {
                warn!(batch_id = %batch.id, error = %err, "Failed to load batch scans for summary");
                return false;
            }
        };

        let summary = BatchSummary::new(batch, &scans);
        match self.notifier.send(&batch.user_id, &summary).await {
            Ok(()) => {
                info!(batch_id = %batch.id, recipient = %batch.user_id, "Batch summary sent");
                true
            }
            Err(err) => {
                warn!(batch_id = %batch.id, error = %err, "Failed to send batch summary");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchUpdate, MemoryStore, ScanUpdate};
    use anyhow::anyhow;
    use parking_lot::Mutex;

    fn scan(url: &str, status: Status, issues_found: i64) -> Scan {
        Scan {
            status,
            issues_found,
            ..Scan::new(url, "user-1", None)
        }
    }

    #[test]
    fn summary_ranks_completed_scans() {
        let mut batch = Batch::new("user-1", 8);
        batch.status = Status::Completed;
        batch.completed_urls = 7;
        batch.failed_urls = 1;

        let scans = vec![
            scan("https://a.test", Status::Completed, 3),
            scan("https://b.test", Status::Completed, 10),
            scan("https://c.test", Status::Completed, 0),
            scan("https://d.test", Status::Completed, 7),
            scan("https://e.test", Status::Completed, 7),
            scan("https://f.test", Status::Completed, 1),
            scan("https://g.test", Status::Completed, 2),
            scan("https://h.test", Status::Failed, 99),
        ];

        let summary = BatchSummary::new(&batch, &scans);
        assert_eq!(summary.total_issues, 30);
        assert_eq!(summary.average_issues, 4);
        let top: Vec<_> = summary.top_urls.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(
            top,
            [
                "https://b.test",
                "https://d.test",
                "https://e.test",
                "https://a.test",
                "https://g.test"
            ]
        );
        assert!(summary.render().contains("Issues found: 30 (average 4 per URL)"));
    }

    #[test]
    fn summary_of_all_failed_batch_is_empty() {
        let mut batch = Batch::new("user-1", 2);
        batch.status = Status::Failed;
        batch.failed_urls = 2;
        let scans = vec![
            scan("https://a.test", Status::Failed, 0),
            scan("https://b.test", Status::Failed, 0),
        ];

        let summary = BatchSummary::new(&batch, &scans);
        assert_eq!(summary.total_issues, 0);
        assert_eq!(summary.average_issues, 0);
        assert!(summary.top_urls.is_empty());
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, BatchSummary)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn send(&self, recipient: &str, summary: &BatchSummary) -> Result<(), Error> {
            if self.fail {
                return Err(anyhow!("smtp unavailable"));
            }
            self.sent
                .lock()
                .push((recipient.to_string(), summary.clone()));
            Ok(())
        }
    }

    async fn finished_batch(store: &MemoryStore) -> Batch {
        let (batch, scans) = store
            .create_batch("user-1", &["https://a.test".to_string()])
            .unwrap();
        store
            .update_scan(scans[0].id, ScanUpdate::failed("unreachable"))
            .await
            .unwrap();
        store
            .update_batch(
                batch.id,
                BatchUpdate {
                    completed_urls: 0,
                    failed_urls: 1,
                    status: Status::Failed,
                    completed_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        store.batch(batch.id).unwrap()
    }

    #[tokio::test]
    async fn dispatches_once_per_batch() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let dispatcher = NotificationDispatcher::new(store.clone(), outbox.clone());
        let batch = finished_batch(&store).await;

        assert!(dispatcher.dispatch(&batch).await);
        assert!(!dispatcher.dispatch(&batch).await);

        let sent = outbox.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "user-1");
        assert_eq!(sent[0].1.failed_urls, 1);
    }

    #[tokio::test]
    async fn skips_unfinished_batches() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox::default());
        let dispatcher = NotificationDispatcher::new(store.clone(), outbox.clone());
        let (batch, _) = store
            .create_batch("user-1", &["https://a.test".to_string()])
            .unwrap();

        assert!(!dispatcher.dispatch(&batch).await);
        assert!(!store.batch(batch.id).unwrap().notified);
    }

    #[tokio::test]
    async fn send_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let outbox = Arc::new(Outbox {
            fail: true,
            ..Outbox::default()
        });
        let dispatcher = NotificationDispatcher::new(store.clone(), outbox);
        let batch = finished_batch(&store).await;

        assert!(!dispatcher.dispatch(&batch).await);
        assert_eq!(store.batch(batch.id).unwrap().status, Status::Failed);
    }
}
