use crate::batch::{BatchTracker, Outcome};
use crate::executor::ScanExecutor;
use crate::notify::{NotificationDispatcher, Notifier};
use crate::queue::JobQueue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{ScanStore, ScanUpdate};
use crate::Job;
use anyhow::Error;
use async_channel::Receiver;
use std::sync::Arc;
use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobCompleted(Uuid),
    JobRetried(Uuid, u32),
    JobFailed(Uuid, String),
    /// The job finished but could not be counted in its batch.
    JobAborted(Uuid, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Retried(u32),
    Failed(String),
}

/// Collaborators shared by every worker of a pool.
pub struct WorkContext {
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) store: Arc<dyn ScanStore>,
    pub(crate) executor: Arc<dyn ScanExecutor>,
    pub(crate) retry: RetryPolicy,
    pub(crate) batches: BatchTracker,
    pub(crate) notifications: NotificationDispatcher,
}

impl WorkContext {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn ScanStore>,
        executor: Arc<dyn ScanExecutor>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        WorkContext {
            queue,
            batches: BatchTracker::new(store.clone()),
            notifications: NotificationDispatcher::new(store.clone(), notifier),
            store,
            executor,
            retry,
        }
    }

    /// Counts a finished job in its batch and notifies once the batch ends.
    ///
    /// A failed counter write falls back to recounting the batch from its
    /// scans, so one lost write cannot keep the batch from finishing.
    async fn resolve_batch(&self, job: &Job, outcome: Outcome) -> Result<(), Error> {
        let Some(batch_id) = job.batch_id else {
            return Ok(());
        };

        let progress = match self.batches.record_outcome(batch_id, outcome).await {
            Ok(progress) => progress,
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "Batch update failed, reconciling");
                self.batches.reconcile(batch_id).await?
            }
        };
        if progress.became_terminal {
            self.notifications.dispatch(&progress.batch).await;
        }
        Ok(())
    }
}

pub async fn start(
    cancel_token: CancellationToken,
    context: Arc<WorkContext>,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                let job = match job {
                    Err(_) => {
                        debug!("Job channel closed, worker exiting");
                        break;
                    },
                    Ok(job) => job,
                };

                let job_id = job.id;
                if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
                    error!("Server channel closed, worker exiting");
                    break;
                }

                let message = match process(&context, job, &cancel_token).await {
                    Ok(Resolution::Completed) => WorkMessage::JobCompleted(job_id),
                    Ok(Resolution::Retried(retries)) => WorkMessage::JobRetried(job_id, retries),
                    Ok(Resolution::Failed(msg)) => WorkMessage::JobFailed(job_id, msg),
                    Err(err) => {
                        error!(message = "Error processing job", job_id = %job_id, error = ?err);
                        WorkMessage::JobAborted(job_id, err.to_string())
                    }
                };

                if send_to_server.send(message).is_err() {
                    error!("Server channel closed, worker exiting");
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}

/// Runs one attempt of a job and applies the retry policy on failure.
///
/// A store error during the attempt counts as a failed attempt, so the scan
/// ends `completed` or `failed` and never stays `processing`. Errors returned
/// here come from the batch counters.
#[instrument(skip_all, fields(job_id = %job.id, scan_id = %job.scan_id, url = %job.url, retries = job.retries))]
pub async fn process(
    context: &WorkContext,
    mut job: Job,
    cancel_token: &CancellationToken,
) -> Result<Resolution, Error> {
    let err = match attempt(context, &job).await {
        Ok(issues_found) => {
            info!(issues_found, "Scan completed");
            context.resolve_batch(&job, Outcome::Completed).await?;
            return Ok(Resolution::Completed);
        }
        Err(err) => err,
    };

    match context.retry.decide(&job) {
        RetryDecision::Retry(delay) => {
            context.retry.prepare_for_retry(&mut job);
            let retries = job.retries;
            let delay_ms = delay.as_millis();
            warn!(error = %err, retries, delay_ms, "Attempt failed, requeueing");

            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {},
                    _ = cancel_token.cancelled() => {},
                }
            }
            context.queue.enqueue(job);
            Ok(Resolution::Retried(retries))
        }
        RetryDecision::Failed => {
            let msg = format!("{:#}", err);
            error!(error = %msg, "Job failed permanently");
            if let Err(write_err) = context
                .store
                .update_scan(job.scan_id, ScanUpdate::failed(msg.clone()))
                .await
            {
                error!(error = ?write_err, "Could not record scan failure");
            }
            context.resolve_batch(&job, Outcome::Failed).await?;
            Ok(Resolution::Failed(msg))
        }
    }
}

/// Marks the scan started, runs it and stores the report.
async fn attempt(context: &WorkContext, job: &Job) -> Result<i64, Error> {
    context
        .store
        .update_scan(job.scan_id, ScanUpdate::processing())
        .await?;
    if let Some(batch_id) = job.batch_id {
        context.batches.mark_started(batch_id).await?;
    }

    let report = context.executor.perform_scan(&job.url).await?;
    context
        .store
        .update_scan(job.scan_id, ScanUpdate::completed(&report)?)
        .await?;
    Ok(report.issues_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScanReport;
    use crate::notify::BatchSummary;
    use crate::store::MemoryStore;
    use crate::{JobRequest, Scan, Status};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Failing;

    #[async_trait]
    impl ScanExecutor for Failing {
        async fn perform_scan(&self, url: &str) -> Result<ScanReport, Error> {
            Err(anyhow!("connection refused: {}", url))
        }
    }

    struct Silent;

    #[async_trait]
    impl Notifier for Silent {
        async fn send(&self, _recipient: &str, _summary: &BatchSummary) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_attempt_is_requeued_at_the_tail() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new());
        let context = WorkContext::new(
            queue.clone(),
            store.clone(),
            Arc::new(Failing),
            Arc::new(Silent),
            RetryPolicy::default(),
        );

        let scan = Scan::new("https://down.test", "user-1", None);
        store.insert_scan(scan.clone());
        let job = Job::new(JobRequest::for_scan(&scan), 3);
        let job_id = job.id;

        let resolution = process(&context, job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Retried(1));

        let requeued = queue.dequeue().unwrap();
        assert_eq!(requeued.id, job_id);
        assert_eq!(requeued.retries, 1);
        assert_eq!(store.scan(scan.id).unwrap().status, Status::Processing);
    }

    #[tokio::test]
    async fn exhausted_job_fails_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new());
        let context = WorkContext::new(
            queue.clone(),
            store.clone(),
            Arc::new(Failing),
            Arc::new(Silent),
            RetryPolicy::default(),
        );

        let scan = Scan::new("https://down.test", "user-1", None);
        store.insert_scan(scan.clone());
        let mut job = Job::new(JobRequest::for_scan(&scan), 3);
        job.retries = 3;

        let resolution = process(&context, job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Failed(msg) if msg.contains("connection refused")));
        assert!(queue.is_empty());

        let stored = store.scan(scan.id).unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn missing_scan_is_retried_like_a_scan_failure() {
        let queue = Arc::new(JobQueue::new());
        let context = WorkContext::new(
            queue.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(Failing),
            Arc::new(Silent),
            RetryPolicy::default(),
        );
        let mut job = Job::new(
            JobRequest {
                scan_id: Uuid::new_v4(),
                url: "https://a.test".into(),
                user_id: "user-1".into(),
                batch_id: None,
            },
            3,
        );

        let resolution = process(&context, job.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Retried(1));
        assert_eq!(queue.dequeue().unwrap().retries, 1);

        job.retries = 3;
        let resolution = process(&context, job, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Failed(msg) if msg.contains("not found")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn unknown_batch_fails_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let context = WorkContext::new(
            Arc::new(JobQueue::new()),
            store.clone(),
            Arc::new(Failing),
            Arc::new(Silent),
            RetryPolicy::default(),
        );

        let scan = Scan::new("https://a.test", "user-1", Some(Uuid::new_v4()));
        store.insert_scan(scan.clone());
        let mut job = Job::new(JobRequest::for_scan(&scan), 3);
        job.retries = 3;

        // The batch row is missing, so counting the failure errors out.
        assert!(process(&context, job, &CancellationToken::new())
            .await
            .is_err());

        let stored = store.scan(scan.id).unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert!(stored.error.unwrap().contains("not found"));
    }
}
