use crate::executor::ScanExecutor;
use crate::notify::Notifier;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;
use crate::store::ScanStore;
use crate::worker::{self, WorkContext, WorkMessage};
use crate::{Job, JobRequest};
use anyhow::{anyhow, Error};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of scans running in parallel.
    pub workers: usize,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            workers: DEFAULT_WORKERS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_length: usize,
    pub active_workers: usize,
    pub processing: bool,
}

/// Rejections raised before a job ever reaches the queue.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {scheme} in {url}, expected http or https")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch of {size} urls exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("all jobs of a bulk submission must share one batch")]
    MixedBatch,
}

pub fn validate_url(url: &str) -> Result<(), AdmissionError> {
    let parsed = url::Url::parse(url).map_err(|source| AdmissionError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AdmissionError::UnsupportedScheme {
            url: url.to_string(),
            scheme: scheme.to_string(),
        }),
    }
}

/// Scan job queue with its worker pool.
///
/// Cloning is cheap and every clone drives the same queue; `serve` must be
/// running for admitted jobs to be processed.
#[derive(Clone)]
pub struct ScanQueue {
    config: QueueConfig,
    queue: Arc<JobQueue>,
    active: Arc<AtomicUsize>,
    serving: Arc<AtomicBool>,
    context: Arc<WorkContext>,
}

impl ScanQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn ScanStore>,
        executor: Arc<dyn ScanExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new());
        let context = Arc::new(WorkContext::new(
            queue.clone(),
            store,
            executor,
            notifier,
            config.retry.clone(),
        ));

        ScanQueue {
            config,
            queue,
            active: Arc::new(AtomicUsize::new(0)),
            serving: Arc::new(AtomicBool::new(false)),
            context,
        }
    }

    pub fn enqueue(
        &self,
        scan_id: Uuid,
        url: impl Into<String>,
        user_id: impl Into<String>,
        batch_id: Option<Uuid>,
    ) -> Result<Uuid, AdmissionError> {
        let request = JobRequest {
            scan_id,
            url: url.into(),
            user_id: user_id.into(),
            batch_id,
        };
        validate_url(&request.url)?;

        let job = Job::new(request, self.config.retry.max_retries());
        let job_id = job.id;
        debug!(message = "Requested job", job_id = %job_id, scan_id = %job.scan_id, url = %job.url);
        self.queue.enqueue(job);
        Ok(job_id)
    }

    /// Admits all requests or none of them.
    pub fn enqueue_bulk(&self, requests: Vec<JobRequest>) -> Result<Vec<Uuid>, AdmissionError> {
        if requests.is_empty() {
            return Err(AdmissionError::EmptyBatch);
        }
        if requests.len() > self.config.max_batch_size {
            return Err(AdmissionError::BatchTooLarge {
                size: requests.len(),
                max: self.config.max_batch_size,
            });
        }

        let batch_id = requests[0].batch_id;
        for request in &requests {
            if request.batch_id != batch_id {
                return Err(AdmissionError::MixedBatch);
            }
            validate_url(&request.url)?;
        }

        let max_retries = self.config.retry.max_retries();
        let jobs: Vec<_> = requests
            .into_iter()
            .map(|request| Job::new(request, max_retries))
            .collect();
        let ids = jobs.iter().map(|job| job.id).collect();

        let count = self.queue.enqueue_many(jobs);
        info!(batch_id = ?batch_id, count, "Batch admitted");
        Ok(ids)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_length: self.queue.len(),
            active_workers: self.active.load(Ordering::SeqCst),
            processing: self.queue.is_busy(),
        }
    }

    /// Resolves once every admitted job has reached a terminal outcome.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    /// Runs the dispatcher and its workers until cancelled.
    ///
    /// Only one dispatcher may run per queue; a second call, also through a
    /// clone, fails while the first is running.
    pub async fn serve(&self, cancel_token: CancellationToken) -> Result<(), Error> {
        if self
            .serving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("queue is already being served"));
        }
        let _serving = ServingGuard(&self.serving);

        let workers_count = self.config.workers.max(1);

        let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
        let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(workers_count);

        let mut workers = vec![];
        for worker_id in 0..workers_count {
            let send_to_server = send_to_server.clone();
            let cancel_token = cancel_token.clone();
            let recv_from_queue = recv_from_queue.clone();
            let context = self.context.clone();
            let join_handle = tokio::spawn(
                async move {
                    worker::start(cancel_token, context, recv_from_queue, send_to_server).await;
                }
                .instrument(info_span!("worker", worker_id)),
            );
            workers.push(join_handle);
        }
        drop(send_to_server);

        let mut free_workers = workers_count;

        loop {
            while free_workers > 0 {
                let Some(job) = self.queue.dequeue() else {
                    break;
                };
                free_workers -= 1;
                self.active.fetch_add(1, Ordering::SeqCst);
                send_to_queue.send(job).await?;
            }
            if self.queue.settle(workers_count - free_workers) {
                trace!("Queue drained, waiting for jobs");
            }

            // Sleep until a job is admitted, a worker reports back, or shutdown.
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Server Cancelled");
                    break;
                },
                _ = self.queue.notified() => {},
                chan_msg = recv_from_worker.recv() => {
                    let finished = match chan_msg {
                        None => {
                            debug!("Worker channel closed unexpectedly, exiting");
                            cancel_token.cancel();
                            break;
                        },
                        Some(WorkMessage::JobStarted(job_id)) => {
                            debug!(message = "Starting job", job_id = %job_id);
                            false
                        },
                        Some(WorkMessage::JobCompleted(job_id)) => {
                            debug!(message = "Completed job", job_id = %job_id);
                            true
                        },
                        Some(WorkMessage::JobRetried(job_id, retries)) => {
                            debug!(message = "Retrying job", job_id = %job_id, retries);
                            true
                        },
                        Some(WorkMessage::JobFailed(job_id, error_msg)) => {
                            debug!(message = "Failed job", job_id = %job_id, error = %error_msg);
                            true
                        },
                        Some(WorkMessage::JobAborted(job_id, error_msg)) => {
                            warn!(message = "Aborted job", job_id = %job_id, error = %error_msg);
                            true
                        },
                    };
                    if finished {
                        free_workers += 1;
                        self.active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }

        send_to_queue.close();

        // Wait for all workers to complete
        futures::future::join_all(workers)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        self.active.store(0, Ordering::SeqCst);
        info!("Server stopped.");

        Ok(())
    }
}

/// Clears the serving flag when the dispatcher exits.
struct ServingGuard<'a>(&'a AtomicBool);

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
