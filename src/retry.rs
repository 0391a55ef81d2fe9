use crate::{Job, DEFAULT_MAX_RETRIES};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-admit the job to the tail of the queue after the given delay.
    Retry(Duration),
    /// Retry budget exhausted.
    Failed,
}

/// Decides what happens to a job after a failed scan.
///
/// The policy never touches persistence; callers act on the decision. With a
/// zero base delay (the default) failed jobs are re-admitted immediately,
/// otherwise the delay doubles on every retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_MAX_RETRIES, Duration::ZERO)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn decide(&self, job: &Job) -> RetryDecision {
        if job.retries >= job.max_retries {
            return RetryDecision::Failed;
        }

        let factor = 2u32.saturating_pow(job.retries);
        RetryDecision::Retry(self.base_delay.saturating_mul(factor))
    }

    pub fn prepare_for_retry(&self, job: &mut Job) {
        job.retries += 1;
        debug!(job_id = %job.id, retries = job.retries, "Job prepared for retry");
    }
}
