use crate::Job;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{watch, Notify};

/// In-memory FIFO of jobs waiting for a free worker.
///
/// Admission wakes the dispatcher and flips the busy flag under the same lock
/// that guards the jobs, so `wait_idle` can't observe an idle pool while a job
/// is still pending.
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    busy: watch::Sender<bool>,
}

impl Default for JobQueue {
    fn default() -> Self {
        JobQueue::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            busy,
        }
    }

    pub fn enqueue(&self, job: Job) {
        {
            let mut jobs = self.jobs.lock();
            jobs.push_back(job);
            self.busy.send_replace(true);
        }
        self.notify.notify_one();
    }

    pub fn enqueue_many(&self, batch: impl IntoIterator<Item = Job>) -> usize {
        let added = {
            let mut jobs = self.jobs.lock();
            let before = jobs.len();
            jobs.extend(batch);
            let added = jobs.len() - before;
            if added > 0 {
                self.busy.send_replace(true);
            }
            added
        };
        if added > 0 {
            self.notify.notify_one();
        }
        added
    }

    pub fn dequeue(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// True from the first admission until the pool has drained.
    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Marks the pool idle if nothing is queued and no worker holds a job.
    pub(crate) fn settle(&self, active_workers: usize) -> bool {
        let jobs = self.jobs.lock();
        if jobs.is_empty() && active_workers == 0 {
            self.busy.send_replace(false);
            true
        } else {
            false
        }
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    pub async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        // The sender lives as long as `self`, so this only returns once idle.
        let _ = busy.wait_for(|busy| !*busy).await;
    }
}
