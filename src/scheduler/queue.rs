use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, RwLock};

/// A reservation request waiting for a GPU set to free up.
pub struct Job {
    pub model_name: String,
    pub request_id: String,
    pub enqueued_at: DateTime<Utc>,
    /// Oneshot sender fired when the release sweep hands this job a GPU set.
    pub waker: oneshot::Sender<()>,
}

// Manual Debug impl since oneshot::Sender doesn't implement Debug
impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("model_name", &self.model_name)
            .field("request_id", &self.request_id)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// Per-queue statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub avg_wait_ms: i64,
}

/// Per-model FIFO wait queues, created lazily on first use.
///
/// Lock order: this lock is only ever taken alone or *after* the
/// `ComputeStatus` guard (reserve enqueues and the release sweep dequeues
/// from inside that critical section) — never before it.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone, Default)]
pub struct WaitQueues {
    queues: Arc<RwLock<HashMap<String, VecDeque<Job>>>>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to the tail of its model's queue.
    pub async fn enqueue(&self, job: Job) {
        let mut queues = self.queues.write().await;
        queues
            .entry(job.model_name.clone())
            .or_default()
            .push_back(job);
    }

    /// Remove and return the oldest job for a model.
    pub async fn pop_front(&self, model_name: &str) -> Option<Job> {
        let mut queues = self.queues.write().await;
        queues.get_mut(model_name)?.pop_front()
    }

    /// Put a job back at the head of its model's queue. Used by the release
    /// sweep when the head job cannot be served yet.
    pub async fn push_front(&self, model_name: &str, job: Job) {
        let mut queues = self.queues.write().await;
        queues
            .entry(model_name.to_string())
            .or_default()
            .push_front(job);
    }

    /// Remove a specific queued request (timeout / abandonment cleanup).
    /// Returns whether a job was actually removed.
    pub async fn remove(&self, model_name: &str, request_id: &str) -> bool {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get_mut(model_name) {
            let before = queue.len();
            queue.retain(|job| job.request_id != request_id);
            return queue.len() != before;
        }
        false
    }

    /// Get the depth of a specific queue.
    #[cfg(test)]
    pub async fn depth(&self, model_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(model_name).map_or(0, |q| q.len())
    }

    /// Names of every queue ever created, for the release sweep.
    pub async fn model_names(&self) -> Vec<String> {
        let queues = self.queues.read().await;
        queues.keys().cloned().collect()
    }

    /// Get stats for one queue (depth + average wait time).
    pub async fn stats_for(&self, model_name: &str) -> QueueStats {
        let queues = self.queues.read().await;
        let now = Utc::now();

        let Some(queue) = queues.get(model_name) else {
            return QueueStats {
                depth: 0,
                avg_wait_ms: 0,
            };
        };

        let depth = queue.len();
        let avg_wait_ms = if depth > 0 {
            let total_ms: i64 = queue
                .iter()
                .map(|job| (now - job.enqueued_at).num_milliseconds())
                .sum();
            total_ms / depth as i64
        } else {
            0
        };

        QueueStats { depth, avg_wait_ms }
    }
}
