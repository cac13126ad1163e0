pub mod compute;
pub mod queue;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::catalog::{Assignment, AssignmentCatalog};
use crate::error::GatewayError;
use compute::{ComputeStatus, GpuHolds};
use queue::{Job, QueueStats, WaitQueues};

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub enum Reservation {
    /// An assignment's GPU set was idle and is now held by the request.
    Ready(Assignment),
    /// Every capable assignment is busy; the receiver fires when the release
    /// sweep hands this request a GPU set.
    Queued(oneshot::Receiver<()>),
}

/// The reservation engine: assignment catalog + GPU-hold table + per-model
/// wait queues, with the wake-on-release sweep tying them together.
///
/// Constructed once at startup and threaded through the HTTP state.
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone)]
pub struct Engine {
    catalog: AssignmentCatalog,
    compute: ComputeStatus,
    queues: WaitQueues,
}

impl Engine {
    pub fn new(catalog: AssignmentCatalog) -> Self {
        Self {
            catalog,
            compute: ComputeStatus::new(),
            queues: WaitQueues::new(),
        }
    }

    /// Try to reserve a GPU set for `request_id` on any assignment serving
    /// `model_name`.
    ///
    /// Assignments are tried in weight-descending order. If one is idle its
    /// whole GPU set is marked busy and returned. Otherwise the request is
    /// enqueued on the model's wait queue while still inside the compute
    /// critical section, so a concurrent release cannot slip between the
    /// busy scan and the enqueue.
    pub async fn reserve(
        &self,
        model_name: &str,
        request_id: &str,
    ) -> Result<Reservation, GatewayError> {
        if request_id.is_empty() {
            return Err(GatewayError::BadRequest("request id must not be empty".into()));
        }

        let assignments = self.catalog.resolve(model_name).await?;

        let mut holds = self.compute.lock().await;
        for assignment in &assignments {
            if !holds.is_busy(&assignment.gpu_ids) {
                holds.mark_busy(&assignment.gpu_ids, request_id);
                debug!(
                    request_id = %request_id,
                    model = %model_name,
                    backend = %assignment.name,
                    gpus = ?assignment.gpu_ids,
                    "Reserved immediately"
                );
                return Ok(Reservation::Ready(assignment.clone()));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.queues
            .enqueue(Job {
                model_name: model_name.to_string(),
                request_id: request_id.to_string(),
                enqueued_at: Utc::now(),
                waker: tx,
            })
            .await;
        drop(holds);

        Ok(Reservation::Queued(rx))
    }

    /// Look up which assignment a woken waiter was handed: the one whose full
    /// GPU set is held by exactly this request.
    pub async fn get_reserved(
        &self,
        model_name: &str,
        request_id: &str,
    ) -> Result<Assignment, GatewayError> {
        let assignments = self.catalog.resolve(model_name).await?;

        let holds = self.compute.lock().await;
        assignments
            .iter()
            .find(|a| holds.holds_exactly(&a.gpu_ids, request_id))
            .cloned()
            .ok_or_else(|| GatewayError::NotReserved {
                model: model_name.to_string(),
                request_id: request_id.to_string(),
            })
    }

    /// Drop every GPU hold for `request_id`, run the wake-up sweep, and
    /// return the freed GPU ids.
    pub async fn release(&self, request_id: &str) -> Vec<String> {
        let mut holds = self.compute.lock().await;
        let freed = holds.release(request_id);
        if !freed.is_empty() {
            debug!(
                request_id = %request_id,
                gpus = ?freed,
                remaining = holds.len(),
                "Dropped holds"
            );
        }
        self.wake_waiters(&mut holds).await;
        freed
    }

    /// Full cleanup for a request that is done or gave up: remove its queued
    /// job (if any) and release its holds. Safe to call on any exit path; a
    /// request with no job and no holds is a no-op.
    pub async fn abandon(&self, model_name: &str, request_id: &str) -> Vec<String> {
        if self.queues.remove(model_name, request_id).await {
            debug!(request_id = %request_id, model = %model_name, "Removed abandoned job from queue");
        }
        self.release(request_id).await
    }

    /// Wake-up sweep. Runs inside the compute critical section on every
    /// release: for each model queue, serve the oldest waiter that a newly
    /// idle assignment can satisfy. One GPU set was freed, so each queue
    /// commits at most one wake per sweep.
    ///
    /// Catalog resolution from in here is a cache hit in the common case and
    /// never calls back into `ComputeStatus`.
    async fn wake_waiters(&self, holds: &mut GpuHolds) {
        for model_name in self.queues.model_names().await {
            let assignments = match self.catalog.resolve(&model_name).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(
                        model = %model_name,
                        error = %e,
                        "Sweep could not resolve model; leaving its queue untouched"
                    );
                    continue;
                }
            };

            while let Some(job) = self.queues.pop_front(&model_name).await {
                let Some(assignment) = assignments.iter().find(|a| !holds.is_busy(&a.gpu_ids))
                else {
                    // Nothing idle for this model; the head keeps its turn.
                    self.queues.push_front(&model_name, job).await;
                    break;
                };

                let Job {
                    request_id, waker, ..
                } = job;
                holds.mark_busy(&assignment.gpu_ids, &request_id);

                if waker.send(()).is_ok() {
                    debug!(
                        model = %model_name,
                        request_id = %request_id,
                        backend = %assignment.name,
                        "Woke queued request"
                    );
                    break;
                }

                // Waiter vanished (deadline expiry or disconnect) before the
                // signal could land: undo the marks and try the next job.
                holds.release(&request_id);
                debug!(
                    model = %model_name,
                    request_id = %request_id,
                    "Dropped stale job whose waiter is gone"
                );
            }
        }
    }

    /// Depth of one model's wait queue.
    #[cfg(test)]
    pub async fn queue_depth(&self, model_name: &str) -> usize {
        self.queues.depth(model_name).await
    }

    /// Depth and average wait of one model's queue, for request logging.
    pub async fn queue_stats(&self, model_name: &str) -> QueueStats {
        self.queues.stats_for(model_name).await
    }

    /// Access the GPU-hold registry for test assertions.
    #[cfg(test)]
    pub fn compute(&self) -> &ComputeStatus {
        &self.compute
    }
}

/// RAII cleanup for one request's reservation state.
///
/// Armed from the moment a request enters the reservation flow; any exit
/// path that does not explicitly call [`release_now`](Self::release_now)
/// (including task cancellation when the client disconnects) triggers
/// cleanup from `Drop`.
pub struct ReleaseGuard {
    engine: Engine,
    model_name: String,
    request_id: String,
    armed: bool,
}

impl ReleaseGuard {
    pub fn new(engine: Engine, model_name: &str, request_id: &str) -> Self {
        Self {
            engine,
            model_name: model_name.to_string(),
            request_id: request_id.to_string(),
            armed: true,
        }
    }

    /// Clean up deterministically instead of at drop; returns the freed GPU
    /// ids so the caller can log them.
    pub async fn release_now(mut self) -> Vec<String> {
        self.armed = false;
        self.engine
            .abandon(&self.model_name, &self.request_id)
            .await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine.clone();
        let model_name = self.model_name.clone();
        let request_id = self.request_id.clone();
        // Spawn release as a task so it doesn't block if drop happens outside async context
        tokio::spawn(async move {
            let freed = engine.abandon(&model_name, &request_id).await;
            if !freed.is_empty() {
                info!(request_id = %request_id, gpus = ?freed, "Released GPUs");
            }
        });
    }
}
