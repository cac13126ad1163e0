use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// The GPU-hold table: gpu id → the request currently holding it.
///
/// Plain synchronous operations over the map; all mutation happens while the
/// caller holds the `ComputeStatus` guard, so multi-step sequences
/// (scan-then-mark, release-then-sweep) stay atomic with respect to each
/// other.
#[derive(Debug, Default)]
pub struct GpuHolds {
    held: HashMap<String, String>,
}

impl GpuHolds {
    /// True iff any of the listed GPU ids is currently held.
    pub fn is_busy(&self, gpu_ids: &[String]) -> bool {
        gpu_ids.iter().any(|id| self.held.contains_key(id))
    }

    /// Record every listed GPU as held by `request_id`. The caller must have
    /// just observed `!is_busy` under the same guard.
    pub fn mark_busy(&mut self, gpu_ids: &[String], request_id: &str) {
        for id in gpu_ids {
            self.held.insert(id.clone(), request_id.to_string());
        }
    }

    /// Drop every hold belonging to `request_id`, returning the freed GPU ids
    /// (sorted, for stable logs).
    pub fn release(&mut self, request_id: &str) -> Vec<String> {
        let mut freed: Vec<String> = self
            .held
            .iter()
            .filter(|(_, holder)| holder.as_str() == request_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &freed {
            self.held.remove(id);
        }
        freed.sort();
        freed
    }

    /// Full-set identity check: `request_id` holds every listed GPU and
    /// nothing else. Distinguishes overlapping assignments sharing a GPU.
    pub fn holds_exactly(&self, gpu_ids: &[String], request_id: &str) -> bool {
        if gpu_ids.is_empty() {
            return false;
        }
        let all_held = gpu_ids
            .iter()
            .all(|id| self.held.get(id).map(String::as_str) == Some(request_id));
        let total_held = self
            .held
            .values()
            .filter(|holder| holder.as_str() == request_id)
            .count();
        all_held && total_held == gpu_ids.len()
    }

    /// Number of GPUs currently held, across all requests.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Process-wide registry of which GPUs are held and by which request.
///
/// One mutex covers every operation; `reserve` and the release sweep take the
/// guard once via [`lock`](Self::lock) and run their whole critical section
/// against the inner [`GpuHolds`]. The guard may be held across awaits (it is
/// a tokio mutex) because the wake-up sweep resolves models through the
/// catalog while holding it.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone, Default)]
pub struct ComputeStatus {
    holds: Arc<Mutex<GpuHolds>>,
}

impl ComputeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for a multi-step critical section.
    pub async fn lock(&self) -> MutexGuard<'_, GpuHolds> {
        self.holds.lock().await
    }

    /// Copy of the current hold table, for test assertions.
    #[cfg(test)]
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.holds.lock().await.held.clone()
    }
}
