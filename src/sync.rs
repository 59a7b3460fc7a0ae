//! Per-workload serial sections
//!
//! Every state transition for a workload runs inside its serial section:
//! wakeups, stops, migrations, and lifecycle sweeps contend here, so a
//! workload never sees interleaved driver calls. Locks are striped by id
//! hash to bound memory.

use crate::domain::types::WorkloadId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Number of lock stripes
const STRIPE_COUNT: usize = 64;

/// Striped async locks keyed by workload id
pub struct WorkloadLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for WorkloadLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, id: &WorkloadId) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPE_COUNT]
    }

    /// Enter the workload's serial section, waiting for the holder
    pub async fn lock(&self, id: &WorkloadId) -> MutexGuard<'_, ()> {
        self.stripe(id).lock().await
    }

    /// Enter without waiting; `None` when the section is held
    pub fn try_lock(&self, id: &WorkloadId) -> Option<MutexGuard<'_, ()>> {
        self.stripe(id).try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_workload_serializes() {
        let locks = WorkloadLocks::new();
        let id = WorkloadId::new("w-1");

        let guard = locks.lock(&id).await;
        assert!(locks.try_lock(&id).is_none());
        drop(guard);
        assert!(locks.try_lock(&id).is_some());
    }
}
