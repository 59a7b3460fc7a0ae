//! Workload migration
//!
//! Executes migrations as an explicit multi-phase state machine with
//! rollback, and tracks which workloads are mid-flight so user operations
//! can reject with `busy` or wait for completion.

pub mod coordinator;

pub use coordinator::MigrationCoordinator;

use crate::domain::types::{MigrationId, WorkloadId};
use crate::error::{Error, Result};
use dashmap::DashMap;
use tokio::sync::watch;

// =============================================================================
// Active Operations
// =============================================================================

struct ActiveEntry {
    migration_id: MigrationId,
    done: watch::Receiver<bool>,
}

/// Which workloads have an operation in an active phase. At most one per
/// workload; waiters can park on the entry until the operation finishes.
#[derive(Default)]
pub struct ActiveMigrations {
    inner: DashMap<WorkloadId, ActiveEntry>,
}

impl ActiveMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the workload for an operation. Returns the completion signal
    /// the worker fires when it is done, or `MigrationInProgress` if
    /// another operation holds the claim.
    pub fn try_begin(
        &self,
        workload: &WorkloadId,
        migration_id: &MigrationId,
    ) -> Result<watch::Sender<bool>> {
        match self.inner.entry(workload.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::MigrationInProgress {
                workload_id: workload.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(ActiveEntry {
                    migration_id: migration_id.clone(),
                    done: rx,
                });
                Ok(tx)
            }
        }
    }

    /// Release the claim and wake all waiters
    pub fn finish(&self, workload: &WorkloadId, done: &watch::Sender<bool>) {
        let _ = done.send(true);
        self.inner.remove(workload);
    }

    /// Whether the workload is mid-migration
    pub fn contains(&self, workload: &WorkloadId) -> bool {
        self.inner.contains_key(workload)
    }

    /// The active operation id for a workload, if any
    pub fn migration_of(&self, workload: &WorkloadId) -> Option<MigrationId> {
        self.inner.get(workload).map(|e| e.migration_id.clone())
    }

    /// Operations currently in an active phase
    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Wait until any active operation for the workload finishes. Returns
    /// immediately when none is in flight.
    pub async fn wait(&self, workload: &WorkloadId) {
        let Some(mut rx) = self.inner.get(workload).map(|e| e.done.clone()) else {
            return;
        };
        // A dropped sender also means the operation is gone.
        let _ = rx.wait_for(|done| *done).await;
    }
}
