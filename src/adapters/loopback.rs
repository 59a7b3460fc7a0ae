//! Loopback host driver and backup engine
//!
//! Simulate the host agents and the backup engine in process memory:
//! containers are records with a state, backups are records with a size.
//! Standalone mode and the control-loop tests run the real conductor code
//! paths against these. Optional fault injection flips specific calls into
//! errors so rollback paths can be exercised.

use crate::domain::ports::{
    BackupHandle, BackupKind, BackupPort, ContainerSpec, ContainerState, HostDriver, ProbeResult,
};
use crate::domain::types::{ContainerHandle, NodeId, WorkloadId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone)]
struct ContainerRecord {
    node: NodeId,
    state: ContainerState,
    #[allow(dead_code)]
    spec: ContainerSpec,
}

/// Which driver calls should fail, keyed by node
#[derive(Debug, Default)]
pub struct DriverFaults {
    /// Nodes where `start_container` fails permanently
    pub fail_start_on: Mutex<HashSet<NodeId>>,
    /// Nodes where `probe` reports failure
    pub fail_probe_on: Mutex<HashSet<NodeId>>,
}

/// In-process host driver
#[derive(Debug, Default)]
pub struct LoopbackDriver {
    containers: DashMap<ContainerHandle, ContainerRecord>,
    counter: AtomicU64,
    pub faults: DriverFaults,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers currently recorded on a node
    pub fn containers_on(&self, node: &NodeId) -> Vec<ContainerHandle> {
        let mut handles: Vec<ContainerHandle> = self
            .containers
            .iter()
            .filter(|e| &e.value().node == node)
            .map(|e| e.key().clone())
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    fn record(&self, handle: &ContainerHandle) -> Result<ContainerRecord> {
        self.containers
            .get(handle)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::driver_permanent(format!("unknown container {}", handle)))
    }
}

#[async_trait]
impl HostDriver for LoopbackDriver {
    async fn create_container(
        &self,
        node: &NodeId,
        spec: ContainerSpec,
    ) -> Result<ContainerHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = ContainerHandle(format!("ct-{:08x}", n));
        self.containers.insert(
            handle.clone(),
            ContainerRecord {
                node: node.clone(),
                state: ContainerState::Created,
                spec,
            },
        );
        Ok(handle)
    }

    async fn start_container(&self, node: &NodeId, handle: &ContainerHandle) -> Result<()> {
        if self.faults.fail_start_on.lock().contains(node) {
            return Err(Error::driver_permanent(format!(
                "agent on {} refused to start {}",
                node, handle
            )));
        }
        let mut entry = self
            .containers
            .get_mut(handle)
            .ok_or_else(|| Error::driver_permanent(format!("unknown container {}", handle)))?;
        entry.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(
        &self,
        _node: &NodeId,
        handle: &ContainerHandle,
        _timeout: Duration,
    ) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(handle)
            .ok_or_else(|| Error::driver_permanent(format!("unknown container {}", handle)))?;
        entry.state = ContainerState::Exited;
        Ok(())
    }

    async fn remove_container(&self, _node: &NodeId, handle: &ContainerHandle) -> Result<()> {
        self.containers.remove(handle);
        Ok(())
    }

    async fn inspect(&self, _node: &NodeId, handle: &ContainerHandle) -> Result<ContainerState> {
        Ok(self.record(handle)?.state)
    }

    async fn probe(&self, node: &NodeId, handle: &ContainerHandle) -> Result<ProbeResult> {
        if self.faults.fail_probe_on.lock().contains(node) {
            return Ok(ProbeResult::Failed);
        }
        Ok(match self.record(handle)?.state {
            ContainerState::Running => ProbeResult::Ready,
            _ => ProbeResult::NotReady,
        })
    }

    async fn copy_in(
        &self,
        _node: &NodeId,
        handle: &ContainerHandle,
        _local_path: &str,
        _remote_path: &str,
    ) -> Result<()> {
        self.record(handle).map(|_| ())
    }

    async fn copy_volume_out(
        &self,
        _node: &NodeId,
        handle: &ContainerHandle,
        _local_tarball: &str,
    ) -> Result<()> {
        self.record(handle).map(|_| ())
    }
}

// =============================================================================
// Backup
// =============================================================================

#[derive(Debug, Clone)]
struct BackupRecord {
    handle: BackupHandle,
    retention_days: u32,
}

/// In-process backup engine
#[derive(Debug, Default)]
pub struct LoopbackBackup {
    backups: DashMap<String, BackupRecord>,
    counter: AtomicU64,
    /// When set, `transfer_to_node` fails this many times before working
    pub transient_transfer_failures: AtomicU64,
}

impl LoopbackBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }
}

#[async_trait]
impl BackupPort for LoopbackBackup {
    async fn create(
        &self,
        workload: &WorkloadId,
        kind: BackupKind,
        retention_days: u32,
    ) -> Result<BackupHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("bk-{:08x}", n);
        let handle = BackupHandle {
            id: id.clone(),
            workload_id: workload.clone(),
            kind,
            size_bytes: 256 * 1024 * 1024,
            location: format!("loopback://backups/{}", id),
            created_at: Utc::now(),
        };
        self.backups.insert(
            id,
            BackupRecord {
                handle: handle.clone(),
                retention_days,
            },
        );
        Ok(handle)
    }

    async fn transfer_to_node(&self, backup_id: &str, _target: &NodeId) -> Result<()> {
        if !self.backups.contains_key(backup_id) {
            return Err(Error::Backup(format!("unknown backup {}", backup_id)));
        }
        let pending = self.transient_transfer_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_transfer_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(Error::Timeout {
                operation: format!("transfer of backup {}", backup_id),
                seconds: 1,
            });
        }
        Ok(())
    }

    async fn restore(&self, backup_id: &str, _target: &WorkloadId) -> Result<()> {
        if !self.backups.contains_key(backup_id) {
            return Err(Error::Backup(format!("unknown backup {}", backup_id)));
        }
        Ok(())
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        self.backups.remove(backup_id);
        Ok(())
    }

    async fn list_expired(&self) -> Result<Vec<BackupHandle>> {
        let now = Utc::now();
        Ok(self
            .backups
            .iter()
            .filter(|e| {
                let record = e.value();
                let age = now.signed_duration_since(record.handle.created_at);
                age.num_days() >= record.retention_days as i64
            })
            .map(|e| e.value().handle.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startqueue;
    use crate::testutil;

    #[tokio::test]
    async fn test_container_lifecycle() {
        let driver = LoopbackDriver::new();
        let node = NodeId::new("n-1");
        let workload = testutil::workload("w-1", 4096);
        let spec = startqueue::container_spec(&workload, 30100);

        let handle = driver.create_container(&node, spec).await.unwrap();
        assert_eq!(
            driver.inspect(&node, &handle).await.unwrap(),
            ContainerState::Created
        );
        assert_eq!(
            driver.probe(&node, &handle).await.unwrap(),
            ProbeResult::NotReady
        );

        driver.start_container(&node, &handle).await.unwrap();
        assert_eq!(
            driver.probe(&node, &handle).await.unwrap(),
            ProbeResult::Ready
        );

        driver
            .stop_container(&node, &handle, Duration::from_secs(5))
            .await
            .unwrap();
        driver.remove_container(&node, &handle).await.unwrap();
        assert!(driver.containers_on(&node).is_empty());
    }

    #[tokio::test]
    async fn test_start_fault_injection() {
        let driver = LoopbackDriver::new();
        let node = NodeId::new("n-bad");
        driver.faults.fail_start_on.lock().insert(node.clone());

        let workload = testutil::workload("w-1", 4096);
        let handle = driver
            .create_container(&node, startqueue::container_spec(&workload, 30100))
            .await
            .unwrap();
        let err = driver.start_container(&node, &handle).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_backup_create_transfer_restore() {
        let backup = LoopbackBackup::new();
        let w = WorkloadId::new("w-1");

        let handle = backup.create(&w, BackupKind::PreMigration, 7).await.unwrap();
        backup
            .transfer_to_node(&handle.id, &NodeId::new("n-2"))
            .await
            .unwrap();
        backup.restore(&handle.id, &w).await.unwrap();
        backup.delete(&handle.id).await.unwrap();
        assert!(backup.restore(&handle.id, &w).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_transfer_faults_recover() {
        let backup = LoopbackBackup::new();
        let w = WorkloadId::new("w-1");
        let handle = backup.create(&w, BackupKind::PreMigration, 7).await.unwrap();

        backup.transient_transfer_failures.store(2, Ordering::SeqCst);
        let node = NodeId::new("n-2");
        assert!(backup.transfer_to_node(&handle.id, &node).await.is_err());
        assert!(backup.transfer_to_node(&handle.id, &node).await.is_err());
        backup.transfer_to_node(&handle.id, &node).await.unwrap();
    }
}
