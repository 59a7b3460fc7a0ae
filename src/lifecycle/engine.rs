//! Lifecycle engine
//!
//! Periodic sweeps drive idle stops, the descent from stopped through
//! sleeping into archived, and the user-facing start/stop/wakeup/delete
//! operations. Every transition runs inside the workload's serial section
//! and emits its billing record.

use crate::config::ConductorConfig;
use crate::domain::ports::{BackupKind, BackupPortRef, HostDriverRef, RepositoryRef};
use crate::domain::types::{LifecyclePhase, Workload, WorkloadId, WorkloadStatus};
use crate::error::{Error, Result};
use crate::lifecycle::billing::BillingRecorder;
use crate::migration::ActiveMigrations;
use crate::registry::FleetRegistry;
use crate::startqueue::StartQueue;
use crate::sync::WorkloadLocks;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a stop was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    Idle,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::User => write!(f, "user"),
            StopReason::Idle => write!(f, "idle"),
        }
    }
}

/// Answer to a wakeup request
#[derive(Debug, Clone)]
pub struct WakeupOutcome {
    pub port: Option<u16>,
    /// `false` while the workload is still on its way up
    pub ready: bool,
}

/// Drives workloads through active, sleep, and archived
pub struct LifecycleEngine {
    registry: Arc<FleetRegistry>,
    repository: RepositoryRef,
    queue: Arc<StartQueue>,
    driver: HostDriverRef,
    backup: BackupPortRef,
    billing: Arc<BillingRecorder>,
    locks: Arc<WorkloadLocks>,
    active_migrations: Arc<ActiveMigrations>,
    config: Arc<ConductorConfig>,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FleetRegistry>,
        repository: RepositoryRef,
        queue: Arc<StartQueue>,
        driver: HostDriverRef,
        backup: BackupPortRef,
        billing: Arc<BillingRecorder>,
        locks: Arc<WorkloadLocks>,
        active_migrations: Arc<ActiveMigrations>,
        config: Arc<ConductorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            repository,
            queue,
            driver,
            backup,
            billing,
            locks,
            active_migrations,
            config,
        })
    }

    /// Run the sweep loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.lifecycle.sweep_interval_secs.max(1));
        info!("lifecycle engine running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("lifecycle engine stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep().await;
        }
    }

    /// One pass over the fleet: idle stops, sleep entries, archivals
    pub async fn sweep(&self) {
        let now = Utc::now();
        let sleep_after = ChronoDuration::hours(self.config.lifecycle.sleep_after_hours as i64);
        let archive_after = ChronoDuration::hours(self.config.lifecycle.archive_after_hours as i64);
        let (_, workloads) = self.registry.snapshot();

        let mut sleep_due: Vec<WorkloadId> = Vec::new();
        for workload in workloads {
            let id = workload.id.clone();
            match workload.status {
                WorkloadStatus::Running => {
                    if workload.auto_shutdown && workload.idle_expired(now) {
                        info!("workload {} idle past timeout, stopping", id);
                        if let Err(e) = self.stop_workload(&id, StopReason::Idle).await {
                            debug!("idle stop of {} skipped: {}", id, e);
                        }
                    }
                }
                WorkloadStatus::Stopped => {
                    let asleep_due = workload
                        .last_stopped
                        .map_or(false, |t| now.signed_duration_since(t) >= sleep_after);
                    if asleep_due {
                        sleep_due.push(id);
                    }
                }
                WorkloadStatus::Sleeping => {
                    let archive_due = workload
                        .last_stopped
                        .map_or(false, |t| now.signed_duration_since(t) >= archive_after);
                    if archive_due {
                        if let Err(e) = self.archive(&id).await {
                            warn!("archival of {} failed: {}", id, e);
                        }
                    }
                }
                _ => {}
            }
        }

        // The repository answers the same cutoff query, so a stopped
        // workload the snapshot missed still descends on schedule.
        match self.repository.stopped_before(now - sleep_after).await {
            Ok(rows) => {
                for row in rows {
                    if !sleep_due.contains(&row.id) {
                        sleep_due.push(row.id);
                    }
                }
            }
            Err(e) => debug!("stopped-before query failed: {}", e),
        }
        for id in sleep_due {
            if let Err(e) = self.enter_sleep(&id).await {
                debug!("sleep entry for {} skipped: {}", id, e);
            }
        }

        self.prune_expired_backups().await;
    }

    /// Delete backups past retention, except the archive a workload still
    /// depends on.
    async fn prune_expired_backups(&self) {
        let expired = match self.backup.list_expired().await {
            Ok(expired) => expired,
            Err(e) => {
                debug!("expired-backup listing failed: {}", e);
                return;
            }
        };
        if expired.is_empty() {
            return;
        }

        let referenced: std::collections::HashSet<String> = self
            .registry
            .snapshot()
            .1
            .into_iter()
            .filter_map(|w| w.archive_backup_id)
            .collect();

        for handle in expired {
            if referenced.contains(&handle.id) {
                continue;
            }
            match self.backup.delete(&handle.id).await {
                Ok(()) => debug!("pruned expired backup {}", handle.id),
                Err(e) => warn!("prune of backup {} failed: {}", handle.id, e),
            }
        }
    }

    // =========================================================================
    // Sleep and Archive
    // =========================================================================

    async fn enter_sleep(&self, id: &WorkloadId) -> Result<()> {
        let _serial = self.locks.lock(id).await;
        // Re-check under the lock; the sweep worked from a snapshot and
        // the repository query can lag a restart.
        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        let sleep_after = ChronoDuration::hours(self.config.lifecycle.sleep_after_hours as i64);
        let due = workload
            .last_stopped
            .map_or(false, |t| Utc::now().signed_duration_since(t) >= sleep_after);
        if workload.status != WorkloadStatus::Stopped || !due {
            return Ok(());
        }

        self.registry.set_status(id, WorkloadStatus::Sleeping)?;
        let (workload, previous) = self.registry.set_phase(id, LifecyclePhase::Sleep)?;
        self.billing.record_phase_change(&workload, previous);
        info!("workload {} entered sleep", id);
        Ok(())
    }

    async fn archive(&self, id: &WorkloadId) -> Result<()> {
        if self.active_migrations.contains(id) {
            return Err(Error::Busy {
                workload_id: id.to_string(),
            });
        }
        let _serial = self.locks.lock(id).await;
        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        if workload.status != WorkloadStatus::Sleeping {
            return Ok(());
        }

        self.registry.set_status(id, WorkloadStatus::Archiving)?;
        let handle = match self
            .backup
            .create(
                id,
                BackupKind::Archive,
                self.config.lifecycle.archive_retention_days,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // The volume is untouched; retry on the next sweep.
                let _ = self.registry.set_status(id, WorkloadStatus::Sleeping);
                return Err(e);
            }
        };

        // The container and volume leave the node; only the archive remains.
        if let (Some(node), Some(container)) = (&workload.node_id, &workload.container) {
            if let Err(e) = self.driver.remove_container(node, container).await {
                debug!("container cleanup for archived {} failed: {}", id, e);
            }
        }
        self.registry.unplace(id)?;
        self.registry.update_workload(id, |w| {
            w.container = None;
            w.port = None;
            w.archive_backup_id = Some(handle.id.clone());
            w.archive_location = Some(handle.location.clone());
        })?;
        self.registry.set_status(id, WorkloadStatus::Archived)?;
        let (workload, previous) = self.registry.set_phase(id, LifecyclePhase::Archived)?;
        self.billing.record_phase_change(&workload, previous);
        info!("workload {} archived to {}", id, handle.location);
        Ok(())
    }

    // =========================================================================
    // User Operations
    // =========================================================================

    /// Stop a running workload. The container stops and the RAM releases;
    /// the volume stays parked on the node for a later restart.
    pub async fn stop_workload(&self, id: &WorkloadId, reason: StopReason) -> Result<Workload> {
        if self.active_migrations.contains(id) {
            return Err(Error::Busy {
                workload_id: id.to_string(),
            });
        }
        let _serial = self.locks.lock(id).await;
        self.stop_locked(id, reason).await
    }

    /// Stop with the serial section already held
    async fn stop_locked(&self, id: &WorkloadId, reason: StopReason) -> Result<Workload> {
        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        if workload.status != WorkloadStatus::Running {
            return Err(Error::InvalidState {
                entity: format!("workload {}", id),
                from: workload.status.to_string(),
                to: "stopping".to_string(),
            });
        }

        self.registry.set_status(id, WorkloadStatus::Stopping)?;
        if let (Some(node), Some(container)) = (&workload.node_id, &workload.container) {
            self.driver
                .stop_container(node, container, self.config.lifecycle.stop_timeout())
                .await?;
        }
        let stopped = self.registry.set_status(id, WorkloadStatus::Stopped)?;
        self.registry.park(id)?;
        self.billing.record_stopped(&stopped);
        info!("workload {} stopped ({})", id, reason);
        Ok(stopped)
    }

    /// Enqueue a stopped or errored workload for a start
    pub async fn start_workload(&self, id: &WorkloadId) -> Result<()> {
        if self.active_migrations.contains(id) {
            return Err(Error::Busy {
                workload_id: id.to_string(),
            });
        }
        let _serial = self.locks.lock(id).await;
        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        match workload.status {
            WorkloadStatus::Stopped | WorkloadStatus::Error => {
                self.registry.set_status(id, WorkloadStatus::Queued)?;
                self.queue.enqueue(id.clone(), workload.owner_id);
                Ok(())
            }
            other => Err(Error::InvalidState {
                entity: format!("workload {}", id),
                from: other.to_string(),
                to: "queued".to_string(),
            }),
        }
    }

    /// Wake a workload up from wherever it rests. Idempotent: a wakeup for
    /// a workload already on its way up reports `not ready` with the
    /// current port. A wakeup during a migration waits for the operation.
    pub async fn wakeup(&self, id: &WorkloadId) -> Result<WakeupOutcome> {
        self.active_migrations.wait(id).await;
        let _serial = self.locks.lock(id).await;

        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;

        match workload.status {
            WorkloadStatus::Running => Ok(WakeupOutcome {
                port: workload.port,
                ready: true,
            }),
            WorkloadStatus::Starting | WorkloadStatus::Queued => Ok(WakeupOutcome {
                port: workload.port,
                ready: false,
            }),
            WorkloadStatus::Stopped | WorkloadStatus::Error => {
                self.registry.set_status(id, WorkloadStatus::Queued)?;
                self.queue.enqueue(id.clone(), workload.owner_id);
                Ok(WakeupOutcome {
                    port: workload.port,
                    ready: false,
                })
            }
            WorkloadStatus::Sleeping => {
                self.registry.set_status(id, WorkloadStatus::Queued)?;
                let (workload, previous) = self.registry.set_phase(id, LifecyclePhase::Active)?;
                self.billing.record_phase_change(&workload, previous);
                self.queue.enqueue(id.clone(), workload.owner_id);
                Ok(WakeupOutcome {
                    port: None,
                    ready: false,
                })
            }
            WorkloadStatus::Archived => {
                let backup_id = workload.archive_backup_id.clone().ok_or_else(|| {
                    Error::Internal(format!("archived workload {} has no backup id", id))
                })?;
                self.backup.restore(&backup_id, id).await?;

                self.registry.update_workload(id, |w| {
                    w.archive_backup_id = None;
                    w.archive_location = None;
                })?;
                self.registry.set_status(id, WorkloadStatus::Queued)?;
                let (workload, previous) = self.registry.set_phase(id, LifecyclePhase::Active)?;
                self.billing.record_phase_change(&workload, previous);
                self.queue.enqueue(id.clone(), workload.owner_id);
                info!("workload {} restored from archive, queued for start", id);
                Ok(WakeupOutcome {
                    port: None,
                    ready: false,
                })
            }
            WorkloadStatus::Stopping | WorkloadStatus::Archiving => Err(Error::Busy {
                workload_id: id.to_string(),
            }),
        }
    }

    /// Remove a workload and its container. Stops it first when running;
    /// rejected while a migration is in flight.
    pub async fn delete_workload(&self, id: &WorkloadId) -> Result<()> {
        if self.active_migrations.contains(id) {
            return Err(Error::Busy {
                workload_id: id.to_string(),
            });
        }
        let _serial = self.locks.lock(id).await;

        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;

        match workload.status {
            WorkloadStatus::Running => {
                self.stop_locked(id, StopReason::User).await?;
            }
            WorkloadStatus::Starting | WorkloadStatus::Stopping | WorkloadStatus::Archiving => {
                return Err(Error::Busy {
                    workload_id: id.to_string(),
                });
            }
            _ => {}
        }

        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        if let (Some(node), Some(container)) = (&workload.node_id, &workload.container) {
            if let Err(e) = self.driver.remove_container(node, container).await {
                debug!("container cleanup for deleted {} failed: {}", id, e);
            }
        }
        if let Some(backup_id) = &workload.archive_backup_id {
            if let Err(e) = self.backup.delete(backup_id).await {
                debug!("archive cleanup for deleted {} failed: {}", id, e);
            }
        }

        self.queue.remove(id);
        self.registry.unplace(id)?;
        self.registry.remove_workload(id)?;
        info!("workload {} deleted", id);
        Ok(())
    }
}
