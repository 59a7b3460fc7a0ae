//! Migration coordinator
//!
//! Executes one migration as a five-phase state machine: preparing
//! (pre-migration backup plus target reservation), transferring (archive
//! streamed to the target with retries), completing (final volume sync
//! over the host agents, then cutover with health check), rollback on
//! cutover failure, and cooldown. Operations arrive on a single submission
//! channel fed by the consolidation planner and manual requests; a
//! semaphore bounds how many execute at once.

use crate::config::ConductorConfig;
use crate::domain::ports::{BackupKind, BackupPortRef, HostDriverRef};
use crate::domain::types::{
    ContainerHandle, MigrationId, MigrationOperation, MigrationReason, MigrationStatus, NodeId,
    Workload, WorkloadId, WorkloadStatus,
};
use crate::error::{Error, Result};
use crate::events::{ConductorEvent, EventBus};
use crate::health;
use crate::persist::PersistHandle;
use crate::registry::FleetRegistry;
use crate::startqueue;
use crate::sync::WorkloadLocks;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ActiveMigrations;

// =============================================================================
// Coordinator
// =============================================================================

/// Owns migration operations and drives their execution
pub struct MigrationCoordinator {
    registry: Arc<FleetRegistry>,
    driver: HostDriverRef,
    backup: BackupPortRef,
    persist: PersistHandle,
    bus: EventBus,
    locks: Arc<WorkloadLocks>,
    config: Arc<ConductorConfig>,
    active: Arc<ActiveMigrations>,
    /// Cooldown expiry per workload after a terminal non-manual operation
    cooldowns: DashMap<WorkloadId, DateTime<Utc>>,
    /// All known operations, suggested through terminal
    ops: DashMap<MigrationId, MigrationOperation>,
    /// Cancellation tokens of currently executing workers
    running: DashMap<MigrationId, CancellationToken>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<MigrationId>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<MigrationId>>>,
    id_counter: AtomicU64,
}

impl MigrationCoordinator {
    pub fn new(
        registry: Arc<FleetRegistry>,
        driver: HostDriverRef,
        backup: BackupPortRef,
        persist: PersistHandle,
        bus: EventBus,
        locks: Arc<WorkloadLocks>,
        active: Arc<ActiveMigrations>,
        config: Arc<ConductorConfig>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_parallel = config.migration.max_parallel.max(1);
        Arc::new(Self {
            registry,
            driver,
            backup,
            persist,
            bus,
            locks,
            config,
            active,
            cooldowns: DashMap::new(),
            ops: DashMap::new(),
            running: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            tx,
            rx: Mutex::new(Some(rx)),
            id_counter: AtomicU64::new(1),
        })
    }

    /// Fresh operation id
    pub fn next_id(&self) -> MigrationId {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        MigrationId::new(format!("mig-{:08x}", n))
    }

    /// Record a proposal without scheduling it (optimization level 1)
    pub fn record_suggestion(&self, op: MigrationOperation) {
        self.persist.migration(&op);
        self.ops.insert(op.id.clone(), op);
    }

    /// Validate and schedule an operation for execution
    pub fn submit(&self, mut op: MigrationOperation) -> Result<MigrationId> {
        let workload = self
            .registry
            .get_workload(&op.workload_id)
            .ok_or_else(|| Error::not_found("workload", &op.workload_id))?;

        if self.active.contains(&op.workload_id) {
            return Err(Error::MigrationInProgress {
                workload_id: op.workload_id.to_string(),
            });
        }
        // Cooldown binds every trigger except a human's.
        if op.reason != MigrationReason::Manual {
            if let Some(until) = self.cooldown_until(&op.workload_id) {
                if until > Utc::now() {
                    return Err(Error::CooldownActive {
                        workload_id: op.workload_id.to_string(),
                    });
                }
            }
        }
        let Some(from) = workload.node_id.clone() else {
            return Err(Error::InvalidState {
                entity: format!("workload {}", op.workload_id),
                from: "unplaced".into(),
                to: "migrating".into(),
            });
        };
        op.from_node = from;
        op.status = MigrationStatus::Scheduled;

        let id = op.id.clone();
        self.persist.migration(&op);
        self.ops.insert(id.clone(), op);
        self.tx
            .send(id.clone())
            .map_err(|_| Error::Internal("migration coordinator is not running".into()))?;
        Ok(id)
    }

    /// Cancel an operation. Suggested and scheduled operations cancel
    /// immediately; an executing one is signalled and cleans itself up
    /// (cancellation of `completing` is deferred until cutover finishes).
    pub fn cancel(&self, id: &MigrationId) -> Result<()> {
        if let Some(token) = self.running.get(id) {
            token.cancel();
            return Ok(());
        }
        let mut op = self
            .ops
            .get_mut(id)
            .ok_or_else(|| Error::not_found("migration", id))?;
        match op.status {
            MigrationStatus::Suggested | MigrationStatus::Approved | MigrationStatus::Scheduled => {
                op.status = MigrationStatus::Cancelled;
                op.completed_at = Some(Utc::now());
                self.persist.migration(&op);
                Ok(())
            }
            status => Err(Error::InvalidState {
                entity: format!("migration {}", id),
                from: status.to_string(),
                to: "cancelled".to_string(),
            }),
        }
    }

    /// Cooldown expiry for a workload, if one is pending
    pub fn cooldown_until(&self, workload: &WorkloadId) -> Option<DateTime<Utc>> {
        self.cooldowns.get(workload).map(|e| *e.value())
    }

    /// Operations in flight right now
    pub fn active_count(&self) -> usize {
        self.active.count()
    }

    pub fn get(&self, id: &MigrationId) -> Option<MigrationOperation> {
        self.ops.get(id).map(|op| op.clone())
    }

    /// All known operations, oldest first
    pub fn list_operations(&self) -> Vec<MigrationOperation> {
        let mut ops: Vec<MigrationOperation> = self.ops.iter().map(|e| e.value().clone()).collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        ops
    }

    /// Reload operations recovered from the repository. In-flight phases
    /// resume from `preparing`; an interrupted cutover is not re-entrant
    /// and is marked failed.
    pub fn rehydrate(&self, recovered: Vec<MigrationOperation>) {
        let mut max_seen = 0u64;
        for mut op in recovered {
            if let Some(hex) = op.id.as_str().strip_prefix("mig-") {
                if let Ok(n) = u64::from_str_radix(hex, 16) {
                    max_seen = max_seen.max(n);
                }
            }
            match op.status {
                MigrationStatus::Preparing | MigrationStatus::Transferring => {
                    info!("resuming interrupted migration {} from the start", op.id);
                    op.status = MigrationStatus::Scheduled;
                    op.progress = 0;
                    self.persist.migration(&op);
                    let id = op.id.clone();
                    self.ops.insert(id.clone(), op);
                    let _ = self.tx.send(id);
                }
                MigrationStatus::Completing => {
                    warn!("migration {} interrupted during cutover, marking failed", op.id);
                    op.status = MigrationStatus::Failed;
                    op.error = Some("interrupted during cutover".into());
                    op.completed_at = Some(Utc::now());
                    self.persist.migration(&op);
                    self.note_cooldown(&op);
                    self.ops.insert(op.id.clone(), op);
                }
                MigrationStatus::Completed | MigrationStatus::Failed => {
                    self.note_cooldown(&op);
                    self.ops.insert(op.id.clone(), op);
                }
                _ => {
                    self.ops.insert(op.id.clone(), op);
                }
            }
        }
        self.id_counter.store(max_seen + 1, Ordering::SeqCst);
    }

    /// Run the execution loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("migration coordinator started twice");
            return;
        };
        info!("migration coordinator running");
        loop {
            let id = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("migration coordinator stopping");
                    return;
                }
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let coordinator = self.clone();
            let op_token = cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                coordinator.execute(id, op_token).await;
            });
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(&self, id: MigrationId, cancel: CancellationToken) {
        let Some(op) = self.get(&id) else {
            warn!("scheduled migration {} disappeared", id);
            return;
        };
        let workload_id = op.workload_id.clone();

        let done = match self.active.try_begin(&workload_id, &id) {
            Ok(done) => done,
            Err(e) => {
                warn!("migration {} rejected: {}", id, e);
                self.finalize(id, MigrationStatus::Cancelled, Some(e.to_string()));
                return;
            }
        };
        self.running.insert(id.clone(), cancel.clone());

        // The serial section spans every phase, so stops, wakeups, and
        // sweeps never interleave driver calls with the cutover.
        let serial = self.locks.lock(&workload_id).await;
        let outcome = self.run_phases(&id, cancel).await;
        drop(serial);

        self.running.remove(&id);
        match outcome {
            Ok(()) => {
                info!("migration {} completed", id);
                self.finalize(id, MigrationStatus::Completed, None);
            }
            Err(Error::Cancelled) => {
                info!("migration {} cancelled", id);
                self.finalize(id, MigrationStatus::Cancelled, Some("cancelled".into()));
            }
            Err(e) => {
                warn!("migration {} failed: {}", id, e);
                self.finalize(id, MigrationStatus::Failed, Some(e.to_string()));
            }
        }
        self.active.finish(&workload_id, &done);
    }

    /// The phase ladder. Any error before `completing` leaves the source
    /// untouched; a `completing` failure has already been rolled back by
    /// the time it propagates out of [`cutover`].
    ///
    /// [`cutover`]: MigrationCoordinator::cutover
    async fn run_phases(&self, id: &MigrationId, cancel: CancellationToken) -> Result<()> {
        let op = self
            .get(id)
            .ok_or_else(|| Error::not_found("migration", id))?;
        let workload = self
            .registry
            .get_workload(&op.workload_id)
            .ok_or_else(|| Error::not_found("workload", &op.workload_id))?;
        let to = op.to_node.clone();

        // ---- preparing ------------------------------------------------------
        self.advance(id, MigrationStatus::Preparing, 5)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let backup_handle = tokio::time::timeout(
            self.config.migration.backup_timeout(),
            self.backup.create(
                &workload.id,
                BackupKind::PreMigration,
                self.config.migration.backup_retention_days,
            ),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pre-migration backup for {}", workload.id),
            seconds: self.config.migration.backup_timeout_secs,
        })??;
        self.advance(id, MigrationStatus::Preparing, 10)?;

        // Reserve the target side; a target without room aborts before
        // anything moved.
        self.registry.begin_move(&workload.id, &to)?;

        // ---- transferring ---------------------------------------------------
        let transfer = self.transfer_with_retries(id, &backup_handle.id, backup_handle.size_bytes, &to, &cancel).await;
        if let Err(e) = transfer {
            self.registry.abort_move(&workload.id, &to)?;
            let _ = self.backup.delete(&backup_handle.id).await;
            return Err(e);
        }
        self.advance(id, MigrationStatus::Transferring, 90)?;

        if cancel.is_cancelled() {
            self.registry.abort_move(&workload.id, &to)?;
            let _ = self.backup.delete(&backup_handle.id).await;
            return Err(Error::Cancelled);
        }

        // ---- completing -----------------------------------------------------
        // Cancellation is deferred from here: the cutover either commits
        // or rolls back as a unit.
        self.advance(id, MigrationStatus::Completing, 92)?;
        self.cutover(id, &workload, &to).await
    }

    /// Stream the archive to the target, retrying transient failures with
    /// exponential backoff up to the operation's retry budget.
    async fn transfer_with_retries(
        &self,
        id: &MigrationId,
        backup_id: &str,
        archive_bytes: u64,
        to: &NodeId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.advance(id, MigrationStatus::Transferring, 20)?;
        let deadline = self.config.migration.transfer_timeout(archive_bytes);
        let max_retries = self
            .get(id)
            .map(|op| op.max_retries)
            .unwrap_or(self.config.migration.max_retries);

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = tokio::time::timeout(deadline, self.backup.transfer_to_node(backup_id, to))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("transfer of backup {}", backup_id),
                    seconds: deadline.as_secs(),
                })
                .and_then(|inner| inner);

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        "transfer attempt {} for migration {} failed: {}, retrying",
                        attempt, id, e
                    );
                    if let Some(mut op) = self.ops.get_mut(id) {
                        op.retry_count = attempt;
                        self.persist.migration(&op);
                    }
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt.min(6))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the source, start the target, health-check, commit. Any
    /// failure restores the source before the error propagates (no
    /// automatic retry of a cutover).
    async fn cutover(&self, id: &MigrationId, workload: &Workload, to: &NodeId) -> Result<()> {
        let was_running = workload.status == WorkloadStatus::Running;
        let from = workload.node_id.clone().ok_or_else(|| {
            Error::Internal(format!(
                "workload {} lost its node during migration {}",
                workload.id, id
            ))
        })?;

        if !was_running {
            // Offline move: the volume is in place on the target, only the
            // books and the leftover source container change.
            if let (Some(node), Some(container)) = (&workload.node_id, &workload.container) {
                let _ = self.driver.remove_container(node, container).await;
            }
            self.registry.update_workload(&workload.id, |w| {
                w.container = None;
            })?;
            self.registry.commit_move(&workload.id, to)?;
            self.advance(id, MigrationStatus::Completing, 100)?;
            return Ok(());
        }

        let source_container = workload.container.clone().ok_or_else(|| {
            Error::Internal(format!("running workload {} has no container", workload.id))
        })?;

        let port = workload
            .port
            .unwrap_or_else(|| startqueue::host_port_for(&workload.id));
        let spec = startqueue::container_spec(workload, port);
        let target_container = match self.driver.create_container(to, spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.abort_move(&workload.id, to)?;
                return Err(e);
            }
        };

        let cutover_result = self
            .try_cutover(&workload.id, &from, &source_container, to, &target_container)
            .await;

        match cutover_result {
            Ok(()) => {
                self.registry.commit_move(&workload.id, to)?;
                self.registry.update_workload(&workload.id, |w| {
                    w.container = Some(target_container.clone());
                })?;
                let _ = self.driver.remove_container(&from, &source_container).await;
                self.advance(id, MigrationStatus::Completing, 100)?;
                Ok(())
            }
            Err(e) => {
                self.rollback(workload, &from, &source_container, to, &target_container)
                    .await;
                Err(Error::driver_permanent(format!(
                    "cutover failed and was rolled back: {}",
                    e
                )))
            }
        }
    }

    async fn try_cutover(
        &self,
        workload_id: &WorkloadId,
        from: &NodeId,
        source: &ContainerHandle,
        to: &NodeId,
        target: &ContainerHandle,
    ) -> Result<()> {
        self.driver
            .stop_container(from, source, self.config.migration.cutover_stop_timeout())
            .await?;
        // The transferred archive is as old as the preparing phase; the
        // blackout window syncs whatever the source wrote since, source
        // agent out and target agent in.
        let staging = format!(
            "{}/{}.tar",
            self.config.migration.staging_dir, workload_id
        );
        self.driver.copy_volume_out(from, source, &staging).await?;
        self.driver.copy_in(to, target, &staging, "/data").await?;
        self.driver.start_container(to, target).await?;
        health::wait_ready(&self.driver, to, target, &self.config.probe).await
    }

    /// Undo a failed cutover: tear the target down, release its
    /// reservation, and bring the source back up from its retained volume.
    async fn rollback(
        &self,
        workload: &Workload,
        from: &NodeId,
        source: &ContainerHandle,
        to: &NodeId,
        target: &ContainerHandle,
    ) {
        info!("rolling back migration of {} to {}", workload.id, to);
        let _ = self.driver.stop_container(to, target, Duration::from_secs(5)).await;
        let _ = self.driver.remove_container(to, target).await;
        if let Err(e) = self.registry.abort_move(&workload.id, to) {
            warn!("rollback accounting for {} failed: {}", workload.id, e);
        }

        match self.driver.start_container(from, source).await {
            Ok(()) => {
                if let Err(e) =
                    health::wait_ready(&self.driver, from, source, &self.config.probe).await
                {
                    warn!("source of {} unhealthy after rollback: {}", workload.id, e);
                }
            }
            Err(e) => {
                warn!("source restart of {} failed after rollback: {}", workload.id, e);
                let _ = self.registry.set_status(&workload.id, WorkloadStatus::Error);
                let _ = self.registry.update_workload(&workload.id, |w| {
                    w.error_reason = Some(format!("rollback restart failed: {}", e));
                });
            }
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn advance(&self, id: &MigrationId, status: MigrationStatus, progress: u8) -> Result<()> {
        let mut op = self
            .ops
            .get_mut(id)
            .ok_or_else(|| Error::not_found("migration", id))?;
        if op.started_at.is_none() && status.is_active() {
            op.started_at = Some(Utc::now());
            self.bus.publish(ConductorEvent::MigrationStarted {
                migration_id: op.id.clone(),
                workload_id: op.workload_id.clone(),
                from_node: op.from_node.clone(),
                to_node: op.to_node.clone(),
                reason: op.reason,
            });
        }
        op.status = status;
        op.progress = progress;
        self.persist.migration(&op);
        self.bus.publish(ConductorEvent::MigrationProgress {
            migration_id: op.id.clone(),
            status,
            progress,
        });
        Ok(())
    }

    fn finalize(&self, id: MigrationId, status: MigrationStatus, error: Option<String>) {
        let Some(mut op) = self.ops.get_mut(&id) else {
            return;
        };
        op.status = status;
        op.completed_at = Some(Utc::now());
        op.error = error.clone();
        if status == MigrationStatus::Completed {
            op.progress = 100;
        }
        self.persist.migration(&op);

        let event = match status {
            MigrationStatus::Completed => ConductorEvent::MigrationCompleted {
                migration_id: op.id.clone(),
                workload_id: op.workload_id.clone(),
            },
            _ => ConductorEvent::MigrationFailed {
                migration_id: op.id.clone(),
                workload_id: op.workload_id.clone(),
                error: error.unwrap_or_else(|| status.to_string()),
            },
        };
        self.bus.publish(event);
        let snapshot = op.clone();
        drop(op);
        self.note_cooldown(&snapshot);
    }

    /// Arm the cooldown after a completed or failed operation. The
    /// cooldown gates future non-manual submissions; manual ones bypass
    /// the check at submit time.
    fn note_cooldown(&self, op: &MigrationOperation) {
        if !matches!(
            op.status,
            MigrationStatus::Completed | MigrationStatus::Failed
        ) {
            return;
        }
        let finished = op.completed_at.unwrap_or_else(Utc::now);
        let until = finished + self.config.migration.cooldown();
        if until > Utc::now() {
            self.cooldowns.insert(op.workload_id.clone(), until);
        }
    }
}

