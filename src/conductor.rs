//! The conductor
//!
//! Wires the registries, queue, engines, and coordinator to the ports,
//! rebuilds state from the repository at startup, runs the control loops,
//! and exposes the user operations and the observer surface.

use crate::config::ConductorConfig;
use crate::domain::ports::{BackupPortRef, HostDriverRef, NodeProvisionerRef, RepositoryRef};
use crate::domain::types::{
    actual_ram_mb, classify_tier, LifecyclePhase, MigrationId, MigrationOperation,
    MigrationReason, MigrationMode, Node, NodeHealth, NodeId, Plan, UsageSession, Workload,
    WorkloadId, WorkloadStatus,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscriber};
use crate::lifecycle::{self, BillingRecorder, LifecycleEngine, StopReason, WakeupOutcome};
use crate::migration::{ActiveMigrations, MigrationCoordinator};
use crate::persist;
use crate::placer::{self, PlacementConstraints};
use crate::registry::{ContainerFilter, DrainClaims, FleetRegistry, FleetStats, NodeFilter};
use crate::scaling::ScalingEngine;
use crate::startqueue::{Dispatcher, StartQueue};
use crate::sync::WorkloadLocks;
use crate::consolidation::ConsolidationPlanner;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

// =============================================================================
// Wiring
// =============================================================================

/// The external collaborators the conductor consumes
#[derive(Clone)]
pub struct ConductorPorts {
    pub repository: RepositoryRef,
    pub driver: HostDriverRef,
    pub provisioner: NodeProvisionerRef,
    pub backup: BackupPortRef,
}

/// Request to create a workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkloadRequest {
    pub owner_id: String,
    pub name: String,
    pub image: String,
    pub ram_mb: u64,
    pub plan: Plan,
    pub migration_mode: MigrationMode,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_shutdown: bool,
    #[serde(default = "default_storage_mb")]
    pub storage_mb: u64,
}

fn default_true() -> bool {
    true
}

fn default_storage_mb() -> u64 {
    10240
}

/// Aggregate view for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorStatus {
    pub fleet: FleetStats,
    pub queued: usize,
    pub active_migrations: usize,
    pub workload_count: usize,
    pub scaling_enabled: bool,
    pub optimization_level: u8,
}

// =============================================================================
// Conductor
// =============================================================================

/// Top-level control plane object
pub struct Conductor {
    pub(crate) config: Arc<ConductorConfig>,
    pub(crate) bus: EventBus,
    pub(crate) registry: Arc<FleetRegistry>,
    pub(crate) repository: RepositoryRef,
    pub(crate) queue: Arc<StartQueue>,
    pub(crate) active: Arc<ActiveMigrations>,
    pub(crate) lifecycle: Arc<LifecycleEngine>,
    pub(crate) coordinator: Arc<MigrationCoordinator>,
    pub(crate) scaling: Arc<ScalingEngine>,
    pub(crate) consolidation: Arc<ConsolidationPlanner>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    workload_counter: AtomicU64,
}

impl Conductor {
    /// Build the control plane: spawn the persistence flusher, rebuild the
    /// registries from the repository, rehydrate in-flight migrations, and
    /// wire every loop. Loops do not run until [`start`] is called.
    ///
    /// [`start`]: Conductor::start
    pub async fn build(config: ConductorConfig, ports: ConductorPorts) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let (persist, flusher) = persist::spawn_flusher(ports.repository.clone(), cancel.child_token());
        let bus = EventBus::new(config.events.capacity);
        let registry = FleetRegistry::new(bus.clone(), persist.clone());

        let recovered = persist::rebuild(&ports.repository).await?;
        let workload_seed = recovered
            .workloads
            .iter()
            .filter_map(|w| w.id.as_str().strip_prefix("wl-"))
            .filter_map(|hex| u64::from_str_radix(hex, 16).ok())
            .max()
            .unwrap_or(0)
            + 1;
        let queued: Vec<(WorkloadId, String)> = recovered
            .workloads
            .iter()
            .filter(|w| w.status == WorkloadStatus::Queued)
            .map(|w| (w.id.clone(), w.owner_id.clone()))
            .collect();
        let running: Vec<Workload> = recovered
            .workloads
            .iter()
            .filter(|w| w.status == WorkloadStatus::Running)
            .cloned()
            .collect();
        registry.load(recovered.nodes, recovered.workloads);

        let billing = Arc::new(BillingRecorder::new(persist.clone(), config.billing));
        for workload in &running {
            billing.reopen_session(workload);
        }

        let locks = Arc::new(WorkloadLocks::new());
        let active = Arc::new(ActiveMigrations::new());
        let claims = Arc::new(DrainClaims::new());
        let queue = StartQueue::new(bus.clone());
        for (id, owner) in queued {
            queue.enqueue(id, owner);
        }

        let coordinator = MigrationCoordinator::new(
            registry.clone(),
            ports.driver.clone(),
            ports.backup.clone(),
            persist.clone(),
            bus.clone(),
            locks.clone(),
            active.clone(),
            config.clone(),
        );
        coordinator.rehydrate(recovered.migrations);

        let dispatcher = Arc::new(Dispatcher {
            registry: registry.clone(),
            queue: queue.clone(),
            driver: ports.driver.clone(),
            billing: billing.clone(),
            locks: locks.clone(),
            config: config.clone(),
        });

        let lifecycle = LifecycleEngine::new(
            registry.clone(),
            ports.repository.clone(),
            queue.clone(),
            ports.driver.clone(),
            ports.backup.clone(),
            billing.clone(),
            locks.clone(),
            active.clone(),
            config.clone(),
        );

        let scaling = ScalingEngine::new(
            registry.clone(),
            ports.provisioner.clone(),
            queue.clone(),
            claims.clone(),
            active.clone(),
            config.clone(),
        );

        let consolidation = ConsolidationPlanner::new(
            registry.clone(),
            coordinator.clone(),
            ports.provisioner.clone(),
            claims.clone(),
            config.clone(),
        );

        let conductor = Arc::new(Self {
            config,
            bus,
            registry,
            repository: ports.repository.clone(),
            queue,
            active,
            lifecycle,
            coordinator,
            scaling,
            consolidation,
            dispatcher,
            cancel,
            tasks: Mutex::new(vec![flusher]),
            workload_counter: AtomicU64::new(workload_seed),
        });
        info!("conductor built");
        Ok(conductor)
    }

    /// Spawn every control loop
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.dispatcher.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.lifecycle.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.scaling.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.consolidation.clone().run(self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.coordinator.clone().run(self.cancel.child_token()),
        ));
        info!("conductor control loops started");
    }

    /// Stop every loop and wait for them to drain
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        join_all(tasks).await;
        info!("conductor shut down");
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Register a node from static configuration
    pub fn register_node(&self, node: Node) -> Result<()> {
        self.registry.register(node)
    }

    /// Ingest a node health report
    pub fn report_node_health(&self, id: &NodeId, health: NodeHealth) -> Result<()> {
        self.registry.update_health(id, health, Utc::now())
    }

    /// Drain a node for maintenance; existing workloads keep running but
    /// nothing new lands on it.
    pub fn drain_node(&self, id: &NodeId) -> Result<()> {
        self.registry
            .set_lifecycle(id, crate::domain::types::NodeLifecycle::Draining)
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Create a workload record and queue its first start
    pub fn create_workload(&self, request: CreateWorkloadRequest) -> Result<Workload> {
        if request.ram_mb == 0 {
            return Err(Error::Configuration("workload needs RAM".into()));
        }
        let n = self.workload_counter.fetch_add(1, Ordering::SeqCst);
        let id = WorkloadId::new(format!("wl-{:08x}", n));

        let workload = Workload {
            id: id.clone(),
            owner_id: request.owner_id.clone(),
            name: request.name,
            image: request.image,
            requested_ram_mb: request.ram_mb,
            actual_ram_mb: actual_ram_mb(
                request.ram_mb,
                self.config.placement.ram_overhead_percent,
            ),
            storage_mb: request.storage_mb,
            tier: classify_tier(request.ram_mb),
            plan: request.plan,
            status: WorkloadStatus::Queued,
            phase: LifecyclePhase::Active,
            node_id: None,
            placement_active: false,
            container: None,
            port: None,
            idle_timeout_secs: request
                .idle_timeout_secs
                .unwrap_or(self.config.lifecycle.default_idle_timeout_secs),
            auto_shutdown: request.auto_shutdown,
            last_activity: None,
            last_started: None,
            last_stopped: None,
            player_count: 0,
            player_count_at: None,
            migration_mode: request.migration_mode,
            archive_backup_id: None,
            archive_location: None,
            error_reason: None,
            created_at: Utc::now(),
        };

        self.registry.insert_workload(workload.clone())?;
        self.queue.enqueue(id, request.owner_id);
        Ok(workload)
    }

    pub async fn start_workload(&self, id: &WorkloadId) -> Result<()> {
        self.lifecycle.start_workload(id).await
    }

    pub async fn stop_workload(&self, id: &WorkloadId) -> Result<Workload> {
        self.lifecycle.stop_workload(id, StopReason::User).await
    }

    pub async fn wakeup(&self, id: &WorkloadId) -> Result<WakeupOutcome> {
        self.lifecycle.wakeup(id).await
    }

    pub async fn delete_workload(&self, id: &WorkloadId) -> Result<()> {
        self.lifecycle.delete_workload(id).await
    }

    /// Ingest an activity heartbeat from the workload's host agent
    pub fn record_activity(&self, id: &WorkloadId, player_count: u32) -> Result<()> {
        self.registry.record_activity(id, player_count, Utc::now())
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Submit a manual migration. Without an explicit target the placer
    /// picks one, excluding the current node.
    pub fn migrate_workload(
        &self,
        id: &WorkloadId,
        to: Option<NodeId>,
        actor: &str,
    ) -> Result<MigrationId> {
        let workload = self
            .registry
            .get_workload(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        let from = workload
            .node_id
            .clone()
            .ok_or_else(|| Error::InvalidState {
                entity: format!("workload {}", id),
                from: "unplaced".into(),
                to: "migrating".into(),
            })?;

        let target = match to {
            Some(target) => target,
            None => {
                let (nodes, _) = self.registry.snapshot();
                let constraints = PlacementConstraints {
                    exclude_nodes: HashSet::from([from.clone()]),
                    require_kind: None,
                };
                placer::select(nodes.iter(), &workload, &constraints)?
            }
        };

        let op = MigrationOperation::new(
            self.coordinator.next_id(),
            id.clone(),
            from,
            target,
            MigrationReason::Manual,
            self.config.migration.max_retries,
            actor,
        );
        self.coordinator.submit(op)
    }

    // =========================================================================
    // Billing and History
    // =========================================================================

    /// Closed usage sessions for a workload, the tenant's billing history
    pub async fn workload_usage(&self, id: &WorkloadId) -> Result<Vec<UsageSession>> {
        self.repository.usage_sessions(id).await
    }

    /// Migration history for a workload, oldest first
    pub async fn workload_migrations(&self, id: &WorkloadId) -> Result<Vec<MigrationOperation>> {
        self.repository.migrations_for(id).await
    }

    /// Historical cost up to `until`, reconstructed from the rates
    /// recorded on the billing events, never from current configuration.
    pub async fn workload_cost(&self, id: &WorkloadId, until: DateTime<Utc>) -> Result<f64> {
        let events = self.repository.billing_events(id).await?;
        lifecycle::total_cost(&events, until)
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    pub fn status(&self) -> ConductorStatus {
        ConductorStatus {
            fleet: self.registry.fleet_stats(),
            queued: self.queue.len(),
            active_migrations: self.active.count(),
            workload_count: self.registry.list_workloads(&ContainerFilter::default()).len(),
            scaling_enabled: self.config.scaling.enabled,
            optimization_level: self.config.consolidation.optimization_level,
        }
    }

    pub fn fleet_stats(&self) -> FleetStats {
        self.registry.fleet_stats()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.registry.list_nodes(&NodeFilter::default())
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.registry.list_workloads(&ContainerFilter::default())
    }

    /// Workloads waiting in the start queue
    pub fn queued_workloads(&self) -> Vec<Workload> {
        self.queue
            .snapshot()
            .iter()
            .filter_map(|entry| self.registry.get_workload(&entry.workload_id))
            .collect()
    }

    pub fn migrations(&self) -> Vec<MigrationOperation> {
        self.coordinator.list_operations()
    }
}
