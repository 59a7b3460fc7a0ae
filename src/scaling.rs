//! Scaling engine
//!
//! Periodic controller over the count of cloud nodes. Scale-up triggers on
//! fleet capacity or a persistently non-empty start queue; scale-down
//! drains the least-loaded empty cloud node and releases it after it stays
//! empty for consecutive ticks. Dedicated nodes are never scaled down. A
//! disabled engine observes and reports but makes no provisioning calls.

use crate::config::ConductorConfig;
use crate::domain::ports::{NodeProvisionerRef, NodeSize};
use crate::domain::types::{
    cloud_system_reserve_mb, Node, NodeHealth, NodeId, NodeKind, NodeLifecycle, Tier,
};
use crate::error::Result;
use crate::migration::ActiveMigrations;
use crate::registry::{ClaimOwner, DrainClaims, FleetRegistry, NodeFilter};
use crate::startqueue::StartQueue;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ScalingState {
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
    /// Consecutive ticks the start queue was non-empty
    queue_nonempty_ticks: u32,
    /// Consecutive ticks each draining node has been empty
    drain_empty_ticks: HashMap<NodeId, u32>,
}

/// Adjusts the cloud node count against fleet capacity signals
pub struct ScalingEngine {
    registry: Arc<FleetRegistry>,
    provisioner: NodeProvisionerRef,
    queue: Arc<StartQueue>,
    claims: Arc<DrainClaims>,
    active_migrations: Arc<ActiveMigrations>,
    config: Arc<ConductorConfig>,
    state: Mutex<ScalingState>,
}

impl ScalingEngine {
    pub fn new(
        registry: Arc<FleetRegistry>,
        provisioner: NodeProvisionerRef,
        queue: Arc<StartQueue>,
        claims: Arc<DrainClaims>,
        active_migrations: Arc<ActiveMigrations>,
        config: Arc<ConductorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            provisioner,
            queue,
            claims,
            active_migrations,
            config,
            state: Mutex::new(ScalingState::default()),
        })
    }

    /// Run the tick loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.scaling.check_interval_secs.max(1));
        info!(
            "scaling engine running (enabled: {})",
            self.config.scaling.enabled
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scaling engine stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.tick().await;
        }
    }

    /// One control tick
    pub async fn tick(&self) {
        let stats = self.registry.fleet_stats();
        let capacity = stats.capacity_fraction();
        let queue_depth = self.queue.len();

        let queue_pressure = {
            let mut state = self.state.lock();
            if queue_depth > 0 {
                state.queue_nonempty_ticks += 1;
            } else {
                state.queue_nonempty_ticks = 0;
            }
            state.queue_nonempty_ticks > 1
        };

        debug!(
            "scaling tick: capacity {:.1}%, queue depth {}, cloud nodes {}, demand {:?}",
            capacity * 100.0,
            queue_depth,
            stats.cloud.nodes,
            self.pending_tier_histogram()
        );
        self.registry.publish_fleet_stats();

        if !self.config.scaling.enabled {
            return;
        }

        self.reap_draining().await;

        let scaling = &self.config.scaling;
        if capacity > scaling.scale_up_threshold || queue_pressure {
            if let Err(e) = self.try_scale_up().await {
                warn!("scale-up failed: {}", e);
            }
        } else if capacity < scaling.scale_down_threshold {
            self.try_scale_down();
        }
    }

    // =========================================================================
    // Scale Up
    // =========================================================================

    async fn try_scale_up(&self) -> Result<()> {
        let now = Utc::now();
        let scaling = &self.config.scaling;
        {
            let state = self.state.lock();
            if let Some(last) = state.last_scale_up {
                let since = now.signed_duration_since(last).num_seconds();
                if since < scaling.min_between_scale_ups_secs as i64 {
                    debug!("scale-up cooldown, {}s since last", since);
                    return Ok(());
                }
            }
        }

        let cloud_count = self
            .registry
            .list_nodes(&NodeFilter {
                kind: Some(NodeKind::Cloud),
                ..Default::default()
            })
            .len();
        if cloud_count >= scaling.max_cloud_nodes {
            debug!("cloud fleet at its {}-node ceiling", scaling.max_cloud_nodes);
            return Ok(());
        }

        // Size the node to the largest tier waiting in the queue.
        let largest_pending = self.largest_pending_ram_mb();
        let ram_mb = scaling.cloud_node_ram_mb.max(largest_pending * 2);

        let mut labels = BTreeMap::new();
        labels.insert("role".to_string(), "worker".to_string());
        let descriptor = self
            .provisioner
            .provision(
                NodeSize {
                    ram_mb,
                    cpus: scaling.cloud_node_cpus,
                },
                labels,
            )
            .await?;

        let node_id = NodeId::new(format!("cloud-{}", descriptor.provider_id));
        let reserve = cloud_system_reserve_mb(
            descriptor.total_ram_mb,
            self.config.placement.cloud_reserve_base_mb,
            self.config.placement.cloud_reserve_percent,
        );
        let mut node = Node::new(
            node_id.clone(),
            NodeKind::Cloud,
            descriptor.ip.clone(),
            descriptor.total_ram_mb,
            reserve,
            descriptor.total_cpus,
            descriptor.hourly_cost,
        );
        node.provider_id = Some(descriptor.provider_id.clone());
        node.labels = descriptor.labels.clone();
        // The provisioner only returns after the readiness handshake.
        node.health = NodeHealth::Healthy;

        self.registry.register(node)?;
        self.registry.set_lifecycle(&node_id, NodeLifecycle::Ready)?;
        self.registry.set_lifecycle(&node_id, NodeLifecycle::Active)?;

        self.state.lock().last_scale_up = Some(now);
        info!(
            "provisioned cloud node {} ({} MB, {} usable)",
            node_id,
            descriptor.total_ram_mb,
            descriptor.total_ram_mb - reserve
        );
        Ok(())
    }

    /// RAM of the largest tier currently waiting for placement
    fn largest_pending_ram_mb(&self) -> u64 {
        self.queue
            .snapshot()
            .iter()
            .filter_map(|entry| self.registry.get_workload(&entry.workload_id))
            .map(|w| w.actual_ram_mb)
            .max()
            .unwrap_or(0)
    }

    /// Demand histogram of the queued workloads by tier
    fn pending_tier_histogram(&self) -> BTreeMap<Tier, usize> {
        let mut histogram = BTreeMap::new();
        for entry in self.queue.snapshot() {
            if let Some(workload) = self.registry.get_workload(&entry.workload_id) {
                *histogram.entry(workload.tier).or_insert(0) += 1;
            }
        }
        histogram
    }

    // =========================================================================
    // Scale Down
    // =========================================================================

    fn try_scale_down(&self) {
        // Consolidation owns in-flight moves; releasing capacity under it
        // would fight the planner's targets.
        if self.active_migrations.count() > 0 {
            debug!("scale-down deferred, migrations in flight");
            return;
        }
        let now = Utc::now();
        {
            let state = self.state.lock();
            if let Some(last) = state.last_scale_down {
                let since = now.signed_duration_since(last).num_seconds();
                if since < self.config.scaling.min_between_scale_downs_secs as i64 {
                    return;
                }
            }
        }

        // Least-loaded empty cloud node, stable by id.
        let candidate = self
            .registry
            .list_nodes(&NodeFilter {
                kind: Some(NodeKind::Cloud),
                lifecycle: Some(NodeLifecycle::Active),
                ..Default::default()
            })
            .into_iter()
            .filter(|n| self.registry.node_is_empty(&n.id) && !self.claims.is_claimed(&n.id))
            .min_by_key(|n| (n.allocated_ram_mb, n.id.clone()));

        let Some(node) = candidate else {
            debug!("no empty cloud node to drain");
            return;
        };

        if !self.claims.try_claim(&node.id, ClaimOwner::Scaler) {
            return;
        }
        match self.registry.set_lifecycle(&node.id, NodeLifecycle::Draining) {
            Ok(()) => {
                info!("draining cloud node {} for scale-down", node.id);
                self.state.lock().drain_empty_ticks.insert(node.id, 0);
            }
            Err(e) => {
                warn!("drain of {} failed: {}", node.id, e);
                self.claims.release(&node.id, ClaimOwner::Scaler);
            }
        }
    }

    /// Release draining nodes that stayed empty long enough
    async fn reap_draining(&self) {
        for node_id in self.claims.owned_by(ClaimOwner::Scaler) {
            let Some(node) = self.registry.get_node(&node_id) else {
                self.claims.release(&node_id, ClaimOwner::Scaler);
                continue;
            };

            if !self.registry.node_is_empty(&node_id) {
                // Something landed back; a draining node takes no new
                // placements, so this is a parked volume waking up.
                self.state.lock().drain_empty_ticks.insert(node_id, 0);
                continue;
            }

            let ticks = {
                let mut state = self.state.lock();
                let ticks = state.drain_empty_ticks.entry(node_id.clone()).or_insert(0);
                *ticks += 1;
                *ticks
            };
            if ticks < self.config.scaling.drain_empty_ticks {
                continue;
            }

            if let Err(e) = self.release_node(&node).await {
                warn!("release of drained node {} failed: {}", node_id, e);
            }
        }
    }

    async fn release_node(&self, node: &Node) -> Result<()> {
        if let Some(provider_id) = &node.provider_id {
            self.provisioner.release(provider_id).await?;
        }
        self.registry
            .set_lifecycle(&node.id, NodeLifecycle::Terminating)?;
        self.registry.remove_node(&node.id)?;
        self.claims.release(&node.id, ClaimOwner::Scaler);
        let mut state = self.state.lock();
        state.drain_empty_ticks.remove(&node.id);
        state.last_scale_down = Some(Utc::now());
        info!("released cloud node {}", node.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{NodeDescriptor, NodeProvisioner};
    use crate::domain::types::WorkloadId;
    use crate::error::Error;
    use crate::events::EventBus;
    use crate::persist::PersistHandle;
    use crate::testutil;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Provisioner that mints nodes and counts calls
    struct CountingProvisioner {
        provisions: AtomicU64,
        releases: AtomicU64,
        ram_of_last: AtomicU64,
    }

    impl CountingProvisioner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                provisions: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                ram_of_last: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl NodeProvisioner for CountingProvisioner {
        async fn provision(
            &self,
            size: NodeSize,
            labels: BTreeMap<String, String>,
        ) -> crate::error::Result<NodeDescriptor> {
            let n = self.provisions.fetch_add(1, Ordering::SeqCst);
            self.ram_of_last.store(size.ram_mb, Ordering::SeqCst);
            Ok(NodeDescriptor {
                provider_id: format!("p-{}", n),
                ip: format!("10.1.0.{}", n + 1),
                total_ram_mb: size.ram_mb,
                total_cpus: size.cpus,
                hourly_cost: 0.10,
                labels,
            })
        }

        async fn release(&self, _provider_id: &str) -> crate::error::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list(&self) -> crate::error::Result<Vec<NodeDescriptor>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        registry: Arc<FleetRegistry>,
        provisioner: Arc<CountingProvisioner>,
        queue: Arc<StartQueue>,
        engine: Arc<ScalingEngine>,
    }

    fn fixture(config: ConductorConfig) -> Fixture {
        let bus = EventBus::new(256);
        let registry = FleetRegistry::new(bus.clone(), PersistHandle::noop());
        let provisioner = CountingProvisioner::new();
        let queue = StartQueue::new(bus);
        let engine = ScalingEngine::new(
            registry.clone(),
            provisioner.clone(),
            queue.clone(),
            Arc::new(DrainClaims::new()),
            Arc::new(ActiveMigrations::new()),
            Arc::new(config),
        );
        Fixture {
            registry,
            provisioner,
            queue,
            engine,
        }
    }

    #[tokio::test]
    async fn test_scale_up_on_capacity() {
        let f = fixture(ConductorConfig::default());
        f.registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 15000))
            .unwrap();

        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 1);

        // Cooldown holds the second provision back.
        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scale_up_on_queue_pressure_sized_to_pending_tier() {
        let f = fixture(ConductorConfig::default());
        f.registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 8192))
            .unwrap();

        let mut big = testutil::workload("w-big", 16384);
        big.status = crate::domain::types::WorkloadStatus::Queued;
        f.registry.insert_workload(big).unwrap();
        f.queue.enqueue(WorkloadId::new("w-big"), "owner-1");

        // Capacity is fine; pressure needs more than one non-empty tick.
        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 0);
        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 1);
        // Sized to twice the largest pending tier.
        assert_eq!(f.provisioner.ram_of_last.load(Ordering::SeqCst), 32768);
    }

    #[tokio::test]
    async fn test_disabled_engine_observes_only() {
        let mut config = ConductorConfig::default();
        config.scaling.enabled = false;
        let f = fixture(config);
        f.registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 16000))
            .unwrap();

        f.engine.tick().await;
        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scale_down_drains_then_releases() {
        let mut config = ConductorConfig::default();
        config.scaling.drain_empty_ticks = 2;
        let f = fixture(config);
        // One busy node and one empty node: capacity well below 30%.
        f.registry
            .register(testutil::active_node("n-busy", NodeKind::Cloud, 16384, 2048))
            .unwrap();
        f.registry
            .register(testutil::active_node("n-idle", NodeKind::Cloud, 16384, 0))
            .unwrap();
        let mut with_provider = f.registry.get_node(&NodeId::new("n-idle")).unwrap();
        with_provider.provider_id = Some("p-idle".into());
        // Re-register with provider id set.
        f.registry.remove_node(&NodeId::new("n-idle")).unwrap();
        f.registry.register(with_provider).unwrap();

        // Tick 1: the idle node starts draining.
        f.engine.tick().await;
        assert_eq!(
            f.registry.get_node(&NodeId::new("n-idle")).unwrap().lifecycle,
            NodeLifecycle::Draining
        );
        assert_eq!(f.provisioner.releases.load(Ordering::SeqCst), 0);

        // Two more empty ticks release it.
        f.engine.tick().await;
        f.engine.tick().await;
        assert_eq!(f.provisioner.releases.load(Ordering::SeqCst), 1);
        assert!(f.registry.get_node(&NodeId::new("n-idle")).is_none());
    }

    #[tokio::test]
    async fn test_dedicated_nodes_never_scaled_down() {
        let f = fixture(ConductorConfig::default());
        f.registry
            .register(testutil::active_node("n-d", NodeKind::Dedicated, 16384, 0))
            .unwrap();

        for _ in 0..4 {
            f.engine.tick().await;
        }
        assert_eq!(f.provisioner.releases.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.registry.get_node(&NodeId::new("n-d")).unwrap().lifecycle,
            NodeLifecycle::Active
        );
    }

    #[tokio::test]
    async fn test_full_fleet_queued_workload_lands_after_scale_up() {
        // Scenario: fleet full, workload queued, scaling provisions a node
        // the queued workload can land on.
        let f = fixture(ConductorConfig::default());
        f.registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 12288))
            .unwrap();
        f.registry
            .register(testutil::active_node("n-2", NodeKind::Cloud, 16384, 12288))
            .unwrap();

        let mut w = testutil::workload("w-q", 8192);
        w.status = crate::domain::types::WorkloadStatus::Queued;
        f.registry.insert_workload(w).unwrap();
        f.queue.enqueue(WorkloadId::new("w-q"), "owner-1");

        // No node has 8 GB free.
        assert!(matches!(
            f.registry.place(
                &WorkloadId::new("w-q"),
                &crate::placer::PlacementConstraints::default()
            ),
            Err(Error::NoCapacity { .. })
        ));

        // Queue pressure builds over two ticks, then a node is provisioned.
        f.engine.tick().await;
        f.engine.tick().await;
        assert_eq!(f.provisioner.provisions.load(Ordering::SeqCst), 1);

        let placed = f
            .registry
            .place(
                &WorkloadId::new("w-q"),
                &crate::placer::PlacementConstraints::default(),
            )
            .unwrap();
        assert!(placed.as_str().starts_with("cloud-"));
    }
}
