//! Consolidation planner
//!
//! Periodic controller that proposes migrations to vacate underutilized
//! cloud nodes so they can be released. Planning is a pure function over a
//! fleet snapshot; the planner loop applies claims, drains sources, and
//! hands the resulting operations to the migration coordinator.

use crate::config::{ConductorConfig, ConsolidationConfig};
use crate::domain::ports::NodeProvisionerRef;
use crate::domain::types::{
    MigrationOperation, MigrationReason, Node, NodeId, NodeKind, NodeLifecycle, Workload,
    WorkloadId,
};
use crate::migration::MigrationCoordinator;
use crate::placer::{self, PlacementConstraints};
use crate::registry::{ClaimOwner, DrainClaims, FleetRegistry};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Plan
// =============================================================================

/// A viable plan: every workload on the source finds a target and the
/// source becomes empty.
#[derive(Debug, Clone)]
pub struct ConsolidationPlan {
    pub source: NodeId,
    pub moves: Vec<(WorkloadId, NodeId)>,
    /// Hourly cost of the node the plan frees
    pub hourly_saving: f64,
}

/// Compute a planning round over a fleet snapshot. Pure: no registry, no
/// clocks beyond the passed `now`.
pub fn plan_round(
    nodes: &[Node],
    workloads: &[Workload],
    now: DateTime<Utc>,
    config: &ConsolidationConfig,
) -> Vec<ConsolidationPlan> {
    // Abort outright when the fleet is too loaded to pack tighter.
    let (usable, allocated) = nodes
        .iter()
        .filter(|n| n.kind.is_worker())
        .fold((0u64, 0u64), |(u, a), n| {
            (u + n.usable_ram_mb(), a + n.allocated_ram_mb)
        });
    if usable == 0 || allocated as f64 / usable as f64 > config.max_capacity {
        return Vec::new();
    }

    let mut homed: HashMap<&NodeId, Vec<&Workload>> = HashMap::new();
    for workload in workloads {
        if let Some(node_id) = &workload.node_id {
            homed.entry(node_id).or_default().push(workload);
        }
    }

    // Candidate sources: occupied active cloud nodes, lowest load first.
    let mut sources: Vec<&Node> = nodes
        .iter()
        .filter(|n| {
            n.kind == NodeKind::Cloud
                && n.lifecycle == NodeLifecycle::Active
                && homed.get(&n.id).map_or(false, |ws| !ws.is_empty())
        })
        .collect();
    sources.sort_by_key(|n| (n.allocated_ram_mb, n.id.clone()));

    // Simulated accounting the round packs into.
    let mut sim: HashMap<NodeId, Node> = nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();
    let mut freed: HashSet<NodeId> = HashSet::new();
    let mut used_targets: HashSet<NodeId> = HashSet::new();
    let mut plans = Vec::new();

    'sources: for source in sources {
        // Draining a node that other plans pack into would undo them.
        if used_targets.contains(&source.id) {
            continue;
        }

        let Some(residents) = homed.get(&source.id) else {
            continue;
        };
        // A single refusing workload pins the whole node.
        for workload in residents {
            if placer::consolidation_eligible(workload, now, config).is_err() {
                debug!(
                    "node {} pinned by workload {} ({})",
                    source.id, workload.id, workload.migration_mode
                );
                continue 'sources;
            }
        }

        // First-fit-decreasing onto the other cloud nodes.
        let mut residents: Vec<&Workload> = residents.clone();
        residents.sort_by_key(|w| (std::cmp::Reverse(w.actual_ram_mb), w.id.clone()));

        let mut excluded: HashSet<NodeId> = freed.clone();
        excluded.insert(source.id.clone());
        let constraints = PlacementConstraints {
            exclude_nodes: excluded,
            require_kind: Some(NodeKind::Cloud),
        };

        let mut staged = sim.clone();
        let mut moves = Vec::new();
        let mut viable = true;
        for workload in &residents {
            match pick_target(staged.values(), workload, &constraints) {
                Some(target) => {
                    if let Some(node) = staged.get_mut(&target) {
                        node.allocated_ram_mb += workload.actual_ram_mb;
                        node.container_count += 1;
                    }
                    moves.push((workload.id.clone(), target));
                }
                None => {
                    viable = false;
                    break;
                }
            }
        }
        if !viable {
            continue;
        }

        for (_, target) in &moves {
            used_targets.insert(target.clone());
        }
        freed.insert(source.id.clone());
        sim = staged;
        plans.push(ConsolidationPlan {
            source: source.id.clone(),
            moves,
            hourly_saving: source.hourly_cost,
        });
    }

    plans
}

/// Target choice for consolidation: the placer's hard filters, ranked
/// tightest fit first. Packing into the fullest node keeps the light nodes
/// releasable in the same round.
fn pick_target<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    workload: &Workload,
    constraints: &PlacementConstraints,
) -> Option<NodeId> {
    nodes
        .into_iter()
        .filter(|n| placer::is_candidate(n, workload.actual_ram_mb, constraints))
        .min_by_key(|n| (n.free_ram_mb(), n.id.clone()))
        .map(|n| n.id.clone())
}

// =============================================================================
// Planner Loop
// =============================================================================

/// Applies planning rounds to the live fleet
pub struct ConsolidationPlanner {
    registry: Arc<FleetRegistry>,
    coordinator: Arc<MigrationCoordinator>,
    provisioner: NodeProvisionerRef,
    claims: Arc<DrainClaims>,
    config: Arc<ConductorConfig>,
}

impl ConsolidationPlanner {
    pub fn new(
        registry: Arc<FleetRegistry>,
        coordinator: Arc<MigrationCoordinator>,
        provisioner: NodeProvisionerRef,
        claims: Arc<DrainClaims>,
        config: Arc<ConductorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            coordinator,
            provisioner,
            claims,
            config,
        })
    }

    /// Run the planning loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.consolidation.interval_secs.max(1));
        info!(
            "consolidation planner running (level {})",
            self.config.consolidation.optimization_level
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("consolidation planner stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.tick().await;
        }
    }

    /// One planning round
    pub async fn tick(&self) {
        self.reap_drained().await;

        let level = self.config.consolidation.optimization_level;
        if level == 0 {
            return;
        }

        let (nodes, workloads) = self.registry.snapshot();
        let plans = plan_round(&nodes, &workloads, Utc::now(), &self.config.consolidation);
        if plans.is_empty() {
            debug!("no viable consolidation plans this round");
            return;
        }
        if self.config.consolidation.require_freed_threshold
            && plans.len() < self.config.consolidation.freed_node_threshold
        {
            debug!(
                "round frees only {} nodes, below the {}-node threshold",
                plans.len(),
                self.config.consolidation.freed_node_threshold
            );
            return;
        }

        info!(
            "consolidation round: {} plans freeing {} nodes",
            plans.len(),
            plans.len()
        );
        for plan in plans {
            self.apply_plan(plan, level).await;
        }
    }

    async fn apply_plan(&self, plan: ConsolidationPlan, level: u8) {
        let execute = level >= 2;

        if execute {
            if !self.claims.try_claim(&plan.source, ClaimOwner::Consolidator) {
                debug!("source {} already claimed, skipping plan", plan.source);
                return;
            }
            // Drain the source so nothing new lands while it empties.
            if let Err(e) = self
                .registry
                .set_lifecycle(&plan.source, NodeLifecycle::Draining)
            {
                warn!("drain of consolidation source {} failed: {}", plan.source, e);
                self.claims.release(&plan.source, ClaimOwner::Consolidator);
                return;
            }
        }

        for (workload_id, target) in plan.moves {
            let mut op = MigrationOperation::new(
                self.coordinator.next_id(),
                workload_id,
                plan.source.clone(),
                target,
                MigrationReason::CostOptimization,
                self.config.migration.max_retries,
                "consolidation-planner",
            );
            op.saved_hourly_cost = Some(plan.hourly_saving);
            op.saved_monthly_cost = Some(plan.hourly_saving * 24.0 * 30.0);

            if execute {
                if let Err(e) = self.coordinator.submit(op) {
                    warn!("consolidation submit failed: {}", e);
                }
            } else {
                self.coordinator.record_suggestion(op);
            }
        }
    }

    /// Release consolidation sources that finished emptying
    async fn reap_drained(&self) {
        for node_id in self.claims.owned_by(ClaimOwner::Consolidator) {
            let Some(node) = self.registry.get_node(&node_id) else {
                self.claims.release(&node_id, ClaimOwner::Consolidator);
                continue;
            };
            if !self.registry.node_is_empty(&node_id) {
                continue;
            }

            if let Some(provider_id) = &node.provider_id {
                if let Err(e) = self.provisioner.release(provider_id).await {
                    warn!("release of consolidated node {} failed: {}", node_id, e);
                    continue;
                }
            }
            let result = self
                .registry
                .set_lifecycle(&node_id, NodeLifecycle::Terminating)
                .and_then(|_| self.registry.remove_node(&node_id).map(|_| ()));
            match result {
                Ok(()) => {
                    self.claims.release(&node_id, ClaimOwner::Consolidator);
                    info!("consolidation freed node {}", node_id);
                }
                Err(e) => warn!("removal of consolidated node {} failed: {}", node_id, e),
            }
        }
    }
}
