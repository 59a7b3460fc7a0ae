//! Placement policy
//!
//! Pure functions over node and workload snapshots: candidate filtering,
//! deterministic ranking, and the migration-refusal policy. Keeping policy
//! free of registry state lets the consolidation planner and the tests run
//! it against plain vectors.

use crate::config::ConsolidationConfig;
use crate::domain::types::{
    MigrationMode, Node, NodeId, NodeKind, Plan, Tier, Workload, WorkloadStatus,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

// =============================================================================
// Constraints
// =============================================================================

/// Hard constraints a caller layers on top of the standard filters
#[derive(Debug, Clone, Default)]
pub struct PlacementConstraints {
    /// Nodes that must not be considered
    pub exclude_nodes: HashSet<NodeId>,
    /// Pin to a single node kind (system workloads pin to their own nodes)
    pub require_kind: Option<NodeKind>,
}

impl PlacementConstraints {
    pub fn excluding(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            exclude_nodes: nodes.into_iter().collect(),
            require_kind: None,
        }
    }
}

// =============================================================================
// Candidate Selection
// =============================================================================

/// Whether a node can take this many MB of new workload RAM at all
pub fn is_candidate(
    node: &Node,
    ram_mb: u64,
    constraints: &PlacementConstraints,
) -> bool {
    if constraints.exclude_nodes.contains(&node.id) {
        return false;
    }
    if let Some(kind) = constraints.require_kind {
        if node.kind != kind {
            return false;
        }
    }
    // Draining and unhealthy nodes accept no new placements.
    node.accepts_placements() && node.free_ram_mb() >= ram_mb
}

/// Deterministic ranking key, lower is better:
/// reserved-plan dedicated preference, packing efficiency (how evenly the
/// workload's RAM divides the remaining free RAM), hourly cost, container
/// count, then stable id as the tie-break.
fn rank_key(node: &Node, workload: &Workload) -> (u8, u64, u64, u32, NodeId) {
    let dedicated_pref = if workload.plan == Plan::Reserved && node.kind != NodeKind::Dedicated {
        1
    } else {
        0
    };
    let ram = workload.actual_ram_mb.max(1);
    let packing = (node.free_ram_mb() - workload.actual_ram_mb) % ram;
    let cost_millicents = (node.hourly_cost * 100_000.0).round() as u64;
    (
        dedicated_pref,
        packing,
        cost_millicents,
        node.container_count,
        node.id.clone(),
    )
}

/// Pick the node for a workload, or `NoCapacity` when no candidate passes
/// the hard filters. Deterministic for a given fleet snapshot.
pub fn select<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    workload: &Workload,
    constraints: &PlacementConstraints,
) -> Result<NodeId> {
    let mut candidates: Vec<&Node> = nodes
        .into_iter()
        .filter(|n| is_candidate(n, workload.actual_ram_mb, constraints))
        .collect();

    if candidates.is_empty() {
        return Err(Error::NoCapacity {
            reason: format!(
                "no node can take {} MB for workload {}",
                workload.actual_ram_mb, workload.id
            ),
        });
    }

    candidates.sort_by_key(|n| rank_key(n, workload));
    Ok(candidates[0].id.clone())
}

// =============================================================================
// Migration Policy
// =============================================================================

/// Whether consolidation may move this workload. Manual migrations bypass
/// this check entirely.
pub fn consolidation_eligible(
    workload: &Workload,
    now: DateTime<Utc>,
    config: &ConsolidationConfig,
) -> Result<()> {
    let denied = |reason: &str| {
        Err(Error::PolicyDenied {
            workload_id: workload.id.to_string(),
            action: "migration".into(),
            reason: reason.into(),
        })
    };

    if workload.plan == Plan::Reserved {
        return denied("reserved plan");
    }
    if workload.tier == Tier::Custom {
        return denied("custom tier");
    }
    match workload.migration_mode {
        MigrationMode::Never => denied("migration_mode=never"),
        MigrationMode::Always => Ok(()),
        MigrationMode::OnlyOffline => {
            if !matches!(
                workload.status,
                WorkloadStatus::Starting | WorkloadStatus::Running
            ) {
                return Ok(());
            }
            if config.allow_migration_with_players {
                return Ok(());
            }
            // A stale sample is unknown, not zero: refuse on the safe side.
            match workload.players_online(now, config.player_count_stale_secs) {
                Some(0) => Ok(()),
                Some(_) => denied("players online"),
                None => denied("player count unknown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{NodeHealth, NodeLifecycle};

    fn active_node(id: &str, usable_mb: u64, allocated_mb: u64) -> Node {
        crate::testutil::active_node(id, NodeKind::Cloud, usable_mb, allocated_mb)
    }

    fn workload_of(ram_mb: u64) -> Workload {
        crate::testutil::workload("w-1", ram_mb)
    }

    #[test]
    fn test_filters_unhealthy_and_draining() {
        let mut sick = active_node("n-sick", 16384, 0);
        sick.health = NodeHealth::Unhealthy;
        let mut draining = active_node("n-drain", 16384, 0);
        draining.lifecycle = NodeLifecycle::Draining;
        let good = active_node("n-good", 16384, 0);

        let nodes = vec![sick, draining, good];
        let chosen = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap();
        assert_eq!(chosen.as_str(), "n-good");
    }

    #[test]
    fn test_no_capacity_when_full() {
        let nodes = vec![active_node("n-1", 16384, 14336)];
        let err = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoCapacity { .. }));
    }

    #[test]
    fn test_deterministic_full_fleet_sequence() {
        // Two 16 GB nodes, both with 12 GB allocated: two 4 GB requests land
        // on each node in id order, a third finds no capacity.
        let mut nodes = vec![
            active_node("n-a", 16384, 12288),
            active_node("n-b", 16384, 12288),
        ];

        let first = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap();
        assert_eq!(first.as_str(), "n-a");
        nodes[0].allocated_ram_mb += 4096;
        nodes[0].container_count += 1;

        let second = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap();
        assert_eq!(second.as_str(), "n-b");
        nodes[1].allocated_ram_mb += 4096;
        nodes[1].container_count += 1;

        let third = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        );
        assert!(matches!(third, Err(Error::NoCapacity { .. })));
    }

    #[test]
    fn test_packing_prefers_even_fit() {
        // 4 GB workload: a node with exactly 4 GB free packs perfectly,
        // one with 6 GB free leaves a 2 GB remainder.
        let snug = active_node("n-snug", 16384, 12288);
        let loose = active_node("n-loose", 16384, 10240);
        let nodes = vec![loose, snug];

        let chosen = select(
            nodes.iter(),
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap();
        assert_eq!(chosen.as_str(), "n-snug");
    }

    #[test]
    fn test_cheaper_node_wins_on_packing_tie() {
        let mut pricey = active_node("n-a", 16384, 0);
        pricey.hourly_cost = 0.24;
        let mut cheap = active_node("n-b", 16384, 0);
        cheap.hourly_cost = 0.08;

        let chosen = select(
            [&pricey, &cheap],
            &workload_of(4096),
            &PlacementConstraints::default(),
        )
        .unwrap();
        assert_eq!(chosen.as_str(), "n-b");
    }

    #[test]
    fn test_reserved_plan_prefers_dedicated() {
        let cloud = active_node("n-a", 16384, 0);
        let mut dedicated = active_node("n-z", 16384, 0);
        dedicated.kind = NodeKind::Dedicated;
        // The dedicated node is more expensive and sorts later by id, but
        // a reserved-plan workload still prefers it.
        dedicated.hourly_cost = 0.50;

        let mut w = workload_of(4096);
        w.plan = Plan::Reserved;
        let chosen = select([&cloud, &dedicated], &w, &PlacementConstraints::default()).unwrap();
        assert_eq!(chosen.as_str(), "n-z");

        // A payperplay workload picks the cheaper cloud node instead.
        let w = workload_of(4096);
        let chosen = select([&cloud, &dedicated], &w, &PlacementConstraints::default()).unwrap();
        assert_eq!(chosen.as_str(), "n-a");
    }

    #[test]
    fn test_exclusion_constraint() {
        let nodes = vec![active_node("n-a", 16384, 0), active_node("n-b", 16384, 0)];
        let constraints = PlacementConstraints::excluding([NodeId::new("n-a")]);
        let chosen = select(nodes.iter(), &workload_of(4096), &constraints).unwrap();
        assert_eq!(chosen.as_str(), "n-b");
    }

    #[test]
    fn test_consolidation_policy_refusals() {
        let now = Utc::now();
        let config = ConsolidationConfig::default();

        let mut reserved = workload_of(4096);
        reserved.plan = Plan::Reserved;
        assert!(matches!(
            consolidation_eligible(&reserved, now, &config),
            Err(Error::PolicyDenied { .. })
        ));

        let mut custom = workload_of(3000);
        assert_eq!(custom.tier, Tier::Custom);
        custom.plan = Plan::Balanced;
        assert!(consolidation_eligible(&custom, now, &config).is_err());

        let mut never = workload_of(4096);
        never.migration_mode = MigrationMode::Never;
        assert!(consolidation_eligible(&never, now, &config).is_err());

        let movable = workload_of(4096);
        assert!(consolidation_eligible(&movable, now, &config).is_ok());
    }

    #[test]
    fn test_only_offline_with_players_and_staleness() {
        let now = Utc::now();
        let config = ConsolidationConfig::default();

        let mut w = workload_of(4096);
        w.migration_mode = MigrationMode::OnlyOffline;
        w.status = WorkloadStatus::Running;

        // Fresh zero-player sample: migration allowed.
        w.player_count = 0;
        w.player_count_at = Some(now - chrono::Duration::seconds(10));
        assert!(consolidation_eligible(&w, now, &config).is_ok());

        // Players online: refused.
        w.player_count = 2;
        assert!(consolidation_eligible(&w, now, &config).is_err());

        // Stale sample counts as unknown, refused.
        w.player_count = 0;
        w.player_count_at = Some(now - chrono::Duration::seconds(600));
        assert!(consolidation_eligible(&w, now, &config).is_err());

        // Offline workload moves regardless of samples.
        w.status = WorkloadStatus::Stopped;
        assert!(consolidation_eligible(&w, now, &config).is_ok());
    }
}
