//! Shared test fixtures

use crate::domain::types::*;
use chrono::Utc;

/// A healthy, active node ready to take placements
pub(crate) fn active_node(id: &str, kind: NodeKind, usable_mb: u64, allocated_mb: u64) -> Node {
    let mut node = Node::new(id, kind, format!("10.0.0.{}", id.len()), usable_mb, 0, 8, 0.12);
    node.health = NodeHealth::Healthy;
    node.lifecycle = NodeLifecycle::Active;
    node.allocated_ram_mb = allocated_mb;
    node
}

/// A stopped payperplay workload with the given RAM, tier derived
pub(crate) fn workload(id: &str, ram_mb: u64) -> Workload {
    Workload {
        id: WorkloadId::new(id),
        owner_id: "owner-1".into(),
        name: format!("{}-server", id),
        image: "gameserver:latest".into(),
        requested_ram_mb: ram_mb,
        actual_ram_mb: ram_mb,
        storage_mb: 10240,
        tier: classify_tier(ram_mb),
        plan: Plan::PayPerPlay,
        status: WorkloadStatus::Stopped,
        phase: LifecyclePhase::Active,
        node_id: None,
        placement_active: false,
        container: None,
        port: None,
        idle_timeout_secs: 900,
        auto_shutdown: true,
        last_activity: None,
        last_started: None,
        last_stopped: None,
        player_count: 0,
        player_count_at: None,
        migration_mode: MigrationMode::Always,
        archive_backup_id: None,
        archive_location: None,
        error_reason: None,
        created_at: Utc::now(),
    }
}
