//! Fleet registry
//!
//! The authoritative in-memory view of nodes and workloads. Both live
//! behind one placement lock: any mutation that touches the pair
//! `(node.allocated_ram, workload.placement)` happens while holding it,
//! which is what keeps resource accounting consistent without a
//! two-phase commit. Callers never touch those fields directly; they go
//! through the atomic operations in [`placement`].
//!
//! Repository writes are enqueued to the persistence flusher outside the
//! lock; reads return defensive copies.

pub mod claims;
mod container;
mod node;
mod placement;

pub use claims::{ClaimOwner, DrainClaims};
pub use container::ContainerFilter;
pub use node::NodeFilter;

use crate::domain::types::{Node, NodeId, NodeKind, Workload, WorkloadId};
use crate::events::EventBus;
use crate::persist::PersistHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// State
// =============================================================================

/// Everything the placement lock protects
#[derive(Debug, Default)]
pub(crate) struct FleetState {
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) workloads: HashMap<WorkloadId, Workload>,
}

impl FleetState {
    /// Workloads whose volume lives on the given node, running or not
    pub(crate) fn homed_on(&self, node: &NodeId) -> Vec<&Workload> {
        self.workloads
            .values()
            .filter(|w| w.node_id.as_ref() == Some(node))
            .collect()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Node and workload inventory behind a single placement lock
pub struct FleetRegistry {
    pub(crate) state: Mutex<FleetState>,
    pub(crate) bus: EventBus,
    pub(crate) persist: PersistHandle,
}

impl FleetRegistry {
    pub fn new(bus: EventBus, persist: PersistHandle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FleetState::default()),
            bus,
            persist,
        })
    }

    /// Rebuild from recovered records. Accounting fields are recomputed
    /// from the workloads rather than trusted from storage, so a crash
    /// between paired writes cannot leave the books unbalanced.
    pub fn load(&self, nodes: Vec<Node>, workloads: Vec<Workload>) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.workloads.clear();

        for mut node in nodes {
            node.allocated_ram_mb = 0;
            node.container_count = 0;
            state.nodes.insert(node.id.clone(), node);
        }
        for workload in workloads {
            if workload.placement_active {
                if let Some(node_id) = &workload.node_id {
                    if let Some(node) = state.nodes.get_mut(node_id) {
                        node.allocated_ram_mb += workload.actual_ram_mb;
                        node.container_count += 1;
                    }
                }
            }
            state.workloads.insert(workload.id.clone(), workload);
        }
    }

    /// Consistent point-in-time copy of all nodes and workloads, for the
    /// control loops that plan against snapshots.
    pub fn snapshot(&self) -> (Vec<Node>, Vec<Workload>) {
        let state = self.state.lock();
        (
            state.nodes.values().cloned().collect(),
            state.workloads.values().cloned().collect(),
        )
    }
}

impl std::fmt::Debug for FleetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FleetRegistry")
            .field("nodes", &state.nodes.len())
            .field("workloads", &state.workloads.len())
            .finish()
    }
}

// =============================================================================
// Fleet Statistics
// =============================================================================

/// Per-kind aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindStats {
    pub nodes: u64,
    pub usable_ram_mb: u64,
    pub allocated_ram_mb: u64,
    pub free_ram_mb: u64,
    pub container_count: u64,
}

impl KindStats {
    fn add(&mut self, node: &Node) {
        self.nodes += 1;
        self.usable_ram_mb += node.usable_ram_mb();
        self.allocated_ram_mb += node.allocated_ram_mb;
        self.free_ram_mb += node.free_ram_mb();
        self.container_count += node.container_count as u64;
    }
}

/// Aggregate statistics across the worker fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_nodes: u64,
    pub dedicated: KindStats,
    pub cloud: KindStats,
    pub usable_ram_mb: u64,
    pub allocated_ram_mb: u64,
    pub free_ram_mb: u64,
    pub container_count: u64,
}

impl FleetStats {
    pub(crate) fn compute(state: &FleetState) -> Self {
        let mut stats = FleetStats::default();
        for node in state.nodes.values() {
            stats.total_nodes += 1;
            if !node.kind.is_worker() {
                continue;
            }
            match node.kind {
                NodeKind::Dedicated => stats.dedicated.add(node),
                NodeKind::Cloud => stats.cloud.add(node),
                _ => {}
            }
            stats.usable_ram_mb += node.usable_ram_mb();
            stats.allocated_ram_mb += node.allocated_ram_mb;
            stats.free_ram_mb += node.free_ram_mb();
            stats.container_count += node.container_count as u64;
        }
        stats
    }

    /// Allocated over usable across worker nodes, in `[0, 1]`
    pub fn capacity_fraction(&self) -> f64 {
        if self.usable_ram_mb == 0 {
            return 0.0;
        }
        self.allocated_ram_mb as f64 / self.usable_ram_mb as f64
    }
}
