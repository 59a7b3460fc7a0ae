//! Node-side registry operations
//!
//! The registry is the only component that mutates node fields. Unhealthy
//! status blocks new placements but never evicts containers; the lifecycle
//! graph is enforced on every transition.

use super::{FleetRegistry, FleetStats};
use crate::domain::types::{Node, NodeHealth, NodeId, NodeKind, NodeLifecycle};
use crate::error::{Error, Result};
use crate::events::ConductorEvent;
use chrono::{DateTime, Utc};

/// Filter for node listings
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub kind: Option<NodeKind>,
    pub health: Option<NodeHealth>,
    pub lifecycle: Option<NodeLifecycle>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        self.kind.map_or(true, |k| node.kind == k)
            && self.health.map_or(true, |h| node.health == h)
            && self.lifecycle.map_or(true, |l| node.lifecycle == l)
    }
}

impl FleetRegistry {
    /// Insert a node. Fails if the id exists or the node has no usable RAM.
    pub fn register(&self, node: Node) -> Result<()> {
        if node.usable_ram_mb() == 0 {
            return Err(Error::Configuration(format!(
                "node {} has no usable RAM ({} MB total, {} MB reserved)",
                node.id, node.total_ram_mb, node.system_reserved_mb
            )));
        }

        let mut state = self.state.lock();
        if state.nodes.contains_key(&node.id) {
            return Err(Error::NodeExists {
                node_id: node.id.to_string(),
            });
        }

        self.persist.node(&node);
        self.bus.publish(ConductorEvent::NodeCreated {
            node_id: node.id.clone(),
            kind: node.kind,
            total_ram_mb: node.total_ram_mb,
        });
        state.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Update health status and the check timestamp
    pub fn update_health(
        &self,
        id: &NodeId,
        health: NodeHealth,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("node", id))?;
        node.health = health;
        node.last_health_check = Some(ts);
        self.persist.node(node);
        Ok(())
    }

    /// Advance the node lifecycle along the allowed graph
    pub fn set_lifecycle(&self, id: &NodeId, to: NodeLifecycle) -> Result<()> {
        let mut state = self.state.lock();

        let homed = state.homed_on(id).len();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("node", id))?;

        if !node.lifecycle.can_transition(to) {
            return Err(Error::InvalidState {
                entity: format!("node {}", id),
                from: node.lifecycle.to_string(),
                to: to.to_string(),
            });
        }
        // A terminating node must be empty, containers and volumes both.
        if to == NodeLifecycle::Terminating && (node.container_count > 0 || homed > 0) {
            return Err(Error::InvalidState {
                entity: format!("node {} (still hosting workloads)", id),
                from: node.lifecycle.to_string(),
                to: to.to_string(),
            });
        }

        node.lifecycle = to;
        self.persist.node(node);
        Ok(())
    }

    /// Adjust accounting upward; fails when the allocation would exceed
    /// usable RAM. Placement paths call this under the same lock they use
    /// to bind the workload.
    pub fn allocate(&self, id: &NodeId, ram_mb: u64) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("node", id))?;
        Self::allocate_in(node, ram_mb)?;
        self.persist.node(node);
        self.publish_node_stats(node);
        Ok(())
    }

    /// Adjust accounting downward
    pub fn release(&self, id: &NodeId, ram_mb: u64) -> Result<()> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found("node", id))?;
        node.allocated_ram_mb = node.allocated_ram_mb.saturating_sub(ram_mb);
        self.persist.node(node);
        self.publish_node_stats(node);
        Ok(())
    }

    pub(crate) fn allocate_in(node: &mut Node, ram_mb: u64) -> Result<()> {
        if node.allocated_ram_mb + ram_mb > node.usable_ram_mb() {
            return Err(Error::NoCapacity {
                reason: format!(
                    "node {}: {} MB allocated + {} MB requested exceeds {} MB usable",
                    node.id,
                    node.allocated_ram_mb,
                    ram_mb,
                    node.usable_ram_mb()
                ),
            });
        }
        node.allocated_ram_mb += ram_mb;
        Ok(())
    }

    pub(crate) fn publish_node_stats(&self, node: &Node) {
        self.bus.publish(ConductorEvent::NodeStats {
            node_id: node.id.clone(),
            allocated_ram_mb: node.allocated_ram_mb,
            free_ram_mb: node.free_ram_mb(),
            container_count: node.container_count,
        });
    }

    /// Remove an empty node from the registry
    pub fn remove_node(&self, id: &NodeId) -> Result<Node> {
        let mut state = self.state.lock();
        let homed = state.homed_on(id).len();
        let node = state
            .nodes
            .get(id)
            .ok_or_else(|| Error::not_found("node", id))?;
        if node.container_count > 0 || homed > 0 {
            return Err(Error::InvalidState {
                entity: format!("node {} (still hosting workloads)", id),
                from: node.lifecycle.to_string(),
                to: "removed".to_string(),
            });
        }
        let node = state
            .nodes
            .remove(id)
            .ok_or_else(|| Error::not_found("node", id))?;
        self.persist.delete_node(id);
        self.bus
            .publish(ConductorEvent::NodeRemoved { node_id: id.clone() });
        Ok(node)
    }

    /// Defensive copy of one node
    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.state.lock().nodes.get(id).cloned()
    }

    /// Defensive copies of all nodes matching the filter
    pub fn list_nodes(&self, filter: &NodeFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Aggregate statistics across the worker fleet
    pub fn fleet_stats(&self) -> FleetStats {
        FleetStats::compute(&self.state.lock())
    }

    /// Publish a fleet statistics snapshot to the observer stream
    pub fn publish_fleet_stats(&self) {
        let stats = self.fleet_stats();
        self.bus
            .publish(crate::events::ConductorEvent::StatsFleet { stats });
    }

    /// Whether the node hosts nothing at all, containers or volumes
    pub fn node_is_empty(&self, id: &NodeId) -> bool {
        let state = self.state.lock();
        state
            .nodes
            .get(id)
            .map_or(false, |n| n.container_count == 0)
            && state.homed_on(id).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::persist::PersistHandle;
    use crate::testutil;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn registry() -> Arc<FleetRegistry> {
        FleetRegistry::new(EventBus::new(64), PersistHandle::noop())
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = registry();
        let node = testutil::active_node("n-1", NodeKind::Cloud, 16384, 0);
        registry.register(node.clone()).unwrap();

        assert_matches!(
            registry.register(node),
            Err(Error::NodeExists { .. })
        );
    }

    #[test]
    fn test_register_rejects_zero_usable_ram() {
        let registry = registry();
        let mut node = testutil::active_node("n-1", NodeKind::Cloud, 4096, 0);
        node.system_reserved_mb = 4096;
        assert_matches!(registry.register(node), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_allocate_bounds() {
        let registry = registry();
        registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 0))
            .unwrap();
        let id = NodeId::new("n-1");

        registry.allocate(&id, 12288).unwrap();
        assert_matches!(registry.allocate(&id, 8192), Err(Error::NoCapacity { .. }));

        registry.release(&id, 4096).unwrap();
        registry.allocate(&id, 8192).unwrap();
        assert_eq!(registry.get_node(&id).unwrap().allocated_ram_mb, 16384);
    }

    #[test]
    fn test_lifecycle_enforced() {
        let registry = registry();
        let mut node = testutil::active_node("n-1", NodeKind::Cloud, 16384, 0);
        node.lifecycle = NodeLifecycle::Active;
        registry.register(node).unwrap();
        let id = NodeId::new("n-1");

        registry.set_lifecycle(&id, NodeLifecycle::Draining).unwrap();
        assert_matches!(
            registry.set_lifecycle(&id, NodeLifecycle::Active),
            Err(Error::InvalidState { .. })
        );
        registry
            .set_lifecycle(&id, NodeLifecycle::Terminating)
            .unwrap();
    }

    #[test]
    fn test_unhealthy_blocks_placement_but_keeps_node() {
        let registry = registry();
        registry
            .register(testutil::active_node("n-1", NodeKind::Cloud, 16384, 4096))
            .unwrap();
        let id = NodeId::new("n-1");

        registry
            .update_health(&id, NodeHealth::Unhealthy, Utc::now())
            .unwrap();

        let node = registry.get_node(&id).unwrap();
        assert!(!node.accepts_placements());
        // Existing allocation is untouched.
        assert_eq!(node.allocated_ram_mb, 4096);
    }

    #[test]
    fn test_list_with_filter() {
        let registry = registry();
        registry
            .register(testutil::active_node("n-c", NodeKind::Cloud, 16384, 0))
            .unwrap();
        registry
            .register(testutil::active_node("n-d", NodeKind::Dedicated, 16384, 0))
            .unwrap();

        let cloud_only = registry.list_nodes(&NodeFilter {
            kind: Some(NodeKind::Cloud),
            ..Default::default()
        });
        assert_eq!(cloud_only.len(), 1);
        assert_eq!(cloud_only[0].id.as_str(), "n-c");

        assert_eq!(registry.list_nodes(&NodeFilter::default()).len(), 2);
    }
}
