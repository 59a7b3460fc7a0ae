//! Atomic placement operations
//!
//! The only code that co-mutates `(node.allocated_ram, workload.placement)`.
//! Every operation here runs with the placement lock held end to end, so
//! the books stay balanced without a two-phase commit.
//!
//! A workload binds to a node in two strengths: *placed* (RAM counted on
//! the node, container live there) and *parked* (volume home retained but
//! no RAM counted, the state a stopped workload rests in). Restarting a
//! parked workload must land on its volume home.

use super::FleetRegistry;
use crate::domain::types::{NodeId, WorkloadId};
use crate::error::{Error, Result};
use crate::events::ConductorEvent;
use crate::placer::{self, PlacementConstraints};

impl FleetRegistry {
    /// Pick a node for the workload and bind it, allocating its RAM.
    /// Re-issuing for an already-placed workload is a no-op returning the
    /// current placement. A parked workload is pinned to its volume home.
    pub fn place(
        &self,
        id: &WorkloadId,
        constraints: &PlacementConstraints,
    ) -> Result<NodeId> {
        let mut state = self.state.lock();

        let workload = state
            .workloads
            .get(id)
            .ok_or_else(|| Error::not_found("workload", id))?
            .clone();

        if workload.placement_active {
            return workload
                .node_id
                .ok_or_else(|| Error::Internal(format!("workload {} active without node", id)));
        }

        let chosen = match &workload.node_id {
            // Volume locality: a parked workload restarts where its data is.
            Some(home) => {
                let node = state
                    .nodes
                    .get(home)
                    .ok_or_else(|| Error::not_found("node", home))?;
                if !placer::is_candidate(node, workload.actual_ram_mb, constraints) {
                    return Err(Error::NoCapacity {
                        reason: format!(
                            "volume home {} cannot take {} MB for workload {}",
                            home, workload.actual_ram_mb, id
                        ),
                    });
                }
                home.clone()
            }
            None => placer::select(state.nodes.values(), &workload, constraints)?,
        };

        {
            let node = state
                .nodes
                .get_mut(&chosen)
                .ok_or_else(|| Error::not_found("node", &chosen))?;
            Self::allocate_in(node, workload.actual_ram_mb)?;
            node.container_count += 1;
            self.persist.node(node);
            self.publish_node_stats(node);
        }

        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        workload.node_id = Some(chosen.clone());
        workload.placement_active = true;
        self.persist.workload(workload);
        self.bus.publish(ConductorEvent::ContainerUpdated {
            workload_id: workload.id.clone(),
            status: workload.status,
            node_id: workload.node_id.clone(),
        });

        Ok(chosen)
    }

    /// Release the workload's RAM and container slot but keep the volume
    /// home, the resting state of a stopped workload.
    pub fn park(&self, id: &WorkloadId) -> Result<()> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get(id)
            .ok_or_else(|| Error::not_found("workload", id))?
            .clone();

        if !workload.placement_active {
            return Ok(());
        }
        let node_id = workload
            .node_id
            .ok_or_else(|| Error::Internal(format!("workload {} active without node", id)))?;

        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.allocated_ram_mb = node.allocated_ram_mb.saturating_sub(workload.actual_ram_mb);
            node.container_count = node.container_count.saturating_sub(1);
            self.persist.node(node);
            self.publish_node_stats(node);
        }

        if let Some(workload) = state.workloads.get_mut(id) {
            workload.placement_active = false;
            self.persist.workload(workload);
        }
        Ok(())
    }

    /// Release RAM and clear the node binding entirely (archive, delete)
    pub fn unplace(&self, id: &WorkloadId) -> Result<()> {
        self.park(id)?;
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        workload.node_id = None;
        self.persist.workload(workload);
        Ok(())
    }

    /// Atomic release-then-allocate. On allocation failure the workload
    /// stays exactly where it was.
    pub fn move_workload(&self, id: &WorkloadId, to: &NodeId) -> Result<()> {
        self.begin_move(id, to)?;
        self.commit_move(id, to)
    }

    /// Reserve the target side of a move. For an actively placed workload
    /// this allocates its RAM on the target while the source allocation
    /// stands, so a concurrent placement cannot steal the headroom during
    /// the transfer. Fails with `NoCapacity` if the target cannot take it.
    pub fn begin_move(&self, id: &WorkloadId, to: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get(id)
            .ok_or_else(|| Error::not_found("workload", id))?
            .clone();

        if workload.node_id.as_ref() == Some(to) {
            return Err(Error::InvalidState {
                entity: format!("workload {}", id),
                from: format!("on {}", to),
                to: format!("move to {}", to),
            });
        }

        let target = state
            .nodes
            .get_mut(to)
            .ok_or_else(|| Error::not_found("node", to))?;
        if !target.accepts_placements() {
            return Err(Error::NoCapacity {
                reason: format!("target node {} accepts no placements", to),
            });
        }
        if workload.placement_active {
            Self::allocate_in(target, workload.actual_ram_mb)?;
            self.persist.node(target);
            self.publish_node_stats(target);
        }
        Ok(())
    }

    /// Commit a move begun with [`begin_move`]: drop the source side of
    /// the accounting and bind the workload to the target.
    ///
    /// [`begin_move`]: FleetRegistry::begin_move
    pub fn commit_move(&self, id: &WorkloadId, to: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get(id)
            .ok_or_else(|| Error::not_found("workload", id))?
            .clone();

        if workload.placement_active {
            if let Some(source_id) = &workload.node_id {
                if let Some(source) = state.nodes.get_mut(source_id) {
                    source.allocated_ram_mb =
                        source.allocated_ram_mb.saturating_sub(workload.actual_ram_mb);
                    source.container_count = source.container_count.saturating_sub(1);
                    self.persist.node(source);
                    self.publish_node_stats(source);
                }
            }
            if let Some(target) = state.nodes.get_mut(to) {
                target.container_count += 1;
                self.persist.node(target);
                self.publish_node_stats(target);
            }
        }

        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        workload.node_id = Some(to.clone());
        self.persist.workload(workload);
        self.bus.publish(ConductorEvent::ContainerUpdated {
            workload_id: workload.id.clone(),
            status: workload.status,
            node_id: workload.node_id.clone(),
        });
        Ok(())
    }

    /// Abandon a move begun with [`begin_move`], releasing the target
    /// reservation. The source side was never touched.
    ///
    /// [`begin_move`]: FleetRegistry::begin_move
    pub fn abort_move(&self, id: &WorkloadId, to: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get(id)
            .ok_or_else(|| Error::not_found("workload", id))?
            .clone();

        if workload.placement_active {
            if let Some(target) = state.nodes.get_mut(to) {
                target.allocated_ram_mb =
                    target.allocated_ram_mb.saturating_sub(workload.actual_ram_mb);
                self.persist.node(target);
                self.publish_node_stats(target);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{NodeKind, WorkloadStatus};
    use crate::events::EventBus;
    use crate::persist::PersistHandle;
    use crate::testutil;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn registry() -> Arc<FleetRegistry> {
        FleetRegistry::new(EventBus::new(256), PersistHandle::noop())
    }

    fn setup_two_nodes(registry: &FleetRegistry) {
        registry
            .register(testutil::active_node("n-a", NodeKind::Cloud, 16384, 0))
            .unwrap();
        registry
            .register(testutil::active_node("n-b", NodeKind::Cloud, 16384, 0))
            .unwrap();
    }

    /// Per-node allocated RAM equals the sum over actively placed
    /// workloads.
    fn assert_books_balanced(registry: &FleetRegistry) {
        let (nodes, workloads) = registry.snapshot();
        for node in nodes {
            let expected: u64 = workloads
                .iter()
                .filter(|w| w.placement_active && w.node_id.as_ref() == Some(&node.id))
                .map(|w| w.actual_ram_mb)
                .sum();
            assert_eq!(
                node.allocated_ram_mb, expected,
                "node {} books unbalanced",
                node.id
            );
        }
    }

    #[test]
    fn test_place_allocates_and_binds() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");

        let node = registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        assert_eq!(node.as_str(), "n-a");

        let w = registry.get_workload(&id).unwrap();
        assert!(w.placement_active);
        assert_eq!(registry.get_node(&node).unwrap().container_count, 1);
        assert_books_balanced(&registry);

        // Idempotent: second place returns the existing binding.
        let again = registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        assert_eq!(again, node);
        assert_books_balanced(&registry);
    }

    #[test]
    fn test_park_keeps_volume_home() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");

        let node = registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        registry.park(&id).unwrap();

        let w = registry.get_workload(&id).unwrap();
        assert!(!w.placement_active);
        assert_eq!(w.node_id, Some(node.clone()));
        assert_eq!(registry.get_node(&node).unwrap().allocated_ram_mb, 0);
        assert_books_balanced(&registry);

        // Re-placing lands back on the volume home even though n-b is
        // otherwise preferable by container count.
        let again = registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        assert_eq!(again, node);
    }

    #[test]
    fn test_parked_workload_home_full_is_no_capacity() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");
        let home = registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        registry.park(&id).unwrap();

        // Fill the home node completely.
        registry.allocate(&home, 16384).unwrap();

        assert_matches!(
            registry.place(&id, &PlacementConstraints::default()),
            Err(Error::NoCapacity { .. })
        );
    }

    #[test]
    fn test_move_workload_atomic_revert() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");
        registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();

        // Target full: the move fails and the workload stays on n-a.
        let target = NodeId::new("n-b");
        registry.allocate(&target, 16384).unwrap();
        assert_matches!(
            registry.move_workload(&id, &target),
            Err(Error::NoCapacity { .. })
        );
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.node_id.as_ref().map(|n| n.as_str()), Some("n-a"));
        registry.release(&target, 16384).unwrap();
        assert_books_balanced(&registry);

        // With room, the move lands on n-b and the books follow.
        registry.move_workload(&id, &target).unwrap();
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.node_id.as_ref().map(|n| n.as_str()), Some("n-b"));
        assert_eq!(registry.get_node(&target).unwrap().container_count, 1);
        assert_eq!(
            registry
                .get_node(&NodeId::new("n-a"))
                .unwrap()
                .container_count,
            0
        );
        assert_books_balanced(&registry);
    }

    #[test]
    fn test_begin_commit_abort_move() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");
        registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();
        registry.set_status(&id, WorkloadStatus::Starting).unwrap();
        registry.set_status(&id, WorkloadStatus::Running).unwrap();

        let target = NodeId::new("n-b");
        registry.begin_move(&id, &target).unwrap();

        // During the move both sides hold the RAM.
        assert_eq!(
            registry.get_node(&NodeId::new("n-a")).unwrap().allocated_ram_mb,
            4096
        );
        assert_eq!(registry.get_node(&target).unwrap().allocated_ram_mb, 4096);

        // Abort restores the pre-move accounting exactly.
        registry.abort_move(&id, &target).unwrap();
        assert_eq!(registry.get_node(&target).unwrap().allocated_ram_mb, 0);
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.node_id.as_ref().map(|n| n.as_str()), Some("n-a"));
        assert_books_balanced(&registry);

        // Begin again and commit: source side drains, target binds.
        registry.begin_move(&id, &target).unwrap();
        registry.commit_move(&id, &target).unwrap();
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.node_id.as_ref().map(|n| n.as_str()), Some("n-b"));
        assert_eq!(
            registry.get_node(&NodeId::new("n-a")).unwrap().allocated_ram_mb,
            0
        );
        assert_books_balanced(&registry);
    }

    #[test]
    fn test_draining_node_accepts_no_moves() {
        let registry = registry();
        setup_two_nodes(&registry);
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");
        registry
            .place(&id, &PlacementConstraints::default())
            .unwrap();

        let target = NodeId::new("n-b");
        registry
            .set_lifecycle(&target, crate::domain::types::NodeLifecycle::Draining)
            .unwrap();
        assert_matches!(
            registry.begin_move(&id, &target),
            Err(Error::NoCapacity { .. })
        );
    }
}
