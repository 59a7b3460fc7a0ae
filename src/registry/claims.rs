//! Node release-intent claims
//!
//! The scaling engine and the consolidation planner both drain and release
//! cloud nodes. A claim must be held before setting a node draining and
//! for as long as its release is pending; a claimed node is invisible to
//! the other loop, so the two can never release the same node.

use crate::domain::types::NodeId;
use dashmap::DashMap;

/// Which loop holds a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOwner {
    Scaler,
    Consolidator,
}

impl std::fmt::Display for ClaimOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimOwner::Scaler => write!(f, "scaler"),
            ClaimOwner::Consolidator => write!(f, "consolidator"),
        }
    }
}

/// Claim table shared by the drain-capable loops
#[derive(Debug, Default)]
pub struct DrainClaims {
    claims: DashMap<NodeId, ClaimOwner>,
}

impl DrainClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the claim; `false` when another owner already holds it
    pub fn try_claim(&self, node: &NodeId, owner: ClaimOwner) -> bool {
        match self.claims.entry(node.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => *existing.get() == owner,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(owner);
                true
            }
        }
    }

    /// Drop a claim; only the holder may release it
    pub fn release(&self, node: &NodeId, owner: ClaimOwner) {
        self.claims.remove_if(node, |_, held| *held == owner);
    }

    pub fn is_claimed(&self, node: &NodeId) -> bool {
        self.claims.contains_key(node)
    }

    /// Nodes currently claimed by the given owner
    pub fn owned_by(&self, owner: ClaimOwner) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .claims
            .iter()
            .filter(|entry| *entry.value() == owner)
            .map(|entry| entry.key().clone())
            .collect();
        nodes.sort();
        nodes
    }
}
