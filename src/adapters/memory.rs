//! In-memory repository
//!
//! Backs standalone mode and the round-trip tests. Every call clones in
//! and out, matching the defensive-copy contract of the real storage
//! adapters.

use crate::domain::ports::{Repository, WorkloadQuery};
use crate::domain::types::{
    BillingEvent, MigrationOperation, Node, NodeId, UsageSession, Workload, WorkloadId,
    WorkloadStatus,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Tables {
    nodes: HashMap<NodeId, Node>,
    workloads: HashMap<WorkloadId, Workload>,
    migrations: HashMap<crate::domain::types::MigrationId, MigrationOperation>,
    billing_events: Vec<BillingEvent>,
    usage_sessions: Vec<UsageSession>,
}

/// Repository over process memory
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_node(&self, node: &Node) -> Result<()> {
        self.tables
            .write()
            .nodes
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<()> {
        self.tables.write().nodes.remove(id);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.tables.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn put_workload(&self, workload: &Workload) -> Result<()> {
        self.tables
            .write()
            .workloads
            .insert(workload.id.clone(), workload.clone());
        Ok(())
    }

    async fn delete_workload(&self, id: &WorkloadId) -> Result<()> {
        self.tables.write().workloads.remove(id);
        Ok(())
    }

    async fn list_workloads(&self, query: WorkloadQuery) -> Result<Vec<Workload>> {
        let mut workloads: Vec<Workload> = self
            .tables
            .read()
            .workloads
            .values()
            .filter(|w| {
                query
                    .owner_id
                    .as_ref()
                    .map_or(true, |o| &w.owner_id == o)
                    && query
                        .node_id
                        .as_ref()
                        .map_or(true, |n| w.node_id.as_ref() == Some(n))
            })
            .cloned()
            .collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workloads)
    }

    async fn put_migration(&self, op: &MigrationOperation) -> Result<()> {
        self.tables
            .write()
            .migrations
            .insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationOperation>> {
        let mut ops: Vec<MigrationOperation> =
            self.tables.read().migrations.values().cloned().collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(ops)
    }

    async fn migrations_for(&self, workload: &WorkloadId) -> Result<Vec<MigrationOperation>> {
        let mut ops: Vec<MigrationOperation> = self
            .tables
            .read()
            .migrations
            .values()
            .filter(|op| &op.workload_id == workload)
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(ops)
    }

    async fn append_billing_event(&self, event: &BillingEvent) -> Result<()> {
        self.tables.write().billing_events.push(event.clone());
        Ok(())
    }

    async fn billing_events(&self, workload: &WorkloadId) -> Result<Vec<BillingEvent>> {
        Ok(self
            .tables
            .read()
            .billing_events
            .iter()
            .filter(|e| &e.workload_id == workload)
            .cloned()
            .collect())
    }

    async fn put_usage_session(&self, session: &UsageSession) -> Result<()> {
        self.tables.write().usage_sessions.push(session.clone());
        Ok(())
    }

    async fn usage_sessions(&self, workload: &WorkloadId) -> Result<Vec<UsageSession>> {
        Ok(self
            .tables
            .read()
            .usage_sessions
            .iter()
            .filter(|s| &s.workload_id == workload)
            .cloned()
            .collect())
    }

    async fn stopped_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Workload>> {
        Ok(self
            .tables
            .read()
            .workloads
            .values()
            .filter(|w| {
                w.status == WorkloadStatus::Stopped
                    && w.last_stopped.map_or(false, |t| t < cutoff)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::NodeKind;
    use crate::testutil;

    #[tokio::test]
    async fn test_round_trip_nodes_and_workloads() {
        let repo = MemoryRepository::new();
        let node = testutil::active_node("n-1", NodeKind::Cloud, 16384, 4096);
        let workload = testutil::workload("w-1", 4096);

        repo.put_node(&node).await.unwrap();
        repo.put_workload(&workload).await.unwrap();

        let nodes = repo.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, node.id);
        assert_eq!(nodes[0].allocated_ram_mb, 4096);

        let workloads = repo.list_workloads(WorkloadQuery::default()).await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].requested_ram_mb, 4096);

        repo.delete_workload(&workload.id).await.unwrap();
        assert!(repo
            .list_workloads(WorkloadQuery::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stopped_before_query() {
        let repo = MemoryRepository::new();
        let mut old = testutil::workload("w-old", 4096);
        old.last_stopped = Some(Utc::now() - chrono::Duration::hours(72));
        let mut fresh = testutil::workload("w-new", 4096);
        fresh.last_stopped = Some(Utc::now());

        repo.put_workload(&old).await.unwrap();
        repo.put_workload(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(48);
        let expired = repo.stopped_before(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id.as_str(), "w-old");
    }
}
