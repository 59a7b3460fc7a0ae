//! Background persistence loop
//!
//! Repository writes happen outside the placement lock: mutation sites
//! enqueue records here and a background task flushes them. In-memory state
//! stays authoritative during the request; a write that keeps failing is
//! re-enqueued, and anything lost in a crash before the flush is observed
//! as never-happened when the registries rebuild.

use crate::domain::ports::{RepositoryRef, WorkloadQuery};
use crate::domain::types::{
    BillingEvent, MigrationOperation, Node, NodeId, UsageSession, Workload, WorkloadId,
};
use crate::error::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Operations
// =============================================================================

/// One queued repository write
#[derive(Debug, Clone)]
pub enum PersistOp {
    Node(Box<Node>),
    DeleteNode(NodeId),
    Workload(Box<Workload>),
    DeleteWorkload(WorkloadId),
    Migration(Box<MigrationOperation>),
    Billing(Box<BillingEvent>),
    Session(Box<UsageSession>),
}

impl PersistOp {
    fn describe(&self) -> String {
        match self {
            PersistOp::Node(n) => format!("node {}", n.id),
            PersistOp::DeleteNode(id) => format!("delete node {}", id),
            PersistOp::Workload(w) => format!("workload {}", w.id),
            PersistOp::DeleteWorkload(id) => format!("delete workload {}", id),
            PersistOp::Migration(m) => format!("migration {}", m.id),
            PersistOp::Billing(b) => format!("billing event for {}", b.workload_id),
            PersistOp::Session(s) => format!("usage session for {}", s.workload_id),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap handle mutation sites use to enqueue writes
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistHandle {
    /// A handle whose writes go nowhere, for tests and dry runs
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    fn send(&self, op: PersistOp) {
        // The flusher outlives all mutation sites except during shutdown,
        // where losing the tail of the queue is the documented contract.
        let _ = self.tx.send(op);
    }

    pub fn node(&self, node: &Node) {
        self.send(PersistOp::Node(Box::new(node.clone())));
    }

    pub fn delete_node(&self, id: &NodeId) {
        self.send(PersistOp::DeleteNode(id.clone()));
    }

    pub fn workload(&self, workload: &Workload) {
        self.send(PersistOp::Workload(Box::new(workload.clone())));
    }

    pub fn delete_workload(&self, id: &WorkloadId) {
        self.send(PersistOp::DeleteWorkload(id.clone()));
    }

    pub fn migration(&self, op: &MigrationOperation) {
        self.send(PersistOp::Migration(Box::new(op.clone())));
    }

    pub fn billing(&self, event: &BillingEvent) {
        self.send(PersistOp::Billing(Box::new(event.clone())));
    }

    pub fn session(&self, session: &UsageSession) {
        self.send(PersistOp::Session(Box::new(session.clone())));
    }
}

// =============================================================================
// Flusher
// =============================================================================

/// Spawn the persistence flusher; returns the handle mutation sites use
pub fn spawn_flusher(
    repo: RepositoryRef,
    cancel: CancellationToken,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PersistHandle { tx: tx.clone() };
    let task = tokio::spawn(run_flusher(repo, rx, tx, cancel));
    (handle, task)
}

async fn run_flusher(
    repo: RepositoryRef,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    requeue: mpsc::UnboundedSender<PersistOp>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("persistence flusher stopping");
                return;
            }
            op = rx.recv() => match op {
                Some(op) => op,
                None => return,
            },
        };

        let policy = backoff::ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let result = backoff::future::retry(policy, || async {
            apply(&repo, &op).await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        if let Err(e) = result {
            warn!("persist failed for {}, re-enqueueing: {}", op.describe(), e);
            let _ = requeue.send(op);
            // Give the repository room to recover before hammering it again.
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

async fn apply(repo: &RepositoryRef, op: &PersistOp) -> Result<()> {
    match op {
        PersistOp::Node(node) => repo.put_node(node).await,
        PersistOp::DeleteNode(id) => repo.delete_node(id).await,
        PersistOp::Workload(workload) => repo.put_workload(workload).await,
        PersistOp::DeleteWorkload(id) => repo.delete_workload(id).await,
        PersistOp::Migration(migration) => repo.put_migration(migration).await,
        PersistOp::Billing(event) => repo.append_billing_event(event).await,
        PersistOp::Session(session) => repo.put_usage_session(session).await,
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// Everything the registries and coordinator rebuild from at startup
#[derive(Debug)]
pub struct RecoveredState {
    pub nodes: Vec<Node>,
    pub workloads: Vec<Workload>,
    pub migrations: Vec<MigrationOperation>,
}

/// Load the crash-recovery source of truth
pub async fn rebuild(repo: &RepositoryRef) -> Result<RecoveredState> {
    let nodes = repo.list_nodes().await?;
    let workloads = repo.list_workloads(WorkloadQuery::default()).await?;
    let migrations = repo.list_migrations().await?;
    debug!(
        "recovered {} nodes, {} workloads, {} migrations",
        nodes.len(),
        workloads.len(),
        migrations.len()
    );
    Ok(RecoveredState {
        nodes,
        workloads,
        migrations,
    })
}
