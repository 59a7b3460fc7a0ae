//! Domain Ports - Core trait definitions for the conductor
//!
//! These traits define the boundaries between the conductor and external
//! systems: durable storage, per-node host agents, cloud provisioning, and
//! the backup engine. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::types::{
    BillingEvent, ContainerHandle, MigrationOperation, Node, NodeId, UsageSession, Workload,
    WorkloadId,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Container Types
// =============================================================================

/// State of a container as reported by the host agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a protocol-level readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Ready,
    NotReady,
    Failed,
}

/// Port mapping for a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Volume binding for a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
}

/// Everything the host agent needs to create a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// RAM limit in MB
    pub ram_limit_mb: u64,
    /// CPU quota in whole cores
    pub cpu_quota: u32,
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
}

// =============================================================================
// Provisioning Types
// =============================================================================

/// Requested shape of a new cloud node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSize {
    pub ram_mb: u64,
    pub cpus: u32,
}

/// A ready node as returned by the provisioner. Provisioning is complete:
/// the descriptor is only handed back after the agent readiness handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub provider_id: String,
    pub ip: String,
    pub total_ram_mb: u64,
    pub total_cpus: u32,
    pub hourly_cost: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Backup Types
// =============================================================================

/// What a backup is for; drives retention defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    PreMigration,
    Archive,
    Scheduled,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::PreMigration => write!(f, "pre_migration"),
            BackupKind::Archive => write!(f, "archive"),
            BackupKind::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// A completed backup as returned by the backup engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHandle {
    pub id: String,
    pub workload_id: WorkloadId,
    pub kind: BackupKind,
    pub size_bytes: u64,
    /// Where the archive lives, opaque to the conductor
    pub location: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Repository Port
// =============================================================================

/// Filter for workload listings
#[derive(Debug, Clone, Default)]
pub struct WorkloadQuery {
    pub owner_id: Option<String>,
    pub node_id: Option<NodeId>,
}

/// Port for durable storage of conductor records. Transactions are per
/// call; the in-memory registries are rebuilt from this port at startup.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn put_node(&self, node: &Node) -> Result<()>;
    async fn delete_node(&self, id: &NodeId) -> Result<()>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn put_workload(&self, workload: &Workload) -> Result<()>;
    async fn delete_workload(&self, id: &WorkloadId) -> Result<()>;
    async fn list_workloads(&self, query: WorkloadQuery) -> Result<Vec<Workload>>;

    async fn put_migration(&self, op: &MigrationOperation) -> Result<()>;
    async fn list_migrations(&self) -> Result<Vec<MigrationOperation>>;
    async fn migrations_for(&self, workload: &WorkloadId) -> Result<Vec<MigrationOperation>>;

    async fn append_billing_event(&self, event: &BillingEvent) -> Result<()>;
    async fn billing_events(&self, workload: &WorkloadId) -> Result<Vec<BillingEvent>>;

    async fn put_usage_session(&self, session: &UsageSession) -> Result<()>;
    async fn usage_sessions(&self, workload: &WorkloadId) -> Result<Vec<UsageSession>>;

    /// Workloads whose last stop is older than the cutoff; the time-based
    /// query behind the lifecycle engine's sleep descent.
    async fn stopped_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Workload>>;
}

// =============================================================================
// HostDriver Port
// =============================================================================

/// Per-node RPC used to manage containers and move data. The driver routes
/// each call to the agent on the addressed node.
#[async_trait]
pub trait HostDriver: Send + Sync {
    async fn create_container(&self, node: &NodeId, spec: ContainerSpec)
        -> Result<ContainerHandle>;

    async fn start_container(&self, node: &NodeId, handle: &ContainerHandle) -> Result<()>;

    /// Graceful stop with a deadline; the agent kills after the timeout
    async fn stop_container(
        &self,
        node: &NodeId,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> Result<()>;

    async fn remove_container(&self, node: &NodeId, handle: &ContainerHandle) -> Result<()>;

    async fn inspect(&self, node: &NodeId, handle: &ContainerHandle) -> Result<ContainerState>;

    /// Protocol-level readiness probe, opaque to the conductor
    async fn probe(&self, node: &NodeId, handle: &ContainerHandle) -> Result<ProbeResult>;

    async fn copy_in(
        &self,
        node: &NodeId,
        handle: &ContainerHandle,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()>;

    async fn copy_volume_out(
        &self,
        node: &NodeId,
        handle: &ContainerHandle,
        local_tarball: &str,
    ) -> Result<()>;
}

// =============================================================================
// NodeProvisioner Port
// =============================================================================

/// Acquires and releases nodes from a cloud provider or static inventory
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Provision a node; returns only after the readiness handshake
    async fn provision(
        &self,
        size: NodeSize,
        labels: BTreeMap<String, String>,
    ) -> Result<NodeDescriptor>;

    async fn release(&self, provider_id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<NodeDescriptor>>;
}

// =============================================================================
// BackupPort
// =============================================================================

/// Creates, restores, and transfers workload data archives
#[async_trait]
pub trait BackupPort: Send + Sync {
    async fn create(
        &self,
        workload: &WorkloadId,
        kind: BackupKind,
        retention_days: u32,
    ) -> Result<BackupHandle>;

    /// Stream the archive to the target node and extract it into the
    /// workload's volume there.
    async fn transfer_to_node(&self, backup_id: &str, target: &NodeId) -> Result<()>;

    async fn restore(&self, backup_id: &str, target: &WorkloadId) -> Result<()>;

    async fn delete(&self, backup_id: &str) -> Result<()>;

    async fn list_expired(&self) -> Result<Vec<BackupHandle>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type RepositoryRef = Arc<dyn Repository>;
pub type HostDriverRef = Arc<dyn HostDriver>;
pub type NodeProvisionerRef = Arc<dyn NodeProvisioner>;
pub type BackupPortRef = Arc<dyn BackupPort>;
