//! Core domain records
//!
//! Nodes, workloads, migration operations, billing events, and usage
//! sessions. These are the records the registries own and the Repository
//! persists; all cross-references are by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(NodeId, "Unique identifier for a node");
string_id!(WorkloadId, "Unique identifier for a workload");
string_id!(MigrationId, "Unique identifier for a migration operation");

// =============================================================================
// Node
// =============================================================================

/// Where a node came from and how it is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Dedicated,
    Cloud,
    Local,
    Spare,
}

impl NodeKind {
    /// Worker nodes participate in fleet capacity accounting
    pub fn is_worker(&self) -> bool {
        matches!(self, NodeKind::Dedicated | NodeKind::Cloud)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Dedicated => write!(f, "dedicated"),
            NodeKind::Cloud => write!(f, "cloud"),
            NodeKind::Local => write!(f, "local"),
            NodeKind::Spare => write!(f, "spare"),
        }
    }
}

/// Health as reported by the node agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Healthy => write!(f, "healthy"),
            NodeHealth::Unhealthy => write!(f, "unhealthy"),
            NodeHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLifecycle {
    Provisioning,
    Ready,
    Active,
    Draining,
    Terminating,
}

impl NodeLifecycle {
    /// Allowed transitions form a straight line through the lifecycle
    pub fn can_transition(&self, to: NodeLifecycle) -> bool {
        use NodeLifecycle::*;
        matches!(
            (self, to),
            (Provisioning, Ready) | (Ready, Active) | (Active, Draining) | (Draining, Terminating)
        )
    }
}

impl std::fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeLifecycle::Provisioning => write!(f, "provisioning"),
            NodeLifecycle::Ready => write!(f, "ready"),
            NodeLifecycle::Active => write!(f, "active"),
            NodeLifecycle::Draining => write!(f, "draining"),
            NodeLifecycle::Terminating => write!(f, "terminating"),
        }
    }
}

/// A host that can run workloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub ip: String,
    /// Total RAM in MB
    pub total_ram_mb: u64,
    /// RAM reserved for the host system in MB
    pub system_reserved_mb: u64,
    pub total_cpus: u32,
    pub system_reserved_cpus: u32,
    /// Hourly cost in account currency
    pub hourly_cost: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Provider-side identifier for cloud nodes
    #[serde(default)]
    pub provider_id: Option<String>,
    pub health: NodeHealth,
    pub lifecycle: NodeLifecycle,
    /// RAM currently allocated to workloads in MB
    #[serde(default)]
    pub allocated_ram_mb: u64,
    /// Number of live containers on this node
    #[serde(default)]
    pub container_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Node {
    /// Create a node in `provisioning` with empty accounting
    pub fn new(
        id: impl Into<NodeId>,
        kind: NodeKind,
        ip: impl Into<String>,
        total_ram_mb: u64,
        system_reserved_mb: u64,
        total_cpus: u32,
        hourly_cost: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            ip: ip.into(),
            total_ram_mb,
            system_reserved_mb,
            total_cpus,
            system_reserved_cpus: 1,
            hourly_cost,
            labels: BTreeMap::new(),
            provider_id: None,
            health: NodeHealth::Unknown,
            lifecycle: NodeLifecycle::Provisioning,
            allocated_ram_mb: 0,
            container_count: 0,
            created_at: Utc::now(),
            last_health_check: None,
        }
    }

    /// RAM available for workloads: `total - system_reserved`
    pub fn usable_ram_mb(&self) -> u64 {
        self.total_ram_mb.saturating_sub(self.system_reserved_mb)
    }

    /// RAM not yet allocated to workloads
    pub fn free_ram_mb(&self) -> u64 {
        self.usable_ram_mb().saturating_sub(self.allocated_ram_mb)
    }

    /// Whether the placer may put new workloads here
    pub fn accepts_placements(&self) -> bool {
        self.health == NodeHealth::Healthy && self.lifecycle == NodeLifecycle::Active
    }
}

/// System reserve for cloud nodes: `max(base, percent of total)`
pub fn cloud_system_reserve_mb(total_ram_mb: u64, base_mb: u64, percent: u64) -> u64 {
    base_mb.max(total_ram_mb * percent / 100)
}

// =============================================================================
// Workload
// =============================================================================

/// Discrete RAM size class; drives pricing and packing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Micro,
    Small,
    Medium,
    Large,
    Xlarge,
    Custom,
}

impl Tier {
    /// The standard RAM size for named tiers; `None` for custom
    pub fn ram_mb(&self) -> Option<u64> {
        match self {
            Tier::Micro => Some(2048),
            Tier::Small => Some(4096),
            Tier::Medium => Some(8192),
            Tier::Large => Some(16384),
            Tier::Xlarge => Some(32768),
            Tier::Custom => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Micro => write!(f, "micro"),
            Tier::Small => write!(f, "small"),
            Tier::Medium => write!(f, "medium"),
            Tier::Large => write!(f, "large"),
            Tier::Xlarge => write!(f, "xlarge"),
            Tier::Custom => write!(f, "custom"),
        }
    }
}

/// Tier classification is a total, pure function of requested RAM
pub fn classify_tier(ram_mb: u64) -> Tier {
    match ram_mb {
        2048 => Tier::Micro,
        4096 => Tier::Small,
        8192 => Tier::Medium,
        16384 => Tier::Large,
        32768 => Tier::Xlarge,
        _ => Tier::Custom,
    }
}

/// Pricing and placement policy bound to a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    PayPerPlay,
    Balanced,
    Reserved,
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plan::PayPerPlay => write!(f, "payperplay"),
            Plan::Balanced => write!(f, "balanced"),
            Plan::Reserved => write!(f, "reserved"),
        }
    }
}

/// When a workload may be moved between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    OnlyOffline,
    Always,
    Never,
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationMode::OnlyOffline => write!(f, "only_offline"),
            MigrationMode::Always => write!(f, "always"),
            MigrationMode::Never => write!(f, "never"),
        }
    }
}

/// Run status of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Queued,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Sleeping,
    Archiving,
    Archived,
}

impl WorkloadStatus {
    /// Valid transitions of the run-status graph. Any state may move to
    /// `Error` when the driver reports an unrecoverable failure.
    pub fn can_transition(&self, to: WorkloadStatus) -> bool {
        use WorkloadStatus::*;
        if to == Error {
            return true;
        }
        matches!(
            (self, to),
            (Queued, Starting)
                | (Stopped, Starting)
                | (Stopped, Queued)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Sleeping)
                | (Sleeping, Starting)
                | (Sleeping, Queued)
                | (Sleeping, Archiving)
                | (Archiving, Archived)
                | (Archiving, Sleeping)
                | (Archived, Starting)
                | (Archived, Queued)
                | (Error, Queued)
                | (Error, Starting)
        )
    }

    /// Whether a workload in this status holds RAM on its node
    pub fn holds_ram(&self) -> bool {
        matches!(
            self,
            WorkloadStatus::Starting | WorkloadStatus::Running | WorkloadStatus::Stopping
        )
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkloadStatus::Queued => "queued",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Error => "error",
            WorkloadStatus::Sleeping => "sleeping",
            WorkloadStatus::Archiving => "archiving",
            WorkloadStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// Billing phase, distinct from run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Active,
    Sleep,
    Archived,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Active => write!(f, "active"),
            LifecyclePhase::Sleep => write!(f, "sleep"),
            LifecyclePhase::Archived => write!(f, "archived"),
        }
    }
}

/// One persistent game-server instance with a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub owner_id: String,
    pub name: String,
    /// Container image the host agent runs
    pub image: String,
    /// RAM the tenant asked for in MB
    pub requested_ram_mb: u64,
    /// RAM after proportional overhead deduction in MB
    pub actual_ram_mb: u64,
    /// Volume size in MB, snapshotted into billing events
    #[serde(default)]
    pub storage_mb: u64,
    pub tier: Tier,
    pub plan: Plan,
    pub status: WorkloadStatus,
    pub phase: LifecyclePhase,
    /// Node currently holding this workload's volume, if any
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Whether this workload's RAM is counted in its node's accounting
    #[serde(default)]
    pub placement_active: bool,
    #[serde(default)]
    pub container: Option<ContainerHandle>,
    #[serde(default)]
    pub port: Option<u16>,
    pub idle_timeout_secs: u64,
    pub auto_shutdown: bool,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stopped: Option<DateTime<Utc>>,
    /// Most recent reported player count and when it was sampled
    #[serde(default)]
    pub player_count: u32,
    #[serde(default)]
    pub player_count_at: Option<DateTime<Utc>>,
    pub migration_mode: MigrationMode,
    /// Backup id and location for an archived volume
    #[serde(default)]
    pub archive_backup_id: Option<String>,
    #[serde(default)]
    pub archive_location: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Workload {
    /// Fresh player samples older than this are treated as unknown
    pub fn players_online(&self, now: DateTime<Utc>, stale_secs: u64) -> Option<u32> {
        let sampled = self.player_count_at?;
        let age = now.signed_duration_since(sampled);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > stale_secs {
            return None;
        }
        Some(self.player_count)
    }

    /// Whether the idle timeout has elapsed since the last activity
    pub fn idle_expired(&self, now: DateTime<Utc>) -> bool {
        let reference = self
            .last_activity
            .or(self.last_started)
            .unwrap_or(self.created_at);
        let idle = now.signed_duration_since(reference);
        idle.num_seconds() >= 0 && idle.num_seconds() as u64 >= self.idle_timeout_secs
    }
}

/// Deduct the container runtime's proportional overhead from requested RAM
pub fn actual_ram_mb(requested_mb: u64, overhead_percent: u64) -> u64 {
    requested_mb - requested_mb * overhead_percent / 100
}

/// Opaque reference to a container created by the host driver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Why a migration was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    CostOptimization,
    Manual,
    Rebalancing,
    Maintenance,
}

impl std::fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationReason::CostOptimization => write!(f, "cost_optimization"),
            MigrationReason::Manual => write!(f, "manual"),
            MigrationReason::Rebalancing => write!(f, "rebalancing"),
            MigrationReason::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Migration state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Suggested,
    Approved,
    Scheduled,
    Preparing,
    Transferring,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// States in which the operation holds the workload's serial section
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Preparing | MigrationStatus::Transferring | MigrationStatus::Completing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationStatus::Suggested => "suggested",
            MigrationStatus::Approved => "approved",
            MigrationStatus::Scheduled => "scheduled",
            MigrationStatus::Preparing => "preparing",
            MigrationStatus::Transferring => "transferring",
            MigrationStatus::Completing => "completing",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A planned or executing move of one workload between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOperation {
    pub id: MigrationId,
    pub workload_id: WorkloadId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reason: MigrationReason,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Progress 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub saved_hourly_cost: Option<f64>,
    #[serde(default)]
    pub saved_monthly_cost: Option<f64>,
    /// Actor that triggered the operation
    pub triggered_by: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl MigrationOperation {
    pub fn new(
        id: impl Into<MigrationId>,
        workload_id: impl Into<WorkloadId>,
        from_node: impl Into<NodeId>,
        to_node: impl Into<NodeId>,
        reason: MigrationReason,
        max_retries: u32,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workload_id: workload_id.into(),
            from_node: from_node.into(),
            to_node: to_node.into(),
            reason,
            status: MigrationStatus::Suggested,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            progress: 0,
            saved_hourly_cost: None,
            saved_monthly_cost: None,
            triggered_by: triggered_by.into(),
            error: None,
        }
    }
}

// =============================================================================
// Billing
// =============================================================================

/// Rates in effect at a point in time. Events store the numbers, never a
/// pointer to current configuration, so historical cost reconstruction is
/// deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    /// Active phase rate per GB-hour
    pub active_per_gb_hour: f64,
    /// Sleep phase rate per GB-day
    pub sleep_per_gb_day: f64,
    /// Archived phase rate per GB-day
    pub archived_per_gb_day: f64,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            active_per_gb_hour: 0.04,
            sleep_per_gb_day: 0.02,
            archived_per_gb_day: 0.0,
        }
    }
}

impl RateTable {
    /// The per-hour rate for a phase, at the given RAM size
    pub fn hourly_rate(&self, phase: LifecyclePhase, ram_mb: u64) -> f64 {
        let gb = ram_mb as f64 / 1024.0;
        match phase {
            LifecyclePhase::Active => self.active_per_gb_hour * gb,
            LifecyclePhase::Sleep => self.sleep_per_gb_day * gb / 24.0,
            LifecyclePhase::Archived => self.archived_per_gb_day * gb / 24.0,
        }
    }
}

/// What a billing event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    Started,
    Stopped,
    PhaseChanged,
}

impl std::fmt::Display for BillingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingEventKind::Started => write!(f, "started"),
            BillingEventKind::Stopped => write!(f, "stopped"),
            BillingEventKind::PhaseChanged => write!(f, "phase_changed"),
        }
    }
}

/// Append-only record of a phase transition or activity change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub workload_id: WorkloadId,
    pub ts: DateTime<Utc>,
    pub kind: BillingEventKind,
    #[serde(default)]
    pub previous_phase: Option<LifecyclePhase>,
    pub new_phase: LifecyclePhase,
    /// Rates at event time
    pub rate: RateTable,
    /// RAM snapshot in MB
    pub ram_mb: u64,
    /// Storage snapshot in MB
    pub storage_mb: u64,
}

/// Derived closed interval of active usage with computed cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSession {
    pub workload_id: WorkloadId,
    pub started: DateTime<Utc>,
    pub stopped: DateTime<Utc>,
    pub duration_secs: u64,
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_classification_round_trip() {
        for ram in [2048u64, 4096, 8192, 16384, 32768] {
            let tier = classify_tier(ram);
            assert_eq!(tier.ram_mb(), Some(ram));
        }
        assert_eq!(classify_tier(3000), Tier::Custom);
        assert_eq!(classify_tier(0), Tier::Custom);
        assert_eq!(Tier::Custom.ram_mb(), None);
    }

    #[test]
    fn test_node_usable_ram() {
        let mut node = Node::new("n-1", NodeKind::Cloud, "10.0.0.1", 16384, 2048, 8, 0.12);
        assert_eq!(node.usable_ram_mb(), 14336);
        node.allocated_ram_mb = 4096;
        assert_eq!(node.free_ram_mb(), 10240);

        // Reserve larger than total saturates to zero
        node.system_reserved_mb = 32768;
        assert_eq!(node.usable_ram_mb(), 0);
    }

    #[test]
    fn test_cloud_system_reserve() {
        // 10% of 32 GB beats the 1 GB base
        assert_eq!(cloud_system_reserve_mb(32768, 1024, 10), 3276);
        // Base wins for small nodes
        assert_eq!(cloud_system_reserve_mb(4096, 1024, 10), 1024);
    }

    #[test]
    fn test_node_lifecycle_graph() {
        use NodeLifecycle::*;
        assert!(Provisioning.can_transition(Ready));
        assert!(Ready.can_transition(Active));
        assert!(Active.can_transition(Draining));
        assert!(Draining.can_transition(Terminating));
        assert!(!Active.can_transition(Terminating));
        assert!(!Draining.can_transition(Active));
        assert!(!Terminating.can_transition(Provisioning));
    }

    #[test]
    fn test_workload_status_graph() {
        use WorkloadStatus::*;
        assert!(Queued.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));
        assert!(Stopped.can_transition(Sleeping));
        assert!(Sleeping.can_transition(Archiving));
        assert!(Archiving.can_transition(Archived));
        assert!(Archived.can_transition(Queued));
        // Any state may error
        assert!(Running.can_transition(Error));
        assert!(Archiving.can_transition(Error));
        // But not arbitrary jumps
        assert!(!Stopped.can_transition(Running));
        assert!(!Running.can_transition(Stopped));
    }

    #[test]
    fn test_actual_ram_overhead() {
        assert_eq!(actual_ram_mb(4096, 10), 3687);
        assert_eq!(actual_ram_mb(2048, 0), 2048);
    }

    #[test]
    fn test_players_online_staleness() {
        let now = Utc::now();
        let mut w = crate::testutil::workload("w-1", 4096);
        w.player_count = 3;
        w.player_count_at = Some(now - chrono::Duration::seconds(30));
        assert_eq!(w.players_online(now, 120), Some(3));

        w.player_count_at = Some(now - chrono::Duration::seconds(300));
        assert_eq!(w.players_online(now, 120), None);

        w.player_count_at = None;
        assert_eq!(w.players_online(now, 120), None);
    }

    #[test]
    fn test_rate_table_hourly() {
        let rates = RateTable::default();
        let active = rates.hourly_rate(LifecyclePhase::Active, 4096);
        assert!((active - 0.16).abs() < 1e-9);
        let archived = rates.hourly_rate(LifecyclePhase::Archived, 4096);
        assert_eq!(archived, 0.0);
    }
}
