//! Conductor configuration
//!
//! Every tunable for the control loops lives here with a serde default, so
//! a partial YAML file (or none at all) yields a fully working config.

use crate::domain::types::RateTable;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Placement
// =============================================================================

/// Placement and resource accounting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Proportional container overhead deducted from requested RAM, percent
    pub ram_overhead_percent: u64,
    /// Base system reserve for cloud nodes in MB
    pub cloud_reserve_base_mb: u64,
    /// Percent-of-total system reserve for cloud nodes
    pub cloud_reserve_percent: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            ram_overhead_percent: 10,
            cloud_reserve_base_mb: 1024,
            cloud_reserve_percent: 10,
        }
    }
}

// =============================================================================
// Start Queue
// =============================================================================

/// Admission queue and dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dispatcher tick interval in seconds
    pub dispatch_interval_secs: u64,
    /// Placement attempts before a queued workload is marked `error`
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 1,
            max_attempts: 5,
        }
    }
}

// =============================================================================
// Health Probe
// =============================================================================

/// Readiness probe retry window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_secs: 1,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Idle, sleep, and archive sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Hours a stopped workload rests before entering sleep
    pub sleep_after_hours: u64,
    /// Hours since stop before a sleeping workload is archived
    pub archive_after_hours: u64,
    /// Default idle timeout for new workloads in seconds
    pub default_idle_timeout_secs: u64,
    /// Graceful container stop timeout in seconds
    pub stop_timeout_secs: u64,
    /// Retention for archive backups in days
    pub archive_retention_days: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            sleep_after_hours: 1,
            archive_after_hours: 48,
            default_idle_timeout_secs: 900,
            stop_timeout_secs: 30,
            archive_retention_days: 90,
        }
    }
}

impl LifecycleConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

// =============================================================================
// Scaling
// =============================================================================

/// Cloud fleet scaling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// A disabled engine observes and reports but never provisions
    pub enabled: bool,
    /// Tick interval in seconds
    pub check_interval_secs: u64,
    /// Fleet capacity fraction above which a node is provisioned
    pub scale_up_threshold: f64,
    /// Fleet capacity fraction below which an empty node is drained
    pub scale_down_threshold: f64,
    pub max_cloud_nodes: usize,
    pub min_between_scale_ups_secs: u64,
    pub min_between_scale_downs_secs: u64,
    /// Floor RAM for provisioned cloud nodes in MB
    pub cloud_node_ram_mb: u64,
    pub cloud_node_cpus: u32,
    /// Consecutive empty ticks before a draining node is released
    pub drain_empty_ticks: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 120,
            scale_up_threshold: 0.85,
            scale_down_threshold: 0.30,
            max_cloud_nodes: 16,
            min_between_scale_ups_secs: 300,
            min_between_scale_downs_secs: 600,
            cloud_node_ram_mb: 16384,
            cloud_node_cpus: 8,
            drain_empty_ticks: 2,
        }
    }
}

// =============================================================================
// Consolidation
// =============================================================================

/// Cost-driven consolidation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Planning interval in seconds
    pub interval_secs: u64,
    /// Fleet capacity fraction above which planning is skipped
    pub max_capacity: f64,
    /// 0 = off, 1 = suggest only, 2 = auto-execute
    pub optimization_level: u8,
    /// Minimum nodes a planning round must free, when required
    pub freed_node_threshold: usize,
    pub require_freed_threshold: bool,
    /// Whether only_offline workloads with players may still move
    pub allow_migration_with_players: bool,
    /// Player samples older than this count as unknown, in seconds
    pub player_count_stale_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            max_capacity: 0.70,
            optimization_level: 1,
            freed_node_threshold: 2,
            require_freed_threshold: false,
            allow_migration_with_players: false,
            player_count_stale_secs: 120,
        }
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Migration execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Global bound on concurrently executing operations
    pub max_parallel: usize,
    /// Transfer-phase retries
    pub max_retries: u32,
    /// Cooldown after a completed or failed non-manual operation, minutes
    pub cooldown_minutes: u64,
    pub backup_timeout_secs: u64,
    /// Transfer deadline scales with archive size between floor and ceiling
    pub transfer_timeout_floor_secs: u64,
    pub transfer_timeout_ceiling_secs: u64,
    pub transfer_secs_per_gb: u64,
    /// Graceful stop deadline during cutover, seconds
    pub cutover_stop_timeout_secs: u64,
    /// Retention for pre-migration backups in days
    pub backup_retention_days: u32,
    /// Staging path for the cutover's final volume sync between agents
    pub staging_dir: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_retries: 3,
            cooldown_minutes: 15,
            backup_timeout_secs: 600,
            transfer_timeout_floor_secs: 120,
            transfer_timeout_ceiling_secs: 1800,
            transfer_secs_per_gb: 60,
            cutover_stop_timeout_secs: 30,
            backup_retention_days: 7,
            staging_dir: "/var/lib/conductor/staging".into(),
        }
    }
}

impl MigrationConfig {
    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn cutover_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.cutover_stop_timeout_secs)
    }

    /// Transfer deadline sized to the archive, clamped to floor and ceiling
    pub fn transfer_timeout(&self, archive_bytes: u64) -> Duration {
        let gb = archive_bytes.div_ceil(1024 * 1024 * 1024);
        let secs = (gb * self.transfer_secs_per_gb)
            .max(self.transfer_timeout_floor_secs)
            .min(self.transfer_timeout_ceiling_secs);
        Duration::from_secs(secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }
}

// =============================================================================
// Event Bus
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Per-subscriber inbox capacity
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

// =============================================================================
// Conductor Config
// =============================================================================

/// Root configuration for the conductor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub placement: PlacementConfig,
    pub queue: QueueConfig,
    pub probe: ProbeConfig,
    pub lifecycle: LifecycleConfig,
    pub scaling: ScalingConfig,
    pub consolidation: ConsolidationConfig,
    pub migration: MigrationConfig,
    pub billing: RateTable,
    pub events: EventBusConfig,
}

impl ConductorConfig {
    /// Load from a YAML file; missing keys fall back to defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the control loops cannot operate under
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.scaling.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scaling.scale_down_threshold)
        {
            return Err(Error::Configuration(
                "scaling thresholds must be within [0, 1]".into(),
            ));
        }
        if self.scaling.scale_down_threshold >= self.scaling.scale_up_threshold {
            return Err(Error::Configuration(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if self.consolidation.optimization_level > 2 {
            return Err(Error::Configuration(
                "optimization_level must be 0, 1, or 2".into(),
            ));
        }
        if self.migration.max_parallel == 0 {
            return Err(Error::Configuration(
                "migration.max_parallel must be at least 1".into(),
            ));
        }
        if self.placement.ram_overhead_percent >= 100 {
            return Err(Error::Configuration(
                "ram_overhead_percent must be below 100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConductorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scaling.check_interval_secs, 120);
        assert_eq!(config.consolidation.interval_secs, 1800);
        assert_eq!(config.migration.max_parallel, 3);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "scaling:\n  max_cloud_nodes: 4\n";
        let config: ConductorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scaling.max_cloud_nodes, 4);
        assert_eq!(config.scaling.check_interval_secs, 120);
        assert_eq!(config.queue.max_attempts, 5);
    }

    #[test]
    fn test_from_yaml_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "queue:\n  max_attempts: 9\nmigration:\n  max_parallel: 2\n  staging_dir: /tmp/staging"
        )
        .unwrap();

        let config = ConductorConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.queue.max_attempts, 9);
        assert_eq!(config.migration.max_parallel, 2);
        assert_eq!(config.migration.staging_dir, "/tmp/staging");
        // Untouched sections keep their defaults.
        assert_eq!(config.scaling.max_cloud_nodes, 16);
    }

    #[test]
    fn test_from_yaml_file_rejects_invalid() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "migration:\n  max_parallel: 0").unwrap();
        assert!(matches!(
            ConductorConfig::from_yaml_file(file.path()),
            Err(Error::Configuration(_))
        ));

        assert!(ConductorConfig::from_yaml_file("/nonexistent/conductor.yaml").is_err());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = ConductorConfig::default();
        config.scaling.scale_down_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_timeout_clamped() {
        let config = MigrationConfig::default();
        // Tiny archive hits the floor
        assert_eq!(
            config.transfer_timeout(100 * 1024 * 1024),
            Duration::from_secs(120)
        );
        // Huge archive hits the ceiling
        assert_eq!(
            config.transfer_timeout(600 * 1024 * 1024 * 1024),
            Duration::from_secs(1800)
        );
        // Mid-size scales linearly
        assert_eq!(
            config.transfer_timeout(5 * 1024 * 1024 * 1024),
            Duration::from_secs(300)
        );
    }
}
