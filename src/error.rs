//! Error types for the fleet conductor
//!
//! Provides structured error types for all conductor components including
//! the registries, placement, control loops, and migration execution.

use std::time::Duration;
use thiserror::Error;

/// Severity of a host-driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFault {
    /// Retried per policy
    Transient,
    /// Surfaces as an `error` workload state
    Permanent,
}

impl std::fmt::Display for DriverFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverFault::Transient => write!(f, "transient"),
            DriverFault::Permanent => write!(f, "permanent"),
        }
    }
}

/// Unified error type for the conductor
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("No capacity: {reason}")]
    NoCapacity { reason: String },

    #[error("Node already registered: {node_id}")]
    NodeExists { node_id: String },

    #[error("Workload already exists: {workload_id}")]
    WorkloadExists { workload_id: String },

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("Not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid state for {entity}: {from} -> {to}")]
    InvalidState {
        entity: String,
        from: String,
        to: String,
    },

    // =========================================================================
    // Serial-Section Errors
    // =========================================================================
    #[error("Workload busy: {workload_id}")]
    Busy { workload_id: String },

    #[error("Migration already in progress for workload {workload_id}")]
    MigrationInProgress { workload_id: String },

    #[error("Migration cooldown active for workload {workload_id}")]
    CooldownActive { workload_id: String },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    #[error("Policy denies {action} for workload {workload_id}: {reason}")]
    PolicyDenied {
        workload_id: String,
        action: String,
        reason: String,
    },

    // =========================================================================
    // Port Errors
    // =========================================================================
    #[error("Driver error ({fault}): {reason}")]
    Driver { fault: DriverFault, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Provisioner error: {0}")]
    Provisioner(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Deadline expired: {operation} after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error inside a control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for an external change
    NoRequeue,
}

impl Error {
    /// Convenience constructor for a transient driver failure
    pub fn driver_transient(reason: impl Into<String>) -> Self {
        Error::Driver {
            fault: DriverFault::Transient,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for a permanent driver failure
    pub fn driver_permanent(reason: impl Into<String>) -> Self {
        Error::Driver {
            fault: DriverFault::Permanent,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for a missing entity
    pub fn not_found(kind: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Determine what action a control loop should take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient port failures - retry with backoff
            Error::Persistence(_)
            | Error::Provisioner(_)
            | Error::Timeout { .. }
            | Error::Driver {
                fault: DriverFault::Transient,
                ..
            } => ErrorAction::RequeueWithBackoff,

            // In-progress operations - wait
            Error::Busy { .. } | Error::MigrationInProgress { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Cooldowns expire on their own - longer wait
            Error::CooldownActive { .. } => ErrorAction::RequeueAfter(Duration::from_secs(300)),

            // Capacity issues resolve through scaling or consolidation
            Error::NoCapacity { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Terminal per-entity outcomes - wait for an external change
            Error::Configuration(_)
            | Error::PolicyDenied { .. }
            | Error::InvalidState { .. }
            | Error::Cancelled
            | Error::Driver {
                fault: DriverFault::Permanent,
                ..
            }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_)
                | Error::Provisioner(_)
                | Error::Timeout { .. }
                | Error::Driver {
                    fault: DriverFault::Transient,
                    ..
                }
        )
    }
}

/// Result type alias for the conductor
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Busy {
            workload_id: "w-1".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::NoCapacity {
            reason: "fleet full".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::driver_transient("agent unreachable");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let permanent = Error::driver_permanent("image missing");
        assert!(!permanent.is_retryable());
        assert!(!permanent.is_transient());

        let timeout = Error::Timeout {
            operation: "transfer".into(),
            seconds: 120,
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_transient());
    }
}
