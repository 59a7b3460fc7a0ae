//! Fleet Conductor - Control Plane for Stateful Game-Server Fleets
//!
//! A control-plane orchestrator for a fleet of container hosts running
//! long-lived, stateful game-server workloads on behalf of many tenants.
//! It decides which host runs which workload, what the fleet should look
//! like in aggregate, and how to move a running workload between hosts
//! with bounded disruption.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Fleet Conductor                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐  │
//! │  │  StartQueue  │  │  Lifecycle   │  │   Scaling    │  │Consolidation│  │
//! │  │  Dispatcher  │  │   Engine     │  │   Engine     │  │  Planner    │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘  │
//! │         │                 │                 │                 │         │
//! │         └────────────┬────┴────────┬────────┴───────┬─────────┘         │
//! │                      │             │                │                   │
//! │            ┌─────────┴─────────┐   │      ┌─────────┴──────────┐        │
//! │            │  Fleet Registry   │   │      │     Migration      │        │
//! │            │ (placement lock)  │   │      │    Coordinator     │        │
//! │            └─────────┬─────────┘   │      └─────────┬──────────┘        │
//! │                      │       ┌─────┴─────┐          │                   │
//! │                      └───────┤ Event Bus ├──────────┘                   │
//! │                              └───────────┘                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                               Ports                                      │
//! │   Repository        HostDriver        NodeProvisioner        Backup     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`conductor`]: Top-level wiring, user operations, observer surface
//! - [`registry`]: Node and workload inventory behind one placement lock
//! - [`placer`]: Pure placement policy and migration refusal rules
//! - [`startqueue`]: Owner-fair admission queue and dispatcher
//! - [`lifecycle`]: Idle/sleep/archive engine and billing records
//! - [`scaling`]: Cloud node scale up/down
//! - [`consolidation`]: Cost-driven node vacation planning
//! - [`migration`]: Multi-phase migration state machine
//! - [`events`]: Broadcast bus for observers
//! - [`domain`]: Core records and port traits
//! - [`adapters`]: In-process port implementations
//! - [`error`]: Error types and retry policy

pub mod adapters;
pub mod conductor;
pub mod config;
pub mod consolidation;
pub mod domain;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod migration;
pub mod persist;
pub mod placer;
pub mod registry;
pub mod scaling;
pub mod startqueue;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use conductor::{Conductor, ConductorPorts, ConductorStatus, CreateWorkloadRequest};
pub use config::ConductorConfig;
pub use domain::ports::{
    BackupPort, BackupPortRef, HostDriver, HostDriverRef, NodeProvisioner, NodeProvisionerRef,
    Repository, RepositoryRef,
};
pub use domain::types::{
    classify_tier, LifecyclePhase, MigrationMode, MigrationOperation, MigrationReason,
    MigrationStatus, Node, NodeHealth, NodeId, NodeKind, NodeLifecycle, Plan, Tier, Workload,
    WorkloadId, WorkloadStatus,
};
pub use error::{Error, ErrorAction, Result};
pub use events::{ConductorEvent, EventBus, EventEnvelope, Subscriber};
pub use registry::{FleetRegistry, FleetStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
