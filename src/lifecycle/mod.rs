//! Workload lifecycle
//!
//! Drives each workload through active, sleep, and archived phases from
//! idle signals and timers, and emits the billing record stream that makes
//! historical cost reconstruction deterministic.

pub mod billing;
pub mod engine;

pub use billing::{phase_timeline, total_cost, BillingRecorder};
pub use engine::{LifecycleEngine, StopReason, WakeupOutcome};
