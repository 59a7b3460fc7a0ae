//! Domain layer - Core records and port definitions
//!
//! This module defines the conductor's owned record types and the traits
//! (ports) that adapters implement, following hexagonal architecture
//! principles.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
