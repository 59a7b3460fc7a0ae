//! Port adapters
//!
//! In-process implementations of the conductor's ports: an in-memory
//! repository, a provisioner over a static inventory, and a loopback
//! host-agent/backup pair. Together they let the binary (and the tests)
//! run the full control plane without external infrastructure; production
//! drivers implement the same traits out of tree.

pub mod loopback;
pub mod memory;
pub mod static_provisioner;

pub use loopback::{LoopbackBackup, LoopbackDriver};
pub use memory::MemoryRepository;
pub use static_provisioner::StaticProvisioner;
