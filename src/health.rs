//! Readiness probing
//!
//! A workload is ready when its protocol-level probe answers within a
//! bounded retry window. The probe itself is opaque to the conductor; the
//! start dispatcher and the migration coordinator both wait through this
//! helper.

use crate::config::ProbeConfig;
use crate::domain::ports::{HostDriverRef, ProbeResult};
use crate::domain::types::{ContainerHandle, NodeId};
use crate::error::{Error, Result};
use tracing::debug;

/// Wait until the container answers its readiness probe.
///
/// `NotReady` answers retry at the configured interval; `Failed` is a
/// permanent driver error; an exhausted window is a timeout.
pub async fn wait_ready(
    driver: &HostDriverRef,
    node: &NodeId,
    handle: &ContainerHandle,
    config: &ProbeConfig,
) -> Result<()> {
    for attempt in 1..=config.max_attempts {
        match driver.probe(node, handle).await? {
            ProbeResult::Ready => {
                debug!("container {} ready after {} probes", handle, attempt);
                return Ok(());
            }
            ProbeResult::Failed => {
                return Err(Error::driver_permanent(format!(
                    "container {} failed its readiness probe",
                    handle
                )));
            }
            ProbeResult::NotReady => {
                tokio::time::sleep(config.interval()).await;
            }
        }
    }
    Err(Error::Timeout {
        operation: format!("readiness probe for container {}", handle),
        seconds: config.max_attempts as u64 * config.interval_secs,
    })
}
