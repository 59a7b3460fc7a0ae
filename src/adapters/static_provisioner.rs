//! Static inventory provisioner
//!
//! Hands out nodes from a fixed pool instead of a cloud API. Provisioning
//! picks the smallest inventory entry that satisfies the requested size;
//! released nodes return to the pool.

use crate::domain::ports::{NodeDescriptor, NodeProvisioner, NodeSize};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Provisioner over a configured node inventory
pub struct StaticProvisioner {
    available: Mutex<Vec<NodeDescriptor>>,
    leased: Mutex<Vec<NodeDescriptor>>,
}

impl StaticProvisioner {
    pub fn new(inventory: Vec<NodeDescriptor>) -> Self {
        Self {
            available: Mutex::new(inventory),
            leased: Mutex::new(Vec::new()),
        }
    }

    /// Nodes still available for lease
    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }
}

#[async_trait]
impl NodeProvisioner for StaticProvisioner {
    async fn provision(
        &self,
        size: NodeSize,
        labels: BTreeMap<String, String>,
    ) -> Result<NodeDescriptor> {
        let mut available = self.available.lock();
        let best = available
            .iter()
            .enumerate()
            .filter(|(_, d)| d.total_ram_mb >= size.ram_mb && d.total_cpus >= size.cpus)
            .min_by_key(|(_, d)| (d.total_ram_mb, d.provider_id.clone()))
            .map(|(i, _)| i);

        let Some(index) = best else {
            return Err(Error::Provisioner(format!(
                "inventory has no node with {} MB / {} cpus",
                size.ram_mb, size.cpus
            )));
        };

        let mut descriptor = available.swap_remove(index);
        descriptor.labels.extend(labels);
        self.leased.lock().push(descriptor.clone());
        Ok(descriptor)
    }

    async fn release(&self, provider_id: &str) -> Result<()> {
        let mut leased = self.leased.lock();
        let index = leased
            .iter()
            .position(|d| d.provider_id == provider_id)
            .ok_or_else(|| Error::not_found("provisioned node", provider_id))?;
        let descriptor = leased.swap_remove(index);
        self.available.lock().push(descriptor);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<NodeDescriptor>> {
        Ok(self.leased.lock().clone())
    }
}

/// Inventory entry helper for configuration and tests
pub fn inventory_node(provider_id: &str, ip: &str, ram_mb: u64, cpus: u32, cost: f64) -> NodeDescriptor {
    NodeDescriptor {
        provider_id: provider_id.to_string(),
        ip: ip.to_string(),
        total_ram_mb: ram_mb,
        total_cpus: cpus,
        hourly_cost: cost,
        labels: BTreeMap::new(),
    }
}
