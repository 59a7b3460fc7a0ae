//! Start queue
//!
//! Admission queue for workload starts that could not be placed
//! immediately. FIFO within an owner, round-robin across owners so one
//! tenant submitting a burst cannot starve the rest. The dispatcher loop
//! pops entries, asks the placer, and either drives the container up or
//! requeues with an attempt counter.

use crate::config::ConductorConfig;
use crate::domain::ports::{ContainerSpec, HostDriverRef, PortMapping, VolumeBinding};
use crate::domain::types::{Workload, WorkloadId, WorkloadStatus};
use crate::error::{Error, Result};
use crate::events::{ConductorEvent, EventBus};
use crate::health;
use crate::lifecycle::BillingRecorder;
use crate::placer::PlacementConstraints;
use crate::registry::FleetRegistry;
use crate::sync::WorkloadLocks;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Queue
// =============================================================================

/// One queued start request
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub workload_id: WorkloadId,
    pub owner_id: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Per-owner FIFO lanes in stable insertion order
    owners: IndexMap<String, VecDeque<QueueEntry>>,
    /// Round-robin position across owner lanes
    cursor: usize,
    depth: usize,
}

/// Owner-fair admission queue
pub struct StartQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    bus: EventBus,
}

impl StartQueue {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            bus,
        })
    }

    /// Append a fresh start request to the owner's lane
    pub fn enqueue(&self, workload_id: WorkloadId, owner_id: impl Into<String>) {
        let owner_id = owner_id.into();
        let entry = QueueEntry {
            workload_id,
            owner_id: owner_id.clone(),
            attempts: 0,
            enqueued_at: Utc::now(),
        };
        self.push(entry);
    }

    /// Put a popped entry back at the tail with its attempt counted
    pub fn requeue(&self, mut entry: QueueEntry) {
        entry.attempts += 1;
        self.push(entry);
    }

    fn push(&self, entry: QueueEntry) {
        {
            let mut state = self.inner.lock();
            state
                .owners
                .entry(entry.owner_id.clone())
                .or_default()
                .push_back(entry);
            state.depth += 1;
            self.publish_depth(&state);
        }
        self.notify.notify_one();
    }

    /// Pop the next entry, rotating across owner lanes
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut state = self.inner.lock();
        if state.owners.is_empty() {
            return None;
        }

        let lanes = state.owners.len();
        let start = state.cursor % lanes;
        for offset in 0..lanes {
            let idx = (start + offset) % lanes;
            let drained = {
                let Some((_, lane)) = state.owners.get_index_mut(idx) else {
                    continue;
                };
                if lane.is_empty() {
                    // Lanes are removed when drained, but guard anyway.
                    continue;
                }
                let entry = lane.pop_front();
                (entry, lane.is_empty())
            };
            let (entry, now_empty) = drained;
            if let Some(entry) = entry {
                if now_empty {
                    state.owners.shift_remove_index(idx);
                    // The next lane slid into this index.
                    state.cursor = idx;
                } else {
                    state.cursor = idx + 1;
                }
                state.depth -= 1;
                self.publish_depth(&state);
                return Some(entry);
            }
        }
        None
    }

    /// Drop a queued entry, e.g. when its workload is deleted
    pub fn remove(&self, workload_id: &WorkloadId) -> bool {
        let mut state = self.inner.lock();
        let mut removed = false;
        for lane in state.owners.values_mut() {
            let before = lane.len();
            lane.retain(|e| &e.workload_id != workload_id);
            removed |= lane.len() != before;
        }
        if removed {
            state.owners.retain(|_, lane| !lane.is_empty());
            state.depth = state.owners.values().map(|l| l.len()).sum();
            self.publish_depth(&state);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of every queued entry, in lane order
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner
            .lock()
            .owners
            .values()
            .flat_map(|lane| lane.iter().cloned())
            .collect()
    }

    /// Wait until something is enqueued
    pub async fn wait_nonempty(&self) {
        self.notify.notified().await;
    }

    fn publish_depth(&self, state: &QueueState) {
        self.bus.publish(ConductorEvent::QueueUpdated {
            depth: state.depth,
            owners: state.owners.len(),
        });
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Everything the dispatcher needs to drive a start
pub struct Dispatcher {
    pub registry: Arc<FleetRegistry>,
    pub queue: Arc<StartQueue>,
    pub driver: HostDriverRef,
    pub billing: Arc<BillingRecorder>,
    pub locks: Arc<WorkloadLocks>,
    pub config: Arc<ConductorConfig>,
}

impl Dispatcher {
    /// Run the dispatch loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.queue.dispatch_interval_secs.max(1));
        info!("start queue dispatcher running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("start queue dispatcher stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.queue.wait_nonempty() => {}
            }
            self.drain_tick().await;
        }
    }

    /// Process at most one pass over the current queue depth. Stops at the
    /// first capacity miss so requeued entries are not spun on within a
    /// single tick.
    pub async fn drain_tick(&self) {
        let pending = self.queue.len();
        for _ in 0..pending {
            let Some(entry) = self.queue.pop() else {
                return;
            };
            match self.dispatch_one(entry).await {
                Ok(true) => {}
                // Fleet is full right now; later entries would only churn.
                Ok(false) => return,
                Err(e) => {
                    warn!("dispatch error: {}", e);
                }
            }
        }
    }

    /// Try to place and start one entry. `Ok(false)` means the fleet had
    /// no capacity and the entry was requeued or errored out.
    async fn dispatch_one(&self, entry: QueueEntry) -> Result<bool> {
        let _serial = self.locks.lock(&entry.workload_id).await;

        let Some(workload) = self.registry.get_workload(&entry.workload_id) else {
            debug!("queued workload {} no longer exists", entry.workload_id);
            return Ok(true);
        };
        if workload.status != WorkloadStatus::Queued {
            debug!(
                "queued workload {} is {}, dropping stale entry",
                entry.workload_id, workload.status
            );
            return Ok(true);
        }

        match self
            .registry
            .place(&entry.workload_id, &PlacementConstraints::default())
        {
            Ok(node) => {
                info!("placing workload {} on node {}", entry.workload_id, node);
                if let Err(e) = self.start_placed(&workload).await {
                    warn!("start of workload {} failed: {}", entry.workload_id, e);
                    self.fail_start(&entry.workload_id, &e).await;
                }
                Ok(true)
            }
            Err(Error::NoCapacity { reason }) => {
                debug!("no capacity for {}: {}", entry.workload_id, reason);
                if entry.attempts + 1 >= self.config.queue.max_attempts {
                    warn!(
                        "workload {} exhausted {} placement attempts",
                        entry.workload_id, self.config.queue.max_attempts
                    );
                    let _ = self.registry.set_status(&entry.workload_id, WorkloadStatus::Error);
                    let _ = self.registry.update_workload(&entry.workload_id, |w| {
                        w.error_reason = Some("no_capacity".into());
                    });
                } else {
                    self.queue.requeue(entry);
                }
                Ok(false)
            }
            Err(e) => {
                self.queue.requeue(entry);
                Err(e)
            }
        }
    }

    /// Drive the container up on the node the workload was just placed on
    async fn start_placed(&self, workload: &Workload) -> Result<()> {
        let id = &workload.id;
        let workload = self.registry.set_status(id, WorkloadStatus::Starting)?;
        let node = workload
            .node_id
            .clone()
            .ok_or_else(|| Error::Internal(format!("workload {} placed without node", id)))?;

        let port = host_port_for(id);
        let spec = container_spec(&workload, port);
        let handle = self.driver.create_container(&node, spec).await?;
        self.registry.update_workload(id, |w| {
            w.container = Some(handle.clone());
            w.port = Some(port);
        })?;

        self.driver.start_container(&node, &handle).await?;
        health::wait_ready(&self.driver, &node, &handle, &self.config.probe).await?;

        let running = self.registry.set_status(id, WorkloadStatus::Running)?;
        self.billing.record_started(&running);
        Ok(())
    }

    /// Roll a failed start back to an errored, parked workload
    async fn fail_start(&self, id: &WorkloadId, cause: &Error) {
        if let Some(workload) = self.registry.get_workload(id) {
            if let (Some(node), Some(handle)) = (&workload.node_id, &workload.container) {
                let _ = self.driver.remove_container(node, handle).await;
            }
        }
        let _ = self.registry.set_status(id, WorkloadStatus::Error);
        let reason = cause.to_string();
        let _ = self.registry.update_workload(id, |w| {
            w.container = None;
            w.error_reason = Some(reason);
        });
        let _ = self.registry.park(id);
    }
}

/// Stable host port for a workload, out of the game-server range
pub(crate) fn host_port_for(id: &WorkloadId) -> u16 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    30000 + (hasher.finish() % 10000) as u16
}

/// Container spec derived from the workload record
pub(crate) fn container_spec(workload: &Workload, host_port: u16) -> ContainerSpec {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("conductor/workload".into(), workload.id.to_string());
    labels.insert("conductor/owner".into(), workload.owner_id.clone());

    let mut env = std::collections::BTreeMap::new();
    env.insert("SERVER_NAME".into(), workload.name.clone());
    env.insert("MAX_RAM_MB".into(), workload.actual_ram_mb.to_string());

    ContainerSpec {
        image: workload.image.clone(),
        ram_limit_mb: workload.actual_ram_mb,
        cpu_quota: 2,
        ports: vec![PortMapping {
            host_port,
            container_port: 25565,
        }],
        labels,
        env,
        volumes: vec![VolumeBinding {
            host_path: format!("/var/lib/conductor/volumes/{}", workload.id),
            container_path: "/data".into(),
        }],
    }
}
