//! Conductor event bus
//!
//! A bounded in-process broadcast channel. Every registry, queue, and
//! migration mutation publishes here; observers subscribe with their own
//! bounded inbox. A subscriber that falls behind loses events for itself
//! only, counted on its `dropped` tally. The publisher never blocks.

use crate::domain::types::{
    MigrationId, MigrationReason, MigrationStatus, NodeId, NodeKind, WorkloadId, WorkloadStatus,
};
use crate::registry::FleetStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the conductor for external observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConductorEvent {
    /// A node joined the fleet
    NodeCreated {
        node_id: NodeId,
        kind: NodeKind,
        total_ram_mb: u64,
    },

    /// A node left the fleet
    NodeRemoved { node_id: NodeId },

    /// A node's accounting changed
    NodeStats {
        node_id: NodeId,
        allocated_ram_mb: u64,
        free_ram_mb: u64,
        container_count: u32,
    },

    /// A workload record was created
    ContainerCreated {
        workload_id: WorkloadId,
        owner_id: String,
    },

    /// A workload's status or placement changed
    ContainerUpdated {
        workload_id: WorkloadId,
        status: WorkloadStatus,
        node_id: Option<NodeId>,
    },

    /// A migration began executing
    MigrationStarted {
        migration_id: MigrationId,
        workload_id: WorkloadId,
        from_node: NodeId,
        to_node: NodeId,
        reason: MigrationReason,
    },

    /// Progress within an executing migration
    MigrationProgress {
        migration_id: MigrationId,
        status: MigrationStatus,
        progress: u8,
    },

    /// A migration finished successfully
    MigrationCompleted {
        migration_id: MigrationId,
        workload_id: WorkloadId,
    },

    /// A migration failed or was cancelled
    MigrationFailed {
        migration_id: MigrationId,
        workload_id: WorkloadId,
        error: String,
    },

    /// Aggregate fleet statistics snapshot
    StatsFleet { stats: FleetStats },

    /// The start queue changed
    QueueUpdated { depth: usize, owners: usize },
}

/// An event with its publication timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ConductorEvent,
}

// =============================================================================
// Bus
// =============================================================================

/// Broadcast bus for conductor events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// simply not delivered anywhere.
    pub fn publish(&self, event: ConductorEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(EventEnvelope {
            ts: Utc::now(),
            event,
        });
    }

    /// Open a new subscription with its own bounded inbox
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.sender.subscribe(),
            dropped: 0,
        }
    }

    /// Total events published on this bus
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.published_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// A subscription to the bus. Overflowed events are dropped for this
/// subscriber only and counted.
pub struct Subscriber {
    rx: broadcast::Receiver<EventEnvelope>,
    dropped: u64,
}

impl Subscriber {
    /// Receive the next event, skipping over any overflow gap
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when the inbox is currently empty
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events this subscriber has lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_event(depth: usize) -> ConductorEvent {
        ConductorEvent::QueueUpdated { depth, owners: 1 }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        bus.publish(queue_event(1));
        bus.publish(queue_event(2));

        let first = sub.recv().await.unwrap();
        assert!(matches!(
            first.event,
            ConductorEvent::QueueUpdated { depth: 1, .. }
        ));
        let second = sub.recv().await.unwrap();
        assert!(matches!(
            second.event,
            ConductorEvent::QueueUpdated { depth: 2, .. }
        ));
        assert_eq!(sub.dropped(), 0);
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_publisher() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();

        // Publish far beyond the inbox capacity; publish never blocks.
        for i in 0..64 {
            bus.publish(queue_event(i));
        }

        // The slow subscriber sees a gap but keeps receiving recent events.
        let got = slow.try_recv().unwrap();
        assert!(matches!(
            got.event,
            ConductorEvent::QueueUpdated { depth, .. } if depth >= 4
        ));
        assert!(slow.dropped() > 0);
    }

    #[tokio::test]
    async fn test_drop_is_per_subscriber() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();

        for i in 0..32 {
            bus.publish(queue_event(i));
        }

        // A fresh subscriber starts clean and receives what is published next.
        let mut fresh = bus.subscribe();
        bus.publish(queue_event(99));
        let got = fresh.recv().await.unwrap();
        assert!(matches!(
            got.event,
            ConductorEvent::QueueUpdated { depth: 99, .. }
        ));
        assert_eq!(fresh.dropped(), 0);

        slow.try_recv();
        assert!(slow.dropped() > 0);
    }
}
