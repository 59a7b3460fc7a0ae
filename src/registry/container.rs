//! Workload-side registry operations
//!
//! Status transitions are validated against the run-status graph; every
//! mutation persists the record and publishes a container event.

use super::FleetRegistry;
use crate::domain::types::{
    LifecyclePhase, Workload, WorkloadId, WorkloadStatus,
};
use crate::error::{Error, Result};
use crate::events::ConductorEvent;
use chrono::{DateTime, Utc};

/// Filter for workload listings
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub owner_id: Option<String>,
    pub status: Option<WorkloadStatus>,
    pub node_id: Option<crate::domain::types::NodeId>,
}

impl ContainerFilter {
    pub fn matches(&self, workload: &Workload) -> bool {
        self.owner_id
            .as_ref()
            .map_or(true, |o| &workload.owner_id == o)
            && self.status.map_or(true, |s| workload.status == s)
            && self
                .node_id
                .as_ref()
                .map_or(true, |n| workload.node_id.as_ref() == Some(n))
    }
}

impl FleetRegistry {
    /// Insert a new workload record
    pub fn insert_workload(&self, workload: Workload) -> Result<()> {
        let mut state = self.state.lock();
        if state.workloads.contains_key(&workload.id) {
            return Err(Error::WorkloadExists {
                workload_id: workload.id.to_string(),
            });
        }
        self.persist.workload(&workload);
        self.bus.publish(ConductorEvent::ContainerCreated {
            workload_id: workload.id.clone(),
            owner_id: workload.owner_id.clone(),
        });
        state.workloads.insert(workload.id.clone(), workload);
        Ok(())
    }

    /// Defensive copy of one workload
    pub fn get_workload(&self, id: &WorkloadId) -> Option<Workload> {
        self.state.lock().workloads.get(id).cloned()
    }

    /// Defensive copies of all workloads matching the filter
    pub fn list_workloads(&self, filter: &ContainerFilter) -> Vec<Workload> {
        let mut workloads: Vec<Workload> = self
            .state
            .lock()
            .workloads
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        workloads
    }

    /// Transition run status along the status graph, stamping the
    /// started/stopped times. Returns the updated record.
    pub fn set_status(&self, id: &WorkloadId, to: WorkloadStatus) -> Result<Workload> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;

        if !workload.status.can_transition(to) {
            return Err(Error::InvalidState {
                entity: format!("workload {}", id),
                from: workload.status.to_string(),
                to: to.to_string(),
            });
        }

        workload.status = to;
        let now = Utc::now();
        match to {
            WorkloadStatus::Running => {
                workload.last_started = Some(now);
                workload.last_activity = Some(now);
                workload.error_reason = None;
            }
            WorkloadStatus::Stopped => {
                workload.last_stopped = Some(now);
            }
            _ => {}
        }

        self.persist.workload(workload);
        self.bus.publish(ConductorEvent::ContainerUpdated {
            workload_id: workload.id.clone(),
            status: workload.status,
            node_id: workload.node_id.clone(),
        });
        Ok(workload.clone())
    }

    /// Transition the billing phase; returns (updated record, previous phase)
    pub fn set_phase(
        &self,
        id: &WorkloadId,
        to: LifecyclePhase,
    ) -> Result<(Workload, LifecyclePhase)> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        let previous = workload.phase;
        workload.phase = to;
        self.persist.workload(workload);
        Ok((workload.clone(), previous))
    }

    /// Apply an arbitrary field mutation outside the status graph
    /// (container handle, port, archive pointers, error reason).
    pub fn update_workload(
        &self,
        id: &WorkloadId,
        mutate: impl FnOnce(&mut Workload),
    ) -> Result<Workload> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        mutate(workload);
        self.persist.workload(workload);
        Ok(workload.clone())
    }

    /// Record an activity heartbeat. Positive player counts extend the
    /// last-activity time.
    pub fn record_activity(
        &self,
        id: &WorkloadId,
        player_count: u32,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        workload.player_count = player_count;
        workload.player_count_at = Some(ts);
        if player_count > 0 {
            workload.last_activity = Some(ts);
        }
        self.persist.workload(workload);
        Ok(())
    }

    /// Remove a workload record; it must not hold RAM anywhere
    pub fn remove_workload(&self, id: &WorkloadId) -> Result<Workload> {
        let mut state = self.state.lock();
        match state.workloads.get(id) {
            None => return Err(Error::not_found("workload", id)),
            Some(w) if w.placement_active => {
                return Err(Error::InvalidState {
                    entity: format!("workload {}", id),
                    from: w.status.to_string(),
                    to: "removed".to_string(),
                });
            }
            Some(_) => {}
        }
        let workload = state
            .workloads
            .remove(id)
            .ok_or_else(|| Error::not_found("workload", id))?;
        self.persist.delete_workload(id);
        Ok(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::persist::PersistHandle;
    use crate::testutil;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn registry() -> Arc<FleetRegistry> {
        FleetRegistry::new(EventBus::new(64), PersistHandle::noop())
    }

    #[test]
    fn test_insert_and_duplicate() {
        let registry = registry();
        let w = testutil::workload("w-1", 4096);
        registry.insert_workload(w.clone()).unwrap();
        assert_matches!(
            registry.insert_workload(w),
            Err(Error::WorkloadExists { .. })
        );
    }

    #[test]
    fn test_status_graph_enforced() {
        let registry = registry();
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");

        // stopped -> starting -> running -> stopping -> stopped
        registry.set_status(&id, WorkloadStatus::Starting).unwrap();
        let running = registry.set_status(&id, WorkloadStatus::Running).unwrap();
        assert!(running.last_started.is_some());

        assert_matches!(
            registry.set_status(&id, WorkloadStatus::Stopped),
            Err(Error::InvalidState { .. })
        );

        registry.set_status(&id, WorkloadStatus::Stopping).unwrap();
        let stopped = registry.set_status(&id, WorkloadStatus::Stopped).unwrap();
        assert!(stopped.last_stopped.is_some());

        // Any state may error.
        registry.set_status(&id, WorkloadStatus::Error).unwrap();
    }

    #[test]
    fn test_record_activity_extends_last_activity() {
        let registry = registry();
        registry
            .insert_workload(testutil::workload("w-1", 4096))
            .unwrap();
        let id = WorkloadId::new("w-1");
        let ts = Utc::now();

        registry.record_activity(&id, 0, ts).unwrap();
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.player_count, 0);
        assert!(w.last_activity.is_none());

        registry.record_activity(&id, 3, ts).unwrap();
        let w = registry.get_workload(&id).unwrap();
        assert_eq!(w.player_count, 3);
        assert_eq!(w.last_activity, Some(ts));
    }

    #[test]
    fn test_list_by_owner() {
        let registry = registry();
        let mut a = testutil::workload("w-a", 4096);
        a.owner_id = "alice".into();
        let mut b = testutil::workload("w-b", 4096);
        b.owner_id = "bob".into();
        registry.insert_workload(a).unwrap();
        registry.insert_workload(b).unwrap();

        let alice = registry.list_workloads(&ContainerFilter {
            owner_id: Some("alice".into()),
            ..Default::default()
        });
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id.as_str(), "w-a");
    }
}
