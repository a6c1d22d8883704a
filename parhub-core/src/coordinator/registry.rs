//! Engine registry
//!
//! One arena of engine records keyed by numeric id, with secondary lookups by
//! queue identity and heart identity. A record starts Pending and becomes
//! Active once its heart is confirmed.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{HubError, Result};
use crate::protocol::messages::{EngineNotification, Registration};
use crate::protocol::EngineId;
use crate::runtime::TimerHandle;

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the heart to show up
    Pending,
    /// Heart confirmed
    Active,
}

/// Information about a registered engine
#[derive(Debug)]
pub struct EngineRecord {
    pub id: EngineId,
    /// Routing identity of the engine's task queue
    pub queue: String,
    /// Heart identity
    pub heartbeat: String,
    /// Display name
    pub registration: String,
    pub services: Vec<String>,
    pub state: EngineState,
    pub registered_at: DateTime<Utc>,
    requester: Option<Bytes>,
    deletion: Option<TimerHandle>,
}

impl EngineRecord {
    pub fn is_active(&self) -> bool {
        self.state == EngineState::Active
    }

    /// Identity of the socket that asked for this registration, once
    pub fn take_requester(&mut self) -> Option<Bytes> {
        self.requester.take()
    }

    pub fn notification(&self) -> EngineNotification {
        EngineNotification {
            id: self.id,
            queue: self.queue.clone(),
            heartbeat: self.heartbeat.clone(),
            registration: self.registration.clone(),
            services: self.services.clone(),
        }
    }
}

/// Pending and active engines
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<EngineId, EngineRecord>,
    by_queue: HashMap<String, EngineId>,
    by_heart: HashMap<String, EngineId>,
    dead: HashSet<String>,
    next_id: u32,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if either identity belongs to a pending or active engine
    pub fn check_available(&self, heart: &str, queue: &str) -> Result<()> {
        if self.by_queue.contains_key(queue) {
            return Err(HubError::QueueInUse {
                queue: queue.to_string(),
            });
        }
        if self.by_heart.contains_key(heart) {
            return Err(HubError::HeartInUse {
                heart: heart.to_string(),
            });
        }
        Ok(())
    }

    /// Allocate the next id and store a pending record
    pub fn insert_pending(&mut self, reg: Registration, requester: Option<Bytes>) -> Result<EngineId> {
        self.check_available(&reg.heartbeat, &reg.queue)?;

        let id = EngineId(self.next_id);
        self.next_id += 1;

        self.by_queue.insert(reg.queue.clone(), id);
        self.by_heart.insert(reg.heartbeat.clone(), id);
        // a reused queue identity is no longer dead
        self.dead.remove(&reg.queue);
        self.engines.insert(
            id,
            EngineRecord {
                id,
                queue: reg.queue,
                heartbeat: reg.heartbeat,
                registration: reg.registration,
                services: reg.services,
                state: EngineState::Pending,
                registered_at: Utc::now(),
                requester,
                deletion: None,
            },
        );
        debug!("Engine {} pending", id);
        Ok(id)
    }

    /// Attach the timer that purges an unconfirmed record
    pub fn arm_deletion(&mut self, id: EngineId, handle: TimerHandle) {
        if let Some(record) = self.engines.get_mut(&id) {
            if let Some(previous) = record.deletion.replace(handle) {
                previous.cancel();
            }
        }
    }

    /// Id of the pending record for `heart`, if any
    pub fn pending_for_heart(&self, heart: &str) -> Option<EngineId> {
        self.by_heart
            .get(heart)
            .and_then(|id| self.engines.get(id))
            .filter(|record| record.state == EngineState::Pending)
            .map(|record| record.id)
    }

    /// Move the pending record for `heart` to Active and disarm its timer
    pub fn promote(&mut self, heart: &str) -> Option<&mut EngineRecord> {
        let id = self.pending_for_heart(heart)?;
        let record = self.engines.get_mut(&id)?;
        if let Some(timer) = record.deletion.take() {
            timer.cancel();
        }
        record.state = EngineState::Active;
        info!("Engine {} ({}) active", id, record.queue);
        Some(record)
    }

    /// Drop the record for `heart` if it is still pending; no-op otherwise
    pub fn purge_pending(&mut self, heart: &str) -> Option<EngineRecord> {
        let id = self.pending_for_heart(heart)?;
        self.remove(id)
    }

    /// Remove a record in any state
    pub fn remove(&mut self, id: EngineId) -> Option<EngineRecord> {
        let mut record = self.engines.remove(&id)?;
        self.by_queue.remove(&record.queue);
        self.by_heart.remove(&record.heartbeat);
        self.dead.remove(&record.queue);
        if let Some(timer) = record.deletion.take() {
            timer.cancel();
        }
        Some(record)
    }

    pub fn mark_dead(&mut self, queue: &str) {
        self.dead.insert(queue.to_string());
    }

    pub fn is_dead(&self, queue: &str) -> bool {
        self.dead.contains(queue)
    }

    pub fn get(&self, id: EngineId) -> Result<&EngineRecord> {
        self.engines.get(&id).ok_or_else(|| HubError::UnknownEngine {
            engine: id.to_string(),
        })
    }

    pub fn get_by_queue(&self, queue: &str) -> Result<&EngineRecord> {
        self.by_queue
            .get(queue)
            .and_then(|id| self.engines.get(id))
            .ok_or_else(|| HubError::UnknownEngine {
                engine: queue.to_string(),
            })
    }

    pub fn id_by_heart(&self, heart: &str) -> Option<EngineId> {
        self.by_heart.get(heart).copied()
    }

    pub fn id_by_queue(&self, queue: &str) -> Option<EngineId> {
        self.by_queue.get(queue).copied()
    }

    /// Active id for `id`, or `UnknownEngine`
    pub fn require_active(&self, id: EngineId) -> Result<&EngineRecord> {
        self.get(id)
            .ok()
            .filter(|record| record.is_active())
            .ok_or_else(|| HubError::UnknownEngine {
                engine: id.to_string(),
            })
    }

    pub fn active(&self) -> impl Iterator<Item = &EngineRecord> {
        self.engines.values().filter(|record| record.is_active())
    }

    pub fn active_ids(&self) -> Vec<EngineId> {
        self.active().map(|record| record.id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn pending_count(&self) -> usize {
        self.engines.len() - self.active_count()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TimerQueue;
    use std::time::Duration;

    fn reg(heart: &str, queue: &str) -> Registration {
        Registration {
            heartbeat: heart.into(),
            queue: queue.into(),
            registration: format!("{}-name", queue),
            services: vec![],
        }
    }

    #[test]
    fn test_identities_are_unique_across_states() {
        let mut registry = EngineRegistry::new();
        let id = registry.insert_pending(reg("h1", "q1"), None).unwrap();
        assert_eq!(id, EngineId(0));

        assert!(matches!(
            registry.insert_pending(reg("h2", "q1"), None),
            Err(HubError::QueueInUse { .. })
        ));
        registry.promote("h1").unwrap();
        assert!(matches!(
            registry.insert_pending(reg("h1", "q2"), None),
            Err(HubError::HeartInUse { .. })
        ));
        assert_eq!(registry.len(), 1);
        // rejected requests do not burn ids
        assert_eq!(registry.insert_pending(reg("h3", "q3"), None).unwrap(), EngineId(1));
    }

    #[test]
    fn test_eviction_forgets_dead_queue() {
        let mut registry = EngineRegistry::new();
        let id = registry.insert_pending(reg("h1", "q1"), None).unwrap();
        registry.promote("h1").unwrap();
        registry.mark_dead("q1");
        assert!(registry.is_dead("q1"));

        registry.remove(id).unwrap();
        assert!(!registry.is_dead("q1"));
        assert!(registry.dead.is_empty());
    }

    #[test]
    fn test_promote_cancels_deletion_timer() {
        let mut registry = EngineRegistry::new();
        let mut timers: TimerQueue<()> = TimerQueue::new();
        let id = registry.insert_pending(reg("h1", "q1"), Some(Bytes::from_static(b"req"))).unwrap();
        let handle = timers.schedule(Duration::from_secs(5), |_, _| {});
        registry.arm_deletion(id, handle.clone());

        let record = registry.promote("h1").unwrap();
        assert!(record.is_active());
        assert_eq!(record.take_requester().unwrap(), Bytes::from_static(b"req"));
        assert!(!handle.is_active());
        assert_eq!(registry.active_ids(), vec![id]);
    }

    #[test]
    fn test_purge_pending_is_idempotent() {
        let mut registry = EngineRegistry::new();
        registry.insert_pending(reg("h1", "q1"), None).unwrap();
        registry.promote("h1");

        assert!(registry.purge_pending("h1").is_none());
        assert!(registry.purge_pending("ghost").is_none());
        assert_eq!(registry.active_count(), 1);

        registry.insert_pending(reg("h2", "q2"), None).unwrap();
        assert!(registry.purge_pending("h2").is_some());
        assert!(registry.purge_pending("h2").is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.check_available("h2", "q2").is_ok());
    }

    #[test]
    fn test_unknown_lookups_are_typed_faults() {
        let registry = EngineRegistry::new();
        assert!(matches!(registry.get(EngineId(9)), Err(HubError::UnknownEngine { .. })));
        assert!(matches!(
            registry.get_by_queue("nope"),
            Err(HubError::UnknownEngine { .. })
        ));
    }

    #[test]
    fn test_pending_is_not_active() {
        let mut registry = EngineRegistry::new();
        let id = registry.insert_pending(reg("h1", "q1"), None).unwrap();
        assert!(registry.require_active(id).is_err());
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
