use std::collections::HashMap;
use tracing::info;

use crate::identity::Identity;
use crate::session::AgentSession;

struct Slot {
    session: AgentSession,
    last_used: u64,
}

/// In-memory identity → session map.
///
/// Unbounded by default: a session, once created, lives for the whole process.
/// With a capacity, inserting past the bound evicts the least-recently-used
/// session; its wallet state is already on disk and is restored on next contact.
pub struct SessionRegistry {
    slots: HashMap<Identity, Slot>,
    capacity: Option<usize>,
    clock: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl SessionRegistry {
    pub fn unbounded() -> Self {
        Self {
            slots: HashMap::new(),
            capacity: None,
            clock: 0,
        }
    }

    /// `capacity == 0` means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: (capacity > 0).then_some(capacity),
            ..Self::unbounded()
        }
    }

    /// Pure lookup; does not affect eviction order.
    pub fn get(&self, identity: &Identity) -> Option<&AgentSession> {
        self.slots.get(identity).map(|slot| &slot.session)
    }

    /// Lookup for use; marks the session as most recently used.
    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut AgentSession> {
        self.clock += 1;
        let now = self.clock;
        self.slots.get_mut(identity).map(|slot| {
            slot.last_used = now;
            &mut slot.session
        })
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.slots.contains_key(identity)
    }

    /// Insert or replace the session for `session.identity`.
    pub fn put(&mut self, session: AgentSession) {
        let identity = session.identity.clone();
        if let Some(capacity) = self.capacity {
            if !self.slots.contains_key(&identity) && self.slots.len() >= capacity {
                self.evict_lru();
            }
        }

        self.clock += 1;
        self.slots.insert(
            identity,
            Slot {
                session,
                last_used: self.clock,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.slots.remove(&id);
            info!(identity = %id, "evicted least recently used session");
        }
    }
}
