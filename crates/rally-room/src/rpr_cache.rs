//! Correlation of queries with their responses.
//!
//! Pending queries live in a generational slot map. A [`CorrelationId`] packs
//! the slot index and the slot's generation; freeing a slot bumps the
//! generation, so an id that was resolved, purged or expired never matches
//! again even after its slot is reused.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rally_net::{BehaviourId, ClientId, CorrelationId, DeliveryMode, EntityId, MethodId};

/// Routing data kept for one outstanding query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    /// Client that sent the query and receives the result.
    pub requester: ClientId,
    /// Client expected to answer.
    pub target: ClientId,
    /// Requester-side callback id.
    pub callback: u16,
    pub entity: EntityId,
    pub behaviour: BehaviourId,
    pub method: MethodId,
    /// Mode the query travelled with; the result uses it too.
    pub mode: DeliveryMode,
    /// When the query was registered.
    pub created: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    entry: Option<PendingResponse>,
}

/// Outstanding queries of one room.
#[derive(Debug)]
pub struct RprCache {
    slots: Vec<Slot>,
    /// Free slots, least recently freed first.
    free: VecDeque<u16>,
    len: usize,
    ttl: Duration,
}

/// Slots available; one per possible slot index.
const MAX_SLOTS: usize = u16::MAX as usize + 1;

impl RprCache {
    /// Create a cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            len: 0,
            ttl,
        }
    }

    /// Store a pending query. Returns `None` when every slot is taken.
    pub fn register(&mut self, pending: PendingResponse) -> Option<CorrelationId> {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None if self.slots.len() < MAX_SLOTS => {
                self.slots.push(Slot::default());
                u16::try_from(self.slots.len() - 1).ok()?
            }
            None => return None,
        };
        let slot = &mut self.slots[usize::from(index)];
        slot.entry = Some(pending);
        self.len += 1;
        Some(CorrelationId::new(index, slot.generation))
    }

    /// Look at a pending query without removing it.
    pub fn get(&self, id: CorrelationId) -> Option<&PendingResponse> {
        let slot = self.slots.get(usize::from(id.slot()))?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn free_slot(&mut self, index: u16) -> Option<PendingResponse> {
        let slot = self.slots.get_mut(usize::from(index))?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        self.len -= 1;
        Some(entry)
    }

    /// Remove and return the query matching `id`.
    pub fn resolve(&mut self, id: CorrelationId) -> Option<PendingResponse> {
        self.get(id)?;
        self.free_slot(id.slot())
    }

    /// Drop the query matching `id`. Returns whether it existed.
    pub fn unregister(&mut self, id: CorrelationId) -> bool {
        self.resolve(id).is_some()
    }

    fn remove_where(&mut self, pred: impl Fn(&PendingResponse) -> bool) -> Vec<PendingResponse> {
        let matching: Vec<u16> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.as_ref().is_some_and(&pred))
            .filter_map(|(index, _)| u16::try_from(index).ok())
            .collect();
        matching
            .into_iter()
            .filter_map(|index| self.free_slot(index))
            .collect()
    }

    /// Drop every query `client` sent or was asked to answer.
    pub fn purge_client(&mut self, client: ClientId) -> Vec<PendingResponse> {
        self.remove_where(|p| p.requester == client || p.target == client)
    }

    /// Drop every query older than the TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingResponse> {
        let ttl = self.ttl;
        self.remove_where(|p| now.duration_since(p.created) >= ttl)
    }

    /// Whether any pending query names `client`.
    pub fn references(&self, client: ClientId) -> bool {
        self.slots.iter().any(|slot| {
            slot.entry
                .as_ref()
                .is_some_and(|p| p.requester == client || p.target == client)
        })
    }

    /// Number of pending queries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(requester: u16, target: u16, created: Instant) -> PendingResponse {
        PendingResponse {
            requester: ClientId(requester),
            target: ClientId(target),
            callback: 7,
            entity: EntityId(1),
            behaviour: BehaviourId(0),
            method: MethodId(1),
            mode: DeliveryMode::ReliableOrdered,
            created,
        }
    }

    #[test]
    fn test_resolve_once() {
        let now = Instant::now();
        let mut cache = RprCache::new(Duration::from_secs(30));
        let id = cache.register(pending(1, 2, now)).unwrap();

        assert_eq!(cache.resolve(id).map(|p| p.requester), Some(ClientId(1)));
        assert!(cache.resolve(id).is_none());
        assert!(!cache.unregister(id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reused_slot_gets_new_id() {
        let now = Instant::now();
        let mut cache = RprCache::new(Duration::from_secs(30));
        let first = cache.register(pending(1, 2, now)).unwrap();
        cache.resolve(first);

        let second = cache.register(pending(1, 2, now)).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(cache.get(first).is_none());
        assert!(cache.get(second).is_some());
    }

    #[test]
    fn test_purge_by_requester_or_target() {
        let now = Instant::now();
        let mut cache = RprCache::new(Duration::from_secs(30));
        let asked_by = cache.register(pending(1, 2, now)).unwrap();
        let asked_of = cache.register(pending(3, 1, now)).unwrap();
        let unrelated = cache.register(pending(2, 3, now)).unwrap();

        assert!(cache.references(ClientId(1)));
        assert_eq!(cache.purge_client(ClientId(1)).len(), 2);
        assert!(!cache.references(ClientId(1)));
        assert!(cache.resolve(asked_by).is_none());
        assert!(cache.resolve(asked_of).is_none());
        assert!(cache.resolve(unrelated).is_some());
    }

    #[test]
    fn test_expire_after_ttl() {
        let now = Instant::now();
        let mut cache = RprCache::new(Duration::from_secs(30));
        let old = cache.register(pending(1, 2, now)).unwrap();
        let fresh = cache.register(pending(1, 2, now + Duration::from_secs(20))).unwrap();

        let expired = cache.expire(now + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert!(cache.get(old).is_none());
        assert!(cache.get(fresh).is_some());
        assert_eq!(cache.len(), 1);
    }
}
