//! Server-wide directory of open rooms.
//!
//! The registry only tracks public [`RoomInfo`]; the rooms themselves run on
//! their own tasks. Every change is reported to an [`Announcer`], which is
//! called outside the registry lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rally_net::transport::slugify;
use rally_net::{RoomId, RoomInfo};

/// Parameters of a room to create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomRequest {
    pub name: String,
    pub version: String,
    pub capacity: u16,
    pub password: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Errors raised by [`RoomRegistry::create`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room limit of {0} reached")]
    Full(usize),

    #[error("a room served as '{0}' already exists")]
    NameTaken(String),

    #[error("room id space exhausted")]
    IdsExhausted,
}

/// Receives room directory changes, e.g. to publish them to a lobby service.
pub trait Announcer: Send + Sync {
    /// A room was created or its public info changed.
    fn announce(&self, room: &RoomInfo);

    /// A room is gone.
    fn withdraw(&self, room: RoomId);
}

/// Announcer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&self, room: &RoomInfo) {
        tracing::info!(
            "Room {} '{}' ({}/{})",
            room.id.0,
            room.name,
            room.occupancy,
            room.capacity
        );
    }

    fn withdraw(&self, room: RoomId) {
        tracing::info!("Room {} withdrawn", room.0);
    }
}

struct Inner {
    rooms: BTreeMap<RoomId, RoomInfo>,
    next_id: Option<u32>,
    max_rooms: usize,
}

/// Shared room directory. Cloning shares the same state.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Mutex<Inner>>,
    announcer: Arc<dyn Announcer>,
}

impl RoomRegistry {
    /// Create a registry holding at most `max_rooms` rooms.
    pub fn new(max_rooms: usize, announcer: Arc<dyn Announcer>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rooms: BTreeMap::new(),
                next_id: Some(1),
                max_rooms,
            })),
            announcer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an id and record the room. Room names must map to distinct
    /// URL slugs.
    pub fn create(&self, request: RoomRequest) -> Result<RoomInfo, RegistryError> {
        let info = {
            let mut inner = self.lock();
            if inner.rooms.len() >= inner.max_rooms {
                return Err(RegistryError::Full(inner.max_rooms));
            }
            let slug = slugify(&request.name);
            if inner.rooms.values().any(|room| slugify(&room.name) == slug) {
                return Err(RegistryError::NameTaken(slug));
            }
            let raw = inner.next_id.ok_or(RegistryError::IdsExhausted)?;
            inner.next_id = raw.checked_add(1);

            let info = RoomInfo {
                id: RoomId(raw),
                name: request.name,
                version: request.version,
                occupancy: 0,
                capacity: request.capacity,
                password_protected: request.password.is_some(),
                attributes: request.attributes,
            };
            inner.rooms.insert(info.id, info.clone());
            info
        };
        self.announcer.announce(&info);
        Ok(info)
    }

    /// Record a room's current occupancy. Announces only on change.
    pub fn update_occupancy(&self, id: RoomId, occupancy: u16) {
        let changed = {
            let mut inner = self.lock();
            match inner.rooms.get_mut(&id) {
                Some(room) if room.occupancy != occupancy => {
                    room.occupancy = occupancy;
                    Some(room.clone())
                }
                _ => None,
            }
        };
        if let Some(info) = changed {
            self.announcer.announce(&info);
        }
    }

    /// Forget a room.
    pub fn remove(&self, id: RoomId) -> Option<RoomInfo> {
        let removed = self.lock().rooms.remove(&id);
        if removed.is_some() {
            self.announcer.withdraw(id);
        }
        removed
    }

    pub fn get(&self, id: RoomId) -> Option<RoomInfo> {
        self.lock().rooms.get(&id).cloned()
    }

    /// Every room, by id.
    pub fn list(&self) -> Vec<RoomInfo> {
        self.lock().rooms.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Announcer for Recorder {
        fn announce(&self, room: &RoomInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("announce {} {}", room.id.0, room.occupancy));
        }

        fn withdraw(&self, room: RoomId) {
            self.events.lock().unwrap().push(format!("withdraw {}", room.0));
        }
    }

    fn request(name: &str) -> RoomRequest {
        RoomRequest {
            name: name.to_string(),
            version: "1.0".to_string(),
            capacity: 4,
            ..RoomRequest::default()
        }
    }

    #[test]
    fn test_create_assigns_ids() {
        let registry = RoomRegistry::new(8, Arc::new(LogAnnouncer));
        let a = registry.create(request("Lobby")).unwrap();
        let b = registry.create(request("Arena")).unwrap();
        assert_eq!(a.id, RoomId(1));
        assert_eq!(b.id, RoomId(2));
        assert_eq!(registry.len(), 2);
        assert!(!a.password_protected);
    }

    #[test]
    fn test_slug_collision_refused() {
        let registry = RoomRegistry::new(8, Arc::new(LogAnnouncer));
        registry.create(request("Forest Arena")).unwrap();
        assert_eq!(
            registry.create(request("forest-arena")),
            Err(RegistryError::NameTaken("forest-arena".to_string()))
        );
    }

    #[test]
    fn test_room_limit() {
        let registry = RoomRegistry::new(1, Arc::new(LogAnnouncer));
        let first = registry.create(request("a")).unwrap();
        assert_eq!(registry.create(request("b")), Err(RegistryError::Full(1)));
        registry.remove(first.id);
        assert!(registry.create(request("b")).is_ok());
    }

    #[test]
    fn test_announcements() {
        let recorder = Arc::new(Recorder::default());
        let registry = RoomRegistry::new(8, recorder.clone());
        let room = registry.create(request("a")).unwrap();
        registry.update_occupancy(room.id, 2);
        registry.update_occupancy(room.id, 2);
        registry.remove(room.id);
        registry.remove(room.id);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["announce 1 0", "announce 1 2", "withdraw 1"]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = RoomRegistry::new(8, Arc::new(LogAnnouncer));
        let clone = registry.clone();
        let room = clone.create(request("a")).unwrap();
        assert_eq!(registry.get(room.id).map(|r| r.name), Some("a".to_string()));
        assert_eq!(registry.list().len(), 1);
    }
}
