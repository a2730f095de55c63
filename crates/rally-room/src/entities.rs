//! Live entities of a room, with their buffers and ownership rules.

use std::collections::BTreeMap;

use rally_net::messages::{EntityInfo, SpawnRequest};
use rally_net::{BehaviourId, ClientId, EntityId};

use crate::rpc_buffer::{BufferedMessage, RpcBuffer};
use crate::syncvar_buffer::SyncVarBuffer;

/// One spawned entity.
#[derive(Debug)]
pub struct Entity {
    pub info: EntityInfo,
    pub rpcs: RpcBuffer,
    pub syncvars: SyncVarBuffer,
}

impl Entity {
    /// Current owner; [`ClientId::SERVER`] when ownerless.
    pub fn owner(&self) -> ClientId {
        self.info.owner
    }

    /// Whether `behaviour` exists on this entity.
    pub fn has_behaviour(&self, behaviour: BehaviourId) -> bool {
        behaviour.0 < self.info.behaviours
    }

    /// Whether `client` may destroy this entity.
    pub fn can_destroy(&self, client: ClientId, master: Option<ClientId>) -> bool {
        self.info.owner == client || master == Some(client)
    }

    /// Whether `client` may write SyncVars. Ownerless entities are written by
    /// the master.
    pub fn can_write(&self, client: ClientId, master: Option<ClientId>) -> bool {
        if self.info.owner == ClientId::SERVER {
            master == Some(client)
        } else {
            self.info.owner == client
        }
    }

    /// Drop every buffered RPC and SyncVar, returning them.
    pub fn clear_buffers(&mut self) -> Vec<BufferedMessage> {
        let mut cleared = self.syncvars.clear_all();
        cleared.extend(self.rpcs.clear_all());
        cleared
    }
}

/// Entity table of one room. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Entity>,
    next_id: Option<u32>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: Some(1),
        }
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity owned by `owner`. Returns `None` once the id space is
    /// exhausted.
    pub fn spawn(&mut self, owner: ClientId, request: SpawnRequest) -> Option<&Entity> {
        let raw = self.next_id?;
        self.next_id = raw.checked_add(1);
        let id = EntityId(raw);
        let entity = Entity {
            info: EntityInfo {
                id,
                owner,
                type_tag: request.type_tag,
                persistent: request.persistent,
                behaviours: request.behaviours,
                payload: request.payload,
            },
            rpcs: RpcBuffer::new(),
            syncvars: SyncVarBuffer::new(),
        };
        Some(self.entities.entry(id).or_insert(entity))
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Change an entity's owner. Returns `false` if it does not exist.
    pub fn set_owner(&mut self, id: EntityId, owner: ClientId) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.info.owner = owner;
                true
            }
            None => false,
        }
    }

    /// Ids of entities owned by `client`.
    pub fn owned_by(&self, client: ClientId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|entity| entity.info.owner == client)
            .map(|entity| entity.info.id)
            .collect()
    }

    /// Snapshot of every entity, by id.
    pub fn infos(&self) -> Vec<EntityInfo> {
        self.entities.values().map(|entity| entity.info.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Remove every entity.
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
