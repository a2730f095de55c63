//! Registered clients of a room and master election.

use std::collections::BTreeMap;

use rally_net::ClientId;
use rally_net::messages::{ClientInfo, ClientProfile};

/// One registered client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub profile: ClientProfile,
    /// Registration order; lower joined earlier.
    pub join_seq: u64,
    /// Replay finished; the client receives live RPC and SyncVar traffic.
    pub ready: bool,
}

/// Result of removing a client.
#[derive(Debug)]
pub struct Departure {
    pub record: ClientRecord,
    /// Set when the departed client was master and someone took over.
    pub new_master: Option<ClientId>,
}

/// Registered clients and the current master.
#[derive(Debug, Default)]
pub struct ClientRoster {
    clients: BTreeMap<ClientId, ClientRecord>,
    next_seq: u64,
    master: Option<ClientId>,
}

impl ClientRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. The first client becomes master. Returns `false`
    /// if the id is already registered.
    pub fn insert(&mut self, id: ClientId, profile: ClientProfile) -> bool {
        if self.clients.contains_key(&id) {
            return false;
        }
        let join_seq = self.next_seq;
        self.next_seq += 1;
        self.clients.insert(
            id,
            ClientRecord {
                id,
                profile,
                join_seq,
                ready: false,
            },
        );
        if self.master.is_none() {
            self.master = Some(id);
        }
        true
    }

    /// Unregister a client, promoting the longest-connected remaining client
    /// if it was master.
    pub fn remove(&mut self, id: ClientId) -> Option<Departure> {
        let record = self.clients.remove(&id)?;
        let mut new_master = None;
        if self.master == Some(id) {
            self.master = self
                .clients
                .values()
                .min_by_key(|client| client.join_seq)
                .map(|client| client.id);
            new_master = self.master;
        }
        Some(Departure { record, new_master })
    }

    /// Current master.
    pub fn master(&self) -> Option<ClientId> {
        self.master
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Mark a client ready. Returns `false` if unknown or already ready.
    pub fn set_ready(&mut self, id: ClientId) -> bool {
        match self.clients.get_mut(&id) {
            Some(client) if !client.ready => {
                client.ready = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_ready(&self, id: ClientId) -> bool {
        self.clients.get(&id).is_some_and(|client| client.ready)
    }

    /// Every registered client id.
    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Ids of ready clients.
    pub fn ready_ids(&self) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|client| client.ready)
            .map(|client| client.id)
            .collect()
    }

    /// Public view of every client, in join order.
    pub fn infos(&self) -> Vec<ClientInfo> {
        let mut records: Vec<&ClientRecord> = self.clients.values().collect();
        records.sort_by_key(|client| client.join_seq);
        records
            .into_iter()
            .map(|client| ClientInfo {
                id: client.id,
                profile: client.profile.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
