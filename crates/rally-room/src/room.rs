//! The room orchestrator.
//!
//! A [`Room`] owns one transport context together with the client roster, the
//! entity table and the query cache. It is driven by [`Room::tick`]: poll the
//! context, dispatch every event, expire stale queries, flush the send queues.
//! Nothing in here blocks, and nothing is shared with other rooms.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use rally_net::messages::{
    BufferMode, ClientInfo, ClientLeft, DestroyRequest, EntityDestroyed, EntityOwnerChanged,
    EntitySpawned, MasterChanged, RegisterAccepted, RegisterRejected, RegisterRequest,
    RpcBroadcast, RpcQuery, RpcTarget, RprResponse, RprResult, SpawnRequest, SyncVarWrite,
};
use rally_net::{
    Backend, BehaviourId, ClientId, ContextConfig, ContextEvent, DeliveryMode, DisconnectCode,
    EntityId, Envelope, Message, RoomId, RoomInfo, TransportContext, TransportError,
};

use crate::clients::ClientRoster;
use crate::entities::EntityRegistry;
use crate::rpc_buffer::{BufferedMessage, RpcKey};
use crate::rpr_cache::{PendingResponse, RprCache};
use crate::syncvar_buffer::SyncVarKey;

/// Control traffic always travels reliably and in order.
const CONTROL: DeliveryMode = DeliveryMode::ReliableOrdered;

/// Lifecycle of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Created, transport context not started yet.
    Starting,
    /// Accepting registrations and relaying traffic.
    Open,
    /// Shutting down.
    Closing,
    /// Transport context torn down.
    Closed,
}

/// Errors raised by room lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The operation is not valid in the current state.
    #[error("room is {0:?}")]
    InvalidState(RoomState),

    /// The transport context failed to start.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Static settings of one room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub name: String,
    /// Client version required to register.
    pub version: String,
    /// Maximum registered clients.
    pub capacity: u16,
    pub password: Option<String>,
    pub attributes: BTreeMap<String, String>,
    /// Lifetime of an unanswered query.
    pub rpr_ttl: Duration,
    /// Minimum time before a released client id is handed out again.
    pub client_id_grace: Duration,
    /// Close the room after it has been empty this long.
    pub auto_close_after: Option<Duration>,
    /// Packet cap on transports without an MTU.
    pub max_batch_bytes: usize,
}

impl RoomSettings {
    /// Settings with defaults for everything but name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capacity: 16,
            password: None,
            attributes: BTreeMap::new(),
            rpr_ttl: Duration::from_secs(30),
            client_id_grace: Duration::from_secs(5),
            auto_close_after: None,
            max_batch_bytes: 64 * 1024,
        }
    }
}

/// One isolated group of clients and entities.
pub struct Room {
    id: RoomId,
    settings: RoomSettings,
    state: RoomState,
    context: TransportContext,
    roster: ClientRoster,
    entities: EntityRegistry,
    rpr: RprCache,
    /// Buffered entries authored per client. Ids with a non-zero count are
    /// not recycled.
    ledger: FxHashMap<ClientId, usize>,
    empty_since: Option<Instant>,
    stop_requested: bool,
}

impl Room {
    /// Create a room over an unstarted backend.
    pub fn new(id: RoomId, settings: RoomSettings, backend: Box<dyn Backend>) -> Self {
        let context = TransportContext::new(
            backend,
            ContextConfig {
                max_batch_bytes: settings.max_batch_bytes,
                client_id_grace: settings.client_id_grace,
            },
        );
        Self {
            id,
            rpr: RprCache::new(settings.rpr_ttl),
            settings,
            state: RoomState::Starting,
            context,
            roster: ClientRoster::new(),
            entities: EntityRegistry::new(),
            ledger: FxHashMap::default(),
            empty_since: None,
            stop_requested: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Address clients connect to, once open.
    pub fn address(&self) -> Option<String> {
        self.context.address()
    }

    /// Registered clients.
    pub fn occupancy(&self) -> u16 {
        u16::try_from(self.roster.len()).unwrap_or(u16::MAX)
    }

    pub fn master(&self) -> Option<ClientId> {
        self.roster.master()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Unanswered queries.
    pub fn pending_responses(&self) -> usize {
        self.rpr.len()
    }

    /// Live buffered entries authored by `client`.
    pub fn buffered_by(&self, client: ClientId) -> usize {
        self.ledger.get(&client).copied().unwrap_or(0)
    }

    /// Public description of the room.
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.settings.name.clone(),
            version: self.settings.version.clone(),
            occupancy: self.occupancy(),
            capacity: self.settings.capacity,
            password_protected: self.settings.password.is_some(),
            attributes: self.settings.attributes.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the transport context and open the room.
    pub fn start(&mut self, now: Instant) -> Result<(), RoomError> {
        if self.state != RoomState::Starting {
            return Err(RoomError::InvalidState(self.state));
        }
        self.context.start()?;
        self.state = RoomState::Open;
        self.empty_since = Some(now);
        tracing::info!(
            "Room {} '{}' open on {} at {}",
            self.id.0,
            self.settings.name,
            self.context.kind(),
            self.address().unwrap_or_default()
        );
        Ok(())
    }

    /// Ask the room to close on its next tick.
    pub fn request_stop(&mut self) {
        if self.state == RoomState::Starting {
            self.state = RoomState::Closed;
        }
        self.stop_requested = true;
    }

    /// Run one cooperative step.
    pub fn tick(&mut self, now: Instant) -> RoomState {
        if self.state != RoomState::Open {
            return self.state;
        }

        let events = {
            let ledger = &self.ledger;
            let rpr = &self.rpr;
            let in_use =
                |client: ClientId| ledger.get(&client).is_some_and(|&n| n > 0) || rpr.references(client);
            self.context.poll(now, &in_use)
        };
        for event in events {
            match event {
                ContextEvent::Connected(client) => {
                    tracing::debug!("{client} connected to room {}", self.id.0);
                }
                ContextEvent::Message {
                    client,
                    envelope,
                    mode,
                } => self.dispatch(client, &envelope, mode, now),
                ContextEvent::Disconnected { client, code } => self.handle_departure(client, code),
            }
        }

        let expired = self.rpr.expire(now);
        if !expired.is_empty() {
            tracing::debug!("Room {}: {} queries expired unanswered", self.id.0, expired.len());
        }

        self.context.flush();

        if self.roster.is_empty() {
            self.empty_since.get_or_insert(now);
        } else {
            self.empty_since = None;
        }
        let idle_expired = match (self.settings.auto_close_after, self.empty_since) {
            (Some(after), Some(since)) => now.duration_since(since) >= after,
            _ => false,
        };
        if self.stop_requested || idle_expired {
            self.close();
        }

        self.state
    }

    fn close(&mut self) {
        self.state = RoomState::Closing;
        tracing::info!("Room {} '{}' closing", self.id.0, self.settings.name);

        match Message::RoomClosing.to_envelope() {
            Ok(envelope) => {
                if let Err(e) = self.context.broadcast(&envelope, CONTROL) {
                    tracing::warn!("Room {}: closing notice failed: {e}", self.id.0);
                }
            }
            Err(e) => tracing::warn!("Room {}: closing notice failed: {e}", self.id.0),
        }
        self.context.stop();

        self.roster = ClientRoster::new();
        self.entities.clear();
        self.rpr = RprCache::new(self.settings.rpr_ttl);
        self.ledger.clear();
        self.state = RoomState::Closed;
        tracing::info!("Room {} closed", self.id.0);
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    /// Encode `message`, refusing it if it cannot fit the MTU of `mode`.
    fn encode_checked(&self, message: &Message, mode: DeliveryMode) -> Option<Envelope> {
        let envelope = match message.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Room {}: cannot encode {:?}: {e}", self.id.0, message.tag());
                return None;
            }
        };
        let mtu = self.context.check_mtu(mode);
        if envelope.encoded_len() > mtu {
            tracing::warn!(
                "Room {}: {:?} of {} bytes exceeds the {mtu}-byte MTU of {mode:?}",
                self.id.0,
                message.tag(),
                envelope.encoded_len()
            );
            return None;
        }
        Some(envelope)
    }

    fn send(&mut self, client: ClientId, message: &Message, mode: DeliveryMode) {
        let Some(envelope) = self.encode_checked(message, mode) else {
            return;
        };
        if let Err(e) = self.context.send(client, &envelope, mode) {
            tracing::warn!("Room {}: send to {client} failed: {e}", self.id.0);
        }
    }

    fn send_to(&mut self, clients: &[ClientId], message: &Message, mode: DeliveryMode) {
        if clients.is_empty() {
            return;
        }
        if let Some(envelope) = self.encode_checked(message, mode) {
            self.context.send_many(clients.iter().copied(), &envelope, mode);
        }
    }

    fn others(&self, client: ClientId) -> Vec<ClientId> {
        self.roster.ids().into_iter().filter(|&id| id != client).collect()
    }

    fn record_buffered(&mut self, author: ClientId) {
        *self.ledger.entry(author).or_default() += 1;
    }

    fn unbuffer(&mut self, removed: &[BufferedMessage]) {
        for message in removed {
            if let Some(count) = self.ledger.get_mut(&message.author) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ledger.remove(&message.author);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, client: ClientId, envelope: &Envelope, mode: DeliveryMode, now: Instant) {
        let message = match Message::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Room {}: dropping envelope from {client}: {e}", self.id.0);
                return;
            }
        };

        if !self.roster.contains(client) {
            match message {
                Message::Register(request) => self.handle_register(client, request, now),
                other => tracing::debug!(
                    "Room {}: dropping {:?} from unregistered {client}",
                    self.id.0,
                    other.tag()
                ),
            }
            return;
        }

        match message {
            Message::Register(_) => {
                tracing::warn!("Room {}: {client} registered twice", self.id.0);
                let rejected = Message::RegisterRejected(RegisterRejected {
                    code: DisconnectCode::InvalidContext,
                    reason: "already registered".to_string(),
                });
                self.send(client, &rejected, CONTROL);
            }
            Message::Ready => self.handle_ready(client),
            Message::Leave => {
                self.context.flush_client(client);
                self.context.disconnect(client, DisconnectCode::Normal, now);
                self.handle_departure(client, DisconnectCode::Normal);
            }
            Message::SpawnEntity(request) => self.handle_spawn(client, request),
            Message::DestroyEntity(DestroyRequest { entity }) => self.handle_destroy(client, entity),
            Message::RpcBroadcast(rpc) => self.handle_rpc_broadcast(client, rpc),
            Message::RpcTarget(rpc) => self.handle_rpc_target(client, rpc),
            Message::RpcQuery(query) => self.handle_query(client, query, now),
            Message::RprResponse(response) => self.handle_response(client, response),
            Message::SyncVar(write) => self.handle_syncvar(client, write),
            Message::Ping(ping) => self.send(client, &Message::Pong(ping), mode),
            other => tracing::warn!(
                "Room {}: unexpected {:?} from {client}",
                self.id.0,
                other.tag()
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn registration_error(&self, request: &RegisterRequest) -> Option<(DisconnectCode, String)> {
        if self.state != RoomState::Open {
            return Some((DisconnectCode::ServerClosed, "room is not open".to_string()));
        }
        if request.version != self.settings.version {
            return Some((
                DisconnectCode::ConnectionRejected,
                format!(
                    "client version {} does not match {}",
                    request.version, self.settings.version
                ),
            ));
        }
        if let Some(password) = &self.settings.password
            && request.password.as_ref() != Some(password)
        {
            return Some((DisconnectCode::WrongPassword, "wrong password".to_string()));
        }
        if self.roster.len() >= usize::from(self.settings.capacity) {
            return Some((DisconnectCode::NoCapacity, "room is full".to_string()));
        }
        None
    }

    fn handle_register(&mut self, client: ClientId, request: RegisterRequest, now: Instant) {
        if let Some((code, reason)) = self.registration_error(&request) {
            tracing::info!("Room {}: rejecting {client}: {reason}", self.id.0);
            let rejected = Message::RegisterRejected(RegisterRejected { code, reason });
            self.send(client, &rejected, CONTROL);
            self.context.flush_client(client);
            self.context.disconnect(client, code, now);
            return;
        }

        self.roster.insert(client, request.profile.clone());
        let master = self.roster.master().unwrap_or(client);
        if master == client {
            for entity in self.entities.owned_by(ClientId::SERVER) {
                self.entities.set_owner(entity, client);
            }
        }

        let accepted = Message::RegisterAccepted(RegisterAccepted {
            client_id: client,
            room: self.info(),
            master,
            clients: self.roster.infos(),
            entities: self.entities.infos(),
        });
        self.send(client, &accepted, CONTROL);

        let joined = Message::ClientJoined(ClientInfo {
            id: client,
            profile: request.profile,
        });
        let others = self.others(client);
        self.send_to(&others, &joined, CONTROL);

        tracing::info!(
            "Room {}: {client} registered ({}/{})",
            self.id.0,
            self.roster.len(),
            self.settings.capacity
        );
    }

    fn handle_ready(&mut self, client: ClientId) {
        if self.roster.is_ready(client) {
            tracing::debug!("Room {}: {client} already ready", self.id.0);
            return;
        }

        let mut replay: Vec<(Envelope, DeliveryMode)> = Vec::new();
        for entity in self.entities.iter() {
            for message in entity.syncvars.entries() {
                replay.push((message.envelope.clone(), message.mode));
            }
            for message in entity.rpcs.entries() {
                replay.push((message.envelope.clone(), message.mode));
            }
        }
        let replayed = replay.len();
        for (envelope, mode) in replay {
            if let Err(e) = self.context.send(client, &envelope, mode) {
                tracing::warn!("Room {}: replay to {client} failed: {e}", self.id.0);
            }
        }

        self.send(client, &Message::ReplayComplete, CONTROL);
        self.roster.set_ready(client);
        tracing::debug!("Room {}: replayed {replayed} entries to {client}", self.id.0);
    }

    fn handle_departure(&mut self, client: ClientId, code: DisconnectCode) {
        let Some(departure) = self.roster.remove(client) else {
            return;
        };
        let purged = self.rpr.purge_client(client);
        tracing::info!(
            "Room {}: {client} left ({code:?}), {} queries dropped",
            self.id.0,
            purged.len()
        );

        let remaining = self.roster.ids();
        self.send_to(&remaining, &Message::ClientLeft(ClientLeft { client, code }), CONTROL);

        if let Some(master) = departure.new_master {
            tracing::info!("Room {}: {master} is now master", self.id.0);
            self.send_to(&remaining, &Message::MasterChanged(MasterChanged { master }), CONTROL);
        }

        let heir = self.roster.master().unwrap_or(ClientId::SERVER);
        for entity in self.entities.owned_by(client) {
            let persistent = self
                .entities
                .get(entity)
                .is_some_and(|entity| entity.info.persistent);
            if persistent {
                self.entities.set_owner(entity, heir);
                let changed = Message::EntityOwnerChanged(EntityOwnerChanged {
                    entity,
                    owner: heir,
                });
                self.send_to(&remaining, &changed, CONTROL);
            } else {
                self.destroy_entity(entity);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    fn handle_spawn(&mut self, client: ClientId, request: SpawnRequest) {
        let token = request.token;
        let Some(entity) = self.entities.spawn(client, request) else {
            tracing::warn!("Room {}: entity id space exhausted", self.id.0);
            return;
        };
        let info = entity.info.clone();
        tracing::debug!("Room {}: {client} spawned {}", self.id.0, info.id);

        let to_owner = Message::EntitySpawned(EntitySpawned {
            token,
            entity: info.clone(),
        });
        self.send(client, &to_owner, CONTROL);
        let to_others = Message::EntitySpawned(EntitySpawned {
            token: 0,
            entity: info,
        });
        let others = self.others(client);
        self.send_to(&others, &to_others, CONTROL);
    }

    fn handle_destroy(&mut self, client: ClientId, entity: EntityId) {
        let master = self.roster.master();
        let Some(found) = self.entities.get(entity) else {
            tracing::debug!("Room {}: {client} destroyed unknown {entity}", self.id.0);
            return;
        };
        if !found.can_destroy(client, master) {
            tracing::warn!("Room {}: {client} may not destroy {entity}", self.id.0);
            return;
        }
        self.destroy_entity(entity);
    }

    fn destroy_entity(&mut self, id: EntityId) {
        let Some(mut entity) = self.entities.remove(id) else {
            return;
        };
        let cleared = entity.clear_buffers();
        self.unbuffer(&cleared);
        let everyone = self.roster.ids();
        self.send_to(
            &everyone,
            &Message::EntityDestroyed(EntityDestroyed { entity: id }),
            CONTROL,
        );
        tracing::debug!(
            "Room {}: destroyed {id}, {} buffered entries cleared",
            self.id.0,
            cleared.len()
        );
    }

    /// Whether `client` may address `behaviour` on `entity`. Logs and returns
    /// `false` otherwise.
    fn check_target(&self, client: ClientId, entity: EntityId, behaviour: BehaviourId) -> bool {
        match self.entities.get(entity) {
            None => {
                tracing::debug!("Room {}: {client} addressed unknown {entity}", self.id.0);
                false
            }
            Some(found) if !found.has_behaviour(behaviour) => {
                tracing::warn!(
                    "Room {}: {client} addressed behaviour {} of {entity}, which has {}",
                    self.id.0,
                    behaviour.0,
                    found.info.behaviours
                );
                false
            }
            Some(_) => true,
        }
    }

    // -----------------------------------------------------------------------
    // RPC, SyncVar, RPR
    // -----------------------------------------------------------------------

    fn handle_rpc_broadcast(&mut self, client: ClientId, mut rpc: RpcBroadcast) {
        if !self.check_target(client, rpc.entity, rpc.behaviour) {
            return;
        }
        rpc.sender = client;
        let (entity, mode, policy, exclude_sender) =
            (rpc.entity, rpc.mode, rpc.buffer, rpc.exclude_sender);
        let key = RpcKey {
            behaviour: rpc.behaviour,
            method: rpc.method,
        };
        let Some(envelope) = self.encode_checked(&Message::RpcBroadcast(rpc), mode) else {
            return;
        };

        if policy != BufferMode::None {
            let evicted = match self.entities.get_mut(entity) {
                Some(found) => {
                    let message = BufferedMessage {
                        author: client,
                        envelope: envelope.clone(),
                        mode,
                    };
                    found.rpcs.set(key, message, policy)
                }
                None => Vec::new(),
            };
            self.record_buffered(client);
            self.unbuffer(&evicted);
        }

        let recipients = self
            .roster
            .ready_ids()
            .into_iter()
            .filter(|&id| !(exclude_sender && id == client));
        self.context.send_many(recipients, &envelope, mode);
    }

    fn handle_rpc_target(&mut self, client: ClientId, mut rpc: RpcTarget) {
        if !self.check_target(client, rpc.entity, rpc.behaviour) {
            return;
        }
        if !self.roster.is_ready(rpc.target) {
            tracing::debug!("Room {}: RPC target {} is not ready", self.id.0, rpc.target);
            return;
        }
        rpc.sender = client;
        let (target, mode) = (rpc.target, rpc.mode);
        self.send(target, &Message::RpcTarget(rpc), mode);
    }

    fn handle_query(&mut self, client: ClientId, mut query: RpcQuery, now: Instant) {
        if !self.check_target(client, query.entity, query.behaviour) {
            return;
        }
        if !self.roster.is_ready(query.target) {
            tracing::debug!("Room {}: query target {} is not ready", self.id.0, query.target);
            return;
        }

        let pending = PendingResponse {
            requester: client,
            target: query.target,
            callback: query.callback,
            entity: query.entity,
            behaviour: query.behaviour,
            method: query.method,
            mode: query.mode,
            created: now,
        };
        let Some(correlation) = self.rpr.register(pending) else {
            tracing::warn!("Room {}: too many pending queries", self.id.0);
            return;
        };

        query.sender = client;
        query.correlation = Some(correlation);
        let (target, mode) = (query.target, query.mode);
        let Some(envelope) = self.encode_checked(&Message::RpcQuery(query), mode) else {
            self.rpr.unregister(correlation);
            return;
        };
        if let Err(e) = self.context.send(target, &envelope, mode) {
            tracing::warn!("Room {}: query to {target} failed: {e}", self.id.0);
            self.rpr.unregister(correlation);
        }
    }

    fn handle_response(&mut self, client: ClientId, response: RprResponse) {
        match self.rpr.get(response.correlation) {
            None => {
                tracing::debug!(
                    "Room {}: response from {client} for unknown query {:?}",
                    self.id.0,
                    response.correlation
                );
                return;
            }
            Some(pending) if pending.target != client => {
                tracing::warn!(
                    "Room {}: {client} answered a query addressed to {}",
                    self.id.0,
                    pending.target
                );
                return;
            }
            Some(_) => {}
        }
        let Some(pending) = self.rpr.resolve(response.correlation) else {
            return;
        };
        if !self.roster.contains(pending.requester) {
            return;
        }

        let result = Message::RprResult(RprResult {
            callback: pending.callback,
            responder: client,
            payload: response.payload,
        });
        self.send(pending.requester, &result, pending.mode);
    }

    fn handle_syncvar(&mut self, client: ClientId, mut write: SyncVarWrite) {
        if !self.check_target(client, write.entity, write.behaviour) {
            return;
        }
        let master = self.roster.master();
        if !self
            .entities
            .get(write.entity)
            .is_some_and(|entity| entity.can_write(client, master))
        {
            tracing::warn!(
                "Room {}: {client} may not write SyncVars of {}",
                self.id.0,
                write.entity
            );
            return;
        }

        write.sender = client;
        let (entity, mode) = (write.entity, write.mode);
        let key = SyncVarKey {
            behaviour: write.behaviour,
            field: write.field,
        };
        let Some(envelope) = self.encode_checked(&Message::SyncVar(write), mode) else {
            return;
        };

        if let Some(found) = self.entities.get_mut(entity) {
            let message = BufferedMessage {
                author: client,
                envelope: envelope.clone(),
                mode,
            };
            let replaced = found.syncvars.set(key, message);
            self.record_buffered(client);
            if let Some(old) = replaced {
                self.unbuffer(std::slice::from_ref(&old));
            }
        }

        let recipients = self
            .roster
            .ready_ids()
            .into_iter()
            .filter(|&id| id != client);
        self.context.send_many(recipients, &envelope, mode);
    }
}

#[cfg(test)]
mod tests {
    use rally_net::messages::{ClientProfile, Ping};
    use rally_net::{
        ContextKey, FieldId, MemoryClient, MemoryConfig, MemoryTransport, MethodId,
        Transport,
    };

    use super::*;

    struct Harness {
        transport: MemoryTransport,
        room: Room,
        now: Instant,
    }

    impl Harness {
        fn new(settings: RoomSettings) -> Self {
            let transport = MemoryTransport::new(MemoryConfig::default());
            let key = ContextKey::new(RoomId(1), &settings.name);
            let backend = transport.open_context(&key).unwrap();
            let mut room = Room::new(RoomId(1), settings, backend);
            let now = Instant::now();
            room.start(now).unwrap();
            Self {
                transport,
                room,
                now,
            }
        }

        fn open() -> Self {
            Self::new(RoomSettings::new("Arena", "1.0"))
        }

        fn tick(&mut self) {
            self.now += Duration::from_millis(15);
            self.room.tick(self.now);
        }

        fn connect(&mut self) -> MemoryClient {
            let client = self.transport.connect("arena").unwrap();
            self.tick();
            client
        }

        fn register_with(&mut self, request: RegisterRequest) -> (MemoryClient, Vec<Message>) {
            let client = self.connect();
            send(&client, Message::Register(request));
            self.tick();
            let messages = client.poll_messages();
            (client, messages)
        }

        /// Register and become ready. Returns the client and its id.
        fn join(&mut self, name: &str) -> (MemoryClient, ClientId) {
            let (client, messages) = self.register_with(register(name));
            let id = messages
                .iter()
                .find_map(|m| match m {
                    Message::RegisterAccepted(accepted) => Some(accepted.client_id),
                    _ => None,
                })
                .expect("registration accepted");
            send(&client, Message::Ready);
            self.tick();
            client.poll_messages();
            (client, id)
        }
    }

    fn register(name: &str) -> RegisterRequest {
        RegisterRequest {
            profile: ClientProfile {
                name: name.to_string(),
                attributes: BTreeMap::new(),
            },
            version: "1.0".to_string(),
            password: None,
        }
    }

    fn send(client: &MemoryClient, message: Message) {
        assert!(client.send_message(&message, DeliveryMode::ReliableOrdered).unwrap());
    }

    fn spawn(h: &mut Harness, client: &MemoryClient, persistent: bool) -> EntityId {
        send(
            client,
            Message::SpawnEntity(SpawnRequest {
                token: 77,
                type_tag: 1,
                persistent,
                behaviours: 2,
                payload: Vec::new(),
            }),
        );
        h.tick();
        client
            .poll_messages()
            .into_iter()
            .find_map(|m| match m {
                Message::EntitySpawned(spawned) if spawned.token == 77 => Some(spawned.entity.id),
                _ => None,
            })
            .expect("entity spawned")
    }

    fn rpc(entity: EntityId, buffer: BufferMode, value: u8) -> Message {
        Message::RpcBroadcast(RpcBroadcast {
            sender: ClientId::SERVER,
            entity,
            behaviour: BehaviourId(0),
            method: MethodId(3),
            buffer,
            mode: DeliveryMode::ReliableOrdered,
            exclude_sender: true,
            args: vec![value],
        })
    }

    fn syncvar(entity: EntityId, value: u8) -> Message {
        Message::SyncVar(SyncVarWrite {
            sender: ClientId::SERVER,
            entity,
            behaviour: BehaviourId(1),
            field: FieldId(0),
            mode: DeliveryMode::ReliableOrdered,
            value: vec![value],
        })
    }

    fn rpc_args(messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::RpcBroadcast(rpc) => rpc.args.first().copied(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_late_joiner_gets_entities_and_buffered_state() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let entity = spawn(&mut h, &a, false);
        send(&a, syncvar(entity, 5));
        send(&a, rpc(entity, BufferMode::Last, 9));
        h.tick();

        let (b, messages) = h.register_with(register("b"));
        let Some(Message::RegisterAccepted(accepted)) = messages.first() else {
            panic!("expected acceptance, got {messages:?}");
        };
        assert_eq!(accepted.master, a_id);
        assert_eq!(accepted.entities.len(), 1);
        assert_eq!(accepted.entities[0].id, entity);
        assert_eq!(accepted.clients.len(), 2);

        send(&b, Message::Ready);
        h.tick();
        let replay = b.poll_messages();
        assert!(matches!(&replay[0], Message::SyncVar(w) if w.value == vec![5] && w.sender == a_id));
        assert!(matches!(&replay[1], Message::RpcBroadcast(r) if r.args == vec![9] && r.sender == a_id));
        assert_eq!(replay[2], Message::ReplayComplete);
        assert_eq!(replay.len(), 3);
    }

    #[test]
    fn test_last_policy_replays_only_newest() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let entity = spawn(&mut h, &a, false);
        send(&a, rpc(entity, BufferMode::Last, b'X'));
        send(&a, rpc(entity, BufferMode::Last, b'Y'));
        h.tick();
        assert_eq!(h.room.buffered_by(a_id), 1);

        let (c, _) = h.register_with(register("c"));
        send(&c, Message::Ready);
        h.tick();
        assert_eq!(rpc_args(&c.poll_messages()), vec![b'Y']);
    }

    #[test]
    fn test_all_policy_replays_in_order_and_none_is_not_kept() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let entity = spawn(&mut h, &a, false);
        for value in 1..=3 {
            send(&a, rpc(entity, BufferMode::All, value));
        }
        send(&a, rpc(entity, BufferMode::None, 4));
        h.tick();
        assert_eq!(h.room.buffered_by(a_id), 3);

        let (c, _) = h.register_with(register("c"));
        send(&c, Message::Ready);
        h.tick();
        assert_eq!(rpc_args(&c.poll_messages()), vec![1, 2, 3]);
    }

    #[test]
    fn test_live_rpc_reaches_ready_clients_only() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let (b, _) = h.join("b");
        let (pending, _) = h.register_with(register("pending"));
        let entity = spawn(&mut h, &a, false);
        b.poll_messages();
        pending.poll_messages();

        send(&a, rpc(entity, BufferMode::None, 1));
        h.tick();
        assert_eq!(rpc_args(&b.poll_messages()), vec![1]);
        assert!(rpc_args(&pending.poll_messages()).is_empty());
        assert!(rpc_args(&a.poll_messages()).is_empty(), "sender excluded");
    }

    #[test]
    fn test_query_purged_when_target_leaves() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let (b, b_id) = h.join("b");
        let entity = spawn(&mut h, &a, false);
        b.poll_messages();

        send(
            &a,
            Message::RpcQuery(RpcQuery {
                sender: ClientId::SERVER,
                target: b_id,
                entity,
                behaviour: BehaviourId(0),
                method: MethodId(1),
                mode: DeliveryMode::ReliableOrdered,
                callback: 3,
                correlation: None,
                args: Vec::new(),
            }),
        );
        h.tick();
        assert_eq!(h.room.pending_responses(), 1);
        let forwarded = b
            .poll_messages()
            .into_iter()
            .find_map(|m| match m {
                Message::RpcQuery(q) => q.correlation,
                _ => None,
            })
            .expect("query forwarded with correlation id");

        drop(b);
        h.tick();
        assert_eq!(h.room.pending_responses(), 0);
        let messages = a.poll_messages();
        assert!(!messages.iter().any(|m| matches!(m, Message::RprResult(_))));
        assert!(messages
            .iter()
            .any(|m| matches!(m, Message::ClientLeft(left) if left.client == b_id)));

        // A stale answer for the purged id goes nowhere.
        send(
            &a,
            Message::RprResponse(RprResponse {
                correlation: forwarded,
                payload: b"late".to_vec(),
            }),
        );
        h.tick();
        assert!(a.poll_messages().is_empty());
    }

    #[test]
    fn test_query_purged_when_requester_leaves() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let (b, b_id) = h.join("b");
        let entity = spawn(&mut h, &b, false);
        a.poll_messages();

        send(
            &a,
            Message::RpcQuery(RpcQuery {
                sender: ClientId::SERVER,
                target: b_id,
                entity,
                behaviour: BehaviourId(0),
                method: MethodId(1),
                mode: DeliveryMode::ReliableOrdered,
                callback: 8,
                correlation: None,
                args: Vec::new(),
            }),
        );
        h.tick();
        assert_eq!(h.room.pending_responses(), 1);
        let correlation = b
            .poll_messages()
            .into_iter()
            .find_map(|m| match m {
                Message::RpcQuery(q) => q.correlation,
                _ => None,
            })
            .expect("query forwarded with correlation id");

        send(&a, Message::Leave);
        h.tick();
        assert_eq!(h.room.pending_responses(), 0);
        assert!(b
            .poll_messages()
            .iter()
            .any(|m| matches!(m, Message::ClientLeft(left) if left.client == a_id)));

        // A newcomer must not inherit the requester's id.
        let (c, c_id) = h.join("c");
        assert_ne!(c_id, a_id);
        b.poll_messages();

        send(
            &b,
            Message::RprResponse(RprResponse {
                correlation,
                payload: b"late".to_vec(),
            }),
        );
        h.tick();
        for client in [&a, &b, &c] {
            assert!(!client
                .poll_messages()
                .iter()
                .any(|m| matches!(m, Message::RprResult(_))));
        }
        assert_eq!(h.room.entity_count(), 1);
    }

    #[test]
    fn test_query_roundtrip() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let (b, b_id) = h.join("b");
        let entity = spawn(&mut h, &a, false);
        b.poll_messages();

        send(
            &a,
            Message::RpcQuery(RpcQuery {
                sender: ClientId::SERVER,
                target: b_id,
                entity,
                behaviour: BehaviourId(0),
                method: MethodId(1),
                mode: DeliveryMode::ReliableOrdered,
                callback: 3,
                correlation: None,
                args: Vec::new(),
            }),
        );
        h.tick();
        let correlation = b
            .poll_messages()
            .into_iter()
            .find_map(|m| match m {
                Message::RpcQuery(q) => q.correlation,
                _ => None,
            })
            .unwrap();

        let answer = Message::RprResponse(RprResponse {
            correlation,
            payload: b"pong".to_vec(),
        });
        send(&b, answer.clone());
        h.tick();
        assert_eq!(
            a.poll_messages(),
            vec![Message::RprResult(RprResult {
                callback: 3,
                responder: b_id,
                payload: b"pong".to_vec()
            })]
        );

        // Answering twice does nothing.
        send(&b, answer);
        h.tick();
        assert!(a.poll_messages().is_empty());
        assert_eq!(h.room.pending_responses(), 0);
    }

    #[test]
    fn test_master_leaves_one_promotion() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let (b, b_id) = h.join("b");
        let (c, _) = h.join("c");
        assert_eq!(h.room.master(), Some(a_id));
        b.poll_messages();
        c.poll_messages();

        drop(a);
        h.tick();
        for client in [&b, &c] {
            let changes: Vec<ClientId> = client
                .poll_messages()
                .into_iter()
                .filter_map(|m| match m {
                    Message::MasterChanged(changed) => Some(changed.master),
                    _ => None,
                })
                .collect();
            assert_eq!(changes, vec![b_id]);
        }
        assert_eq!(h.room.master(), Some(b_id));
    }

    #[test]
    fn test_owner_leave_destroys_or_transfers() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let (b, b_id) = h.join("b");
        let temporary = spawn(&mut h, &b, false);
        let kept = spawn(&mut h, &b, true);
        send(&b, rpc(temporary, BufferMode::All, 1));
        h.tick();
        assert_eq!(h.room.buffered_by(b_id), 1);
        a.poll_messages();

        drop(b);
        h.tick();
        let messages = a.poll_messages();
        assert!(messages.contains(&Message::EntityDestroyed(EntityDestroyed { entity: temporary })));
        assert!(messages.contains(&Message::EntityOwnerChanged(EntityOwnerChanged {
            entity: kept,
            owner: a_id
        })));
        assert_eq!(h.room.entity_count(), 1);
        assert_eq!(h.room.buffered_by(b_id), 0);
    }

    #[test]
    fn test_persistent_entity_ownerless_until_next_master() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let kept = spawn(&mut h, &a, true);
        drop(a);
        h.tick();
        assert_eq!(h.room.entity_count(), 1);

        let (_b, messages) = h.register_with(register("b"));
        let Some(Message::RegisterAccepted(accepted)) = messages.first() else {
            panic!("expected acceptance");
        };
        assert_eq!(accepted.entities[0].id, kept);
        assert_eq!(accepted.entities[0].owner, accepted.client_id);
    }

    #[test]
    fn test_syncvar_authority_and_overwrite() {
        let mut h = Harness::open();
        let (a, a_id) = h.join("a");
        let (b, _) = h.join("b");
        let entity = spawn(&mut h, &a, false);
        b.poll_messages();

        send(&b, syncvar(entity, 1));
        h.tick();
        assert!(a.poll_messages().is_empty(), "non-owner write dropped");

        for value in 1..=5 {
            send(&a, syncvar(entity, value));
        }
        h.tick();
        assert_eq!(b.poll_messages().len(), 5);
        assert_eq!(h.room.buffered_by(a_id), 1);

        let (c, _) = h.register_with(register("c"));
        send(&c, Message::Ready);
        h.tick();
        let replay = c.poll_messages();
        assert!(matches!(&replay[0], Message::SyncVar(w) if w.value == vec![5]));
        assert_eq!(replay[1], Message::ReplayComplete);
    }

    #[test]
    fn test_destroy_requires_owner_or_master() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let (b, _) = h.join("b");
        let (c, _) = h.join("c");
        let entity = spawn(&mut h, &b, false);

        send(&c, Message::DestroyEntity(DestroyRequest { entity }));
        h.tick();
        assert_eq!(h.room.entity_count(), 1);

        send(&a, Message::DestroyEntity(DestroyRequest { entity }));
        h.tick();
        assert_eq!(h.room.entity_count(), 0);
        assert!(c
            .poll_messages()
            .contains(&Message::EntityDestroyed(EntityDestroyed { entity })));
    }

    #[test]
    fn test_rejections_close_connection() {
        let mut settings = RoomSettings::new("Arena", "1.0");
        settings.password = Some("secret".to_string());
        settings.capacity = 1;
        let mut h = Harness::new(settings);

        let mut wrong_version = register("v");
        wrong_version.version = "0.9".to_string();
        let (client, messages) = h.register_with(wrong_version);
        assert!(matches!(
            messages.as_slice(),
            [Message::RegisterRejected(r)] if r.code == DisconnectCode::ConnectionRejected
        ));
        assert_eq!(client.disconnect_code(), Some(DisconnectCode::ConnectionRejected));

        let (client, _) = h.register_with(register("p"));
        assert_eq!(client.disconnect_code(), Some(DisconnectCode::WrongPassword));

        let mut ok = register("ok");
        ok.password = Some("secret".to_string());
        let (_first, messages) = h.register_with(ok.clone());
        assert!(matches!(messages.first(), Some(Message::RegisterAccepted(_))));

        let (client, _) = h.register_with(ok);
        assert_eq!(client.disconnect_code(), Some(DisconnectCode::NoCapacity));
        assert_eq!(h.room.occupancy(), 1);
    }

    #[test]
    fn test_unregistered_traffic_dropped() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let entity = spawn(&mut h, &a, false);

        let stranger = h.connect();
        send(&stranger, rpc(entity, BufferMode::All, 1));
        send(&stranger, Message::Ping(Ping { timestamp_ms: 1 }));
        h.tick();
        assert!(a.poll_messages().is_empty());
        assert!(stranger.poll_messages().is_empty());
        assert_eq!(h.room.entity_count(), 1);
    }

    #[test]
    fn test_malformed_envelope_keeps_connection() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        a.send(Envelope::new(250, vec![1]).to_bytes().unwrap(), DeliveryMode::ReliableOrdered);
        send(&a, Message::Ping(Ping { timestamp_ms: 42 }));
        h.tick();
        assert_eq!(
            a.poll_messages(),
            vec![Message::Pong(Ping { timestamp_ms: 42 })]
        );
    }

    #[test]
    fn test_stop_notifies_and_closes() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        h.room.request_stop();
        h.tick();
        assert_eq!(h.room.state(), RoomState::Closed);
        assert_eq!(a.poll_messages(), vec![Message::RoomClosing]);
        assert_eq!(a.disconnect_code(), Some(DisconnectCode::ServerClosed));
        assert!(h.transport.connect("arena").is_err());
    }

    #[test]
    fn test_auto_close_when_empty() {
        let mut settings = RoomSettings::new("Arena", "1.0");
        settings.auto_close_after = Some(Duration::from_secs(1));
        let mut h = Harness::new(settings);
        let (a, _) = h.join("a");
        drop(a);
        h.tick();
        assert_eq!(h.room.state(), RoomState::Open);

        h.now += Duration::from_secs(2);
        h.tick();
        assert_eq!(h.room.state(), RoomState::Closed);
    }

    #[test]
    fn test_leave_message() {
        let mut h = Harness::open();
        let (a, _) = h.join("a");
        let (b, b_id) = h.join("b");
        a.poll_messages();
        send(&b, Message::Leave);
        h.tick();
        assert_eq!(b.disconnect_code(), Some(DisconnectCode::Normal));
        assert!(a.poll_messages().contains(&Message::ClientLeft(ClientLeft {
            client: b_id,
            code: DisconnectCode::Normal
        })));
        assert_eq!(h.room.occupancy(), 1);
    }

    #[test]
    fn test_start_twice_fails() {
        let mut h = Harness::open();
        assert!(matches!(
            h.room.start(h.now),
            Err(RoomError::InvalidState(RoomState::Open))
        ));
    }
}
