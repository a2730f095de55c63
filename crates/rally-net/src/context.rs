//! Transport context: one room's view of a backend.
//!
//! The context maps backend connection handles to stable [`ClientId`]s, splits
//! incoming packets into envelopes and batches outgoing envelopes per client
//! through a [`SendQueue`]. Layers above it never see backend types.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::envelope::Envelope;
use crate::ids::ClientId;
use crate::send_queue::{SendError, SendQueue};
use crate::transport::{Backend, BackendEvent, ConnectionHandle, TransportError};

// ---------------------------------------------------------------------------
// ClientIdAllocator
// ---------------------------------------------------------------------------

/// Hands out small client ids and recycles released ones after a grace period.
#[derive(Debug)]
pub struct ClientIdAllocator {
    /// Next never-used id; `None` once the id space is exhausted.
    next: Option<u16>,
    /// Released ids with their release time, oldest first.
    released: VecDeque<(ClientId, Instant)>,
    grace: Duration,
}

impl ClientIdAllocator {
    /// Create an allocator starting at 1.
    pub fn new(grace: Duration) -> Self {
        Self {
            next: Some(1),
            released: VecDeque::new(),
            grace,
        }
    }

    /// Allocate an id. Released ids are reused once their grace period has
    /// elapsed and `in_use` no longer reports them.
    pub fn allocate(&mut self, now: Instant, in_use: &dyn Fn(ClientId) -> bool) -> Option<ClientId> {
        let reusable = self
            .released
            .iter()
            .position(|(id, at)| now.duration_since(*at) >= self.grace && !in_use(*id));
        if let Some(pos) = reusable {
            return self.released.remove(pos).map(|(id, _)| id);
        }

        let id = self.next?;
        self.next = id.checked_add(1);
        Some(ClientId(id))
    }

    /// Return an id to the pool.
    pub fn release(&mut self, id: ClientId, now: Instant) {
        self.released.push_back((id, now));
    }
}

// ---------------------------------------------------------------------------
// TransportContext
// ---------------------------------------------------------------------------

/// Event surfaced to the room.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// A connection was registered under a new client id.
    Connected(ClientId),
    /// One envelope from a client.
    Message {
        /// Sender.
        client: ClientId,
        /// The envelope.
        envelope: Envelope,
        /// Mode it travelled with.
        mode: DeliveryMode,
    },
    /// A client's connection ended.
    Disconnected {
        /// The client.
        client: ClientId,
        /// Why.
        code: DisconnectCode,
    },
}

/// Settings of one transport context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Packet cap on unbounded-MTU modes.
    pub max_batch_bytes: usize,
    /// Minimum time before a released client id is reused.
    pub client_id_grace: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 64 * 1024,
            client_id_grace: Duration::from_secs(5),
        }
    }
}

/// One room's logical channel on a backend.
pub struct TransportContext {
    backend: Box<dyn Backend>,
    clients: FxHashMap<ConnectionHandle, ClientId>,
    handles: FxHashMap<ClientId, ConnectionHandle>,
    queues: FxHashMap<ClientId, SendQueue>,
    allocator: ClientIdAllocator,
    max_batch_bytes: usize,
}

impl TransportContext {
    /// Wrap an unstarted backend.
    pub fn new(backend: Box<dyn Backend>, config: ContextConfig) -> Self {
        Self {
            backend,
            clients: FxHashMap::default(),
            handles: FxHashMap::default(),
            queues: FxHashMap::default(),
            allocator: ClientIdAllocator::new(config.client_id_grace),
            max_batch_bytes: config.max_batch_bytes,
        }
    }

    /// Backend name.
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Address clients use to reach this context.
    pub fn address(&self) -> Option<String> {
        self.backend.address()
    }

    /// Start the backend.
    pub fn start(&mut self) -> Result<(), TransportError> {
        self.backend.start()
    }

    /// Number of connected clients.
    pub fn connected(&self) -> usize {
        self.handles.len()
    }

    /// Whether `client` is connected.
    pub fn is_connected(&self, client: ClientId) -> bool {
        self.handles.contains_key(&client)
    }

    /// Drain backend events and translate them.
    ///
    /// `in_use` reports client ids still referenced by room state; those are
    /// not recycled.
    pub fn poll(&mut self, now: Instant, in_use: &dyn Fn(ClientId) -> bool) -> Vec<ContextEvent> {
        let mut events = Vec::new();

        for event in self.backend.poll() {
            match event {
                BackendEvent::ConnectAttempt(conn) => {
                    if let Some(client) = self.register_client(conn, now, in_use) {
                        events.push(ContextEvent::Connected(client));
                    }
                }
                BackendEvent::Message { conn, packet, mode } => {
                    let Some(&client) = self.clients.get(&conn) else {
                        tracing::debug!("Dropping packet from unregistered {conn}");
                        continue;
                    };
                    match Envelope::decode_all(&packet) {
                        Ok(envelopes) => events.extend(envelopes.into_iter().map(|envelope| {
                            ContextEvent::Message {
                                client,
                                envelope,
                                mode,
                            }
                        })),
                        Err(e) => {
                            tracing::warn!("Malformed packet from {client}: {e}");
                        }
                    }
                }
                BackendEvent::Disconnect { conn, code } => {
                    if let Some(client) = self.unregister_client(conn, now) {
                        events.push(ContextEvent::Disconnected { client, code });
                    }
                }
            }
        }

        events
    }

    /// Allocate a client id for a newly observed connection. Refuses the
    /// connection when the id space is exhausted.
    pub fn register_client(
        &mut self,
        conn: ConnectionHandle,
        now: Instant,
        in_use: &dyn Fn(ClientId) -> bool,
    ) -> Option<ClientId> {
        if let Some(&client) = self.clients.get(&conn) {
            return Some(client);
        }
        let Some(client) = self.allocator.allocate(now, in_use) else {
            tracing::warn!("Client id space exhausted, refusing {conn}");
            self.backend.disconnect(conn, DisconnectCode::NoCapacity);
            return None;
        };
        self.clients.insert(conn, client);
        self.handles.insert(client, conn);
        self.queues.insert(client, SendQueue::new(self.max_batch_bytes));
        tracing::debug!("Registered {conn} as {client} on {}", self.backend.kind());
        Some(client)
    }

    /// Forget a connection and release its client id.
    pub fn unregister_client(&mut self, conn: ConnectionHandle, now: Instant) -> Option<ClientId> {
        let client = self.clients.remove(&conn)?;
        self.handles.remove(&client);
        self.queues.remove(&client);
        self.allocator.release(client, now);
        Some(client)
    }

    /// Largest envelope accepted for `mode`.
    pub fn check_mtu(&self, mode: DeliveryMode) -> usize {
        self.backend.check_mtu(self.backend.native_mode(mode))
    }

    /// Queue an envelope for one client.
    pub fn send(
        &mut self,
        client: ClientId,
        envelope: &Envelope,
        mode: DeliveryMode,
    ) -> Result<(), SendError> {
        let native = self.backend.native_mode(mode);
        let mtu = self.backend.check_mtu(native);
        let queue = self.queues.get_mut(&client).ok_or(SendError::NotConnected)?;
        queue.enqueue(envelope, native, mtu)
    }

    /// Queue an envelope for several clients. Returns how many accepted it.
    pub fn send_many(
        &mut self,
        clients: impl IntoIterator<Item = ClientId>,
        envelope: &Envelope,
        mode: DeliveryMode,
    ) -> usize {
        let mut sent = 0;
        for client in clients {
            match self.send(client, envelope, mode) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Send to {client} failed: {e}"),
            }
        }
        sent
    }

    /// Flush every queue, then send `envelope` to every connection of the
    /// backend, registered or not.
    pub fn broadcast(&mut self, envelope: &Envelope, mode: DeliveryMode) -> Result<(), SendError> {
        let native = self.backend.native_mode(mode);
        let packet = envelope.to_bytes()?;
        let mtu = self.backend.check_mtu(native);
        if packet.len() > mtu {
            return Err(SendError::ExceedsMtu {
                size: packet.len(),
                mtu,
                mode,
            });
        }
        self.flush();
        self.backend.broadcast(packet, native);
        Ok(())
    }

    /// Send everything queued for `client` now.
    pub fn flush_client(&mut self, client: ClientId) {
        let (Some(queue), Some(&conn)) = (self.queues.get_mut(&client), self.handles.get(&client))
        else {
            return;
        };
        let backend = &mut self.backend;
        let packets = queue.drain_packets(|mode| backend.check_mtu(mode));
        for (mode, packet) in packets {
            backend.send(conn, packet, mode);
        }
    }

    /// Send everything queued for every client.
    pub fn flush(&mut self) {
        let backend = &mut self.backend;
        for (client, queue) in self.queues.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let Some(&conn) = self.handles.get(client) else {
                continue;
            };
            let packets = queue.drain_packets(|mode| backend.check_mtu(mode));
            for (mode, packet) in packets {
                backend.send(conn, packet, mode);
            }
        }
    }

    /// Close a client's connection. Its queue is dropped unsent; callers that
    /// want a final message delivered flush the client first.
    pub fn disconnect(&mut self, client: ClientId, code: DisconnectCode, now: Instant) {
        let Some(&conn) = self.handles.get(&client) else {
            return;
        };
        self.unregister_client(conn, now);
        self.backend.disconnect(conn, code);
    }

    /// Stop the backend and forget every client.
    pub fn stop(&mut self) {
        self.flush();
        self.backend.stop();
        self.clients.clear();
        self.handles.clear();
        self.queues.clear();
    }
}
