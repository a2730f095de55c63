//! In-process backend.
//!
//! Rooms and clients living in the same process exchange packets over
//! crossbeam channels. Used by the test suites and by embedders that host a
//! room next to a local player. Delivery is always in order and lossless, so
//! every mode is served natively; only the unreliable MTU is simulated.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxHashMap;

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::envelope::Envelope;
use crate::messages::{Message, MessageError};
use crate::transport::{
    Backend, BackendEvent, ConnectionHandle, ContextKey, Transport, TransportError,
};

/// Settings of the in-memory backend.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// MTU reported for unreliable modes.
    pub unreliable_mtu: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            unreliable_mtu: 1200,
        }
    }
}

/// Client to room.
enum Inbound {
    Connect {
        conn: ConnectionHandle,
        outbox: Sender<Outbound>,
    },
    Packet {
        conn: ConnectionHandle,
        packet: Vec<u8>,
        mode: DeliveryMode,
    },
    Closed {
        conn: ConnectionHandle,
    },
}

/// Room to client.
enum Outbound {
    Packet(Vec<u8>, DeliveryMode),
    Closed(DisconnectCode),
}

type Hub = Arc<DashMap<String, Sender<Inbound>>>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// In-process transport. Cloning shares the same hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Hub,
    next_conn: Arc<AtomicU64>,
    config: MemoryConfig,
}

impl MemoryTransport {
    /// Create an empty hub.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            hub: Arc::new(DashMap::new()),
            next_conn: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Connect a client to the room served at `slug`.
    pub fn connect(&self, slug: &str) -> Result<MemoryClient, TransportError> {
        let route = self
            .hub
            .get(slug)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NoSuchRoute(slug.to_string()))?;

        let conn = ConnectionHandle(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (outbox, inbox) = unbounded();
        route
            .send(Inbound::Connect { conn, outbox })
            .map_err(|_| TransportError::NoSuchRoute(slug.to_string()))?;

        Ok(MemoryClient {
            conn,
            route,
            inbox,
            state: RefCell::new(ClientState::default()),
        })
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn open_context(&self, key: &ContextKey) -> Result<Box<dyn Backend>, TransportError> {
        Ok(Box::new(MemoryBackend {
            slug: key.slug.clone(),
            hub: Arc::clone(&self.hub),
            config: self.config,
            channel: None,
            conns: FxHashMap::default(),
            pending: Vec::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct MemoryBackend {
    slug: String,
    hub: Hub,
    config: MemoryConfig,
    channel: Option<Receiver<Inbound>>,
    conns: FxHashMap<ConnectionHandle, Sender<Outbound>>,
    /// Disconnects detected while sending, reported on the next poll.
    pending: Vec<BackendEvent>,
}

impl MemoryBackend {
    fn deliver(&mut self, conn: ConnectionHandle, event: Outbound) {
        let Some(outbox) = self.conns.get(&conn) else {
            return;
        };
        if outbox.send(event).is_err() {
            self.conns.remove(&conn);
            self.pending.push(BackendEvent::Disconnect {
                conn,
                code: DisconnectCode::ConnectionClosed,
            });
        }
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let (tx, rx) = unbounded();
        match self.hub.entry(self.slug.clone()) {
            Entry::Occupied(_) => return Err(TransportError::RouteTaken(self.slug.clone())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        self.channel = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> Vec<BackendEvent> {
        let mut events = std::mem::take(&mut self.pending);
        let Some(rx) = &self.channel else {
            return events;
        };

        for inbound in rx.try_iter() {
            match inbound {
                Inbound::Connect { conn, outbox } => {
                    self.conns.insert(conn, outbox);
                    events.push(BackendEvent::ConnectAttempt(conn));
                }
                Inbound::Packet { conn, packet, mode } => {
                    if self.conns.contains_key(&conn) {
                        events.push(BackendEvent::Message { conn, packet, mode });
                    }
                }
                Inbound::Closed { conn } => {
                    if self.conns.remove(&conn).is_some() {
                        events.push(BackendEvent::Disconnect {
                            conn,
                            code: DisconnectCode::ConnectionClosed,
                        });
                    }
                }
            }
        }

        events
    }

    fn send(&mut self, conn: ConnectionHandle, packet: Vec<u8>, mode: DeliveryMode) {
        self.deliver(conn, Outbound::Packet(packet, mode));
    }

    fn broadcast(&mut self, packet: Vec<u8>, mode: DeliveryMode) {
        let conns: Vec<ConnectionHandle> = self.conns.keys().copied().collect();
        for conn in conns {
            self.deliver(conn, Outbound::Packet(packet.clone(), mode));
        }
    }

    fn disconnect(&mut self, conn: ConnectionHandle, code: DisconnectCode) {
        if let Some(outbox) = self.conns.remove(&conn) {
            let _ = outbox.send(Outbound::Closed(code));
        }
    }

    fn check_mtu(&self, mode: DeliveryMode) -> usize {
        if mode.is_reliable() {
            usize::MAX
        } else {
            self.config.unreliable_mtu
        }
    }

    fn native_mode(&self, mode: DeliveryMode) -> DeliveryMode {
        mode
    }

    fn address(&self) -> Option<String> {
        self.channel
            .as_ref()
            .map(|_| format!("memory://{}", self.slug))
    }

    fn stop(&mut self) {
        for (_, outbox) in self.conns.drain() {
            let _ = outbox.send(Outbound::Closed(DisconnectCode::ServerClosed));
        }
        if self.channel.take().is_some() {
            self.hub.remove(&self.slug);
        }
        self.pending.clear();
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClientState {
    packets: VecDeque<(Vec<u8>, DeliveryMode)>,
    closed: Option<DisconnectCode>,
}

/// Client end of an in-memory connection. Dropping it closes the connection.
pub struct MemoryClient {
    conn: ConnectionHandle,
    route: Sender<Inbound>,
    inbox: Receiver<Outbound>,
    state: RefCell<ClientState>,
}

impl MemoryClient {
    fn drain(&self) {
        let mut state = self.state.borrow_mut();
        for event in self.inbox.try_iter() {
            match event {
                Outbound::Packet(packet, mode) => state.packets.push_back((packet, mode)),
                Outbound::Closed(code) => state.closed = Some(code),
            }
        }
    }

    /// Send a raw packet. Returns `false` once the connection is closed.
    pub fn send(&self, packet: Vec<u8>, mode: DeliveryMode) -> bool {
        if self.disconnect_code().is_some() {
            return false;
        }
        self.route
            .send(Inbound::Packet {
                conn: self.conn,
                packet,
                mode,
            })
            .is_ok()
    }

    /// Encode and send one message as its own packet.
    pub fn send_message(&self, message: &Message, mode: DeliveryMode) -> Result<bool, MessageError> {
        let packet = message.to_envelope()?.to_bytes()?;
        Ok(self.send(packet, mode))
    }

    /// Next received packet, if any.
    pub fn try_recv_packet(&self) -> Option<(Vec<u8>, DeliveryMode)> {
        self.drain();
        self.state.borrow_mut().packets.pop_front()
    }

    /// Decode every received packet. Undecodable envelopes are skipped.
    pub fn poll_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some((packet, _)) = self.try_recv_packet() {
            let envelopes = match Envelope::decode_all(&packet) {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    tracing::warn!("Dropping malformed packet: {e}");
                    continue;
                }
            };
            for envelope in envelopes {
                match Message::from_envelope(&envelope) {
                    Ok(message) => messages.push(message),
                    Err(e) => tracing::warn!("Dropping undecodable envelope: {e}"),
                }
            }
        }
        messages
    }

    /// Code the room closed this connection with, once it has.
    pub fn disconnect_code(&self) -> Option<DisconnectCode> {
        self.drain();
        self.state.borrow().closed
    }

    /// Close the connection from the client side.
    pub fn disconnect(&self) {
        let mut state = self.state.borrow_mut();
        if state.closed.is_none() {
            state.closed = Some(DisconnectCode::Normal);
            let _ = self.route.send(Inbound::Closed { conn: self.conn });
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RoomId;

    fn started(transport: &MemoryTransport, name: &str) -> Box<dyn Backend> {
        let mut backend = transport
            .open_context(&ContextKey::new(RoomId(1), name))
            .unwrap();
        backend.start().unwrap();
        backend
    }

    #[test]
    fn test_connect_unknown_route() {
        let transport = MemoryTransport::new(MemoryConfig::default());
        assert!(matches!(
            transport.connect("nowhere"),
            Err(TransportError::NoSuchRoute(_))
        ));
    }

    #[test]
    fn test_route_taken() {
        let transport = MemoryTransport::new(MemoryConfig::default());
        let _first = started(&transport, "arena");
        let mut second = transport
            .open_context(&ContextKey::new(RoomId(2), "Arena"))
            .unwrap();
        assert!(matches!(second.start(), Err(TransportError::RouteTaken(_))));
    }

    #[test]
    fn test_packets_flow_both_ways() {
        let transport = MemoryTransport::new(MemoryConfig::default());
        let mut backend = started(&transport, "arena");
        let client = transport.connect("arena").unwrap();

        client.send(vec![1, 2, 3], DeliveryMode::UnreliableSequenced);
        let events = backend.poll();
        let BackendEvent::ConnectAttempt(conn) = events[0] else {
            panic!("expected connect attempt, got {events:?}");
        };
        assert_eq!(
            events[1],
            BackendEvent::Message {
                conn,
                packet: vec![1, 2, 3],
                mode: DeliveryMode::UnreliableSequenced
            }
        );

        backend.send(conn, vec![9], DeliveryMode::ReliableOrdered);
        assert_eq!(
            client.try_recv_packet(),
            Some((vec![9], DeliveryMode::ReliableOrdered))
        );
    }

    #[test]
    fn test_local_disconnect_not_reported() {
        let transport = MemoryTransport::new(MemoryConfig::default());
        let mut backend = started(&transport, "arena");
        let client = transport.connect("arena").unwrap();
        let BackendEvent::ConnectAttempt(conn) = backend.poll()[0] else {
            panic!("expected connect attempt");
        };

        backend.disconnect(conn, DisconnectCode::NoCapacity);
        drop(client);
        assert!(backend.poll().is_empty());
    }

    #[test]
    fn test_stop_closes_clients_and_frees_route() {
        let transport = MemoryTransport::new(MemoryConfig::default());
        let mut backend = started(&transport, "arena");
        let client = transport.connect("arena").unwrap();
        backend.poll();

        backend.stop();
        assert_eq!(client.disconnect_code(), Some(DisconnectCode::ServerClosed));
        assert!(transport.connect("arena").is_err());
        assert!(backend.address().is_none());
    }

    #[test]
    fn test_unreliable_mtu() {
        let transport = MemoryTransport::new(MemoryConfig { unreliable_mtu: 500 });
        let backend = started(&transport, "arena");
        assert_eq!(backend.check_mtu(DeliveryMode::Unreliable), 500);
        assert_eq!(backend.check_mtu(DeliveryMode::ReliableUnordered), usize::MAX);
        for mode in DeliveryMode::ALL {
            assert_eq!(backend.native_mode(mode), mode);
        }
    }
}
