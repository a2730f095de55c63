//! UDP backend.
//!
//! Each room context binds its own socket. A tokio task per socket owns the
//! peer table and the reliability [`Endpoint`]s; the room side talks to it over
//! channels, so [`Backend::poll`] never blocks.

mod client;
mod endpoint;
mod packet;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub use client::UdpClient;
pub use endpoint::{Delivery, Endpoint, PacketTooLarge, UdpChannel, UdpSettings};
pub use packet::{DATAGRAM_MTU, Datagram, DatagramError};

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::transport::{
    Backend, BackendEvent, ConnectionHandle, ContextKey, Transport, TransportError,
};

/// Receive buffer; anything longer than a datagram we send is garbage.
const RECV_BUFFER: usize = 2048;

/// Driver timer period.
const TICK: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// UDP transport. Room `n` binds `base_port + n`; a base port of 0 lets the OS
/// pick a free port per room.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    bind_ip: String,
    base_port: u16,
    settings: UdpSettings,
}

impl UdpTransport {
    /// Create a transport.
    pub fn new(bind_ip: impl Into<String>, base_port: u16, settings: UdpSettings) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            base_port,
            settings,
        }
    }

    fn port_for(&self, key: &ContextKey) -> u16 {
        if self.base_port == 0 {
            return 0;
        }
        let offset = u16::try_from(key.room.0).unwrap_or(u16::MAX);
        self.base_port.saturating_add(offset)
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn open_context(&self, key: &ContextKey) -> Result<Box<dyn Backend>, TransportError> {
        Ok(Box::new(UdpBackend {
            bind: format!("{}:{}", self.bind_ip, self.port_for(key)),
            settings: self.settings,
            driver: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

enum Command {
    Send {
        conn: ConnectionHandle,
        packet: Vec<u8>,
        mode: DeliveryMode,
    },
    Broadcast {
        packet: Vec<u8>,
        mode: DeliveryMode,
    },
    Disconnect {
        conn: ConnectionHandle,
        code: DisconnectCode,
    },
    Stop,
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    local_addr: SocketAddr,
}

struct UdpBackend {
    bind: String,
    settings: UdpSettings,
    driver: Option<DriverHandle>,
}

impl UdpBackend {
    fn command(&self, command: Command) {
        if let Some(driver) = &self.driver {
            let _ = driver.commands.send(command);
        }
    }
}

impl Backend for UdpBackend {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.driver.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let std_socket =
            std::net::UdpSocket::bind(&self.bind).map_err(|source| TransportError::Bind {
                addr: self.bind.clone(),
                source,
            })?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket)?
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(self.settings, event_tx);
        handle.spawn(driver.run(socket, command_rx));

        tracing::info!("UDP context listening on {local_addr}");
        self.driver = Some(DriverHandle {
            commands: command_tx,
            events: event_rx,
            local_addr,
        });
        Ok(())
    }

    fn poll(&mut self) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        if let Some(driver) = &mut self.driver {
            while let Ok(event) = driver.events.try_recv() {
                events.push(event);
            }
        }
        events
    }

    fn send(&mut self, conn: ConnectionHandle, packet: Vec<u8>, mode: DeliveryMode) {
        self.command(Command::Send { conn, packet, mode });
    }

    fn broadcast(&mut self, packet: Vec<u8>, mode: DeliveryMode) {
        self.command(Command::Broadcast { packet, mode });
    }

    fn disconnect(&mut self, conn: ConnectionHandle, code: DisconnectCode) {
        self.command(Command::Disconnect { conn, code });
    }

    fn check_mtu(&self, mode: DeliveryMode) -> usize {
        UdpChannel::for_mode(mode).mtu()
    }

    fn native_mode(&self, mode: DeliveryMode) -> DeliveryMode {
        UdpChannel::for_mode(mode).delivery_mode()
    }

    fn address(&self) -> Option<String> {
        self.driver
            .as_ref()
            .map(|driver| format!("udp://{}", driver.local_addr))
    }

    fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.commands.send(Command::Stop);
        }
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

struct Peer {
    conn: ConnectionHandle,
    endpoint: Endpoint,
}

struct Driver {
    settings: UdpSettings,
    events: mpsc::UnboundedSender<BackendEvent>,
    peers: FxHashMap<SocketAddr, Peer>,
    addrs: FxHashMap<ConnectionHandle, SocketAddr>,
    next_conn: u64,
    /// Last datagrams of peers already removed from the table.
    farewells: Vec<(SocketAddr, Vec<u8>)>,
}

impl Driver {
    fn new(settings: UdpSettings, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            settings,
            events,
            peers: FxHashMap::default(),
            addrs: FxHashMap::default(),
            next_conn: 1,
            farewells: Vec::new(),
        }
    }

    async fn run(mut self, socket: UdpSocket, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut tick = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from, Instant::now()),
                    Err(e) => tracing::debug!("UDP receive error: {e}"),
                },
                command = commands.recv() => match command {
                    Some(Command::Stop) | None => {
                        self.shutdown(Instant::now());
                        self.flush(&socket).await;
                        break;
                    }
                    Some(command) => self.on_command(command, Instant::now()),
                },
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
            self.flush(&socket).await;
        }

        tracing::debug!("UDP driver stopped");
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    fn remove(&mut self, addr: SocketAddr) -> Option<Peer> {
        let mut peer = self.peers.remove(&addr)?;
        self.addrs.remove(&peer.conn);
        for bytes in peer.endpoint.drain_outbox() {
            self.farewells.push((addr, bytes));
        }
        Some(peer)
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) {
        let datagram = match Datagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("Dropping datagram from {from}: {e}");
                return;
            }
        };

        if !self.peers.contains_key(&from) {
            if datagram != Datagram::Connect {
                tracing::debug!("Ignoring {datagram:?} from unknown peer {from}");
                return;
            }
            let conn = ConnectionHandle(self.next_conn);
            self.next_conn += 1;
            self.peers.insert(
                from,
                Peer {
                    conn,
                    endpoint: Endpoint::new(self.settings, now),
                },
            );
            self.addrs.insert(conn, from);
            tracing::debug!("New UDP peer {from} as {conn}");
            self.emit(BackendEvent::ConnectAttempt(conn));
        }

        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        let conn = peer.conn;
        for delivery in peer.endpoint.receive(datagram, now) {
            match delivery {
                Delivery::Packet(packet, mode) => {
                    self.emit(BackendEvent::Message { conn, packet, mode });
                }
                Delivery::Closed(code) => {
                    self.remove(from);
                    self.emit(BackendEvent::Disconnect { conn, code });
                }
            }
        }
    }

    fn send_to(&mut self, conn: ConnectionHandle, packet: &[u8], mode: DeliveryMode, now: Instant) {
        let Some(peer) = self.addrs.get(&conn).and_then(|addr| self.peers.get_mut(addr)) else {
            return;
        };
        if let Err(e) = peer.endpoint.send(packet, mode, now) {
            tracing::warn!("Dropping packet for {conn}: {e}");
        }
    }

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Send { conn, packet, mode } => self.send_to(conn, &packet, mode, now),
            Command::Broadcast { packet, mode } => {
                let conns: Vec<ConnectionHandle> = self.addrs.keys().copied().collect();
                for conn in conns {
                    self.send_to(conn, &packet, mode, now);
                }
            }
            Command::Disconnect { conn, code } => {
                if let Some(&addr) = self.addrs.get(&conn)
                    && let Some(peer) = self.peers.get_mut(&addr)
                {
                    peer.endpoint.disconnect(code, now);
                    self.remove(addr);
                }
            }
            Command::Stop => {}
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let mut ended = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            if let Some(code) = peer.endpoint.update(now) {
                ended.push((*addr, peer.conn, code));
            }
        }
        for (addr, conn, code) in ended {
            tracing::debug!("UDP peer {addr} ended: {code:?}");
            self.remove(addr);
            self.emit(BackendEvent::Disconnect { conn, code });
        }
    }

    fn shutdown(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.endpoint.disconnect(DisconnectCode::ServerClosed, now);
            }
            self.remove(addr);
        }
    }

    async fn flush(&mut self, socket: &UdpSocket) {
        let mut outgoing = std::mem::take(&mut self.farewells);
        for (addr, peer) in self.peers.iter_mut() {
            outgoing.extend(peer.endpoint.drain_outbox().into_iter().map(|bytes| (*addr, bytes)));
        }
        for (addr, bytes) in outgoing {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                tracing::debug!("UDP send to {addr} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RoomId;

    #[test]
    fn test_port_per_room() {
        let transport = UdpTransport::new("127.0.0.1", 7790, UdpSettings::default());
        assert_eq!(transport.port_for(&ContextKey::new(RoomId(3), "a")), 7793);
        let ephemeral = UdpTransport::new("127.0.0.1", 0, UdpSettings::default());
        assert_eq!(ephemeral.port_for(&ContextKey::new(RoomId(3), "a")), 0);
    }

    #[test]
    fn test_start_without_runtime() {
        let transport = UdpTransport::new("127.0.0.1", 0, UdpSettings::default());
        let mut backend = transport
            .open_context(&ContextKey::new(RoomId(1), "a"))
            .unwrap();
        assert!(matches!(backend.start(), Err(TransportError::NoRuntime)));
    }

    async fn next_event(backend: &mut Box<dyn Backend>) -> BackendEvent {
        for _ in 0..200 {
            if let Some(event) = backend.poll().into_iter().next() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no backend event");
    }

    #[tokio::test]
    async fn test_client_roundtrip() {
        let transport = UdpTransport::new("127.0.0.1", 0, UdpSettings::default());
        let mut backend = transport
            .open_context(&ContextKey::new(RoomId(1), "a"))
            .unwrap();
        backend.start().unwrap();
        let addr: SocketAddr = backend
            .address()
            .unwrap()
            .trim_start_matches("udp://")
            .parse()
            .unwrap();

        let mut client = UdpClient::connect(addr, UdpSettings::default()).await.unwrap();
        let BackendEvent::ConnectAttempt(conn) = next_event(&mut backend).await else {
            panic!("expected connect attempt");
        };

        client.send(b"hello".to_vec(), DeliveryMode::ReliableOrdered).await.unwrap();
        assert_eq!(
            next_event(&mut backend).await,
            BackendEvent::Message {
                conn,
                packet: b"hello".to_vec(),
                mode: DeliveryMode::ReliableOrdered
            }
        );

        backend.send(conn, b"world".to_vec(), DeliveryMode::ReliableOrdered);
        let packet = client.recv_packet(Duration::from_secs(2)).await;
        assert_eq!(packet, Some((b"world".to_vec(), DeliveryMode::ReliableOrdered)));

        backend.disconnect(conn, DisconnectCode::HostDisconnected);
        assert_eq!(client.recv_packet(Duration::from_secs(2)).await, None);
        assert_eq!(client.disconnect_code(), Some(DisconnectCode::HostDisconnected));
        backend.stop();
    }

    #[tokio::test]
    async fn test_client_disconnect_reported() {
        let transport = UdpTransport::new("127.0.0.1", 0, UdpSettings::default());
        let mut backend = transport
            .open_context(&ContextKey::new(RoomId(1), "a"))
            .unwrap();
        backend.start().unwrap();
        let addr: SocketAddr = backend
            .address()
            .unwrap()
            .trim_start_matches("udp://")
            .parse()
            .unwrap();

        let mut client = UdpClient::connect(addr, UdpSettings::default()).await.unwrap();
        let BackendEvent::ConnectAttempt(conn) = next_event(&mut backend).await else {
            panic!("expected connect attempt");
        };
        client.disconnect().await;
        assert_eq!(
            next_event(&mut backend).await,
            BackendEvent::Disconnect {
                conn,
                code: DisconnectCode::Normal
            }
        );
    }
}
