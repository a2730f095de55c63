//! WebSocket backend.
//!
//! One listener serves every room; the request path selects the room
//! (`ws://host:port/<slug>`). WebSocket runs over TCP, so every delivery mode
//! is carried reliably and in order. Disconnect codes travel as close codes
//! in the 4000 range.
//!
//! Each connection has a bounded outbox. A peer that stops reading until its
//! outbox is full is dropped with [`DisconnectCode::ConnectionTimeout`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::transport::{
    Backend, BackendEvent, ConnectionHandle, ContextKey, Transport, TransportError,
};

/// Packets queued per connection before the peer counts as stalled.
pub const OUTBOX_CAPACITY: usize = 1024;

/// How long a close frame may take to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection task to room.
enum Inbound {
    Connect {
        conn: ConnectionHandle,
        outbox: Outbox,
    },
    Packet {
        conn: ConnectionHandle,
        packet: Vec<u8>,
    },
    Closed {
        conn: ConnectionHandle,
        code: DisconnectCode,
    },
}

/// Room to connection task. Closing bypasses the data queue.
struct Outbox {
    data: mpsc::Sender<Vec<u8>>,
    close: oneshot::Sender<DisconnectCode>,
}

impl Outbox {
    fn close(self, code: DisconnectCode) {
        let _ = self.close.send(code);
    }
}

struct Shared {
    routes: DashMap<String, mpsc::UnboundedSender<Inbound>>,
    local_addr: OnceLock<SocketAddr>,
    next_conn: AtomicU64,
    outbox_capacity: usize,
    shutdown: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// WebSocket transport shared by every room of a server.
#[derive(Clone)]
pub struct WebSocketTransport {
    bind: String,
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// Create a transport that will listen on `bind` (`host:port`).
    pub fn new(bind: impl Into<String>) -> Self {
        Self::with_outbox_capacity(bind, OUTBOX_CAPACITY)
    }

    /// Like [`WebSocketTransport::new`], with `capacity` packets of outbox
    /// per connection.
    pub fn with_outbox_capacity(bind: impl Into<String>, capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind: bind.into(),
            shared: Arc::new(Shared {
                routes: DashMap::new(),
                local_addr: OnceLock::new(),
                next_conn: AtomicU64::new(1),
                outbox_capacity: capacity.max(1),
                shutdown,
            }),
        }
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        if self.shared.local_addr.get().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.bind.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        self.shared
            .local_addr
            .set(local_addr)
            .map_err(|_| TransportError::AlreadyStarted)?;

        tracing::info!("WebSocket listener on {local_addr}");
        tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        Ok(local_addr)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Stop accepting new connections. Open connections are closed by their
    /// rooms.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    fn open_context(&self, key: &ContextKey) -> Result<Box<dyn Backend>, TransportError> {
        Ok(Box::new(WebSocketBackend {
            slug: key.slug.clone(),
            shared: Arc::clone(&self.shared),
            channel: None,
            conns: FxHashMap::default(),
            pending: Vec::new(),
        }))
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut stop = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => tracing::warn!("WebSocket accept failed: {e}"),
            },
            _ = stop.changed() => break,
        }
    }
    tracing::info!("WebSocket listener stopped");
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("no such room".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let mut route = None;
    let callback = |request: &Request, response: Response| {
        let slug = request.uri().path().trim_matches('/');
        match shared.routes.get(slug) {
            Some(entry) => {
                route = Some(entry.value().clone());
                Ok(response)
            }
            None => Err(not_found()),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let Some(route) = route else {
        return;
    };

    let conn = ConnectionHandle(shared.next_conn.fetch_add(1, Ordering::Relaxed));
    let (data, mut outgoing) = mpsc::channel(shared.outbox_capacity);
    let (close, mut closing) = oneshot::channel();
    let outbox = Outbox { data, close };
    if route.send(Inbound::Connect { conn, outbox }).is_err() {
        return;
    }
    tracing::debug!("WebSocket {peer} connected as {conn}");

    let (mut sink, mut source) = ws.split();

    let mut writer = tokio::spawn(async move {
        let code = loop {
            tokio::select! {
                biased;
                code = &mut closing => break code.ok(),
                packet = outgoing.recv() => {
                    let Some(packet) = packet else {
                        break None;
                    };
                    tokio::select! {
                        sent = sink.send(WsMessage::Binary(packet)) => {
                            if sent.is_err() {
                                break None;
                            }
                        }
                        code = &mut closing => break code.ok(),
                    }
                }
            }
        };
        if let Some(code) = code {
            let frame = CloseFrame {
                code: CloseCode::from(code.to_close_code()),
                reason: "".into(),
            };
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.send(WsMessage::Close(Some(frame))))
                .await;
        }
    });

    let mut code = DisconnectCode::ConnectionClosed;
    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = &mut writer => break,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(WsMessage::Binary(packet)) => {
                if route.send(Inbound::Packet { conn, packet }).is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                if let Some(frame) = frame {
                    code = DisconnectCode::from_close_code(u16::from(frame.code));
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket {conn} read error: {e}");
                code = DisconnectCode::ConnectionFailed;
                break;
            }
        }
    }

    let _ = route.send(Inbound::Closed { conn, code });
    writer.abort();
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct WebSocketBackend {
    slug: String,
    shared: Arc<Shared>,
    channel: Option<mpsc::UnboundedReceiver<Inbound>>,
    conns: FxHashMap<ConnectionHandle, Outbox>,
    pending: Vec<BackendEvent>,
}

impl WebSocketBackend {
    fn deliver(&mut self, conn: ConnectionHandle, packet: Vec<u8>) {
        let Some(outbox) = self.conns.get(&conn) else {
            return;
        };
        let code = match outbox.data.try_send(packet) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("WebSocket {conn} outbox full, dropping the connection");
                DisconnectCode::ConnectionTimeout
            }
            Err(TrySendError::Closed(_)) => DisconnectCode::ConnectionClosed,
        };
        if let Some(outbox) = self.conns.remove(&conn) {
            outbox.close(code);
        }
        self.pending.push(BackendEvent::Disconnect { conn, code });
    }
}

impl Backend for WebSocketBackend {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.channel.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match self.shared.routes.entry(self.slug.clone()) {
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
        let Some(rx) = &mut self.channel else {
            return events;
        };

        while let Ok(inbound) = rx.try_recv() {
            match inbound {
                Inbound::Connect { conn, outbox } => {
                    self.conns.insert(conn, outbox);
                    events.push(BackendEvent::ConnectAttempt(conn));
                }
                Inbound::Packet { conn, packet } => {
                    if self.conns.contains_key(&conn) {
                        events.push(BackendEvent::Message {
                            conn,
                            packet,
                            mode: DeliveryMode::ReliableOrdered,
                        });
                    }
                }
                Inbound::Closed { conn, code } => {
                    if self.conns.remove(&conn).is_some() {
                        events.push(BackendEvent::Disconnect { conn, code });
                    }
                }
            }
        }

        events
    }

    fn send(&mut self, conn: ConnectionHandle, packet: Vec<u8>, _mode: DeliveryMode) {
        self.deliver(conn, packet);
    }

    fn broadcast(&mut self, packet: Vec<u8>, _mode: DeliveryMode) {
        let conns: Vec<ConnectionHandle> = self.conns.keys().copied().collect();
        for conn in conns {
            self.deliver(conn, packet.clone());
        }
    }

    fn disconnect(&mut self, conn: ConnectionHandle, code: DisconnectCode) {
        if let Some(outbox) = self.conns.remove(&conn) {
            outbox.close(code);
        }
    }

    fn check_mtu(&self, _mode: DeliveryMode) -> usize {
        usize::MAX
    }

    fn native_mode(&self, _mode: DeliveryMode) -> DeliveryMode {
        DeliveryMode::ReliableOrdered
    }

    fn address(&self) -> Option<String> {
        let addr = self.shared.local_addr.get()?;
        self.channel
            .as_ref()
            .map(|_| format!("ws://{addr}/{}", self.slug))
    }

    fn stop(&mut self) {
        for (_, outbox) in self.conns.drain() {
            outbox.close(DisconnectCode::ServerClosed);
        }
        if self.channel.take().is_some() {
            self.shared.routes.remove(&self.slug);
        }
        self.pending.clear();
    }
}

impl Drop for WebSocketBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
