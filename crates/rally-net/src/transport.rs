//! Backend abstraction.
//!
//! A [`Transport`] owns one physical network backend (a WebSocket listener, a
//! UDP socket factory, an in-process hub) and opens one isolated [`Backend`]
//! per room. Backends speak in raw packets and backend-local
//! [`ConnectionHandle`]s; the transport context above them turns that into
//! client ids and envelopes.
//!
//! Backends never return I/O errors from `poll`/`send`: a failing connection
//! shows up as a [`BackendEvent::Disconnect`] on a later poll.

use std::fmt;

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::messages::RoomId;

/// Backend-local connection handle. Never visible above the transport context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Normalized backend event.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A new connection appeared.
    ConnectAttempt(ConnectionHandle),
    /// A packet arrived on a connection.
    Message {
        /// Source connection.
        conn: ConnectionHandle,
        /// Raw packet (one or more framed envelopes).
        packet: Vec<u8>,
        /// Mode the packet travelled with.
        mode: DeliveryMode,
    },
    /// A connection ended, for whatever reason.
    Disconnect {
        /// The connection.
        conn: ConnectionHandle,
        /// Why it ended.
        code: DisconnectCode,
    },
}

/// Errors raised while opening or starting a backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another context already serves this route.
    #[error("route {0} is already served by another room")]
    RouteTaken(String),

    /// No route with this name exists.
    #[error("no room is served at {0}")]
    NoSuchRoute(String),

    /// The backend needs a tokio runtime and none is running.
    #[error("backend requires a running tokio runtime")]
    NoRuntime,

    /// The backend was started twice.
    #[error("backend already started")]
    AlreadyStarted,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface implemented once per backend.
pub trait Backend: Send {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Begin listening.
    fn start(&mut self) -> Result<(), TransportError>;

    /// Drain backend-native events. Never blocks.
    fn poll(&mut self) -> Vec<BackendEvent>;

    /// Send one packet to one connection.
    fn send(&mut self, conn: ConnectionHandle, packet: Vec<u8>, mode: DeliveryMode);

    /// Send one packet to every connection.
    fn broadcast(&mut self, packet: Vec<u8>, mode: DeliveryMode);

    /// Close a connection, carrying `code` out of band. No
    /// [`BackendEvent::Disconnect`] is reported for locally closed connections.
    fn disconnect(&mut self, conn: ConnectionHandle, code: DisconnectCode);

    /// Largest packet accepted for `mode`.
    fn check_mtu(&self, mode: DeliveryMode) -> usize;

    /// Mode actually used for `mode`. Always [`DeliveryMode::satisfies`] it.
    fn native_mode(&self, mode: DeliveryMode) -> DeliveryMode;

    /// Address clients use to reach this context, once started.
    fn address(&self) -> Option<String>;

    /// Close every connection and release the backend.
    fn stop(&mut self);
}

/// Identity of the room a context is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    /// Server-wide room id.
    pub room: RoomId,
    /// URL-safe room name.
    pub slug: String,
}

impl ContextKey {
    /// Build a key, deriving the slug from a display name.
    pub fn new(room: RoomId, name: &str) -> Self {
        Self {
            room,
            slug: slugify(name),
        }
    }
}

/// Lower-case ASCII alphanumerics with `-` for everything else.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "room".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A physical backend that can open one isolated context per room.
pub trait Transport: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Open an unstarted context for one room.
    fn open_context(&self, key: &ContextKey) -> Result<Box<dyn Backend>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Forest Arena #2"), "forest-arena-2");
        assert_eq!(slugify("  "), "room");
        assert_eq!(slugify("Lobby"), "lobby");
    }

    #[test]
    fn test_context_key_uses_slug() {
        let key = ContextKey::new(RoomId(4), "Deathmatch EU");
        assert_eq!(key.slug, "deathmatch-eu");
        assert_eq!(key.room, RoomId(4));
    }
}
