//! Relay networking: delivery modes, envelope framing, wire messages, batched
//! send queues and the WebSocket, UDP and in-memory backends behind one
//! transport context per room.

pub mod backend;
pub mod context;
pub mod delivery;
pub mod envelope;
pub mod ids;
pub mod messages;
pub mod send_queue;
pub mod transport;

pub use backend::memory::{MemoryClient, MemoryConfig, MemoryTransport};
pub use backend::udp::{UdpClient, UdpSettings, UdpTransport};
pub use backend::websocket::WebSocketTransport;
pub use context::{ClientIdAllocator, ContextConfig, ContextEvent, TransportContext};
pub use delivery::{DeliveryMode, DisconnectCode};
pub use envelope::{Envelope, EnvelopeError};
pub use ids::{BehaviourId, ClientId, CorrelationId, EntityId, FieldId, MethodId};
pub use messages::{Message, MessageError, MessageTag, RoomId, RoomInfo};
pub use send_queue::{SendError, SendQueue};
pub use transport::{
    Backend, BackendEvent, ConnectionHandle, ContextKey, Transport, TransportError,
};
