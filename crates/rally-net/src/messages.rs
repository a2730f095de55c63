//! Wire messages and their envelope encoding.
//!
//! Each [`Message`] variant maps to one [`MessageTag`]. The tag goes into the
//! envelope header and the payload struct is encoded with [`postcard`] as the
//! envelope body. Unit variants have an empty body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::envelope::{Envelope, EnvelopeError};
use crate::ids::{BehaviourId, ClientId, CorrelationId, EntityId, FieldId, MethodId};

// ---------------------------------------------------------------------------
// MessageTag
// ---------------------------------------------------------------------------

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Register = 1,
    RegisterAccepted = 2,
    RegisterRejected = 3,
    Ready = 4,
    ReplayComplete = 5,
    ClientJoined = 6,
    ClientLeft = 7,
    MasterChanged = 8,
    Leave = 9,
    SpawnEntity = 10,
    EntitySpawned = 11,
    DestroyEntity = 12,
    EntityDestroyed = 13,
    EntityOwnerChanged = 14,
    RoomClosing = 15,
    RpcBroadcast = 20,
    RpcTarget = 21,
    RpcQuery = 22,
    RprResponse = 23,
    RprResult = 24,
    SyncVar = 30,
    Ping = 40,
    Pong = 41,
}

impl MessageTag {
    /// Parse an envelope tag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let tag = match byte {
            1 => Self::Register,
            2 => Self::RegisterAccepted,
            3 => Self::RegisterRejected,
            4 => Self::Ready,
            5 => Self::ReplayComplete,
            6 => Self::ClientJoined,
            7 => Self::ClientLeft,
            8 => Self::MasterChanged,
            9 => Self::Leave,
            10 => Self::SpawnEntity,
            11 => Self::EntitySpawned,
            12 => Self::DestroyEntity,
            13 => Self::EntityDestroyed,
            14 => Self::EntityOwnerChanged,
            15 => Self::RoomClosing,
            20 => Self::RpcBroadcast,
            21 => Self::RpcTarget,
            22 => Self::RpcQuery,
            23 => Self::RprResponse,
            24 => Self::RprResult,
            30 => Self::SyncVar,
            40 => Self::Ping,
            41 => Self::Pong,
            _ => return None,
        };
        Some(tag)
    }
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Every message exchanged between clients and a room.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // --- Registration ---
    /// Client asks to join the room.
    Register(RegisterRequest),
    /// Room accepted the client.
    RegisterAccepted(RegisterAccepted),
    /// Room refused the client; the connection is closed afterwards.
    RegisterRejected(RegisterRejected),
    /// Client finished loading and wants the buffered room state.
    Ready,
    /// Every buffered SyncVar and RPC has been replayed to the client.
    ReplayComplete,
    /// Another client joined.
    ClientJoined(ClientInfo),
    /// A client left.
    ClientLeft(ClientLeft),
    /// A new master client was elected.
    MasterChanged(MasterChanged),
    /// Client leaves voluntarily.
    Leave,
    /// The room is shutting down; every connection is closed next.
    RoomClosing,

    // --- Entities ---
    /// Client asks the room to spawn an entity it will own.
    SpawnEntity(SpawnRequest),
    /// An entity exists; sent to everyone on spawn and in join snapshots.
    EntitySpawned(EntitySpawned),
    /// Owner or master asks to destroy an entity.
    DestroyEntity(DestroyRequest),
    /// An entity is gone.
    EntityDestroyed(EntityDestroyed),
    /// A persistent entity changed hands.
    EntityOwnerChanged(EntityOwnerChanged),

    // --- Replication ---
    /// RPC relayed to every ready client.
    RpcBroadcast(RpcBroadcast),
    /// RPC relayed to one client.
    RpcTarget(RpcTarget),
    /// RPC that expects a reply from its target.
    RpcQuery(RpcQuery),
    /// Target's reply to a forwarded query.
    RprResponse(RprResponse),
    /// Reply delivered back to the querying client.
    RprResult(RprResult),
    /// SyncVar write.
    SyncVar(SyncVarWrite),

    // --- System ---
    /// Latency probe.
    Ping(Ping),
    /// Latency probe answer.
    Pong(Ping),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Display name plus opaque attributes a client presents on registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientProfile {
    /// Display name.
    pub name: String,
    /// Opaque key/value attributes.
    pub attributes: BTreeMap<String, String>,
}

/// Client registration request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    /// The joining client's profile.
    pub profile: ClientProfile,
    /// Client build version; must match the room's.
    pub version: String,
    /// Password, when the room requires one.
    pub password: Option<String>,
}

/// Identifier of a room on one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomId(pub u32);

/// Basic room information published to clients and the discovery service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomInfo {
    /// Server-wide room id.
    pub id: RoomId,
    /// Display name.
    pub name: String,
    /// Required client version.
    pub version: String,
    /// Registered clients.
    pub occupancy: u16,
    /// Maximum registered clients.
    pub capacity: u16,
    /// Whether a password is required.
    pub password_protected: bool,
    /// Opaque key/value attributes.
    pub attributes: BTreeMap<String, String>,
}

/// A registered client as seen by other clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    /// Room-local id.
    pub id: ClientId,
    /// Profile presented at registration.
    pub profile: ClientProfile,
}

/// Static description of a live entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityInfo {
    /// Room-local id.
    pub id: EntityId,
    /// Current owner; [`ClientId::SERVER`] while a persistent entity is ownerless.
    pub owner: ClientId,
    /// Application-defined prefab/type tag.
    pub type_tag: u16,
    /// Survives its owner leaving.
    pub persistent: bool,
    /// Number of behaviours; valid behaviour ids are `0..behaviours`.
    pub behaviours: u8,
    /// Opaque spawn parameters.
    pub payload: Vec<u8>,
}

/// Successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterAccepted {
    /// Id assigned to the joining client.
    pub client_id: ClientId,
    /// The room.
    pub room: RoomInfo,
    /// Current master client.
    pub master: ClientId,
    /// Every registered client, including the joining one.
    pub clients: Vec<ClientInfo>,
    /// Every live entity.
    pub entities: Vec<EntityInfo>,
}

/// Refused registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRejected {
    /// Machine-readable reason; also used as the disconnect code.
    pub code: DisconnectCode,
    /// Human-readable reason.
    pub reason: String,
}

/// A client left the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientLeft {
    /// The departed client.
    pub client: ClientId,
    /// Why it left.
    pub code: DisconnectCode,
}

/// Master client changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterChanged {
    /// The new master.
    pub master: ClientId,
}

/// Spawn request from a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnRequest {
    /// Client-chosen token echoed back in [`EntitySpawned`].
    pub token: u16,
    /// Application-defined prefab/type tag.
    pub type_tag: u16,
    /// Keep the entity after the owner leaves.
    pub persistent: bool,
    /// Number of behaviours on the entity.
    pub behaviours: u8,
    /// Opaque spawn parameters.
    pub payload: Vec<u8>,
}

/// Entity spawn notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawned {
    /// The spawn token, echoed to the owner only (0 for everyone else).
    pub token: u16,
    /// The entity.
    pub entity: EntityInfo,
}

/// Destroy request from a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestroyRequest {
    /// Entity to destroy.
    pub entity: EntityId,
}

/// Entity destruction notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDestroyed {
    /// The destroyed entity.
    pub entity: EntityId,
}

/// Ownership change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityOwnerChanged {
    /// The entity.
    pub entity: EntityId,
    /// Its new owner.
    pub owner: ClientId,
}

/// How a broadcast RPC is retained for clients that become ready later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferMode {
    /// Relay once, never store.
    None,
    /// Keep only the newest call per (behaviour, method).
    Last,
    /// Keep every call.
    All,
}

/// RPC relayed to every ready client.
///
/// `sender` is ignored on receipt and overwritten by the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcBroadcast {
    /// Originating client.
    pub sender: ClientId,
    /// Target entity.
    pub entity: EntityId,
    /// Behaviour on the entity.
    pub behaviour: BehaviourId,
    /// Method on the behaviour.
    pub method: MethodId,
    /// Buffering policy.
    pub buffer: BufferMode,
    /// Requested delivery mode.
    pub mode: DeliveryMode,
    /// Skip the sender when relaying.
    pub exclude_sender: bool,
    /// Encoded arguments.
    pub args: Vec<u8>,
}

/// RPC relayed to a single client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcTarget {
    /// Originating client.
    pub sender: ClientId,
    /// Receiving client.
    pub target: ClientId,
    /// Target entity.
    pub entity: EntityId,
    /// Behaviour on the entity.
    pub behaviour: BehaviourId,
    /// Method on the behaviour.
    pub method: MethodId,
    /// Requested delivery mode.
    pub mode: DeliveryMode,
    /// Encoded arguments.
    pub args: Vec<u8>,
}

/// RPC that expects a response.
///
/// From a client, `callback` identifies the pending call on the caller's side
/// and `correlation` is `None`. The room forwards it to `target` with
/// `correlation` set; the target answers with an [`RprResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcQuery {
    /// Originating client.
    pub sender: ClientId,
    /// Client that must answer.
    pub target: ClientId,
    /// Target entity.
    pub entity: EntityId,
    /// Behaviour on the entity.
    pub behaviour: BehaviourId,
    /// Method on the behaviour.
    pub method: MethodId,
    /// Requested delivery mode.
    pub mode: DeliveryMode,
    /// Caller-side callback id.
    pub callback: u16,
    /// Room-minted correlation id, set on the forwarded copy.
    pub correlation: Option<CorrelationId>,
    /// Encoded arguments.
    pub args: Vec<u8>,
}

/// Response to a forwarded query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RprResponse {
    /// Correlation id from the forwarded [`RpcQuery`].
    pub correlation: CorrelationId,
    /// Encoded return value.
    pub payload: Vec<u8>,
}

/// Response routed back to the querying client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RprResult {
    /// Caller-side callback id from the original query.
    pub callback: u16,
    /// Client that answered.
    pub responder: ClientId,
    /// Encoded return value.
    pub payload: Vec<u8>,
}

/// SyncVar write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncVarWrite {
    /// Originating client; overwritten by the room.
    pub sender: ClientId,
    /// Target entity.
    pub entity: EntityId,
    /// Behaviour on the entity.
    pub behaviour: BehaviourId,
    /// Field on the behaviour.
    pub field: FieldId,
    /// Requested delivery mode.
    pub mode: DeliveryMode,
    /// Encoded value.
    pub value: Vec<u8>,
}

/// Latency probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Sender timestamp in milliseconds, echoed back.
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while converting between messages and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The envelope carries a tag no message uses.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// A unit message carried a body.
    #[error("unexpected body of {len} bytes for {tag:?}")]
    UnexpectedBody {
        /// Tag of the unit message.
        tag: MessageTag,
        /// Body length.
        len: usize,
    },

    /// The encoded message could not be framed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Postcard encoding or decoding failed.
    #[error("payload codec error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Envelope conversion
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(tag: MessageTag, payload: &T) -> Result<Envelope, MessageError> {
    Ok(Envelope::new(tag as u8, postcard::to_allocvec(payload)?))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, MessageError> {
    Ok(postcard::from_bytes(body)?)
}

fn unit(tag: MessageTag, body: &[u8], message: Message) -> Result<Message, MessageError> {
    if body.is_empty() {
        Ok(message)
    } else {
        Err(MessageError::UnexpectedBody {
            tag,
            len: body.len(),
        })
    }
}

impl Message {
    /// Routing tag of this message.
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Register(_) => MessageTag::Register,
            Message::RegisterAccepted(_) => MessageTag::RegisterAccepted,
            Message::RegisterRejected(_) => MessageTag::RegisterRejected,
            Message::Ready => MessageTag::Ready,
            Message::ReplayComplete => MessageTag::ReplayComplete,
            Message::ClientJoined(_) => MessageTag::ClientJoined,
            Message::ClientLeft(_) => MessageTag::ClientLeft,
            Message::MasterChanged(_) => MessageTag::MasterChanged,
            Message::Leave => MessageTag::Leave,
            Message::RoomClosing => MessageTag::RoomClosing,
            Message::SpawnEntity(_) => MessageTag::SpawnEntity,
            Message::EntitySpawned(_) => MessageTag::EntitySpawned,
            Message::DestroyEntity(_) => MessageTag::DestroyEntity,
            Message::EntityDestroyed(_) => MessageTag::EntityDestroyed,
            Message::EntityOwnerChanged(_) => MessageTag::EntityOwnerChanged,
            Message::RpcBroadcast(_) => MessageTag::RpcBroadcast,
            Message::RpcTarget(_) => MessageTag::RpcTarget,
            Message::RpcQuery(_) => MessageTag::RpcQuery,
            Message::RprResponse(_) => MessageTag::RprResponse,
            Message::RprResult(_) => MessageTag::RprResult,
            Message::SyncVar(_) => MessageTag::SyncVar,
            Message::Ping(_) => MessageTag::Ping,
            Message::Pong(_) => MessageTag::Pong,
        }
    }

    /// Encode into an envelope.
    pub fn to_envelope(&self) -> Result<Envelope, MessageError> {
        let tag = self.tag();
        match self {
            Message::Register(p) => encode(tag, p),
            Message::RegisterAccepted(p) => encode(tag, p),
            Message::RegisterRejected(p) => encode(tag, p),
            Message::Ready | Message::ReplayComplete | Message::Leave | Message::RoomClosing => {
                Ok(Envelope::new(tag as u8, Vec::new()))
            }
            Message::ClientJoined(p) => encode(tag, p),
            Message::ClientLeft(p) => encode(tag, p),
            Message::MasterChanged(p) => encode(tag, p),
            Message::SpawnEntity(p) => encode(tag, p),
            Message::EntitySpawned(p) => encode(tag, p),
            Message::DestroyEntity(p) => encode(tag, p),
            Message::EntityDestroyed(p) => encode(tag, p),
            Message::EntityOwnerChanged(p) => encode(tag, p),
            Message::RpcBroadcast(p) => encode(tag, p),
            Message::RpcTarget(p) => encode(tag, p),
            Message::RpcQuery(p) => encode(tag, p),
            Message::RprResponse(p) => encode(tag, p),
            Message::RprResult(p) => encode(tag, p),
            Message::SyncVar(p) => encode(tag, p),
            Message::Ping(p) | Message::Pong(p) => encode(tag, p),
        }
    }

    /// Decode an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Message, MessageError> {
        let tag =
            MessageTag::from_byte(envelope.tag).ok_or(MessageError::UnknownTag(envelope.tag))?;
        let body = envelope.body.as_slice();
        let message = match tag {
            MessageTag::Register => Message::Register(decode(body)?),
            MessageTag::RegisterAccepted => Message::RegisterAccepted(decode(body)?),
            MessageTag::RegisterRejected => Message::RegisterRejected(decode(body)?),
            MessageTag::Ready => unit(tag, body, Message::Ready)?,
            MessageTag::ReplayComplete => unit(tag, body, Message::ReplayComplete)?,
            MessageTag::ClientJoined => Message::ClientJoined(decode(body)?),
            MessageTag::ClientLeft => Message::ClientLeft(decode(body)?),
            MessageTag::MasterChanged => Message::MasterChanged(decode(body)?),
            MessageTag::Leave => unit(tag, body, Message::Leave)?,
            MessageTag::RoomClosing => unit(tag, body, Message::RoomClosing)?,
            MessageTag::SpawnEntity => Message::SpawnEntity(decode(body)?),
            MessageTag::EntitySpawned => Message::EntitySpawned(decode(body)?),
            MessageTag::DestroyEntity => Message::DestroyEntity(decode(body)?),
            MessageTag::EntityDestroyed => Message::EntityDestroyed(decode(body)?),
            MessageTag::EntityOwnerChanged => Message::EntityOwnerChanged(decode(body)?),
            MessageTag::RpcBroadcast => Message::RpcBroadcast(decode(body)?),
            MessageTag::RpcTarget => Message::RpcTarget(decode(body)?),
            MessageTag::RpcQuery => Message::RpcQuery(decode(body)?),
            MessageTag::RprResponse => Message::RprResponse(decode(body)?),
            MessageTag::RprResult => Message::RprResult(decode(body)?),
            MessageTag::SyncVar => Message::SyncVar(decode(body)?),
            MessageTag::Ping => Message::Ping(decode(body)?),
            MessageTag::Pong => Message::Pong(decode(body)?),
        };
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
