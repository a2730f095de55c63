//! Room logic of the relay.
//!
//! A [`Room`] drives one [`rally_net::TransportContext`]: it registers
//! clients, elects the master, keeps the entity table with its RPC and SyncVar
//! buffers, routes queries through the [`RprCache`], and replays buffered
//! state to late joiners. The [`RoomRegistry`] is the server-wide directory of
//! open rooms.

pub mod clients;
pub mod entities;
pub mod registry;
pub mod room;
pub mod rpc_buffer;
pub mod rpr_cache;
pub mod syncvar_buffer;

pub use clients::{ClientRecord, ClientRoster, Departure};
pub use entities::{Entity, EntityRegistry};
pub use registry::{Announcer, LogAnnouncer, RegistryError, RoomRegistry, RoomRequest};
pub use room::{Room, RoomError, RoomSettings, RoomState};
pub use rpc_buffer::{BufferedMessage, RpcBuffer, RpcKey};
pub use rpr_cache::{PendingResponse, RprCache};
pub use syncvar_buffer::{SyncVarBuffer, SyncVarKey};
