//! Identifier newtypes carried on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A registered participant of one room. `0` is reserved for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl ClientId {
    /// Sender id used for messages originated by the room itself.
    pub const SERVER: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A spawned networked object inside one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Sub-component of an entity, fixed when the entity is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BehaviourId(pub u8);

/// One RPC method of a behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u8);

/// One SyncVar field of a behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u8);

/// Handle of an outstanding query, minted by the room.
///
/// The low 16 bits index a slot, the high 16 bits are that slot's generation,
/// so a recycled slot never produces an id that was handed out before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    /// Pack a slot index and generation.
    pub fn new(slot: u16, generation: u16) -> Self {
        Self((u32::from(generation) << 16) | u32::from(slot))
    }

    /// Slot index part.
    pub fn slot(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Generation part.
    pub fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_packing() {
        let id = CorrelationId::new(0x1234, 0xBEEF);
        assert_eq!(id.slot(), 0x1234);
        assert_eq!(id.generation(), 0xBEEF);
        assert_ne!(id, CorrelationId::new(0x1234, 0xBEF0));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(ClientId(3).to_string(), "client#3");
        assert_eq!(EntityId(42).to_string(), "entity#42");
    }
}
