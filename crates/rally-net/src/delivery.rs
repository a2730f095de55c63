//! Delivery modes and disconnect codes shared by every backend.
//!
//! A [`DeliveryMode`] is the reliability/ordering contract requested for one
//! send. Backends that cannot honour a mode natively substitute a stronger one;
//! [`DeliveryMode::satisfies`] is the rule they are checked against.
//! [`DisconnectCode`] travels out of band: as a payload byte on datagram
//! backends and as a private close code on WebSocket.

use serde::{Deserialize, Serialize};

/// Ordering guarantee part of a [`DeliveryMode`], weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ordering {
    /// Messages may arrive in any order.
    None,
    /// Older messages arriving after newer ones are discarded.
    Sequenced,
    /// Messages arrive in send order.
    Ordered,
}

/// Reliability/ordering contract for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Guaranteed delivery in send order.
    ReliableOrdered = 0,
    /// Guaranteed delivery, any order.
    ReliableUnordered = 1,
    /// Guaranteed delivery of the newest message; stale ones are dropped.
    ReliableSequenced = 2,
    /// Fire and forget.
    Unreliable = 3,
    /// Fire and forget, stale messages dropped on receipt.
    UnreliableSequenced = 4,
}

impl DeliveryMode {
    /// Every mode, in wire-tag order.
    pub const ALL: [DeliveryMode; 5] = [
        DeliveryMode::ReliableOrdered,
        DeliveryMode::ReliableUnordered,
        DeliveryMode::ReliableSequenced,
        DeliveryMode::Unreliable,
        DeliveryMode::UnreliableSequenced,
    ];

    /// Whether delivery is guaranteed.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::ReliableOrdered | Self::ReliableUnordered | Self::ReliableSequenced
        )
    }

    /// Ordering guarantee of this mode.
    pub fn ordering(self) -> Ordering {
        match self {
            Self::ReliableOrdered => Ordering::Ordered,
            Self::ReliableSequenced | Self::UnreliableSequenced => Ordering::Sequenced,
            Self::ReliableUnordered | Self::Unreliable => Ordering::None,
        }
    }

    /// True when `self` offers every guarantee `requested` asks for.
    ///
    /// Ordered delivery covers sequenced delivery: a receiver that sees every
    /// message in order never sees a stale one after a newer one.
    pub fn satisfies(self, requested: DeliveryMode) -> bool {
        let reliability_ok = self.is_reliable() || !requested.is_reliable();
        reliability_ok && self.ordering() >= requested.ordering()
    }

    /// Wire representation.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }
}

/// Why a connection ended. Closed set shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectCode {
    Normal = 0,
    Unknown = 1,
    ConnectionFailed = 2,
    ConnectionClosed = 3,
    ConnectionTimeout = 4,
    ConnectionRejected = 5,
    ServerClosed = 6,
    ServerUnreachable = 7,
    NetworkUnreachable = 8,
    NoCapacity = 9,
    InvalidData = 10,
    InvalidContext = 11,
    HostDisconnected = 12,
    WrongPassword = 13,
}

/// First WebSocket close code used for [`DisconnectCode`]s. 4000–4999 is the
/// range RFC 6455 leaves to applications.
pub const CLOSE_CODE_OFFSET: u16 = 4000;

impl DisconnectCode {
    const ALL: [DisconnectCode; 14] = [
        DisconnectCode::Normal,
        DisconnectCode::Unknown,
        DisconnectCode::ConnectionFailed,
        DisconnectCode::ConnectionClosed,
        DisconnectCode::ConnectionTimeout,
        DisconnectCode::ConnectionRejected,
        DisconnectCode::ServerClosed,
        DisconnectCode::ServerUnreachable,
        DisconnectCode::NetworkUnreachable,
        DisconnectCode::NoCapacity,
        DisconnectCode::InvalidData,
        DisconnectCode::InvalidContext,
        DisconnectCode::HostDisconnected,
        DisconnectCode::WrongPassword,
    ];

    /// Payload byte attached to a datagram disconnect frame.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Decode a payload byte; unknown values map to [`DisconnectCode::Unknown`].
    pub fn from_byte(byte: u8) -> Self {
        Self::ALL
            .get(byte as usize)
            .copied()
            .unwrap_or(DisconnectCode::Unknown)
    }

    /// WebSocket close code carrying this disconnect code.
    pub fn to_close_code(self) -> u16 {
        CLOSE_CODE_OFFSET + u16::from(self.to_byte())
    }

    /// Decode a WebSocket close code. Standard codes map onto their nearest
    /// meaning, anything else is [`DisconnectCode::Unknown`].
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1000 => DisconnectCode::Normal,
            1001 => DisconnectCode::ConnectionClosed,
            1007 => DisconnectCode::InvalidData,
            1008 => DisconnectCode::ConnectionRejected,
            c if (CLOSE_CODE_OFFSET..CLOSE_CODE_OFFSET + 256).contains(&c) => {
                Self::from_byte((c - CLOSE_CODE_OFFSET) as u8)
            }
            _ => DisconnectCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_ordered_satisfies_everything() {
        for mode in DeliveryMode::ALL {
            assert!(DeliveryMode::ReliableOrdered.satisfies(mode), "{mode:?}");
        }
    }

    #[test]
    fn test_unreliable_satisfies_only_itself() {
        let satisfied: Vec<_> = DeliveryMode::ALL
            .into_iter()
            .filter(|m| DeliveryMode::Unreliable.satisfies(*m))
            .collect();
        assert_eq!(satisfied, vec![DeliveryMode::Unreliable]);
    }

    #[test]
    fn test_unordered_does_not_satisfy_sequenced() {
        assert!(!DeliveryMode::ReliableUnordered.satisfies(DeliveryMode::UnreliableSequenced));
        assert!(DeliveryMode::ReliableSequenced.satisfies(DeliveryMode::UnreliableSequenced));
        assert!(!DeliveryMode::UnreliableSequenced.satisfies(DeliveryMode::ReliableSequenced));
    }

    #[test]
    fn test_every_mode_satisfies_itself() {
        for mode in DeliveryMode::ALL {
            assert!(mode.satisfies(mode));
            assert_eq!(DeliveryMode::from_byte(mode.to_byte()), Some(mode));
        }
        assert_eq!(DeliveryMode::from_byte(5), None);
    }

    #[test]
    fn test_disconnect_code_bytes() {
        for code in DisconnectCode::ALL {
            assert_eq!(DisconnectCode::from_byte(code.to_byte()), code);
        }
        assert_eq!(DisconnectCode::from_byte(200), DisconnectCode::Unknown);
    }

    #[test]
    fn test_close_codes_stay_in_private_range() {
        for code in DisconnectCode::ALL {
            let close = code.to_close_code();
            assert!((4000..5000).contains(&close));
            assert_eq!(DisconnectCode::from_close_code(close), code);
        }
    }

    #[test]
    fn test_standard_close_codes_map_to_nearest_meaning() {
        assert_eq!(DisconnectCode::from_close_code(1000), DisconnectCode::Normal);
        assert_eq!(DisconnectCode::from_close_code(1006), DisconnectCode::Unknown);
        assert_eq!(DisconnectCode::from_close_code(4999), DisconnectCode::Unknown);
    }
}
