//! Datagram layout of the UDP backend.
//!
//! Every datagram starts with a kind byte:
//!
//! | kind | name        | rest                                  |
//! |------|-------------|---------------------------------------|
//! | 0x01 | CONNECT     |                                       |
//! | 0x02 | ACCEPT      |                                       |
//! | 0x03 | DISCONNECT  | code u8                               |
//! | 0x04 | HEARTBEAT   |                                       |
//! | 0x10 | UNRELIABLE  | payload                               |
//! | 0x11 | SEQUENCED   | seq u16 LE, payload                   |
//! | 0x12 | RELIABLE    | seq u16 LE, more-fragments u8, payload |
//! | 0x13 | ACK         | seq u16 LE                            |

use crate::delivery::DisconnectCode;

/// Largest datagram ever put on the wire. Stays under common path MTUs.
pub const DATAGRAM_MTU: usize = 1200;

/// Header bytes of a SEQUENCED datagram; UNRELIABLE uses the same budget.
pub const UNRELIABLE_HEADER: usize = 3;

/// Header bytes of a RELIABLE datagram.
pub const RELIABLE_HEADER: usize = 4;

/// Payload bytes per reliable fragment.
pub const FRAGMENT_SIZE: usize = DATAGRAM_MTU - RELIABLE_HEADER;

/// Fragments one reliable packet may span.
pub const MAX_FRAGMENTS: usize = 64;

const CONNECT: u8 = 0x01;
const ACCEPT: u8 = 0x02;
const DISCONNECT: u8 = 0x03;
const HEARTBEAT: u8 = 0x04;
const UNRELIABLE: u8 = 0x10;
const SEQUENCED: u8 = 0x11;
const RELIABLE: u8 = 0x12;
const ACK: u8 = 0x13;

/// Errors raised while parsing a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
    /// Zero-length datagram.
    #[error("empty datagram")]
    Empty,

    /// Unrecognised kind byte.
    #[error("unknown datagram kind {0:#04x}")]
    UnknownKind(u8),

    /// Datagram shorter than its kind requires.
    #[error("truncated datagram of kind {kind:#04x}")]
    Truncated {
        /// Kind byte.
        kind: u8,
    },
}

/// One parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Connect,
    Accept,
    Disconnect(DisconnectCode),
    Heartbeat,
    Unreliable(Vec<u8>),
    Sequenced { seq: u16, payload: Vec<u8> },
    Reliable { seq: u16, more: bool, payload: Vec<u8> },
    Ack { seq: u16 },
}

impl Datagram {
    /// Serialize for the socket.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Datagram::Connect => vec![CONNECT],
            Datagram::Accept => vec![ACCEPT],
            Datagram::Disconnect(code) => vec![DISCONNECT, code.to_byte()],
            Datagram::Heartbeat => vec![HEARTBEAT],
            Datagram::Unreliable(payload) => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(UNRELIABLE);
                out.extend_from_slice(payload);
                out
            }
            Datagram::Sequenced { seq, payload } => {
                let mut out = Vec::with_capacity(UNRELIABLE_HEADER + payload.len());
                out.push(SEQUENCED);
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(payload);
                out
            }
            Datagram::Reliable { seq, more, payload } => {
                let mut out = Vec::with_capacity(RELIABLE_HEADER + payload.len());
                out.push(RELIABLE);
                out.extend_from_slice(&seq.to_le_bytes());
                out.push(u8::from(*more));
                out.extend_from_slice(payload);
                out
            }
            Datagram::Ack { seq } => {
                let [lo, hi] = seq.to_le_bytes();
                vec![ACK, lo, hi]
            }
        }
    }

    /// Parse a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Datagram, DatagramError> {
        let (&kind, rest) = bytes.split_first().ok_or(DatagramError::Empty)?;
        let seq = || -> Result<u16, DatagramError> {
            match rest {
                [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
                _ => Err(DatagramError::Truncated { kind }),
            }
        };

        let datagram = match kind {
            CONNECT => Datagram::Connect,
            ACCEPT => Datagram::Accept,
            DISCONNECT => {
                let code = rest.first().ok_or(DatagramError::Truncated { kind })?;
                Datagram::Disconnect(DisconnectCode::from_byte(*code))
            }
            HEARTBEAT => Datagram::Heartbeat,
            UNRELIABLE => Datagram::Unreliable(rest.to_vec()),
            SEQUENCED => Datagram::Sequenced {
                seq: seq()?,
                payload: rest[2..].to_vec(),
            },
            RELIABLE => {
                let seq = seq()?;
                let more = *rest.get(2).ok_or(DatagramError::Truncated { kind })?;
                Datagram::Reliable {
                    seq,
                    more: more != 0,
                    payload: rest[3..].to_vec(),
                }
            }
            ACK => Datagram::Ack { seq: seq()? },
            other => return Err(DatagramError::UnknownKind(other)),
        };
        Ok(datagram)
    }
}

/// True when sequence number `a` is newer than `b`, allowing for wraparound.
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_layout() {
        let bytes = Datagram::Reliable {
            seq: 0x0102,
            more: true,
            payload: vec![7],
        }
        .encode();
        assert_eq!(bytes, vec![0x12, 0x02, 0x01, 1, 7]);
        assert_eq!(
            Datagram::decode(&bytes).unwrap(),
            Datagram::Reliable {
                seq: 0x0102,
                more: true,
                payload: vec![7]
            }
        );
    }

    #[test]
    fn test_disconnect_carries_code() {
        let bytes = Datagram::Disconnect(DisconnectCode::WrongPassword).encode();
        assert_eq!(bytes, vec![0x03, 13]);
        assert_eq!(
            Datagram::decode(&bytes).unwrap(),
            Datagram::Disconnect(DisconnectCode::WrongPassword)
        );
    }

    #[test]
    fn test_malformed_datagrams() {
        assert_eq!(Datagram::decode(&[]), Err(DatagramError::Empty));
        assert_eq!(Datagram::decode(&[0x7F]), Err(DatagramError::UnknownKind(0x7F)));
        assert_eq!(
            Datagram::decode(&[0x12, 1, 0]),
            Err(DatagramError::Truncated { kind: 0x12 })
        );
        assert_eq!(
            Datagram::decode(&[0x13, 1]),
            Err(DatagramError::Truncated { kind: 0x13 })
        );
        assert_eq!(
            Datagram::decode(&[0x03]),
            Err(DatagramError::Truncated { kind: 0x03 })
        );
    }

    #[test]
    fn test_seq_newer_wraps() {
        assert!(seq_newer(1, 0));
        assert!(!seq_newer(0, 1));
        assert!(seq_newer(0, u16::MAX));
        assert!(seq_newer(10, 65530));
        assert!(!seq_newer(5, 5));
    }
}
