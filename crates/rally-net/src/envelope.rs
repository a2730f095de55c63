//! Tagged envelopes: the unit every backend carries.
//!
//! One packet handed to a backend is a concatenation of envelopes:
//!
//! ```text
//! +-----------+---------------------+------------------+
//! | tag (u8)  | length (u16 LE)     | body             |
//! +-----------+---------------------+------------------+
//! ```
//!
//! The length covers the body only. Packets never split an envelope.

/// Bytes in front of every body.
pub const HEADER_LEN: usize = 3;

/// Largest body an envelope can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Errors raised while framing or unframing envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The body does not fit the 16-bit length field.
    #[error("envelope body of {0} bytes exceeds {MAX_BODY_LEN}")]
    BodyTooLarge(usize),

    /// The packet ended in the middle of an envelope.
    #[error("truncated envelope at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        /// Offset of the envelope header inside the packet.
        offset: usize,
        /// Bytes the envelope claims.
        needed: usize,
        /// Bytes left in the packet.
        available: usize,
    },
}

/// One wire message: a type tag plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type tag.
    pub tag: u8,
    /// Encoded payload.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(tag: u8, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    /// Size of this envelope once framed.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Append the framed envelope to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EnvelopeError> {
        let len = u16::try_from(self.body.len())
            .map_err(|_| EnvelopeError::BodyTooLarge(self.body.len()))?;
        out.reserve(self.encoded_len());
        out.push(self.tag);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.body);
        Ok(())
    }

    /// Frame a single envelope into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Split a packet into its envelopes.
    ///
    /// Fails on the first truncated envelope; nothing from a malformed packet
    /// is returned.
    pub fn decode_all(packet: &[u8]) -> Result<Vec<Envelope>, EnvelopeError> {
        let mut envelopes = Vec::new();
        let mut offset = 0;

        while offset < packet.len() {
            let rest = &packet[offset..];
            if rest.len() < HEADER_LEN {
                return Err(EnvelopeError::Truncated {
                    offset,
                    needed: HEADER_LEN,
                    available: rest.len(),
                });
            }
            let body_len = u16::from_le_bytes([rest[1], rest[2]]) as usize;
            let needed = HEADER_LEN + body_len;
            if rest.len() < needed {
                return Err(EnvelopeError::Truncated {
                    offset,
                    needed,
                    available: rest.len(),
                });
            }
            envelopes.push(Envelope {
                tag: rest[0],
                body: rest[HEADER_LEN..needed].to_vec(),
            });
            offset += needed;
        }

        Ok(envelopes)
    }
}
