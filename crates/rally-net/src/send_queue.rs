//! Per-client outgoing buffer.
//!
//! Envelopes are framed on enqueue and batched into packets on flush. A packet
//! only ever holds envelopes of one delivery mode and never exceeds the MTU the
//! backend reports for that mode. An envelope that cannot fit the MTU on its
//! own is refused at enqueue time instead of being truncated.

use crate::delivery::DeliveryMode;
use crate::envelope::{Envelope, EnvelopeError};

/// Errors reported to the caller of a send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The framed envelope is larger than the backend accepts for the mode.
    #[error("{size}-byte envelope exceeds the {mtu}-byte MTU of {mode:?}")]
    ExceedsMtu {
        /// Framed envelope size.
        size: usize,
        /// MTU of the requested mode.
        mtu: usize,
        /// Requested mode.
        mode: DeliveryMode,
    },

    /// The envelope could not be framed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The destination client is not connected.
    #[error("client is not connected")]
    NotConnected,
}

/// Outgoing envelopes of one client, in send order.
#[derive(Debug)]
pub struct SendQueue {
    pending: Vec<(DeliveryMode, Vec<u8>)>,
    max_batch_bytes: usize,
}

impl SendQueue {
    /// Create a queue. `max_batch_bytes` caps packets on modes whose MTU is
    /// effectively unbounded.
    pub fn new(max_batch_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_batch_bytes,
        }
    }

    /// Frame and queue one envelope.
    pub fn enqueue(
        &mut self,
        envelope: &Envelope,
        mode: DeliveryMode,
        mtu: usize,
    ) -> Result<(), SendError> {
        let framed = envelope.to_bytes()?;
        if framed.len() > mtu {
            return Err(SendError::ExceedsMtu {
                size: framed.len(),
                mtu,
                mode,
            });
        }
        self.pending.push((mode, framed));
        Ok(())
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Batch queued envelopes into packets and empty the queue.
    ///
    /// Consecutive envelopes sharing a mode go into the same packet until the
    /// next one would overflow `min(mtu, max_batch_bytes)`. Packet order equals
    /// enqueue order.
    pub fn drain_packets(
        &mut self,
        mtu_of: impl Fn(DeliveryMode) -> usize,
    ) -> Vec<(DeliveryMode, Vec<u8>)> {
        let mut packets: Vec<(DeliveryMode, Vec<u8>)> = Vec::new();

        for (mode, framed) in self.pending.drain(..) {
            let limit = mtu_of(mode).min(self.max_batch_bytes);
            let fits = matches!(
                packets.last(),
                Some((last_mode, packet)) if *last_mode == mode && packet.len() + framed.len() <= limit
            );
            if !fits {
                packets.push((mode, framed));
            } else if let Some((_, packet)) = packets.last_mut() {
                packet.extend_from_slice(&framed);
            }
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(len: usize) -> Envelope {
        Envelope::new(1, vec![0xAB; len])
    }

    #[test]
    fn test_oversized_envelope_refused() {
        let mut queue = SendQueue::new(1024);
        let result = queue.enqueue(&envelope(100), DeliveryMode::Unreliable, 64);
        assert_eq!(
            result,
            Err(SendError::ExceedsMtu {
                size: 103,
                mtu: 64,
                mode: DeliveryMode::Unreliable
            })
        );
        assert!(queue.is_empty(), "refused envelope must not be queued");
    }

    #[test]
    fn test_same_mode_batched() {
        let mut queue = SendQueue::new(1024);
        for _ in 0..3 {
            queue
                .enqueue(&envelope(10), DeliveryMode::ReliableOrdered, usize::MAX)
                .unwrap();
        }
        let packets = queue.drain_packets(|_| usize::MAX);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1.len(), 39);
        assert_eq!(Envelope::decode_all(&packets[0].1).unwrap().len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_modes_never_mixed() {
        let mut queue = SendQueue::new(1024);
        queue.enqueue(&envelope(1), DeliveryMode::ReliableOrdered, 1024).unwrap();
        queue.enqueue(&envelope(1), DeliveryMode::Unreliable, 1024).unwrap();
        queue.enqueue(&envelope(1), DeliveryMode::ReliableOrdered, 1024).unwrap();

        let modes: Vec<_> = queue.drain_packets(|_| 1024).into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            modes,
            vec![
                DeliveryMode::ReliableOrdered,
                DeliveryMode::Unreliable,
                DeliveryMode::ReliableOrdered
            ]
        );
    }

    #[test]
    fn test_batches_split_at_mtu() {
        let mut queue = SendQueue::new(usize::MAX);
        for _ in 0..5 {
            queue.enqueue(&envelope(17), DeliveryMode::Unreliable, 50).unwrap();
        }
        // 20 bytes each, two fit in 50.
        let packets = queue.drain_packets(|_| 50);
        let sizes: Vec<usize> = packets.iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, vec![40, 40, 20]);
    }

    #[test]
    fn test_batch_cap_applies_to_unbounded_modes() {
        let mut queue = SendQueue::new(30);
        queue.enqueue(&envelope(17), DeliveryMode::ReliableOrdered, usize::MAX).unwrap();
        queue.enqueue(&envelope(17), DeliveryMode::ReliableOrdered, usize::MAX).unwrap();
        // Larger than the batch cap but within the MTU: sent alone.
        queue.enqueue(&envelope(100), DeliveryMode::ReliableOrdered, usize::MAX).unwrap();

        let packets = queue.drain_packets(|_| usize::MAX);
        let sizes: Vec<usize> = packets.iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, vec![20, 20, 103]);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut queue = SendQueue::new(1024);
        queue.enqueue(&envelope(1), DeliveryMode::Unreliable, 1024).unwrap();
        queue.clear();
        assert!(queue.drain_packets(|_| 1024).is_empty());
    }
}
