//! Per-entity store of buffered RPC calls.
//!
//! Calls sent with [`BufferMode::Last`] or [`BufferMode::All`] are kept so a
//! client that becomes ready later can be brought up to date. The buffer owns
//! both of its indexes: the per-key list used for eviction and the flat
//! per-entity table used for replay and bulk clear. Callers learn about removed
//! entries through return values only.

use rustc_hash::FxHashMap;

use rally_net::{BehaviourId, ClientId, DeliveryMode, Envelope, MethodId};
use rally_net::messages::BufferMode;

/// A stored message eligible for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    /// Client whose call produced the entry.
    pub author: ClientId,
    /// The relayed envelope, exactly as sent live.
    pub envelope: Envelope,
    /// Mode the call was sent with; replay uses it again.
    pub mode: DeliveryMode,
}

/// (behaviour, method) slot of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcKey {
    pub behaviour: BehaviourId,
    pub method: MethodId,
}

/// Buffered RPCs of one entity.
#[derive(Debug, Default)]
pub struct RpcBuffer {
    next_seq: u64,
    /// Flat index: every entry by insertion sequence.
    entries: FxHashMap<u64, (RpcKey, BufferedMessage)>,
    /// Per-key index, oldest first.
    by_key: FxHashMap<RpcKey, Vec<u64>>,
}

impl RpcBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one call under `policy`. Returns the entries it evicted.
    pub fn set(
        &mut self,
        key: RpcKey,
        message: BufferedMessage,
        policy: BufferMode,
    ) -> Vec<BufferedMessage> {
        let mut evicted = Vec::new();
        match policy {
            BufferMode::None => return evicted,
            BufferMode::Last => {
                for seq in self.by_key.remove(&key).unwrap_or_default() {
                    if let Some((_, old)) = self.entries.remove(&seq) {
                        evicted.push(old);
                    }
                }
            }
            BufferMode::All => {}
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, (key, message));
        self.by_key.entry(key).or_default().push(seq);
        evicted
    }

    /// Entries stored under one key, oldest first.
    pub fn get(&self, key: RpcKey) -> Vec<&BufferedMessage> {
        self.by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|seq| self.entries.get(seq).map(|(_, message)| message))
            .collect()
    }

    /// Every entry in replay order. Within a key this is insertion order.
    pub fn entries(&self) -> Vec<&BufferedMessage> {
        let mut seqs: Vec<&u64> = self.entries.keys().collect();
        seqs.sort_unstable();
        seqs.into_iter()
            .filter_map(|seq| self.entries.get(seq).map(|(_, message)| message))
            .collect()
    }

    /// Remove everything, returning the removed entries.
    pub fn clear_all(&mut self) -> Vec<BufferedMessage> {
        self.by_key.clear();
        let mut drained: Vec<(u64, BufferedMessage)> = self
            .entries
            .drain()
            .map(|(seq, (_, message))| (seq, message))
            .collect();
        drained.sort_unstable_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, message)| message).collect()
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
