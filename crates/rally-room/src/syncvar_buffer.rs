//! Per-entity store of the latest SyncVar values.
//!
//! One slot per (behaviour, field). Writes always overwrite.

use rustc_hash::FxHashMap;

use rally_net::{BehaviourId, FieldId};

use crate::rpc_buffer::BufferedMessage;

/// (behaviour, field) slot of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncVarKey {
    pub behaviour: BehaviourId,
    pub field: FieldId,
}

/// Latest SyncVar writes of one entity.
#[derive(Debug, Default)]
pub struct SyncVarBuffer {
    next_seq: u64,
    slots: FxHashMap<SyncVarKey, (u64, BufferedMessage)>,
}

impl SyncVarBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a write, returning the value it replaced.
    pub fn set(&mut self, key: SyncVarKey, message: BufferedMessage) -> Option<BufferedMessage> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(key, (seq, message)).map(|(_, old)| old)
    }

    /// Current value of one slot.
    pub fn get(&self, key: SyncVarKey) -> Option<&BufferedMessage> {
        self.slots.get(&key).map(|(_, message)| message)
    }

    /// Every value, oldest write first.
    pub fn entries(&self) -> Vec<&BufferedMessage> {
        let mut slots: Vec<&(u64, BufferedMessage)> = self.slots.values().collect();
        slots.sort_unstable_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, message)| message).collect()
    }

    /// Remove everything, returning the removed values.
    pub fn clear_all(&mut self) -> Vec<BufferedMessage> {
        let mut drained: Vec<(u64, BufferedMessage)> = self.slots.drain().map(|(_, v)| v).collect();
        drained.sort_unstable_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, message)| message).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
