//! Per-peer reliability state machine.
//!
//! An [`Endpoint`] does no I/O: callers feed it received datagrams and the
//! current time, and drain the datagrams it wants sent. The same type runs on
//! the server (one per peer) and inside [`super::UdpClient`].
//!
//! Three channels exist. Unreliable datagrams are passed through. Sequenced
//! datagrams carry a counter and stale ones are dropped. Reliable datagrams
//! are fragmented, acknowledged one by one, resent on a timer and reassembled
//! in order on the receiving side.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::packet::{Datagram, FRAGMENT_SIZE, MAX_FRAGMENTS, UNRELIABLE_HEADER, seq_newer};
use crate::delivery::{DeliveryMode, DisconnectCode};

/// Unacknowledged reliable datagrams allowed per peer. Further sends wait in a
/// backlog.
const MAX_IN_FLIGHT: usize = 256;

/// Reliable datagrams (in flight plus backlog) a peer may owe acks for before
/// it is dropped as stalled. Well under half the u16 sequence space.
const MAX_PENDING_RELIABLE: usize = 4096;

/// How far ahead of the next expected sequence number out-of-order reliable
/// datagrams are buffered.
const REORDER_WINDOW: u16 = 1024;

/// Native channels of the UDP backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UdpChannel {
    Unreliable,
    Sequenced,
    Reliable,
}

impl UdpChannel {
    /// Channel serving a requested mode.
    pub fn for_mode(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::Unreliable => UdpChannel::Unreliable,
            DeliveryMode::UnreliableSequenced => UdpChannel::Sequenced,
            DeliveryMode::ReliableOrdered
            | DeliveryMode::ReliableUnordered
            | DeliveryMode::ReliableSequenced => UdpChannel::Reliable,
        }
    }

    /// Mode this channel actually provides.
    pub fn delivery_mode(self) -> DeliveryMode {
        match self {
            UdpChannel::Unreliable => DeliveryMode::Unreliable,
            UdpChannel::Sequenced => DeliveryMode::UnreliableSequenced,
            UdpChannel::Reliable => DeliveryMode::ReliableOrdered,
        }
    }

    /// Largest payload accepted on this channel.
    pub fn mtu(self) -> usize {
        match self {
            UdpChannel::Unreliable | UdpChannel::Sequenced => {
                super::packet::DATAGRAM_MTU - UNRELIABLE_HEADER
            }
            UdpChannel::Reliable => FRAGMENT_SIZE * MAX_FRAGMENTS,
        }
    }
}

/// Timing knobs of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSettings {
    /// Silence after which a peer is dropped.
    pub timeout: Duration,
    /// Idle time after which a heartbeat is sent.
    pub heartbeat: Duration,
    /// Delay before an unacknowledged reliable datagram is resent.
    pub resend: Duration,
    /// Resends before a peer is considered gone.
    pub max_resends: u32,
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(1),
            resend: Duration::from_millis(100),
            max_resends: 50,
        }
    }
}

/// Something the endpoint extracted from a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A complete packet.
    Packet(Vec<u8>, DeliveryMode),
    /// The peer closed the connection.
    Closed(DisconnectCode),
}

/// A send the endpoint could not accept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{size}-byte packet exceeds the {mtu}-byte limit of the {channel:?} channel")]
pub struct PacketTooLarge {
    /// Packet size.
    pub size: usize,
    /// Channel limit.
    pub mtu: usize,
    /// Channel.
    pub channel: UdpChannel,
}

struct InFlight {
    bytes: Vec<u8>,
    last_sent: Instant,
    sends: u32,
}

/// Reliability state for one remote peer.
pub struct Endpoint {
    settings: UdpSettings,
    outbox: Vec<Vec<u8>>,
    last_recv: Instant,
    last_send: Instant,
    closed: bool,
    accepted: bool,
    /// Set when the endpoint closed itself; reported by the next `update`.
    ended: Option<DisconnectCode>,

    next_sequenced: u16,
    latest_sequenced: Option<u16>,

    next_reliable: u16,
    in_flight: BTreeMap<u16, InFlight>,
    backlog: VecDeque<(u16, Vec<u8>)>,
    expected: u16,
    reorder: BTreeMap<u16, (bool, Vec<u8>)>,
    assembling: Vec<u8>,
}

impl Endpoint {
    /// Create an endpoint for a peer first heard from at `now`.
    pub fn new(settings: UdpSettings, now: Instant) -> Self {
        Self {
            settings,
            outbox: Vec::new(),
            last_recv: now,
            last_send: now,
            closed: false,
            accepted: false,
            ended: None,
            next_sequenced: 0,
            latest_sequenced: None,
            next_reliable: 0,
            in_flight: BTreeMap::new(),
            backlog: VecDeque::new(),
            expected: 0,
            reorder: BTreeMap::new(),
            assembling: Vec::new(),
        }
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the remote side answered a CONNECT.
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Unacknowledged plus backlogged reliable datagrams.
    pub fn pending_reliable(&self) -> usize {
        self.in_flight.len() + self.backlog.len()
    }

    fn push(&mut self, datagram: &Datagram, now: Instant) {
        self.outbox.push(datagram.encode());
        self.last_send = now;
    }

    /// Queue a control datagram.
    pub fn send_control(&mut self, datagram: Datagram, now: Instant) {
        self.push(&datagram, now);
    }

    /// Queue one packet on the channel serving `mode`.
    pub fn send(
        &mut self,
        packet: &[u8],
        mode: DeliveryMode,
        now: Instant,
    ) -> Result<(), PacketTooLarge> {
        let channel = UdpChannel::for_mode(mode);
        if packet.len() > channel.mtu() {
            return Err(PacketTooLarge {
                size: packet.len(),
                mtu: channel.mtu(),
                channel,
            });
        }
        if self.closed {
            return Ok(());
        }

        match channel {
            UdpChannel::Unreliable => self.push(&Datagram::Unreliable(packet.to_vec()), now),
            UdpChannel::Sequenced => {
                let seq = self.next_sequenced;
                self.next_sequenced = seq.wrapping_add(1);
                self.push(
                    &Datagram::Sequenced {
                        seq,
                        payload: packet.to_vec(),
                    },
                    now,
                );
            }
            UdpChannel::Reliable => {
                let fragments = packet.len().div_ceil(FRAGMENT_SIZE).max(1);
                if self.pending_reliable() + fragments > MAX_PENDING_RELIABLE {
                    tracing::warn!(
                        "Peer owes acks for {} reliable datagrams, dropping it",
                        self.pending_reliable()
                    );
                    self.disconnect(DisconnectCode::ConnectionTimeout, now);
                    self.ended = Some(DisconnectCode::ConnectionTimeout);
                    return Ok(());
                }
                let mut chunks = packet.chunks(FRAGMENT_SIZE).peekable();
                if chunks.peek().is_none() {
                    self.queue_reliable(false, Vec::new());
                }
                while let Some(chunk) = chunks.next() {
                    let more = chunks.peek().is_some();
                    self.queue_reliable(more, chunk.to_vec());
                }
                self.promote_backlog(now);
            }
        }
        Ok(())
    }

    fn queue_reliable(&mut self, more: bool, payload: Vec<u8>) {
        let seq = self.next_reliable;
        self.next_reliable = seq.wrapping_add(1);
        let bytes = Datagram::Reliable { seq, more, payload }.encode();
        self.backlog.push_back((seq, bytes));
    }

    fn promote_backlog(&mut self, now: Instant) {
        while self.in_flight.len() < MAX_IN_FLIGHT {
            let Some((seq, bytes)) = self.backlog.pop_front() else {
                break;
            };
            self.outbox.push(bytes.clone());
            self.last_send = now;
            self.in_flight.insert(
                seq,
                InFlight {
                    bytes,
                    last_sent: now,
                    sends: 1,
                },
            );
        }
    }

    /// Process one received datagram.
    pub fn receive(&mut self, datagram: Datagram, now: Instant) -> Vec<Delivery> {
        if self.closed {
            return Vec::new();
        }
        self.last_recv = now;
        let mut deliveries = Vec::new();

        match datagram {
            Datagram::Connect => self.push(&Datagram::Accept, now),
            Datagram::Accept => self.accepted = true,
            Datagram::Heartbeat => {}
            Datagram::Disconnect(code) => {
                self.closed = true;
                deliveries.push(Delivery::Closed(code));
            }
            Datagram::Unreliable(payload) => {
                deliveries.push(Delivery::Packet(payload, DeliveryMode::Unreliable));
            }
            Datagram::Sequenced { seq, payload } => {
                let fresh = self
                    .latest_sequenced
                    .is_none_or(|latest| seq_newer(seq, latest));
                if fresh {
                    self.latest_sequenced = Some(seq);
                    deliveries.push(Delivery::Packet(payload, DeliveryMode::UnreliableSequenced));
                }
            }
            Datagram::Reliable { seq, more, payload } => {
                self.push(&Datagram::Ack { seq }, now);
                if seq == self.expected {
                    self.accept_fragment(more, payload, &mut deliveries);
                    while let Some((more, payload)) = self.reorder.remove(&self.expected) {
                        self.accept_fragment(more, payload, &mut deliveries);
                    }
                } else if seq_newer(seq, self.expected)
                    && seq.wrapping_sub(self.expected) < REORDER_WINDOW
                {
                    self.reorder.entry(seq).or_insert((more, payload));
                }
            }
            Datagram::Ack { seq } => {
                if self.in_flight.remove(&seq).is_some() {
                    self.promote_backlog(now);
                }
            }
        }

        deliveries
    }

    fn accept_fragment(&mut self, more: bool, payload: Vec<u8>, deliveries: &mut Vec<Delivery>) {
        self.expected = self.expected.wrapping_add(1);
        self.assembling.extend_from_slice(&payload);
        if self.assembling.len() > UdpChannel::Reliable.mtu() {
            tracing::warn!("Reliable packet exceeds {} fragments", MAX_FRAGMENTS);
            self.closed = true;
            deliveries.push(Delivery::Closed(DisconnectCode::InvalidData));
            return;
        }
        if !more {
            let packet = std::mem::take(&mut self.assembling);
            deliveries.push(Delivery::Packet(packet, DeliveryMode::ReliableOrdered));
        }
    }

    /// Drive timers: resends, heartbeats and timeouts. Returns the reason the
    /// connection just ended, if it did.
    pub fn update(&mut self, now: Instant) -> Option<DisconnectCode> {
        if let Some(code) = self.ended.take() {
            return Some(code);
        }
        if self.closed {
            return None;
        }
        if now.duration_since(self.last_recv) >= self.settings.timeout {
            self.closed = true;
            return Some(DisconnectCode::ConnectionTimeout);
        }

        let mut resends = Vec::new();
        for entry in self.in_flight.values_mut() {
            if now.duration_since(entry.last_sent) < self.settings.resend {
                continue;
            }
            if entry.sends > self.settings.max_resends {
                self.closed = true;
                return Some(DisconnectCode::ConnectionTimeout);
            }
            entry.sends += 1;
            entry.last_sent = now;
            resends.push(entry.bytes.clone());
        }
        if !resends.is_empty() {
            self.outbox.extend(resends);
            self.last_send = now;
        }

        if now.duration_since(self.last_send) >= self.settings.heartbeat {
            self.push(&Datagram::Heartbeat, now);
        }
        None
    }

    /// Close locally, queueing a DISCONNECT carrying `code`.
    pub fn disconnect(&mut self, code: DisconnectCode, now: Instant) {
        if self.closed {
            return;
        }
        self.push(&Datagram::Disconnect(code), now);
        self.closed = true;
        self.in_flight.clear();
        self.backlog.clear();
    }

    /// Take every datagram waiting to be sent.
    pub fn drain_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }
}
