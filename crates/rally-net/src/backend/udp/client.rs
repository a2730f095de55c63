//! Client side of the UDP backend, used by tests and tooling.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::endpoint::{Delivery, Endpoint, UdpSettings};
use super::packet::Datagram;
use crate::delivery::{DeliveryMode, DisconnectCode};
use crate::envelope::Envelope;
use crate::messages::{Message, MessageError};
use crate::transport::TransportError;

/// CONNECT attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 20;

/// Longest single wait on the socket, so timers keep running.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// A connection to one room over UDP.
pub struct UdpClient {
    socket: UdpSocket,
    endpoint: Endpoint,
    inbox: VecDeque<(Vec<u8>, DeliveryMode)>,
    closed: Option<DisconnectCode>,
}

impl UdpClient {
    /// Connect to a room's UDP address.
    pub async fn connect(server: SocketAddr, settings: UdpSettings) -> Result<Self, TransportError> {
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local.to_string(),
                source,
            })?;
        socket.connect(server).await?;

        let mut endpoint = Endpoint::new(settings, Instant::now());
        let mut buf = [0u8; 2048];
        for _ in 0..CONNECT_ATTEMPTS {
            socket.send(&Datagram::Connect.encode()).await?;
            let Ok(received) = tokio::time::timeout(settings.resend, socket.recv(&mut buf)).await
            else {
                continue;
            };
            let len = received?;
            if let Ok(datagram) = Datagram::decode(&buf[..len]) {
                endpoint.receive(datagram, Instant::now());
            }
            if endpoint.is_accepted() {
                tracing::debug!("UDP client connected to {server}");
                return Ok(Self {
                    socket,
                    endpoint,
                    inbox: VecDeque::new(),
                    closed: None,
                });
            }
        }

        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer from {server}"),
        )))
    }

    async fn flush(&mut self) -> io::Result<()> {
        for bytes in self.endpoint.drain_outbox() {
            self.socket.send(&bytes).await?;
        }
        Ok(())
    }

    /// Send one raw packet.
    pub async fn send(&mut self, packet: Vec<u8>, mode: DeliveryMode) -> Result<(), TransportError> {
        self.endpoint
            .send(&packet, mode, Instant::now())
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        self.flush().await?;
        Ok(())
    }

    /// Encode and send one message as its own packet.
    pub async fn send_message(
        &mut self,
        message: &Message,
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let packet = message
            .to_envelope()
            .and_then(|envelope| Ok(envelope.to_bytes()?))
            .map_err(|e: MessageError| {
                TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
            })?;
        self.send(packet, mode).await
    }

    /// Wait up to `wait` for the next packet. Returns `None` on timeout or once
    /// the room closed the connection.
    pub async fn recv_packet(&mut self, wait: Duration) -> Option<(Vec<u8>, DeliveryMode)> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; 2048];

        loop {
            if let Some(packet) = self.inbox.pop_front() {
                return Some(packet);
            }
            if self.closed.is_some() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let slice = POLL_SLICE.min(deadline - now);
            if let Ok(received) = tokio::time::timeout(slice, self.socket.recv(&mut buf)).await {
                match received {
                    Ok(len) => match Datagram::decode(&buf[..len]) {
                        Ok(datagram) => {
                            for delivery in self.endpoint.receive(datagram, Instant::now()) {
                                match delivery {
                                    Delivery::Packet(packet, mode) => {
                                        self.inbox.push_back((packet, mode))
                                    }
                                    Delivery::Closed(code) => self.closed = Some(code),
                                }
                            }
                        }
                        Err(e) => tracing::debug!("Dropping datagram: {e}"),
                    },
                    Err(e) => tracing::debug!("UDP receive error: {e}"),
                }
            }

            if let Some(code) = self.endpoint.update(Instant::now()) {
                self.closed = Some(code);
            }
            if let Err(e) = self.flush().await {
                tracing::debug!("UDP send failed: {e}");
            }
        }
    }

    /// Wait up to `wait` for the next packet and decode its messages.
    pub async fn recv_messages(&mut self, wait: Duration) -> Vec<Message> {
        let Some((packet, _)) = self.recv_packet(wait).await else {
            return Vec::new();
        };
        Envelope::decode_all(&packet)
            .map(|envelopes| {
                envelopes
                    .iter()
                    .filter_map(|envelope| Message::from_envelope(envelope).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Code the connection ended with, once it has.
    pub fn disconnect_code(&self) -> Option<DisconnectCode> {
        self.closed
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if self.closed.is_some() {
            return;
        }
        self.endpoint.disconnect(DisconnectCode::Normal, Instant::now());
        self.closed = Some(DisconnectCode::Normal);
        if let Err(e) = self.flush().await {
            tracing::debug!("UDP send failed: {e}");
        }
    }
}
