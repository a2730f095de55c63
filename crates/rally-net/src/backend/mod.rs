//! Backend implementations.

pub mod memory;
pub mod udp;
pub mod websocket;
