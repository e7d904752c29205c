//! Tunnel client implementation.
//!
//! This module provides the tunnel surface built on top of a secured transport:
//! - [`TunnelClient`] - dials virtual circuits through the tunnel server
//! - [`TunnelConnection`] - byte stream over WebSocket binary messages
//! - [`TunnelDatagram`] - single-peer datagram view of a connection
//! - [`forward_tcp`] - local TCP listener relayed through the tunnel

mod connection;
mod datagram;
mod forward;
mod stream;

pub use connection::TunnelClient;
pub use datagram::TunnelDatagram;
pub use forward::forward_tcp;
pub use stream::TunnelConnection;
