//! Secured transport for the tunnel.
//!
//! A dial goes through two host-replaceable capabilities:
//! - [`TcpConnector`] - the generic dialer (routing, interface binding, name
//!   resolution all live behind it)
//! - [`TlsHandshaker`] - TLS with optional Encrypted Client Hello
//!
//! [`TunnelDialer`] composes them and exposes the result as [`SecureDial`],
//! the only thing the WebSocket layer knows about.

mod dialer;
mod tcp;
mod tls;

pub use dialer::TunnelDialer;
pub use tcp::TokioConnector;
pub use tls::{ClientHelloProfile, RustlsHandshaker};
pub(crate) use tls::check_ech_public_name;
#[cfg(test)]
pub(crate) use tls::sample_ech_config_list;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::{CertVerification, ClientFingerprint, EchPolicy};
use crate::error::Result;

/// Byte stream the WebSocket layer runs over.
pub trait SecureIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SecureIo for T {}

pub type BoxedIo = Box<dyn SecureIo>;

/// Where the TCP connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Configured server name.
    pub server: String,
    pub port: u16,
    /// IP override, or the server name itself.
    pub connect_host: String,
    /// DNS server the host dialer should use, if it honors one.
    pub dns: Option<String>,
}

/// Everything the TLS layer needs for one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    /// Inner SNI and certificate name. Always the configured server, the
    /// same value the WebSocket layer sends as `Host`.
    pub server_name: String,
    pub ech: EchPolicy,
    pub verification: CertVerification,
    pub client_fingerprint: ClientFingerprint,
}

/// An established, secured, single-use connection to the tunnel server.
pub struct SecureConnection {
    pub io: BoxedIo,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConnection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// The host's generic TCP dialer.
#[async_trait]
pub trait TcpConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream>;
}

/// TLS (+ECH) handshake over an established TCP connection.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn handshake(&self, tcp: TcpStream, params: &TlsParams) -> Result<BoxedIo>;
}

/// Capability handed to the WebSocket layer: produce one secured connection
/// to the tunnel server. `logical_target` is informational only.
///
/// `deadline` bounds the whole dial; it is shared with the WebSocket upgrade
/// that follows, so an implementation must give up once it passes.
#[async_trait]
pub trait SecureDial: Send + Sync {
    async fn secure_dial(&self, logical_target: &str, deadline: Instant) -> Result<SecureConnection>;
}
