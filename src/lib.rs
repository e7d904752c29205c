//! ECH tunnel dialer.
//!
//! Opens virtual circuits to arbitrary `host:port` targets through a remote
//! tunnel server. Each circuit is layered as:
//!
//! 1. TCP to the server (or to an IP override),
//! 2. TLS 1.3, optionally with Encrypted Client Hello hiding the real name,
//! 3. a WebSocket upgrade carrying the auth token,
//! 4. one text message naming the target, then binary messages as payload.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use echtunnel::{TunnelClient, TunnelConfig};
//! use tokio::io::AsyncWriteExt;
//!
//! let config = TunnelConfig::builder("edge.example", 443)
//!     .token("secret")
//!     .ech(true)
//!     .build()?;
//! let client = TunnelClient::new(config);
//! let mut conn = client.dial("example.org:80").await?;
//! conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod client;
pub mod config;
pub mod error;
pub mod transport;

pub use client::{forward_tcp, TunnelClient, TunnelConnection, TunnelDatagram};
pub use config::{
    CertVerification, ClientFingerprint, EchPolicy, TunnelConfig, TunnelConfigBuilder,
    TunnelOptions,
};
pub use error::{Result, TunnelError};
pub use transport::{SecureDial, TunnelDialer};
