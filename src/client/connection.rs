use futures_util::SinkExt;
use http::header::{HeaderValue, HOST, SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};
use url::Url;

use super::{TunnelConnection, TunnelDatagram};
use crate::config::{host_literal, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::transport::{SecureConnection, SecureDial, TunnelDialer};

const CLIENT_USER_AGENT: &str = concat!("echtunnel/", env!("CARGO_PKG_VERSION"));

/// Dials virtual circuits through the tunnel server.
///
/// Every [`dial`](Self::dial) runs its own TCP, TLS and WebSocket handshake;
/// nothing is pooled or shared between connections.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    dialer: Arc<dyn SecureDial>,
    closed: AtomicBool,
}

impl TunnelClient {
    /// Client using the default tokio + rustls dialer.
    pub fn new(config: TunnelConfig) -> Self {
        let dialer = Arc::new(TunnelDialer::with_defaults(&config));
        Self::with_dialer(config, dialer)
    }

    pub fn with_dialer(config: TunnelConfig, dialer: Arc<dyn SecureDial>) -> Self {
        Self {
            config: Arc::new(config),
            dialer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Open a circuit to `target` (`host:port`, passed to the server verbatim).
    pub async fn dial(&self, target: &str) -> Result<TunnelConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel client is closed",
            )));
        }

        // One budget for the whole handshake phase: TCP, TLS, upgrade and
        // the address message all share it.
        let deadline = Instant::now() + self.config.handshake_timeout();

        let SecureConnection {
            io,
            local_addr,
            peer_addr,
        } = self.dialer.secure_dial(target, deadline).await?;

        // `ws`, not `wss`: the stream is already TLS.
        let request = upgrade_request(&self.config)?;

        let (mut ws, response) = match timeout_at(deadline, client_async(request, io)).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => return Err(upgrade_error(e)),
            Err(_) => {
                return Err(TunnelError::Upgrade {
                    status: None,
                    message: "handshake timed out".to_string(),
                })
            }
        };
        debug!(
            status = %response.status(),
            protocol = ?response.headers().get(SEC_WEBSOCKET_PROTOCOL),
            "websocket upgraded"
        );

        // Exactly one text message announcing the destination, before any
        // binary payload. On failure `ws` is dropped, closing the transport.
        match timeout_at(deadline, ws.send(Message::Text(target.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TunnelError::AddressSend(e.to_string())),
            Err(_) => return Err(TunnelError::AddressSend("timed out".to_string())),
        }

        info!(server = %self.config.server(), target = %target, "tunnel established");
        Ok(TunnelConnection::new(ws, local_addr, peer_addr))
    }

    /// Datagram view over a freshly dialed circuit. Requires `udp` in config.
    pub async fn listen_packet(&self, target: &str) -> Result<TunnelDatagram> {
        if !self.config.udp() {
            return Err(TunnelError::UnsupportedOperation("UDP not supported"));
        }
        let conn = self.dial(target).await?;
        Ok(TunnelDatagram::new(conn))
    }

    /// UDP-over-TCP is not offered.
    pub fn supports_uot(&self) -> bool {
        false
    }

    /// Refuse further dials. Established connections are owned by their
    /// callers and stay open. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(server = %self.config.server(), "tunnel client closed");
        }
        Ok(())
    }
}

/// Upgrade request: `ws://server:port/path[?token=..]` with `Host` pinned to
/// the server name (the same name used as inner SNI) and the token repeated
/// in `Sec-WebSocket-Protocol`, since gateways read one or the other.
pub(crate) fn upgrade_request(config: &TunnelConfig) -> Result<Request> {
    let mut url = Url::parse(&format!("ws://{}{}", config.server_addr(), config.path()))
        .map_err(|e| TunnelError::InvalidConfig(format!("websocket URL: {}", e)))?;
    if let Some(token) = config.token() {
        url.query_pairs_mut().append_pair("token", token);
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::InvalidConfig(format!("websocket request: {}", e)))?;

    let headers = request.headers_mut();
    headers.insert(HOST, header_value(&host_literal(config.server()))?);
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    if let Some(token) = config.token() {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(token)?);
    }

    Ok(request)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| TunnelError::InvalidConfig(format!("not a valid header value: {}", value)))
}

fn upgrade_error(e: WsError) -> TunnelError {
    match e {
        WsError::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .filter(|b| !b.is_empty());
            TunnelError::Upgrade {
                status: Some(response.status()),
                message: match body {
                    Some(body) => format!("server rejected upgrade: {}", body),
                    None => "server rejected upgrade".to_string(),
                },
            }
        }
        other => TunnelError::Upgrade {
            status: None,
            message: other.to_string(),
        },
    }
}
