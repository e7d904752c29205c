use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{
    Endpoint, RustlsHandshaker, SecureConnection, SecureDial, TcpConnector, TlsHandshaker,
    TlsParams, TokioConnector,
};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};

/// Produces one TCP + TLS(+ECH) connection to the configured server per call.
pub struct TunnelDialer {
    endpoint: Endpoint,
    tls: TlsParams,
    connector: Arc<dyn TcpConnector>,
    handshaker: Arc<dyn TlsHandshaker>,
}

impl TunnelDialer {
    pub fn new(
        config: &TunnelConfig,
        connector: Arc<dyn TcpConnector>,
        handshaker: Arc<dyn TlsHandshaker>,
    ) -> Self {
        let endpoint = Endpoint {
            server: config.server().to_string(),
            port: config.port(),
            connect_host: config.ip().unwrap_or(config.server()).to_string(),
            dns: config.dns().map(str::to_string),
        };
        // Inner SNI is the configured server, never the outer ECH name; the
        // WebSocket layer sends the same value as Host.
        let tls = TlsParams {
            server_name: config.server().to_string(),
            ech: config.ech().clone(),
            verification: config.verification().clone(),
            client_fingerprint: config.client_fingerprint(),
        };

        Self {
            endpoint,
            tls,
            connector,
            handshaker,
        }
    }

    /// Dialer with the tokio TCP connector and the rustls handshaker.
    pub fn with_defaults(config: &TunnelConfig) -> Self {
        Self::new(config, Arc::new(TokioConnector), Arc::new(RustlsHandshaker))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn tls_params(&self) -> &TlsParams {
        &self.tls
    }
}

#[async_trait]
impl SecureDial for TunnelDialer {
    async fn secure_dial(&self, logical_target: &str, deadline: Instant) -> Result<SecureConnection> {
        debug!(
            server = %self.endpoint.server,
            connect = %self.endpoint.connect_host,
            port = self.endpoint.port,
            target = %logical_target,
            "dialing tunnel server"
        );

        let tcp = timeout_at(deadline, self.connector.connect(&self.endpoint))
            .await
            .map_err(|_| TunnelError::Transport(TunnelError::timed_out("TCP connect")))?
            .map_err(TunnelError::Transport)?;

        let local_addr = tcp.local_addr().map_err(TunnelError::Transport)?;
        let peer_addr = tcp.peer_addr().map_err(TunnelError::Transport)?;

        let io = timeout_at(deadline, self.handshaker.handshake(tcp, &self.tls))
            .await
            .map_err(|_| TunnelError::Handshake("TLS handshake timed out".to_string()))??;

        debug!(local = %local_addr, peer = %peer_addr, "secure connection established");

        Ok(SecureConnection {
            io,
            local_addr,
            peer_addr,
        })
    }
}
