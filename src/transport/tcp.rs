//! Default TCP dialer backed by tokio.

use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Endpoint, TcpConnector};

/// Plain `TcpStream::connect` with `TCP_NODELAY`. Names are resolved by the
/// system resolver; hosts that need routing marks or a custom DNS server
/// supply their own [`TcpConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioConnector;

#[async_trait]
impl TcpConnector for TokioConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        if let Some(dns) = &endpoint.dns {
            debug!(dns = %dns, "custom DNS server ignored by the system resolver");
        }

        let stream = TcpStream::connect((endpoint.connect_host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true).ok();

        debug!(
            host = %endpoint.connect_host,
            port = endpoint.port,
            peer = ?stream.peer_addr().ok(),
            "TCP connected"
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_override_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let endpoint = Endpoint {
            server: "edge.example".to_string(),
            port: addr.port(),
            connect_host: "127.0.0.1".to_string(),
            dns: None,
        };

        let (client, accepted) = tokio::join!(TokioConnector.connect(&endpoint), listener.accept());
        let client = client.unwrap();
        let (_server, from) = accepted.unwrap();

        assert_eq!(client.peer_addr().unwrap(), addr);
        assert_eq!(client.local_addr().unwrap(), from);
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            server: "edge.example".to_string(),
            port,
            connect_host: "127.0.0.1".to_string(),
            dns: None,
        };
        assert!(TokioConnector.connect(&endpoint).await.is_err());
    }
}
