//! Datagram view of a tunnel connection.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use super::TunnelConnection;

/// Connectionless interface over a single tunnel connection.
///
/// The tunnel server relays to exactly one destination per connection, so
/// this is a single-peer circuit: every receive reports the tunnel server as
/// sender, and every send goes to the tunnel server whatever address it
/// names. Callers that need several peers open one tunnel per peer.
#[derive(Debug)]
pub struct TunnelDatagram {
    conn: TunnelConnection,
}

impl TunnelDatagram {
    pub fn new(conn: TunnelConnection) -> Self {
        Self { conn }
    }

    pub async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let n = self.conn.read(buf).await?;
        Ok((n, self.conn.peer_addr()))
    }

    /// Send `buf` as one message to the tunnel peer. `addr` is not used for
    /// routing.
    pub async fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if addr != self.conn.peer_addr() {
            trace!(requested = %addr, peer = %self.conn.peer_addr(), "datagram redirected to tunnel peer");
        }
        let n = self.conn.write(buf).await?;
        self.conn.flush().await?;
        Ok(n)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.conn.set_deadline(deadline);
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.conn.close().await
    }

    pub fn into_inner(self) -> TunnelConnection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::ws_pair;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn test_send_to_any_address_reaches_tunnel_peer() {
        let (conn, mut server) = ws_pair().await;
        let mut datagram = TunnelDatagram::new(conn);

        let elsewhere: SocketAddr = "198.51.100.9:53".parse().unwrap();
        let n = datagram.send_to(b"query", elsewhere).await.unwrap();
        assert_eq!(n, 5);

        match server.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"query"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_from_reports_tunnel_peer() {
        let (conn, mut server) = ws_pair().await;
        let peer = conn.peer_addr();
        let mut datagram = TunnelDatagram::new(conn);

        server.send(Message::Binary(b"answer".to_vec())).await.unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = datagram.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, peer);
        assert_eq!(datagram.peer_addr(), peer);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _server) = ws_pair().await;
        let mut datagram = TunnelDatagram::new(conn);
        datagram.close().await.unwrap();
        datagram.close().await.unwrap();
    }
}
