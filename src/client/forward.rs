use futures_util::{stream, Stream, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TunnelClient;

/// Pause after a failed accept so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept local TCP connections and relay each through its own tunnel to
/// `target` until `shutdown` fires.
pub async fn forward_tcp(
    client: Arc<TunnelClient>,
    listener: TcpListener,
    target: String,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!(listen = %listener.local_addr()?, target = %target, "forwarding");

    let incoming = stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    });
    serve(client, incoming, target.into(), shutdown).await;

    info!("forwarding stopped");
    Ok(())
}

async fn serve<S>(client: Arc<TunnelClient>, incoming: S, target: Arc<str>, shutdown: CancellationToken)
where
    S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    futures_util::pin_mut!(incoming);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = incoming.next() => next,
        };
        let (local, from) = match next {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            None => break,
        };
        debug!(from = %from, "accepted local connection");

        let client = client.clone();
        let target = target.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(from = %from, "relay cancelled"),
                result = relay(&client, local, &target) => match result {
                    Ok((up, down)) => debug!(from = %from, up, down, "relay finished"),
                    Err(e) => warn!(from = %from, error = %e, "relay failed"),
                },
            }
        });
    }
}

async fn relay(client: &TunnelClient, mut local: TcpStream, target: &str) -> io::Result<(u64, u64)> {
    let mut tunnel = client.dial(target).await.map_err(io::Error::from)?;
    let copied = copy_bidirectional(&mut local, &mut tunnel).await;
    let _ = tunnel.close().await;
    copied
}
