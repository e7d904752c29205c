//! Byte stream over WebSocket binary messages.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, timeout_at, Duration, Instant, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::TunnelError;
use crate::transport::BoxedIo;

/// Upper bound on [`TunnelConnection::close`] without a write deadline.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An established tunnel: one virtual circuit to the target announced at
/// dial time.
///
/// Reads drain binary messages as a continuous byte stream; a message may
/// span several reads and a read never spans two messages. Each write is
/// sent as exactly one binary message. Text messages after the handshake are
/// a protocol violation and fail the read with [`TunnelError::Framing`].
///
/// Reading and writing may happen concurrently via [`tokio::io::split`];
/// overlapping reads are not supported.
pub struct TunnelConnection {
    inner: WebSocketStream<BoxedIo>,
    /// Unread tail of the message currently being drained.
    residue: Option<Bytes>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    write_closed: bool,
    closed: bool,
}

impl TunnelConnection {
    pub(crate) fn new(
        inner: WebSocketStream<BoxedIo>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            inner,
            residue: None,
            local_addr,
            peer_addr,
            read_deadline: None,
            write_deadline: None,
            write_closed: false,
            closed: false,
        }
    }

    /// Local address of the transport socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the tunnel server, not of the dialed target.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads that would block past `deadline` fail with `TimedOut`.
    /// `None` clears it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Send the WebSocket close and shut the secured transport down.
    /// Calling it again is a no-op.
    ///
    /// Bounded by the write deadline, or [`CLOSE_TIMEOUT`] when none is set.
    /// A peer that stops reading only loses the close frame.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.residue = None;

        let deadline = self
            .write_deadline
            .as_ref()
            .map(|sleep| sleep.deadline())
            .unwrap_or_else(|| Instant::now() + CLOSE_TIMEOUT);

        let result = if self.write_closed {
            Ok(())
        } else {
            self.write_closed = true;
            match timeout_at(deadline, self.inner.close(None)).await {
                Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {
                    Ok(())
                }
                Ok(Err(WsError::Io(e))) if is_disconnect(&e) => Ok(()),
                Ok(Err(e)) => Err(ws_io_error(e)),
                Err(_) => {
                    debug!("close frame not flushed before deadline");
                    Ok(())
                }
            }
        };

        match timeout_at(deadline, self.inner.get_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "transport shutdown after close"),
            Err(_) => debug!("transport shutdown timed out"),
        }
        result
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

pub(crate) fn ws_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::other(other),
    }
}

fn poll_deadline<T>(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
    what: &str,
) -> Poll<io::Result<T>> {
    if let Some(sleep) = deadline {
        if sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(TunnelError::timed_out(what)));
        }
    }
    Poll::Pending
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(residue) = this.residue.as_mut() {
                let n = residue.len().min(buf.remaining());
                buf.put_slice(&residue.split_to(n));
                // End of message is not end of stream: the next read fetches
                // a new message.
                if residue.is_empty() {
                    this.residue = None;
                }
                return Poll::Ready(Ok(()));
            }

            if this.closed {
                return Poll::Ready(Ok(()));
            }

            let next = match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(next) => next,
                Poll::Pending => return poll_deadline(&mut this.read_deadline, cx, "read"),
            };

            match next {
                Some(Ok(Message::Binary(data))) => {
                    // A zero-length read would look like EOF to the caller.
                    if !data.is_empty() {
                        this.residue = Some(Bytes::from(data));
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(TunnelError::Framing("text".to_string()).into()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "tunnel closed by server");
                    return Poll::Ready(Ok(()));
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel connection closed",
            )));
        }
        // An empty message would be skipped by the reader anyway.
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => return poll_deadline(&mut this.write_deadline, cx, "write"),
        }

        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;

        // Push the message toward the wire now; whatever stays buffered goes
        // out on the next flush.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(Err(ws_io_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => Poll::Ready(result.map_err(ws_io_error)),
            Poll::Pending => poll_deadline(&mut this.write_deadline, cx, "flush"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_io_error(e))),
        }
    }
}
