use std::io;

use http::StatusCode;
use thiserror::Error;

/// Failure kinds of a tunnel dial or of an established tunnel connection.
///
/// None of these are retried internally; the caller owns retry policy.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("websocket upgrade failed: {}", upgrade_detail(.status, .message))]
    Upgrade {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("send target address failed: {0}")]
    AddressSend(String),

    #[error("unexpected message type: {0}")]
    Framing(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),
}

fn upgrade_detail(status: &Option<StatusCode>, message: &str) -> String {
    match status {
        Some(status) => format!("status={}, {}", status, message),
        None => message.to_string(),
    }
}

impl TunnelError {
    /// Recover the tunnel error carried inside an `io::Error` produced by a
    /// [`TunnelConnection`](crate::TunnelConnection).
    pub fn from_io(err: &io::Error) -> Option<&TunnelError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<TunnelError>())
    }

    pub(crate) fn timed_out(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Transport(e) => e.kind(),
            TunnelError::Framing(_) => io::ErrorKind::InvalidData,
            TunnelError::UnsupportedOperation(_) => io::ErrorKind::Unsupported,
            TunnelError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
