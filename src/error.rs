use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::frame::{self, Frame};

/// Errors surfaced by [`Client`](crate::Client).
///
/// Cloneable so that a single failed connection attempt can be reported to every caller that was
/// waiting on it.
#[derive(Debug, Clone, ThisError)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("connection lost")]
    ConnectionLost,
    #[error("client closed")]
    Closed,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("{0}")]
    Decode(#[from] frame::Error),
    /// The store answered the command with an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// AUTH or SELECT was refused while setting up the connection.
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(Frame),
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Whether the error came from the connection rather than from a command's reply. The
    /// connection is gone after any of these.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionLost
                | ClientError::ConnectTimeout
                | ClientError::Decode(_)
                | ClientError::Handshake(_)
        )
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}
