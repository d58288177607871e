//! Error types for broker-tether
//!
//! Every error carries an [`ErrorKind`] tag. The reconnect loop decides what to
//! do next by switching on the tag, never on the concrete variant.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker reported connection loss or the handshake failed
    #[error("connection error: {0}")]
    Connection(String),

    /// TLS, certificate or authentication failure
    #[error("security error: {0}")]
    Security(String),

    /// Low-level socket error
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// Malformed data received from the broker
    #[error("malformed frame: {0}")]
    FrameDecode(String),

    /// Handler registration on a connection that cannot accept it
    #[error("registration error: {0}")]
    Registration(String),

    /// Deliberate external cancellation
    #[error("interrupted")]
    Interrupted,

    /// Nothing happened before the deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Anything the transport could not classify
    #[error("{0}")]
    Unclassified(String),
}

/// Error classification tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration (never retried)
    Config,
    /// Connection lost or handshake failed
    Connection,
    /// TLS / certificate / authentication failure
    Security,
    /// Low-level socket failure
    Socket,
    /// Malformed frame
    FrameDecode,
    /// Registration on a closed connection
    Registration,
    /// Manual interrupt
    Interrupted,
    /// Deadline elapsed
    Timeout,
    /// Unknown failure
    Unclassified,
}

/// What the reconnect loop does with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Terminate cleanly, no retry
    Stop,
    /// Close and retry per the backoff policy
    Retry,
    /// Log full detail and terminate
    Abort,
}

impl ErrorKind {
    /// Decision table for the reconnect loop
    pub fn action(&self) -> Action {
        match self {
            ErrorKind::Interrupted => Action::Stop,
            ErrorKind::Connection
            | ErrorKind::Security
            | ErrorKind::Socket
            | ErrorKind::Timeout
            | ErrorKind::FrameDecode => Action::Retry,
            ErrorKind::Config | ErrorKind::Registration | ErrorKind::Unclassified => {
                Action::Abort
            }
        }
    }

    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Connection => "connection",
            ErrorKind::Security => "security",
            ErrorKind::Socket => "socket",
            ErrorKind::FrameDecode => "frame_decode",
            ErrorKind::Registration => "registration",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classification tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Security(_) => ErrorKind::Security,
            Error::Io(_) => ErrorKind::Socket,
            Error::FrameDecode(_) => ErrorKind::FrameDecode,
            Error::Registration(_) => ErrorKind::Registration,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidState { .. } | Error::Unclassified(_) => ErrorKind::Unclassified,
        }
    }

    /// Whether the reconnect loop retries after this error
    pub fn is_retryable(&self) -> bool {
        self.kind().action() == Action::Retry
    }

    /// Build an error of the given kind from a message
    ///
    /// Used by transports that only know the classification of a failure.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Config => Error::Config(message),
            ErrorKind::Connection => Error::Connection(message),
            ErrorKind::Security => Error::Security(message),
            ErrorKind::Socket => Error::Io(io::Error::new(io::ErrorKind::Other, message)),
            ErrorKind::FrameDecode => Error::FrameDecode(message),
            ErrorKind::Registration => Error::Registration(message),
            ErrorKind::Interrupted => Error::Interrupted,
            ErrorKind::Timeout => Error::Timeout(Duration::ZERO),
            ErrorKind::Unclassified => Error::Unclassified(message),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
