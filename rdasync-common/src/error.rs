//! # Error Taxonomy
//!
//! Purpose: Name every way a request can fail, split by who is at fault and
//! how the failure travels back to the caller.
//!
//! ## Design Principles
//! 1. **Layered Errors**: Protocol errors never leave a connection; they are
//!    wrapped into connection errors first.
//! 2. **Fan-Out Friendly**: Connection errors are `Clone` so one broken socket
//!    can fail every request queued behind it.
//! 3. **Sync vs Async**: Client errors are returned at the call site, the rest
//!    arrive through error callbacks.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for calls that only fail on caller misuse.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Framing failures reported by the RESP decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First byte of a record is not one of `+ - : $ *`.
    #[error("wrong introduction byte")]
    WrongIntroduction,
    /// The buffer ends before the record does. Retry with more bytes.
    #[error("not enough data")]
    NotEnoughData,
    /// A count or integer field is not a valid signed 64-bit number.
    #[error("count conversion failed")]
    CountConversion,
    /// A bulk length or array count is below -1.
    #[error("count out of range")]
    CountRange,
    /// Bulk payload is not followed by CRLF.
    #[error("bulk terminator missing")]
    BulkTerminator,
}

impl ProtocolError {
    /// Returns true for the retry-later signal, false for fatal framing errors.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::NotEnoughData)
    }
}

/// Transport or framing failure that kills a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Socket level failure (refused, reset, DNS).
    #[error("io error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
    /// A connect, write or reply wait exceeded its configured timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ClosedByPeer,
    /// The byte stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A reply arrived while no command was in flight.
    #[error("unexpected reply from server")]
    UnexpectedReply,
    /// The handshake (AUTH / SELECT) was rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The pool stopped accepting work.
    #[error("connection pool is closed")]
    PoolClosed,
    /// The connection shut down before the request was sent.
    #[error("connection terminated")]
    Terminated,
    /// The connection string or options are malformed.
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Error reply sent by the server for one command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error: {message}")]
pub struct QueryError {
    /// Text after the leading `-`.
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        QueryError {
            message: message.into(),
        }
    }
}

/// Caller misuse, reported synchronously.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("command must have at least one argument")]
    EmptyCommand,
    #[error("batch must contain at least one command")]
    EmptyBatch,
    /// A variadic builder received no keys or members.
    #[error("{0} requires at least one argument")]
    EmptyArguments(&'static str),
    #[error("unknown connection alias: {0}")]
    UnknownAlias(String),
    #[error("service is stopped")]
    ServiceStopped,
    #[error("pool size cannot be zero")]
    InvalidPoolSize,
    /// Called outside a tokio runtime without an owned reactor.
    #[error("no reactor available to drive connections")]
    NoReactor,
    #[error("reactor error: {0}")]
    Reactor(#[from] io::Error),
    /// A result callback panicked while handling its value.
    #[error("result callback panicked: {0}")]
    CallbackPanicked(String),
    /// The reply had a shape the typed API did not expect.
    #[error("unexpected response")]
    UnexpectedResponse,
}

/// Any failure a request can resolve with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl Error {
    /// Returns the server error, if this is one.
    pub fn as_query(&self) -> Option<&QueryError> {
        match self {
            Error::Query(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the connection error, if this is one.
    pub fn as_connection(&self) -> Option<&ConnectionError> {
        match self {
            Error::Connection(err) => Some(err),
            _ => None,
        }
    }
}
