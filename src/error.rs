//! Crate-level errors.
//!
//! All fallible operations in this crate return [`Result`], built on a single
//! [`Error`] enum. The variants map onto the failure classes of the pool and
//! the script layer:
//!
//! - [`Error::PoolClosed`] / [`Error::NotOwned`]: pool discipline violations
//! - [`Error::Connect`] / [`Error::Io`]: transport-level failures
//! - [`Error::Server`]: a status code reported by the remote engine
//! - [`Error::Eval`]: the submitted script failed; the connection is fine
//! - [`Error::Config`] / [`Error::ScriptNotFound`] / [`Error::InvalidArgument`]:
//!   caller-side problems
//!
//! The distinction that matters operationally is [`Error::is_transport`]: a
//! transport error means the borrowed connection is unusable and must be
//! invalidated, while every other error returns the connection to the pool.

use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors raised by the pool, the driver, and the script executor.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// An operation was attempted on a closed pool.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A connection was returned or invalidated that is not checked out
    /// from this pool.
    #[error("connection is not checked out from this pool")]
    NotOwned,

    /// The driver could not open or authenticate a connection.
    #[error("connect error: {0}")]
    Connect(String),

    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// The remote engine reported a status code.
    #[error("server status: {0:?}")]
    Server(ServerStatus),

    /// The submitted script failed to evaluate. The connection itself is
    /// still usable.
    #[error("script evaluation failed: {0}")]
    Eval(String),

    /// Configuration document unreadable or missing required attributes.
    #[error("configuration error: {0}")]
    Config(String),

    /// The script loader could not locate the named resource.
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    /// A caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A value could not be read back as the declared type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl Error {
    /// True when the underlying transport is gone and a borrowed connection
    /// must be invalidated rather than released back to the pool.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_) | Error::Connect(_) => true,
            Error::Server(status) => status.is_transport(),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

/// Status codes reported by an Rserve-compatible server.
///
/// These are the low byte of the response command word when the response
/// carries an error. See the QAP1 protocol description shipped with Rserve.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ServerStatus {
    /// Authentication failed or was required and not provided.
    AuthFailed = 0x41,
    /// The connection was broken during the request.
    ConnectionBroken = 0x42,
    /// The command is not recognized in the current state.
    InvalidCommand = 0x43,
    /// A command parameter was missing or malformed.
    InvalidParameter = 0x44,
    /// R evaluation of the supplied expression failed.
    EvalFailed = 0x45,
    /// An I/O operation on the server side failed.
    IoFailed = 0x46,
    /// A file operation was attempted on a file that is not open.
    NotOpen = 0x47,
    /// The server denied access to the requested operation.
    AccessDenied = 0x48,
    /// The command is valid but not supported by this server build.
    UnsupportedCommand = 0x49,
    /// The command word is unknown to the server.
    UnknownCommand = 0x4a,
    /// The request payload exceeded the server's transfer limits.
    DataOverflow = 0x4b,
    /// The requested object is too big to be transported.
    ObjectTooBig = 0x4c,
    /// The server ran out of memory servicing the request.
    OutOfMemory = 0x4d,
    /// The control pipe to the server process was closed.
    ControlClosed = 0x4e,
    /// The session is busy with another request.
    SessionBusy = 0x50,
    /// The session could not be detached.
    DetachFailed = 0x51,
}

impl ServerStatus {
    /// Status codes that indicate the connection itself is no longer usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ServerStatus::ConnectionBroken
                | ServerStatus::IoFailed
                | ServerStatus::ControlClosed
        )
    }
}
