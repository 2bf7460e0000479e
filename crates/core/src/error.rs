//! Error types for fleetstore
//!
//! Two layers of errors live here:
//! - [`DriverError`]: what a backend connection reports (I/O failure, server
//!   error reply, malformed reply).
//! - [`StoreError`]: the closed taxonomy handed to callers. Every variant
//!   carries a stable [`ErrorCode`] and a human-readable message.
//!
//! [`DriverError::is_connection_failure`] is the one place that decides
//! whether a backend error means "the store is unreachable". Everything on the
//! write path routes through it so the write pool can be invalidated.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for backend connection calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Stable numeric codes for [`StoreError`] variants
///
/// The service layer maps these onto its own status codes, so the values
/// must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Catch-all
    UndefinedErrorType = 0,
    /// Store unreachable
    ConnectionFailed = 1,
    /// Record or index entry absent
    KeyNotFound = 2,
    /// Create collision
    KeyAlreadyExists = 3,
    /// Connected, but the read failed
    FetchFailed = 4,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Symbolic name of the code
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::UndefinedErrorType => "UndefinedErrorType",
            ErrorCode::ConnectionFailed => "ConnectionFailed",
            ErrorCode::KeyNotFound => "KeyNotFound",
            ErrorCode::KeyAlreadyExists => "KeyAlreadyExists",
            ErrorCode::FetchFailed => "FetchFailed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u16())
    }
}

/// Error taxonomy for store operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Dial refused or connection dropped against the store
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Requested record or index entry is absent
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Create collided with an existing record
    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    /// Connected, but the read operation failed
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Anything else, carrying the underlying error text
    #[error("{0}")]
    UndefinedErrorType(String),
}

impl StoreError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            StoreError::KeyNotFound(_) => ErrorCode::KeyNotFound,
            StoreError::KeyAlreadyExists(_) => ErrorCode::KeyAlreadyExists,
            StoreError::FetchFailed(_) => ErrorCode::FetchFailed,
            StoreError::UndefinedErrorType(_) => ErrorCode::UndefinedErrorType,
        }
    }

    /// Message without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            StoreError::ConnectionFailed(m)
            | StoreError::KeyNotFound(m)
            | StoreError::KeyAlreadyExists(m)
            | StoreError::FetchFailed(m)
            | StoreError::UndefinedErrorType(m) => m,
        }
    }

    /// True for [`StoreError::KeyNotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }

    /// True for [`StoreError::ConnectionFailed`]
    pub fn is_connection_failed(&self) -> bool {
        matches!(self, StoreError::ConnectionFailed(_))
    }

    /// Shorthand for `UndefinedErrorType`
    pub fn undefined(msg: impl Into<String>) -> Self {
        StoreError::UndefinedErrorType(msg.into())
    }

    /// Classify a backend error.
    ///
    /// Connection-level failures become `ConnectionFailed`; everything else is
    /// wrapped as `UndefinedErrorType` with `context` prepended.
    pub fn from_driver(err: DriverError, context: &str) -> Self {
        if err.is_connection_failure() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::UndefinedErrorType(format!("{}{}", context, err))
        }
    }

    /// Like [`StoreError::from_driver`] but non-connection failures become
    /// `FetchFailed`. Used on the read path.
    pub fn from_driver_fetch(err: DriverError, context: &str) -> Self {
        if err.is_connection_failure() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::FetchFailed(format!("{}{}", context, err))
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::UndefinedErrorType(format!("json serialization failed: {}", e))
    }
}

/// Errors reported by a backend connection
#[derive(Debug, Error)]
pub enum DriverError {
    /// Socket-level failure
    #[error("{0}")]
    Io(#[from] io::Error),

    /// The server answered with an error reply
    #[error("{0}")]
    Response(String),

    /// The reply could not be decoded into the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// Connection refused by the peer
    pub fn refused(addr: impl fmt::Display) -> Self {
        DriverError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("dial tcp {}: connect: connection refused", addr),
        ))
    }

    /// Peer closed the connection mid-conversation
    pub fn eof() -> Self {
        DriverError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"))
    }

    /// Whether this error means the store cannot be reached.
    ///
    /// Covers refused dials, dropped connections and the textual forms the
    /// drivers use for them.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            DriverError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                ) || is_connection_text(&e.to_string())
            }
            DriverError::Response(msg) | DriverError::Protocol(msg) => is_connection_text(msg),
        }
    }

    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            DriverError::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            _ => false,
        }
    }
}

fn is_connection_text(msg: &str) -> bool {
    msg.ends_with("connection refused") || msg == "EOF"
}
