//! Error types for memd-engine

use std::io;
use thiserror::Error;

/// Error codes visible to the owner of a request
///
/// These are what a caller sees when a request completes without success.
/// Transport and protocol failures are mostly handled inside the engine and
/// only reach the caller when a request cannot be completed at all.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("generic error")]
    Generic,

    #[error("operation timed out")]
    Timeout,

    #[error("authentication failed")]
    AuthError,

    #[error("cluster map changed")]
    MapChanged,

    #[error("protocol error")]
    ProtocolError,

    #[error("bucket does not exist")]
    BucketNotFound,

    #[error("could not connect to any node")]
    ConnectError,

    #[error("network error")]
    NetworkError,

    #[error("socket was shut down")]
    Shutdown,

    #[error("temporary failure, try again later")]
    TemporaryFailure,

    #[error("constraint failure")]
    ConstraintFailure,

    #[error("sub-document error")]
    SubdocError,

    #[error("invalid argument")]
    InvalidArgument,
}

impl ErrorCode {
    /// Whether this error originated in the transport layer
    pub fn is_network(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError | ErrorCode::ConnectError | ErrorCode::Shutdown
        )
    }

    /// Map an OS-level I/O error onto an error code
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable => ErrorCode::ConnectError,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorCode::NetworkError,
            _ => ErrorCode::NetworkError,
        }
    }
}

/// Top-level engine error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request failed: {0}")]
    Request(ErrorCode),
}

impl EngineError {
    /// The user-visible code this error collapses to
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Config(_) => ErrorCode::InvalidArgument,
            EngineError::Protocol(_) => ErrorCode::ProtocolError,
            EngineError::Topology(_) => ErrorCode::ProtocolError,
            EngineError::Io(e) => ErrorCode::from_io(e),
            EngineError::Request(code) => *code,
        }
    }
}

impl From<ErrorCode> for EngineError {
    fn from(code: ErrorCode) -> Self {
        EngineError::Request(code)
    }
}

/// Wire-level protocol errors (binary frames and HTTP)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Key and extras ({0} bytes) exceed body length ({1} bytes)")]
    BodyOverflow(usize, u32),

    #[error("Malformed HTTP response: {0}")]
    Http(String),
}

/// Cluster configuration and error map errors
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration has no servers")]
    NoServers,

    #[error("vBucket {vbucket} refers to server {server}, but only {count} servers exist")]
    BadVbucketMap {
        vbucket: usize,
        server: i32,
        count: usize,
    },

    #[error("Invalid status key in error map: {0}")]
    BadStatusKey(String),

    #[error("Unsupported error map version: {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        assert!(ErrorCode::NetworkError.is_network());
        assert!(ErrorCode::ConnectError.is_network());
        assert!(!ErrorCode::Timeout.is_network());
        assert!(!ErrorCode::MapChanged.is_network());
    }

    #[test]
    fn test_io_mapping() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ErrorCode::from_io(&refused), ErrorCode::ConnectError);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ErrorCode::from_io(&reset), ErrorCode::NetworkError);

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(EngineError::from(timeout).code(), ErrorCode::Timeout);
    }
}
