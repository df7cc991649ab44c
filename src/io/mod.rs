//! Transport and reactor interfaces
//!
//! The engine never touches sockets directly. Channels and providers call
//! into a [`Transport`] to start connects, write bytes and express read
//! interest; the reactor that owns the transport reports completions as
//! [`IoEvent`]s, which the owner routes back into the right state machine.

pub mod mio_reactor;
pub mod timer;

use std::fmt;
use std::time::Duration;

use crate::cluster::HostPort;
use crate::utils::ErrorCode;

pub use mio_reactor::MioReactor;
pub use timer::Timer;

/// Identifies one connect (or negotiation) attempt
///
/// Completions carry the id of the attempt they belong to so a cancelled or
/// superseded attempt can be recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectId(pub u64);

/// Identifies one established socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Features agreed during session negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Server accepts and returns datatype (compressed / JSON) flags
    pub datatype: bool,
    /// Mutations return sequence-number tokens
    pub mutation_tokens: bool,
}

/// Why a connect or negotiation attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFailure {
    pub error: ErrorCode,
    /// Raw OS error, when the failure came from the socket layer
    pub os_error: Option<i32>,
}

impl ConnectFailure {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            error,
            os_error: None,
        }
    }
}

/// Completion reported by the reactor
#[derive(Debug)]
pub enum IoEvent {
    /// A connect or negotiation attempt finished
    Connected {
        id: ConnectId,
        result: Result<SocketId, ConnectFailure>,
    },
    /// Bytes arrived on a socket
    Data { sock: SocketId, data: Vec<u8> },
    /// All buffered writes on a socket reached the kernel
    Flushed { sock: SocketId },
    /// The socket failed
    Failed { sock: SocketId, error: ErrorCode },
}

/// Byte-stream transport driven by an external reactor
pub trait Transport {
    /// Start connecting to `host`. Completion arrives as
    /// [`IoEvent::Connected`] with the returned id.
    fn connect(&mut self, host: &HostPort, timeout: Duration) -> ConnectId;

    /// Cancel an attempt; no completion will be reported for it
    fn cancel_connect(&mut self, id: ConnectId);

    /// Negotiated session on the socket, if negotiation already happened
    fn session(&self, sock: SocketId) -> Option<Features>;

    /// Start session negotiation. Completion arrives as
    /// [`IoEvent::Connected`] with the returned id and the same socket.
    fn negotiate(&mut self, sock: SocketId, timeout: Duration) -> ConnectId;

    /// Queue bytes for writing
    fn write(&mut self, sock: SocketId, data: &[u8]);

    /// Ask for a read callback once at least `min` bytes are available
    fn want_read(&mut self, sock: SocketId, min: usize);

    /// Shut the socket down; outstanding operations complete with errors
    fn shutdown(&mut self, sock: SocketId);

    /// Release the socket. No further events are reported for it.
    fn close(&mut self, sock: SocketId);

    /// Host the socket is connected to
    fn peer(&self, sock: SocketId) -> Option<HostPort>;

    /// Number of reads/writes still outstanding on the socket
    fn in_flight(&self, sock: SocketId) -> usize;
}
