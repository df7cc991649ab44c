//! Which requests may be retried, and for which reasons

use serde::{Deserialize, Serialize};

use crate::protocol::Opcode;
use crate::utils::ErrorCode;

/// Which commands a retry reason applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Never retry
    None,
    /// Only plain GET
    Get,
    /// Commands that do not modify data
    Safe,
    /// Everything
    All,
}

impl RetryMode {
    pub fn allows(self, opcode: Opcode) -> bool {
        match self {
            RetryMode::None => false,
            RetryMode::Get => opcode == Opcode::GET,
            RetryMode::Safe => opcode.is_read_only(),
            RetryMode::All => true,
        }
    }
}

/// Why a request is being considered for retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The server answered NOT_MY_VBUCKET
    Redirect,
    /// The node holding the request left the cluster map
    TopologyChange,
    /// The connection failed with the request outstanding
    SocketError,
}

impl RetryReason {
    /// Reason implied by a failure code, if it is retriable at all
    ///
    /// Timeouts are never retried. `MapChanged` is what a request already
    /// coordinated once fails with, so it is not retried either.
    pub fn for_error(err: ErrorCode) -> Option<Self> {
        match err {
            ErrorCode::NetworkError
            | ErrorCode::ConnectError
            | ErrorCode::Shutdown
            | ErrorCode::ProtocolError => Some(RetryReason::SocketError),
            _ => None,
        }
    }
}

/// Retry policy: mode per reason plus a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub redirect: RetryMode,
    pub topology_change: RetryMode,
    pub socket_error: RetryMode,
    /// Maximum requeues per request; 0 means unlimited
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            redirect: RetryMode::All,
            topology_change: RetryMode::All,
            socket_error: RetryMode::Safe,
            max_retries: 0,
        }
    }
}

impl RetryPolicy {
    pub fn mode_for(&self, reason: RetryReason) -> RetryMode {
        match reason {
            RetryReason::Redirect => self.redirect,
            RetryReason::TopologyChange => self.topology_change,
            RetryReason::SocketError => self.socket_error,
        }
    }

    /// Whether a request with `opcode`, requeued `retries` times so far, may
    /// be retried for `reason`
    pub fn allows(&self, reason: RetryReason, opcode: Opcode, retries: u32) -> bool {
        if self.max_retries > 0 && retries >= self.max_retries {
            return false;
        }
        self.mode_for(reason).allows(opcode)
    }
}
