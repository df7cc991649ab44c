//! Remap & retry
//!
//! - Retry policy per reason (redirect, topology change, socket error)
//! - The coordinator deciding between requeue and surfacing an error
//! - The retry queue interface and an in-memory buffer

pub mod coordinator;
pub mod policy;
pub mod queue;

pub use coordinator::RetryCoordinator;
pub use policy::{RetryMode, RetryPolicy, RetryReason};
pub use queue::{QueuedRetry, RetryBuffer, RetryLane, RetryQueue};
