//! Remap & retry decisions
//!
//! The coordinator decides whether a failed or redirected request is renewed
//! and handed to the retry queue, or surfaced to its caller. Renewal clears
//! the packet's transient flags and bumps its retry count.

use tracing::debug;

use super::policy::{RetryPolicy, RetryReason};
use super::queue::RetryQueue;
use crate::cluster::{DistMode, RetrySpec};
use crate::server::Packet;
use crate::utils::ErrorCode;

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Error a request failed with on an established socket, as the retry
    /// decision and the caller should see it
    ///
    /// Authentication failures on a socket that was already authenticated
    /// mean the node went away, not that the credentials are wrong.
    pub fn reclassify(err: ErrorCode) -> ErrorCode {
        match err {
            ErrorCode::AuthError => ErrorCode::MapChanged,
            other => other,
        }
    }

    pub fn should_retry(&self, packet: &Packet, reason: RetryReason, dist: DistMode) -> bool {
        if dist != DistMode::Vbucket {
            return false;
        }
        let policy = packet.policy.as_ref().unwrap_or(&self.policy);
        policy.allows(reason, packet.opcode, packet.retries)
    }

    /// Consider a request failed with `err`
    ///
    /// Returns `Ok(())` if a renewed copy was queued, or hands the packet
    /// back for the caller to fail.
    pub fn retry_failed(
        &self,
        packet: Packet,
        err: ErrorCode,
        dist: DistMode,
        queue: &mut dyn RetryQueue,
    ) -> Result<(), Packet> {
        let Some(reason) = RetryReason::for_error(err) else {
            return Err(packet);
        };
        if !self.should_retry(&packet, reason, dist) {
            return Err(packet);
        }
        debug!(
            "Requeueing opaque={} opcode={} after {} (retry {})",
            packet.opaque,
            packet.opcode,
            err,
            packet.retries + 1
        );
        queue.add(packet.renew(), err, None);
        Ok(())
    }

    /// Consider a request the server redirected. The original stays with the
    /// caller; returns true if a renewed copy went to the remap lane.
    pub fn retry_redirect(&self, packet: &Packet, dist: DistMode, queue: &mut dyn RetryQueue) -> bool {
        if !self.should_retry(packet, RetryReason::Redirect, dist) {
            return false;
        }
        queue.add_remap(packet.renew());
        true
    }

    /// Relocate a request whose node left the map
    pub fn retry_relocated(
        &self,
        packet: Packet,
        dist: DistMode,
        queue: &mut dyn RetryQueue,
    ) -> Result<(), Packet> {
        if !self.should_retry(&packet, RetryReason::TopologyChange, dist) {
            return Err(packet);
        }
        queue.add_remap(packet.renew());
        Ok(())
    }

    /// Queue a renewed copy on the server's instruction, regardless of policy
    pub fn retry_with_spec(
        &self,
        packet: &Packet,
        err: ErrorCode,
        spec: Option<&RetrySpec>,
        queue: &mut dyn RetryQueue,
    ) {
        queue.add(packet.renew(), err, spec);
    }
}
