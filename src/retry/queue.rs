//! Retry queue interface and an in-memory implementation

use std::collections::HashMap;
use std::time::Duration;

use crate::cluster::RetrySpec;
use crate::server::Packet;
use crate::utils::ErrorCode;

/// Destination for requests that will be attempted again
pub trait RetryQueue {
    /// Queue a failed request. `spec` is the server's suggested schedule.
    fn add(&mut self, packet: Packet, err: ErrorCode, spec: Option<&RetrySpec>);

    /// Queue a request to be re-routed once the map changes
    fn add_remap(&mut self, packet: Packet);

    /// Remove and return the error recorded when the request was last
    /// queued. Only requeued packets (`retries > 0`) carry one.
    fn take_error(&mut self, packet: &Packet) -> Option<ErrorCode>;

    /// Drop the recorded error once a requeued request completes
    fn forget(&mut self, opaque: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLane {
    /// Retry after `delay`
    Failed { delay: Duration },
    /// Re-route immediately
    Remap,
}

#[derive(Debug)]
pub struct QueuedRetry {
    pub packet: Packet,
    pub lane: RetryLane,
}

/// Holds requeued packets until the owner reschedules them
#[derive(Debug, Default)]
pub struct RetryBuffer {
    queued: Vec<QueuedRetry>,
    errors: HashMap<u32, ErrorCode>,
}

impl RetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedRetry> {
        self.queued.iter()
    }

    /// Take everything queued so far. Recorded errors stay until the
    /// rescheduled requests complete.
    pub fn take(&mut self) -> Vec<QueuedRetry> {
        std::mem::take(&mut self.queued)
    }

    /// Number of recorded errors
    pub fn recorded(&self) -> usize {
        self.errors.len()
    }
}

impl RetryQueue for RetryBuffer {
    fn add(&mut self, packet: Packet, err: ErrorCode, spec: Option<&RetrySpec>) {
        let delay = spec
            .map(|s| s.delay_for(packet.retries.saturating_sub(1)))
            .unwrap_or_default();
        self.errors.insert(packet.opaque, err);
        self.queued.push(QueuedRetry {
            packet,
            lane: RetryLane::Failed { delay },
        });
    }

    fn add_remap(&mut self, packet: Packet) {
        self.errors.insert(packet.opaque, ErrorCode::MapChanged);
        self.queued.push(QueuedRetry {
            packet,
            lane: RetryLane::Remap,
        });
    }

    fn take_error(&mut self, packet: &Packet) -> Option<ErrorCode> {
        if packet.retries == 0 {
            return None;
        }
        self.errors.remove(&packet.opaque)
    }

    fn forget(&mut self, opaque: u32) {
        self.errors.remove(&opaque);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RetryStrategy;
    use crate::protocol::{Opcode, RequestHeader};
    use std::time::Instant;

    fn packet(opaque: u32) -> Packet {
        let mut hdr = RequestHeader::new(Opcode::GET);
        hdr.opaque = opaque;
        Packet::new(hdr, &[], b"k", &[], 0, Instant::now())
    }

    #[test]
    fn test_records_error_per_opaque() {
        let mut buf = RetryBuffer::new();
        buf.add(packet(1).renew(), ErrorCode::NetworkError, None);
        buf.add_remap(packet(2).renew());

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.take_error(&packet(1).renew()), Some(ErrorCode::NetworkError));
        assert_eq!(buf.take_error(&packet(1).renew()), None);
        assert_eq!(buf.take_error(&packet(3).renew()), None);

        buf.forget(2);
        assert_eq!(buf.take_error(&packet(2).renew()), None);
        assert_eq!(buf.recorded(), 0);
    }

    #[test]
    fn test_fresh_request_has_no_recorded_error() {
        let mut buf = RetryBuffer::new();
        buf.add(packet(1).renew(), ErrorCode::NetworkError, None);
        buf.take();

        assert_eq!(buf.take_error(&packet(1)), None);
        assert_eq!(buf.recorded(), 1);
    }

    #[test]
    fn test_spec_sets_delay() {
        let spec = RetrySpec {
            strategy: RetryStrategy::Constant,
            interval: Duration::from_millis(7),
            after: Duration::from_millis(3),
            ceil: Duration::ZERO,
            max_duration: Duration::ZERO,
        };
        let mut buf = RetryBuffer::new();
        buf.add(packet(1).renew(), ErrorCode::TemporaryFailure, Some(&spec));

        let queued = buf.take();
        assert_eq!(queued[0].lane, RetryLane::Failed { delay: Duration::from_millis(3) });
        assert!(buf.is_empty());
    }
}
