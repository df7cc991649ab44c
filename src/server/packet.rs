//! Pending request packets

use std::time::Instant;

use crate::protocol::{encode_request, Opcode, RequestHeader, HEADER_SIZE};
use crate::retry::RetryPolicy;

/// Packet flags
///
/// `forward` is set by the caller and survives renewal. `flushed` and
/// `invoked` describe the packet's progress on one channel and are cleared
/// whenever the packet is renewed for another attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Deliver raw response bytes to the forwarding callback
    pub forward: bool,
    /// Bytes were handed to the transport
    pub flushed: bool,
    /// At least one (non-terminal) response was delivered
    pub invoked: bool,
}

impl PacketFlags {
    pub fn clear_state(&mut self) {
        self.flushed = false;
        self.invoked = false;
    }
}

/// One request awaiting its response
#[derive(Debug, Clone)]
pub struct Packet {
    pub opaque: u32,
    pub vbucket: u16,
    pub opcode: Opcode,
    pub flags: PacketFlags,
    /// Number of times this request was requeued
    pub retries: u32,
    /// When the request was first scheduled; kept across retries
    pub start: Instant,
    /// Encoded request (header + body)
    pub data: Vec<u8>,
    /// Opaque caller value passed back on delivery
    pub cookie: u64,
    /// Overrides the instance retry policy for this request
    pub policy: Option<RetryPolicy>,
}

impl Packet {
    /// Build a packet from request parts; the header's opaque and vbucket
    /// are taken as given
    pub fn new(
        header: RequestHeader,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        cookie: u64,
        now: Instant,
    ) -> Self {
        Self {
            opaque: header.opaque,
            vbucket: header.vbucket,
            opcode: header.opcode,
            flags: PacketFlags::default(),
            retries: 0,
            start: now,
            data: encode_request(header, extras, key, value),
            cookie,
            policy: None,
        }
    }

    /// Key bytes, as encoded
    pub fn key(&self) -> &[u8] {
        if self.data.len() < HEADER_SIZE {
            return &[];
        }
        let keylen = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
        let start = HEADER_SIZE + self.data[4] as usize;
        self.data.get(start..start + keylen).unwrap_or(&[])
    }

    /// Point the packet at another vbucket, patching the encoded header
    pub fn set_vbucket(&mut self, vbucket: u16) {
        self.vbucket = vbucket;
        if self.data.len() >= HEADER_SIZE {
            self.data[6..8].copy_from_slice(&vbucket.to_be_bytes());
        }
    }

    /// Copy for another attempt: same request and start time, state flags
    /// cleared, retry count incremented
    pub fn renew(&self) -> Packet {
        let mut copy = self.clone();
        copy.flags.clear_state();
        copy.retries += 1;
        copy
    }
}
