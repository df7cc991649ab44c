//! Frame-level encode/decode
//!
//! Responses are decoded as views over the receive buffer. A
//! [`ResponseFrame`] borrows its body, so anything needed after dispatch has
//! to be copied out before the buffer is consumed.

use super::header::{Opcode, RequestHeader, ResponseHeader, Status, HEADER_SIZE};
use crate::utils::ProtocolError;

/// A complete response: header plus borrowed body
#[derive(Debug, Clone, Copy)]
pub struct ResponseFrame<'a> {
    pub header: ResponseHeader,
    raw: &'a [u8],
}

impl<'a> ResponseFrame<'a> {
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    /// Number of bytes this frame occupies on the wire
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Header and body, contiguous
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    /// Everything after the header
    pub fn body(&self) -> &'a [u8] {
        &self.raw[HEADER_SIZE..]
    }

    pub fn extras(&self) -> &'a [u8] {
        let start = HEADER_SIZE;
        &self.raw[start..start + self.header.extlen as usize]
    }

    pub fn key(&self) -> &'a [u8] {
        let start = HEADER_SIZE + self.header.extlen as usize;
        &self.raw[start..start + self.header.keylen as usize]
    }

    pub fn value(&self) -> &'a [u8] {
        let start = HEADER_SIZE + self.header.extlen as usize + self.header.keylen as usize;
        &self.raw[start..]
    }
}

/// Outcome of attempting to decode one frame
#[derive(Debug)]
pub enum Decoded<'a> {
    /// Not enough bytes yet; the total number of bytes needed is given
    NeedMore(usize),
    Frame(ResponseFrame<'a>),
}

/// Try to decode one response frame from the front of `buf`
///
/// Never dispatches a frame before all `24 + bodylen` bytes are present.
pub fn decode_response(buf: &[u8]) -> Result<Decoded<'_>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::NeedMore(HEADER_SIZE));
    }

    let header = ResponseHeader::parse(&buf[..HEADER_SIZE])?;
    let size = header.frame_size();
    if buf.len() < size {
        return Ok(Decoded::NeedMore(size));
    }

    Ok(Decoded::Frame(ResponseFrame {
        header,
        raw: &buf[..size],
    }))
}

/// Encode a request packet
///
/// Key, extras and body lengths in `header` are overwritten from the slices.
pub fn encode_request(mut header: RequestHeader, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    header.extlen = extras.len() as u8;
    header.keylen = key.len() as u16;
    header.bodylen = (extras.len() + key.len() + value.len()) as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + header.bodylen as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Encode a response packet (used by mock servers and tests)
pub fn encode_response(mut header: ResponseHeader, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    header.extlen = extras.len() as u8;
    header.keylen = key.len() as u16;
    header.bodylen = (extras.len() + key.len() + value.len()) as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + header.bodylen as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}
