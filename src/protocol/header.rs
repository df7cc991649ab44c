//! Memcached binary protocol header layout
//!
//! Every packet starts with a fixed 24-byte header. Multi-byte fields are
//! big-endian on the wire:
//!
//! ```text
//! 0       magic
//! 1       opcode
//! 2..4    key length
//! 4       extras length
//! 5       datatype
//! 6..8    vbucket (request) / status (response)
//! 8..12   total body length (extras + key + value)
//! 12..16  opaque
//! 16..24  CAS
//! ```

use std::fmt;

use crate::utils::ProtocolError;

/// Size of every request and response header
pub const HEADER_SIZE: usize = 24;

/// Magic byte values
pub mod magic {
    pub const REQUEST: u8 = 0x80;
    pub const RESPONSE: u8 = 0x81;
}

/// Command opcode
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const GET: Opcode = Opcode(0x00);
    pub const SET: Opcode = Opcode(0x01);
    pub const ADD: Opcode = Opcode(0x02);
    pub const REPLACE: Opcode = Opcode(0x03);
    pub const DELETE: Opcode = Opcode(0x04);
    pub const INCREMENT: Opcode = Opcode(0x05);
    pub const DECREMENT: Opcode = Opcode(0x06);
    pub const GETQ: Opcode = Opcode(0x09);
    pub const NOOP: Opcode = Opcode(0x0a);
    pub const VERSION: Opcode = Opcode(0x0b);
    pub const GETK: Opcode = Opcode(0x0c);
    pub const GETKQ: Opcode = Opcode(0x0d);
    pub const APPEND: Opcode = Opcode(0x0e);
    pub const PREPEND: Opcode = Opcode(0x0f);
    pub const STAT: Opcode = Opcode(0x10);
    pub const TOUCH: Opcode = Opcode(0x1c);
    pub const GAT: Opcode = Opcode(0x1d);
    pub const HELLO: Opcode = Opcode(0x1f);
    pub const SASL_LIST_MECHS: Opcode = Opcode(0x20);
    pub const SASL_AUTH: Opcode = Opcode(0x21);
    pub const SASL_STEP: Opcode = Opcode(0x22);
    pub const GET_REPLICA: Opcode = Opcode(0x83);
    pub const SELECT_BUCKET: Opcode = Opcode(0x89);
    pub const OBSERVE_SEQNO: Opcode = Opcode(0x91);
    pub const OBSERVE: Opcode = Opcode(0x92);
    pub const GET_LOCKED: Opcode = Opcode(0x94);
    pub const UNLOCK_KEY: Opcode = Opcode(0x95);
    pub const GET_CLUSTER_CONFIG: Opcode = Opcode(0xb5);
    pub const SUBDOC_GET: Opcode = Opcode(0xc5);
    pub const SUBDOC_EXISTS: Opcode = Opcode(0xc6);
    pub const SUBDOC_MULTI_LOOKUP: Opcode = Opcode(0xd0);
    pub const GET_ERROR_MAP: Opcode = Opcode(0xfe);

    /// Commands that never modify the item they address
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Opcode::GET
                | Opcode::GETQ
                | Opcode::GETK
                | Opcode::GETKQ
                | Opcode::GET_REPLICA
                | Opcode::GET_LOCKED
                | Opcode::OBSERVE
                | Opcode::OBSERVE_SEQNO
                | Opcode::STAT
                | Opcode::NOOP
                | Opcode::VERSION
                | Opcode::SUBDOC_GET
                | Opcode::SUBDOC_EXISTS
                | Opcode::SUBDOC_MULTI_LOOKUP
                | Opcode::GET_CLUSTER_CONFIG
                | Opcode::GET_ERROR_MAP
        )
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opcode(0x{:02x})", self.0)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Response status code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const KEY_ENOENT: Status = Status(0x01);
    pub const KEY_EEXISTS: Status = Status(0x02);
    pub const E2BIG: Status = Status(0x03);
    pub const EINVAL: Status = Status(0x04);
    pub const NOT_STORED: Status = Status(0x05);
    pub const DELTA_BADVAL: Status = Status(0x06);
    pub const NOT_MY_VBUCKET: Status = Status(0x07);
    pub const NO_BUCKET: Status = Status(0x08);
    pub const LOCKED: Status = Status(0x09);
    pub const AUTH_STALE: Status = Status(0x1f);
    pub const AUTH_ERROR: Status = Status(0x20);
    pub const AUTH_CONTINUE: Status = Status(0x21);
    pub const ERANGE: Status = Status(0x22);
    pub const ROLLBACK: Status = Status(0x23);
    pub const EACCESS: Status = Status(0x24);
    pub const NOT_INITIALIZED: Status = Status(0x25);
    pub const UNKNOWN_COMMAND: Status = Status(0x81);
    pub const ENOMEM: Status = Status(0x82);
    pub const NOT_SUPPORTED: Status = Status(0x83);
    pub const EINTERNAL: Status = Status(0x84);
    pub const EBUSY: Status = Status(0x85);
    pub const ETMPFAIL: Status = Status(0x86);
    pub const SUBDOC_PATH_ENOENT: Status = Status(0xc0);
    pub const SUBDOC_PATH_MISMATCH: Status = Status(0xc1);
    pub const SUBDOC_PATH_EINVAL: Status = Status(0xc2);
    pub const SUBDOC_PATH_E2BIG: Status = Status(0xc3);
    pub const SUBDOC_DOC_E2DEEP: Status = Status(0xc4);
    pub const SUBDOC_VALUE_CANTINSERT: Status = Status(0xc5);
    pub const SUBDOC_DOC_NOTJSON: Status = Status(0xc6);
    pub const SUBDOC_NUM_ERANGE: Status = Status(0xc7);
    pub const SUBDOC_DELTA_ERANGE: Status = Status(0xc8);
    pub const SUBDOC_PATH_EEXISTS: Status = Status(0xc9);
    pub const SUBDOC_VALUE_ETOODEEP: Status = Status(0xca);
    pub const SUBDOC_INVALID_COMBO: Status = Status(0xcb);
    pub const SUBDOC_MULTI_PATH_FAILURE: Status = Status(0xcc);

    /// Statuses delivered to the caller verbatim, without consulting the
    /// error map.
    pub fn is_fastpath(self) -> bool {
        match self {
            Status::SUCCESS
            | Status::KEY_ENOENT
            | Status::KEY_EEXISTS
            | Status::E2BIG
            | Status::NOT_STORED
            | Status::DELTA_BADVAL
            | Status::ERANGE
            | Status::NOT_SUPPORTED
            | Status::UNKNOWN_COMMAND
            | Status::ETMPFAIL
            | Status::ENOMEM
            | Status::EACCESS => true,
            // Every sub-document status, including ones added after this list
            Status(code) => (0xc0..=0xcc).contains(&code),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status(0x{:02x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Decoded request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Header for an opcode with every other field zeroed
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            keylen: 0,
            extlen: 0,
            datatype: 0,
            vbucket: 0,
            bodylen: 0,
            opaque: 0,
            cas: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = magic::REQUEST;
        buf[1] = self.opcode.0;
        buf[2..4].copy_from_slice(&self.keylen.to_be_bytes());
        buf[4] = self.extlen;
        buf[5] = self.datatype;
        buf[6..8].copy_from_slice(&self.vbucket.to_be_bytes());
        buf[8..12].copy_from_slice(&self.bodylen.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let raw = RawHeader::read(buf, magic::REQUEST)?;
        Ok(Self {
            opcode: Opcode(raw.opcode),
            keylen: raw.keylen,
            extlen: raw.extlen,
            datatype: raw.datatype,
            vbucket: raw.vbucket_or_status,
            bodylen: raw.bodylen,
            opaque: raw.opaque,
            cas: raw.cas,
        })
    }
}

/// Decoded response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: Opcode,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub status: Status,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let raw = RawHeader::read(buf, magic::RESPONSE)?;
        Ok(Self {
            opcode: Opcode(raw.opcode),
            keylen: raw.keylen,
            extlen: raw.extlen,
            datatype: raw.datatype,
            status: Status(raw.vbucket_or_status),
            bodylen: raw.bodylen,
            opaque: raw.opaque,
            cas: raw.cas,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = magic::RESPONSE;
        buf[1] = self.opcode.0;
        buf[2..4].copy_from_slice(&self.keylen.to_be_bytes());
        buf[4] = self.extlen;
        buf[5] = self.datatype;
        buf[6..8].copy_from_slice(&self.status.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.bodylen.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    /// Total frame size: header plus body
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.bodylen as usize
    }
}

/// Fields shared by both header kinds, before interpretation
struct RawHeader {
    opcode: u8,
    keylen: u16,
    extlen: u8,
    datatype: u8,
    vbucket_or_status: u16,
    bodylen: u32,
    opaque: u32,
    cas: u64,
}

impl RawHeader {
    fn read(buf: &[u8], expected_magic: u8) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }
        if buf[0] != expected_magic {
            return Err(ProtocolError::InvalidMagic(buf[0]));
        }

        let raw = Self {
            opcode: buf[1],
            keylen: u16::from_be_bytes([buf[2], buf[3]]),
            extlen: buf[4],
            datatype: buf[5],
            vbucket_or_status: u16::from_be_bytes([buf[6], buf[7]]),
            bodylen: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        };

        let prefix = raw.keylen as usize + raw.extlen as usize;
        if prefix > raw.bodylen as usize {
            return Err(ProtocolError::BodyOverflow(prefix, raw.bodylen));
        }
        Ok(raw)
    }
}
