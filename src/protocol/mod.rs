//! Memcached binary protocol framing

pub mod frame;
pub mod header;

pub use frame::{decode_response, encode_request, encode_response, Decoded, ResponseFrame};
pub use header::{magic, Opcode, RequestHeader, ResponseHeader, Status, HEADER_SIZE};
