//! Utility modules

pub mod error;

pub use error::{EngineError, ErrorCode, ProtocolError, Result, TopologyError};
