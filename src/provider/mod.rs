//! Configuration providers
//!
//! - Incremental HTTP/1.1 response parsing
//! - The HTTP streaming provider feeding the configuration monitor

pub mod http;
pub mod http_parser;

pub use http::{HttpProvider, ProviderEnv, SessionState, Stream, UriType, CONFIG_DELIMITER};
pub use http_parser::{HttpParser, HttpResponse, ParseProgress};
