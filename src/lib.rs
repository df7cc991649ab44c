//! memd-engine library
//!
//! Client-side data path for memcached-binary key-value clusters: node
//! channels with pipelined requests, HTTP streaming topology bootstrap,
//! redirect/retry handling and the binary frame codec.

pub mod cluster;
pub mod config;
pub mod io;
pub mod protocol;
pub mod provider;
pub mod retry;
pub mod server;
pub mod utils;

#[cfg(test)]
mod testutil;
