//! Configuration module

pub mod cli;
pub mod settings;

pub use cli::CliArgs;
pub use settings::{
    ConnType, EngineSettings, UrlMode, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, DEFAULT_MEMD_PORT,
    STREAM_IDLE_LEGACY,
};
