//! Command-line argument parsing
//!
//! Every option overrides the corresponding field of the settings file (or
//! of the defaults when no file is given).

use clap::Parser;
use std::path::PathBuf;

use super::settings::UrlMode;

/// Stream cluster configuration over HTTP and log every generation
#[derive(Parser, Debug, Clone)]
#[command(name = "memd-config-watch")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
#[allow(clippy::manual_non_exhaustive)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    // ===== Connection Options =====
    /// Bootstrap host, `host[:port]` (can be specified multiple times)
    #[arg(short = 'h', long = "host", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Bucket whose configuration is streamed
    #[arg(short = 'b', long = "bucket")]
    pub bucket: Option<String>,

    /// User name for HTTP basic authentication
    #[arg(short = 'u', long = "user")]
    pub username: Option<String>,

    /// Password for HTTP basic authentication
    #[arg(short = 'p', long = "password")]
    pub password: Option<String>,

    /// Connect to the cluster management endpoint instead of a bucket
    #[arg(long = "cluster")]
    pub cluster: bool,

    /// Settings file (JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    // ===== Streaming Options =====
    /// Streaming URL formats to try
    #[arg(long = "url-mode", value_enum)]
    pub url_mode: Option<UrlMode>,

    /// Close the stream after this much idle time (ms)
    #[arg(long = "stream-idle-ms")]
    pub stream_idle_ms: Option<u32>,

    /// Keep the stream open forever and cycle hosts on failure
    #[arg(long = "legacy")]
    pub legacy: bool,

    /// Use bootstrap hosts in the order given
    #[arg(long = "no-randomize")]
    pub no_randomize: bool,

    /// Per-node connect and read timeout (ms)
    #[arg(long = "node-timeout-ms")]
    pub config_node_timeout_ms: Option<u64>,

    /// Exit after this many configuration generations
    #[arg(short = 'n', long = "count")]
    pub count: Option<u64>,

    // ===== Output =====
    /// Print the provider state summary after every new generation
    #[arg(long = "dump")]
    pub dump: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("--verbose and --quiet are mutually exclusive".to_string());
        }
        if self.username.is_some() && self.password.is_none() {
            return Err("--user requires --password to be set".to_string());
        }
        if self.legacy && self.stream_idle_ms.is_some() {
            return Err("--legacy and --stream-idle-ms are mutually exclusive".to_string());
        }
        if self.count == Some(0) {
            return Err("--count must be at least 1".to_string());
        }
        Ok(())
    }
}
