//! Engine settings
//!
//! Settings are plain data shared (behind an `Arc`) by every channel and
//! provider of an instance. They can be loaded from a JSON file, where every
//! field is optional, or built from command-line arguments.

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::cli::CliArgs;
use crate::cluster::{HostPort, Hostlist};
use crate::retry::RetryPolicy;
use crate::utils::{EngineError, Result};

/// Default management (HTTP) port
pub const DEFAULT_HTTP_PORT: u16 = 8091;
/// Default management port with SSL
pub const DEFAULT_HTTPS_PORT: u16 = 18091;
/// Default data (memcached) port
pub const DEFAULT_MEMD_PORT: u16 = 11210;

/// Stream idle value meaning "never disconnect; legacy streaming"
pub const STREAM_IDLE_LEGACY: u32 = u32::MAX;

/// What the HTTP stream connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    /// A bucket's configuration stream
    Bucket,
    /// Cluster-level management; no configuration is parsed
    Cluster,
}

/// Which streaming URL formats may be tried
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMode {
    /// `/pools/default/bs/<bucket>` only
    Terse,
    /// `/pools/default/bucketsStreaming/<bucket>` only
    Compat,
    /// Terse first, compat on 404
    Both,
}

impl UrlMode {
    pub fn terse(self) -> bool {
        matches!(self, UrlMode::Terse | UrlMode::Both)
    }

    pub fn compat(self) -> bool {
        matches!(self, UrlMode::Compat | UrlMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Connection
    pub hosts: Vec<String>,
    pub bucket: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub conn_type: ConnType,
    pub use_ssl: bool,

    // Timeouts
    pub operation_timeout_ms: u64,
    pub config_node_timeout_ms: u64,
    /// Idle time before the configuration stream is closed;
    /// [`STREAM_IDLE_LEGACY`] keeps it open forever
    pub http_stream_idle_ms: u32,
    /// Delay before cycling the host list again in legacy mode
    pub grace_next_cycle_ms: u64,

    // Bootstrap
    pub url_mode: UrlMode,
    pub randomize_bootstrap_nodes: bool,
    pub refresh_throttle_ms: u64,
    pub refresh_error_threshold: u32,

    // Data path
    pub use_errmap: bool,
    pub config_hints: bool,
    pub vbucket_guess: bool,
    /// Treat connect timeouts with plenty of operation time left as a
    /// stalled event loop and reconnect once
    pub detect_stalled_loop: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hosts: vec![format!("127.0.0.1:{}", DEFAULT_HTTP_PORT)],
            bucket: "default".to_string(),
            username: None,
            password: None,
            conn_type: ConnType::Bucket,
            use_ssl: false,

            operation_timeout_ms: 2500,
            config_node_timeout_ms: 2000,
            http_stream_idle_ms: 10_000,
            grace_next_cycle_ms: 10,

            url_mode: UrlMode::Both,
            randomize_bootstrap_nodes: true,
            refresh_throttle_ms: 10,
            refresh_error_threshold: 100,

            use_errmap: true,
            config_hints: true,
            vbucket_guess: true,
            detect_stalled_loop: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)
            .map_err(|e| EngineError::Config(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Create settings from CLI arguments, starting from a settings file if
    /// one was given
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if !args.hosts.is_empty() {
            settings.hosts = args.hosts.clone();
        }
        if let Some(bucket) = &args.bucket {
            settings.bucket = bucket.clone();
        }
        if args.username.is_some() {
            settings.username = args.username.clone();
        }
        if args.password.is_some() {
            settings.password = args.password.clone();
        }
        if args.cluster {
            settings.conn_type = ConnType::Cluster;
        }
        if let Some(mode) = args.url_mode {
            settings.url_mode = mode;
        }
        if let Some(ms) = args.stream_idle_ms {
            settings.http_stream_idle_ms = ms;
        }
        if args.legacy {
            settings.http_stream_idle_ms = STREAM_IDLE_LEGACY;
        }
        if args.no_randomize {
            settings.randomize_bootstrap_nodes = false;
        }
        if let Some(ms) = args.config_node_timeout_ms {
            settings.config_node_timeout_ms = ms;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate setting combinations
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            return Err(EngineError::Config(
                "operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.config_node_timeout_ms == 0 {
            return Err(EngineError::Config(
                "config_node_timeout_ms must be positive".to_string(),
            ));
        }
        if self.http_stream_idle_ms == 0 {
            return Err(EngineError::Config(
                "http_stream_idle_ms must be positive".to_string(),
            ));
        }
        if self.conn_type == ConnType::Bucket && self.bucket.is_empty() {
            return Err(EngineError::Config(
                "bucket connections need a bucket name".to_string(),
            ));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(EngineError::Config("username requires a password".to_string()));
        }
        self.bootstrap_hosts()?;
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn config_node_timeout(&self) -> Duration {
        Duration::from_millis(self.config_node_timeout_ms)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_millis(u64::from(self.http_stream_idle_ms))
    }

    pub fn grace_next_cycle(&self) -> Duration {
        Duration::from_millis(self.grace_next_cycle_ms)
    }

    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    /// The stream never idles out and the host list is cycled forever
    pub fn is_legacy_streaming(&self) -> bool {
        self.http_stream_idle_ms == STREAM_IDLE_LEGACY
    }

    pub fn default_http_port(&self) -> u16 {
        if self.use_ssl {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// Parsed bootstrap host list
    pub fn bootstrap_hosts(&self) -> Result<Hostlist> {
        let port = self.default_http_port();
        let hosts = self
            .hosts
            .iter()
            .map(|h| HostPort::parse(h, port))
            .collect::<Result<Hostlist>>()?;
        if hosts.is_empty() {
            return Err(EngineError::Config("no bootstrap hosts".to_string()));
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryMode;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.operation_timeout(), Duration::from_millis(2500));
        assert_eq!(settings.config_node_timeout(), Duration::from_millis(2000));
        assert_eq!(settings.stream_idle(), Duration::from_secs(10));
        assert_eq!(settings.url_mode, UrlMode::Both);
        assert!(!settings.is_legacy_streaming());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = EngineSettings::from_json_str(
            r#"{"bucket": "travel", "http_stream_idle_ms": 4294967295, "retry": {"redirect": "none"}}"#,
        )
        .unwrap();
        assert_eq!(settings.bucket, "travel");
        assert!(settings.is_legacy_streaming());
        assert_eq!(settings.retry.redirect, RetryMode::None);
        assert_eq!(settings.operation_timeout_ms, 2500);
    }

    #[test]
    fn test_validation_errors() {
        let zero = EngineSettings {
            operation_timeout_ms: 0,
            ..EngineSettings::default()
        };
        assert!(zero.validate().is_err());

        let no_bucket = EngineSettings {
            bucket: String::new(),
            ..EngineSettings::default()
        };
        assert!(no_bucket.validate().is_err());

        let cluster = EngineSettings {
            bucket: String::new(),
            conn_type: ConnType::Cluster,
            ..EngineSettings::default()
        };
        assert!(cluster.validate().is_ok());

        let no_hosts = EngineSettings {
            hosts: Vec::new(),
            ..EngineSettings::default()
        };
        assert!(no_hosts.validate().is_err());
    }

    #[test]
    fn test_bootstrap_hosts_default_port() {
        let settings = EngineSettings {
            hosts: vec!["a".to_string(), "b:9000".to_string()],
            use_ssl: true,
            ..EngineSettings::default()
        };
        let hosts: Vec<HostPort> = settings.bootstrap_hosts().unwrap().iter().cloned().collect();
        assert_eq!(hosts, vec![HostPort::new("a", 18091), HostPort::new("b", 9000)]);
    }

    #[test]
    fn test_from_cli_overrides() {
        let args = CliArgs::parse_from([
            "memd-config-watch",
            "--host",
            "10.0.0.1",
            "--host",
            "10.0.0.2:8095",
            "--bucket",
            "beer",
            "--url-mode",
            "compat",
            "--legacy",
        ]);
        let settings = EngineSettings::from_cli(&args).unwrap();
        assert_eq!(settings.hosts, vec!["10.0.0.1", "10.0.0.2:8095"]);
        assert_eq!(settings.bucket, "beer");
        assert_eq!(settings.url_mode, UrlMode::Compat);
        assert!(settings.is_legacy_streaming());
    }
}
