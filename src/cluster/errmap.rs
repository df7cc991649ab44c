//! Server-provided error map
//!
//! Servers describe their status codes in a JSON document: each status (a hex
//! string key) carries a name, a description, a set of attributes telling the
//! client how to react, and optionally a retry schedule.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::Status;
use crate::utils::TopologyError;

/// Highest map format this client understands
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// How the client should treat a status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorAttribute {
    Success,
    ItemOnly,
    InvalidInput,
    FetchConfig,
    ConnStateInvalidated,
    Auth,
    SpecialHandling,
    Support,
    Temp,
    Internal,
    RetryNow,
    RetryLater,
    Subdoc,
    Dcp,
    AutoRetry,
    ItemLocked,
    ItemDeleted,
    ConstraintFailure,
}

impl ErrorAttribute {
    pub fn from_name(name: &str) -> Option<Self> {
        let attr = match name {
            "success" => ErrorAttribute::Success,
            "item-only" => ErrorAttribute::ItemOnly,
            "invalid-input" => ErrorAttribute::InvalidInput,
            "fetch-config" => ErrorAttribute::FetchConfig,
            "conn-state-invalidated" => ErrorAttribute::ConnStateInvalidated,
            "auth" => ErrorAttribute::Auth,
            "special-handling" => ErrorAttribute::SpecialHandling,
            "support" => ErrorAttribute::Support,
            "temp" => ErrorAttribute::Temp,
            "internal" => ErrorAttribute::Internal,
            "retry-now" => ErrorAttribute::RetryNow,
            "retry-later" => ErrorAttribute::RetryLater,
            "subdoc" => ErrorAttribute::Subdoc,
            "dcp" => ErrorAttribute::Dcp,
            "auto-retry" => ErrorAttribute::AutoRetry,
            "item-locked" => ErrorAttribute::ItemLocked,
            "item-deleted" => ErrorAttribute::ItemDeleted,
            "constraint-failure" => ErrorAttribute::ConstraintFailure,
            _ => return None,
        };
        Some(attr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Constant,
    Linear,
    Exponential,
}

/// Server-suggested retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySpec {
    pub strategy: RetryStrategy,
    /// Base interval
    pub interval: Duration,
    /// Delay before the first retry
    pub after: Duration,
    /// Upper bound on any single delay (zero: unbounded)
    pub ceil: Duration,
    /// Give up once this much time has passed (zero: unbounded)
    pub max_duration: Duration,
}

impl RetrySpec {
    /// Delay before retry number `attempt` (0 is the first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.after;
        }
        let delay = match self.strategy {
            RetryStrategy::Constant => self.interval,
            RetryStrategy::Linear => self.interval.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt.min(31) - 1).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor)
            }
        };
        if self.ceil.is_zero() {
            delay
        } else {
            delay.min(self.ceil)
        }
    }
}

/// Everything the map says about one status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u16,
    pub name: String,
    pub description: String,
    pub attributes: HashSet<ErrorAttribute>,
    pub retry: Option<RetrySpec>,
}

impl ErrorInfo {
    pub fn has(&self, attr: ErrorAttribute) -> bool {
        self.attributes.contains(&attr)
    }
}

/// Parsed error map; the default value is "not loaded"
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    version: u32,
    revision: u32,
    errors: HashMap<u16, ErrorInfo>,
}

impl ErrorMap {
    pub fn parse(text: &str) -> Result<Self, TopologyError> {
        let raw: RawErrorMap = serde_json::from_str(text)?;
        if raw.version > MAX_SUPPORTED_VERSION {
            return Err(TopologyError::UnsupportedVersion(raw.version));
        }

        let mut errors = HashMap::with_capacity(raw.errors.len());
        for (key, entry) in raw.errors {
            let code = u16::from_str_radix(&key, 16)
                .map_err(|_| TopologyError::BadStatusKey(key.clone()))?;
            let attributes = entry
                .attrs
                .iter()
                .filter_map(|name| ErrorAttribute::from_name(name))
                .collect();
            errors.insert(
                code,
                ErrorInfo {
                    code,
                    name: entry.name,
                    description: entry.desc,
                    attributes,
                    retry: entry.retry.map(RawRetry::into_spec),
                },
            );
        }

        Ok(Self {
            version: raw.version,
            revision: raw.revision,
            errors,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.version > 0 || !self.errors.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn lookup(&self, status: Status) -> Option<&ErrorInfo> {
        self.errors.get(&status.0)
    }

    /// Install `other` if this map is not loaded or `other` has a higher
    /// revision. Returns whether it was installed.
    pub fn replace_if_newer(&mut self, other: ErrorMap) -> bool {
        if self.is_loaded() && other.revision <= self.revision {
            return false;
        }
        *self = other;
        true
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorMap {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    revision: u32,
    #[serde(default)]
    errors: HashMap<String, RawErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct RawErrorInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    attrs: Vec<String>,
    #[serde(default)]
    retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    after: u64,
    #[serde(default)]
    ceil: u64,
    #[serde(rename = "max-duration", default)]
    max_duration: u64,
}

impl RawRetry {
    fn into_spec(self) -> RetrySpec {
        let strategy = match self.strategy.as_str() {
            "linear" => RetryStrategy::Linear,
            "exponential" => RetryStrategy::Exponential,
            _ => RetryStrategy::Constant,
        };
        RetrySpec {
            strategy,
            interval: Duration::from_millis(self.interval),
            after: Duration::from_millis(self.after),
            ceil: Duration::from_millis(self.ceil),
            max_duration: Duration::from_millis(self.max_duration),
        }
    }
}
