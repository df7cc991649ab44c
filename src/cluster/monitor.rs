//! Configuration monitor
//!
//! Providers push documents and failures into a [`ConfigMonitor`]. The
//! bundled [`Confmon`] keeps the newest document by revision, tracks whether
//! a refresh is in progress and throttles refresh requests coming from the
//! data path. What changed is recorded as [`MonitorEvent`]s for the owner to
//! act on (reconfigure the node set, fail pending bootstrap, ...).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::topology::{ConfigOrigin, TopologyDocument};
use crate::utils::ErrorCode;

/// Monitor interface seen by configuration providers
pub trait ConfigMonitor {
    /// A provider parsed a new document
    fn provider_got_config(&mut self, provider: ConfigOrigin, doc: Arc<TopologyDocument>);

    /// A provider ran out of candidates
    fn provider_failed(&mut self, provider: ConfigOrigin, err: ErrorCode);

    fn is_refreshing(&self) -> bool;

    /// Provider currently responsible for fetching configuration
    fn current_provider(&self) -> Option<ConfigOrigin>;

    fn current_config(&self) -> Option<Arc<TopologyDocument>>;
}

/// How a refresh request from the data path is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Always start a refresh
    Always,
    /// Skip if a refresh started recently, unless enough errors piled up.
    /// `count_error` adds this request to the error count.
    Throttle { count_error: bool },
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A newer document was installed
    NewConfig(Arc<TopologyDocument>),
    /// A provider gave up
    ProviderFailed(ConfigOrigin, ErrorCode),
}

pub struct Confmon {
    config: Option<Arc<TopologyDocument>>,
    current: Option<ConfigOrigin>,
    refreshing: bool,
    last_refresh: Option<Instant>,
    errors: u32,
    throttle: Duration,
    error_threshold: u32,
    events: VecDeque<MonitorEvent>,
}

impl Confmon {
    pub fn new(throttle: Duration, error_threshold: u32) -> Self {
        Self {
            config: None,
            current: None,
            refreshing: false,
            last_refresh: None,
            errors: 0,
            throttle,
            error_threshold,
            events: VecDeque::new(),
        }
    }

    pub fn set_current_provider(&mut self, provider: ConfigOrigin) {
        self.current = Some(provider);
    }

    /// Decide whether a refresh should start now
    ///
    /// Returns true when the caller should kick the current provider.
    pub fn request_refresh(&mut self, now: Instant, policy: RefreshPolicy) -> bool {
        if let RefreshPolicy::Throttle { count_error } = policy {
            if count_error {
                self.errors += 1;
            }
            if let Some(last) = self.last_refresh {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.throttle && self.errors < self.error_threshold {
                    trace!(
                        "Refresh throttled: {:?} since last, {} errors",
                        elapsed,
                        self.errors
                    );
                    return false;
                }
            }
        }

        self.last_refresh = Some(now);
        self.errors = 0;
        if !self.refreshing {
            debug!("Starting configuration refresh");
        }
        self.refreshing = true;
        true
    }

    /// Stop treating the current cycle as an active refresh
    pub fn stop(&mut self) {
        self.refreshing = false;
    }

    pub fn take_events(&mut self) -> Vec<MonitorEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }
}

impl ConfigMonitor for Confmon {
    fn provider_got_config(&mut self, provider: ConfigOrigin, doc: Arc<TopologyDocument>) {
        if let Some(current) = &self.config {
            if !doc.is_newer_than(current) {
                debug!(
                    "Not applying configuration from {} (rev {} <= {})",
                    provider,
                    doc.rev(),
                    current.rev()
                );
                return;
            }
        }

        info!(
            "Applying configuration rev {} from {} (generation {})",
            doc.rev(),
            provider,
            doc.generation
        );
        self.config = Some(Arc::clone(&doc));
        self.refreshing = false;
        self.events.push_back(MonitorEvent::NewConfig(doc));
    }

    fn provider_failed(&mut self, provider: ConfigOrigin, err: ErrorCode) {
        info!("Provider {} failed: {}", provider, err);
        if self.current == Some(provider) {
            self.refreshing = false;
        }
        self.events.push_back(MonitorEvent::ProviderFailed(provider, err));
    }

    fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    fn current_provider(&self) -> Option<ConfigOrigin> {
        self.current
    }

    fn current_config(&self) -> Option<Arc<TopologyDocument>> {
        self.config.clone()
    }
}
