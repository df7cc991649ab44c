//! Channels for every node of the current configuration
//!
//! The node set owns one [`NodeChannel`] per server index, routes requests
//! by vbucket and keeps channels alive across configuration changes when
//! their host is still part of the cluster. Channels whose node left the map
//! hand their pending requests to the retry queue and are closed; they stay
//! here until their I/O drains.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use super::channel::{ChannelEnv, ChannelState, NodeChannel, Response};
use super::packet::Packet;
use crate::cluster::{
    ClusterConfig, ConfigOrigin, DistMode, ErrorMap, HostPort, RefreshPolicy, TopologyDocument,
    VbGuess,
};
use crate::config::EngineSettings;
use crate::io::{timer, IoEvent, Transport};
use crate::retry::{RetryCoordinator, RetryQueue};
use crate::utils::{ErrorCode, Result};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Active(usize),
    Closing(usize),
}

/// Channel environment as seen from inside the node set: vbucket remaps go
/// to the guess table and the distribution mode comes from the installed
/// configuration
struct RoutedEnv<'a> {
    inner: &'a mut dyn ChannelEnv,
    guess: &'a mut VbGuess,
    config: Option<&'a ClusterConfig>,
    guessing: bool,
}

impl ChannelEnv for RoutedEnv<'_> {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn transport(&mut self) -> &mut dyn Transport {
        self.inner.transport()
    }

    fn deliver(&mut self, packet: &Packet, response: Response<'_>) {
        self.inner.deliver(packet, response)
    }

    fn forward(&mut self, packet: &Packet, bytes: &[u8]) {
        self.inner.forward(packet, bytes)
    }

    fn request_refresh(&mut self, policy: RefreshPolicy) {
        self.inner.request_refresh(policy)
    }

    fn apply_config_hint(&mut self, host: &HostPort, body: &[u8]) -> Result<()> {
        self.inner.apply_config_hint(host, body)
    }

    fn config_hints_enabled(&self) -> bool {
        self.inner.config_hints_enabled()
    }

    fn current_origin(&self) -> Option<ConfigOrigin> {
        self.inner.current_origin()
    }

    fn dist_mode(&self) -> DistMode {
        match self.config {
            Some(config) => config.dist_mode(),
            None => self.inner.dist_mode(),
        }
    }

    fn remap_vbucket(&mut self, vbucket: u16, bad: usize) {
        if !self.guessing {
            return;
        }
        let Some(config) = self.config else {
            return;
        };
        if let Some(ix) = self.guess.remap(config, vbucket, bad, true) {
            debug!("Guessing server {} for vbucket {} (was {})", ix, vbucket, bad);
        }
    }

    fn retry_queue(&mut self) -> &mut dyn RetryQueue {
        self.inner.retry_queue()
    }

    fn error_map(&self) -> &ErrorMap {
        self.inner.error_map()
    }
}

pub struct NodeSet {
    settings: Arc<EngineSettings>,
    channels: Vec<NodeChannel>,
    closing: Vec<NodeChannel>,
    config: Option<Arc<TopologyDocument>>,
    guess: VbGuess,
    retry: RetryCoordinator,
}

impl NodeSet {
    pub fn new(settings: Arc<EngineSettings>) -> Self {
        let retry = RetryCoordinator::new(settings.retry);
        Self {
            settings,
            channels: Vec::new(),
            closing: Vec::new(),
            config: None,
            guess: VbGuess::default(),
            retry,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, index: usize) -> Option<&NodeChannel> {
        self.channels.get(index)
    }

    /// Removed channels still draining
    pub fn closing_len(&self) -> usize {
        self.closing.len()
    }

    pub fn config(&self) -> Option<&Arc<TopologyDocument>> {
        self.config.as_ref()
    }

    /// Install a new configuration
    pub fn reconfigure(&mut self, env: &mut dyn ChannelEnv, doc: Arc<TopologyDocument>) {
        let ssl = self.settings.use_ssl;
        let config = &doc.config;
        let mut old = mem::take(&mut self.channels);
        let mut channels = Vec::with_capacity(config.servers().len());

        for ix in 0..config.servers().len() {
            let channel = match config.data_address(ix, ssl) {
                Some(host) => {
                    let reusable = old
                        .iter()
                        .position(|c| c.host() == Some(&host) && c.state() != ChannelState::Closed);
                    match reusable {
                        Some(pos) => {
                            let mut channel = old.swap_remove(pos);
                            channel.set_index(ix);
                            channel
                        }
                        None => NodeChannel::new(ix, host, &self.settings),
                    }
                }
                None => NodeChannel::uninitialized(ix),
            };
            channels.push(channel);
        }

        info!(
            "Installing configuration rev {} ({} servers, {} channels removed)",
            doc.rev(),
            channels.len(),
            old.len()
        );
        self.channels = channels;
        self.guess.reset(config.num_vbuckets());
        let dist = config.dist_mode();
        self.config = Some(Arc::clone(&doc));

        for mut channel in old {
            for packet in channel.take_pending() {
                if let Err(packet) = self.retry.retry_relocated(packet, dist, env.retry_queue()) {
                    env.deliver(&packet, Response::failure(packet.opcode, ErrorCode::MapChanged));
                }
            }
            channel.close(env);
            if !channel.is_released() {
                self.closing.push(channel);
            }
        }
    }

    /// Server index a vbucket is routed to
    pub fn route(&self, vbucket: u16) -> Option<usize> {
        let doc = self.config.as_ref()?;
        if self.settings.vbucket_guess {
            if let Some(ix) = self.guess.get(vbucket) {
                return Some(ix);
            }
        }
        doc.config.master(vbucket)
    }

    /// Route and queue a request. The packet is handed back when no channel
    /// can take it.
    pub fn schedule(&mut self, env: &mut dyn ChannelEnv, packet: Packet) -> std::result::Result<(), Packet> {
        let Some(ix) = self.route(packet.vbucket) else {
            return Err(packet);
        };
        let (active, _, mut routed) = self.parts(env);
        match active.get_mut(ix) {
            Some(channel) => channel.schedule(&mut routed, packet),
            None => Err(packet),
        }
    }

    /// Route a reactor completion to the channel it belongs to
    pub fn handle_event(&mut self, env: &mut dyn ChannelEnv, event: IoEvent) {
        match event {
            IoEvent::Connected { id, result } => match self.find(|c| c.owns_connect(id)) {
                Some(slot) => self.with_slot(env, slot, |ch, env| ch.handle_connected(env, id, result)),
                None => {
                    trace!("No channel owns connect attempt {:?}", id);
                    if let Ok(sock) = result {
                        env.transport().close(sock);
                    }
                }
            },
            IoEvent::Data { sock, data } => match self.find(|c| c.owns_socket(sock)) {
                Some(slot) => self.with_slot(env, slot, |ch, env| ch.on_read(env, sock, &data)),
                None => trace!("Dropping {} bytes for unowned {}", data.len(), sock),
            },
            IoEvent::Flushed { sock } => {
                if let Some(slot) = self.find(|c| c.owns_socket(sock)) {
                    self.with_slot(env, slot, |ch, env| ch.on_flushed(env, sock));
                }
            }
            IoEvent::Failed { sock, error } => {
                if let Some(slot) = self.find(|c| c.owns_socket(sock)) {
                    self.with_slot(env, slot, |ch, env| ch.on_socket_error(env, sock, error));
                }
            }
        }
        self.reap();
    }

    /// Fire every expired channel timer
    pub fn on_timers(&mut self, env: &mut dyn ChannelEnv) {
        let (active, closing, mut routed) = self.parts(env);
        for channel in active.iter_mut().chain(closing.iter_mut()) {
            channel.on_timer(&mut routed);
        }
        self.reap();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timer::earliest(
            self.channels
                .iter()
                .chain(self.closing.iter())
                .map(NodeChannel::next_deadline),
        )
    }

    /// Close every channel
    pub fn close_all(&mut self, env: &mut dyn ChannelEnv) {
        for mut channel in mem::take(&mut self.channels) {
            channel.close(env);
            if !channel.is_released() {
                self.closing.push(channel);
            }
        }
        self.config = None;
    }

    pub fn dump(&self) -> String {
        let mut out = match &self.config {
            Some(doc) => format!("Node set for rev {}:", doc.rev()),
            None => "Node set without configuration:".to_string(),
        };
        for channel in &self.channels {
            out.push('\n');
            out.push_str(&channel.dump());
        }
        for channel in &self.closing {
            out.push_str("\n(closing) ");
            out.push_str(&channel.dump());
        }
        out
    }

    fn reap(&mut self) {
        let before = self.closing.len();
        self.closing.retain(|c| !c.is_released());
        let reaped = before - self.closing.len();
        if reaped > 0 {
            debug!("Released {} closed channels", reaped);
        }
    }

    fn find(&self, pred: impl Fn(&NodeChannel) -> bool) -> Option<Slot> {
        if let Some(ix) = self.channels.iter().position(&pred) {
            return Some(Slot::Active(ix));
        }
        self.closing.iter().position(&pred).map(Slot::Closing)
    }

    fn parts<'s>(
        &'s mut self,
        env: &'s mut dyn ChannelEnv,
    ) -> (&'s mut Vec<NodeChannel>, &'s mut Vec<NodeChannel>, RoutedEnv<'s>) {
        let routed = RoutedEnv {
            inner: env,
            guess: &mut self.guess,
            config: self.config.as_deref().map(|doc| &doc.config),
            guessing: self.settings.vbucket_guess,
        };
        (&mut self.channels, &mut self.closing, routed)
    }

    fn with_slot<R>(
        &mut self,
        env: &mut dyn ChannelEnv,
        slot: Slot,
        f: impl FnOnce(&mut NodeChannel, &mut dyn ChannelEnv) -> R,
    ) -> R {
        let (active, closing, mut routed) = self.parts(env);
        let channel = match slot {
            Slot::Active(ix) => &mut active[ix],
            Slot::Closing(ix) => &mut closing[ix],
        };
        f(channel, &mut routed)
    }
}
