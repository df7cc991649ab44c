//! Node channel
//!
//! One channel per data node. A channel owns the pending requests written
//! to its node, parses the response stream, matches responses to requests
//! by opaque and decides what each response means for the request (deliver,
//! redirect, retry) and for the channel itself (keep going, fail, drain).
//!
//! The channel performs no I/O itself. It drives an [`io::Transport`]
//! through its [`ChannelEnv`] and is driven by the owner forwarding
//! [`io::IoEvent`]s and timer expiries to it.
//!
//! [`io::Transport`]: crate::io::Transport
//! [`io::IoEvent`]: crate::io::IoEvent

use std::mem;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::packet::Packet;
use super::pipeline::PendingQueue;
use crate::cluster::{
    ConfigOrigin, DistMode, ErrorAttribute, ErrorMap, HostPort, RefreshPolicy,
};
use crate::config::EngineSettings;
use crate::io::{ConnectFailure, ConnectId, Features, SocketId, Timer, Transport};
use crate::protocol::{decode_response, Decoded, Opcode, ResponseFrame, Status, HEADER_SIZE};
use crate::retry::{RetryCoordinator, RetryQueue};
use crate::utils::{ErrorCode, Result};

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting requests
    Clean,
    /// Failed; waiting for outstanding I/O before reconnecting
    ErrorDraining,
    /// Closed by its owner; released once outstanding I/O drains
    Closed,
    /// Placeholder for a node without a data service
    Uninitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Connecting(ConnectId),
    Negotiating { id: ConnectId, sock: SocketId },
    Connected(SocketId),
}

/// What the owner of a request sees when it completes
#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    pub opcode: Opcode,
    pub status: Status,
    /// The server's response, when there is one
    pub frame: Option<ResponseFrame<'a>>,
    pub error: Option<ErrorCode>,
}

impl<'a> Response<'a> {
    pub fn from_frame(frame: ResponseFrame<'a>, error: Option<ErrorCode>) -> Self {
        Self {
            opcode: frame.opcode(),
            status: frame.status(),
            frame: Some(frame),
            error,
        }
    }

    /// A request failed without a response
    pub fn failure(opcode: Opcode, error: ErrorCode) -> Self {
        Self {
            opcode,
            status: Status::EINVAL,
            frame: None,
            error: Some(error),
        }
    }
}

/// The channel's view of the instance it belongs to
pub trait ChannelEnv {
    fn now(&self) -> Instant;

    fn transport(&mut self) -> &mut dyn Transport;

    /// Complete a request
    fn deliver(&mut self, packet: &Packet, response: Response<'_>);

    /// Hand the raw bytes of a response to a forwarded request's owner
    fn forward(&mut self, packet: &Packet, bytes: &[u8]);

    fn request_refresh(&mut self, policy: RefreshPolicy);

    /// Apply a configuration carried in a NOT_MY_VBUCKET body
    fn apply_config_hint(&mut self, host: &HostPort, body: &[u8]) -> Result<()>;

    fn config_hints_enabled(&self) -> bool;

    /// Origin of the configuration currently in use
    fn current_origin(&self) -> Option<ConfigOrigin>;

    fn dist_mode(&self) -> DistMode;

    /// Server `bad` refused `vbucket`; guess another master
    fn remap_vbucket(&mut self, vbucket: u16, bad: usize);

    fn retry_queue(&mut self) -> &mut dyn RetryQueue;

    fn error_map(&self) -> &ErrorMap;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// Every complete frame was handled
    Complete(usize),
    /// The next frame needs this many more bytes
    Partial(usize),
    Abort(ErrorCode),
}

/// When a purge asks for a configuration refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgeRefresh {
    Always,
    OnFailed,
    Never,
}

/// Result of looking a status up in the error map
#[derive(Debug, Default)]
struct ErrorMapAction {
    error: Option<ErrorCode>,
    suppress_delivery: bool,
    fail_channel: Option<ErrorCode>,
}

pub struct NodeChannel {
    index: usize,
    host: Option<HostPort>,
    label: String,
    state: ChannelState,
    link: Link,
    pending: PendingQueue,
    rbuf: Vec<u8>,
    timer: Timer,
    features: Features,
    op_timeout: Duration,
    detect_stalled_loop: bool,
    stalled_reconnect_used: bool,
    use_errmap: bool,
    retry: RetryCoordinator,
    released: bool,
}

impl NodeChannel {
    pub fn new(index: usize, host: HostPort, settings: &EngineSettings) -> Self {
        Self {
            index,
            label: host.to_string(),
            host: Some(host),
            state: ChannelState::Clean,
            link: Link::Idle,
            pending: PendingQueue::new(),
            rbuf: Vec::new(),
            timer: Timer::new(),
            features: Features::default(),
            op_timeout: settings.operation_timeout(),
            detect_stalled_loop: settings.detect_stalled_loop,
            stalled_reconnect_used: false,
            use_errmap: settings.use_errmap,
            retry: RetryCoordinator::new(settings.retry),
            released: false,
        }
    }

    /// Channel for a server that has no data service; rejects everything
    pub fn uninitialized(index: usize) -> Self {
        let mut channel = Self::new(
            index,
            HostPort::new("", 0),
            &EngineSettings::default(),
        );
        channel.host = None;
        channel.label = format!("uninitialized#{}", index);
        channel.state = ChannelState::Uninitialized;
        channel
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn host(&self) -> Option<&HostPort> {
        self.host.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Closed and every resource returned to the transport
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn owns_connect(&self, id: ConnectId) -> bool {
        match self.link {
            Link::Connecting(current) | Link::Negotiating { id: current, .. } => current == id,
            Link::Idle | Link::Connected(_) => false,
        }
    }

    pub fn owns_socket(&self, sock: SocketId) -> bool {
        match self.link {
            Link::Negotiating { sock: current, .. } | Link::Connected(current) => current == sock,
            Link::Idle | Link::Connecting(_) => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Queue a request for this node
    ///
    /// Channels that are not clean hand the packet back. A disconnected
    /// channel starts connecting.
    pub fn schedule(&mut self, env: &mut dyn ChannelEnv, packet: Packet) -> std::result::Result<(), Packet> {
        if self.state != ChannelState::Clean {
            return Err(packet);
        }

        if let Some(evicted) = self.pending.push(packet) {
            warn!(
                "<{}> Duplicate opaque {}; failing the earlier request",
                self.label, evicted.opaque
            );
            env.deliver(
                &evicted,
                Response::failure(evicted.opcode, ErrorCode::InvalidArgument),
            );
        }

        match self.link {
            Link::Idle => self.connect(env),
            Link::Connected(_) => self.flush(env),
            Link::Connecting(_) | Link::Negotiating { .. } => {}
        }
        if !self.timer.is_armed() {
            let now = env.now();
            self.timer.arm(now, self.op_timeout);
        }
        Ok(())
    }

    /// Start a connection attempt, cancelling any attempt in progress
    pub fn connect(&mut self, env: &mut dyn ChannelEnv) {
        let Some(host) = self.host.clone() else {
            return;
        };
        match mem::replace(&mut self.link, Link::Idle) {
            Link::Connecting(id) => env.transport().cancel_connect(id),
            Link::Negotiating { id, sock } => {
                env.transport().cancel_connect(id);
                env.transport().close(sock);
            }
            Link::Connected(sock) => env.transport().close(sock),
            Link::Idle => {}
        }
        debug!("<{}> Connecting", self.label);
        let id = env.transport().connect(&host, self.op_timeout);
        self.link = Link::Connecting(id);
    }

    /// A connect or negotiation attempt finished
    pub fn handle_connected(
        &mut self,
        env: &mut dyn ChannelEnv,
        id: ConnectId,
        result: std::result::Result<SocketId, ConnectFailure>,
    ) {
        if !self.owns_connect(id) {
            trace!("<{}> Ignoring stale connect completion", self.label);
            return;
        }
        let was = mem::replace(&mut self.link, Link::Idle);

        let sock = match result {
            Ok(sock) => sock,
            Err(failure) => {
                if let Link::Negotiating { sock, .. } = was {
                    env.transport().close(sock);
                }
                error!(
                    "<{}> Connection attempt failed: {} (os error {:?})",
                    self.label, failure.error, failure.os_error
                );
                if self.maybe_reconnect_on_fake_timeout(env, failure.error) {
                    return;
                }
                self.socket_failed(env, failure.error);
                return;
            }
        };

        let features = match env.transport().session(sock) {
            Some(features) => features,
            None if matches!(was, Link::Connecting(_)) => {
                debug!("<{}> Negotiating session on {}", self.label, sock);
                let id = env.transport().negotiate(sock, self.op_timeout);
                self.link = Link::Negotiating { id, sock };
                return;
            }
            None => Features::default(),
        };

        info!(
            "<{}> Connected on {} (datatype={}, mutation_tokens={})",
            self.label, sock, features.datatype, features.mutation_tokens
        );
        self.features = features;
        self.link = Link::Connected(sock);
        self.stalled_reconnect_used = false;

        let now = env.now();
        let next = self.next_timeout(now);
        self.timer.arm(now, next);
        self.flush(env);
    }

    /// Write every packet not yet handed to the transport
    pub fn flush(&mut self, env: &mut dyn ChannelEnv) {
        let Link::Connected(sock) = self.link else {
            return;
        };
        let bytes = self.pending.flush_unflushed();
        if !bytes.is_empty() {
            trace!("<{}> Flushing {} bytes", self.label, bytes.len());
            env.transport().write(sock, &bytes);
        }
        if !self.pending.is_empty() {
            env.transport().want_read(sock, HEADER_SIZE);
        }
    }

    /// Bytes arrived on `sock`
    pub fn on_read(&mut self, env: &mut dyn ChannelEnv, sock: SocketId, data: &[u8]) {
        if !self.owns_socket(sock) {
            trace!("<{}> Ignoring data for stale {}", self.label, sock);
            return;
        }
        if self.check_closed(env) {
            return;
        }

        trace!("<{}> Received {} bytes", self.label, data.len());
        self.rbuf.extend_from_slice(data);

        match self.try_read(env, sock) {
            ReadOutcome::Abort(err) => {
                self.socket_failed(env, err);
                return;
            }
            ReadOutcome::Complete(handled) => {
                trace!("<{}> Handled {} responses", self.label, handled);
            }
            ReadOutcome::Partial(_) => {}
        }

        if self.link != Link::Connected(sock) || self.state != ChannelState::Clean {
            return;
        }
        if !self.pending.is_empty() {
            let need = match decode_response(&self.rbuf) {
                Ok(Decoded::NeedMore(total)) => total.saturating_sub(self.rbuf.len()),
                _ => HEADER_SIZE,
            };
            env.transport().want_read(sock, need.max(1));
        }
    }

    /// Parse and dispatch every complete frame in the receive buffer
    fn try_read(&mut self, env: &mut dyn ChannelEnv, sock: SocketId) -> ReadOutcome {
        let mut buf = mem::take(&mut self.rbuf);
        let mut pos = 0;
        let mut handled = 0;

        let outcome = loop {
            if self.link != Link::Connected(sock) || self.state != ChannelState::Clean {
                break ReadOutcome::Complete(handled);
            }
            match decode_response(&buf[pos..]) {
                Err(e) => {
                    error!("<{}> Invalid response: {}", self.label, e);
                    break ReadOutcome::Abort(ErrorCode::ProtocolError);
                }
                Ok(Decoded::NeedMore(total)) => {
                    if handled > 0 {
                        break ReadOutcome::Complete(handled);
                    }
                    break ReadOutcome::Partial(total - (buf.len() - pos));
                }
                Ok(Decoded::Frame(frame)) => {
                    pos += frame.len();
                    handled += 1;
                    self.dispatch(env, frame);
                }
            }
        };

        if self.link == Link::Connected(sock) && self.state == ChannelState::Clean {
            buf.drain(..pos);
            self.rbuf = buf;
        }
        outcome
    }

    /// Match a frame to its request and handle it
    fn dispatch(&mut self, env: &mut dyn ChannelEnv, frame: ResponseFrame<'_>) {
        let opaque = frame.opaque();
        let Some((seq, mut packet)) = self.pending.take(opaque) else {
            debug!(
                "<{}> Dropping response for unknown opaque {} (opcode {}, status {})",
                self.label,
                opaque,
                frame.opcode(),
                frame.status()
            );
            return;
        };

        // STAT streams one response per statistic and ends with an empty key
        let non_terminal = frame.opcode() == Opcode::STAT && frame.header.keylen > 0;
        if packet.retries > 0 && !non_terminal {
            env.retry_queue().forget(packet.opaque);
        }

        if packet.flags.forward {
            env.forward(&packet, frame.as_bytes());
        } else {
            self.handle_response(env, &packet, frame);
        }

        if non_terminal {
            packet.flags.invoked = true;
            if self.state == ChannelState::Clean {
                self.pending.restore(seq, packet);
            } else {
                env.deliver(&packet, Response::failure(packet.opcode, ErrorCode::NetworkError));
            }
        }
    }

    fn handle_response(&mut self, env: &mut dyn ChannelEnv, packet: &Packet, frame: ResponseFrame<'_>) {
        let status = frame.status();
        if status.is_fastpath() {
            env.deliver(packet, Response::from_frame(frame, None));
            return;
        }
        if status == Status::NOT_MY_VBUCKET {
            self.handle_nmv(env, packet, frame);
            return;
        }

        let action = if self.use_errmap {
            self.handle_unknown_error(env, packet, frame)
        } else {
            ErrorMapAction::default()
        };

        if !action.suppress_delivery {
            env.deliver(packet, Response::from_frame(frame, action.error));
        }
        if let Some(err) = action.fail_channel {
            self.socket_failed(env, err);
        }
    }

    /// NOT_MY_VBUCKET: the node does not own the request's vbucket
    fn handle_nmv(&mut self, env: &mut dyn ChannelEnv, packet: &Packet, frame: ResponseFrame<'_>) {
        warn!(
            "<{}> NOT_MY_VBUCKET for key={:?} (opaque={}, opcode={}, vb={})",
            self.label, packet.key(), packet.opaque, packet.opcode, packet.vbucket
        );
        env.remap_vbucket(packet.vbucket, self.index);

        let body = frame.value();
        let mut applied = false;
        if !body.is_empty() && env.config_hints_enabled() {
            if let Some(host) = &self.host {
                match env.apply_config_hint(host, body) {
                    Ok(()) => applied = true,
                    Err(e) => debug!("<{}> Ignoring configuration hint: {}", self.label, e),
                }
            }
        }
        if !applied {
            let policy = match env.current_origin() {
                Some(ConfigOrigin::Http) => RefreshPolicy::Always,
                _ => RefreshPolicy::Throttle { count_error: false },
            };
            env.request_refresh(policy);
        }

        let dist = env.dist_mode();
        if self.retry.retry_redirect(packet, dist, env.retry_queue()) {
            return;
        }
        env.deliver(packet, Response::from_frame(frame, Some(ErrorCode::MapChanged)));
    }

    /// Consult the error map about a status the channel does not know
    fn handle_unknown_error(
        &mut self,
        env: &mut dyn ChannelEnv,
        packet: &Packet,
        frame: ResponseFrame<'_>,
    ) -> ErrorMapAction {
        let map = env.error_map();
        if !map.is_loaded() {
            return ErrorMapAction::default();
        }
        let Some(info) = map.lookup(frame.status()).cloned() else {
            warn!(
                "<{}> Status {} is not in the error map; disconnecting",
                self.label,
                frame.status()
            );
            return ErrorMapAction {
                fail_channel: Some(ErrorCode::ProtocolError),
                ..ErrorMapAction::default()
            };
        };
        if info.has(ErrorAttribute::SpecialHandling) {
            warn!(
                "<{}> Status {} ({}) needs special handling; disconnecting",
                self.label, info.code, info.name
            );
            return ErrorMapAction {
                fail_channel: Some(ErrorCode::ProtocolError),
                ..ErrorMapAction::default()
            };
        }

        let mut action = ErrorMapAction::default();
        if info.has(ErrorAttribute::FetchConfig) {
            env.request_refresh(RefreshPolicy::Throttle { count_error: false });
        }

        if info.has(ErrorAttribute::Auth) {
            action.error = Some(ErrorCode::AuthError);
        } else if info.has(ErrorAttribute::Temp) {
            action.error = Some(ErrorCode::TemporaryFailure);
        } else if info.has(ErrorAttribute::ConstraintFailure) {
            action.error = Some(ErrorCode::ConstraintFailure);
        } else if info.has(ErrorAttribute::Subdoc) {
            action.error = Some(ErrorCode::SubdocError);
        }

        if info.has(ErrorAttribute::AutoRetry) {
            let err = action.error.unwrap_or(ErrorCode::Generic);
            debug!(
                "<{}> Auto-retrying opaque={} after status {} ({})",
                self.label, packet.opaque, info.code, info.name
            );
            self.retry
                .retry_with_spec(packet, err, info.retry.as_ref(), env.retry_queue());
            action.suppress_delivery = true;
        }
        if info.has(ErrorAttribute::ConnStateInvalidated) {
            action.fail_channel = Some(action.error.unwrap_or(ErrorCode::Generic));
        }
        action
    }

    /// The operation timer fired
    pub fn on_timer(&mut self, env: &mut dyn ChannelEnv) {
        let now = env.now();
        if !self.timer.fire(now) {
            return;
        }
        match self.state {
            ChannelState::Clean => self.io_timeout(env),
            ChannelState::ErrorDraining => {
                warn!("<{}> Outstanding I/O did not drain; dropping socket", self.label);
                self.finalize(env);
            }
            ChannelState::Closed | ChannelState::Uninitialized => {
                self.check_closed(env);
            }
        }
    }

    /// Fail requests that outlived the operation timeout
    fn io_timeout(&mut self, env: &mut dyn ChannelEnv) {
        let now = env.now();
        if let Some(threshold) = now.checked_sub(self.op_timeout) {
            let purged = self.purge(env, ErrorCode::Timeout, Some(threshold), PurgeRefresh::OnFailed);
            if purged > 0 {
                error!(
                    "<{}> Failing {} requests after {:?} timeout",
                    self.label, purged, self.op_timeout
                );
            }
        }
        let next = self.next_timeout(now);
        self.timer.arm(now, next);
    }

    /// Time until the oldest pending request expires, or the full operation
    /// timeout when nothing is pending
    fn next_timeout(&self, now: Instant) -> Duration {
        match self.pending.oldest_start() {
            Some(oldest) => (oldest + self.op_timeout).saturating_duration_since(now),
            None => self.op_timeout,
        }
    }

    /// Fail pending requests with `err`: all of them, or those started at
    /// or before `threshold`. Returns how many were failed.
    fn purge(
        &mut self,
        env: &mut dyn ChannelEnv,
        err: ErrorCode,
        threshold: Option<Instant>,
        refresh: PurgeRefresh,
    ) -> usize {
        let packets = match threshold {
            Some(threshold) => self.pending.expire(threshold),
            None => self.pending.drain(),
        };
        let affected = packets.len();
        for packet in packets {
            self.purge_single(env, packet, err);
        }
        let wanted = match refresh {
            PurgeRefresh::Always => true,
            PurgeRefresh::OnFailed => affected > 0,
            PurgeRefresh::Never => false,
        };
        if wanted {
            env.request_refresh(RefreshPolicy::Throttle { count_error: true });
        }
        affected
    }

    fn purge_single(&mut self, env: &mut dyn ChannelEnv, packet: Packet, err: ErrorCode) {
        let dist = env.dist_mode();
        let packet = match self.retry.retry_failed(packet, err, dist, env.retry_queue()) {
            Ok(()) => return,
            Err(packet) => packet,
        };

        let mut err = RetryCoordinator::reclassify(err);
        if let Some(recorded) = env.retry_queue().take_error(&packet) {
            if err == ErrorCode::Timeout {
                err = recorded;
            }
        }
        debug!(
            "<{}> Failing opaque={} opcode={} with {}",
            self.label, packet.opaque, packet.opcode, err
        );
        env.deliver(&packet, Response::failure(packet.opcode, err));
    }

    /// A connect timeout with most of the operation time left is taken as a
    /// stalled event loop rather than a dead node; reconnect once
    fn maybe_reconnect_on_fake_timeout(&mut self, env: &mut dyn ChannelEnv, err: ErrorCode) -> bool {
        if err != ErrorCode::Timeout
            || !self.detect_stalled_loop
            || self.stalled_reconnect_used
            || self.pending.is_empty()
        {
            return false;
        }
        let now = env.now();
        if self.next_timeout(now) < self.op_timeout / 2 {
            return false;
        }
        info!(
            "<{}> Connect timed out early; reconnecting once (stalled event loop?)",
            self.label
        );
        self.stalled_reconnect_used = true;
        self.connect(env);
        true
    }

    /// The socket (or the attempt to get one) failed
    pub fn on_socket_error(&mut self, env: &mut dyn ChannelEnv, sock: SocketId, err: ErrorCode) {
        if !self.owns_socket(sock) {
            return;
        }
        match self.state {
            ChannelState::Clean => {}
            ChannelState::ErrorDraining | ChannelState::Closed => {
                // A dead socket has nothing left to drain
                debug!("<{}> Socket error {} while draining", self.label, err);
                self.finalize(env);
                return;
            }
            ChannelState::Uninitialized => return,
        }
        error!("<{}> Got socket error {}", self.label, err);
        self.socket_failed(env, err);
    }

    /// Buffered writes on `sock` reached the kernel
    pub fn on_flushed(&mut self, env: &mut dyn ChannelEnv, sock: SocketId) {
        if !self.owns_socket(sock) {
            return;
        }
        self.check_closed(env);
    }

    /// Fail everything pending and start draining
    pub fn socket_failed(&mut self, env: &mut dyn ChannelEnv, err: ErrorCode) {
        if self.check_closed(env) {
            return;
        }
        self.purge(env, err, None, PurgeRefresh::Always);
        self.start_errored(env, ChannelState::ErrorDraining);
    }

    /// Close the channel; it is released once outstanding I/O drains.
    /// Requests still pending are failed (or retried) as on shutdown.
    pub fn close(&mut self, env: &mut dyn ChannelEnv) {
        if self.state == ChannelState::Closed {
            return;
        }
        debug!("<{}> Closing channel", self.label);
        self.purge(env, ErrorCode::Shutdown, None, PurgeRefresh::Never);
        self.start_errored(env, ChannelState::Closed);
    }

    /// Drain every pending request, e.g. to relocate them elsewhere
    pub fn take_pending(&mut self) -> Vec<Packet> {
        self.pending.drain()
    }

    fn start_errored(&mut self, env: &mut dyn ChannelEnv, next: ChannelState) {
        self.state = next;
        match self.link {
            Link::Connecting(id) => {
                env.transport().cancel_connect(id);
                self.link = Link::Idle;
            }
            Link::Negotiating { id, sock } => {
                env.transport().cancel_connect(id);
                env.transport().close(sock);
                self.link = Link::Idle;
            }
            Link::Idle | Link::Connected(_) => {}
        }
        if next == ChannelState::Closed {
            self.timer.destroy();
        }

        match self.link {
            Link::Connected(sock) => {
                if env.transport().in_flight(sock) > 0 {
                    debug!("<{}> Waiting for I/O on {} to drain", self.label, sock);
                    env.transport().shutdown(sock);
                    if next == ChannelState::ErrorDraining {
                        let now = env.now();
                        self.timer.arm(now, self.op_timeout);
                    }
                } else {
                    self.finalize(env);
                }
            }
            _ => self.finalize(env),
        }
    }

    /// Release the socket once nothing is in flight, then either release the
    /// channel or return to service
    fn finalize(&mut self, env: &mut dyn ChannelEnv) {
        debug!("<{}> Finalizing channel in state {:?}", self.label, self.state);
        if let Link::Connected(sock) = mem::replace(&mut self.link, Link::Idle) {
            env.transport().close(sock);
        }
        self.rbuf.clear();
        self.pending.reset_flushed();

        match self.state {
            ChannelState::Closed => {
                self.released = true;
            }
            ChannelState::ErrorDraining => {
                self.state = ChannelState::Clean;
                if !self.pending.is_empty() {
                    self.connect(env);
                    let now = env.now();
                    let next = self.next_timeout(now);
                    self.timer.arm(now, next);
                }
            }
            ChannelState::Clean | ChannelState::Uninitialized => {}
        }
    }

    /// Returns false if the channel is clean. Otherwise finalizes it if its
    /// I/O has drained and returns true.
    fn check_closed(&mut self, env: &mut dyn ChannelEnv) -> bool {
        match self.state {
            ChannelState::Clean => false,
            ChannelState::Uninitialized => true,
            ChannelState::ErrorDraining | ChannelState::Closed => {
                match self.link {
                    Link::Connected(sock) => {
                        if env.transport().in_flight(sock) == 0 {
                            self.finalize(env);
                        }
                    }
                    _ => {
                        if !self.released && self.state == ChannelState::Closed {
                            self.finalize(env);
                        }
                    }
                }
                true
            }
        }
    }

    /// Human-readable state summary
    pub fn dump(&self) -> String {
        let mut out = format!(
            "<{}> index={} state={:?} link={:?} pending={} rbuf={} timer={:?}",
            self.label,
            self.index,
            self.state,
            self.link,
            self.pending.len(),
            self.rbuf.len(),
            self.timer.deadline()
        );
        for packet in self.pending.iter() {
            out.push_str(&format!(
                "\n  opaque={} opcode={} vb={} retries={} flushed={} invoked={}",
                packet.opaque,
                packet.opcode,
                packet.vbucket,
                packet.retries,
                packet.flags.flushed,
                packet.flags.invoked
            ));
        }
        out
    }
}
