//! Recording test doubles shared by unit tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cluster::{
    ClusterConfig, ConfigMonitor, ConfigOrigin, DistMode, ErrorMap, HostPort, RefreshPolicy,
    TopologyDocument,
};
use crate::io::{ConnectId, Features, SocketId, Transport};
use crate::provider::ProviderEnv;
use crate::protocol::{encode_response, Opcode, ResponseHeader, Status};
use crate::retry::{RetryBuffer, RetryQueue};
use crate::server::{ChannelEnv, Packet, Response};
use crate::utils::{EngineError, ErrorCode, Result};

/// Transport that records every call and never does I/O
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    next_id: u64,
    pub connects: Vec<(ConnectId, HostPort)>,
    pub cancelled: Vec<ConnectId>,
    pub negotiations: Vec<(ConnectId, SocketId)>,
    pub sessions: HashMap<SocketId, Features>,
    pub written: HashMap<SocketId, Vec<u8>>,
    pub read_wants: Vec<(SocketId, usize)>,
    pub shutdowns: Vec<SocketId>,
    pub closed: Vec<SocketId>,
    pub peers: HashMap<SocketId, HostPort>,
    pub in_flight: HashMap<SocketId, usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn last_connect(&self) -> ConnectId {
        self.connects.last().map(|(id, _)| *id).unwrap_or(ConnectId(0))
    }

    pub fn last_connect_host(&self) -> Option<HostPort> {
        self.connects.last().map(|(_, host)| host.clone())
    }

    /// Take (and clear) everything written to `sock`
    pub fn take_written(&mut self, sock: SocketId) -> Vec<u8> {
        self.written.remove(&sock).unwrap_or_default()
    }

    /// Mark `sock` as connected to `host` with a negotiated session
    pub fn open(&mut self, sock: SocketId, host: HostPort) {
        self.sessions.insert(sock, Features::default());
        self.peers.insert(sock, host);
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self, host: &HostPort, _timeout: Duration) -> ConnectId {
        let id = ConnectId(self.next_id);
        self.next_id += 1;
        self.connects.push((id, host.clone()));
        id
    }

    fn cancel_connect(&mut self, id: ConnectId) {
        self.cancelled.push(id);
    }

    fn session(&self, sock: SocketId) -> Option<Features> {
        self.sessions.get(&sock).copied()
    }

    fn negotiate(&mut self, sock: SocketId, _timeout: Duration) -> ConnectId {
        let id = ConnectId(self.next_id);
        self.next_id += 1;
        self.negotiations.push((id, sock));
        id
    }

    fn write(&mut self, sock: SocketId, data: &[u8]) {
        self.written.entry(sock).or_default().extend_from_slice(data);
    }

    fn want_read(&mut self, sock: SocketId, min: usize) {
        self.read_wants.push((sock, min));
    }

    fn shutdown(&mut self, sock: SocketId) {
        self.shutdowns.push(sock);
    }

    fn close(&mut self, sock: SocketId) {
        self.closed.push(sock);
        self.in_flight.remove(&sock);
    }

    fn peer(&self, sock: SocketId) -> Option<HostPort> {
        self.peers.get(&sock).cloned()
    }

    fn in_flight(&self, sock: SocketId) -> usize {
        self.in_flight.get(&sock).copied().unwrap_or(0)
    }
}

/// What a channel handed to its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivered {
    pub opaque: u32,
    pub opcode: Opcode,
    pub status: Status,
    pub error: Option<ErrorCode>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Channel environment recording every callback
pub(crate) struct MockChannelEnv {
    pub now: Instant,
    pub transport: RecordingTransport,
    pub delivered: Vec<Delivered>,
    pub forwarded: Vec<(u32, Vec<u8>)>,
    pub refreshes: Vec<RefreshPolicy>,
    pub hints: Vec<(HostPort, Vec<u8>)>,
    pub hints_enabled: bool,
    pub hint_accepted: bool,
    pub origin: Option<ConfigOrigin>,
    pub dist: DistMode,
    pub remaps: Vec<(u16, usize)>,
    pub retryq: RetryBuffer,
    pub errmap: ErrorMap,
}

impl MockChannelEnv {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            transport: RecordingTransport::new(),
            delivered: Vec::new(),
            forwarded: Vec::new(),
            refreshes: Vec::new(),
            hints: Vec::new(),
            hints_enabled: false,
            hint_accepted: false,
            origin: Some(ConfigOrigin::Http),
            dist: DistMode::Vbucket,
            remaps: Vec::new(),
            retryq: RetryBuffer::new(),
            errmap: ErrorMap::default(),
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl ChannelEnv for MockChannelEnv {
    fn now(&self) -> Instant {
        self.now
    }

    fn transport(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }

    fn deliver(&mut self, packet: &Packet, response: Response<'_>) {
        let (key, value) = match &response.frame {
            Some(frame) => (frame.key().to_vec(), frame.value().to_vec()),
            None => (Vec::new(), Vec::new()),
        };
        self.delivered.push(Delivered {
            opaque: packet.opaque,
            opcode: response.opcode,
            status: response.status,
            error: response.error,
            key,
            value,
        });
    }

    fn forward(&mut self, packet: &Packet, bytes: &[u8]) {
        self.forwarded.push((packet.opaque, bytes.to_vec()));
    }

    fn request_refresh(&mut self, policy: RefreshPolicy) {
        self.refreshes.push(policy);
    }

    fn apply_config_hint(&mut self, host: &HostPort, body: &[u8]) -> Result<()> {
        self.hints.push((host.clone(), body.to_vec()));
        if self.hint_accepted {
            Ok(())
        } else {
            Err(EngineError::Config("hint rejected".to_string()))
        }
    }

    fn config_hints_enabled(&self) -> bool {
        self.hints_enabled
    }

    fn current_origin(&self) -> Option<ConfigOrigin> {
        self.origin
    }

    fn dist_mode(&self) -> DistMode {
        self.dist
    }

    fn remap_vbucket(&mut self, vbucket: u16, bad: usize) {
        self.remaps.push((vbucket, bad));
    }

    fn retry_queue(&mut self) -> &mut dyn RetryQueue {
        &mut self.retryq
    }

    fn error_map(&self) -> &ErrorMap {
        &self.errmap
    }
}

/// Monitor recording what providers report
#[derive(Debug, Default)]
pub(crate) struct MockMonitor {
    pub configs: Vec<Arc<TopologyDocument>>,
    pub failures: Vec<(ConfigOrigin, ErrorCode)>,
    pub refreshing: bool,
    pub current: Option<ConfigOrigin>,
}

impl ConfigMonitor for MockMonitor {
    fn provider_got_config(&mut self, _provider: ConfigOrigin, doc: Arc<TopologyDocument>) {
        self.configs.push(doc);
    }

    fn provider_failed(&mut self, provider: ConfigOrigin, err: ErrorCode) {
        self.failures.push((provider, err));
    }

    fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    fn current_provider(&self) -> Option<ConfigOrigin> {
        self.current
    }

    fn current_config(&self) -> Option<Arc<TopologyDocument>> {
        self.configs.last().cloned()
    }
}

/// Provider environment over a recording transport and monitor
pub(crate) struct MockProviderEnv {
    pub now: Instant,
    pub transport: RecordingTransport,
    pub monitor: MockMonitor,
}

impl MockProviderEnv {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            transport: RecordingTransport::new(),
            monitor: MockMonitor::default(),
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl ProviderEnv for MockProviderEnv {
    fn now(&self) -> Instant {
        self.now
    }

    fn transport(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }

    fn monitor(&mut self) -> &mut dyn ConfigMonitor {
        &mut self.monitor
    }
}

/// Encoded response frame
pub(crate) fn response_bytes(
    opcode: Opcode,
    status: Status,
    opaque: u32,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let header = ResponseHeader {
        opcode,
        keylen: 0,
        extlen: 0,
        datatype: 0,
        status,
        bodylen: 0,
        opaque,
        cas: 0,
    };
    encode_response(header, &[], key, value)
}

/// Cluster configuration JSON with `n` data servers `node0..` and four
/// vbuckets spread over them
pub(crate) fn config_json(rev: i64, n: usize) -> String {
    let servers: Vec<String> = (0..n).map(|i| format!("\"node{}:11210\"", i)).collect();
    let nodes: Vec<String> = (0..n)
        .map(|i| {
            format!(
                r#"{{"hostname": "node{}", "services": {{"kv": 11210, "mgmt": 8091, "kvSSL": 11207, "mgmtSSL": 18091}}}}"#,
                i
            )
        })
        .collect();
    let vbmap: Vec<String> = (0..4).map(|vb| format!("[{}]", vb % n)).collect();
    format!(
        r#"{{"rev": {}, "name": "default", "nodeLocator": "vbucket", "nodesExt": [{}],
            "vBucketServerMap": {{"numReplicas": 0, "serverList": [{}], "vBucketMap": [{}]}}}}"#,
        rev,
        nodes.join(", "),
        servers.join(", "),
        vbmap.join(", ")
    )
}

pub(crate) fn document(rev: i64, n: usize) -> Arc<TopologyDocument> {
    let config = ClusterConfig::from_json(&config_json(rev, n)).unwrap();
    Arc::new(TopologyDocument::new(config, ConfigOrigin::Http, rev as u64))
}
