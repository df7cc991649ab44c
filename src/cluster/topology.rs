//! Cluster configuration documents
//!
//! A [`ClusterConfig`] is parsed from the JSON the management service streams
//! (`nodes`, `nodesExt`, `vBucketServerMap`). A [`TopologyDocument`] wraps a
//! config with the generation and origin it was received with; documents are
//! shared as `Arc<TopologyDocument>` and replaced wholesale, never mutated.

use std::fmt;

use serde::Deserialize;

use super::hostlist::HostPort;
use crate::utils::TopologyError;

/// Placeholder the server uses for "the host you fetched this from"
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// How keys are distributed over servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistMode {
    /// vbucket map; servers can redirect with NOT_MY_VBUCKET
    Vbucket,
    /// Consistent hashing (memcached buckets); no redirects
    Ketama,
}

/// Which provider produced a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigOrigin {
    Http,
    Cccp,
    File,
    User,
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigOrigin::Http => "HTTP",
            ConfigOrigin::Cccp => "CCCP",
            ConfigOrigin::File => "FILE",
            ConfigOrigin::User => "USER",
        };
        f.write_str(name)
    }
}

/// Service ports exposed by one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Services {
    pub kv: Option<u16>,
    pub kv_ssl: Option<u16>,
    pub mgmt: Option<u16>,
    pub mgmt_ssl: Option<u16>,
}

/// One node of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: String,
    pub services: Services,
}

impl ServerInfo {
    pub fn data_address(&self, ssl: bool) -> Option<HostPort> {
        let port = if ssl {
            self.services.kv_ssl
        } else {
            self.services.kv
        };
        port.map(|p| HostPort::new(self.hostname.clone(), p))
    }

    pub fn mgmt_address(&self, ssl: bool) -> Option<HostPort> {
        let port = if ssl {
            self.services.mgmt_ssl
        } else {
            self.services.mgmt
        };
        port.map(|p| HostPort::new(self.hostname.clone(), p))
    }
}

/// Parsed cluster map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    rev: i64,
    bucket: Option<String>,
    dist: DistMode,
    num_replicas: usize,
    /// Data servers first, in vbucket-map order, then nodes without a data
    /// service
    servers: Vec<ServerInfo>,
    /// Number of leading entries of `servers` that carry the data service
    num_data_servers: usize,
    vbuckets: Vec<Vec<i32>>,
    vbuckets_forward: Option<Vec<Vec<i32>>>,
}

impl ClusterConfig {
    pub fn from_json(text: &str) -> Result<Self, TopologyError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::build(raw)
    }

    fn build(raw: RawConfig) -> Result<Self, TopologyError> {
        let mut nodes = raw.node_descriptors();
        let vbmap = raw.vbucket_server_map;

        let dist = match (raw.node_locator.as_deref(), &vbmap) {
            (Some("ketama"), _) => DistMode::Ketama,
            (_, Some(_)) => DistMode::Vbucket,
            (Some("vbucket"), None) => DistMode::Vbucket,
            _ => DistMode::Ketama,
        };

        let mut servers = Vec::new();
        let mut num_replicas = 0;
        let mut vbuckets = Vec::new();
        let mut vbuckets_forward = None;

        if let Some(map) = vbmap {
            for entry in &map.server_list {
                let addr = HostPort::parse(entry, 11210)
                    .map_err(|_| TopologyError::NoServers)?;
                let pos = nodes
                    .iter()
                    .position(|n| n.hostname == addr.host && n.services.kv == Some(addr.port));
                let server = match pos {
                    Some(ix) => nodes.remove(ix),
                    None => ServerInfo {
                        hostname: addr.host,
                        services: Services {
                            kv: Some(addr.port),
                            ..Services::default()
                        },
                    },
                };
                servers.push(server);
            }
            num_replicas = map.num_replicas;
            vbuckets = map.vbucket_map;
            vbuckets_forward = map.vbucket_map_forward;
        } else {
            // Without a vbucket map every node with a data port serves keys
            let (data, rest): (Vec<_>, Vec<_>) =
                nodes.drain(..).partition(|n| n.services.kv.is_some());
            servers.extend(data);
            nodes = rest;
        }

        let num_data_servers = servers.len();
        servers.extend(nodes);

        if num_data_servers == 0 {
            return Err(TopologyError::NoServers);
        }

        for map in std::iter::once(&vbuckets).chain(vbuckets_forward.iter()) {
            for (vbucket, row) in map.iter().enumerate() {
                for &server in row {
                    if server >= num_data_servers as i32 {
                        return Err(TopologyError::BadVbucketMap {
                            vbucket,
                            server,
                            count: num_data_servers,
                        });
                    }
                }
            }
        }

        Ok(Self {
            rev: raw.rev,
            bucket: raw.name,
            dist,
            num_replicas,
            servers,
            num_data_servers,
            vbuckets,
            vbuckets_forward,
        })
    }

    pub fn rev(&self) -> i64 {
        self.rev
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn dist_mode(&self) -> DistMode {
        self.dist
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Every node, data servers first
    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    pub fn num_data_servers(&self) -> usize {
        self.num_data_servers
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    /// Index of the server owning `vbucket`, if the map assigns one
    pub fn master(&self, vbucket: u16) -> Option<usize> {
        lookup_master(&self.vbuckets, vbucket)
    }

    /// Master in the forward (post-rebalance) map
    pub fn forward_master(&self, vbucket: u16) -> Option<usize> {
        self.vbuckets_forward
            .as_ref()
            .and_then(|map| lookup_master(map, vbucket))
    }

    pub fn data_address(&self, ix: usize, ssl: bool) -> Option<HostPort> {
        self.servers.get(ix).and_then(|s| s.data_address(ssl))
    }

    pub fn mgmt_address(&self, ix: usize, ssl: bool) -> Option<HostPort> {
        self.servers.get(ix).and_then(|s| s.mgmt_address(ssl))
    }

    /// Copy with every placeholder hostname replaced by `host`
    pub fn with_host(&self, host: &str) -> Self {
        let mut copy = self.clone();
        for server in &mut copy.servers {
            if server.hostname == HOST_PLACEHOLDER || server.hostname.is_empty() {
                server.hostname = host.to_string();
            }
        }
        copy
    }
}

fn lookup_master(map: &[Vec<i32>], vbucket: u16) -> Option<usize> {
    let master = *map.get(vbucket as usize)?.first()?;
    usize::try_from(master).ok()
}

/// Parses configuration text into a [`ClusterConfig`]
pub trait ConfigParser {
    fn parse(&self, text: &str) -> Result<ClusterConfig, TopologyError>;
}

/// The JSON format served by the management service
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConfigParser;

impl ConfigParser for JsonConfigParser {
    fn parse(&self, text: &str) -> Result<ClusterConfig, TopologyError> {
        ClusterConfig::from_json(text)
    }
}

/// One generation of cluster configuration
#[derive(Debug, Clone)]
pub struct TopologyDocument {
    pub config: ClusterConfig,
    pub origin: ConfigOrigin,
    /// Per-provider counter at the time this document was parsed
    pub generation: u64,
    /// Host substituted for placeholders, if any
    pub host_substituted: Option<String>,
}

impl TopologyDocument {
    pub fn new(config: ClusterConfig, origin: ConfigOrigin, generation: u64) -> Self {
        Self {
            config,
            origin,
            generation,
            host_substituted: None,
        }
    }

    /// Copy with placeholders replaced by the host it was fetched from
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            config: self.config.with_host(host),
            origin: self.origin,
            generation: self.generation,
            host_substituted: Some(host.to_string()),
        }
    }

    pub fn rev(&self) -> i64 {
        self.config.rev()
    }

    pub fn is_newer_than(&self, other: &TopologyDocument) -> bool {
        self.config.rev() > other.config.rev()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "nodeLocator", default)]
    node_locator: Option<String>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawVbucketMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    /// `host:mgmtport`
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: RawPorts,
}

#[derive(Debug, Default, Deserialize)]
struct RawPorts {
    #[serde(default)]
    direct: Option<u16>,
    #[serde(rename = "sslDirect", default)]
    ssl_direct: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: RawServices,
}

#[derive(Debug, Default, Deserialize)]
struct RawServices {
    #[serde(default)]
    kv: Option<u16>,
    #[serde(rename = "kvSSL", default)]
    kv_ssl: Option<u16>,
    #[serde(default)]
    mgmt: Option<u16>,
    #[serde(rename = "mgmtSSL", default)]
    mgmt_ssl: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawVbucketMap {
    #[serde(rename = "numReplicas", default)]
    num_replicas: usize,
    #[serde(rename = "serverList", default)]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap", default)]
    vbucket_map: Vec<Vec<i32>>,
    #[serde(rename = "vBucketMapForward", default)]
    vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

impl RawConfig {
    /// Node descriptors from `nodesExt` when present, else `nodes`
    fn node_descriptors(&self) -> Vec<ServerInfo> {
        if !self.nodes_ext.is_empty() {
            return self
                .nodes_ext
                .iter()
                .map(|n| ServerInfo {
                    hostname: n
                        .hostname
                        .clone()
                        .unwrap_or_else(|| HOST_PLACEHOLDER.to_string()),
                    services: Services {
                        kv: n.services.kv,
                        kv_ssl: n.services.kv_ssl,
                        mgmt: n.services.mgmt,
                        mgmt_ssl: n.services.mgmt_ssl,
                    },
                })
                .collect();
        }

        self.nodes
            .iter()
            .map(|n| {
                let spec = n.hostname.as_deref().unwrap_or(HOST_PLACEHOLDER);
                let (hostname, mgmt) = match HostPort::parse(spec, 8091) {
                    Ok(hp) => (hp.host, Some(hp.port)),
                    Err(_) => (HOST_PLACEHOLDER.to_string(), Some(8091)),
                };
                ServerInfo {
                    hostname,
                    services: Services {
                        kv: n.ports.direct,
                        kv_ssl: n.ports.ssl_direct,
                        mgmt,
                        mgmt_ssl: None,
                    },
                }
            })
            .collect()
    }
}
