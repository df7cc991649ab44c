//! Cluster topology
//!
//! This module provides:
//! - Bootstrap host lists
//! - Cluster configuration documents and their parser
//! - The server-provided error map
//! - vbucket master guessing after redirects
//! - The configuration monitor providers report to

pub mod errmap;
pub mod hostlist;
pub mod monitor;
pub mod topology;
pub mod vbguess;

pub use errmap::{ErrorAttribute, ErrorInfo, ErrorMap, RetrySpec, RetryStrategy};
pub use hostlist::{HostPort, Hostlist};
pub use monitor::{ConfigMonitor, Confmon, MonitorEvent, RefreshPolicy};
pub use topology::{
    ClusterConfig, ConfigOrigin, ConfigParser, DistMode, JsonConfigParser, ServerInfo, Services,
    TopologyDocument, HOST_PLACEHOLDER,
};
pub use vbguess::VbGuess;
