//! Data node connections
//!
//! - Pending request packets and the per-channel pending collection
//! - The node channel state machine (read loop, status handling, draining)
//! - The node set routing requests to channels by vbucket

pub mod channel;
pub mod node_set;
pub mod packet;
pub mod pipeline;

pub use channel::{ChannelEnv, ChannelState, NodeChannel, Response};
pub use node_set::NodeSet;
pub use packet::{Packet, PacketFlags};
pub use pipeline::PendingQueue;
