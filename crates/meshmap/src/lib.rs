//! Peer-to-peer replication transport for clustered hash maps.
//!
//! Nodes hold independent copies of one or more logical maps; this crate
//! exchanges per-entry mutations over TCP so every node converges on the
//! most-recent write per key (last-writer-wins by wall-clock timestamp,
//! node identifier as the tie-breaker). A single-threaded non-blocking
//! event loop multiplexes all peer sockets: bidirectional handshake, framed
//! entry records, heartbeats, bandwidth throttling, reconnection with
//! backoff, and channel multiplexing over one socket.
//!
//! The map itself stays outside: callers plug in a [`Replica`] (per-peer
//! change cursors), an [`EntryExternalizable`] (entry bytes in and out of
//! the transport buffers) and receive a [`ModificationNotifier`] to wake
//! the loop on new writes.

mod channel;
mod config;
mod error;
mod replica;
mod replicator;
pub mod tcp;
mod wire;

pub use channel::ChannelReplicator;
pub use config::ReplicationConfig;
pub use error::{ConfigError, ProtocolError, ReplicaError};
pub use replica::{
    ChannelId, EntryCallback, EntryExternalizable, MAX_NODE_ID, MIN_NODE_ID,
    ModificationIterator, ModificationNotifier, NodeId, Replica, SYSTEM_CHANNEL,
    is_valid_node_id,
};
pub use replicator::{ClusterReplicator, TcpReplicator};
pub use tcp::FramedBuf;
