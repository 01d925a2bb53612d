use std::sync::Arc;

use crate::{error::ReplicaError, tcp::FramedBuf};

/// One-byte node identifier, valid range `[1, 127]`.
pub type NodeId = u8;

/// Logical stream multiplexed over one socket. Channel 0 is reserved for
/// in-band control messages.
pub type ChannelId = u16;

pub const MIN_NODE_ID: NodeId = 1;
pub const MAX_NODE_ID: NodeId = 127;
pub const SYSTEM_CHANNEL: ChannelId = 0;

#[inline]
pub fn is_valid_node_id(id: u8) -> bool {
    (MIN_NODE_ID..=MAX_NODE_ID).contains(&id)
}

/// Wakes the transport when new dirty entries exist for a particular peer.
///
/// Called from whichever thread mutated the map; must be cheap and
/// non-blocking.
pub trait ModificationNotifier: Send + Sync {
    fn on_change(&self);
}

/// Receiver side of [`ModificationIterator::next_entry`].
pub trait EntryCallback {
    /// Returns `Ok(false)` when the entry was declined (nothing was staged).
    fn on_entry(&mut self, entry: &[u8], channel: ChannelId) -> Result<bool, ReplicaError>;
}

/// Per-peer lazy cursor over locally modified entries not yet transmitted to
/// that peer.
pub trait ModificationIterator: Send {
    fn has_next(&mut self) -> bool;

    /// Passes the next dirty entry to `callback` with `channel` as the
    /// discriminator. Returns `Ok(true)` iff the callback was invoked
    /// exactly once.
    fn next_entry(
        &mut self,
        callback: &mut dyn EntryCallback,
        channel: ChannelId,
    ) -> Result<bool, ReplicaError>;

    /// Re-primes the cursor from every entry modified at or after `since_ms`.
    /// Issuing this twice yields the same outbound entry set.
    fn dirty_entries(&mut self, since_ms: u64) -> Result<(), ReplicaError>;
}

/// A locally held copy of one replicated map.
pub trait Replica: Send + Sync {
    /// This node's identifier, in `[1, 127]`.
    fn identifier(&self) -> NodeId;

    /// Cursor over entries destined for `remote`. The `notifier` must be
    /// invoked whenever new dirty entries appear for that peer.
    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Result<Box<dyn ModificationIterator>, ReplicaError>;

    /// Most recent wall-clock timestamp observed from `remote`, in epoch ms.
    /// Zero when nothing has been observed yet.
    fn last_modification_time(&self, remote: NodeId) -> u64;

    fn close(&self);
}

/// Writes and reads one entry's bytes to and from the transport buffers.
///
/// The entry payload layout is opaque to the transport.
pub trait EntryExternalizable: Send + Sync {
    /// Stages `entry` into `dst` at its current write position. Writing
    /// nothing declines the entry; the transport rewinds the frame. An
    /// implementation must never stage more than the configured max entry
    /// size.
    fn write_external_entry(
        &self,
        entry: &[u8],
        dst: &mut FramedBuf,
        channel: ChannelId,
    ) -> Result<(), ReplicaError>;

    /// Consumes exactly one entry. `entry` covers the frame payload and
    /// nothing else.
    fn read_external_entry(&self, entry: &[u8]) -> Result<(), ReplicaError>;
}
