//! Fan-in of N logical channels into one transport stream.
//!
//! Each user channel is a `(Replica, EntryExternalizable)` pair in a slot
//! table; channel 0 is a synthetic per-peer FIFO carrying control payloads.
//! On the wire every multiplexed entry is prefixed with its stop-bit-encoded
//! channel id. Registering a channel announces it to every known peer so the
//! peer can replay that channel's backlog from the last timestamp we
//! observed.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
};

use tracing::{debug, warn};

use crate::{
    error::{ConfigError, ProtocolError, ReplicaError},
    replica::{
        ChannelId, EntryCallback, EntryExternalizable, ModificationIterator,
        ModificationNotifier, NodeId, Replica, SYSTEM_CHANNEL,
    },
    tcp::FramedBuf,
    wire::{BOOTSTRAP_MARKER, push_stop_bit, put_stop_bit, read_stop_bit},
};

type SharedIter = Arc<Mutex<Box<dyn ModificationIterator>>>;

#[derive(Clone)]
struct ChannelSlot {
    replica: Arc<dyn Replica>,
    ext: Arc<dyn EntryExternalizable>,
}

struct Slots {
    slots: Vec<Option<ChannelSlot>>,
    /// Bumped on every registration; composite iterators refresh lazily.
    generation: u64,
}

/// Per-peer state: the system FIFO, the transport's notifier for that peer
/// and one shared child iterator per registered channel.
struct PeerHub {
    remote: NodeId,
    system: Mutex<VecDeque<Vec<u8>>>,
    notifier: Mutex<Option<Arc<dyn ModificationNotifier>>>,
    children: Mutex<HashMap<ChannelId, SharedIter>>,
}

impl PeerHub {
    fn new(remote: NodeId) -> Self {
        Self {
            remote,
            system: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self) {
        if let Some(notifier) = self.notifier.lock().expect("poisoned").as_ref() {
            notifier.on_change();
        }
    }

    fn push_system(&self, payload: Vec<u8>) {
        self.system.lock().expect("poisoned").push_back(payload);
        self.notify();
    }
}

struct MuxShared {
    max_channels: usize,
    inner: RwLock<Slots>,
    peers: Mutex<HashMap<NodeId, Arc<PeerHub>>>,
}

impl MuxShared {
    fn hub(&self, remote: NodeId) -> Arc<PeerHub> {
        let mut peers = self.peers.lock().expect("poisoned");
        Arc::clone(peers.entry(remote).or_insert_with(|| Arc::new(PeerHub::new(remote))))
    }

    fn slot(&self, channel: ChannelId) -> Option<ChannelSlot> {
        let inner = self.inner.read().expect("poisoned");
        inner.slots.get(channel as usize).and_then(|slot| slot.clone())
    }

    /// The cached child iterator for `(peer, channel)`, created on first
    /// use. Children are shared so a bootstrap re-prime targets the same
    /// cursor the outbound pump drains.
    fn ensure_child(
        &self,
        hub: &PeerHub,
        channel: ChannelId,
        slot: &ChannelSlot,
    ) -> Option<SharedIter> {
        let mut children = hub.children.lock().expect("poisoned");
        if let Some(existing) = children.get(&channel) {
            return Some(Arc::clone(existing));
        }
        let notifier = hub.notifier.lock().expect("poisoned").clone()?;
        match slot.replica.acquire_modification_iterator(hub.remote, notifier) {
            Ok(iter) => {
                let shared: SharedIter = Arc::new(Mutex::new(iter));
                children.insert(channel, Arc::clone(&shared));
                Some(shared)
            }
            Err(err) => {
                warn!(remote = hub.remote, channel, %err, "couldn't acquire channel iterator");
                None
            }
        }
    }
}

/// Multiplexes an arbitrary number of logical maps over one replication
/// socket set. Implements [`Replica`] and [`EntryExternalizable`] so the
/// transport drives it like a single map.
#[derive(Clone)]
pub struct ChannelReplicator {
    local_id: NodeId,
    shared: Arc<MuxShared>,
}

impl ChannelReplicator {
    pub fn new(local_id: NodeId, max_channels: usize) -> Self {
        Self {
            local_id,
            shared: Arc::new(MuxShared {
                max_channels,
                inner: RwLock::new(Slots { slots: vec![None; max_channels], generation: 0 }),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn local_identifier(&self) -> NodeId {
        self.local_id
    }

    /// Registers a user channel. Every known peer is sent a bootstrap
    /// announcement carrying the timestamp we last observed from it on this
    /// channel, so it can replay the missing backlog.
    ///
    /// The stop-bit channel prefix counts against the configured max entry
    /// size; externalizers must leave it that headroom.
    pub fn add_channel(
        &self,
        channel: ChannelId,
        replica: Arc<dyn Replica>,
        ext: Arc<dyn EntryExternalizable>,
    ) -> Result<(), ConfigError> {
        let max = self.shared.max_channels;
        if channel == SYSTEM_CHANNEL || (channel as usize) >= max {
            return Err(ConfigError::ChannelOutOfRange { channel, max });
        }
        {
            let mut inner = self.shared.inner.write().expect("poisoned");
            let slot = &mut inner.slots[channel as usize];
            if slot.is_some() {
                return Err(ConfigError::ChannelOccupied(channel));
            }
            *slot = Some(ChannelSlot { replica: Arc::clone(&replica), ext });
            inner.generation += 1;
        }
        let hubs: Vec<Arc<PeerHub>> =
            self.shared.peers.lock().expect("poisoned").values().cloned().collect();
        for hub in hubs {
            let since = replica.last_modification_time(hub.remote);
            hub.push_system(bootstrap_payload(self.local_id, channel, since));
        }
        Ok(())
    }

    fn read_system_message(&self, mut src: &[u8]) -> Result<(), ReplicaError> {
        let Some((&marker, rest)) = src.split_first() else {
            return Err(ProtocolError::MalformedSystemMessage.into());
        };
        src = rest;
        if marker != BOOTSTRAP_MARKER {
            return Err(ProtocolError::MalformedSystemMessage.into());
        }
        let Some((&sender, rest)) = src.split_first() else {
            return Err(ProtocolError::MalformedSystemMessage.into());
        };
        src = rest;
        let channel = read_stop_bit(&mut src)?;
        let since: [u8; 8] = src
            .try_into()
            .map_err(|_| ReplicaError::from(ProtocolError::MalformedSystemMessage))?;
        let since = u64::from_be_bytes(since);
        if channel > u64::from(u16::MAX) {
            return Err(ProtocolError::MalformedSystemMessage.into());
        }
        let channel = channel as ChannelId;

        let Some(slot) = self.shared.slot(channel) else {
            // We'll announce ourselves when this channel is registered here;
            // the peer replays to us then.
            debug!(sender, channel, "bootstrap for unregistered channel dropped");
            return Ok(());
        };
        let hub = self.shared.hub(sender);
        if let Some(child) = self.shared.ensure_child(&hub, channel, &slot) {
            child.lock().expect("poisoned").dirty_entries(since)?;
            hub.notify();
        }
        Ok(())
    }
}

impl Replica for ChannelReplicator {
    fn identifier(&self) -> NodeId {
        self.local_id
    }

    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Result<Box<dyn ModificationIterator>, ReplicaError> {
        let hub = self.shared.hub(remote);
        *hub.notifier.lock().expect("poisoned") = Some(notifier);
        Ok(Box::new(PeerMux {
            shared: Arc::clone(&self.shared),
            hub,
            seen_generation: 0,
            children: Vec::new(),
        }))
    }

    /// Minimum across occupied channels: the handshake-time replay must not
    /// skip any channel's backlog.
    fn last_modification_time(&self, remote: NodeId) -> u64 {
        let inner = self.shared.inner.read().expect("poisoned");
        inner
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.replica.last_modification_time(remote))
            .min()
            .unwrap_or(0)
    }

    fn close(&self) {}
}

impl EntryExternalizable for ChannelReplicator {
    fn write_external_entry(
        &self,
        entry: &[u8],
        dst: &mut FramedBuf,
        channel: ChannelId,
    ) -> Result<(), ReplicaError> {
        let mark = dst.write_pos();
        put_stop_bit(dst, u64::from(channel));
        if channel == SYSTEM_CHANNEL {
            dst.put_slice(entry);
            return Ok(());
        }
        let Some(slot) = self.shared.slot(channel) else {
            dst.rewind_write(mark);
            return Err(ProtocolError::UnknownChannel(channel).into());
        };
        let after_prefix = dst.write_pos();
        slot.ext.write_external_entry(entry, dst, channel)?;
        if dst.write_pos() == after_prefix {
            // Child declined; drop the dangling prefix as well.
            dst.rewind_write(mark);
        }
        Ok(())
    }

    fn read_external_entry(&self, entry: &[u8]) -> Result<(), ReplicaError> {
        let mut src = entry;
        let channel = read_stop_bit(&mut src)?;
        if channel > u64::from(u16::MAX) {
            debug!(channel, "entry with out-of-range channel dropped");
            return Ok(());
        }
        let channel = channel as ChannelId;
        if channel == SYSTEM_CHANNEL {
            return self.read_system_message(src);
        }
        match self.shared.slot(channel) {
            Some(slot) => slot.ext.read_external_entry(src),
            None => {
                debug!(channel, "entry for unregistered channel dropped");
                Ok(())
            }
        }
    }
}

/// Composite per-peer iterator: the system FIFO first, then every occupied
/// channel in ascending id order. Newly registered channels are picked up on
/// the next call via the generation counter.
struct PeerMux {
    shared: Arc<MuxShared>,
    hub: Arc<PeerHub>,
    seen_generation: u64,
    children: Vec<(ChannelId, SharedIter)>,
}

impl PeerMux {
    fn refresh(&mut self) {
        let generation = self.shared.inner.read().expect("poisoned").generation;
        if generation == self.seen_generation {
            return;
        }
        let slots: Vec<(ChannelId, ChannelSlot)> = {
            let inner = self.shared.inner.read().expect("poisoned");
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(chan, slot)| slot.clone().map(|s| (chan as ChannelId, s)))
                .collect()
        };
        let mut children = Vec::with_capacity(slots.len());
        for (channel, slot) in slots {
            if let Some(child) = self.shared.ensure_child(&self.hub, channel, &slot) {
                children.push((channel, child));
            }
        }
        self.children = children;
        self.seen_generation = generation;
    }
}

impl ModificationIterator for PeerMux {
    fn has_next(&mut self) -> bool {
        self.refresh();
        if !self.hub.system.lock().expect("poisoned").is_empty() {
            return true;
        }
        self.children.iter().any(|(_, child)| child.lock().expect("poisoned").has_next())
    }

    fn next_entry(
        &mut self,
        callback: &mut dyn EntryCallback,
        _channel: ChannelId,
    ) -> Result<bool, ReplicaError> {
        self.refresh();
        let system = self.hub.system.lock().expect("poisoned").pop_front();
        if let Some(payload) = system {
            return callback.on_entry(&payload, SYSTEM_CHANNEL);
        }
        for (channel, child) in &self.children {
            let mut child = child.lock().expect("poisoned");
            if child.has_next() {
                return child.next_entry(callback, *channel);
            }
        }
        Ok(false)
    }

    fn dirty_entries(&mut self, since_ms: u64) -> Result<(), ReplicaError> {
        self.refresh();
        for (_, child) in &self.children {
            child.lock().expect("poisoned").dirty_entries(since_ms)?;
        }
        self.hub.notify();
        Ok(())
    }
}

fn bootstrap_payload(sender: NodeId, channel: ChannelId, since_ms: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.push(BOOTSTRAP_MARKER);
    payload.push(sender);
    push_stop_bit(&mut payload, u64::from(channel));
    payload.extend_from_slice(&since_ms.to_be_bytes());
    payload
}
