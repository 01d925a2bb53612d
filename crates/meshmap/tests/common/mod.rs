//! Shared harness: an in-memory last-writer-wins map wired into the
//! replication traits, plus polling helpers.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use meshmap::{
    ChannelId, EntryCallback, EntryExternalizable, FramedBuf, ModificationIterator,
    ModificationNotifier, NodeId, Replica, ReplicaError,
};

#[derive(Clone)]
struct EntryState {
    value: String,
    ts: u64,
    origin: NodeId,
}

struct PeerQueue {
    pending: VecDeque<Vec<u8>>,
    notifier: Arc<dyn ModificationNotifier>,
}

struct MapInner {
    entries: Mutex<BTreeMap<String, EntryState>>,
    peers: Mutex<HashMap<NodeId, PeerQueue>>,
}

/// In-memory LWW map. Local puts are queued per acquired peer; remote
/// entries apply under the newest-timestamp / highest-identifier discipline.
#[derive(Clone)]
pub struct TestMap {
    id: NodeId,
    inner: Arc<MapInner>,
}

impl TestMap {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            inner: Arc::new(MapInner {
                entries: Mutex::new(BTreeMap::new()),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn put(&self, key: &str, value: &str) {
        self.put_at(key, value, now_ms());
    }

    pub fn put_at(&self, key: &str, value: &str, ts: u64) {
        let entry = EntryState { value: value.to_owned(), ts, origin: self.id };
        self.inner.entries.lock().unwrap().insert(key.to_owned(), entry.clone());
        let frame = encode_entry(key, &entry);
        let notifiers: Vec<Arc<dyn ModificationNotifier>> = {
            let mut peers = self.inner.peers.lock().unwrap();
            for queue in peers.values_mut() {
                queue.pending.push_back(frame.clone());
            }
            peers.values().map(|queue| Arc::clone(&queue.notifier)).collect()
        };
        for notifier in notifiers {
            notifier.on_change();
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.entries.lock().unwrap().get(key).map(|entry| entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn origin_of(&self, key: &str) -> Option<NodeId> {
        self.inner.entries.lock().unwrap().get(key).map(|entry| entry.origin)
    }
}

struct MapCursor {
    remote: NodeId,
    inner: Arc<MapInner>,
}

impl ModificationIterator for MapCursor {
    fn has_next(&mut self) -> bool {
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(&self.remote)
            .is_some_and(|queue| !queue.pending.is_empty())
    }

    fn next_entry(
        &mut self,
        callback: &mut dyn EntryCallback,
        channel: ChannelId,
    ) -> Result<bool, ReplicaError> {
        let frame = self
            .inner
            .peers
            .lock()
            .unwrap()
            .get_mut(&self.remote)
            .and_then(|queue| queue.pending.pop_front());
        match frame {
            Some(frame) => callback.on_entry(&frame, channel),
            None => Ok(false),
        }
    }

    fn dirty_entries(&mut self, since_ms: u64) -> Result<(), ReplicaError> {
        let frames: Vec<Vec<u8>> = {
            let entries = self.inner.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, entry)| entry.ts >= since_ms && entry.origin != self.remote)
                .map(|(key, entry)| encode_entry(key, entry))
                .collect()
        };
        let mut peers = self.inner.peers.lock().unwrap();
        if let Some(queue) = peers.get_mut(&self.remote) {
            queue.pending.clear();
            queue.pending.extend(frames);
        }
        Ok(())
    }
}

impl Replica for TestMap {
    fn identifier(&self) -> NodeId {
        self.id
    }

    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Result<Box<dyn ModificationIterator>, ReplicaError> {
        let mut peers = self.inner.peers.lock().unwrap();
        peers
            .entry(remote)
            .and_modify(|queue| queue.notifier = Arc::clone(&notifier))
            .or_insert_with(|| PeerQueue { pending: VecDeque::new(), notifier });
        Ok(Box::new(MapCursor { remote, inner: Arc::clone(&self.inner) }))
    }

    fn last_modification_time(&self, remote: NodeId) -> u64 {
        self.inner
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.origin == remote)
            .map(|entry| entry.ts)
            .max()
            .unwrap_or(0)
    }

    fn close(&self) {}
}

impl EntryExternalizable for TestMap {
    fn write_external_entry(
        &self,
        entry: &[u8],
        dst: &mut FramedBuf,
        _channel: ChannelId,
    ) -> Result<(), ReplicaError> {
        dst.put_slice(entry);
        Ok(())
    }

    fn read_external_entry(&self, entry: &[u8]) -> Result<(), ReplicaError> {
        let (key, incoming) = decode_entry(entry)?;
        let mut entries = self.inner.entries.lock().unwrap();
        let apply = match entries.get(&key) {
            Some(current) => {
                incoming.ts > current.ts
                    || (incoming.ts == current.ts && incoming.origin > current.origin)
            }
            None => true,
        };
        if apply {
            entries.insert(key, incoming);
        }
        Ok(())
    }
}

/// `[origin u8][ts u64][key len u16][key][value len u16][value]`, big-endian.
fn encode_entry(key: &str, entry: &EntryState) -> Vec<u8> {
    let mut frame = Vec::with_capacity(13 + key.len() + entry.value.len());
    frame.push(entry.origin);
    frame.extend_from_slice(&entry.ts.to_be_bytes());
    frame.extend_from_slice(&(key.len() as u16).to_be_bytes());
    frame.extend_from_slice(key.as_bytes());
    frame.extend_from_slice(&(entry.value.len() as u16).to_be_bytes());
    frame.extend_from_slice(entry.value.as_bytes());
    frame
}

fn decode_entry(frame: &[u8]) -> Result<(String, EntryState), ReplicaError> {
    let malformed = || ReplicaError::new("malformed test entry");
    let (&origin, rest) = frame.split_first().ok_or_else(malformed)?;
    let (ts, rest) = split_u64(rest).ok_or_else(malformed)?;
    let (key, rest) = split_chunk(rest).ok_or_else(malformed)?;
    let (value, rest) = split_chunk(rest).ok_or_else(malformed)?;
    if !rest.is_empty() {
        return Err(malformed());
    }
    let key = String::from_utf8(key.to_vec()).map_err(|_| malformed())?;
    let value = String::from_utf8(value.to_vec()).map_err(|_| malformed())?;
    Ok((key, EntryState { value, ts, origin }))
}

fn split_u64(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let (head, rest) = bytes.split_at_checked(8)?;
    Some((u64::from_be_bytes(head.try_into().ok()?), rest))
}

fn split_chunk(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = bytes.split_at_checked(2)?;
    let len = u16::from_be_bytes(len.try_into().ok()?) as usize;
    rest.split_at_checked(len)
}

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// Grabs a free loopback port by binding to 0 and dropping the listener.
pub fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("couldn't probe for a free port");
    listener.local_addr().expect("listener has no addr")
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn await_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
