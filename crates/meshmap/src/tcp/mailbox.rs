use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use mio::Waker;
use tracing::debug;

use crate::replica::{ModificationNotifier, NodeId};

/// Lock-free signal from arbitrary producer threads to the event loop,
/// requesting a WRITE re-arm on a peer.
///
/// One bit per identifier. A producer sets the identifier bit, then the
/// dirty flag, then wakes the poll; the consumer swaps the flag before the
/// words, so a signal can at worst be observed twice, never lost.
pub(crate) struct WriteMailbox {
    words: [AtomicU64; 2],
    dirty: AtomicBool,
    waker: Arc<Waker>,
}

impl WriteMailbox {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            words: [AtomicU64::new(0), AtomicU64::new(0)],
            dirty: AtomicBool::new(false),
            waker,
        }
    }

    /// Any thread.
    pub(crate) fn post(&self, id: NodeId) {
        let word = (id as usize) / 64;
        let bit = (id as usize) % 64;
        if word >= self.words.len() {
            return;
        }
        self.words[word].fetch_or(1 << bit, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            // Benign during shutdown.
            debug!(?err, "mailbox wake failed");
        }
    }

    /// Event-loop thread only.
    pub(crate) fn drain<F>(&self, mut f: F)
    where
        F: FnMut(NodeId),
    {
        if !self.dirty.swap(false, Ordering::Acquire) {
            return;
        }
        for (wi, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                f((wi * 64 + bit) as NodeId);
            }
        }
    }
}

/// The notifier handed to a replica for one peer: posts that peer's
/// identifier to the mailbox.
pub(crate) struct ChangeNotifier {
    id: NodeId,
    mailbox: Arc<WriteMailbox>,
}

impl ChangeNotifier {
    pub(crate) fn new(id: NodeId, mailbox: Arc<WriteMailbox>) -> Self {
        Self { id, mailbox }
    }
}

impl ModificationNotifier for ChangeNotifier {
    #[inline]
    fn on_change(&self) {
        self.mailbox.post(self.id);
    }
}
