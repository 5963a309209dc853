//! Mailbox office: rendezvous for independently-established side connections
//!
//! One mailbox per siding dial, keyed by [`SessionKey`]. Delivery is accepted
//! only when both id and key match, is non-blocking, and is droppable: a
//! missed delivery is recovered by the dialer's own timeout.

use portside_proto::SessionKey;
use portside_transport::BoxedIo;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Mailbox {
    key: u64,
    slot: mpsc::Sender<BoxedIo>,
}

struct Inner {
    next_id: u64,
    boxes: HashMap<u64, Mailbox>,
}

/// Mutex-guarded mailbox map; critical sections are map mutation only
pub struct Office {
    inner: Mutex<Inner>,
}

impl Office {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                boxes: HashMap::new(),
            }),
        }
    }

    /// Allocate a fresh capability pair: monotonic id, random key
    pub fn allocate_key(&self) -> SessionKey {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        let (key, _) = uuid::Uuid::new_v4().as_u64_pair();
        SessionKey::new(id, key)
    }

    /// Create the one-shot delivery slot for a dial in progress.
    ///
    /// A mailbox already registered under the same session id is stale from a
    /// superseded dial and is evicted; its waiter observes a closed mailbox.
    pub fn create(&self, key: SessionKey) -> mpsc::Receiver<BoxedIo> {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().unwrap();
        if inner.boxes.contains_key(&key.id) {
            debug!("evicting stale mailbox for session {}", key.id);
        }
        inner.boxes.insert(
            key.id,
            Mailbox {
                key: key.key,
                slot: tx,
            },
        );
        rx
    }

    /// Deliver a side connection to its waiter.
    ///
    /// Returns false when there is no mailbox for the id, the key does not
    /// match, or nobody can receive; the connection is dropped in that case.
    pub fn deliver(&self, key: SessionKey, io: BoxedIo) -> bool {
        let mailbox = {
            let mut inner = self.inner.lock().unwrap();
            match inner.boxes.get(&key.id) {
                Some(mailbox) if mailbox.key == key.key => inner.boxes.remove(&key.id),
                Some(_) => {
                    debug!("rejected delivery for session {}: key mismatch", key.id);
                    return false;
                }
                None => {
                    trace!("no mailbox for session {}", key.id);
                    return false;
                }
            }
        };
        match mailbox {
            Some(mailbox) => mailbox.slot.try_send(io).is_ok(),
            None => false,
        }
    }

    /// Destroy a mailbox whose dial resolved or timed out
    pub fn remove(&self, id: u64) {
        self.inner.lock().unwrap().boxes.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Office {
    fn default() -> Self {
        Self::new()
    }
}
