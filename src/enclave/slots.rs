//! Completion slots and duplicate tracking for the request engine.
//!
//! A slot is a single-shot handoff keyed by request id: the waiter holds
//! the receiver, the listener fills the sender exactly once. The seen-LRU
//! remembers recently delivered request ids so the at-least-once transports
//! can never notify a caller twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::protocol::Response;

/// Concurrent map of request id → single-shot completion sender.
#[derive(Debug, Default)]
pub struct Slots {
    inner: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl Slots {
    /// Empty slot map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a request id and return the waiter's receiver.
    ///
    /// Reserving an id twice replaces the first slot; its waiter observes a
    /// closed channel. Ids are 16 random bytes, so this only matters to
    /// hostile callers.
    pub fn reserve(&self, request_id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("slot map lock")
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Hand a response to the waiting slot, removing it.
    ///
    /// Returns `false` when no slot exists (expired or unknown id); the
    /// caller drops the response silently.
    pub fn complete(&self, request_id: &str, response: Response) -> bool {
        let sender = self.inner.lock().expect("slot map lock").remove(request_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove a slot without delivering (timeout or failed publish).
    pub fn cancel(&self, request_id: &str) {
        self.inner.lock().expect("slot map lock").remove(request_id);
    }

    /// Drop every outstanding slot; their waiters observe closure.
    pub fn clear(&self) {
        self.inner.lock().expect("slot map lock").clear();
    }

    /// Number of outstanding slots.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("slot map lock").len()
    }

    /// Whether no slots are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded LRU set of recently seen request ids.
#[derive(Debug)]
pub struct SeenLru {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenLru {
    /// LRU with the given capacity (> 0).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "seen-LRU capacity must be positive");
        Self {
            capacity,
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Whether the id was seen recently.
    pub fn contains(&self, request_id: &str) -> bool {
        self.set.contains(request_id)
    }

    /// Record an id. Returns `true` when it is fresh, `false` on duplicate.
    pub fn observe(&mut self, request_id: &str) -> bool {
        if self.set.contains(request_id) {
            return false;
        }
        if self.set.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(request_id.to_string());
        self.order.push_back(request_id.to_string());
        true
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether nothing was seen yet.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
