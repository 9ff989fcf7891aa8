//! Bounded, deduplicated message history.

use crate::{Message, Seqno};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Number of messages kept when no other limit is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Received messages, newest first.
///
/// Position is acceptance order: index 0 is the message accepted most
/// recently, regardless of anything inside the message. No two entries share
/// a [`Seqno`], and the ledger never grows past its capacity.
#[derive(Debug, Clone)]
pub struct MessageLedger {
    entries: VecDeque<Arc<Message>>,
    seen: HashSet<Seqno>,
    capacity: usize,
}

impl Default for MessageLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LIMIT)
    }
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger holding at most `capacity` messages (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_LIMIT)),
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Insert `msg` at the front unless its seqno is already held.
    ///
    /// Returns `false` without touching the ledger for a duplicate. On
    /// accept, the oldest entries are dropped until the capacity holds.
    pub fn try_insert(&mut self, msg: Message) -> bool {
        if self.seen.contains(msg.seqno()) {
            return false;
        }

        self.seen.insert(msg.seqno().clone());
        self.entries.push_front(Arc::new(msg));

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                self.seen.remove(evicted.seqno());
            }
        }
        true
    }

    pub fn contains(&self, seqno: &Seqno) -> bool {
        self.seen.contains(seqno)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.entries.get(index).map(Arc::as_ref)
    }

    /// Messages from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(Arc::as_ref)
    }

    /// Shared newest-first view, as handed to observers. Messages are not
    /// copied.
    pub fn view(&self) -> Arc<[Arc<Message>]> {
        self.entries.iter().cloned().collect()
    }
}
