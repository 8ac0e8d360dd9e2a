//! Sequence-numbered, content-addressed message store.
//!
//! Messages are keyed two ways: by content key for dedup and by a strictly
//! monotonic sequence number for ranged reads. Eviction is FIFO by sequence
//! number and driven by three limits (count, total payload bytes, age);
//! newer messages are never dropped while older ones survive. A fresh uuid
//! on every flush lets clients detect that the store restarted.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::net::wire::RelayMessage;

pub const DEFAULT_MAX_COUNT: usize = 100_000;
pub const DEFAULT_MAX_SIZE: usize = 100_000_000;
// artificially low for testing
pub const DEFAULT_MAX_AGE: u64 = 300;

/// Outcome of an [`Storage::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    pub seq: u64,
    /// False when a message with the same content key was already stored.
    pub created: bool,
}

/// Store identity and live sequence bounds, as reported to HTTP clients.
/// The bounds are omitted when the store is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreState {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub least: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greatest: Option<u64>,
}

pub struct Storage {
    max_count: usize,
    max_size: usize,
    max_age: u64,
    uuid: Uuid,
    // least_sequence_number == 0 encodes "no messages"
    least_sequence_number: u64,
    next_sequence_number: u64,
    by_key: HashMap<String, u64>,
    by_sequence_number: BTreeMap<u64, RelayMessage>,
    seen_by_id: HashMap<String, HashSet<String>>,
    size: usize,
}

impl Storage {
    pub fn new(max_count: usize, max_size: usize, max_age: u64) -> Self {
        assert!(max_count > 0);
        assert!(max_size > 0);
        Self {
            max_count,
            max_size,
            max_age,
            uuid: Uuid::new_v4(),
            least_sequence_number: 0,
            next_sequence_number: 1,
            by_key: HashMap::new(),
            by_sequence_number: BTreeMap::new(),
            seen_by_id: HashMap::new(),
            size: 0,
        }
    }

    /// Discard everything and take on a new identity.
    pub fn flush(&mut self) {
        self.uuid = Uuid::new_v4();
        self.least_sequence_number = 0;
        self.next_sequence_number = 1;
        self.by_key.clear();
        self.by_sequence_number.clear();
        self.seen_by_id.clear();
        self.size = 0;
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn least_sequence_number(&self) -> u64 {
        self.least_sequence_number
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.by_sequence_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sequence_number.is_empty()
    }

    /// Insert a message unless its content key is already present. Duplicates
    /// leave the store untouched and report the existing sequence number.
    pub fn add(&mut self, mut message: RelayMessage, now: u64) -> AddResult {
        if let Some(&seq) = self.by_key.get(message.key()) {
            return AddResult { seq, created: false };
        }
        let seq = self.next_sequence_number;
        self.next_sequence_number += 1;
        if self.least_sequence_number == 0 {
            // first message since the store was last empty
            self.least_sequence_number = seq;
        }
        message.sequence_number = seq;
        message.timestamp = now;
        self.size += message.size();
        self.by_key.insert(message.key().to_string(), seq);
        self.by_sequence_number.insert(seq, message);
        self.purge(now);
        AddResult { seq, created: true }
    }

    pub fn get_by_sequence_number(&self, sequence_number: u64) -> Option<&RelayMessage> {
        self.by_sequence_number.get(&sequence_number)
    }

    pub fn get_by_key(&self, key: &str) -> Option<&RelayMessage> {
        self.by_key
            .get(key)
            .and_then(|seq| self.by_sequence_number.get(seq))
    }

    pub fn contains(&self, message: &RelayMessage) -> bool {
        self.by_key.contains_key(message.key())
    }

    /// Resolve whether a duplicate message still needs to be flooded,
    /// recording the flood when it happens. A message whose stored broadcast
    /// flag is already set has been relayed before and is never re-flooded.
    pub fn claim_broadcast(&mut self, seq: u64, incoming_broadcast: bool) -> bool {
        match self.by_sequence_number.get_mut(&seq) {
            Some(existing) if existing.broadcast => false,
            Some(existing) if incoming_broadcast => {
                existing.broadcast = true;
                true
            }
            _ => false,
        }
    }

    /// Everything this listener has not yet been handed, oldest first. The
    /// returned keys are remembered so each message reaches a listener at
    /// most once.
    pub fn messages_for_id(&mut self, listener_id: &str) -> Vec<RelayMessage> {
        let seen = self.seen_by_id.entry(listener_id.to_string()).or_default();
        let mut messages = Vec::new();
        for message in self.by_sequence_number.values() {
            if seen.insert(message.key().to_string()) {
                messages.push(message.clone());
            }
        }
        messages
    }

    /// Live messages in `[first, first + count)`, skipping eviction gaps.
    /// `first == 0` means "from the least live sequence number".
    pub fn get_range(&self, first: u64, count: u64) -> Vec<(u64, RelayMessage)> {
        let first = if first == 0 {
            self.least_sequence_number
        } else {
            first
        };
        let end = first.saturating_add(count).min(self.next_sequence_number);
        if first >= end {
            return Vec::new();
        }
        self.by_sequence_number
            .range(first..end)
            .map(|(seq, message)| (*seq, message.clone()))
            .collect()
    }

    pub fn state(&self) -> StoreState {
        if self.least_sequence_number > 0 {
            StoreState {
                uuid: self.uuid,
                least: Some(self.least_sequence_number),
                greatest: Some(self.next_sequence_number - 1),
            }
        } else {
            StoreState {
                uuid: self.uuid,
                least: None,
                greatest: None,
            }
        }
    }

    fn next_to_purge(&self, now: u64) -> Option<u64> {
        if self.least_sequence_number == 0 {
            return None;
        }
        let message = self
            .by_sequence_number
            .get(&self.least_sequence_number)?;
        let age = now.saturating_sub(message.timestamp);
        if self.by_sequence_number.len() > self.max_count
            || self.size > self.max_size
            || age > self.max_age
        {
            Some(self.least_sequence_number)
        } else {
            None
        }
    }

    /// Evict least-sequence messages while any limit is exceeded.
    pub fn purge(&mut self, now: u64) {
        while let Some(seq) = self.next_to_purge(now) {
            let message = match self.by_sequence_number.remove(&seq) {
                Some(m) => m,
                None => break,
            };
            self.least_sequence_number = seq + 1;
            debug_assert!(self.least_sequence_number <= self.next_sequence_number);
            if self.least_sequence_number == self.next_sequence_number {
                // restore the "empty" state
                self.least_sequence_number = 0;
            }
            self.by_key.remove(message.key());
            for seen in self.seen_by_id.values_mut() {
                seen.remove(message.key());
            }
            match self.size.checked_sub(message.size()) {
                Some(size) => self.size = size,
                None => {
                    warn!("store size underflow while evicting {}", message.key());
                    self.size = 0;
                }
            }
        }
        debug_assert!(self.least_sequence_number < self.next_sequence_number);
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COUNT, DEFAULT_MAX_SIZE, DEFAULT_MAX_AGE)
    }
}
