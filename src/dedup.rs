//! Bounded record of recently processed event ids.
//!
//! One instance lives per session at the hub and one per follower. The record
//! is strict FIFO by receipt order: once more than `capacity` ids have been
//! accepted, the oldest are forgotten and a late retransmit of one of them
//! would be processed again. That is acceptable; delivery is at-least-once.

use std::collections::{HashMap, VecDeque};

use crate::event::{EventId, EventKind};
use crate::frame::{self, AckStatus, Data};

/// Record bound for each hub session.
pub const HUB_CAPACITY: usize = 50;
/// Record bound for each follower.
pub const FOLLOWER_CAPACITY: usize = 20;

/// Outcome of checking one event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First sighting; the id is now recorded.
    Accepted,
    /// The id (or its hedge twin) was already processed.
    Duplicate,
    /// A hedge copy whose original was already processed.
    DuplicateHedge,
}

impl Verdict {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }

    #[must_use]
    pub fn ack_status(self) -> AckStatus {
        match self {
            Self::Accepted => AckStatus::Broadcasted,
            Self::Duplicate => AckStatus::Duplicate,
            Self::DuplicateHedge => AckStatus::DuplicateBackup,
        }
    }
}

/// What was recorded for an accepted id.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub kind: Option<EventKind>,
    pub payload: Data,
    /// Receipt time, milliseconds since Unix epoch.
    pub received_at: i64,
}

impl DedupEntry {
    #[must_use]
    pub fn new(kind: Option<EventKind>, payload: Data) -> Self {
        Self { kind, payload, received_at: frame::now_ms() }
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    capacity: usize,
    entries: HashMap<EventId, DedupEntry>,
    order: VecDeque<EventId>,
}

impl Deduplicator {
    /// A zero capacity is raised to one so the latest id is always known.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: HashMap::with_capacity(capacity + 1), order: VecDeque::with_capacity(capacity + 1) }
    }

    /// Check `id` and record it if it has not been seen.
    ///
    /// A hedge is never recorded when its original is known. An original that
    /// arrives after its hedge was accepted is a duplicate too, so either
    /// arrival order yields exactly one acceptance.
    pub fn check(&mut self, id: &EventId, is_hedge: bool, entry: DedupEntry) -> Verdict {
        if is_hedge {
            if let Some(original) = id.original() {
                if self.entries.contains_key(&original) {
                    return Verdict::DuplicateHedge;
                }
            }
        }
        if self.entries.contains_key(id) {
            return Verdict::Duplicate;
        }
        if !is_hedge && self.entries.contains_key(&id.hedge()) {
            return Verdict::Duplicate;
        }

        self.entries.insert(id.clone(), entry);
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        Verdict::Accepted
    }

    /// Boolean form of [`check`](Self::check) for callers that keep no payload.
    pub fn should_process(&mut self, id: &EventId, is_hedge: bool) -> bool {
        self.check(id, is_hedge, DedupEntry::new(None, Data::new())).is_accepted()
    }

    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<&DedupEntry> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Recorded ids, oldest first.
    pub fn ids(&self) -> impl Iterator<Item = &EventId> {
        self.order.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
#[path = "dedup_test.rs"]
mod tests;
