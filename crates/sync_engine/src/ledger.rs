use std::collections::{HashSet, VecDeque};

use shared::domain::MessageId;
use tracing::debug;

pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// Insertion-ordered record of applied message ids.
///
/// The ledger is a fast path only. `sweep` drops every entry once the ledger
/// grows past its capacity; redeliveries of an evicted id are still absorbed
/// by the thread store's own id check.
#[derive(Debug, Clone)]
pub struct DedupLedger {
    capacity: usize,
    lookup: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    evictions: u64,
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl DedupLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lookup: HashSet::new(),
            order: VecDeque::new(),
            evictions: 0,
        }
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.lookup.contains(id)
    }

    pub fn record(&mut self, id: MessageId) {
        if self.lookup.insert(id.clone()) {
            self.order.push_back(id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bulk evictions performed so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn ids(&self) -> impl Iterator<Item = &MessageId> {
        self.order.iter()
    }

    /// Clear the ledger if it holds more than `capacity` ids. Returns how
    /// many ids were dropped.
    pub fn sweep(&mut self) -> usize {
        if self.order.len() <= self.capacity {
            return 0;
        }
        let dropped = self.order.len();
        self.lookup.clear();
        self.order.clear();
        self.evictions += 1;
        debug!(dropped, capacity = self.capacity, "ledger: bulk eviction");
        dropped
    }
}
