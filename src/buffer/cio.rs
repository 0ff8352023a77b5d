//! CIO (cool/in-progress) side table and cooling queue.
//!
//! Per partition, the CIO hash table tracks pages that are either being
//! loaded (`READING`) or already cold and sitting in the cooling queue
//! (`COOLING`). Both the table and the queue are only ever touched under the
//! owning `Partition`'s mutex (see `buffer::partition`), so this module does
//! not need any internal synchronization of its own — it is a plain data
//! structure the partition serializes access to.
//!
//! Tracks exactly two phases a page can be in outside the free list or a
//! swizzled swip: being read in from the device, or sitting cold in the
//! cooling queue waiting on a parent rewrite.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CioState {
    /// A worker is performing a blocking device read into `frame_id`.
    Reading,
    /// `frame_id` is cold, sitting in the cooling queue.
    Cooling,
}

pub struct CioEntry {
    pub state: CioState,
    pub frame_id: u32,
    /// Held by the inserting reader for the duration of the device read;
    /// other workers that find this entry lock-then-immediately-unlock it to
    /// block until the read finishes. The entry is only ever removed by its
    /// own inserter (on completion or on conversion to `Cooling`), so no
    /// separate waiters-count is needed: every blocked waiter simply
    /// restarts and re-reads the CIO table once unblocked.
    pub entry_mutex: Arc<Mutex<()>>,
}

impl CioEntry {
    pub fn new_reading(frame_id: u32, entry_mutex: Arc<Mutex<()>>) -> Self {
        Self {
            state: CioState::Reading,
            frame_id,
            entry_mutex,
        }
    }

    pub fn new_cooling(frame_id: u32) -> Self {
        Self {
            state: CioState::Cooling,
            frame_id,
            entry_mutex: Arc::new(Mutex::new(())),
        }
    }
}

/// FIFO of cold frame ids, oldest first. Removal from the middle is O(n)
/// in the number of cold frames in
/// this partition, which is bounded by `cool_pct * N / partitions_count` —
/// acceptably small, and simpler than hand-rolling a stable-iterator
/// intrusive list for a side table that is always mutated under the
/// partition mutex anyway.
#[derive(Default)]
pub struct CoolingQueue {
    order: std::collections::VecDeque<u32>,
}

impl CoolingQueue {
    pub fn push_back(&mut self, frame_id: u32) {
        self.order.push_back(frame_id);
    }

    pub fn remove(&mut self, frame_id: u32) {
        if let Some(pos) = self.order.iter().position(|&id| id == frame_id) {
            self.order.remove(pos);
        }
    }

    pub fn front(&self) -> Option<u32> {
        self.order.front().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate oldest-to-newest, since both eviction phases must always
    /// flush or free the longest-cooling pages first.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.iter().copied()
    }
}

/// The CIO table proper: page id -> in-flight/cold entry.
#[derive(Default)]
pub struct CioTable {
    entries: HashMap<PageId, CioEntry>,
}

impl CioTable {
    pub fn get(&self, page_id: PageId) -> Option<&CioEntry> {
        self.entries.get(&page_id)
    }

    pub fn get_mut(&mut self, page_id: PageId) -> Option<&mut CioEntry> {
        self.entries.get_mut(&page_id)
    }

    pub fn insert(&mut self, page_id: PageId, entry: CioEntry) {
        self.entries.insert(page_id, entry);
    }

    pub fn remove(&mut self, page_id: PageId) -> Option<CioEntry> {
        self.entries.remove(&page_id)
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.entries.contains_key(&page_id)
    }
}
