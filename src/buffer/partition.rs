//! A cache-line-isolated shard of the buffer pool.
//!
//! Each partition owns a `FreeList` (synchronized independently — lock-free
//! on the push side) and a mutex-guarded pair of (CIO table, cooling queue)
//! that are always mutated together. Partition selection uses the low
//! `partition_bits` bits of the page id.

use parking_lot::Mutex;

use crate::buffer::cio::{CioTable, CoolingQueue};
use crate::buffer::free_list::{FreeList, NextLinks};
use crate::common::PageId;

/// Everything that must change atomically with respect to other partition
/// operations: CIO entries and the cooling queue they reference. Removing
/// a cooling-queue entry always removes the CIO entry under the same
/// mutex.
#[derive(Default)]
pub struct PartitionState {
    pub cio: CioTable,
    pub cooling: CoolingQueue,
}

pub struct Partition {
    pub id: usize,
    pub free_list: FreeList,
    state: Mutex<PartitionState>,
}

impl Partition {
    pub fn new(id: usize, next_links: NextLinks) -> Self {
        Self {
            id,
            free_list: FreeList::new(next_links),
            state: Mutex::new(PartitionState::default()),
        }
    }

    /// Lock the CIO table + cooling queue together. The partition mutex
    /// must always be released before any blocking device I/O: callers
    /// must drop the returned guard before issuing a read or waiting on a
    /// per-entry mutex.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, PartitionState> {
        self.state.lock()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn cooling_count(&self) -> usize {
        self.state.lock().cooling.len()
    }
}

/// Maps a page id to its owning partition index using the low
/// `partition_bits` bits.
#[inline]
pub fn partition_of(page_id: PageId, partition_bits: u32) -> usize {
    let mask = (1u64 << partition_bits) - 1;
    (page_id & mask) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_of_uses_low_bits() {
        assert_eq!(partition_of(0b1011, 2), 0b11);
        assert_eq!(partition_of(0b1000, 3), 0b000);
    }
}
