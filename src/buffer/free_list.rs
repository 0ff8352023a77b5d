//! Per-partition free-frame list.
//!
//! A Treiber stack of frame ids. `push` is always lock-free (a bare CAS on
//! the head, tagged with a counter to dodge ABA); `pop` spins with bounded
//! backoff until a frame appears; `try_pop` is the single-attempt variant
//! callers already holding the partition mutex use, signalling [`Restart`]
//! on an empty list so the caller can retry after dropping contention
//! rather than spin while holding the mutex. The tagged-counter CAS
//! technique here is the same one the optimistic latch's version word
//! uses to dodge ABA.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::latch::Restart;

pub const NIL: u32 = u32::MAX;

fn pack(frame_id: u32, counter: u32) -> u64 {
    ((counter as u64) << 32) | frame_id as u64
}

fn unpack(bits: u64) -> (u32, u32) {
    (bits as u32, (bits >> 32) as u32)
}

/// Shared `next`-pointer array, one slot per frame in the whole DRAM pool.
/// A frame is linked into exactly one partition's list at a time, so
/// sharing this array across partitions is safe: only the partition
/// currently owning a frame ever touches its slot.
pub type NextLinks = Arc<Vec<AtomicU32>>;

pub fn new_next_links(num_frames: usize) -> NextLinks {
    Arc::new((0..num_frames).map(|_| AtomicU32::new(NIL)).collect())
}

pub struct FreeList {
    head: AtomicU64,
    next: NextLinks,
}

impl FreeList {
    pub fn new(next: NextLinks) -> Self {
        Self {
            head: AtomicU64::new(pack(NIL, 0)),
            next,
        }
    }

    /// Lock-free push; safe to call even when the caller already owns
    /// `frame_id` exclusively.
    pub fn push(&self, frame_id: u32) {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (old_head, counter) = unpack(old);
            self.next[frame_id as usize].store(old_head, Ordering::Release);
            let new = pack(frame_id, counter.wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    /// Single-attempt pop. `Err(Restart)` if the list is empty at the
    /// moment of the attempt; callers typically already hold the partition
    /// mutex and should retry after releasing contention.
    pub fn try_pop(&self) -> Result<u32, Restart> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (old_head, counter) = unpack(old);
            if old_head == NIL {
                return Err(Restart);
            }
            let new_head = self.next[old_head as usize].load(Ordering::Acquire);
            let new = pack(new_head, counter.wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(old_head);
            }
            spin_loop();
        }
    }

    /// Blocking pop: spins with bounded backoff until a frame is available.
    /// Used directly by `resolve`'s true-miss path.
    pub fn pop(&self) -> u32 {
        let mut spin = 1u32;
        loop {
            match self.try_pop() {
                Ok(id) => return id,
                Err(Restart) => {
                    for _ in 0..spin {
                        spin_loop();
                    }
                    spin = (spin * 2).min(64);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let (head, _) = unpack(self.head.load(Ordering::Acquire));
        head == NIL
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let (mut cur, _) = unpack(self.head.load(Ordering::Acquire));
        while cur != NIL {
            count += 1;
            cur = self.next[cur as usize].load(Ordering::Acquire);
        }
        count
    }
}
