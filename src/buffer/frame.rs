//! `BufferFrame`: one slot of the DRAM pool.
//!
//! Atomic page id and pin-style metadata sit next to a page-aligned
//! payload, guarded by a lock-free [`OptimisticLatch`] rather than a
//! `parking_lot::RwLock`. The state machine
//! (`FREE`/`HOT`/`COLD`/`LOADED`), the "cooled because of reading" flag,
//! and `last_written_lsn` track exactly what the eviction pipeline and the
//! swip-resolution fast/slow paths need to agree on.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::buffer::latch::OptimisticLatch;
use crate::buffer::page::Page;
use crate::common::{PageId, INVALID_PAGE_ID};

/// The four states a frame cycles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Not holding a page; sits on exactly one partition's `FreeList`.
    Free = 0,
    /// Holds a page reachable through exactly one swizzled swip.
    Hot = 1,
    /// Holds a page sitting in exactly one partition's cooling queue.
    Cold = 2,
    /// Transient: mid page-in, only ever observed inside a swip-resolution
    /// critical section. Not encoded on the frame itself — callers track it
    /// through the CIO entry's `READING` state instead, since the frame's
    /// own state only needs to flip straight from `Free` to `Hot` once the
    /// device read completes and the parent swip is rewired. Kept here only
    /// to document the lifecycle a frame conceptually passes through.
    Loaded = 3,
}

impl FrameState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FrameState::Free,
            1 => FrameState::Hot,
            2 => FrameState::Cold,
            3 => FrameState::Loaded,
            _ => unreachable!("invalid frame state byte"),
        }
    }
}

pub struct BufferFrame {
    /// Index of this frame in the DRAM pool's backing `Vec`.
    frame_id: u32,

    /// Per-frame optimistic latch protecting both the header fields below
    /// and the page payload.
    pub latch: OptimisticLatch,

    /// Page id held by this frame; `INVALID_PAGE_ID` (0) when `FREE`.
    page_id: AtomicU64,

    state: AtomicU8,

    dirty: AtomicBool,
    writeback: AtomicBool,

    /// Set when this frame was pushed into the cooling queue because a
    /// page-in worker lost the race to rewire the parent swip. Phases
    /// 2 and 3 skip frames with this flag set; only a later successful
    /// resolve clears it.
    cooled_because_of_reading: AtomicBool,

    last_written_lsn: AtomicU64,

    /// Data-structure type tag stamped on this frame's page, used to route
    /// `find_parent`/`iterate_child_swips` calls to the right registered
    /// `DTRegistry`. Defaults to
    /// [`crate::buffer::dtr::DEFAULT_TYPE_TAG`].
    type_tag: AtomicU8,

    page: UnsafeCell<Page>,
}

unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

impl BufferFrame {
    pub fn new(frame_id: u32, page_size: usize, alignment: usize) -> Self {
        Self {
            frame_id,
            latch: OptimisticLatch::new(),
            page_id: AtomicU64::new(INVALID_PAGE_ID),
            state: AtomicU8::new(FrameState::Free as u8),
            dirty: AtomicBool::new(false),
            writeback: AtomicBool::new(false),
            cooled_because_of_reading: AtomicBool::new(false),
            last_written_lsn: AtomicU64::new(0),
            type_tag: AtomicU8::new(crate::buffer::dtr::DEFAULT_TYPE_TAG),
            page: UnsafeCell::new(Page::new(page_size, alignment)),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub fn is_writeback(&self) -> bool {
        self.writeback.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_writeback(&self, value: bool) {
        self.writeback.store(value, Ordering::Release);
    }

    #[inline]
    pub fn cooled_because_of_reading(&self) -> bool {
        self.cooled_because_of_reading.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_cooled_because_of_reading(&self, value: bool) {
        self.cooled_because_of_reading.store(value, Ordering::Release);
    }

    #[inline]
    pub fn last_written_lsn(&self) -> u64 {
        self.last_written_lsn.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_last_written_lsn(&self, lsn: u64) {
        self.last_written_lsn.store(lsn, Ordering::Release);
    }

    /// Read access to the page payload. Safe as long as the caller holds at
    /// least an optimistic snapshot and rechecks the latch afterwards, or
    /// holds exclusive ownership — the same contract `Swip` documents.
    ///
    /// # Safety
    /// The caller must not retain the reference past the point where it
    /// re-validates the latch (optimistic case) and must not alias it with a
    /// concurrent `&mut` from `page_mut` (exclusive case enforces this by
    /// construction since callers only ever get `page_mut` under
    /// `ExclusiveGuard`).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page(&self) -> &Page {
        &*self.page.get()
    }

    /// # Safety
    /// Caller must hold exclusive ownership of this frame's latch.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self) -> &mut Page {
        &mut *self.page.get()
    }

    #[inline]
    pub fn type_tag(&self) -> crate::buffer::dtr::DataStructureTypeId {
        self.type_tag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_type_tag(&self, tag: crate::buffer::dtr::DataStructureTypeId) {
        self.type_tag.store(tag, Ordering::Release);
    }

    /// Reset a frame back to its just-allocated shape before handing it to
    /// `allocate_page` or after a page-in: header initialized with LSN 0
    /// and magic set to the page id.
    pub fn reinit_for(&self, page_id: PageId) {
        self.set_page_id(page_id);
        self.set_dirty(false);
        self.set_writeback(false);
        self.set_cooled_because_of_reading(false);
        self.set_last_written_lsn(0);
        self.set_type_tag(crate::buffer::dtr::DEFAULT_TYPE_TAG);
        unsafe { self.page_mut().init_header(page_id) };
    }
}
