//! Swizzled/unswizzled page references.
//!
//! A `Swip` is a tagged 64-bit word: bit 63 set means "unswizzled" and the
//! remaining 63 bits are a [`PageId`]; bit 63 clear means "swizzled" and the
//! word is the address of a [`BufferFrame`]. Frame addresses never set bit
//! 63 on current 64-bit platforms (the DRAM pool is a single allocation well
//! below the top of the address space), so the tag bit never collides with
//! a legitimate address.
//!
//! Uses the same tagged-bit encoding technique the optimistic latch applies
//! to its version word, adapted here to distinguish a page id from a frame
//! pointer instead of a version from a lock-held flag.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::frame::BufferFrame;
use crate::common::PageId;

const UNSWIZZLED_TAG: u64 = 1 << 63;

/// A tagged reference to a page: either a page id (unswizzled) or a direct
/// pointer to the [`BufferFrame`] holding it (swizzled).
///
/// Interior mutability is required because the fast path dereferences a
/// `Swip` without holding any lock — resolving a swizzled swip returns the
/// referenced frame unlatched; all *writes* to a swip's bits must
/// happen under the exclusive latch of the page containing it, or under the
/// owning partition's mutex together with exclusive latch on the referencing
/// frame during eviction.
pub struct Swip {
    bits: AtomicU64,
}

impl Swip {
    pub fn from_page_id(page_id: PageId) -> Self {
        assert_eq!(page_id & UNSWIZZLED_TAG, 0, "page id must fit in 63 bits");
        Self {
            bits: AtomicU64::new(page_id | UNSWIZZLED_TAG),
        }
    }

    pub fn from_frame(frame: *const BufferFrame) -> Self {
        let addr = frame as u64;
        assert_eq!(addr & UNSWIZZLED_TAG, 0, "frame address collides with swip tag bit");
        Self {
            bits: AtomicU64::new(addr),
        }
    }

    #[inline]
    pub fn is_swizzled(&self) -> bool {
        self.bits.load(Ordering::Acquire) & UNSWIZZLED_TAG == 0
    }

    /// Load the raw bits for a single, consistent read (used by callers that
    /// need to act on one snapshot rather than re-reading the atomic twice).
    #[inline]
    pub fn load(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_swizzled_bits(bits: u64) -> bool {
        bits & UNSWIZZLED_TAG == 0
    }

    #[inline]
    pub fn page_id_from_bits(bits: u64) -> PageId {
        debug_assert!(!Self::is_swizzled_bits(bits));
        bits & !UNSWIZZLED_TAG
    }

    #[inline]
    pub fn frame_from_bits(bits: u64) -> *const BufferFrame {
        debug_assert!(Self::is_swizzled_bits(bits));
        bits as *const BufferFrame
    }

    /// Only valid when `is_swizzled()`; caller must uphold the frame's
    /// lifetime (it is never deallocated, only recycled through the free
    /// list — every `BufferFrame` is created once at startup).
    #[inline]
    pub fn as_frame(&self) -> *const BufferFrame {
        Self::frame_from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Only valid when `!is_swizzled()`.
    #[inline]
    pub fn as_page_id(&self) -> PageId {
        Self::page_id_from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Rewrite this swip to point directly at `frame`. Caller must hold the
    /// required exclusive latch(es) per the module doc.
    #[inline]
    pub fn swizzle(&self, frame: *const BufferFrame) {
        let addr = frame as u64;
        debug_assert_eq!(addr & UNSWIZZLED_TAG, 0);
        self.bits.store(addr, Ordering::Release);
    }

    /// Rewrite this swip back to a page id. Caller must hold the required
    /// exclusive latch(es) per the module doc.
    #[inline]
    pub fn unswizzle(&self, page_id: PageId) {
        debug_assert_eq!(page_id & UNSWIZZLED_TAG, 0);
        self.bits.store(page_id | UNSWIZZLED_TAG, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unswizzled_round_trips_page_id() {
        let swip = Swip::from_page_id(1234);
        assert!(!swip.is_swizzled());
        assert_eq!(swip.as_page_id(), 1234);
    }

    #[test]
    fn swizzle_then_unswizzle() {
        let swip = Swip::from_page_id(7);
        let fake_frame = 0x1000 as *const BufferFrame;
        swip.swizzle(fake_frame);
        assert!(swip.is_swizzled());
        assert_eq!(swip.as_frame(), fake_frame);
        swip.unswizzle(7);
        assert!(!swip.is_swizzled());
        assert_eq!(swip.as_page_id(), 7);
    }
}
