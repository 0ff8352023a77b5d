//! Optimistic per-frame latch.
//!
//! A 64-bit atomic version whose low bit is the exclusive-held flag. Readers
//! never block: they snapshot the version, read, then recheck. A recheck
//! mismatch (or a failed CAS on upgrade) raises [`Restart`], which every
//! caller propagates to the top of its own operation and retries from
//! there. Acquiring exclusive access spins with bounded backoff rather than
//! blocking.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raised whenever an optimistic reader's snapshot was invalidated, a writer
/// lost a CAS race, or a CIO hand-off forces the caller back to the top of
/// its operation. Never surfaced through the public API: every
/// internal operation catches it and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart;

pub type RResult<T> = std::result::Result<T, Restart>;

/// Maximum spin iterations before widening the exponential backoff delay
/// further is pointless; capped so contended latches don't spin unbounded.
const MAX_SPIN: u32 = 64;

pub struct OptimisticLatch {
    version: AtomicU64,
}

impl OptimisticLatch {
    pub const fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
        }
    }

    /// Snapshot the version, spinning with capped exponential backoff while
    /// a writer holds the exclusive bit. Never mutates state.
    #[inline]
    pub fn optimistic_acquire(&self) -> u64 {
        let mut spin = 1u32;
        loop {
            let v = self.version.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            for _ in 0..spin {
                spin_loop();
            }
            spin = (spin * 2).min(MAX_SPIN);
        }
    }

    /// Reload the version; `Err(Restart)` if it differs from `snapshot`.
    #[inline]
    pub fn recheck(&self, snapshot: u64) -> RResult<()> {
        if self.version.load(Ordering::Acquire) == snapshot {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// Attempt to upgrade an optimistic snapshot to exclusive ownership via
    /// CAS. On success the caller owns the latch and must call
    /// [`Self::release_exclusive`] exactly once.
    #[inline]
    pub fn try_upgrade(&self, snapshot: u64) -> RResult<()> {
        if snapshot & 1 != 0 {
            // A snapshot taken while dirty can never be upgraded.
            return Err(Restart);
        }
        self.version
            .compare_exchange(
                snapshot,
                snapshot | 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| Restart)
    }

    /// Acquire exclusive ownership unconditionally, spinning until no writer
    /// holds the latch and our own CAS wins.
    pub fn acquire_exclusive(&self) -> u64 {
        loop {
            let snapshot = self.optimistic_acquire();
            if self.try_upgrade(snapshot).is_ok() {
                return snapshot;
            }
        }
    }

    /// Release exclusive ownership: bumps the version by one, which both
    /// clears the dirty flag (1 -> 0 in the low bit) and advances the
    /// counter, in a single atomic add.
    #[inline]
    pub fn release_exclusive(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_exclusively_held(&self) -> bool {
        self.version.load(Ordering::Acquire) & 1 == 1
    }
}

impl Default for OptimisticLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for an optimistic read snapshot. Dropping it does nothing;
/// callers must explicitly `recheck`/`validate` before trusting anything
/// derived from the protected state.
pub struct OptimisticGuard<'a> {
    latch: &'a OptimisticLatch,
    snapshot: u64,
}

impl<'a> OptimisticGuard<'a> {
    pub fn new(latch: &'a OptimisticLatch) -> Self {
        let snapshot = latch.optimistic_acquire();
        Self { latch, snapshot }
    }

    #[inline]
    pub fn latch(&self) -> &'a OptimisticLatch {
        self.latch
    }

    #[inline]
    pub fn recheck(&self) -> RResult<()> {
        self.latch.recheck(self.snapshot)
    }

    #[inline]
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Consume the guard, upgrading it to an exclusive hold.
    pub fn try_upgrade(self) -> RResult<ExclusiveGuard<'a>> {
        self.latch.try_upgrade(self.snapshot)?;
        Ok(ExclusiveGuard {
            latch: self.latch,
            released: false,
        })
    }
}

/// RAII guard for exclusive ownership; releases on drop unless
/// [`ExclusiveGuard::release`] was called explicitly (used when a caller
/// needs to hand the latch off across a CIO state transition atomically).
pub struct ExclusiveGuard<'a> {
    latch: &'a OptimisticLatch,
    released: bool,
}

impl<'a> ExclusiveGuard<'a> {
    pub fn acquire(latch: &'a OptimisticLatch) -> Self {
        latch.acquire_exclusive();
        Self {
            latch,
            released: false,
        }
    }

    /// Wrap a latch that a caller has already upgraded via a raw
    /// `try_upgrade` call (e.g. during the page-provider's cooling pass,
    /// where the snapshot being upgraded was taken outside an
    /// [`OptimisticGuard`]) into an RAII guard, so it still releases on drop.
    ///
    /// # Safety
    /// The caller must have just won a `try_upgrade` on `latch` and not yet
    /// released it.
    pub(crate) fn from_already_upgraded(latch: &'a OptimisticLatch) -> Self {
        Self {
            latch,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.latch.release_exclusive();
        self.released = true;
    }
}

impl<'a> Drop for ExclusiveGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.latch.release_exclusive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn optimistic_read_with_no_writers_recheck_succeeds() {
        let latch = OptimisticLatch::new();
        let snap = latch.optimistic_acquire();
        assert!(latch.recheck(snap).is_ok());
    }

    #[test]
    fn concurrent_writer_invalidates_reader_recheck() {
        let latch = OptimisticLatch::new();
        let snap = latch.optimistic_acquire();
        {
            let _g = ExclusiveGuard::acquire(&latch);
        }
        assert!(latch.recheck(snap).is_err());
    }

    #[test]
    fn try_upgrade_fails_against_concurrent_writer() {
        let latch = Arc::new(OptimisticLatch::new());
        let snap = latch.optimistic_acquire();
        let _g = ExclusiveGuard::acquire(&latch);
        assert_eq!(latch.try_upgrade(snap), Err(Restart));
    }

    #[test]
    fn release_bumps_version_and_clears_dirty_bit() {
        let latch = OptimisticLatch::new();
        let before = latch.version();
        {
            let _g = ExclusiveGuard::acquire(&latch);
            assert!(latch.is_exclusively_held());
        }
        assert!(!latch.is_exclusively_held());
        assert_eq!(latch.version(), before + 2);
    }

    #[test]
    fn concurrent_writers_serialize() {
        let latch = Arc::new(OptimisticLatch::new());
        let counter = Arc::new(StdAtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _g = ExclusiveGuard::acquire(&latch);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }
}
