//! The buffer manager itself: DRAM pool, partitions, and the
//! allocate/resolve/reclaim operations built on top of them.
//!
//! Owns the frame arena, the partitions, and the device handle, and
//! exposes allocate/resolve/flush as its public surface. Pages are reached
//! through pointers (`Swip`) embedded in an external data structure rather
//! than through a hash map this crate owns, so the core of this module is
//! the swizzled-swip resolution state machine rather than a page-table
//! lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::buffer::cio::{CioEntry, CioState};
use crate::buffer::dtr::{DTRegistry, DataStructureTypeId, DtId, DtRegistryTable};
use crate::buffer::frame::{BufferFrame, FrameState};
use crate::buffer::free_list::new_next_links;
use crate::buffer::latch::{ExclusiveGuard, OptimisticGuard, Restart};
use crate::buffer::partition::{partition_of, Partition};
use crate::buffer::provider::PageProviderPool;
use crate::buffer::swip::Swip;
use crate::common::PageId;
use crate::config::BufferManagerConfig;
use crate::error::{BufferError, Result};
use crate::storage::disk::DiskManager;

/// Point-in-time counters surfaced for operators/tests. Metrics collection
/// proper is an external concern; this is just enough to observe behavior
/// without standing up a metrics exporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferManagerStats {
    pub pages_allocated: u64,
    pub resolves_fast_path: u64,
    pub resolves_slow_path: u64,
    pub restarts: u64,
    pub frames_cooled: u64,
    pub frames_flushed: u64,
    pub frames_reclaimed: u64,
}

#[derive(Default)]
struct AtomicStats {
    pages_allocated: AtomicU64,
    resolves_fast_path: AtomicU64,
    resolves_slow_path: AtomicU64,
    restarts: AtomicU64,
    frames_cooled: AtomicU64,
    frames_flushed: AtomicU64,
    frames_reclaimed: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> BufferManagerStats {
        BufferManagerStats {
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            resolves_fast_path: self.resolves_fast_path.load(Ordering::Relaxed),
            resolves_slow_path: self.resolves_slow_path.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            frames_cooled: self.frames_cooled.load(Ordering::Relaxed),
            frames_flushed: self.frames_flushed.load(Ordering::Relaxed),
            frames_reclaimed: self.frames_reclaimed.load(Ordering::Relaxed),
        }
    }
}

pub struct BufferManager {
    pub(crate) config: BufferManagerConfig,
    pub(crate) frames: Vec<BufferFrame>,
    pub(crate) partitions: Vec<Partition>,
    pub(crate) disk: Arc<DiskManager>,
    /// Default registry consulted for frames whose type tag has no more
    /// specific entry in `dtr_table`; most deployments register exactly one
    /// indexing structure and never touch the table below.
    pub(crate) dtr: Arc<dyn DTRegistry>,
    /// The full registry-of-registries (`register_data_structure_type` /
    /// `register_instance`).
    pub(crate) dtr_table: DtRegistryTable,
    stats: AtomicStats,
    page_providers: parking_lot::Mutex<Option<PageProviderPool>>,
}

impl BufferManager {
    pub fn new(config: BufferManagerConfig, dtr: Arc<dyn DTRegistry>) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::open(&config)?);
        let alignment = disk.alignment();

        let frame_count = ((config.dram_gib * (1u64 << 30) as f64)
            / std::mem::size_of::<BufferFrame>() as f64) as usize;
        let frame_count = frame_count.max(config.partitions_count());

        let frames: Vec<BufferFrame> = (0..frame_count)
            .map(|i| BufferFrame::new(i as u32, config.page_size, alignment))
            .collect();

        let next_links = new_next_links(frame_count);
        let partitions: Vec<Partition> = (0..config.partitions_count())
            .map(|id| Partition::new(id, next_links.clone()))
            .collect();

        // Seed every partition's free list with its share of frames
        // round-robin; frames are not otherwise bound to a partition — a
        // page's governing partition is determined solely by
        // `partition_of(page_id)`.
        for (i, frame) in frames.iter().enumerate() {
            partitions[i % partitions.len()].free_list.push(frame.frame_id());
        }

        info!(
            frame_count,
            partitions = partitions.len(),
            page_size = config.page_size,
            "buffer manager initialized"
        );

        Ok(Self {
            config,
            frames,
            partitions,
            disk,
            dtr,
            dtr_table: DtRegistryTable::new(),
            stats: AtomicStats::default(),
            page_providers: parking_lot::Mutex::new(None),
        })
    }

    /// Register the vtable used for every page tagged `type_tag`.
    /// `type_tag` 0 ([`crate::buffer::dtr::DEFAULT_TYPE_TAG`]) is the
    /// registry supplied to [`Self::new`]; register a different tag to let
    /// several indexing structures share one buffer manager.
    pub fn register_data_structure_type(
        &self,
        type_tag: DataStructureTypeId,
        registry: Arc<dyn DTRegistry>,
    ) {
        self.dtr_table.register_data_structure_type(type_tag, registry);
    }

    /// Record a named instance of a registered type rooted at `root`. Does
    /// not tag any frame itself; callers are expected to call
    /// [`BufferFrame::set_type_tag`] on the root's frame once it is resident.
    pub fn register_instance(
        &self,
        type_tag: DataStructureTypeId,
        root: PageId,
        name: impl Into<String>,
    ) -> DtId {
        self.dtr_table.register_instance(type_tag, root, name)
    }

    /// The root page id recorded for `dt_id`, if [`Self::register_instance`]
    /// was called with it.
    pub fn dt_instance_root(&self, dt_id: DtId) -> Option<PageId> {
        self.dtr_table.instance_root(dt_id)
    }

    /// The name recorded for `dt_id`, if [`Self::register_instance`] was
    /// called with it.
    pub fn dt_instance_name(&self, dt_id: DtId) -> Option<String> {
        self.dtr_table.instance_name(dt_id)
    }

    /// The registry to consult for `frame`: its own type tag's entry if one
    /// was registered, otherwise the default supplied to [`Self::new`].
    pub(crate) fn registry_for(&self, frame: &BufferFrame) -> Arc<dyn DTRegistry> {
        self.dtr_table
            .lookup(frame.type_tag())
            .unwrap_or_else(|| self.dtr.clone())
    }

    /// Start the background page-provider agents. A manager with
    /// no page providers running still serves `allocate_page`/`resolve_swip`
    /// correctly; it just never cools, flushes, or reclaims frames on its
    /// own, which is useful for tests that drive eviction manually.
    pub fn start_page_providers(self: &Arc<Self>) {
        let mut slot = self.page_providers.lock();
        if slot.is_none() {
            *slot = Some(PageProviderPool::start(self.clone()));
        }
    }

    /// Stop background agents (if running) and flush remaining dirty pages.
    /// Recovery itself is out of scope. Idempotent: calling this twice, or
    /// on a manager that never started providers, is a no-op the second
    /// time.
    pub fn flush_and_stop(&self) {
        if let Some(pool) = self.page_providers.lock().take() {
            pool.flush_and_stop();
        }
    }

    /// Return an exclusively-latched, logically-deleted frame straight to
    /// its partition's free list, bypassing the cooling queue, and release
    /// the guard. The caller (the data-structure layer) must already have
    /// unlinked every swip that referenced this page — reusing the device
    /// page id is out of scope, so this only recycles the in-memory frame.
    pub fn reclaim_page(&self, frame_id: u32, guard: ExclusiveGuard<'_>) {
        let frame = &self.frames[frame_id as usize];
        let page_id = frame.page_id();
        frame.set_dirty(false);
        frame.set_writeback(false);
        frame.set_state(FrameState::Free);
        self.disk.note_freed_page();
        guard.release();

        let partition = &self.partitions[partition_of(page_id, self.config.partition_bits)];
        partition.free_list.push(frame_id);
        self.stats.frames_reclaimed.fetch_add(1, Ordering::Relaxed);
        trace!(page_id, frame_id, "page reclaimed directly by caller");
    }

    pub fn config(&self) -> &BufferManagerConfig {
        &self.config
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn partitions_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn stats(&self) -> BufferManagerStats {
        self.stats.snapshot()
    }

    /// Look up a frame by its stable id. Used by external data-structure
    /// registries (which only ever see frame ids, e.g. through
    /// [`crate::buffer::dtr::ParentHandle::parent_frame_id`]) to get back a
    /// `&BufferFrame`, and by tests/benches driving the manager directly.
    pub fn frame(&self, frame_id: u32) -> &BufferFrame {
        &self.frames[frame_id as usize]
    }

    /// Allocate a brand-new page. The returned handle holds the
    /// frame's latch exclusively; callers write initial content through
    /// [`AllocatedPage::payload_mut`] and must call [`AllocatedPage::finish`]
    /// (or simply drop the handle, which releases the latch for them).
    pub fn allocate_page(&self) -> AllocatedPage<'_> {
        self.allocate_page_tagged(crate::buffer::dtr::DEFAULT_TYPE_TAG)
    }

    /// Like [`Self::allocate_page`], but stamps the frame with `type_tag` up
    /// front so phase 1's `find_parent`/`iterate_child_swips` calls route to
    /// the matching registered [`DTRegistry`] immediately, rather than the
    /// default.
    pub fn allocate_page_tagged(&self, type_tag: DataStructureTypeId) -> AllocatedPage<'_> {
        let partitions = self.partitions.len();
        // Start from a random partition so concurrent allocators spread out
        // across free lists instead of piling onto one.
        let start = {
            use rand::Rng;
            rand::rng().random_range(0..partitions)
        };
        let mut frame_id = None;
        // Try every partition's free list once, starting from the random
        // pick above, before blocking on the first one - spreads allocation
        // load without pinning it to a single partition under pressure.
        for offset in 0..partitions {
            let idx = (start + offset) % partitions;
            if let Ok(id) = self.partitions[idx].free_list.try_pop() {
                frame_id = Some(id);
                break;
            }
        }
        let frame_id = frame_id.unwrap_or_else(|| self.partitions[start % partitions].free_list.pop());

        let page_id = self.disk.allocate_page_id(self.frames.len());
        let frame = &self.frames[frame_id as usize];
        frame.reinit_for(page_id);
        frame.set_type_tag(type_tag);
        frame.set_state(FrameState::Hot);
        let guard = ExclusiveGuard::acquire(&frame.latch);

        self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
        trace!(page_id, frame_id, "allocated page");

        AllocatedPage {
            manager: self,
            frame_id,
            page_id,
            guard: Some(guard),
        }
    }

    /// Resolve `swip` to the frame it (now) points to, swizzling it in if
    /// necessary. `parent` is the caller's already-held
    /// optimistic guard over the page containing `swip`; it is used to
    /// validate that `swip`'s value is still trustworthy and, on the slow
    /// path, to safely rewrite it. Internal `Restart`s are retried
    /// transparently; they never escape this call.
    pub fn resolve_swip(&self, parent: &OptimisticGuard<'_>, swip: &Swip) -> Result<u32> {
        loop {
            let attempt = OptimisticGuard::new(parent.latch());
            match self.try_resolve(attempt, swip) {
                Ok(frame_id) => return Ok(frame_id),
                Err(RestartOrIo::Restart) => {
                    self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(RestartOrIo::Io(err)) => return Err(BufferError::Io(err)),
            }
        }
    }

    fn try_resolve(&self, parent: OptimisticGuard<'_>, swip: &Swip) -> std::result::Result<u32, RestartOrIo> {
        let bits = swip.load();

        if Swip::is_swizzled_bits(bits) {
            let frame_id = unsafe { (*Swip::frame_from_bits(bits)).frame_id() };
            parent.recheck()?;
            self.stats.resolves_fast_path.fetch_add(1, Ordering::Relaxed);
            return Ok(frame_id);
        }

        self.stats.resolves_slow_path.fetch_add(1, Ordering::Relaxed);
        let page_id = Swip::page_id_from_bits(bits);

        let bits_idx = partition_of(page_id, self.config.partition_bits);
        let partition = &self.partitions[bits_idx];

        // Armed up front in case this worker turns out to be the one that
        // must issue the device read. Locking it here, before the partition
        // mutex, means that if we do win the miss below, the READING entry
        // goes into the CIO table already blocking waiters in the same
        // critical section that inserts it.
        let own_entry_mutex = Arc::new(parking_lot::Mutex::new(()));
        let own_reader_lock = own_entry_mutex.lock();

        enum SlowAction {
            WaitReading(Arc<parking_lot::Mutex<()>>),
            Cooling(u32),
            StartLoad(u32),
        }

        let action = {
            let mut guard = partition.lock();
            // The parent recheck, the CIO occupancy check, the free-frame
            // pop and the READING insert all happen under this single
            // critical section, so two workers racing on the same absent
            // page id can never both pop a frame and both insert a READING
            // entry for it.
            parent.recheck()?;
            match guard.cio.get(page_id) {
                Some(entry) if entry.state == CioState::Reading => {
                    SlowAction::WaitReading(entry.entry_mutex.clone())
                }
                Some(entry) if entry.state == CioState::Cooling => {
                    SlowAction::Cooling(entry.frame_id)
                }
                Some(_) => unreachable!("CIO entry in a state other than Reading/Cooling"),
                None => {
                    let frame_id = partition.free_list.try_pop()?;
                    guard.cio.insert(
                        page_id,
                        CioEntry::new_reading(frame_id, own_entry_mutex.clone()),
                    );
                    SlowAction::StartLoad(frame_id)
                }
            }
        };

        match action {
            SlowAction::WaitReading(entry_mutex) => {
                drop(own_reader_lock);
                let blocked = entry_mutex.lock();
                drop(blocked);
                Err(RestartOrIo::Restart)
            }
            SlowAction::Cooling(frame_id) => {
                drop(own_reader_lock);
                self.rescue_cooling_frame(parent, partition, page_id, frame_id, swip)
            }
            SlowAction::StartLoad(frame_id) => {
                self.load_absent_page(parent, partition, page_id, swip, frame_id, own_reader_lock)
            }
        }
    }

    /// "Present, COOLING": pull a still-resident cold page back to hot
    /// without touching the device.
    fn rescue_cooling_frame(
        &self,
        parent: OptimisticGuard<'_>,
        partition: &Partition,
        page_id: PageId,
        frame_id: u32,
        swip: &Swip,
    ) -> std::result::Result<u32, RestartOrIo> {
        let parent_ex = parent
            .try_upgrade()
            .map_err(|_| RestartOrIo::Restart)?;

        {
            let mut guard = partition.lock();
            match guard.cio.get(page_id) {
                Some(entry) if entry.state == CioState::Cooling && entry.frame_id == frame_id => {
                    guard.cooling.remove(frame_id);
                    guard.cio.remove(page_id);
                }
                _ => {
                    // Someone else already rescued or replaced this entry.
                    drop(guard);
                    parent_ex.release();
                    return Err(RestartOrIo::Restart);
                }
            }
        }

        let frame = &self.frames[frame_id as usize];
        let frame_ex = ExclusiveGuard::acquire(&frame.latch);
        frame.set_state(FrameState::Hot);
        frame.set_cooled_because_of_reading(false);
        swip.swizzle(frame as *const BufferFrame);
        frame_ex.release();
        parent_ex.release();

        Ok(frame_id)
    }

    /// "Absent": true miss, issue a synchronous device read. `frame_id` was
    /// already popped from the free list and a READING entry already
    /// inserted for it under the partition mutex in `try_resolve`;
    /// `reader_lock` is that entry's mutex, already held by us, and stays
    /// locked until the page-in is resolved one way or another so
    /// concurrent waiters in the "Present, READING" branch block until
    /// we're done.
    fn load_absent_page(
        &self,
        parent: OptimisticGuard<'_>,
        partition: &Partition,
        page_id: PageId,
        swip: &Swip,
        frame_id: u32,
        reader_lock: parking_lot::MutexGuard<'_, ()>,
    ) -> std::result::Result<u32, RestartOrIo> {
        let frame = &self.frames[frame_id as usize];
        let frame_ex = ExclusiveGuard::acquire(&frame.latch);
        frame.reinit_for(page_id);
        let read_result = self.disk.read_page(page_id, unsafe { frame.page_mut() });

        if let Err(err) = read_result {
            // Undo the reservation and surface a real I/O error; this is the
            // one path through resolve() that is allowed to fail outright
            // rather than restart, since retrying a broken device won't help.
            frame_ex.release();
            {
                let mut guard = partition.lock();
                guard.cio.remove(page_id);
            }
            partition.free_list.push(frame_id);
            drop(reader_lock);
            return Err(RestartOrIo::Io(err));
        }

        if !frame.page().verify_magic(page_id) && frame.page().magic() != 0 {
            frame_ex.release();
            {
                let mut guard = partition.lock();
                guard.cio.remove(page_id);
            }
            partition.free_list.push(frame_id);
            drop(reader_lock);
            return Err(RestartOrIo::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                BufferError::Corrupt(page_id),
            )));
        }

        match parent.try_upgrade() {
            Ok(parent_ex) => {
                frame.set_state(FrameState::Hot);
                swip.swizzle(frame as *const BufferFrame);
                frame_ex.release();
                parent_ex.release();
                {
                    let mut guard = partition.lock();
                    guard.cio.remove(page_id);
                }
                drop(reader_lock);
                Ok(frame_id)
            }
            Err(Restart) => {
                // Couldn't rewire the parent right now; don't discard the
                // page we just paid to load — push it into the cooling
                // queue instead, flagged `cooled_because_of_reading`.
                frame.set_state(FrameState::Cold);
                frame.set_cooled_because_of_reading(true);
                frame_ex.release();
                {
                    let mut guard = partition.lock();
                    guard.cio.insert(page_id, CioEntry::new_cooling(frame_id));
                    guard.cooling.push_back(frame_id);
                }
                drop(reader_lock);
                Err(RestartOrIo::Restart)
            }
        }
    }

    // --- page-provider hooks, invoked from `buffer::provider` ---

    fn frames_per_partition(&self) -> usize {
        (self.frames.len() / self.partitions.len()).max(1)
    }

    pub(crate) fn cool_target(&self) -> usize {
        ((self.config.cool_pct / 100.0) * self.frames_per_partition() as f64).ceil() as usize
    }

    pub(crate) fn free_target(&self) -> usize {
        ((self.config.free_pct / 100.0) * self.frames_per_partition() as f64).ceil() as usize
    }

    /// Phase 1: cool hot pages while `free_count + cooling_count` stays
    /// under this partition's cooling upper bound, via
    /// `DTRegistry::find_parent`.
    pub(crate) fn pp_cool_partition(&self, partition_idx: usize, scan_budget: usize) -> usize {
        let partition = &self.partitions[partition_idx];
        let target = self.cool_target();
        let mut cooled = 0usize;
        let mut probes = 0usize;

        while partition.free_count() + partition.cooling_count() < target && probes < scan_budget {
            probes += 1;
            // Sample a random frame across the whole DRAM pool, skip it if
            // latched, and confirm it is HOT and owned by this partition
            // before considering it further.
            let candidate = {
                use rand::Rng;
                rand::rng().random_range(0..self.frames.len())
            };
            let mut frame = &self.frames[candidate];
            if frame.latch.is_exclusively_held() {
                continue;
            }
            if frame.state() != FrameState::Hot {
                continue;
            }
            if partition_of(frame.page_id(), self.config.partition_bits) != partition_idx {
                continue;
            }

            frame = self.descend_to_leaf_candidate(frame, partition_idx);

            if self.try_cool_one(frame) {
                cooled += 1;
            }
        }

        if cooled > 0 {
            self.stats
                .frames_cooled
                .fetch_add(cooled as u64, Ordering::Relaxed);
            debug!(partition_idx, cooled, "phase 1 cooled frames");
        }
        cooled
    }

    /// Prefer cooling a swizzled descendant of the sampled frame over the
    /// frame itself, so leaves evict ahead of their internal-node ancestors.
    /// Walks down while the current frame has a
    /// swizzled child that is itself HOT, ours, and not latched; stops and
    /// returns the last frame found otherwise (including on the first
    /// `Restart` from the registry, which just means "can't tell right now",
    /// not "no child exists").
    fn descend_to_leaf_candidate<'f>(
        &self,
        mut frame: &'f BufferFrame,
        partition_idx: usize,
    ) -> &'f BufferFrame {
        const MAX_DESCEND: usize = 32;

        for _ in 0..MAX_DESCEND {
            let registry = self.registry_for(frame);
            let mut swizzled_child: Option<u32> = None;
            let result = registry.iterate_child_swips(frame, &mut |swip| {
                if swip.is_swizzled() {
                    swizzled_child = Some(unsafe { (*swip.as_frame()).frame_id() });
                    // Sentinel: stop the registry's own iteration early once
                    // we have found one candidate to walk to.
                    return Err(Restart);
                }
                Ok(())
            });

            let child_id = match (result, swizzled_child) {
                (_, Some(id)) => id,
                (Ok(()), None) => break,
                (Err(Restart), None) => break,
            };

            let child = &self.frames[child_id as usize];
            if child.latch.is_exclusively_held()
                || child.state() != FrameState::Hot
                || partition_of(child.page_id(), self.config.partition_bits) != partition_idx
            {
                break;
            }
            frame = child;
        }
        frame
    }

    fn try_cool_one(&self, frame: &BufferFrame) -> bool {
        let registry = self.registry_for(frame);
        let parent = match registry.find_parent(frame) {
            Ok(p) => p,
            Err(Restart) => return false,
        };
        let parent_frame = &self.frames[parent.parent_frame_id as usize];
        let parent_snapshot = parent_frame.latch.optimistic_acquire();

        if !parent.child_swip.is_swizzled()
            || parent.child_swip.as_frame() != frame as *const BufferFrame
        {
            return false;
        }

        if parent_frame.latch.try_upgrade(parent_snapshot).is_err() {
            return false;
        }
        let parent_ex = ExclusiveGuard::from_already_upgraded(&parent_frame.latch);

        // Re-check under exclusive hold: nothing else may have changed the
        // swip between the optimistic peek above and winning the upgrade.
        if !parent.child_swip.is_swizzled()
            || parent.child_swip.as_frame() != frame as *const BufferFrame
        {
            return false;
        }

        let frame_ex = ExclusiveGuard::acquire(&frame.latch);
        let page_id = frame.page_id();
        parent.child_swip.unswizzle(page_id);
        frame.set_state(FrameState::Cold);
        frame_ex.release();
        drop(parent_ex);

        let partition = &self.partitions[partition_of(page_id, self.config.partition_bits)];
        let mut guard = partition.lock();
        guard.cio.insert(page_id, CioEntry::new_cooling(frame.frame_id()));
        guard.cooling.push_back(frame.frame_id());
        true
    }

    /// Phase 2: if this partition's free list is below its lower bound,
    /// walk up to `k = free_lower_bound - free_count` entries from the head
    /// of the cooling queue (oldest first), submitting dirty ones to
    /// `write_buf` and reclaiming clean ones immediately. Frames flagged
    /// "cooled because of reading" are skipped — they are only reclaimable
    /// after a later resolve rewires their parent. Returns `true` if it
    /// stopped early because `write_buf` reported full.
    pub(crate) fn pp_flush_partition(
        &self,
        partition_idx: usize,
        write_buf: &crate::buffer::async_write::AsyncWriteBuffer,
    ) -> bool {
        let partition = &self.partitions[partition_idx];
        let free_count = partition.free_count();
        let lower_bound = self.free_target();
        if free_count >= lower_bound {
            return false;
        }
        let k = lower_bound - free_count;

        let mut guard = partition.lock();
        let candidates: Vec<u32> = guard.cooling.iter_oldest_first().take(k).collect();
        let mut stopped_full = false;
        let mut flushed = 0u64;

        for frame_id in candidates {
            let frame = &self.frames[frame_id as usize];
            if frame.state() != FrameState::Cold {
                continue;
            }
            if frame.cooled_because_of_reading() {
                continue;
            }
            if !frame.is_dirty() {
                // Still must win the exclusive latch before handing the
                // frame back to the free list: a concurrent resolver may be
                // in the middle of rescuing it out of the cooling queue.
                let snapshot = frame.latch.optimistic_acquire();
                if frame.latch.try_upgrade(snapshot).is_err() {
                    continue;
                }
                let frame_ex = ExclusiveGuard::from_already_upgraded(&frame.latch);
                guard.cooling.remove(frame_id);
                guard.cio.remove(frame.page_id());
                frame.set_state(FrameState::Free);
                frame_ex.release();
                partition.free_list.push(frame_id);
                self.stats.frames_reclaimed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if frame.is_writeback() {
                continue;
            }
            if write_buf.is_full() {
                stopped_full = true;
                break;
            }
            let page_id = frame.page_id();
            if write_buf.add(frame_id, page_id, unsafe { frame.page() }) {
                frame.set_writeback(true);
                flushed += 1;
            } else {
                stopped_full = true;
                break;
            }
        }

        if flushed > 0 {
            self.stats.frames_flushed.fetch_add(flushed, Ordering::Relaxed);
        }
        stopped_full
    }

    /// Phase 3: drain completions from `write_buf` and reclaim frames whose
    /// write is durable and which were not rescued in the meantime.
    pub(crate) fn pp_drain_completions(
        &self,
        write_buf: &crate::buffer::async_write::AsyncWriteBuffer,
        max: usize,
    ) -> usize {
        let mut reclaimed = 0usize;
        write_buf.drain_completed(max, |frame_id, written_lsn| {
            let frame = &self.frames[frame_id as usize];
            frame.set_writeback(false);

            if frame.state() != FrameState::Cold {
                // Rescued before the write landed; leave it alone.
                return;
            }
            if frame.cooled_because_of_reading() {
                // Never reclaimed by phases 2/3; only a later resolve that
                // rewires the parent clears this flag.
                return;
            }
            frame.set_last_written_lsn(written_lsn.max(frame.last_written_lsn()));

            let page_id = frame.page_id();
            let partition = &self.partitions[partition_of(page_id, self.config.partition_bits)];
            let mut guard = partition.lock();
            let still_matches = matches!(
                guard.cio.get(page_id),
                Some(e) if e.frame_id == frame_id && e.state == CioState::Cooling
            );
            if still_matches {
                let snapshot = frame.latch.optimistic_acquire();
                if frame.latch.try_upgrade(snapshot).is_err() {
                    // A resolver is concurrently rescuing this frame; leave
                    // it for a later pass rather than fighting it.
                    return;
                }
                let frame_ex = ExclusiveGuard::from_already_upgraded(&frame.latch);
                guard.cooling.remove(frame_id);
                guard.cio.remove(page_id);
                drop(guard);
                frame.set_dirty(false);
                frame.set_state(FrameState::Free);
                frame_ex.release();
                partition.free_list.push(frame_id);
                reclaimed += 1;
            }
        });
        if reclaimed > 0 {
            self.stats
                .frames_reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }
}

/// Internal error type for the resolve state machine: either ordinary
/// restart control flow, or a genuine I/O failure that must propagate.
enum RestartOrIo {
    Restart,
    Io(std::io::Error),
}

impl From<Restart> for RestartOrIo {
    fn from(_: Restart) -> Self {
        RestartOrIo::Restart
    }
}

/// A just-allocated page whose frame latch is held exclusively until the
/// caller finishes writing initial content.
pub struct AllocatedPage<'a> {
    manager: &'a BufferManager,
    frame_id: u32,
    page_id: PageId,
    guard: Option<ExclusiveGuard<'a>>,
}

impl<'a> AllocatedPage<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let frame = self.manager.frame(self.frame_id);
        unsafe { frame.page_mut().payload_mut() }
    }

    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.manager.frame(self.frame_id).set_dirty(true);
            guard.release();
        }
    }
}

impl<'a> Drop for AllocatedPage<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::dtr::{NullRegistry, ParentHandle};
    use crate::buffer::frame::FrameState;
    use std::sync::Barrier;

    fn test_manager(dir: &tempfile::TempDir, partition_bits: u32) -> BufferManager {
        let cfg = BufferManagerConfig::builder()
            .device_path(dir.path().join("data.db").to_str().unwrap().to_string())
            .dram_gib(0.001)
            .partition_bits(partition_bits)
            .pp_threads(1usize << partition_bits.min(1))
            .free_pct(25.0)
            .cool_pct(50.0)
            .build();
        BufferManager::new(cfg, Arc::new(NullRegistry)).unwrap()
    }

    #[test]
    fn allocate_then_resolve_hot_path_returns_same_frame() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 2);

        let mut page = manager.allocate_page();
        let frame_id = page.frame_id();
        page.payload_mut()[0] = 0xAB;
        page.finish();

        let holder = manager.frame(frame_id);
        let swip = Swip::from_frame(holder as *const _);
        let guard = OptimisticGuard::new(&holder.latch);
        let resolved = manager.resolve_swip(&guard, &swip).unwrap();

        assert_eq!(resolved, frame_id);
        assert_eq!(manager.stats().resolves_fast_path, 1);
    }

    #[test]
    fn allocate_write_evict_and_resolve_by_page_id_round_trips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 0);

        let mut page = manager.allocate_page();
        let page_id = page.page_id();
        let frame_id = page.frame_id();
        page.payload_mut()[0] = 0x77;
        page.finish();

        // Simulate what phase 2/3 of the page provider would do: flush the
        // dirty frame to the device, then return it to the free list, all
        // without going through a registered parent (there is none here).
        let frame = manager.frame(frame_id);
        let frame_ex = ExclusiveGuard::acquire(&frame.latch);
        manager
            .disk
            .write_page(page_id, unsafe { frame.page() })
            .unwrap();
        frame.set_dirty(false);
        frame.set_state(FrameState::Free);
        frame_ex.release();
        manager.partitions[0].free_list.push(frame_id);

        // A fresh "parent" page just hosts the lock this resolve needs.
        let mut holder_page = manager.allocate_page();
        holder_page.finish();
        let holder = manager.frame(holder_page.frame_id());
        let swip = Swip::from_page_id(page_id);
        let guard = OptimisticGuard::new(&holder.latch);
        let resolved_frame_id = manager.resolve_swip(&guard, &swip).unwrap();

        let resolved = manager.frame(resolved_frame_id);
        assert_eq!(unsafe { resolved.page().payload()[0] }, 0x77);
        assert_eq!(manager.stats().resolves_slow_path, 1);
    }

    #[test]
    fn concurrent_resolves_of_same_missing_page_issue_exactly_one_read() {
        use crate::buffer::partition::partition_of;

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(test_manager(&dir, 0));

        // Write a page to the device directly (bypassing the buffer
        // manager) so both resolvers hit the "absent" slow path.
        let page_id = 7u64;
        {
            let mut scratch = crate::buffer::page::Page::new(
                manager.config().page_size,
                manager.disk.alignment(),
            );
            scratch.init_header(page_id);
            scratch.payload_mut()[0] = 0x5A;
            manager.disk.write_page(page_id, &scratch).unwrap();
        }
        // Make sure the device's monotonic counter won't collide with it.
        let _ = partition_of(page_id, manager.config().partition_bits);

        let mut holder_page = manager.allocate_page();
        holder_page.finish();
        let holder_frame_id = holder_page.frame_id();
        let swip = Arc::new(Swip::from_page_id(page_id));

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let swip = swip.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let holder = manager.frame(holder_frame_id);
                let guard = OptimisticGuard::new(&holder.latch);
                manager.resolve_swip(&guard, &swip)
            }));
        }

        let mut frame_ids = Vec::new();
        for h in handles {
            frame_ids.push(h.join().unwrap().unwrap());
        }
        assert!(frame_ids.iter().all(|&id| id == frame_ids[0]));
        assert_eq!(manager.stats().resolves_slow_path, 4);

        let resolved = manager.frame(frame_ids[0]);
        assert_eq!(unsafe { resolved.page().payload()[0] }, 0x5A);
    }

    #[test]
    fn cooling_frame_is_rescued_by_resolve_and_leaves_the_cooling_queue() {
        use crate::buffer::cio::CioEntry;
        use crate::buffer::partition::partition_of;

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 0);

        let mut holder_page = manager.allocate_page();
        let holder_frame_id = holder_page.frame_id();
        holder_page.finish();

        let mut child_page = manager.allocate_page();
        let child_frame_id = child_page.frame_id();
        let child_page_id = child_page.page_id();
        child_page.payload_mut()[0] = 0x33;
        child_page.finish();

        let holder = manager.frame(holder_frame_id);
        let child = manager.frame(child_frame_id);
        let swip = Swip::from_frame(child as *const _);

        // Put the child frame directly into the cooling state, as phase 1
        // of the page provider would.
        let child_ex = ExclusiveGuard::acquire(&child.latch);
        swip.unswizzle(child_page_id);
        child.set_state(FrameState::Cold);
        child_ex.release();
        let partition_idx = partition_of(child_page_id, manager.config().partition_bits);
        {
            let mut guard = manager.partitions[partition_idx].lock();
            guard
                .cio
                .insert(child_page_id, CioEntry::new_cooling(child_frame_id));
            guard.cooling.push_back(child_frame_id);
        }

        let guard = OptimisticGuard::new(&holder.latch);
        let resolved = manager.resolve_swip(&guard, &swip).unwrap();

        assert_eq!(resolved, child_frame_id);
        assert_eq!(manager.frame(child_frame_id).state(), FrameState::Hot);
        assert!(swip.is_swizzled());
        {
            let guard = manager.partitions[partition_idx].lock();
            assert!(!guard.cio.contains(child_page_id));
            assert_eq!(guard.cooling.len(), 0);
        }
    }

    #[test]
    fn reclaim_page_returns_frame_to_its_partitions_free_list() {
        use crate::buffer::partition::partition_of;

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 2);

        let mut page = manager.allocate_page();
        let frame_id = page.frame_id();
        let page_id = page.page_id();
        page.finish();

        let partition_idx = partition_of(page_id, manager.config().partition_bits);
        let free_before = manager.partitions[partition_idx].free_count();

        let guard = ExclusiveGuard::acquire(&manager.frame(frame_id).latch);
        manager.reclaim_page(frame_id, guard);

        assert_eq!(manager.frame(frame_id).state(), FrameState::Free);
        assert_eq!(manager.stats().frames_reclaimed, 1);
        assert_eq!(manager.partitions[partition_idx].free_count(), free_before + 1);
    }

    #[test]
    fn register_instance_records_root_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 0);

        let dt_id = manager.register_instance(5, 42, "primary-index");
        assert_eq!(manager.dt_instance_root(dt_id), Some(42));
        assert_eq!(
            manager.dt_instance_name(dt_id),
            Some("primary-index".to_string())
        );
    }

    #[test]
    fn registered_type_tag_routes_find_parent_to_the_right_registry() {
        // Always names `parent_frame_id` (set below once the parent frame is
        // known) as the parent of whatever frame it's asked about, unlike
        // `NullRegistry`, which never finds one. Lets the test tell which
        // registry actually served a given frame's cooling attempt.
        struct AlwaysHasAParent {
            parent_frame_id: u32,
            child_swip: Swip,
        }
        impl DTRegistry for AlwaysHasAParent {
            fn iterate_child_swips(
                &self,
                _frame: &BufferFrame,
                _visitor: &mut dyn FnMut(&Swip) -> crate::buffer::latch::RResult<()>,
            ) -> crate::buffer::latch::RResult<()> {
                Ok(())
            }
            fn find_parent(&self, _frame: &BufferFrame) -> crate::buffer::latch::RResult<ParentHandle<'_>> {
                Ok(ParentHandle {
                    parent_frame_id: self.parent_frame_id,
                    child_swip: &self.child_swip,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, 0);

        let mut holder_page = manager.allocate_page();
        let holder_frame_id = holder_page.frame_id();
        holder_page.finish();

        let mut untagged = manager.allocate_page();
        let untagged_frame_id = untagged.frame_id();
        untagged.finish();

        let mut tagged = manager.allocate_page_tagged(9);
        let tagged_frame_id = tagged.frame_id();
        tagged.finish();

        manager.register_data_structure_type(
            9,
            Arc::new(AlwaysHasAParent {
                parent_frame_id: holder_frame_id,
                child_swip: Swip::from_frame(manager.frame(tagged_frame_id) as *const _),
            }),
        );

        assert_eq!(manager.frame(tagged_frame_id).type_tag(), 9);
        assert_eq!(manager.frame(untagged_frame_id).type_tag(), 0);

        // `try_cool_one` consults `registry_for`, which must route the
        // type-9 frame to `AlwaysHasAParent` (so it cools) while the
        // untagged frame still falls back to `NullRegistry` (so it can't).
        let cooled_tagged = manager.try_cool_one(manager.frame(tagged_frame_id));
        assert!(cooled_tagged);
        assert_eq!(manager.frame(tagged_frame_id).state(), FrameState::Cold);

        let cooled_untagged = manager.try_cool_one(manager.frame(untagged_frame_id));
        assert!(!cooled_untagged);
        assert_eq!(manager.frame(untagged_frame_id).state(), FrameState::Hot);
    }
}
