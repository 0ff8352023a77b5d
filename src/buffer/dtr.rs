//! Data-structure registry collaborator.
//!
//! The buffer manager needs two things from whatever indexing structure
//! (a B-tree, typically) owns the swips it swizzles: a way to walk a hot
//! page's child swips when deciding what to cool, and a way to find the
//! parent frame of a given frame when the eviction pipeline needs to rewrite
//! the swip pointing at it. This crate never implements that indexing
//! structure itself — `DTRegistry` is the seam, and this module provides
//! only the trait plus a minimal in-memory test double used by this
//! crate's own test suite.

use crate::buffer::frame::BufferFrame;
use crate::buffer::latch::RResult;
use crate::buffer::swip::Swip;

/// Identifies a registered data-structure *type* (e.g. "the B-tree"), as
/// opposed to one of its instances: types are registered once, instances
/// are registered per root page.
pub type DataStructureTypeId = u8;

/// The collaborator interface the page provider and `resolve` call into.
/// Implementors are expected to hold whatever latches are necessary
/// internally and to propagate `Restart` (rather than panicking) when an
/// optimistic read loses a race — exactly the discipline every other
/// buffer-manager-internal operation already follows.
pub trait DTRegistry: Send + Sync {
    /// Call `visitor` once per child swip reachable from `frame`'s page,
    /// in the data-structure's own order. Used by the cooling phase to walk
    /// down the tree looking for a swizzled, evictable leaf. `frame` is
    /// held under at least an optimistic guard; implementors
    /// must recheck before trusting anything they read from its payload and
    /// return `Err(Restart)` if the page changed underneath them.
    fn iterate_child_swips(
        &self,
        frame: &BufferFrame,
        visitor: &mut dyn FnMut(&Swip) -> RResult<()>,
    ) -> RResult<()>;

    /// Locate the parent of `frame`: the frame holding the page whose swip
    /// currently points at it, together with a pointer to that swip itself,
    /// so the caller can rewire it (unswizzling it to a plain page id)
    /// during eviction. `BufferFrame`s are never deallocated, only
    /// recycled, so the returned reference stays valid for the program's
    /// lifetime; the caller is responsible for latching the parent frame
    /// (optimistically, then upgrading) before trusting or mutating
    /// `child_swip`. Implementors return `Err(Restart)` rather than an error
    /// type if they cannot find a stable parent right now (including "this
    /// frame has no parent", e.g. a root page).
    fn find_parent(&self, frame: &BufferFrame) -> RResult<ParentHandle<'_>>;
}

/// Ties a parent frame's exclusive latch hold to the specific child swip
/// within it that the caller is about to rewrite. `child_swip` is only ever
/// valid while the handle is alive.
pub struct ParentHandle<'a> {
    pub parent_frame_id: u32,
    pub child_swip: &'a Swip,
}

/// Default type tag used by frames until something registers a more
/// specific data-structure type and tags a root page with it.
pub const DEFAULT_TYPE_TAG: DataStructureTypeId = 0;

/// Opaque handle returned by [`DtRegistryTable::register_instance`],
/// identifying one registered root (e.g. one B-tree) among possibly several
/// sharing the same data-structure type.
pub type DtId = u64;

struct DtInstance {
    type_tag: DataStructureTypeId,
    root: crate::common::PageId,
    name: String,
}

/// The registry-of-registries: maps a data-structure type
/// tag to the `DTRegistry` vtable that knows how to walk pages of that type,
/// and separately tracks named instances (roots) of a type for operator
/// visibility. The buffer manager consults this table, keyed by the type tag
/// stamped on each frame at allocation time, whenever it needs to find a
/// frame's parent or walk its children.
#[derive(Default)]
pub struct DtRegistryTable {
    types: parking_lot::RwLock<std::collections::HashMap<DataStructureTypeId, std::sync::Arc<dyn DTRegistry>>>,
    instances: parking_lot::RwLock<std::collections::HashMap<DtId, DtInstance>>,
    next_dt_id: std::sync::atomic::AtomicU64,
}

impl DtRegistryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the vtable used for every page tagged with
    /// `type_tag`.
    pub fn register_data_structure_type(
        &self,
        type_tag: DataStructureTypeId,
        registry: std::sync::Arc<dyn DTRegistry>,
    ) {
        self.types.write().insert(type_tag, registry);
    }

    /// Record one named instance of a registered type rooted at `root`,
    /// returning an opaque id operators can use to look it up later. Does
    /// not itself tag any frame; callers tag the root frame via
    /// [`BufferFrame::set_type_tag`](crate::buffer::frame::BufferFrame::set_type_tag)
    /// when they allocate or load it.
    pub fn register_instance(
        &self,
        type_tag: DataStructureTypeId,
        root: crate::common::PageId,
        name: impl Into<String>,
    ) -> DtId {
        let id = self
            .next_dt_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.instances.write().insert(
            id,
            DtInstance {
                type_tag,
                root,
                name: name.into(),
            },
        );
        id
    }

    pub fn instance_root(&self, dt_id: DtId) -> Option<crate::common::PageId> {
        self.instances.read().get(&dt_id).map(|i| i.root)
    }

    pub fn instance_name(&self, dt_id: DtId) -> Option<String> {
        self.instances.read().get(&dt_id).map(|i| i.name.clone())
    }

    pub fn instance_type_tag(&self, dt_id: DtId) -> Option<DataStructureTypeId> {
        self.instances.read().get(&dt_id).map(|i| i.type_tag)
    }

    /// Look up the registry for `type_tag`, if one was registered.
    pub fn lookup(&self, type_tag: DataStructureTypeId) -> Option<std::sync::Arc<dyn DTRegistry>> {
        self.types.read().get(&type_tag).cloned()
    }
}

/// A registry that never finds a parent and never visits any children.
/// Useful for exercising the allocate/resolve/evict-by-no-parent paths in
/// isolation without standing up a real indexing structure.
#[derive(Debug, Default)]
pub struct NullRegistry;

impl DTRegistry for NullRegistry {
    fn iterate_child_swips(
        &self,
        _frame: &BufferFrame,
        _visitor: &mut dyn FnMut(&Swip) -> RResult<()>,
    ) -> RResult<()> {
        Ok(())
    }

    fn find_parent(&self, _frame: &BufferFrame) -> RResult<ParentHandle<'_>> {
        Err(crate::buffer::latch::Restart)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A minimal linked-page registry used only by this crate's own
    //! integration tests (never a real B-tree): page N's single child swip
    //! is page N+1, wired up explicitly by the test that builds it.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub struct LinkedPageRegistry {
        /// child frame_id -> (parent frame_id, index of the child swip within
        /// the parent's single-swip "page")
        parents: Mutex<HashMap<u32, u32>>,
        swips: Mutex<HashMap<u32, *const Swip>>,
    }

    unsafe impl Send for LinkedPageRegistry {}
    unsafe impl Sync for LinkedPageRegistry {}

    impl Default for LinkedPageRegistry {
        fn default() -> Self {
            Self {
                parents: Mutex::new(HashMap::new()),
                swips: Mutex::new(HashMap::new()),
            }
        }
    }

    impl LinkedPageRegistry {
        pub fn link(&self, parent_frame_id: u32, child_frame_id: u32, child_swip: &Swip) {
            self.parents.lock().insert(child_frame_id, parent_frame_id);
            self.swips
                .lock()
                .insert(child_frame_id, child_swip as *const Swip);
        }
    }

    impl DTRegistry for LinkedPageRegistry {
        fn iterate_child_swips(
            &self,
            _frame: &BufferFrame,
            _visitor: &mut dyn FnMut(&Swip) -> RResult<()>,
        ) -> RResult<()> {
            Ok(())
        }

        fn find_parent(&self, frame: &BufferFrame) -> RResult<ParentHandle<'_>> {
            let parents = self.parents.lock();
            let swips = self.swips.lock();
            let parent_frame_id = *parents.get(&frame.frame_id()).ok_or(crate::buffer::latch::Restart)?;
            let swip_ptr = *swips.get(&frame.frame_id()).ok_or(crate::buffer::latch::Restart)?;
            Ok(ParentHandle {
                parent_frame_id,
                child_swip: unsafe { &*swip_ptr },
            })
        }
    }
}
