//! `vmcache`: an in-memory buffer manager for a page-based storage engine.
//!
//! Mediates access between a fixed-size DRAM cache of fixed-size pages and a
//! much larger persistent page store on a block device opened for
//! unbuffered, direct I/O. Provides page allocation, on-demand page-in,
//! asynchronous eviction of dirty pages, and concurrent access through a
//! version-based optimistic-locking protocol. See [`buffer`] for the core
//! implementation and [`buffer::dtr`] for the seam an external index
//! structure (a B-tree, typically) plugs into.
//!
//! This crate does not implement an index, a write-ahead log, transaction
//! management, or CLI/config-file loading — those are external
//! collaborators. It does carry its own logging (`tracing`), error types,
//! and configuration struct, as any standalone crate would.

pub mod buffer;
pub mod common;
pub mod config;
pub mod error;
pub mod storage;

pub use buffer::{
    AllocatedPage, AsyncWriteBuffer, BufferFrame, BufferManager, BufferManagerStats,
    DTRegistry, DataStructureTypeId, DtId, DtRegistryTable, ExclusiveGuard, FrameState,
    NullRegistry, OptimisticGuard, OptimisticLatch, Page, PageProviderPool, Restart, Swip,
};
pub use common::PageId;
pub use config::{BufferManagerConfig, BufferManagerConfigBuilder};
pub use error::{BufferError, Result};
