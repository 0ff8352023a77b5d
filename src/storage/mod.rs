//! Device-facing storage layer: the flat page file and unbuffered I/O.

pub mod disk;

pub use disk::DiskManager;
