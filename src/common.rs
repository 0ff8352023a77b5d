/// Identifies a page on the device. `0` is reserved and never assigned by
/// [`crate::storage::disk::DiskManager::allocate_page_id`]; a [`BufferFrame`](crate::buffer::frame::BufferFrame)
/// in state `FREE` carries page id `0`.
pub type PageId = u64;

/// Sentinel written into a `FREE` frame's page id.
pub const INVALID_PAGE_ID: PageId = 0;
