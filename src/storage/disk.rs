//! Direct-I/O device access: a single file/block device, opened for
//! unbuffered, aligned, synchronous reads and asynchronous writes. Maps a
//! page id to a file offset, reads/writes whole pages through raw
//! `pread`/`pwrite`/`O_DIRECT` calls via `libc` rather than buffered
//! `std::fs::File`, and hands out fresh monotonic page ids. No read-ahead,
//! write-coalescing, or general-purpose I/O scheduling lives here — just
//! the synchronous reads the buffer manager issues directly and the
//! batched writes `AsyncWriteBuffer` hands off (see DESIGN.md).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::buffer::page::Page;
use crate::common::PageId;
use crate::config::BufferManagerConfig;
use crate::error::{BufferError, Result};

pub struct DiskManager {
    fd: RawFd,
    page_size: usize,
    alignment: usize,
    next_page_id: AtomicU64,
    /// Tracked for observability but never consulted for reuse — device
    /// page-id reclamation is out of scope for this crate.
    freed_pages: AtomicU64,
}

unsafe impl Send for DiskManager {}
unsafe impl Sync for DiskManager {}

impl DiskManager {
    pub fn open(config: &BufferManagerConfig) -> Result<Self> {
        let path = Path::new(&config.device_path);
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| BufferError::Config(e.to_string()))?;

        let mut flags = libc::O_RDWR | libc::O_CREAT;
        if config.truncate {
            flags |= libc::O_TRUNC;
        }
        #[cfg(target_os = "linux")]
        {
            flags |= libc::O_DIRECT;
        }

        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o600) };
        let fd = if fd < 0 {
            // O_DIRECT is not supported by every filesystem (tmpfs, some
            // CI sandboxes); retry once without it rather than fail a
            // buffer manager that would otherwise work correctly.
            #[cfg(target_os = "linux")]
            {
                let fallback = unsafe {
                    libc::open(c_path.as_ptr(), flags & !libc::O_DIRECT, 0o600)
                };
                if fallback < 0 {
                    return Err(BufferError::Io(std::io::Error::last_os_error()));
                }
                warn!("O_DIRECT unavailable for {:?}, falling back to buffered I/O", path);
                fallback
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(BufferError::Io(std::io::Error::last_os_error()));
            }
        } else {
            fd
        };

        let file_len = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                return Err(BufferError::Io(std::io::Error::last_os_error()));
            }
            st.st_size as u64
        };

        if config.preallocate_gib > 0.0 {
            let target = (config.preallocate_gib * (1u64 << 30) as f64) as i64;
            if unsafe { libc::ftruncate(fd, target) } != 0 {
                return Err(BufferError::Io(std::io::Error::last_os_error()));
            }
        }

        let existing_pages = file_len / config.page_size as u64;

        Ok(Self {
            fd,
            page_size: config.page_size,
            alignment: config.page_size.max(crate::buffer::page::MIN_ALIGNMENT),
            // Page id 0 is reserved.
            next_page_id: AtomicU64::new(existing_pages.max(1)),
            freed_pages: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Hand out a fresh monotonic page id. Warns, but does not fail, once
    /// the counter reaches `dram_pool_capacity`.
    pub fn allocate_page_id(&self, dram_pool_capacity: usize) -> PageId {
        let id = self.next_page_id.fetch_add(1, Ordering::Relaxed);
        if id as usize >= dram_pool_capacity {
            warn!(
                page_id = id,
                dram_pool_capacity, "device page id counter has reached the DRAM pool capacity"
            );
        }
        id
    }

    pub fn note_freed_page(&self) {
        self.freed_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn freed_page_count(&self) -> u64 {
        self.freed_pages.load(Ordering::Relaxed)
    }

    /// Blocking, unbuffered read of exactly one page. Loops on short reads.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        let offset = (page_id as i64) * self.page_size as i64;
        let mut done = 0usize;
        while done < page.len() {
            let ptr = unsafe { page.as_mut_ptr().add(done) };
            let remaining = page.len() - done;
            let n = unsafe {
                libc::pread(
                    self.fd,
                    ptr as *mut libc::c_void,
                    remaining,
                    offset + done as i64,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BufferError::Io(err));
            }
            if n == 0 {
                // Reading a page that was never written (e.g. the device
                // file hasn't been extended that far yet): treat as zeros.
                break;
            }
            done += n as usize;
        }
        Ok(())
    }

    /// Blocking, unbuffered write of exactly one page. Loops on short
    /// writes, mirroring `read_page`.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> Result<()> {
        let offset = (page_id as i64) * self.page_size as i64;
        let mut done = 0usize;
        while done < page.len() {
            let ptr = unsafe { page.as_ptr().add(done) };
            let remaining = page.len() - done;
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    ptr as *const libc::c_void,
                    remaining,
                    offset + done as i64,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BufferError::Io(err));
            }
            done += n as usize;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::PAGE_SIZE;

    fn test_config(dir: &tempfile::TempDir) -> BufferManagerConfig {
        BufferManagerConfig::builder()
            .device_path(dir.path().join("data.db").to_str().unwrap().to_string())
            .page_size(PAGE_SIZE)
            .build()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(&test_config(&dir)).unwrap();

        let mut page = Page::new(PAGE_SIZE, disk.alignment());
        page.init_header(5);
        page.payload_mut()[0] = 0xAB;
        disk.write_page(5, &page).unwrap();

        let mut read_back = Page::new(PAGE_SIZE, disk.alignment());
        disk.read_page(5, &mut read_back).unwrap();
        assert!(read_back.verify_magic(5));
        assert_eq!(read_back.payload()[0], 0xAB);
    }

    #[test]
    fn allocate_page_id_is_monotonic_and_skips_zero() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(&test_config(&dir)).unwrap();
        let a = disk.allocate_page_id(1000);
        let b = disk.allocate_page_id(1000);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(b > a);
    }
}
