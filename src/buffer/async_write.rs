//! Batched asynchronous page writes.
//!
//! A bounded batch of outstanding writes is submitted together and polled
//! for completion, handed off to a dedicated writer thread over
//! `crossbeam` channels rather than a real `io_uring` ring, since this
//! crate targets portable direct I/O rather than a Linux-only
//! completion-queue API (see DESIGN.md).
//!
//! `add` copies the frame's page payload into a buffer owned by this
//! struct — copying sidesteps any aliasing concern between the page
//! provider and a future writer of the same frame, at the cost of one
//! extra page-sized memcpy per flushed page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::buffer::page::Page;
use crate::common::PageId;
use crate::storage::disk::DiskManager;

struct PendingWrite {
    frame_id: u32,
    page_id: PageId,
    written_lsn: u64,
    buf: Page,
}

/// One completed write: which frame it was for, and the LSN that is now
/// durable. Callers can rely on `written_lsn > frame.last_written_lsn()`
/// holding once a completion for that frame is observed.
pub struct Completion {
    pub frame_id: u32,
    pub written_lsn: u64,
}

/// A bounded batch of in-flight writes. `add` reserves a slot and takes an
/// owned copy of the page; `submit` hands every reserved write to the
/// background writer thread; `poll` blocks until at least one write
/// completes; `drain_completed` hands completions to the caller, oldest
/// first.
pub struct AsyncWriteBuffer {
    capacity: usize,
    pending: parking_lot::Mutex<Vec<PendingWrite>>,
    in_flight: AtomicU64,
    lsn_counter: AtomicU64,
    tx_jobs: Sender<PendingWrite>,
    rx_completions: Receiver<Completion>,
    recent: parking_lot::Mutex<std::collections::VecDeque<Completion>>,
    writer: Option<JoinHandle<()>>,
}

impl AsyncWriteBuffer {
    pub fn new(capacity: usize, disk: Arc<DiskManager>) -> Self {
        let (tx_jobs, rx_jobs) = channel::unbounded::<PendingWrite>();
        let (tx_completions, rx_completions) = channel::unbounded::<Completion>();

        let writer = std::thread::Builder::new()
            .name("vmcache-async-writer".to_string())
            .spawn(move || {
                while let Ok(job) = rx_jobs.recv() {
                    // A write failure here cannot be surfaced to the
                    // original submitter synchronously; logging it is the
                    // most this background worker can do. Write-failure
                    // policy beyond that is left to the caller's durability
                    // story.
                    if let Err(err) = disk.write_page(job.page_id, &job.buf) {
                        tracing::warn!(page_id = job.page_id, %err, "async page write failed");
                        continue;
                    }
                    let _ = tx_completions.send(Completion {
                        frame_id: job.frame_id,
                        written_lsn: job.written_lsn,
                    });
                }
            })
            .expect("failed to spawn async writer thread");

        Self {
            capacity,
            pending: parking_lot::Mutex::new(Vec::new()),
            in_flight: AtomicU64::new(0),
            lsn_counter: AtomicU64::new(0),
            tx_jobs,
            rx_completions,
            recent: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            writer: Some(writer),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserved + submitted-but-not-completed writes.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len() + self.in_flight.load(Ordering::Acquire) as usize
    }

    pub fn is_full(&self) -> bool {
        self.outstanding() >= self.capacity
    }

    /// Reserve a slot for `page_id`/`frame_id` and take an owned copy of
    /// `page`. Returns `false` (without copying anything) if the buffer is
    /// already at capacity, so callers filling a batch know to stop.
    pub fn add(&self, frame_id: u32, page_id: PageId, page: &Page) -> bool {
        if self.is_full() {
            return false;
        }
        let written_lsn = self.lsn_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let mut buf = Page::new(page.len(), page.len().max(crate::buffer::page::MIN_ALIGNMENT));
        buf.copy_from(page);
        buf.set_lsn(written_lsn);
        self.pending.lock().push(PendingWrite {
            frame_id,
            page_id,
            written_lsn,
            buf,
        });
        true
    }

    /// Hand every currently-reserved write to the background writer thread.
    pub fn submit(&self) -> usize {
        let batch: Vec<PendingWrite> = std::mem::take(&mut *self.pending.lock());
        let n = batch.len();
        self.in_flight.fetch_add(n as u64, Ordering::AcqRel);
        for job in batch {
            // An unbounded channel never blocks; send failure only happens
            // if the writer thread has already exited, which only occurs
            // after this buffer is dropped.
            let _ = self.tx_jobs.send(job);
        }
        n
    }

    /// Block until at least one submitted write completes, then drain every
    /// completion currently available without blocking further. Returns the
    /// number of newly observed completions.
    pub fn poll(&self) -> usize {
        let first = match self.rx_completions.recv() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        let mut n = 1;
        let mut recent = self.recent.lock();
        recent.push_back(first);
        while let Ok(c) = self.rx_completions.try_recv() {
            recent.push_back(c);
            n += 1;
        }
        self.in_flight.fetch_sub(n as u64, Ordering::AcqRel);
        n
    }

    /// Non-blocking variant of [`Self::poll`]: drains whatever is already
    /// available without waiting for the first completion.
    pub fn poll_nonblocking(&self) -> usize {
        let mut n = 0;
        let mut recent = self.recent.lock();
        while let Ok(c) = self.rx_completions.try_recv() {
            recent.push_back(c);
            n += 1;
        }
        if n > 0 {
            self.in_flight.fetch_sub(n as u64, Ordering::AcqRel);
        }
        n
    }

    /// Hand up to `n` of the oldest buffered completions to `visitor`,
    /// removing them from the internal queue. The caller is responsible for
    /// resolving `frame_id` back to a `BufferFrame` (this buffer has no
    /// reference to the frame arena, mirroring `DTRegistry`'s decoupling
    /// from the buffer manager).
    pub fn drain_completed(&self, n: usize, mut visitor: impl FnMut(u32, u64)) -> usize {
        let mut recent = self.recent.lock();
        let take = n.min(recent.len());
        for _ in 0..take {
            let c = recent.pop_front().unwrap();
            visitor(c.frame_id, c.written_lsn);
        }
        take
    }

    pub fn buffered_completion_count(&self) -> usize {
        self.recent.lock().len()
    }
}

impl Drop for AsyncWriteBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.writer.take() {
            // Dropping tx_jobs (owned by self, already gone out of scope by
            // the time Drop runs on the struct fields) closes the channel;
            // join defensively in case the thread is mid-write.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::PAGE_SIZE;
    use crate::config::BufferManagerConfig;

    fn disk(dir: &tempfile::TempDir) -> Arc<DiskManager> {
        let cfg = BufferManagerConfig::builder()
            .device_path(dir.path().join("data.db").to_str().unwrap().to_string())
            .page_size(PAGE_SIZE)
            .build();
        Arc::new(DiskManager::open(&cfg).unwrap())
    }

    #[test]
    fn add_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let buf = AsyncWriteBuffer::new(2, disk(&dir));
        let mut page = Page::new(PAGE_SIZE, PAGE_SIZE);
        page.init_header(1);
        assert!(buf.add(0, 1, &page));
        assert!(buf.add(1, 2, &page));
        assert!(!buf.add(2, 3, &page));
    }

    #[test]
    fn submit_then_poll_then_drain_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let buf = AsyncWriteBuffer::new(4, disk(&dir));
        let mut page = Page::new(PAGE_SIZE, PAGE_SIZE);
        page.init_header(10);
        assert!(buf.add(0, 10, &page));
        assert!(buf.add(1, 11, &page));
        assert_eq!(buf.submit(), 2);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            buf.poll();
            buf.drain_completed(2, |frame_id, lsn| seen.push((frame_id, lsn)));
        }
        seen.sort();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[1].0, 1);
        assert!(seen[0].1 > 0 && seen[1].1 > 0);
        assert_eq!(buf.outstanding(), 0);
    }

    #[test]
    fn written_lsn_is_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let buf = AsyncWriteBuffer::new(8, disk(&dir));
        let mut page = Page::new(PAGE_SIZE, PAGE_SIZE);
        page.init_header(1);
        for i in 0..5 {
            assert!(buf.add(i, 100 + i as u64, &page));
        }
        buf.submit();
        let mut lsns = Vec::new();
        while lsns.len() < 5 {
            buf.poll();
            buf.drain_completed(5, |_, lsn| lsns.push(lsn));
        }
        let mut sorted = lsns.clone();
        sorted.sort();
        assert_eq!(lsns.len(), sorted.len());
        assert!(sorted.windows(2).all(|w| w[0] < w[1]));
    }
}
