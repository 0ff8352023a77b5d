//! Page-provider background agents: the three-phase eviction pipeline that
//! keeps each partition within its free/cool budgets.
//!
//! A fixed-size thread pool, each worker owning a contiguous shard of
//! partitions, with cooperative shutdown via a shared stop flag plus a
//! live-count join barrier. Each pass over a partition runs three phases in
//! order: cool enough hot pages to refill the cooling queue, flush dirty
//! cooling pages to the async write buffer, then drain completed writes
//! back to the free list.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::buffer::async_write::AsyncWriteBuffer;
use crate::buffer::manager::BufferManager;

/// Nice value requested for page-provider threads when
/// [`crate::config::BufferManagerConfig::elevate_priority`] is set: the
/// lowest (highest-priority) value a non-`CAP_SYS_NICE` process can
/// typically still reach, well below the default of 0.
const ELEVATED_NICE: i32 = -10;

/// Best-effort: ask the OS scheduler to favor the calling thread. Page
/// providers keep the free list from running dry under write load, so
/// starving them behind unrelated CPU-bound work can stall every resolver
/// in the partitions they own. Failure (no `CAP_SYS_NICE`, unsupported
/// platform) is logged and otherwise ignored — the agent still runs, just
/// at default priority.
#[cfg(target_os = "linux")]
fn elevate_thread_priority() {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, ELEVATED_NICE) };
    if rc != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to elevate page-provider thread priority, continuing at default priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_thread_priority() {
    warn!("elevate_priority is only supported on Linux; ignoring");
}

/// How many frames a single phase-1 pass is willing to probe looking for
/// cooling candidates, per partition per iteration. Bounded so a partition
/// with few hot pages left doesn't spin the agent forever.
const COOL_SCAN_BUDGET: usize = 64;

const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Owns the pool of page-provider threads for one [`BufferManager`].
pub struct PageProviderPool {
    keep_running: Arc<AtomicBool>,
    live_agents: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl PageProviderPool {
    /// Spawn `config.pp_threads` agents, each owning a contiguous, equal
    /// share of the partitions. `manager.config().validate()` already
    /// guarantees `pp_threads` divides `partitions_count()` evenly.
    pub fn start(manager: Arc<BufferManager>) -> Self {
        let threads = manager.config().pp_threads;
        let partitions = manager.partitions_count();
        let per_thread = partitions / threads;

        let keep_running = Arc::new(AtomicBool::new(true));
        let live_agents = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(threads);

        for t in 0..threads {
            let range = (t * per_thread)..((t + 1) * per_thread);
            let manager = manager.clone();
            let keep_running = keep_running.clone();
            let live_agents = live_agents.clone();
            live_agents.fetch_add(1, Ordering::SeqCst);
            let handle = std::thread::Builder::new()
                .name(format!("vmcache-pp-{t}"))
                .spawn(move || run_agent(manager, range, keep_running, live_agents))
                .expect("failed to spawn page provider thread");
            handles.push(handle);
        }

        info!(threads, partitions, "page providers started");
        Self {
            keep_running,
            live_agents,
            handles,
        }
    }

    pub fn live_agent_count(&self) -> usize {
        self.live_agents.load(Ordering::SeqCst)
    }

    /// Signal every agent to stop, wait for each to drain its outstanding
    /// writes and exit, then join its thread. No agent exits with
    /// unflushed dirty cooling pages it already submitted for write-back.
    pub fn flush_and_stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("page providers stopped");
    }
}

fn run_agent(
    manager: Arc<BufferManager>,
    partitions: Range<usize>,
    keep_running: Arc<AtomicBool>,
    live_agents: Arc<AtomicUsize>,
) {
    if manager.config().elevate_priority {
        elevate_thread_priority();
    }

    let write_buf = AsyncWriteBuffer::new(manager.config().async_batch_size, manager.disk.clone());

    while keep_running.load(Ordering::SeqCst) {
        let did_work = run_one_pass(&manager, partitions.clone(), &write_buf);
        if !did_work {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    drain_fully(&manager, &write_buf);
    live_agents.fetch_sub(1, Ordering::SeqCst);
}

fn run_one_pass(manager: &BufferManager, partitions: Range<usize>, write_buf: &AsyncWriteBuffer) -> bool {
    let mut did_work = false;

    for idx in partitions {
        if manager.pp_cool_partition(idx, COOL_SCAN_BUDGET) > 0 {
            did_work = true;
        }
        if manager.pp_flush_partition(idx, write_buf) {
            did_work = true;
        }
    }

    if write_buf.outstanding() > 0 {
        write_buf.submit();
        if write_buf.poll_nonblocking() > 0 {
            did_work = true;
        }
    }
    if write_buf.buffered_completion_count() > 0 {
        manager.pp_drain_completions(write_buf, manager.config().async_batch_size);
        did_work = true;
    }

    did_work
}

/// Block until every write this agent has already submitted (or still has
/// buffered) lands and is reclaimed, used only on shutdown.
fn drain_fully(manager: &BufferManager, write_buf: &AsyncWriteBuffer) {
    write_buf.submit();
    while write_buf.outstanding() > 0 {
        write_buf.poll();
        manager.pp_drain_completions(write_buf, usize::MAX);
    }
    if write_buf.buffered_completion_count() > 0 {
        manager.pp_drain_completions(write_buf, usize::MAX);
    }
}
