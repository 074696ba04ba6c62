//! The live allocation registry and its counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::guard::ReentryGuard;

/// One currently-live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub type_name: Option<&'static str>,
    pub timestamp_ns: u64,
    pub thread_id: u32,
    pub file: Option<&'static str>,
    pub line: u32,
    pub is_array: bool,
}

/// Point-in-time copy of the tracker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub total_allocs: usize,
    pub active_allocs: usize,
    pub total_bytes: usize,
    pub active_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Default)]
struct TrackerState {
    live: HashMap<usize, AllocationRecord>,
    stats: TrackerStats,
}

impl TrackerState {
    fn retire(&mut self, size: usize) {
        self.stats.active_bytes = self.stats.active_bytes.saturating_sub(size);
        self.stats.active_allocs = self.stats.active_allocs.saturating_sub(1);
    }
}

/// Concurrent ledger of live allocations.
///
/// A single mutex serializes every read and write. It is only ever held for
/// in-memory updates, never across I/O.
pub struct MemoryTracker {
    state: Mutex<TrackerState>,
}

static GLOBAL_TRACKER: Lazy<MemoryTracker> = Lazy::new(MemoryTracker::new);

// Relative clock for record timestamps.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    // 0 means "not assigned yet".
    static THREAD_ID: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

fn now_ns() -> u64 {
    let elapsed = EPOCH.elapsed();
    elapsed.as_secs() * 1_000_000_000 + u64::from(elapsed.subsec_nanos())
}

/// Small, stable per-thread number. Threads are numbered in the order they
/// first allocate; numbers are not reused.
pub fn current_thread_id() -> u32 {
    THREAD_ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
        .unwrap_or(0)
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        MemoryTracker {
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// The process-wide tracker, created on first use.
    pub fn global() -> &'static MemoryTracker {
        &GLOBAL_TRACKER
    }

    /// Records a new live allocation. Calls with a zero address or size are
    /// ignored.
    pub fn on_alloc(
        &self,
        address: usize,
        size: usize,
        type_name: Option<&'static str>,
        file: Option<&'static str>,
        line: u32,
        is_array: bool,
    ) {
        if address == 0 || size == 0 {
            return;
        }

        let record = AllocationRecord {
            address,
            size,
            type_name,
            timestamp_ns: now_ns(),
            thread_id: current_thread_id(),
            file,
            line,
            is_array,
        };

        // The registry allocates while the lock is held; those allocations must
        // not come back here.
        let _guard = ReentryGuard::new();
        let mut state = self.state.lock();
        // An address can only be handed out again after it was freed. If the
        // free was never observed, drop the stale record's bytes first.
        if let Some(stale) = state.live.insert(address, record) {
            state.retire(stale.size);
        }

        let stats = &mut state.stats;
        stats.total_allocs += 1;
        stats.active_allocs += 1;
        stats.total_bytes = stats.total_bytes.saturating_add(size);
        stats.active_bytes = stats.active_bytes.saturating_add(size);
        stats.peak_bytes = stats.peak_bytes.max(stats.active_bytes);
    }

    /// Retires a live allocation. Freeing an address that is not tracked
    /// (allocated before instrumentation started, or already freed) is a
    /// no-op.
    pub fn on_free(&self, address: usize, _is_array: bool) {
        self.remove(address);
    }

    /// Retires a live allocation like [`MemoryTracker::on_free`] and hands
    /// back the record it removed.
    pub fn remove(&self, address: usize) -> Option<AllocationRecord> {
        if address == 0 {
            return None;
        }
        let _guard = ReentryGuard::new();
        let mut state = self.state.lock();
        let record = state.live.remove(&address)?;
        state.retire(record.size);
        Some(record)
    }

    /// Returns an independent copy of every live record, taken atomically with
    /// respect to `on_alloc`/`on_free`.
    pub fn snapshot_live(&self) -> Vec<AllocationRecord> {
        // Building the copy allocates; keep those allocations out of the
        // registry we are copying.
        let _guard = ReentryGuard::new();
        let state = self.state.lock();
        state.live.values().copied().collect()
    }

    pub fn stats(&self) -> TrackerStats {
        self.state.lock().stats
    }

    pub fn active_bytes(&self) -> usize {
        self.state.lock().stats.active_bytes
    }

    pub fn peak_bytes(&self) -> usize {
        self.state.lock().stats.peak_bytes
    }

    pub fn total_allocs(&self) -> usize {
        self.state.lock().stats.total_allocs
    }

    pub fn active_allocs(&self) -> usize {
        self.state.lock().stats.active_allocs
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().stats.total_bytes
    }

    /// Forgets every live record and zeroes all counters.
    pub fn reset(&self) {
        let _guard = ReentryGuard::new();
        *self.state.lock() = TrackerState::default();
    }
}

// `fork()` support, see `crate::fork`.
impl MemoryTracker {
    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.state.lock());
    }

    /// # Safety
    ///
    /// Must follow [`MemoryTracker::lock_for_fork`], once.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.state.force_unlock();
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("stats", &self.stats())
            .finish()
    }
}
