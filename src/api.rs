//! Pull-style access to the profiler for code running inside the profiled
//! process.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::TrackerCallbacks;
use crate::callbacks::{callbacks, register_callbacks};
use crate::serializer::{self, MessageKind};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Resumes recording allocations. Instrumentation starts out enabled.
pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

/// Stops recording new allocations. Frees are still reported so that blocks
/// recorded earlier leave the registry when released.
pub fn disable() {
    ENABLED.store(false, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Registers callbacks backed by the process-wide
/// [`MemoryTracker`](crate::MemoryTracker).
pub fn install_tracker() {
    register_callbacks(TrackerCallbacks::global());
}

/// A fresh snapshot id from the registered callbacks (0 when nothing is
/// registered).
pub fn snapshot_id() -> u64 {
    callbacks().snapshot_id()
}

pub fn summary_json() -> String {
    let cb = callbacks();
    serializer::summary_json(cb.bytes_in_use(), cb.peak_bytes(), cb.alloc_count())
}

pub fn live_allocs_csv() -> String {
    serializer::live_allocs_csv(&callbacks().live_blocks())
}

pub fn live_allocs_json() -> String {
    serializer::live_allocs_json(&callbacks().live_blocks())
}

/// `{"type":"SUMMARY","payload":{..}}`
pub fn summary_message_json() -> String {
    serializer::message_json(MessageKind::Summary, &summary_json())
}

/// `{"type":"LIVE_ALLOCS","payload":{"blocks":[..]}}`
pub fn live_allocs_message_json() -> String {
    serializer::message_json(MessageKind::LiveAllocs, &live_allocs_json())
}
