//! Wire-facing view of live allocations and the tracker-backed callback table.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::callbacks::AllocCallbacks;
use crate::callsite::CallsiteInfo;
use crate::guard::ReentryGuard;
use crate::tracker::{AllocationRecord, MemoryTracker};

const UNKNOWN_FILE: &str = "?";
const UNKNOWN_TYPE: &str = "unknown";

/// One live block as sent to consumers.
///
/// `alloc_id` numbers blocks as they are transmitted; it says nothing about
/// the allocation's identity, which is `ptr`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(with = "address_string")]
    pub ptr: usize,
    pub size: usize,
    pub alloc_id: u64,
    pub thread_id: u32,
    pub t_ns: u64,
    pub callsite: String,
    pub file: String,
    pub line: u32,
    pub type_name: String,
}

impl BlockInfo {
    pub fn from_record(record: &AllocationRecord, alloc_id: u64) -> Self {
        let (file, line, callsite) = match record.file {
            Some(file) if !file.is_empty() => (
                file.to_owned(),
                record.line,
                format!("{}:{}", file, record.line),
            ),
            _ => (UNKNOWN_FILE.to_owned(), 0, format!("{}:0", UNKNOWN_FILE)),
        };
        let type_name = match record.type_name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => UNKNOWN_TYPE.to_owned(),
        };
        BlockInfo {
            ptr: record.address,
            size: record.size,
            alloc_id,
            thread_id: record.thread_id,
            t_ns: record.timestamp_ns,
            callsite,
            file,
            line,
            type_name,
        }
    }
}

// Addresses travel as decimal strings so consumers with 53-bit numbers do not
// mangle them.
mod address_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(ptr: &usize, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(ptr)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Callback table backed by a [`MemoryTracker`].
#[derive(Debug)]
pub struct TrackerCallbacks {
    tracker: &'static MemoryTracker,
    next_block_id: AtomicU64,
    next_snapshot_id: AtomicU64,
}

impl TrackerCallbacks {
    pub fn new(tracker: &'static MemoryTracker) -> Self {
        TrackerCallbacks {
            tracker,
            next_block_id: AtomicU64::new(0),
            next_snapshot_id: AtomicU64::new(1),
        }
    }

    /// Callbacks over [`MemoryTracker::global`].
    pub fn global() -> Self {
        Self::new(MemoryTracker::global())
    }

    pub fn tracker(&self) -> &'static MemoryTracker {
        self.tracker
    }
}

impl AllocCallbacks for TrackerCallbacks {
    fn on_alloc(
        &self,
        address: usize,
        size: usize,
        type_name: Option<&'static str>,
        file: Option<&'static str>,
        line: u32,
        is_array: bool,
    ) {
        self.tracker
            .on_alloc(address, size, type_name, file, line, is_array);
    }

    fn on_free(&self, address: usize) {
        self.tracker.on_free(address, false);
    }

    fn take_attribution(&self, address: usize) -> Option<CallsiteInfo> {
        self.tracker.remove(address).map(|record| CallsiteInfo {
            file: record.file,
            line: record.line,
            type_name: record.type_name,
            is_array: record.is_array,
        })
    }

    fn bytes_in_use(&self) -> usize {
        self.tracker.active_bytes()
    }

    fn peak_bytes(&self) -> usize {
        self.tracker.peak_bytes()
    }

    fn alloc_count(&self) -> usize {
        self.tracker.total_allocs()
    }

    fn live_blocks(&self) -> Vec<BlockInfo> {
        let _guard = ReentryGuard::new();
        self.tracker
            .snapshot_live()
            .iter()
            .map(|record| {
                let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
                BlockInfo::from_record(record, id)
            })
            .collect()
    }

    fn snapshot_id(&self) -> u64 {
        self.next_snapshot_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_tracker() -> &'static MemoryTracker {
        Box::leak(Box::new(MemoryTracker::new()))
    }

    #[test]
    fn block_from_record_with_callsite() {
        let record = AllocationRecord {
            address: 4096,
            size: 100,
            type_name: Some("Widget"),
            timestamp_ns: 77,
            thread_id: 3,
            file: Some("demo.cpp"),
            line: 10,
            is_array: false,
        };
        let b = BlockInfo::from_record(&record, 9);
        assert_eq!(b.ptr, 4096);
        assert_eq!(b.alloc_id, 9);
        assert_eq!(b.callsite, "demo.cpp:10");
        assert_eq!(b.file, "demo.cpp");
        assert_eq!(b.type_name, "Widget");
        assert_eq!(b.t_ns, 77);
    }

    #[test]
    fn block_from_record_without_callsite() {
        let record = AllocationRecord {
            address: 1,
            size: 1,
            type_name: None,
            timestamp_ns: 0,
            thread_id: 1,
            file: Some(""),
            line: 12,
            is_array: true,
        };
        let b = BlockInfo::from_record(&record, 0);
        assert_eq!(b.callsite, "?:0");
        assert_eq!(b.file, "?");
        assert_eq!(b.line, 0);
        assert_eq!(b.type_name, "unknown");
    }

    #[test]
    fn ptr_serializes_as_string() {
        let b = BlockInfo {
            ptr: 140_000_000_000_123,
            size: 8,
            alloc_id: 0,
            thread_id: 1,
            t_ns: 5,
            callsite: "?:0".into(),
            file: "?".into(),
            line: 0,
            type_name: "unknown".into(),
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.starts_with(r#"{"ptr":"140000000000123","size":8,"#));
        let back: BlockInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn tracker_callbacks_forward_to_tracker() {
        let cb = TrackerCallbacks::new(leaked_tracker());
        cb.on_alloc(0x100, 64, Some("T"), Some("x.rs"), 4, false);
        cb.on_alloc(0x200, 32, None, None, 0, true);
        assert_eq!(cb.bytes_in_use(), 96);
        assert_eq!(cb.alloc_count(), 2);

        cb.on_free(0x100);
        assert_eq!(cb.bytes_in_use(), 32);
        assert_eq!(cb.peak_bytes(), 96);
        assert_eq!(cb.alloc_count(), 2);
        assert_eq!(cb.tracker().active_allocs(), 1);
    }

    #[test]
    fn take_attribution_retires_and_returns_callsite() {
        let cb = TrackerCallbacks::new(leaked_tracker());
        cb.on_alloc(0x300, 48, Some("Row"), Some("table.rs"), 21, true);
        let info = cb.take_attribution(0x300).unwrap();
        assert_eq!(info.file, Some("table.rs"));
        assert_eq!(info.line, 21);
        assert_eq!(info.type_name, Some("Row"));
        assert!(info.is_array);
        assert_eq!(cb.bytes_in_use(), 0);
        assert_eq!(cb.take_attribution(0x300), None);
    }

    #[test]
    fn block_ids_are_assigned_per_transmission() {
        let cb = TrackerCallbacks::new(leaked_tracker());
        cb.on_alloc(0x100, 8, None, None, 0, false);
        let first = cb.live_blocks();
        let second = cb.live_blocks();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].ptr, second[0].ptr);
        assert!(second[0].alloc_id > first[0].alloc_id);
    }

    #[test]
    fn snapshot_ids_increase() {
        let cb = TrackerCallbacks::new(leaked_tracker());
        let a = cb.snapshot_id();
        let b = cb.snapshot_id();
        assert!(a >= 1);
        assert_eq!(b, a + 1);
    }
}
