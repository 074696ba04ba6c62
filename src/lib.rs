//! `memprof` is an in-process heap profiler.  It observes every allocation and
//! deallocation made by the program, keeps a registry of the blocks that are
//! still live, and streams statistics about them to a consumer over TCP.
//!
//! Unlike sampling profilers, `memprof` records every call.  Each live block
//! carries its size, the thread that allocated it, a timestamp, and, when the
//! allocating code provides one, the source location and type it was
//! allocated for.
//!
//! ## Enabling `memprof` in a Rust program
//!
//! Configure [`TrackingAllocator`] as the global allocator and install the
//! tracker:
//!
//! ```
//! use memprof::TrackingAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: TrackingAllocator = TrackingAllocator::system();
//!
//! fn main() {
//!     memprof::install_tracker();
//!
//!     struct Widget([u8; 100]);
//!     let w = memprof::mp_new!(Widget, Widget([0; 100]));
//!     assert!(memprof::api::summary_json().contains("bytes_in_use"));
//!     drop(w);
//! }
//! ```
//!
//! ## Using `memprof` via `LD_PRELOAD`
//!
//! For programs in other languages, use the companion `lib_memprof` crate,
//! which builds a dynamic library that intercepts `malloc`, `calloc`,
//! `realloc` and `free`:
//!
//! ```bash
//! MEMPROF_STREAM=1 LD_PRELOAD=libmemprof_preload.so ./my_program
//! ```
//!
//! ## Streaming
//!
//! [`Transport`] connects to `127.0.0.1:7777` by default and writes one JSON
//! frame per line: a `SUMMARY` every 200ms and a `LIVE_ALLOCS` whenever the
//! peer sends a `SNAPSHOT` line.  The `mp_listen` tool from this crate plays
//! the peer's role:
//!
//! ```bash
//! mp_listen --port 7777 --snapshot-every 10
//! ```

mod block;
mod callbacks;
mod callsite;
mod config;
mod guard;
mod tracker;
mod transport;

pub mod api;
pub mod fork;
pub mod hook;
pub mod serializer;
pub mod wire;

pub use crate::api::install_tracker;
pub use crate::block::{BlockInfo, TrackerCallbacks};
pub use crate::callbacks::{
    callbacks, register_callbacks, AllocCallbacks, CallbackRegistry, CallbacksGuard,
    NoopCallbacks,
};
pub use crate::callsite::{
    clear_callsite, current_callsite, set_callsite, set_type_name, CallsiteInfo, ScopedCallsite,
};
pub use crate::config::{ConfigError, TransportConfig};
pub use crate::guard::{in_hook, ReentryGuard};
pub use crate::hook::TrackingAllocator;
pub use crate::tracker::{current_thread_id, AllocationRecord, MemoryTracker, TrackerStats};
pub use crate::transport::{Transport, TransportState};

/// Boxes `value` with the allocation attributed to the calling line and to
/// type `T`.
///
/// `value` is evaluated before the callsite is set, so allocations it makes
/// are not mistaken for the box itself.
#[macro_export]
macro_rules! mp_new {
    ($t:ty, $value:expr) => {{
        let value: $t = $value;
        let _callsite =
            $crate::ScopedCallsite::new(file!(), line!(), Some(::std::any::type_name::<$t>()));
        ::std::boxed::Box::<$t>::new(value)
    }};
}

/// Allocates a boxed slice of `len` copies of `init`, attributed to the
/// calling line and to type `T`, and marked as an array allocation.
#[macro_export]
macro_rules! mp_new_array {
    ($t:ty, $len:expr, $init:expr) => {{
        let init: $t = $init;
        let len: usize = $len;
        let _callsite =
            $crate::ScopedCallsite::array(file!(), line!(), Some(::std::any::type_name::<$t>()));
        ::std::vec![init; len].into_boxed_slice()
    }};
}

/// Attributes the next allocation on this thread to the calling line.
#[macro_export]
macro_rules! mp_set_callsite {
    () => {
        $crate::set_callsite(file!(), line!())
    };
}

/// Attributes the next allocation on this thread to type `T`.
#[macro_export]
macro_rules! mp_set_type_name {
    ($t:ty) => {
        $crate::set_type_name(::std::any::type_name::<$t>())
    };
}
