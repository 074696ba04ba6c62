//! Allocation interception.
//!
//! [`record_alloc`] and [`record_free`] are the single path from "memory was
//! handed out / given back" to the registered callbacks. [`TrackingAllocator`]
//! drives them for Rust's global allocator; the `lib_memprof` companion crate
//! drives them for `malloc`/`free` when loaded with `LD_PRELOAD`.

use std::alloc::{GlobalAlloc, Layout, System};

use crate::api;
use crate::callbacks::callbacks;
use crate::callsite::{clear_callsite, current_callsite, CallsiteInfo};
use crate::guard::{in_hook, ReentryGuard};

/// Reports a block of `size` bytes at `ptr` to the registered callbacks,
/// attributed to the current callsite context, and then clears the context.
///
/// Does nothing for a null pointer, while instrumentation is disabled, or when
/// called from inside tracking code on this thread.
pub fn record_alloc(ptr: *mut u8, size: usize, is_array: bool) {
    report_alloc(ptr, size, is_array, None);
}

/// Reports that the block at `ptr` is about to be released.
///
/// Frees are reported even while instrumentation is disabled so that blocks
/// recorded earlier do not linger in the registry.
pub fn record_free(ptr: *mut u8) {
    if ptr.is_null() || in_hook() {
        return;
    }
    let _guard = ReentryGuard::new();
    callbacks().on_free(ptr as usize);
}

/// First half of a resize: retires the block at `ptr` before the underlying
/// allocator may hand its address out again, and returns the attribution it
/// was recorded with.
pub fn record_realloc_free(ptr: *mut u8) -> Option<CallsiteInfo> {
    if ptr.is_null() || in_hook() {
        return None;
    }
    let _guard = ReentryGuard::new();
    callbacks().take_attribution(ptr as usize)
}

/// Second half of a resize: records the block now at `ptr` (the new block, or
/// the old one if the resize failed) with the attribution taken by
/// [`record_realloc_free`]. Without one, the current callsite context is used.
pub fn record_realloc_alloc(ptr: *mut u8, size: usize, carried: Option<CallsiteInfo>) {
    report_alloc(ptr, size, false, carried);
}

fn report_alloc(ptr: *mut u8, size: usize, is_array: bool, carried: Option<CallsiteInfo>) {
    if ptr.is_null() || in_hook() {
        return;
    }
    if !api::is_enabled() {
        // A context set while disabled must not stick to a later allocation.
        clear_callsite();
        return;
    }
    let _guard = ReentryGuard::new();
    let cs = carried.unwrap_or_else(current_callsite);
    callbacks().on_alloc(
        ptr as usize,
        size,
        cs.type_name,
        cs.file,
        cs.line,
        is_array || cs.is_array,
    );
    clear_callsite();
}

// The underlying allocator is never asked for zero bytes.
fn non_zero(layout: Layout) -> Layout {
    if layout.size() != 0 {
        return layout;
    }
    // SAFETY: `align` comes from a valid layout, so it is a non-zero power of
    // two, and rounding 1 up to it cannot overflow `isize`.
    unsafe { Layout::from_size_align_unchecked(1, layout.align()) }
}

/// Global allocator that forwards to `A` and reports every allocation and
/// deallocation through the hook. Use the `global_allocator` attribute to
/// enable it:
///
/// ```
/// use memprof::TrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator = TrackingAllocator::system();
///
/// fn main() {
///     memprof::install_tracker();
/// }
/// ```
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    pub const fn system() -> Self {
        TrackingAllocator { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        TrackingAllocator { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let layout = non_zero(layout);
        let ptr = self.inner.alloc(layout);
        // A null result is passed back untracked; the caller treats it as
        // allocation failure.
        record_alloc(ptr, layout.size(), false);
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let layout = non_zero(layout);
        let ptr = self.inner.alloc_zeroed(layout);
        record_alloc(ptr, layout.size(), false);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        record_free(ptr);
        self.inner.dealloc(ptr, non_zero(layout));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let layout = non_zero(layout);
        let new_size = new_size.max(1);
        let carried = record_realloc_free(ptr);
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if new_ptr.is_null() {
            // The old block is still valid and still owned by the caller.
            record_realloc_alloc(ptr, layout.size(), carried);
        } else {
            record_realloc_alloc(new_ptr, new_size, carried);
        }
        new_ptr
    }
}
