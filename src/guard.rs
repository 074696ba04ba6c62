//! Per-thread reentrancy flag.
//!
//! Tracking code allocates (hash map inserts, snapshot vectors, JSON strings).
//! Those allocations re-enter the allocator on the same thread; the flag below
//! tells the hook to pass them straight through instead of recording them.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // Set while the current thread is executing tracking code.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if the current thread is already inside tracking code.
///
/// During thread teardown the flag may be gone; report `true` so that
/// allocations made by TLS destructors pass through untracked.
pub fn in_hook() -> bool {
    IN_HOOK.try_with(Cell::get).unwrap_or(true)
}

/// Marks the current thread as being inside tracking code for the lifetime of
/// the guard. The previous value of the flag is restored on drop, so guards
/// nest.
#[derive(Debug)]
pub struct ReentryGuard {
    prev: bool,
    // The flag is thread-local; the guard must be dropped on the thread that
    // created it.
    _not_send: PhantomData<*const ()>,
}

impl ReentryGuard {
    pub fn new() -> Self {
        let prev = IN_HOOK.try_with(|flag| flag.replace(true)).unwrap_or(true);
        ReentryGuard {
            prev,
            _not_send: PhantomData,
        }
    }
}

impl Default for ReentryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        let _ = IN_HOOK.try_with(|flag| flag.set(prev));
    }
}
