//! Keeping the tracker usable across `fork()`.
//!
//! Only the forking thread survives in the child. If another thread held the
//! tracker lock at that moment, the child would block on its first tracked
//! allocation. Register these with `pthread_atfork` so the lock is taken before
//! the fork and released on both sides after it.

use std::cell::RefCell;

use crate::guard::ReentryGuard;
use crate::tracker::MemoryTracker;

thread_local! {
    // Keeps this thread out of the tracker between `prepare` and `parent`/`child`.
    static FORK_GUARD: RefCell<Option<ReentryGuard>> = const { RefCell::new(None) };
}

/// Runs in the forking thread right before `fork()`.
pub fn prepare() {
    // Engaged first: anything allocating from here to the release must not
    // reach the tracker we are about to lock.
    let guard = ReentryGuard::new();
    MemoryTracker::global().lock_for_fork();
    let _ = FORK_GUARD.try_with(|slot| *slot.borrow_mut() = Some(guard));
}

/// Runs in the parent after `fork()`.
///
/// # Safety
///
/// Must be paired with a preceding [`prepare`] on the same thread.
pub unsafe fn parent() {
    release();
}

/// Runs in the child after `fork()`.
///
/// # Safety
///
/// Must be paired with a preceding [`prepare`] on the same thread.
pub unsafe fn child() {
    release();
}

unsafe fn release() {
    MemoryTracker::global().unlock_after_fork();
    let _ = FORK_GUARD.try_with(|slot| slot.borrow_mut().take());
}
