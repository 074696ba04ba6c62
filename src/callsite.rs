//! Thread-local record of *where* the next allocation comes from.
//!
//! Code that wants its allocations attributed sets the context right before
//! allocating (usually through [`mp_new!`](crate::mp_new) or
//! [`ScopedCallsite`]); the allocation hook consumes it and clears it.

use std::cell::Cell;

/// Source location and type of a pending allocation. All fields are optional.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallsiteInfo {
    pub file: Option<&'static str>,
    pub line: u32,
    pub type_name: Option<&'static str>,
    pub is_array: bool,
}

impl CallsiteInfo {
    pub const EMPTY: CallsiteInfo = CallsiteInfo {
        file: None,
        line: 0,
        type_name: None,
        is_array: false,
    };
}

thread_local! {
    static CALLSITE: Cell<CallsiteInfo> = const { Cell::new(CallsiteInfo::EMPTY) };
}

// Ignore errors accessing the TLS when the thread is being destroyed.
fn update(f: impl FnOnce(&mut CallsiteInfo)) {
    let _ = CALLSITE.try_with(|cs| {
        let mut info = cs.get();
        f(&mut info);
        cs.set(info);
    });
}

pub fn set_callsite(file: &'static str, line: u32) {
    update(|cs| {
        cs.file = Some(file);
        cs.line = line;
    });
}

pub fn set_type_name(name: &'static str) {
    update(|cs| cs.type_name = Some(name));
}

/// Returns a copy of the current thread's callsite context.
pub fn current_callsite() -> CallsiteInfo {
    CALLSITE.try_with(Cell::get).unwrap_or(CallsiteInfo::EMPTY)
}

pub fn clear_callsite() {
    let _ = CALLSITE.try_with(|cs| cs.set(CallsiteInfo::EMPTY));
}

fn replace_callsite(info: CallsiteInfo) -> CallsiteInfo {
    CALLSITE
        .try_with(|cs| cs.replace(info))
        .unwrap_or(CallsiteInfo::EMPTY)
}

/// Sets the callsite context for the lifetime of the guard and restores the
/// previous context when dropped.
#[derive(Debug)]
pub struct ScopedCallsite {
    prev: CallsiteInfo,
}

impl ScopedCallsite {
    pub fn new(file: &'static str, line: u32, type_name: Option<&'static str>) -> Self {
        Self::with_info(CallsiteInfo {
            file: Some(file),
            line,
            type_name,
            is_array: false,
        })
    }

    /// Like [`ScopedCallsite::new`], but marks the allocation as an array.
    pub fn array(file: &'static str, line: u32, type_name: Option<&'static str>) -> Self {
        Self::with_info(CallsiteInfo {
            file: Some(file),
            line,
            type_name,
            is_array: true,
        })
    }

    pub fn with_info(info: CallsiteInfo) -> Self {
        ScopedCallsite {
            prev: replace_callsite(info),
        }
    }
}

impl Drop for ScopedCallsite {
    fn drop(&mut self) {
        replace_callsite(self.prev);
    }
}
