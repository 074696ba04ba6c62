//! Indirection between the allocation hook and whatever keeps the books.
//!
//! The hook only ever talks to the table registered here. Until something is
//! registered, [`NoopCallbacks`] answers every call.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use once_cell::sync::Lazy;

use crate::block::BlockInfo;
use crate::callsite::CallsiteInfo;

/// Operations the hook layer and the reporting API call into.
///
/// Every method has a no-op default, so an implementation only overrides the
/// operations it supports and callers never check for presence.
pub trait AllocCallbacks: Send + Sync {
    /// A block of `size` bytes was handed out at `address`.
    fn on_alloc(
        &self,
        _address: usize,
        _size: usize,
        _type_name: Option<&'static str>,
        _file: Option<&'static str>,
        _line: u32,
        _is_array: bool,
    ) {
    }

    /// The block at `address` is being released.
    fn on_free(&self, _address: usize) {}

    /// The block at `address` is being resized. Releases it like
    /// [`AllocCallbacks::on_free`] and returns the attribution it was recorded
    /// with, so the resized block can keep it.
    fn take_attribution(&self, address: usize) -> Option<CallsiteInfo> {
        self.on_free(address);
        None
    }

    fn bytes_in_use(&self) -> usize {
        0
    }

    fn peak_bytes(&self) -> usize {
        0
    }

    fn alloc_count(&self) -> usize {
        0
    }

    fn live_blocks(&self) -> Vec<BlockInfo> {
        Vec::new()
    }

    fn snapshot_id(&self) -> u64 {
        0
    }
}

/// The table in effect before anything is registered.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallbacks;

impl AllocCallbacks for NoopCallbacks {}

type Table = Box<dyn AllocCallbacks>;

/// Handle to the table that was current when it was obtained. Holding it
/// keeps that table alive even if another one is registered meanwhile.
pub type CallbacksGuard = Guard<Arc<Table>>;

/// A swappable callback table. Each registration publishes a new immutable
/// table; readers never lock and never observe a partially replaced one.
pub struct CallbackRegistry {
    table: ArcSwap<Table>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        let table: Table = Box::new(NoopCallbacks);
        CallbackRegistry {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Replaces the active table. Last writer wins.
    pub fn register<C>(&self, callbacks: C)
    where
        C: AllocCallbacks + 'static,
    {
        let table: Table = Box::new(callbacks);
        self.table.store(Arc::new(table));
    }

    /// Returns the active table.
    pub fn current(&self) -> CallbacksGuard {
        self.table.load()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry").finish_non_exhaustive()
    }
}

static REGISTRY: Lazy<CallbackRegistry> = Lazy::new(CallbackRegistry::new);

/// Installs `callbacks` as the process-wide table.
pub fn register_callbacks<C>(callbacks: C)
where
    C: AllocCallbacks + 'static,
{
    REGISTRY.register(callbacks);
}

/// The process-wide table; always populated.
pub fn callbacks() -> CallbacksGuard {
    REGISTRY.current()
}
