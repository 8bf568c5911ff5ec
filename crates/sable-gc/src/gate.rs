//! Collection gate
//!
//! Threads that touch objects outside the collector take a shared
//! [`GcScopeGuard`]; a collection takes the gate exclusively, so it waits for
//! every outstanding scope and blocks new ones until reachability analysis
//! is over. Status is published through atomics so any thread can poll it
//! without taking the lock.

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::purge::PurgePhase;

/// Shared lock and status between the collector and other threads.
#[derive(Debug)]
pub struct GcGate {
    lock: RwLock<()>,
    collecting: AtomicCell<bool>,
    purge_phase: AtomicCell<PurgePhase>,
    collections: AtomicCell<u64>,
}

/// Holding this keeps collections from starting.
#[must_use = "the scope ends when the guard is dropped"]
pub struct GcScopeGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl Default for GcGate {
    fn default() -> Self {
        Self::new()
    }
}

impl GcGate {
    /// Open gate
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            collecting: AtomicCell::new(false),
            purge_phase: AtomicCell::new(PurgePhase::Idle),
            collections: AtomicCell::new(0),
        }
    }

    /// Enter a scope, waiting for a running collection to finish.
    ///
    /// Scopes nest on one thread.
    pub fn scope(&self) -> GcScopeGuard<'_> {
        GcScopeGuard {
            _guard: self.lock.read_recursive(),
        }
    }

    /// Enter a scope unless a collection holds the gate
    pub fn try_scope(&self) -> Option<GcScopeGuard<'_>> {
        self.lock
            .try_read_recursive()
            .map(|guard| GcScopeGuard { _guard: guard })
    }

    /// Whether reachability analysis is running
    pub fn is_collecting(&self) -> bool {
        self.collecting.load()
    }

    /// Current purge phase
    pub fn purge_phase(&self) -> PurgePhase {
        self.purge_phase.load()
    }

    /// Whether a purge from the last collection is still in progress
    pub fn is_purge_pending(&self) -> bool {
        self.purge_phase() != PurgePhase::Idle
    }

    /// Completed collections
    pub fn collections(&self) -> u64 {
        self.collections.load()
    }

    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub(crate) fn try_lock_exclusive(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.lock.try_write()
    }

    pub(crate) fn set_collecting(&self, collecting: bool) {
        self.collecting.store(collecting);
    }

    pub(crate) fn set_purge_phase(&self, phase: PurgePhase) {
        self.purge_phase.store(phase);
    }

    pub(crate) fn record_collection(&self) {
        self.collections.fetch_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_blocks_exclusive_lock() {
        let gate = GcGate::new();
        let scope = gate.scope();
        let nested = gate.scope();
        assert!(gate.try_lock_exclusive().is_none());
        drop(nested);
        drop(scope);
        assert!(gate.try_lock_exclusive().is_some());
    }

    #[test]
    fn test_exclusive_lock_blocks_try_scope() {
        let gate = GcGate::new();
        let guard = gate.lock_exclusive();
        assert!(gate.try_scope().is_none());
        drop(guard);
        assert!(gate.try_scope().is_some());
    }

    #[test]
    fn test_status_is_published() {
        let gate = GcGate::new();
        gate.set_collecting(true);
        gate.set_purge_phase(PurgePhase::Delete);
        gate.record_collection();
        assert!(gate.is_collecting());
        assert!(gate.is_purge_pending());
        assert_eq!(gate.collections(), 1);
    }
}
