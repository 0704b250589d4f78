//! Lock-free-read hook table: guest virtual address → compiled stub id.
//!
//! Grounded on `jit.h`'s `struct JitHooks` (parallel `virt[]`/`func[]` arrays
//! swapped under a generation counter) and the design note in §9 that the
//! relaxed/release orderings on the hook table must be preserved exactly.
//! Writers serialize through `write_lock` and bump `generation` to an odd
//! value before mutating, then back to even; a reader that observes the
//! generation change across its read retries. This reproduces the retry
//! protocol without unsafe raw-pointer games: the parallel arrays are a
//! `HashMap` behind an `RwLock`, which the single writer lock keeps
//! consistent with the generation counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// A compiled stub's identity within its owning `JitBlock`, opaque outside
/// this crate's bookkeeping.
pub type StubId = u32;

#[derive(Default)]
pub struct HookTable {
    generation: AtomicU64,
    write_lock: Mutex<()>,
    table: RwLock<HashMap<u64, StubId>>,
    pub(crate) installs: AtomicU64,
    pub(crate) removals: AtomicU64,
}

impl HookTable {
    pub fn new() -> Self {
        HookTable::default()
    }

    /// Lock-free lookup: reads the table, then confirms the generation
    /// counter didn't change (and wasn't mid-mutation) across the read. A
    /// torn read retries rather than returning a stale or partial result.
    pub fn get(&self, virt: u64) -> Option<StubId> {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let value = self.table.read().unwrap().get(&virt).copied();
            let after = self.generation.load(Ordering::Acquire);
            if before == after {
                return value;
            }
        }
    }

    /// Installs or replaces the hook for `virt`. Matches `SetJitHook`:
    /// replacing an existing hook counts as both a removal and an install,
    /// a quirk the source's `SetJitHookUnlocked` has and this preserves
    /// rather than "fixing".
    pub fn set(&self, virt: u64, stub: StubId) {
        let _guard = self.write_lock.lock().unwrap();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut table = self.table.write().unwrap();
        if table.insert(virt, stub).is_some() {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        self.installs.fetch_add(1, Ordering::Relaxed);
        drop(table);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove(&self, virt: u64) -> Option<StubId> {
        let _guard = self.write_lock.lock().unwrap();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.table.write().unwrap().remove(&virt);
        if removed.is_some() {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        removed
    }

    /// Removes every hook whose key lies on `page` (the 4 KiB-aligned guest
    /// address), used by `reset_jit_page`.
    pub fn remove_page(&self, page: u64, page_size: u64) -> Vec<u64> {
        let _guard = self.write_lock.lock().unwrap();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut table = self.table.write().unwrap();
        let doomed: Vec<u64> = table
            .keys()
            .copied()
            .filter(|&v| v & !(page_size - 1) == page)
            .collect();
        for v in &doomed {
            table.remove(v);
        }
        self.removals.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        drop(table);
        self.generation.fetch_add(1, Ordering::AcqRel);
        doomed
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_set_returns_the_same_stub() {
        let hooks = HookTable::new();
        hooks.set(0x1000, 7);
        assert_eq!(hooks.get(0x1000), Some(7));
        assert_eq!(hooks.get(0x2000), None);
    }

    #[test]
    fn replacing_a_hook_counts_as_install_and_removal() {
        let hooks = HookTable::new();
        hooks.set(0x1000, 1);
        hooks.set(0x1000, 2);
        assert_eq!(hooks.get(0x1000), Some(2));
        assert_eq!(hooks.installs.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.removals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_page_clears_every_hook_on_that_page() {
        let hooks = HookTable::new();
        hooks.set(0x1000, 1);
        hooks.set(0x1010, 2);
        hooks.set(0x2000, 3);
        let removed = hooks.remove_page(0x1000, 4096);
        assert_eq!(removed.len(), 2);
        assert_eq!(hooks.get(0x1000), None);
        assert_eq!(hooks.get(0x1010), None);
        assert_eq!(hooks.get(0x2000), Some(3));
    }
}
