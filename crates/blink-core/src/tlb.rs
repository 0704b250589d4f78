//! The per-machine TLB: a small direct-indexed cache of recently translated
//! `(page, Pte)` pairs with an O(N) LRU bump, per spec §9's "manual TLB with
//! integer indices... keep as a small array in the Machine".

use blink_pagetab::Pte;

/// Number of TLB entries. Small enough that a linear scan for the LRU bump
/// is cheap, matching the source's fixed-size array.
pub const TLB_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Entry {
    page: u64,
    pte: Pte,
    /// Monotonic tick of last use; the lowest value is evicted.
    age: u64,
}

#[derive(Debug)]
pub struct Tlb {
    entries: [Option<Entry>; TLB_SIZE],
    clock: u64,
}

impl Default for Tlb {
    fn default() -> Self {
        Tlb {
            entries: [None; TLB_SIZE],
            clock: 0,
        }
    }
}

impl Tlb {
    pub fn new() -> Self {
        Tlb::default()
    }

    /// Looks up `page` (must already be page-aligned), bumping its age on
    /// hit.
    pub fn lookup(&mut self, page: u64) -> Option<Pte> {
        self.clock += 1;
        let clock = self.clock;
        for e in self.entries.iter_mut().flatten() {
            if e.page == page {
                e.age = clock;
                return Some(e.pte);
            }
        }
        None
    }

    /// Inserts or updates `page`'s translation, evicting the
    /// least-recently-used slot if the table is full.
    pub fn insert(&mut self, page: u64, pte: Pte) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(slot) = self.entries.iter_mut().find(|e| matches!(e, Some(e) if e.page == page)) {
            *slot = Some(Entry { page, pte, age: clock });
            return;
        }
        if let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) {
            *slot = Some(Entry { page, pte, age: clock });
            return;
        }
        let victim = self
            .entries
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, e)| e.unwrap().age)
            .map(|(i, _)| i)
            .unwrap();
        self.entries[victim] = Some(Entry { page, pte, age: clock });
    }

    /// Clears every entry, per invariant I6: called when `machine.invalidated`
    /// is observed at a safe point.
    pub fn clear(&mut self) {
        self.entries = [None; TLB_SIZE];
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blink_pagetab::PAGE_V;

    #[test]
    fn insert_then_lookup_hits() {
        let mut tlb = Tlb::new();
        tlb.insert(0x1000, Pte::from_raw(PAGE_V));
        assert!(tlb.lookup(0x1000).is_some());
        assert!(tlb.lookup(0x2000).is_none());
    }

    #[test]
    fn eviction_drops_the_least_recently_used_entry() {
        let mut tlb = Tlb::new();
        for i in 0..TLB_SIZE as u64 {
            tlb.insert(i * 0x1000, Pte::from_raw(PAGE_V));
        }
        // Touch every entry except page 0, which should then be the LRU victim.
        for i in 1..TLB_SIZE as u64 {
            tlb.lookup(i * 0x1000);
        }
        tlb.insert(TLB_SIZE as u64 * 0x1000, Pte::from_raw(PAGE_V));
        assert!(tlb.lookup(0).is_none());
        assert!(tlb.lookup(TLB_SIZE as u64 * 0x1000).is_some());
    }

    #[test]
    fn clear_empties_the_table() {
        let mut tlb = Tlb::new();
        tlb.insert(0x1000, Pte::from_raw(PAGE_V));
        tlb.clear();
        assert!(tlb.is_empty());
    }
}
