//! Per-machine instruction cache: a direct-mapped cache of decoded
//! instructions keyed by guest PC, plus the one-entry page-translation
//! cache for the page containing `ip` (§4.4/§4.6).

use blink_x86::DecodedInsn;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of ICache slots. Must be a power of two; the source's direct-map
/// index is `ip & (K-1)`.
pub const ICACHE_SIZE: usize = 1024;

struct Slot {
    /// Guest address of the cached decode, `None` if the slot is empty.
    gva: Option<u64>,
    bytes: Vec<u8>,
    insn: Option<DecodedInsn>,
}

/// Bounce buffer for an access that straddles a page boundary:
/// `opcache.stash`/`stashaddr`/`stashsize`/`writable` in the data model.
pub struct Stash {
    pub addr: u64,
    pub buf: Vec<u8>,
    pub writable: bool,
}

pub struct OpCache {
    slots: Vec<Slot>,
    /// Host page currently backing `codevirt`; `None` until the first fetch.
    codevirt: Option<u64>,
    codehost: u64,
    /// Flipped by a peer's `InvalidateSystem` call; cleared (and the table
    /// emptied) by the owning machine at its next safe point (I6).
    pub invalidated: AtomicBool,
    pub stash: Option<Stash>,
}

impl OpCache {
    pub fn new() -> Self {
        let slots = (0..ICACHE_SIZE)
            .map(|_| Slot {
                gva: None,
                bytes: Vec::new(),
                insn: None,
            })
            .collect();
        OpCache {
            slots,
            codevirt: None,
            codehost: 0,
            invalidated: AtomicBool::new(false),
            stash: None,
        }
    }

    fn index(gva: u64) -> usize {
        (gva as usize) & (ICACHE_SIZE - 1)
    }

    /// Looks up a cached decode for `gva`, valid only if the cached opcode
    /// bytes still match what's at `current_bytes` (the "ICache validity
    /// key" of §4.4: bytes match *and* the containing host page is the one
    /// remembered in `codevirt`, checked by the caller before calling this).
    pub fn lookup(&self, gva: u64, current_bytes: &[u8]) -> Option<&DecodedInsn> {
        let slot = &self.slots[Self::index(gva)];
        if slot.gva != Some(gva) {
            return None;
        }
        if slot.bytes.len() > current_bytes.len() {
            return None;
        }
        if slot.bytes != current_bytes[..slot.bytes.len()] {
            return None;
        }
        slot.insn.as_ref()
    }

    pub fn insert(&mut self, gva: u64, bytes: &[u8], insn: DecodedInsn) {
        let slot = &mut self.slots[Self::index(gva)];
        slot.gva = Some(gva);
        slot.bytes = bytes.to_vec();
        slot.insn = Some(insn);
    }

    /// Records which host page currently backs guest `ip`'s containing
    /// page, used to decide whether a cached decode's page is still the one
    /// remembered (part of the validity key).
    pub fn remember_page(&mut self, virt_page: u64, host_page: u64) {
        self.codevirt = Some(virt_page);
        self.codehost = host_page;
    }

    pub fn page_matches(&self, virt_page: u64, host_page: u64) -> bool {
        self.codevirt == Some(virt_page) && self.codehost == host_page
    }

    /// Empties every slot, per I6. Called when `invalidated` was observed
    /// true at a safe point, or when the remembered host page changed.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.gva = None;
            slot.bytes.clear();
            slot.insn = None;
        }
        self.codevirt = None;
        self.invalidated.store(false, Ordering::Release);
    }

    pub fn take_invalidated(&self) -> bool {
        self.invalidated.swap(false, Ordering::AcqRel)
    }
}

impl Default for OpCache {
    fn default() -> Self {
        OpCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blink_decoder::DecodeMode;

    fn insn_at(ip: u64, bytes: &[u8]) -> DecodedInsn {
        blink_x86::decode(bytes, ip, DecodeMode::Bits64).unwrap()
    }

    #[test]
    fn hit_requires_matching_bytes() {
        let mut oc = OpCache::new();
        let bytes = [0x90u8]; // nop
        oc.insert(0x1000, &bytes, insn_at(0x1000, &bytes));
        assert!(oc.lookup(0x1000, &bytes).is_some());
        assert!(oc.lookup(0x1000, &[0xCC]).is_none());
    }

    #[test]
    fn clear_empties_every_slot_and_the_page_memory() {
        let mut oc = OpCache::new();
        let bytes = [0x90u8];
        oc.insert(0x1000, &bytes, insn_at(0x1000, &bytes));
        oc.remember_page(0x1000, 0xdead0000);
        oc.clear();
        assert!(oc.lookup(0x1000, &bytes).is_none());
        assert!(!oc.page_matches(0x1000, 0xdead0000));
    }

    #[test]
    fn invalidated_flag_round_trips() {
        let oc = OpCache::new();
        assert!(!oc.take_invalidated());
        oc.invalidated.store(true, Ordering::Release);
        assert!(oc.take_invalidated());
        assert!(!oc.take_invalidated());
    }
}
