//! `Machine`: per-guest-thread state, bound 1:1 to a host thread for its
//! lifetime (§3, §5).

use crate::opcache::OpCache;
use crate::signals::SignalState;
use crate::tlb::Tlb;
use blink_flags::Flags;
use blink_types::{Gpr, Gva};
use std::sync::atomic::{AtomicBool, Ordering};

/// Guest thread id space, per §4.8: drawn from `[MIN_THREAD_ID, MIN_THREAD_ID
/// + MAX_THREAD_IDS)`. The first machine created for a `System` reuses the
/// process id instead of drawing from this range.
pub const MIN_THREAD_ID: i32 = 64;
pub const MAX_THREAD_IDS: i32 = 65536;

/// Per-thread register file, segment bases, and the bookkeeping the
/// dispatcher/JIT/memory layers consult every instruction.
pub struct Machine {
    pub tid: i32,
    pub gpr: [u64; Gpr::COUNT],
    pub fs_base: u64,
    pub gs_base: u64,
    pub ip: Gva,
    /// Saved for fault reporting: the `ip` at the start of the instruction
    /// currently being executed, restored into the guest-visible state on a
    /// trap so `si_addr`/`ucontext_linux.rip` reports the faulting
    /// instruction rather than whatever `ip` was advanced to mid-decode.
    pub oldip: Gva,
    pub flags: Flags,
    pub tlb: Tlb,
    pub opcache: OpCache,
    /// Set by a peer's `InvalidateSystem`; cleared (after clearing the TLB)
    /// by this machine at its next safe point (I6).
    pub invalidated: AtomicBool,
    /// Set by `KillOtherThreads`/`exit_group`; observed at the next safe
    /// point, at which point the dispatcher unwinds to `MachineHalt::Halt`.
    pub killed: AtomicBool,
    /// Per-instruction scratch arena, freed by `collect_garbage` once per
    /// guest instruction (§5).
    pub freelist: Vec<Vec<u8>>,
    pub signals: SignalState,
    /// `true` while this machine holds a lease on an in-progress JIT block
    /// (`Jit::start_jit` was called but neither `finish_jit` nor
    /// `abandon_jit` yet); used so `KillOtherThreads` knows to abandon
    /// rather than leak the lease.
    pub compiling: bool,
}

impl Machine {
    /// A freshly created machine with zeroed register state — `NewMachine`
    /// with `parent = None`.
    pub fn new(tid: i32) -> Self {
        Machine {
            tid,
            gpr: [0; Gpr::COUNT],
            fs_base: 0,
            gs_base: 0,
            ip: Gva::new_unchecked(0),
            oldip: Gva::new_unchecked(0),
            flags: Flags::from_raw(0),
            tlb: Tlb::new(),
            opcache: OpCache::new(),
            invalidated: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            freelist: Vec::new(),
            signals: SignalState::new(),
            compiling: false,
        }
    }

    /// `NewMachine(sys, parent)`: clones `parent`'s registers, segment
    /// bases, flags, and signal mask/dispositions — explicitly *not* its
    /// freelist, TLB, ICache, or in-progress JIT path, matching the data
    /// model's note that those are per-thread scratch rather than inherited
    /// guest-visible state.
    pub fn clone_from_parent(tid: i32, parent: &Machine) -> Self {
        let mut m = Machine::new(tid);
        m.gpr = parent.gpr;
        m.fs_base = parent.fs_base;
        m.gs_base = parent.gs_base;
        m.ip = parent.ip;
        m.flags = parent.flags;
        m.signals.mask = parent.signals.mask;
        m.signals.dispositions = parent.signals.dispositions;
        m
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// Pushes a scratch buffer onto the freelist, returning a slice handle
    /// into it (the "Schlep" pattern of §4.3: memory that outlives the
    /// individual host call but is reclaimed at the next safe point).
    pub fn borrow_scratch(&mut self, buf: Vec<u8>) -> usize {
        self.freelist.push(buf);
        self.freelist.len() - 1
    }

    /// `CollectGarbage(m, 0)`: releases every scratch buffer allocated since
    /// the last call. Called once per guest instruction and at explicit
    /// dispatcher boundaries (§5).
    pub fn collect_garbage(&mut self) {
        self.freelist.clear();
    }

    /// Safe-point check (b): if a peer set `invalidated`, clear the TLB and
    /// acknowledge. Returns whether anything was invalidated.
    pub fn observe_invalidation(&mut self) -> bool {
        if self.invalidated.swap(false, Ordering::AcqRel) {
            self.tlb.clear();
            true
        } else {
            false
        }
    }

    /// Safe-point check (c): if a peer set the ICache's invalidated flag,
    /// empty it.
    pub fn observe_icache_invalidation(&mut self) -> bool {
        if self.opcache.take_invalidated() {
            self.opcache.clear();
            true
        } else {
            false
        }
    }

    /// Safe-point check (a): `true` if this machine should unwind to
    /// `MachineHalt::Halt`.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}
