//! `System`: process-wide state shared by every `Machine` of one guest
//! process (§3, §4.8).

use crate::machine::{Machine, MAX_THREAD_IDS, MIN_THREAD_ID};
use blink_bus::Bus;
use blink_fds::Fds;
use blink_jit::Jit;
use blink_pagetab::PageTab;
use blink_perf::AtomicCounters;
use blink_types::CpuMode;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

/// Guest rlimits: semantic copies of `struct rlimit_linux`, indexed by the
/// guest `RLIMIT_*` constant (§3's `rlim[]`).
pub const RLIMIT_COUNT: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RLimit {
    pub cur: u64,
    pub max: u64,
}

impl Default for RLimit {
    fn default() -> Self {
        RLimit { cur: u64::MAX, max: u64::MAX }
    }
}

/// One process's worth of shared state: address space, file descriptors,
/// the JIT, and the registry of live threads. Destroyed exactly when its
/// last `Machine` exits (I5).
///
/// `pagetab` owns the `FileMap` provenance registry directly (reachable via
/// `PageTab::filemaps`) rather than `System` holding a separate lock for it:
/// every mutation that touches one must stay in lock step with the other
/// (`reserve_virtual_file`/`free_virtual`), so a second independently-locked
/// field would just be an invitation to update one without the other.
pub struct System {
    pub mode: CpuMode,
    pub bus: Bus,
    pub pagetab: Mutex<PageTab>,
    pub fds: Mutex<Fds>,
    pub jit: Jit,
    pub perf: AtomicCounters,
    pub rlim: Mutex<[RLimit; RLIMIT_COUNT]>,
    pub blinksigs: u64,

    next_tid: AtomicI32,
    /// Reference-counted list of live thread ids; `System` is conceptually
    /// destroyed when this becomes empty (I5). Modelled as a count rather
    /// than arena-indexed handles to the `Machine`s themselves, since each
    /// `Machine` is owned by the host thread driving it, not by `System`.
    pub machines: Mutex<Vec<i32>>,
    pub machines_cond: Condvar,
    pub sig_lock: Mutex<()>,
    pub mmap_lock: Mutex<()>,
    pub exec_lock: Mutex<()>,
    /// The guest's next-free-address hint for `mmap(NULL, ...)`, guarded
    /// separately from `mmap_lock` so a `find_virtual` scan under read
    /// access doesn't need the full write lock.
    pub brk_hint: RwLock<i64>,
}

impl System {
    /// `NewSystem(mode)`: allocates the PML4 (an empty `PageTab`) and every
    /// list/lock, with default rlimits and an empty signal mask.
    pub fn new(mode: CpuMode, arena_bytes: u64) -> Result<Self, blink_pagetab::PageTableError> {
        Ok(System {
            mode,
            bus: Bus::with_defaults(),
            pagetab: Mutex::new(PageTab::new(arena_bytes)?),
            fds: Mutex::new(Fds::new()),
            jit: Jit::with_defaults(),
            perf: AtomicCounters::new(),
            rlim: Mutex::new([RLimit::default(); RLIMIT_COUNT]),
            blinksigs: crate::signals::BLINK_SYNC_SIGNALS,
            next_tid: AtomicI32::new(MIN_THREAD_ID),
            machines: Mutex::new(Vec::new()),
            machines_cond: Condvar::new(),
            sig_lock: Mutex::new(()),
            mmap_lock: Mutex::new(()),
            exec_lock: Mutex::new(()),
            brk_hint: RwLock::new(0x4000_0000),
        })
    }

    /// Allocates the next guest thread id. The very first machine of a
    /// `System` gets the process pid instead (handled by the caller, which
    /// passes `pid` directly to `new_machine` only for that first thread).
    fn allocate_tid(&self) -> i32 {
        let mut tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        if tid >= MIN_THREAD_ID + MAX_THREAD_IDS {
            // Wrap, matching the source's modulo-a-monotonic-counter scheme.
            self.next_tid.store(MIN_THREAD_ID + 1, Ordering::Relaxed);
            tid = MIN_THREAD_ID;
        }
        tid
    }

    /// `NewMachine(sys, parent)`: registers a fresh or cloned `Machine` and
    /// returns it. `pid` is only honored the first time (when `machines` is
    /// empty); it seeds the thread id with the process pid rather than
    /// drawing from the thread-id range, per §4.8.
    pub fn new_machine(&self, parent: Option<&Machine>, pid: Option<i32>) -> Machine {
        let mut machines = self.machines.lock().unwrap();
        let tid = if machines.is_empty() {
            pid.unwrap_or_else(|| self.allocate_tid())
        } else {
            self.allocate_tid()
        };
        machines.push(tid);
        drop(machines);
        match parent {
            Some(p) => Machine::clone_from_parent(tid, p),
            None => Machine::new(tid),
        }
    }

    /// Called by a `Machine` as it exits (thread `exit`). Returns `true` if
    /// this was the last machine, i.e. the `System` is now eligible for
    /// `free` (I5).
    pub fn retire_machine(&self, tid: i32) -> bool {
        let mut machines = self.machines.lock().unwrap();
        machines.retain(|&t| t != tid);
        let empty = machines.is_empty();
        drop(machines);
        self.machines_cond.notify_all();
        empty
    }

    pub fn machine_count(&self) -> usize {
        self.machines.lock().unwrap().len()
    }

    /// `KillOtherThreads`: sets every peer's `killed` flag and waits until
    /// `machines` contains only `except_tid`. `peers` is the live set of
    /// `Machine` handles the caller can reach directly (in this workspace
    /// `Machine`s are host-thread-owned, so the caller supplies whichever
    /// it has visibility into — typically all of them via a shared
    /// registry built outside this crate).
    pub fn kill_other_threads(&self, peers: &[&Machine], except_tid: i32) {
        for peer in peers {
            if peer.tid != except_tid {
                peer.killed.store(true, Ordering::Release);
            }
        }
        let mut machines = self.machines.lock().unwrap();
        while machines.iter().any(|&t| t != except_tid) {
            machines = self.machines_cond.wait(machines).unwrap();
        }
    }

    /// `InvalidateSystem(sys, tlb, icache)`: broadcasts invalidation to every
    /// peer. Release ordering on the writer side; each `Machine` uses
    /// acquire when it observes the flag at its next safe point (§5).
    pub fn invalidate_system(&self, peers: &[&Machine], tlb: bool, icache: bool) {
        for peer in peers {
            if tlb {
                peer.invalidated.store(true, Ordering::Release);
            }
            if icache {
                peer.opcache.invalidated.store(true, Ordering::Release);
            }
        }
        tracing::debug!(tlb, icache, peers = peers.len(), "invalidation broadcast");
    }

    /// Pulls `memstat {committed, reserved, tables}` and the page-fault
    /// count from `pagetab` and republishes them onto `perf`'s gauges, so
    /// the `-s` stats dump reflects the address space's current state
    /// rather than whatever it was the last time a syscall happened to
    /// touch it. Called once per dispatcher `step` (§4.2 step 7).
    pub fn sync_memstat(&self) {
        let pt = self.pagetab.lock().unwrap();
        let stat = pt.memstat();
        let faults = pt.page_faults_handled();
        drop(pt);
        self.perf.set_bytes_reserved(stat.reserved);
        self.perf.set_bytes_committed(stat.committed);
        self.perf.set_bytes_tables(stat.tables);
        self.perf.set_page_faults_handled(faults);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_machine_takes_the_supplied_pid() {
        let sys = System::new(CpuMode::Long, 1 << 20).unwrap();
        let m = sys.new_machine(None, Some(4242));
        assert_eq!(m.tid, 4242);
        assert_eq!(sys.machine_count(), 1);
    }

    #[test]
    fn later_machines_draw_from_the_thread_id_range() {
        let sys = System::new(CpuMode::Long, 1 << 20).unwrap();
        let m0 = sys.new_machine(None, Some(100));
        let m1 = sys.new_machine(Some(&m0), None);
        assert!(m1.tid >= MIN_THREAD_ID);
        assert_ne!(m1.tid, m0.tid);
    }

    #[test]
    fn cloned_machine_inherits_registers_but_not_freelist() {
        let sys = System::new(CpuMode::Long, 1 << 20).unwrap();
        let mut parent = sys.new_machine(None, Some(1));
        parent.gpr[0] = 0xdead_beef;
        parent.freelist.push(vec![1, 2, 3]);
        let child = sys.new_machine(Some(&parent), None);
        assert_eq!(child.gpr[0], 0xdead_beef);
        assert!(child.freelist.is_empty());
    }

    #[test]
    fn retire_machine_reports_last_exit() {
        let sys = System::new(CpuMode::Long, 1 << 20).unwrap();
        let m0 = sys.new_machine(None, Some(1));
        let m1 = sys.new_machine(Some(&m0), None);
        assert!(!sys.retire_machine(m0.tid));
        assert!(sys.retire_machine(m1.tid));
    }

    #[test]
    fn invalidate_system_sets_flags_on_peers_only() {
        let sys = System::new(CpuMode::Long, 1 << 20).unwrap();
        let me = sys.new_machine(None, Some(1));
        let peer = sys.new_machine(Some(&me), None);
        sys.invalidate_system(&[&peer], true, true);
        assert!(peer.invalidated.load(Ordering::Acquire));
        assert!(peer.opcache.invalidated.load(Ordering::Acquire));
        assert!(!me.invalidated.load(Ordering::Acquire));
    }
}
