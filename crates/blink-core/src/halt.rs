//! `MachineHalt`: the sum type that replaces the source's `longjmp` to
//! `onhalt`. The dispatcher loop (`Actor`) propagates this up through an
//! explicit `Result` instead of a non-local exit, per the REDESIGN FLAGS in
//! spec §9.

use blink_types::Gva;

/// Why a guest thread stopped executing instructions. Every variant
/// corresponds to a case the source's `onhalt` continuation handles: guest
/// faults that become synchronous signal delivery, and the two ways a
/// thread legitimately stops (`Halt`, `ExitThread`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MachineHalt {
    /// A memory access failed permission/presence checks. Carries the
    /// faulting address and whether it was a protection violation (mapped,
    /// wrong permission) or a true miss (unmapped), mirroring
    /// `segvcode`/`SEGV_ACCERR` vs `SEGV_MAPERR`.
    SegFault { addr: Gva, protection: bool },
    DivByZero,
    /// The decoder rejected the byte stream at `ip`.
    DecodeError { ip: Gva },
    /// A well-formed but unimplemented/reserved opcode.
    Undef { ip: Gva },
    /// Cooperative shutdown: `killed` was observed at a safe point.
    Halt,
    ProtectionFault { ip: Gva },
    FpuException,
    SimdException,
    /// The guest called `exit`/`exit_group`. Carries the guest-supplied
    /// status code.
    ExitThread(i32),
    /// A deliverable signal's disposition was `Default` and the signal is
    /// fatal by default (§6): the thread terminates rather than resuming.
    Signaled(u32),
}

impl MachineHalt {
    /// `true` for the halts the source delivers as a synchronous guest
    /// signal (`blinksigs`: SIGSEGV, SIGILL, SIGFPE, SIGSYS, SIGTRAP),
    /// rather than a thread-lifecycle event.
    pub fn is_guest_fault(&self) -> bool {
        !matches!(
            self,
            MachineHalt::Halt | MachineHalt::ExitThread(_) | MachineHalt::Signaled(_)
        )
    }
}
