//! Interfaces to the two collaborators spec.md §1 puts out of scope: the
//! opcode semantic table and the syscall dispatcher. This crate only
//! specifies their shape; `blink` (or a test) supplies the implementation.

use crate::halt::MachineHalt;
use crate::machine::Machine;
use crate::system::System;
use blink_x86::DecodedInsn;

/// The external semantic table: opcode bytes in, guest-register/guest-memory
/// side effects out. One call per instruction the dispatcher steps, whether
/// that instruction came from the interpreter's fetch/decode or a JIT stub's
/// `Stub::Op` slot.
pub trait OpcodeTable {
    /// Executes one decoded instruction against `machine`'s state, advancing
    /// `machine.ip` by the instruction's own length unless it performed a
    /// control transfer (in which case it sets `ip` directly). Returns
    /// `Err` only for the `MachineHalt` variants a micro-op can legitimately
    /// raise (`SegFault` via an underlying `Memory` call, `DivByZero`,
    /// `Undef`, `FpuException`/`SimdException`, `ExitThread`); `Halt` and
    /// `DecodeError` are raised by the dispatcher itself, never by a
    /// micro-op.
    fn execute(
        &self,
        system: &System,
        machine: &mut Machine,
        insn: &DecodedInsn,
    ) -> Result<(), MachineHalt>;
}

/// The external syscall translation layer: guest Linux syscall numbers and
/// argument registers in, a host POSIX call and a guest-`rax`-shaped return
/// value out.
pub trait SyscallDispatcher {
    /// `nr` is the guest `rax` at `syscall` entry, `args` are guest
    /// `rdi,rsi,rdx,r10,r8,r9` in that order. The return value is written
    /// back to guest `rax` by the caller; by Linux convention a negative
    /// value in `[-4095, -1]` is `-errno`.
    fn dispatch(&self, system: &System, machine: &mut Machine, nr: u64, args: [u64; 6]) -> i64;
}
