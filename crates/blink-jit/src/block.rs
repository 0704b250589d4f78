//! The compiled stub: a sequence of micro-ops chained with the amortised
//! call overhead the source's `AppendJit*` family encodes as raw x86-64/
//! AArch64 bytes. Here the "code" is a portable `Vec<Stub>` interpreted by
//! the dispatcher's tiered runtime rather than literal machine code — the
//! value this component provides (per §4.7, "eliminating dispatch
//! overhead", not guest-arithmetic codegen) is unchanged, and it keeps block
//! construction free of raw executable-memory management, which the
//! teacher's own JIT (targeting a safe bytecode VM rather than emitting
//! native bytes directly) also avoids.

use crate::hooks::StubId;
use blink_types::Gpr;

/// One element of a compiled stub, corresponding to one `AppendJit*` call in
/// the source.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Stub {
    /// Call a pre-compiled micro-op (the external semantic table) for one
    /// decoded guest instruction.
    Op(u32),
    SetReg(Gpr, u64),
    MovReg(Gpr, Gpr),
    /// Direct jump to another stub already known at compile time.
    Jump(StubId),
    /// Jump to a guest address whose stub doesn't exist yet; resolved later
    /// by `fixup_jit_jumps`.
    JumpUnresolved(u64),
    Ret,
    /// Padding emitted by `FinishJit`'s `AlignJit` call, trap opcode so
    /// falling off the end of a block is loud rather than silent.
    Trap,
    Nop,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    Filling,
    Committed,
    Abandoned,
}

/// One compiled path, leased to a single compiling thread while `Filling`.
#[derive(Debug, Clone)]
pub struct JitBlock {
    pub id: StubId,
    pub virt: u64,
    pub(crate) stubs: Vec<Stub>,
    pub state: BlockState,
    pub(crate) lastaction: u64,
}

impl JitBlock {
    pub(crate) fn new(id: StubId, virt: u64, lastaction: u64) -> Self {
        JitBlock {
            id,
            virt,
            stubs: Vec::new(),
            state: BlockState::Filling,
            lastaction,
        }
    }

    pub fn append(&mut self, stub: Stub) {
        debug_assert_eq!(self.state, BlockState::Filling);
        self.stubs.push(stub);
    }

    pub fn append_op(&mut self, op: u32) {
        self.append(Stub::Op(op));
    }

    pub fn append_call(&mut self, stub: StubId) {
        self.append(Stub::Jump(stub));
    }

    pub fn append_set_reg(&mut self, reg: Gpr, value: u64) {
        self.append(Stub::SetReg(reg, value));
    }

    pub fn append_mov_reg(&mut self, dst: Gpr, src: Gpr) {
        self.append(Stub::MovReg(dst, src));
    }

    pub fn append_jump(&mut self, target_virt: u64) {
        self.append(Stub::JumpUnresolved(target_virt));
    }

    pub fn append_ret(&mut self) {
        self.append(Stub::Ret);
    }

    pub fn append_nop(&mut self) {
        self.append(Stub::Nop);
    }

    pub fn append_trap(&mut self) {
        self.append(Stub::Trap);
    }

    /// Pads the block with trap stubs up to the next multiple of `align`.
    pub fn align(&mut self, align: usize) {
        while self.stubs.len() % align != 0 {
            self.append_trap();
        }
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn stubs(&self) -> &[Stub] {
        &self.stubs
    }
}
