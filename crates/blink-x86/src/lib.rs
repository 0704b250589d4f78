//! Instruction classification built on top of [`blink_decoder`]: the packed
//! `Rde` register/decode-encoding word used for size-dispatched register
//! access (§4.1), and the branch-shape classification that flag-liveness
//! crawling (§4.5) and the JIT's cross-path jump fixups (§4.7) both need.

use blink_decoder::{Decoded, Instruction, Mnemonic, OpKind};

pub use blink_decoder::{decode_one, DecodeError, DecodeMode, Prefixes, Segment};

/// A packed "register/decode encoding" word, named after the source's `rde`:
/// enough of the prefix state to size-dispatch a register or memory access
/// without re-inspecting the full `Instruction`. Bit layout is private; use
/// the accessors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Rde(u32);

const RDE_REXW: u32 = 1 << 0;
const RDE_OPSIZE: u32 = 1 << 1;
const RDE_ADDRSIZE: u32 = 1 << 2;
const RDE_LOCK: u32 = 1 << 3;

impl Rde {
    pub fn encode(prefixes: &Prefixes) -> Rde {
        let mut bits = 0u32;
        if prefixes.rex_w() {
            bits |= RDE_REXW;
        }
        if prefixes.opsize_override {
            bits |= RDE_OPSIZE;
        }
        if prefixes.addrsize_override {
            bits |= RDE_ADDRSIZE;
        }
        if prefixes.lock {
            bits |= RDE_LOCK;
        }
        Rde(bits)
    }

    pub fn rex_w(self) -> bool {
        self.0 & RDE_REXW != 0
    }

    pub fn opsize_override(self) -> bool {
        self.0 & RDE_OPSIZE != 0
    }

    pub fn addrsize_override(self) -> bool {
        self.0 & RDE_ADDRSIZE != 0
    }

    pub fn lock(self) -> bool {
        self.0 & RDE_LOCK != 0
    }

    /// Operand width in bytes implied by REX.W / the 0x66 prefix, per the
    /// standard x86 precedence (REX.W wins, then 0x66, default 4 in 32/64-bit
    /// mode). Used by `Bus::ReadRegister`/`WriteRegister`.
    pub fn operand_size(self) -> u8 {
        if self.rex_w() {
            8
        } else if self.opsize_override() {
            2
        } else {
            4
        }
    }
}

/// A decoded instruction paired with its derived `Rde` word. This is the
/// record the dispatcher fetches, caches in the ICache, and hands to the
/// opcode table.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    pub decoded: Decoded,
    pub rde: Rde,
}

pub fn decode(bytes: &[u8], ip: u64, mode: DecodeMode) -> Result<DecodedInsn, DecodeError> {
    let decoded = decode_one(mode, ip, bytes)?;
    let rde = Rde::encode(&decoded.prefixes);
    Ok(DecodedInsn { decoded, rde })
}

impl DecodedInsn {
    pub fn len(&self) -> usize {
        self.decoded.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn instruction(&self) -> &Instruction {
        &self.decoded.instruction
    }
}

/// How an instruction affects control flow, coarse enough for flag-liveness
/// crawling (`CrawlFlags`) and JIT cross-path jump discovery to decide
/// whether to keep following the straight-line path.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchKind {
    /// Falls through to the next instruction.
    Straight,
    /// Unconditional near/far jump.
    Unconditional,
    /// Conditional (Jcc / JCXZ / LOOP family) jump.
    Conditional,
    Call,
    Return,
    /// Syscall, interrupt, halt, or anything else `CrawlFlags` must not walk
    /// through because its effect on control flow (or on the flags it is
    /// trying to track) isn't a simple successor relationship.
    Abnormal,
}

pub fn classify(insn: &Instruction) -> BranchKind {
    use Mnemonic::*;
    match insn.mnemonic() {
        Jmp => BranchKind::Unconditional,
        Ja | Jae | Jb | Jbe | Je | Jg | Jge | Jl | Jle | Jne | Jno | Jnp | Jns | Jo | Jp | Js
        | Jcxz | Jecxz | Jrcxz | Loop | Loope | Loopne => BranchKind::Conditional,
        Call => BranchKind::Call,
        Ret | Retf | Iret | Iretd | Iretq => BranchKind::Return,
        Syscall | Sysenter | Int | Int3 | Into | Ud2 | Hlt | Cpuid | Rdtsc | Rdtscp | Invlpg
        | Invd | Wbinvd => BranchKind::Abnormal,
        _ => BranchKind::Straight,
    }
}

/// The statically-known target of a direct near branch (`Jmp rel32`, `Call
/// rel32`, `Jcc rel8`, ...), or `None` for indirect branches whose target is
/// only known at runtime.
pub fn branch_target(insn: &Instruction) -> Option<u64> {
    match classify(insn) {
        BranchKind::Unconditional | BranchKind::Conditional | BranchKind::Call => {
            if insn.op0_kind() == OpKind::NearBranch64
                || insn.op0_kind() == OpKind::NearBranch32
                || insn.op0_kind() == OpKind::NearBranch16
            {
                Some(insn.near_branch_target())
            } else {
                None
            }
        }
        _ => None,
    }
}
