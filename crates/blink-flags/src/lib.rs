//! Lazy condition-flag tracking: which FLAGS bits an upcoming run of
//! instructions actually needs (so the dispatcher can skip recomputing the
//! rest), and the import/export of the guest-visible EFLAGS image to and
//! from the host-side representation.
//!
//! Grounded on the source's `flags.c`: `GetParity`/`ImportFlags`/
//! `ExportFlags` port directly; `CrawlFlags`'s forward walk is reproduced
//! using this workspace's own branch classification (`blink_x86::classify`)
//! instead of the source's inline `IsJump`/`IsConditionalJump` opcode-range
//! checks, and `GetFlagDeps`/`GetFlagClobbers` are reproduced as
//! per-mnemonic tables covering the instruction families the source's
//! opcode switch covers, generalized over `iced_x86::Mnemonic` rather than
//! transcribed opcode-by-opcode.

use blink_decoder::{Instruction, Mnemonic};
use blink_x86::{branch_target, classify, decode, BranchKind, DecodeMode};

/// Bit positions within the 32-bit EFLAGS image, named after the source's
/// `FLAGS_*` constants.
pub const CF: u32 = 1 << 0;
pub const F1: u32 = 1 << 1;
pub const PF: u32 = 1 << 2;
pub const F0: u32 = 1 << 3;
pub const AF: u32 = 1 << 4;
pub const ZF: u32 = 1 << 6;
pub const SF: u32 = 1 << 7;
pub const TF: u32 = 1 << 8;
pub const IF: u32 = 1 << 9;
pub const DF: u32 = 1 << 10;
pub const OF: u32 = 1 << 11;
pub const IOPL: u32 = 0b11 << 12;
pub const NT: u32 = 1 << 14;
pub const RF: u32 = 1 << 16;
pub const VM: u32 = 1 << 17;
pub const AC: u32 = 1 << 18;
pub const VIF: u32 = 1 << 19;
pub const VIP: u32 = 1 << 20;
pub const ID: u32 = 1 << 21;

/// The arithmetic status flags most instructions deal with, as opposed to
/// the control/system bits above them.
pub const STATUS: u32 = CF | PF | AF | ZF | SF | OF;

/// Bits a guest `popf`/signal-return frame is permitted to change;
/// everything else (`IOPL`, `VM`, the reserved bits) is either forced or
/// left untouched.
const USER_WRITABLE: u32 = CF | PF | AF | ZF | SF | TF | IF | DF | OF | NT | RF | AC | ID;

/// Where the lazily-computed parity bit lives outside the 32-bit EFLAGS
/// image proper: the source caches `GetParity`'s result rather than
/// recomputing it on every read, folding it back into `PF` only on export.
/// No header in the retrieved source names this cache's storage location
/// explicitly, so this picks an unused high bit of the 64-bit word this
/// crate stores flags in.
const LAZY_PARITY_BIT: u64 = 1 << 32;

/// The guest-visible processor flags, plus the lazily-cached parity bit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Flags(u64);

impl Flags {
    pub fn from_raw(raw: u32) -> Self {
        let mut f = Flags(raw as u64);
        f.refresh_parity();
        f
    }

    fn refresh_parity(&mut self) {
        let byte = self.0 as u8;
        if get_parity(byte) {
            self.0 |= LAZY_PARITY_BIT;
        } else {
            self.0 &= !LAZY_PARITY_BIT;
        }
    }

    pub fn test(&self, mask: u32) -> bool {
        self.0 as u32 & mask != 0
    }

    pub fn set(&mut self, mask: u32, value: bool) {
        if value {
            self.0 |= mask as u64;
        } else {
            self.0 &= !(mask as u64);
        }
        if mask & PF != 0 {
            self.refresh_parity();
        }
    }
}

/// Parity of the low byte of a result: `true` means an even number of set
/// bits, matching x86's `PF`. Direct port of the source's XOR-fold.
pub fn get_parity(b: u8) -> bool {
    let mut b = b;
    b ^= b >> 4;
    b ^= b >> 2;
    b ^= b >> 1;
    b & 1 == 0
}

/// Applies a guest-supplied flags word (e.g. from `popf` or a signal-return
/// frame) onto the current flags: only the user-writable bits change, `RF`
/// is always cleared on import (a single-step trap must not survive a
/// `popf`), and the parity cache is recomputed from the new `PF` bit.
pub fn import_flags(current: Flags, guest_flags: u64) -> Flags {
    let kept = current.0 & !(USER_WRITABLE as u64);
    let incoming = guest_flags as u32 & USER_WRITABLE;
    let mut flags = Flags(kept | incoming as u64);
    flags.0 &= !(RF as u64);
    flags.refresh_parity();
    flags
}

/// Produces the 32-bit EFLAGS image a guest is allowed to observe: `IOPL`
/// pinned to 3 (there's no nested ring 0/3 distinction to enforce), the two
/// fixed reserved bits (`F1` always set, `F0` always clear), and the
/// lazily-cached parity bit folded back into `PF`.
pub fn export_flags(flags: Flags) -> u64 {
    let mut raw = flags.0 as u32;
    raw |= IOPL;
    raw |= F1;
    raw &= !F0;
    if flags.0 & LAZY_PARITY_BIT != 0 {
        raw |= PF;
    } else {
        raw &= !PF;
    }
    raw as u64
}

/// Source of guest code bytes for the forward walk in [`crawl_flags`]. A
/// real caller backs this with the mapped address space (out of scope for
/// this crate); tests back it with an in-memory byte slice.
pub trait GuestCode {
    /// Returns up to 15 bytes starting at `pc`; may return fewer near the
    /// end of a mapped region, never more than the architectural
    /// instruction length limit.
    fn fetch(&self, pc: u64) -> Vec<u8>;
}

impl GuestCode for [u8] {
    fn fetch(&self, pc: u64) -> Vec<u8> {
        let start = pc as usize;
        if start >= self.len() {
            return Vec::new();
        }
        self[start..].to_vec()
    }
}

/// Default lookahead bound for [`get_needed_flags`], matching the source's
/// `GetNeededFlags` wrapper around `CrawlFlags`.
pub const DEFAULT_LOOKAHEAD: u32 = 16;

/// Guards against unbounded recursion down conditional-branch chains. The
/// source relies on `look` reaching zero for this, but `look` is only
/// decremented once per loop iteration, so a chain of conditional branches
/// with no intervening straight-line code can recurse deeper than `look`
/// alone bounds; this backstop has no counterpart constant in the source.
const MAX_RECURSION_DEPTH: u32 = 64;

/// Walks forward from `pc`, following straight-line code and both sides of
/// conditional branches, to determine which of `needed` flags are read
/// before they are next written. Returns `None` ("unknown — assume every
/// needed flag is live") if the walk runs out of lookahead, meets an
/// indirect or otherwise unclassifiable branch, or recurses too deep.
/// Mirrors `CrawlFlags`: a conditional branch's target is explored
/// recursively, then the walk falls through to the straight-line successor
/// regardless of what the recursive call found.
pub fn crawl_flags(
    code: &(impl GuestCode + ?Sized),
    mode: DecodeMode,
    pc: u64,
    needed: u32,
    lookahead: u32,
) -> Option<u32> {
    crawl_flags_inner(code, mode, pc, needed, lookahead, 0)
}

fn crawl_flags_inner(
    code: &(impl GuestCode + ?Sized),
    mode: DecodeMode,
    mut pc: u64,
    mut myflags: u32,
    mut look: u32,
    depth: u32,
) -> Option<u32> {
    if depth > MAX_RECURSION_DEPTH {
        tracing::debug!(pc, depth, "flag crawl recursion bound exceeded");
        return None;
    }
    let mut need = 0u32;
    loop {
        let bytes = code.fetch(pc);
        let insn = decode(&bytes, pc, mode).ok()?;
        let instruction = insn.instruction();

        need |= flag_deps(instruction) & myflags;
        myflags &= !flag_clobbers(instruction);
        if myflags == 0 {
            return Some(need);
        }

        look = look.saturating_sub(1);
        if look == 0 {
            tracing::debug!(pc, "flag crawl exhausted lookahead, assuming all flags live");
            return None;
        }

        pc += insn.len() as u64;

        match classify(instruction) {
            BranchKind::Straight => {}
            BranchKind::Unconditional => {
                pc = branch_target(instruction)?;
            }
            BranchKind::Conditional => {
                let target = branch_target(instruction)?;
                let taken = crawl_flags_inner(code, mode, target, myflags, look, depth + 1)?;
                need |= taken;
            }
            BranchKind::Call | BranchKind::Return | BranchKind::Abnormal => return None,
        }
    }
}

/// Convenience wrapper matching the source's public `GetNeededFlags`:
/// `crawl_flags` with the default lookahead bound.
pub fn get_needed_flags(
    code: &(impl GuestCode + ?Sized),
    mode: DecodeMode,
    pc: u64,
    needed: u32,
) -> Option<u32> {
    crawl_flags(code, mode, pc, needed, DEFAULT_LOOKAHEAD)
}

/// Status flags a given instruction reads as an input, keyed by mnemonic.
/// Covers the instruction families the source's `GetFlagDeps` switch
/// covers; anything not listed here reads none of the status flags.
pub fn flag_deps(insn: &Instruction) -> u32 {
    use Mnemonic::*;
    match insn.mnemonic() {
        Adc | Sbb => CF,
        Rcl | Rcr => CF,
        Jb | Jae | Setb | Setae | Cmovb | Cmovae => CF,
        Je | Jne | Sete | Setne | Cmove | Cmovne => ZF,
        Jbe | Ja | Setbe | Seta | Cmovbe | Cmova => CF | ZF,
        Jl | Jge | Setl | Setge | Cmovl | Cmovge => SF | OF,
        Jle | Jg | Setle | Setg | Cmovle | Cmovg => SF | OF | ZF,
        Js | Jns | Sets | Setns | Cmovs | Cmovns => SF,
        Jo | Jno | Seto | Setno | Cmovo | Cmovno => OF,
        Jp | Jnp | Setp | Setnp | Cmovp | Cmovnp => PF,
        Pushf | Pushfd | Pushfq => STATUS | TF | IF | DF,
        _ => 0,
    }
}

/// Status flags a given instruction clobbers (defines a fresh value for),
/// keyed by mnemonic. Covers the instruction families the source's
/// `GetFlagClobbers` switch covers; anything not listed here is assumed to
/// leave every status flag unchanged (e.g. `mov`, `lea`, register
/// shuffles).
pub fn flag_clobbers(insn: &Instruction) -> u32 {
    use Mnemonic::*;
    match insn.mnemonic() {
        Add | Sub | Cmp | And | Or | Xor | Test | Neg | Adc | Sbb => STATUS,
        Mul | Imul => STATUS,
        Div | Idiv => 0,
        Inc | Dec => STATUS & !CF,
        Shl | Sal | Shr | Sar | Rol | Ror => STATUS,
        Rcl | Rcr => CF | OF,
        Bt | Bts | Btr | Btc => CF,
        Bsf | Bsr => ZF,
        Popf | Popfd | Popfq => STATUS | TF | IF | DF | NT,
        Sahf => STATUS,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_matches_even_and_odd_bit_counts() {
        assert!(get_parity(0b0000_0000));
        assert!(get_parity(0b0000_0011));
        assert!(!get_parity(0b0000_0001));
        assert!(!get_parity(0b0000_0111));
    }

    #[test]
    fn export_pins_reserved_and_iopl_bits() {
        let flags = Flags::from_raw(0);
        let exported = export_flags(flags);
        assert_eq!(exported & IOPL, IOPL);
        assert_eq!(exported & F1, F1);
        assert_eq!(exported & F0, 0);
    }

    #[test]
    fn export_reflects_lazy_parity_cache() {
        // Low byte 0b011 has even parity (two bits set).
        let flags = Flags::from_raw(0b011);
        assert_eq!(export_flags(flags) & PF, PF);
        // Low byte 0b001 has odd parity (one bit set).
        let flags = Flags::from_raw(0b001);
        assert_eq!(export_flags(flags) & PF, 0);
    }

    #[test]
    fn import_ignores_non_user_writable_bits() {
        let current = Flags::from_raw(IOPL | VM);
        let imported = import_flags(current, (ZF | VM) as u64);
        assert!(export_flags(imported) & ZF != 0);
        // VM isn't user-writable; the prior value is preserved untouched.
        assert_eq!(imported.0 as u32 & VM, VM);
    }

    #[test]
    fn import_always_clears_rf() {
        let current = Flags::from_raw(RF);
        let imported = import_flags(current, RF as u64);
        assert_eq!(imported.0 as u32 & RF, 0);
    }

    #[test]
    fn conditional_branch_that_reads_then_clobbers_needs_the_flag() {
        // 74 00    jz +0     (reads ZF)
        // 3B C1    cmp eax, ecx   (clobbers ZF)
        let code: Vec<u8> = vec![0x74, 0x00, 0x3B, 0xC1];
        let need = crawl_flags(code.as_slice(), DecodeMode::Bits32, 0, ZF, 16).unwrap();
        assert_eq!(need, ZF);
    }

    #[test]
    fn clobbering_instruction_satisfies_the_need_without_ever_reading_it() {
        // 89 D8    mov eax, ebx   (doesn't touch flags)
        // 3B C1    cmp eax, ecx   (clobbers CF without reading it)
        let code: Vec<u8> = vec![0x89, 0xD8, 0x3B, 0xC1];
        let need = crawl_flags(code.as_slice(), DecodeMode::Bits32, 0, CF, 16);
        assert_eq!(need, Some(0));
    }

    #[test]
    fn unconditional_jump_is_followed() {
        // EB 02    jmp +2
        // 90 90    (skipped)
        // 3B C1    cmp eax, ecx
        let code: Vec<u8> = vec![0xEB, 0x02, 0x90, 0x90, 0x3B, 0xC1];
        let need = crawl_flags(code.as_slice(), DecodeMode::Bits32, 0, STATUS, 16);
        assert_eq!(need, Some(0));
    }

    #[test]
    fn syscall_makes_the_walk_give_up() {
        let code: Vec<u8> = vec![0x0F, 0x05];
        let need = crawl_flags(code.as_slice(), DecodeMode::Bits64, 0, ZF, 16);
        assert_eq!(need, None);
    }

    #[test]
    fn out_of_lookahead_gives_up() {
        // A chain of 17 mov-with-no-flag-effect instructions exceeds the
        // default 16-instruction lookahead before ZF is ever clobbered.
        let mut code = Vec::new();
        for _ in 0..20 {
            code.extend_from_slice(&[0x89, 0xD8]); // mov eax, ebx
        }
        let need = get_needed_flags(code.as_slice(), DecodeMode::Bits32, 0, ZF);
        assert_eq!(need, None);
    }
}
