//! Thin, allocation-free wrapper around `iced-x86` that produces the
//! fixed-size decoded-instruction record the dispatcher, JIT, and flag
//! liveness analysis all key off of.
//!
//! The spec calls the decoder an external collaborator: the rest of this
//! workspace only depends on [`Decoded`]/[`Prefixes`]/[`DecodeError`], never
//! on `iced_x86` types directly outside this crate (with the exception of the
//! handful of re-exports below, which exist so callers can match on operand
//! kinds without a second Cargo dependency).

pub use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use iced_x86::{Decoder, DecoderOptions};

/// Upper bound on x86 instruction length (architectural limit).
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Processor operating mode used to pick the decoder's default operand/address size.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }
}

/// Segment override, if any, carried by the legacy prefix bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Segment {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Decoded legacy/REX prefix state, independent of the opcode bytes that follow.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    pub seg: Option<Segment>,
    pub opsize_override: bool,
    pub addrsize_override: bool,
    /// The raw REX byte, if one was present (64-bit mode only).
    pub rex: Option<u8>,
}

impl Prefixes {
    pub fn rex_w(&self) -> bool {
        self.rex.map(|r| r & 0x08 != 0).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("fewer than {0} bytes available and no valid instruction found within them")]
    NotEnoughBytes(usize),
    #[error("the byte stream does not encode a valid x86 instruction")]
    InvalidInstruction,
}

/// A fully decoded instruction plus the prefix state that preceded its opcode.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub instruction: Instruction,
    pub prefixes: Prefixes,
}

impl Decoded {
    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Scans only the legacy-prefix/REX-byte run at the start of `bytes`, without
/// decoding the instruction that follows. Returns the parsed prefixes and how
/// many bytes they occupied.
pub fn scan_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<(Prefixes, usize), DecodeError> {
    let mut prefixes = Prefixes::default();
    let mut i = 0usize;
    while i < bytes.len() && i < MAX_INSTRUCTION_LEN {
        match bytes[i] {
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.repne = true,
            0xF3 => prefixes.rep = true,
            0x2E => prefixes.seg = Some(Segment::Cs),
            0x36 => prefixes.seg = Some(Segment::Ss),
            0x3E => prefixes.seg = Some(Segment::Ds),
            0x26 => prefixes.seg = Some(Segment::Es),
            0x64 => prefixes.seg = Some(Segment::Fs),
            0x65 => prefixes.seg = Some(Segment::Gs),
            0x66 => prefixes.opsize_override = true,
            0x67 => prefixes.addrsize_override = true,
            b @ 0x40..=0x4F if mode == DecodeMode::Bits64 => {
                // REX must be the last prefix byte before the opcode; a REX byte
                // followed by another legacy prefix is not re-parsed as a prefix.
                prefixes.rex = Some(b);
                i += 1;
                return Ok((prefixes, i));
            }
            _ => return Ok((prefixes, i)),
        }
        i += 1;
    }
    if i >= MAX_INSTRUCTION_LEN {
        return Err(DecodeError::InvalidInstruction);
    }
    Ok((prefixes, i))
}

/// Like [`scan_prefixes`], but discards the consumed-byte count.
pub fn decode_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<Prefixes, DecodeError> {
    scan_prefixes(mode, bytes).map(|(p, _)| p)
}

/// Decodes exactly one instruction, returning the bare `iced_x86::Instruction`
/// without the prefix side-channel (used where only opcode-level information
/// is needed, e.g. differential testing against a second decoder).
pub fn decode_instruction(
    mode: DecodeMode,
    ip: u64,
    bytes: &[u8],
) -> Result<Instruction, DecodeError> {
    decode_one(mode, ip, bytes).map(|d| d.instruction)
}

/// Decodes exactly one instruction starting at `bytes[0]`, which the caller
/// must have already fetched into a buffer of at most
/// [`MAX_INSTRUCTION_LEN`] bytes via [`crate::Decoded`]'s consumer (the
/// dispatcher's `LoadInstruction`); `ip` is only used to resolve RIP-relative
/// operands and does not affect how many bytes are consumed.
pub fn decode_one(mode: DecodeMode, ip: u64, bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];
    let prefixes = decode_prefixes(mode, window)?;

    let mut decoder = Decoder::with_ip(mode.bitness(), window, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::NotEnoughBytes(window.len()));
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(DecodeError::InvalidInstruction);
    }
    Ok(Decoded {
        instruction,
        prefixes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_mov() {
        // 48 89 D8 => mov rax, rbx
        let bytes = [0x48, 0x89, 0xD8];
        let decoded = decode_one(DecodeMode::Bits64, 0x1000, &bytes).expect("decode");
        assert_eq!(decoded.len(), 3);
        assert!(decoded.prefixes.rex_w());
    }

    #[test]
    fn lock_prefix_is_observed() {
        // F0 83 00 01 => lock add dword ptr [eax], 1
        let bytes = [0xF0, 0x83, 0x00, 0x01];
        let decoded = decode_one(DecodeMode::Bits32, 0, &bytes).expect("decode");
        assert!(decoded.prefixes.lock);
        assert!(!decoded.prefixes.rep);
    }

    #[test]
    fn prefix_only_stream_is_invalid() {
        let bytes = [0x66u8; MAX_INSTRUCTION_LEN];
        assert_eq!(
            decode_instruction(DecodeMode::Bits64, 0, &bytes).unwrap_err(),
            DecodeError::InvalidInstruction
        );
    }

    #[test]
    fn consumed_prefix_lengths() {
        assert_eq!(scan_prefixes(DecodeMode::Bits64, &[0x90]).unwrap().1, 0);
        assert_eq!(
            scan_prefixes(DecodeMode::Bits64, &[0x66, 0x90]).unwrap().1,
            1
        );
        assert_eq!(
            scan_prefixes(DecodeMode::Bits64, &[0x66, 0x67, 0x90])
                .unwrap()
                .1,
            2
        );
        assert_eq!(scan_prefixes(DecodeMode::Bits64, &[0x48, 0x90]).unwrap().1, 1);
    }
}
