//! Primitive types shared by every layer of the emulator: the guest virtual
//! address newtype, page-size constants, and the register-id enums that the
//! decoder, flag-liveness, and JIT crates all need to agree on.

#![forbid(unsafe_code)]

use std::fmt;

/// Page size assumed throughout the address-space manager. Matches the x86
/// 4 KiB base page size; Pagetab never deals in huge pages.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Number of significant bits in a canonical long-mode guest virtual address.
pub const GVA_BITS: u32 = 48;

/// A 48-bit canonical guest virtual address (sign-extended from bit 47).
///
/// This is the unit the address-space manager, TLB, and JIT hook table key
/// their lookups on.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Gva(i64);

/// A guest virtual address was outside `[-2^47, 2^47)` or otherwise failed a
/// canonical-form check.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("guest virtual address {0:#x} is not in canonical 48-bit form")]
pub struct NonCanonicalAddress(pub i64);

impl Gva {
    /// Builds a `Gva`, rejecting addresses outside the canonical 48-bit range.
    pub fn new(addr: i64) -> Result<Self, NonCanonicalAddress> {
        let limit = 1i64 << (GVA_BITS - 1);
        if addr < -limit || addr >= limit {
            return Err(NonCanonicalAddress(addr));
        }
        Ok(Gva(addr))
    }

    /// Builds a `Gva` from a raw value, trusting the caller that it is already
    /// canonical (used on paths where the value was just derived from another
    /// `Gva`, e.g. `page_base + offset` within a page).
    pub const fn new_unchecked(addr: i64) -> Self {
        Gva(addr)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Address of the 4 KiB page containing this address.
    pub fn page_base(self) -> Gva {
        Gva(self.0 & !((PAGE_SIZE as i64) - 1))
    }

    /// Byte offset of this address within its containing 4 KiB page.
    pub fn page_offset(self) -> u64 {
        (self.0 as u64) & (PAGE_SIZE - 1)
    }

    /// True if `[self, self + len)` lies entirely within one 4 KiB page.
    pub fn fits_in_one_page(self, len: u64) -> bool {
        len == 0 || self.page_offset() + len <= PAGE_SIZE
    }

    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub fn checked_add(self, delta: i64) -> Result<Self, NonCanonicalAddress> {
        Self::new(self.0.wrapping_add(delta))
    }
}

impl fmt::Debug for Gva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gva({:#018x})", self.0 as u64 & 0xffff_ffff_ffff)
    }
}

impl fmt::Display for Gva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0 as u64 & 0xffff_ffff_ffff)
    }
}

/// General-purpose register index, shared by the decoder, flag-liveness and
/// JIT crates so they all index the same register file without re-deriving
/// the x86 numbering in three places.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const COUNT: usize = 16;

    pub const fn from_index(i: u8) -> Option<Self> {
        use Gpr::*;
        Some(match i {
            0 => Rax,
            1 => Rcx,
            2 => Rdx,
            3 => Rbx,
            4 => Rsp,
            5 => Rbp,
            6 => Rsi,
            7 => Rdi,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            15 => R15,
            _ => return None,
        })
    }

    pub const fn index(self) -> usize {
        self as u8 as usize
    }
}

/// CPU operating mode, mirroring `System::mode` in the data model. This crate
/// only models `Long` fully; `Real`/`Legacy` are kept as enum variants so the
/// rest of the type system stays honest about what a `System` could be in,
/// even though the dispatcher in this core only drives `Long`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CpuMode {
    Real,
    Legacy,
    #[default]
    Long,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bounds() {
        let limit = 1i64 << 47;
        assert!(Gva::new(limit - 1).is_ok());
        assert!(Gva::new(-limit).is_ok());
        assert!(Gva::new(limit).is_err());
        assert!(Gva::new(-limit - 1).is_err());
    }

    #[test]
    fn page_math() {
        let g = Gva::new(0x1234).unwrap();
        assert_eq!(g.page_base().raw(), 0x1000);
        assert_eq!(g.page_offset(), 0x234);
        assert!(g.fits_in_one_page(0x100));
        assert!(!g.fits_in_one_page(0xe00));
    }

    #[test]
    fn gpr_roundtrip() {
        for i in 0..16u8 {
            let g = Gpr::from_index(i).unwrap();
            assert_eq!(g.index() as u8, i);
        }
        assert!(Gpr::from_index(16).is_none());
    }
}
