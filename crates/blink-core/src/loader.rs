//! A minimal stand-in for the out-of-scope ELF loader: just enough to place
//! a flat blob of machine code in guest memory, give the first `Machine` a
//! stack, and populate it per the System V AMD64 ABI (§6) so the dispatcher
//! has something runnable to drive in tests. This is not a real ELF loader
//! (no program headers, no dynamic linking, no `AT_PHDR`/`AT_BASE`) — that
//! layer is explicitly out of scope (§1).

use blink_memory::{copy_to_user, MemoryError};
use blink_pagetab::{PageTab, PageTableError, Prot};
use blink_types::Gva;

pub const AT_NULL: u64 = 0;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;
pub const AT_EXECFN: u64 = 31;
pub const AT_PAGESZ: u64 = 6;
pub const AT_CLKTCK: u64 = 17;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Maps `code` at `base` (RX) and returns the entry point, which for this
/// minimal loader is always `base` itself — there is no relocation or
/// segment layout to resolve.
pub fn load_flat(pagetab: &mut PageTab, base: Gva, code: &[u8]) -> Result<Gva, LoaderError> {
    let len = (code.len() as u64).next_multiple_of(blink_types::PAGE_SIZE);
    pagetab.reserve_virtual(base, len.max(blink_types::PAGE_SIZE), Prot::RW)?;
    copy_to_user(pagetab, base, code)?;
    pagetab.protect_virtual(base, len.max(blink_types::PAGE_SIZE), false)?;
    Ok(base)
}

/// Builds the initial stack image — `argc; argv[]; 0; envp[]; 0; auxv[];
/// {0,0}` — at the top of a freshly reserved stack region, 16-byte aligned
/// after the final push, per §6. Returns the guest `rsp` the first
/// instruction should start with.
#[allow(clippy::too_many_arguments)]
pub fn build_initial_stack(
    pagetab: &mut PageTab,
    stack_top: Gva,
    stack_size: u64,
    argv: &[&[u8]],
    envp: &[&[u8]],
    execfn: &[u8],
    random16: [u8; 16],
) -> Result<Gva, LoaderError> {
    let stack_base = Gva::new(stack_top.raw() - stack_size as i64)?;
    pagetab.reserve_virtual(stack_base, stack_size, Prot::RW)?;

    // Strings are placed below the top of the stack, highest address first,
    // so their pointers can be pushed in order afterward.
    let mut cursor = stack_top.raw();
    let mut place_string = |pagetab: &mut PageTab, s: &[u8]| -> Result<i64, LoaderError> {
        cursor -= (s.len() + 1) as i64;
        let addr = Gva::new(cursor)?;
        let mut with_nul = s.to_vec();
        with_nul.push(0);
        copy_to_user(pagetab, addr, &with_nul)?;
        Ok(cursor)
    };

    let execfn_addr = place_string(pagetab, execfn)?;
    let mut argv_addrs = Vec::with_capacity(argv.len());
    for s in argv {
        argv_addrs.push(place_string(pagetab, s)?);
    }
    let mut envp_addrs = Vec::with_capacity(envp.len());
    for s in envp {
        envp_addrs.push(place_string(pagetab, s)?);
    }
    cursor -= 16;
    let random_addr = cursor & !0xf;
    copy_to_user(pagetab, Gva::new(random_addr)?, &random16)?;

    // Auxv, envp, argv, argc: built bottom-up so the final pointer (argc) is
    // the lowest address, then the whole block is pushed highest-address
    // first as a single buffer ending 16-byte aligned.
    let auxv: Vec<(u64, u64)> = vec![
        (AT_UID, 0),
        (AT_EUID, 0),
        (AT_GID, 0),
        (AT_EGID, 0),
        (AT_SECURE, 0),
        (AT_PAGESZ, blink_types::PAGE_SIZE),
        (AT_CLKTCK, 100),
        (AT_RANDOM, random_addr as u64),
        (AT_EXECFN, execfn_addr as u64),
        (AT_NULL, 0),
    ];

    let mut image: Vec<u8> = Vec::new();
    image.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    for &a in &argv_addrs {
        image.extend_from_slice(&(a as u64).to_le_bytes());
    }
    image.extend_from_slice(&0u64.to_le_bytes());
    for &a in &envp_addrs {
        image.extend_from_slice(&(a as u64).to_le_bytes());
    }
    image.extend_from_slice(&0u64.to_le_bytes());
    for (key, val) in &auxv {
        image.extend_from_slice(&key.to_le_bytes());
        image.extend_from_slice(&val.to_le_bytes());
    }

    let mut rsp = random_addr - image.len() as i64;
    rsp &= !0xf;
    copy_to_user(pagetab, Gva::new(rsp)?, &image)?;
    Ok(Gva::new(rsp)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_flat_places_code_and_makes_it_non_writable() {
        let mut pt = PageTab::new(4 << 20).unwrap();
        let base = Gva::new(0x10000).unwrap();
        let entry = load_flat(&mut pt, base, &[0x90, 0xc3]).unwrap();
        assert_eq!(entry, base);
        assert!(blink_memory::store(&mut pt, base, &[0x90]).is_err());
    }

    #[test]
    fn initial_stack_is_sixteen_byte_aligned() {
        let mut pt = PageTab::new(4 << 20).unwrap();
        let top = Gva::new(0x7fff_0000_1000).unwrap();
        let rsp = build_initial_stack(
            &mut pt,
            top,
            blink_types::PAGE_SIZE * 4,
            &[b"prog", b"arg1"],
            &[b"HOME=/root"],
            b"/bin/prog",
            [0u8; 16],
        )
        .unwrap();
        assert_eq!(rsp.raw() % 16, 0);
        let argc_bytes = blink_memory::load(&mut pt, rsp, 8).unwrap();
        assert_eq!(u64::from_le_bytes(argc_bytes.try_into().unwrap()), 2);
    }
}
