//! Safe, page-boundary-aware access to guest memory from the interpreter.
//!
//! Grounded on the source's `memory.c`: `IsValidMemory`, `Load`/`BeginStore`/
//! `EndStore`, `CopyFromUser`/`CopyToUser`, `SchlepR`/`SchlepW`/`SchlepRW`,
//! `LoadStr`, and `CopyStrList`. The source returns raw host pointers that
//! may alias a page directly (the non-straddling fast path) or point into a
//! scratch buffer pushed onto the machine's `freelist` (the straddling
//! path); every call here instead returns or consumes an owned `Vec<u8>`,
//! since a safe Rust binding can't hand back a pointer into `PageTab`'s
//! arena that outlives the borrow used to fault it in. The permission
//! checks, page-at-a-time walk, and straddling behavior are otherwise
//! reproduced exactly.

use blink_pagetab::{PageTab, PageTableError, Prot, PAGE_RW, PAGE_SIZE, PAGE_U, PAGE_XD};
use blink_types::{Gva, NonCanonicalAddress};

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    PageTable(#[from] PageTableError),
    #[error("address {0:#x} is not a canonical guest pointer")]
    InvalidPointer(u64),
    #[error("nul-terminated string exceeds the internal length bound")]
    StringTooLong,
    #[error(transparent)]
    NonCanonical(#[from] NonCanonicalAddress),
}

/// Upper bound on a guest NUL-terminated string. The source has no such
/// bound (it keeps `realloc`ing until it hits a NUL or the host runs out of
/// memory); a safe implementation needs a backstop so a guest that never
/// writes a NUL can't turn `load_str` into an unbounded allocation loop.
const MAX_STRING_LEN: usize = 1 << 20;

/// Port of `IsValidMemory`: every page in `[virt, virt + size)` must be
/// mapped and satisfy `prot` (readable/writable/executable as requested).
/// Unlike `load`/`store`, this never faults a reserved page in — it checks
/// the permission bits already recorded on the (possibly still-reserved)
/// leaf entry, exactly like `FindPageTableEntry` does.
pub fn is_valid_memory(pagetab: &PageTab, virt: Gva, size: u64, prot: Prot) -> bool {
    if size == 0 {
        return true;
    }
    if virt.checked_add(size as i64 - 1).is_err() {
        return false;
    }

    let mut mask = 0u64;
    let mut need = 0u64;
    if prot.user {
        mask |= PAGE_U;
        need |= PAGE_U;
    }
    if prot.writable {
        mask |= PAGE_RW;
        need |= PAGE_RW;
    }
    if prot.executable {
        mask |= PAGE_XD;
    }

    let end = virt.raw() + size as i64;
    let mut page = virt.page_base();
    while page.raw() < end {
        match pagetab.translate(page) {
            Ok(entry) if entry.raw() & mask == need => {}
            _ => return false,
        }
        page = match page.checked_add(PAGE_SIZE as i64) {
            Ok(p) => p,
            Err(_) => return false,
        };
    }
    true
}

/// Reads `len` bytes starting at `addr`, committing any reserved pages it
/// crosses and copying out of as many pages as the range straddles. Port of
/// `Load`/`AccessRam` with `copy = true`.
pub fn load(pagetab: &mut PageTab, addr: Gva, len: u64) -> Result<Vec<u8>, MemoryError> {
    let mut out = Vec::with_capacity(len as usize);
    let mut cursor = addr;
    let mut remaining = len as usize;
    while remaining > 0 {
        let page_base = cursor.page_base();
        let offset = cursor.page_offset() as usize;
        let entry = pagetab.resolve(page_base, PAGE_U)?;
        let frame = entry.table_address();
        let bytes = pagetab.frame_bytes(frame);
        let avail = PAGE_SIZE as usize - offset;
        let take = avail.min(remaining);
        out.extend_from_slice(&bytes[offset..offset + take]);
        remaining -= take;
        if remaining > 0 {
            cursor = cursor.checked_add(take as i64)?;
        }
    }
    Ok(out)
}

/// Writes `data` starting at `addr`, committing any reserved pages it
/// crosses. Port of `BeginStore` immediately followed by `EndStore` — the
/// source splits these so the dispatcher can hold the destination pointer
/// open across one micro-op's execution; since this crate never hands back
/// a pointer into the arena, the two collapse into one call.
pub fn store(pagetab: &mut PageTab, addr: Gva, data: &[u8]) -> Result<(), MemoryError> {
    let mut cursor = addr;
    let mut written = 0usize;
    while written < data.len() {
        let page_base = cursor.page_base();
        let offset = cursor.page_offset() as usize;
        let entry = pagetab.resolve(page_base, PAGE_U | PAGE_RW)?;
        let frame = entry.table_address();
        let bytes = pagetab.frame_bytes_mut(frame);
        let avail = PAGE_SIZE as usize - offset;
        let take = avail.min(data.len() - written);
        bytes[offset..offset + take].copy_from_slice(&data[written..written + take]);
        written += take;
        if written < data.len() {
            cursor = cursor.checked_add(take as i64)?;
        }
    }
    Ok(())
}

/// A scratch buffer for a store that may straddle a page boundary,
/// mirroring the source's `BeginStore`/`EndStore` pair: fill `bytes_mut()`,
/// then pass the value to [`end_store`] to flush it back to guest memory.
pub struct PendingStore {
    addr: Gva,
    buf: Vec<u8>,
}

impl PendingStore {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Port of `BeginStore`: allocates (zero-filled) the scratch buffer the
/// caller will write into. Unlike the source, this never touches guest
/// memory up front — permission is checked when [`end_store`] commits.
pub fn begin_store(addr: Gva, len: u64) -> PendingStore {
    PendingStore {
        addr,
        buf: vec![0u8; len as usize],
    }
}

/// Port of `EndStore`: flushes a [`PendingStore`]'s buffer back to guest
/// memory, splitting the write across pages as needed.
pub fn end_store(pagetab: &mut PageTab, pending: PendingStore) -> Result<(), MemoryError> {
    store(pagetab, pending.addr, &pending.buf)
}

/// Port of `CopyFromUser`: reads `dst.len()` bytes from `src` into `dst`.
pub fn copy_from_user(pagetab: &mut PageTab, dst: &mut [u8], src: Gva) -> Result<(), MemoryError> {
    let data = load(pagetab, src, dst.len() as u64)?;
    dst.copy_from_slice(&data);
    Ok(())
}

/// Port of `CopyToUser`: writes `src` to `dst`.
pub fn copy_to_user(pagetab: &mut PageTab, dst: Gva, src: &[u8]) -> Result<(), MemoryError> {
    store(pagetab, dst, src)
}

/// Port of `SchlepR`: reads a range required to be user-readable.
pub fn schlep_r(pagetab: &mut PageTab, addr: Gva, len: u64) -> Result<Vec<u8>, MemoryError> {
    load(pagetab, addr, len)
}

/// Port of `SchlepW`: a scratch buffer for a range required to be
/// user-writable, committed via [`end_store`].
pub fn schlep_w(addr: Gva, len: u64) -> PendingStore {
    begin_store(addr, len)
}

/// Port of `SchlepRW`: a scratch buffer pre-populated with the current
/// contents of a range required to be both readable and writable, for a
/// read-modify-write micro-op.
pub fn schlep_rw(pagetab: &mut PageTab, addr: Gva, len: u64) -> Result<PendingStore, MemoryError> {
    let current = load(pagetab, addr, len)?;
    Ok(PendingStore { addr, buf: current })
}

fn load_str_impl(pagetab: &mut PageTab, addr: Gva) -> Result<Vec<u8>, MemoryError> {
    let mut out = Vec::new();
    let mut cursor = addr;
    loop {
        let page_base = cursor.page_base();
        let offset = cursor.page_offset() as usize;
        let entry = pagetab.resolve(page_base, PAGE_U)?;
        let frame = entry.table_address();
        let bytes = pagetab.frame_bytes(frame);
        let slice = &bytes[offset..];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            out.extend_from_slice(&slice[..pos]);
            return Ok(out);
        }
        out.extend_from_slice(slice);
        if out.len() > MAX_STRING_LEN {
            return Err(MemoryError::StringTooLong);
        }
        cursor = cursor.checked_add((PAGE_SIZE as usize - offset) as i64)?;
    }
}

/// Port of `LoadStr`: reads a NUL-terminated string from guest memory,
/// returning its bytes without the trailing NUL.
pub fn load_str(pagetab: &mut PageTab, addr: Gva) -> Result<Vec<u8>, MemoryError> {
    let bytes = load_str_impl(pagetab, addr)?;
    tracing::debug!(?addr, len = bytes.len(), "loaded guest string");
    Ok(bytes)
}

/// Port of `CopyStrList`: reads a guest pointer array terminated by a NULL
/// entry (the `argv`/`envp` shape), resolving each non-null pointer to its
/// string.
pub fn copy_str_list(pagetab: &mut PageTab, addr: Gva) -> Result<Vec<Vec<u8>>, MemoryError> {
    let mut list = Vec::new();
    let mut cursor = addr;
    loop {
        let raw = load(pagetab, cursor, 8)?;
        let ptr = u64::from_le_bytes(raw.try_into().unwrap());
        if ptr == 0 {
            return Ok(list);
        }
        let target = Gva::new(ptr as i64).map_err(|_| MemoryError::InvalidPointer(ptr))?;
        list.push(load_str(pagetab, target)?);
        cursor = cursor.checked_add(8)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gva(addr: i64) -> Gva {
        Gva::new(addr).unwrap()
    }

    fn fresh_mapped(base: i64, pages: u64) -> PageTab {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(base), PAGE_SIZE * pages, Prot::RW).unwrap();
        pt
    }

    #[test]
    fn store_then_load_roundtrips_within_one_page() {
        let mut pt = fresh_mapped(0x10000, 1);
        store(&mut pt, gva(0x10010), b"hello").unwrap();
        let back = load(&mut pt, gva(0x10010), 5).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn store_then_load_straddles_a_page_boundary() {
        let mut pt = fresh_mapped(0x20000, 2);
        let addr = gva(0x20000 + PAGE_SIZE as i64 - 2);
        store(&mut pt, addr, b"ABCD").unwrap();
        let back = load(&mut pt, addr, 4).unwrap();
        assert_eq!(back, b"ABCD");
    }

    #[test]
    fn pending_store_commits_on_end_store() {
        let mut pt = fresh_mapped(0x30000, 1);
        let mut pending = begin_store(gva(0x30000), 3);
        pending.bytes_mut().copy_from_slice(b"xyz");
        end_store(&mut pt, pending).unwrap();
        assert_eq!(load(&mut pt, gva(0x30000), 3).unwrap(), b"xyz");
    }

    #[test]
    fn is_valid_memory_rejects_unmapped_range() {
        let pt = fresh_mapped(0x40000, 1);
        assert!(is_valid_memory(&pt, gva(0x40000), PAGE_SIZE, Prot::RW));
        assert!(!is_valid_memory(&pt, gva(0x50000), PAGE_SIZE, Prot::RW));
    }

    #[test]
    fn is_valid_memory_checks_writability() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x60000), PAGE_SIZE, Prot::RO).unwrap();
        assert!(is_valid_memory(&pt, gva(0x60000), PAGE_SIZE, Prot::RO));
        assert!(!is_valid_memory(&pt, gva(0x60000), PAGE_SIZE, Prot::RW));
    }

    #[test]
    fn load_str_stops_at_nul() {
        let mut pt = fresh_mapped(0x70000, 1);
        store(&mut pt, gva(0x70000), b"hi\0garbage").unwrap();
        assert_eq!(load_str(&mut pt, gva(0x70000)).unwrap(), b"hi");
    }

    #[test]
    fn load_str_straddles_a_page_boundary() {
        let mut pt = fresh_mapped(0x80000, 2);
        let addr = gva(0x80000 + PAGE_SIZE as i64 - 2);
        store(&mut pt, addr, b"OK\0").unwrap();
        assert_eq!(load_str(&mut pt, addr).unwrap(), b"OK");
    }

    #[test]
    fn copy_str_list_reads_argv_style_array() {
        let mut pt = fresh_mapped(0x90000, 1);
        // Strings placed after the pointer array itself.
        let s1 = gva(0x90000 + 64);
        let s2 = gva(0x90000 + 96);
        store(&mut pt, s1, b"one\0").unwrap();
        store(&mut pt, s2, b"two\0").unwrap();
        store(&mut pt, gva(0x90000), &(s1.raw() as u64).to_le_bytes()).unwrap();
        store(&mut pt, gva(0x90000 + 8), &(s2.raw() as u64).to_le_bytes()).unwrap();
        store(&mut pt, gva(0x90000 + 16), &0u64.to_le_bytes()).unwrap();

        let list = copy_str_list(&mut pt, gva(0x90000)).unwrap();
        assert_eq!(list, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
