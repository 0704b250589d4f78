//! Four-level 48-bit guest page table: walking, on-demand table creation,
//! lazy-commit page faults, and the reserve/protect/free/find operations the
//! memory manager builds its higher-level address-space API on.
//!
//! Grounded on the source's `memory.c` (`FindPageTableEntry`,
//! `LookupAddress2`, `HandlePageFault`) and `memorymalloc.c` (frame
//! allocation, free list). Bit positions follow the data model exactly:
//! V=0, RW=1, U=2, FILE=3, RSRV=4, HOST=5, MAP=6, MUG=7, EOF=8, XD=63,
//! TA=bits 12-62.

use blink_filemap::{FileMapError, FileMaps};
use blink_types::Gva;
use std::collections::HashSet;
use std::path::Path;

pub const PAGE_SIZE: u64 = blink_types::PAGE_SIZE;
const ENTRIES_PER_TABLE: u64 = 512;
const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

pub const PAGE_V: u64 = 1 << 0;
pub const PAGE_RW: u64 = 1 << 1;
pub const PAGE_U: u64 = 1 << 2;
pub const PAGE_FILE: u64 = 1 << 3;
pub const PAGE_RSRV: u64 = 1 << 4;
pub const PAGE_HOST: u64 = 1 << 5;
pub const PAGE_MAP: u64 = 1 << 6;
pub const PAGE_MUG: u64 = 1 << 7;
pub const PAGE_EOF: u64 = 1 << 8;
pub const PAGE_XD: u64 = 1 << 63;
pub const PAGE_TA: u64 = 0x7fff_ffff_ffff_f000;

/// The host-address range Blink reserves for its own image and pool
/// allocator (the glossary's "precious region"): no guest mapping may ever
/// overlap it (I2). This crate has no host-mmap-backed linear mode to
/// protect for real (see `reserve_virtual`'s doc comment), so the one range
/// always kept precious is the null page — a guest mapping placed at
/// address 0 would otherwise make a NULL pointer dereference "work".
pub const PRECIOUS_REGION: (i64, i64) = (0, PAGE_SIZE as i64);

/// A single page table entry, wire-compatible with how it's stored in the
/// guest's backing arena (little-endian u64).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Pte(u64);

impl Pte {
    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 & PAGE_V != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & PAGE_RW != 0
    }

    pub fn is_user(self) -> bool {
        self.0 & PAGE_U != 0
    }

    pub fn is_file_backed(self) -> bool {
        self.0 & PAGE_FILE != 0
    }

    /// Reserved but not yet committed: a page fault on this entry allocates
    /// (or maps in) the backing frame lazily.
    pub fn is_reserved(self) -> bool {
        self.0 & PAGE_RSRV != 0
    }

    pub fn is_host_pointer(self) -> bool {
        self.0 & PAGE_HOST != 0
    }

    /// Created by `mmap`; may require an `munmap` at teardown.
    pub fn is_mmap_created(self) -> bool {
        self.0 & PAGE_MAP != 0
    }

    pub fn is_mugged(self) -> bool {
        self.0 & PAGE_MUG != 0
    }

    pub fn is_eof_sentinel(self) -> bool {
        self.0 & PAGE_EOF != 0
    }

    pub fn is_executable(self) -> bool {
        self.0 & PAGE_XD == 0
    }

    pub fn table_address(self) -> u64 {
        self.0 & PAGE_TA
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageTableError {
    #[error("guest virtual address {0:?} has no mapping")]
    NotPresent(Gva),
    #[error("operation requires write access to an unwritable page at {0:?}")]
    PermissionDenied(Gva),
    #[error("guest physical arena is exhausted, cannot allocate a new frame")]
    OutOfMemory,
    #[error("requested range [{base:?}, +{len:#x}) is not page-aligned")]
    Misaligned { base: Gva, len: u64 },
    #[error("range [{base:?}, +{len:#x}) overlaps Blink's precious region (I2)")]
    PreciousRegionOverlap { base: Gva, len: u64 },
    #[error(transparent)]
    FileMap(#[from] FileMapError),
}

/// Requested protection for a freshly reserved mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Prot {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

impl Prot {
    pub const RW: Prot = Prot {
        writable: true,
        user: true,
        executable: false,
    };
    pub const RX: Prot = Prot {
        writable: false,
        user: true,
        executable: true,
    };
    pub const RO: Prot = Prot {
        writable: false,
        user: true,
        executable: false,
    };
}

/// `memstat {committed, reserved, tables}` (§3): a point-in-time snapshot of
/// how much of the guest's address space is reserved, how much of that has
/// actually been committed to a physical frame, and how many bytes the
/// radix tree itself occupies. Invariant I3: `committed <= reserved`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Memstat {
    pub reserved: u64,
    pub committed: u64,
    pub tables: u64,
}

/// Owns the guest's backing physical arena and the four-level radix tree
/// pointing into it, plus the file-mapping provenance registry file-backed
/// reservations register into. One `PageTab` per `System`.
pub struct PageTab {
    arena: Vec<u8>,
    free_frames: Vec<u64>,
    next_frame: u64,
    root: u64,
    filemaps: FileMaps,
    precious_region: (i64, i64),
    reserved_bytes: u64,
    committed_bytes: u64,
    table_bytes: u64,
    page_faults_handled: u64,
}

impl PageTab {
    pub fn new(arena_bytes: u64) -> Result<Self, PageTableError> {
        let arena_bytes = arena_bytes.next_multiple_of(PAGE_SIZE);
        let mut pt = PageTab {
            arena: vec![0u8; arena_bytes as usize],
            free_frames: Vec::new(),
            next_frame: 0,
            root: 0,
            filemaps: FileMaps::new(),
            precious_region: PRECIOUS_REGION,
            reserved_bytes: 0,
            committed_bytes: 0,
            table_bytes: 0,
            page_faults_handled: 0,
        };
        pt.root = pt.alloc_frame()?;
        pt.table_bytes = PAGE_SIZE;
        Ok(pt)
    }

    fn alloc_frame(&mut self) -> Result<u64, PageTableError> {
        if let Some(frame) = self.free_frames.pop() {
            self.zero_frame(frame);
            return Ok(frame);
        }
        let frame = self.next_frame;
        if frame + PAGE_SIZE > self.arena.len() as u64 {
            return Err(PageTableError::OutOfMemory);
        }
        self.next_frame += PAGE_SIZE;
        self.zero_frame(frame);
        Ok(frame)
    }

    fn free_frame(&mut self, frame: u64) {
        self.free_frames.push(frame);
    }

    fn zero_frame(&mut self, frame: u64) {
        let start = frame as usize;
        self.arena[start..start + PAGE_SIZE as usize].fill(0);
    }

    fn read_entry(&self, table: u64, index: u64) -> Pte {
        let offset = (table + index * 8) as usize;
        let bytes: [u8; 8] = self.arena[offset..offset + 8].try_into().unwrap();
        Pte::from_raw(u64::from_le_bytes(bytes))
    }

    fn write_entry(&mut self, table: u64, index: u64, pte: Pte) {
        let offset = (table + index * 8) as usize;
        self.arena[offset..offset + 8].copy_from_slice(&pte.raw().to_le_bytes());
    }

    fn indices(gva: Gva) -> [u64; 4] {
        let page = gva.raw() as u64 & !(PAGE_SIZE - 1);
        LEVEL_SHIFTS.map(|shift| (page >> shift) & (ENTRIES_PER_TABLE - 1))
    }

    /// Walks all four levels without creating anything, the read path used
    /// by address translation.
    pub fn translate(&self, gva: Gva) -> Result<Pte, PageTableError> {
        let indices = Self::indices(gva);
        let mut table = self.root;
        for (level, &index) in indices.iter().enumerate() {
            let entry = self.read_entry(table, index);
            if !entry.is_valid() {
                return Err(PageTableError::NotPresent(gva));
            }
            if level == indices.len() - 1 {
                return Ok(entry);
            }
            table = entry.table_address();
        }
        unreachable!("indices always has 4 elements")
    }

    /// Walks the first three levels, allocating intermediate tables that
    /// don't exist yet, and returns the leaf table's physical offset plus
    /// the index within it.
    fn ensure_leaf_table(&mut self, gva: Gva) -> Result<(u64, u64), PageTableError> {
        let indices = Self::indices(gva);
        let mut table = self.root;
        for &index in &indices[..indices.len() - 1] {
            let entry = self.read_entry(table, index);
            table = if entry.is_valid() {
                entry.table_address()
            } else {
                let frame = self.alloc_frame()?;
                self.write_entry(table, index, Pte::from_raw(frame | PAGE_V | PAGE_RW | PAGE_U));
                self.table_bytes += PAGE_SIZE;
                frame
            };
        }
        Ok((table, indices[indices.len() - 1]))
    }

    fn require_no_precious_overlap(&self, base: Gva, len: u64) -> Result<(), PageTableError> {
        let (start, end) = self.precious_region;
        let req_start = base.raw();
        let req_end = req_start + len as i64;
        if req_start < end && start < req_end {
            return Err(PageTableError::PreciousRegionOverlap { base, len });
        }
        Ok(())
    }

    /// Reserves `len` bytes starting at `base` (both must be page-aligned)
    /// with the given protection, without committing physical frames.
    /// Matches the source's lazy-commit design: the first access takes a
    /// page fault that `handle_page_fault` resolves.
    ///
    /// This crate implements only the non-linear (page-table-backed)
    /// addressing path: a guest mapping is always realized by walking this
    /// radix tree into the shared arena, never by a direct host `mmap` at a
    /// linear guest-equals-host address. The precious-region overlap guard
    /// (I2) is enforced regardless, since it protects this tree's own
    /// storage rather than anything specific to a linear host mapping.
    pub fn reserve_virtual(&mut self, base: Gva, len: u64, prot: Prot) -> Result<(), PageTableError> {
        self.reserve_virtual_impl(base, len, prot, false)
    }

    /// `ReserveVirtual` with `fd != -1` (§4.2 step 6): same as
    /// [`reserve_virtual`](Self::reserve_virtual), but marks every page
    /// `FILE` (and the last page `EOF`) and registers a [`FileMap`]
    /// provenance record so a later fault knows which file and offset backs
    /// each page, and so `Memory` can recognize the `EOF` sentinel past the
    /// backing file's last mapped page.
    pub fn reserve_virtual_file(
        &mut self,
        base: Gva,
        len: u64,
        prot: Prot,
        path: impl AsRef<Path>,
        file_offset: u64,
    ) -> Result<(), PageTableError> {
        self.reserve_virtual_impl(base, len, prot, true)?;
        self.filemaps.register(base, len, path, file_offset)?;
        Ok(())
    }

    fn reserve_virtual_impl(
        &mut self,
        base: Gva,
        len: u64,
        prot: Prot,
        file_backed: bool,
    ) -> Result<(), PageTableError> {
        self.require_aligned(base, len)?;
        self.require_no_precious_overlap(base, len)?;
        let pages = len / PAGE_SIZE;
        let mut perm = PAGE_V | PAGE_RSRV;
        if prot.writable {
            perm |= PAGE_RW;
        }
        if prot.user {
            perm |= PAGE_U;
        }
        if !prot.executable {
            perm |= PAGE_XD;
        }
        if file_backed {
            perm |= PAGE_FILE;
        }
        for i in 0..pages {
            let gva = base.checked_add((i * PAGE_SIZE) as i64).unwrap();
            let mut entry_perm = perm;
            if file_backed && i == pages - 1 {
                entry_perm |= PAGE_EOF;
            }
            let (table, index) = self.ensure_leaf_table(gva)?;
            self.write_entry(table, index, Pte::from_raw(entry_perm));
        }
        self.reserved_bytes += len;
        Ok(())
    }

    /// Resolves a reserved-but-uncommitted page by allocating a physical
    /// frame, preserving the permission bits already recorded in the leaf
    /// entry. For a `FILE`-backed page (§4.2 `HandlePageFault`'s second
    /// case), the frame is filled from the backing file at the page's
    /// recorded offset instead of staying zeroed. Returns the committed
    /// entry.
    pub fn handle_page_fault(&mut self, gva: Gva) -> Result<Pte, PageTableError> {
        let (table, index) = {
            let indices = Self::indices(gva);
            let mut table = self.root;
            for &index in &indices[..indices.len() - 1] {
                let entry = self.read_entry(table, index);
                if !entry.is_valid() {
                    return Err(PageTableError::NotPresent(gva));
                }
                table = entry.table_address();
            }
            (table, indices[indices.len() - 1])
        };
        let entry = self.read_entry(table, index);
        if !entry.is_valid() {
            return Err(PageTableError::NotPresent(gva));
        }
        if !entry.is_reserved() {
            return Ok(entry);
        }
        let frame = self.alloc_frame()?;
        if entry.is_file_backed() {
            self.fill_file_backed_frame(gva, frame);
        }
        let committed = (entry.raw() & !PAGE_RSRV & !PAGE_TA) | frame;
        let committed = Pte::from_raw(committed);
        self.write_entry(table, index, committed);
        self.committed_bytes += PAGE_SIZE;
        self.page_faults_handled += 1;
        debug_assert!(self.committed_bytes <= self.reserved_bytes, "I3: rss must not exceed vss");
        tracing::debug!(?gva, frame, "committed reserved page");
        Ok(committed)
    }

    /// Fills a freshly committed frame from the file backing `gva`'s
    /// mapping, per §4.2 step 6/`HandlePageFault`'s file-mapped case. A page
    /// past the end of the file (including the `EOF` sentinel page itself,
    /// when the file's length isn't page-aligned) is left zeroed, matching
    /// `mmap`'s own "trailing bytes of the last page beyond EOF read as
    /// zero" behavior — it's the dispatcher's instruction-fetch path that
    /// turns an access strictly past that point into `SIGBUS`.
    fn fill_file_backed_frame(&mut self, gva: Gva, frame: u64) {
        let Some(record) = self.filemaps.find_covering(gva) else {
            return;
        };
        let page_index = ((gva.page_base().raw() - record.virt.raw()) / PAGE_SIZE as i64) as u64;
        let file_offset = record.offset + page_index * PAGE_SIZE;
        let path = record.path.clone();
        if let Some(data) = read_file_page(&path, file_offset) {
            let dst = self.frame_bytes_mut(frame);
            dst[..data.len()].copy_from_slice(&data);
        }
    }

    /// Unmaps `len` bytes starting at `base`, returning any committed frames
    /// to the free list and dropping whatever `FileMap` provenance those
    /// pages belonged to (I1).
    pub fn free_virtual(&mut self, base: Gva, len: u64) -> Result<(), PageTableError> {
        self.require_aligned(base, len)?;
        let pages = len / PAGE_SIZE;
        for i in 0..pages {
            let gva = base.checked_add((i * PAGE_SIZE) as i64).unwrap();
            let indices = Self::indices(gva);
            let mut table = self.root;
            let mut ok = true;
            for &index in &indices[..indices.len() - 1] {
                let entry = self.read_entry(table, index);
                if !entry.is_valid() {
                    ok = false;
                    break;
                }
                table = entry.table_address();
            }
            if !ok {
                continue;
            }
            let index = indices[indices.len() - 1];
            let entry = self.read_entry(table, index);
            if entry.is_valid() {
                if !entry.is_reserved() && !entry.is_host_pointer() {
                    self.free_frame(entry.table_address());
                    self.committed_bytes = self.committed_bytes.saturating_sub(PAGE_SIZE);
                }
                self.reserved_bytes = self.reserved_bytes.saturating_sub(PAGE_SIZE);
            }
            self.write_entry(table, index, Pte::default());
        }
        self.filemaps.unmap_range(base, len);
        Ok(())
    }

    /// Updates the writable bit of every already-mapped page in the range.
    pub fn protect_virtual(&mut self, base: Gva, len: u64, writable: bool) -> Result<(), PageTableError> {
        self.require_aligned(base, len)?;
        let pages = len / PAGE_SIZE;
        for i in 0..pages {
            let gva = base.checked_add((i * PAGE_SIZE) as i64).unwrap();
            let indices = Self::indices(gva);
            let mut table = self.root;
            for &index in &indices[..indices.len() - 1] {
                let entry = self.read_entry(table, index);
                if !entry.is_valid() {
                    return Err(PageTableError::NotPresent(gva));
                }
                table = entry.table_address();
            }
            let index = indices[indices.len() - 1];
            let entry = self.read_entry(table, index);
            if !entry.is_valid() {
                return Err(PageTableError::NotPresent(gva));
            }
            let raw = if writable {
                entry.raw() | PAGE_RW
            } else {
                entry.raw() & !PAGE_RW
            };
            self.write_entry(table, index, Pte::from_raw(raw));
        }
        Ok(())
    }

    /// `SyncVirtual` (msync): writes every committed, file-backed page in
    /// `[base, base+len)` back to its backing file at the recorded offset.
    /// Pages that are still reserved (never faulted in) or aren't
    /// file-backed have nothing to flush and are skipped silently.
    pub fn sync_virtual(&self, base: Gva, len: u64) -> Result<(), PageTableError> {
        self.require_aligned(base, len)?;
        let pages = len / PAGE_SIZE;
        for i in 0..pages {
            let gva = base.checked_add((i * PAGE_SIZE) as i64).unwrap();
            let entry = match self.translate(gva) {
                Ok(e) => e,
                Err(_) => continue,
            };
            if entry.is_reserved() || !entry.is_file_backed() {
                continue;
            }
            let Some(record) = self.filemaps.find_covering(gva) else {
                continue;
            };
            let page_index = ((gva.page_base().raw() - record.virt.raw()) / PAGE_SIZE as i64) as u64;
            let file_offset = record.offset + page_index * PAGE_SIZE;
            let path = record.path.clone();
            let data = self.frame_bytes(entry.table_address()).to_vec();
            write_file_page(&path, file_offset, &data);
        }
        Ok(())
    }

    /// Translates `gva`, committing a reserved page on the way (the
    /// lazy-fault path `LookupAddress`/`LookupAddress2` drive on every
    /// guest memory access), and checks the access against `need`
    /// (`PAGE_U`/`PAGE_RW` or both). Returns the now-committed entry.
    pub fn resolve(&mut self, gva: Gva, need: u64) -> Result<Pte, PageTableError> {
        let entry = self.translate(gva)?;
        let entry = if entry.is_reserved() {
            self.handle_page_fault(gva)?
        } else {
            entry
        };
        if entry.raw() & need != need {
            return Err(PageTableError::PermissionDenied(gva));
        }
        Ok(entry)
    }

    /// The raw bytes backing a physical frame (a leaf PTE's `table_address`),
    /// always exactly one page long.
    pub fn frame_bytes(&self, frame: u64) -> &[u8] {
        let start = frame as usize;
        &self.arena[start..start + PAGE_SIZE as usize]
    }

    pub fn frame_bytes_mut(&mut self, frame: u64) -> &mut [u8] {
        let start = frame as usize;
        &mut self.arena[start..start + PAGE_SIZE as usize]
    }

    pub fn is_mapped(&self, gva: Gva) -> bool {
        self.translate(gva).is_ok()
    }

    /// Finds the first page-aligned gap of `len` unmapped bytes at or after
    /// `hint`, the address-space manager's answer to `mmap(NULL, ...)`.
    pub fn find_virtual(&self, hint: Gva, len: u64) -> Option<Gva> {
        let pages_needed = len.div_ceil(PAGE_SIZE);
        let mut candidate = hint.page_base().raw();
        let limit = 1i64 << 46;
        'search: while candidate < limit {
            for i in 0..pages_needed {
                let probe = Gva::new(candidate).ok()?.checked_add((i * PAGE_SIZE) as i64).ok()?;
                if self.is_mapped(probe) {
                    candidate += ((i + 1) * PAGE_SIZE) as i64;
                    continue 'search;
                }
            }
            return Gva::new(candidate).ok();
        }
        None
    }

    fn require_aligned(&self, base: Gva, len: u64) -> Result<(), PageTableError> {
        if !base.is_page_aligned() || len % PAGE_SIZE != 0 {
            return Err(PageTableError::Misaligned { base, len });
        }
        Ok(())
    }

    /// All currently-mapped page-aligned addresses, for sanity-checking in
    /// tests and for `sync_virtual`'s msync-style writeback scan.
    pub fn mapped_pages(&self) -> HashSet<u64> {
        let mut out = HashSet::new();
        self.walk_leaves(self.root, 0, 0, &mut out);
        out
    }

    fn walk_leaves(&self, table: u64, level: usize, base: u64, out: &mut HashSet<u64>) {
        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.read_entry(table, index);
            if !entry.is_valid() {
                continue;
            }
            let shift = LEVEL_SHIFTS[level];
            let addr = base | (index << shift) as u64;
            if level + 1 == LEVEL_SHIFTS.len() {
                out.insert(addr);
            } else {
                self.walk_leaves(entry.table_address(), level + 1, addr, out);
            }
        }
    }

    /// The file-mapping provenance registry backing this table's `FILE`
    /// pages (`System.filemaps` in the data model — owned here rather than
    /// alongside `PageTab` since every mutation of one must stay in lock
    /// step with the other).
    pub fn filemaps(&self) -> &FileMaps {
        &self.filemaps
    }

    /// `memstat {committed, reserved, tables}` (§3).
    pub fn memstat(&self) -> Memstat {
        Memstat {
            reserved: self.reserved_bytes,
            committed: self.committed_bytes,
            tables: self.table_bytes,
        }
    }

    pub fn page_faults_handled(&self) -> u64 {
        self.page_faults_handled
    }
}

fn read_file_page(path: &Path, offset: u64) -> Option<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = std::fs::File::open(path).ok()?;
    f.seek(SeekFrom::Start(offset)).ok()?;
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let n = f.read(&mut buf).ok()?;
    buf.truncate(n);
    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

fn write_file_page(path: &Path, offset: u64, data: &[u8]) {
    use std::io::{Seek, SeekFrom, Write};
    let Ok(mut f) = std::fs::OpenOptions::new().write(true).open(path) else {
        return;
    };
    if f.seek(SeekFrom::Start(offset)).is_ok() {
        let _ = f.write_all(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gva(addr: i64) -> Gva {
        Gva::new(addr).unwrap()
    }

    fn temp_file(contents: &[u8]) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("blink-pagetab-test-{}-{}", std::process::id(), id));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn reserve_then_translate_sees_reserved_not_present() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x10000), PAGE_SIZE, Prot::RW).unwrap();
        let entry = pt.translate(gva(0x10000)).unwrap();
        assert!(entry.is_valid());
        assert!(entry.is_reserved());
    }

    #[test]
    fn page_fault_commits_a_frame() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x20000), PAGE_SIZE, Prot::RW).unwrap();
        let committed = pt.handle_page_fault(gva(0x20000)).unwrap();
        assert!(!committed.is_reserved());
        assert!(committed.is_valid());
        // Idempotent: faulting again on an already-committed page is a no-op.
        let again = pt.handle_page_fault(gva(0x20000)).unwrap();
        assert_eq!(again, committed);
    }

    #[test]
    fn free_virtual_clears_mapping() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x30000), PAGE_SIZE, Prot::RW).unwrap();
        pt.handle_page_fault(gva(0x30000)).unwrap();
        pt.free_virtual(gva(0x30000), PAGE_SIZE).unwrap();
        assert!(matches!(
            pt.translate(gva(0x30000)),
            Err(PageTableError::NotPresent(_))
        ));
    }

    #[test]
    fn protect_virtual_toggles_writable_bit() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x40000), PAGE_SIZE, Prot::RW).unwrap();
        pt.protect_virtual(gva(0x40000), PAGE_SIZE, false).unwrap();
        assert!(!pt.translate(gva(0x40000)).unwrap().is_writable());
    }

    #[test]
    fn find_virtual_skips_mapped_ranges() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x50000), PAGE_SIZE * 2, Prot::RW).unwrap();
        let found = pt.find_virtual(gva(0x50000), PAGE_SIZE).unwrap();
        assert!(found.raw() >= 0x50000 + (PAGE_SIZE * 2) as i64);
    }

    #[test]
    fn resolve_commits_and_checks_permission() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x60000), PAGE_SIZE, Prot::RO).unwrap();
        let entry = pt.resolve(gva(0x60000), PAGE_U).unwrap();
        assert!(!entry.is_reserved());
        let err = pt.resolve(gva(0x60000), PAGE_RW).unwrap_err();
        assert!(matches!(err, PageTableError::PermissionDenied(_)));
    }

    #[test]
    fn misaligned_range_is_rejected() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        let err = pt.reserve_virtual(gva(0x10001), PAGE_SIZE, Prot::RW).unwrap_err();
        assert!(matches!(err, PageTableError::Misaligned { .. }));
    }

    #[test]
    fn reserving_over_the_precious_region_is_rejected() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        let err = pt.reserve_virtual(gva(0), PAGE_SIZE, Prot::RW).unwrap_err();
        assert!(matches!(err, PageTableError::PreciousRegionOverlap { .. }));
    }

    #[test]
    fn memstat_tracks_reserved_and_committed_bytes() {
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual(gva(0x70000), PAGE_SIZE * 2, Prot::RW).unwrap();
        assert_eq!(pt.memstat().reserved, PAGE_SIZE * 2);
        assert_eq!(pt.memstat().committed, 0);

        pt.handle_page_fault(gva(0x70000)).unwrap();
        assert_eq!(pt.memstat().committed, PAGE_SIZE);
        assert_eq!(pt.page_faults_handled(), 1);
        assert!(pt.memstat().committed <= pt.memstat().reserved);

        pt.free_virtual(gva(0x70000), PAGE_SIZE * 2).unwrap();
        assert_eq!(pt.memstat().reserved, 0);
        assert_eq!(pt.memstat().committed, 0);
    }

    #[test]
    fn file_backed_reservation_marks_file_and_eof_bits() {
        let path = temp_file(b"hello world");
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual_file(gva(0x80000), PAGE_SIZE * 2, Prot::RW, &path, 0)
            .unwrap();

        let first = pt.translate(gva(0x80000)).unwrap();
        assert!(first.is_file_backed());
        assert!(!first.is_eof_sentinel());
        let last = pt.translate(gva(0x80000 + PAGE_SIZE as i64)).unwrap();
        assert!(last.is_file_backed());
        assert!(last.is_eof_sentinel());
        assert_eq!(pt.filemaps().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_backed_page_fault_reads_file_contents() {
        let path = temp_file(b"payload-bytes");
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual_file(gva(0x90000), PAGE_SIZE, Prot::RW, &path, 0)
            .unwrap();
        let committed = pt.handle_page_fault(gva(0x90000)).unwrap();
        let bytes = pt.frame_bytes(committed.table_address());
        assert_eq!(&bytes[..13], b"payload-bytes");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn freeing_a_file_backed_range_drops_its_provenance_record() {
        let path = temp_file(b"contents");
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual_file(gva(0xa0000), PAGE_SIZE, Prot::RW, &path, 0)
            .unwrap();
        pt.free_virtual(gva(0xa0000), PAGE_SIZE).unwrap();
        assert!(pt.filemaps().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sync_virtual_writes_committed_pages_back_to_the_file() {
        let path = temp_file(&[0u8; 8]);
        let mut pt = PageTab::new(16 * 1024 * 1024).unwrap();
        pt.reserve_virtual_file(gva(0xb0000), PAGE_SIZE, Prot::RW, &path, 0)
            .unwrap();
        let committed = pt.handle_page_fault(gva(0xb0000)).unwrap();
        pt.frame_bytes_mut(committed.table_address())[..5].copy_from_slice(b"dirty");
        pt.sync_virtual(gva(0xb0000), PAGE_SIZE).unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[..5], b"dirty");

        let _ = std::fs::remove_file(&path);
    }
}
