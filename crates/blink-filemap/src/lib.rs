//! Provenance records for `mmap`ed guest ranges: which host file (and
//! offset) backs which guest pages, and which of those pages are still
//! mapped in.
//!
//! The source keeps these as a doubly-linked list (`struct FileMap` with
//! `next`/`prev` threaded through `dll.h`) hung off `System::filemaps`. The
//! redesign note calls for replacing that cyclic-list pattern with an
//! arena-indexed or native structure; here the registry is a `BTreeMap`
//! keyed by the mapping's base guest address, giving the same "walk in
//! address order" traversal the source relies on (e.g. when looking for the
//! record a faulting address falls into) without hand-rolled prev/next
//! pointers.

use blink_types::{Gva, PAGE_SIZE};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FileMapError {
    #[error("range base {base:#x} or length {len:#x} is not page-aligned")]
    Misaligned { base: i64, len: u64 },
    #[error("range [{base:#x}, {end:#x}) overlaps an existing file mapping")]
    Overlaps { base: i64, end: i64 },
    #[error("no file mapping covers address {0}")]
    NotFound(Gva),
}

/// One provenance record: `[virt, virt + size)` came from `path` starting at
/// host file `offset`, plus a per-page bitmap of which of those pages are
/// still present (a page is cleared from this record when unmapped, and the
/// whole record is dropped once none remain — matching "`FileMap` ... is
/// removed when its last page is unmapped").
#[derive(Debug, Clone)]
pub struct FileMap {
    pub virt: Gva,
    pub size: u64,
    pub path: PathBuf,
    pub offset: u64,
    present: Vec<bool>,
}

impl FileMap {
    fn page_count(size: u64) -> usize {
        (size / PAGE_SIZE) as usize
    }

    pub fn page_count_ref(&self) -> usize {
        self.present.len()
    }

    /// `true` if the page at guest address `gva` (which must fall within
    /// this record's range) is still mapped in.
    pub fn is_page_present(&self, gva: Gva) -> bool {
        let idx = self.page_index(gva);
        self.present.get(idx).copied().unwrap_or(false)
    }

    /// `true` if `gva` is the final page of the backing file mapping — the
    /// point past which `Memory` must synthesize an `EOF` sentinel rather
    /// than read past the end of the file.
    pub fn is_last_page(&self, gva: Gva) -> bool {
        self.page_index(gva) + 1 == self.present.len()
    }

    fn page_index(&self, gva: Gva) -> usize {
        ((gva.page_base().raw() - self.virt.raw()) / PAGE_SIZE as i64) as usize
    }

    fn contains(&self, gva: Gva) -> bool {
        let start = self.virt.raw();
        let end = start + self.size as i64;
        gva.raw() >= start && gva.raw() < end
    }
}

/// All provenance records for one `System`, ordered by base guest address.
#[derive(Debug, Default)]
pub struct FileMaps {
    maps: std::collections::BTreeMap<i64, FileMap>,
}

impl FileMaps {
    pub fn new() -> Self {
        FileMaps::default()
    }

    /// Registers a new provenance record for `[virt, virt + size)`. Fails if
    /// the range isn't page-aligned or overlaps an already-registered range.
    pub fn register(
        &mut self,
        virt: Gva,
        size: u64,
        path: impl AsRef<Path>,
        offset: u64,
    ) -> Result<(), FileMapError> {
        if !virt.is_page_aligned() || size == 0 || size % PAGE_SIZE != 0 {
            return Err(FileMapError::Misaligned {
                base: virt.raw(),
                len: size,
            });
        }
        let end = virt.raw() + size as i64;
        let overlaps = self
            .maps
            .values()
            .any(|prior| prior.virt.raw() < end && prior.virt.raw() + prior.size as i64 > virt.raw());
        if overlaps {
            return Err(FileMapError::Overlaps {
                base: virt.raw(),
                end,
            });
        }

        let record = FileMap {
            virt,
            size,
            path: path.as_ref().to_path_buf(),
            offset,
            present: vec![true; FileMap::page_count(size)],
        };
        tracing::debug!(?virt, size, path = %record.path.display(), "registered file map");
        self.maps.insert(virt.raw(), record);
        Ok(())
    }

    /// The record covering `gva`, if any.
    pub fn find_covering(&self, gva: Gva) -> Option<&FileMap> {
        self.maps
            .range(..=gva.raw())
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(gva))
    }

    /// Marks every page in `[virt, virt + len)` as unmapped across whichever
    /// records it touches. A record is removed entirely once none of its
    /// pages remain present. Touching a sub-range with no file mapping is a
    /// no-op, matching `FreeVirtual`'s tie-break for never-mapped ranges.
    pub fn unmap_range(&mut self, virt: Gva, len: u64) {
        let start = virt.raw();
        let end = start + len as i64;
        let mut emptied = Vec::new();

        for (&base, record) in self.maps.range_mut(..end) {
            let record_end = record.virt.raw() + record.size as i64;
            if record_end <= start {
                continue;
            }
            let mut page = record.virt.raw();
            for present in record.present.iter_mut() {
                if page >= start && page < end {
                    *present = false;
                }
                page += PAGE_SIZE as i64;
            }
            if record.present.iter().all(|p| !p) {
                emptied.push(base);
            }
        }

        for base in emptied {
            tracing::debug!(base, "file map fully unmapped, dropping provenance record");
            self.maps.remove(&base);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gva(addr: i64) -> Gva {
        Gva::new(addr).unwrap()
    }

    #[test]
    fn register_then_find_covering_returns_the_record() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x1000), PAGE_SIZE * 3, "/bin/ls", 0).unwrap();

        let found = maps.find_covering(gva(0x1000 + 10)).unwrap();
        assert_eq!(found.virt, gva(0x1000));
        assert!(maps.find_covering(gva(0x1000 + 3 * PAGE_SIZE as i64)).is_none());
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x1000), PAGE_SIZE * 2, "/bin/ls", 0).unwrap();
        let err = maps
            .register(gva(0x1000 + PAGE_SIZE as i64), PAGE_SIZE, "/bin/ls", 0)
            .unwrap_err();
        assert!(matches!(err, FileMapError::Overlaps { .. }));
    }

    #[test]
    fn misaligned_registration_is_rejected() {
        let mut maps = FileMaps::new();
        let err = maps.register(gva(0x1001), PAGE_SIZE, "/bin/ls", 0).unwrap_err();
        assert!(matches!(err, FileMapError::Misaligned { .. }));
    }

    #[test]
    fn unmapping_every_page_drops_the_record() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x2000), PAGE_SIZE * 2, "/bin/ls", 0).unwrap();
        maps.unmap_range(gva(0x2000), PAGE_SIZE * 2);
        assert!(maps.is_empty());
    }

    #[test]
    fn unmapping_one_page_keeps_the_record_for_the_rest() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x3000), PAGE_SIZE * 2, "/bin/ls", 0).unwrap();
        maps.unmap_range(gva(0x3000), PAGE_SIZE);

        assert_eq!(maps.len(), 1);
        assert!(!maps.find_covering(gva(0x3000)).unwrap().is_page_present(gva(0x3000)));
        assert!(maps
            .find_covering(gva(0x3000 + PAGE_SIZE as i64))
            .unwrap()
            .is_page_present(gva(0x3000 + PAGE_SIZE as i64)));
    }

    #[test]
    fn last_page_is_identified_for_eof_handling() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x4000), PAGE_SIZE * 2, "/bin/ls", 0).unwrap();
        let record = maps.find_covering(gva(0x4000)).unwrap();
        assert!(!record.is_last_page(gva(0x4000)));
        assert!(record.is_last_page(gva(0x4000 + PAGE_SIZE as i64)));
    }

    #[test]
    fn unmapping_a_never_mapped_range_is_a_no_op() {
        let mut maps = FileMaps::new();
        maps.register(gva(0x5000), PAGE_SIZE, "/bin/ls", 0).unwrap();
        maps.unmap_range(gva(0x9000), PAGE_SIZE);
        assert_eq!(maps.len(), 1);
    }
}
