//! A handful of Linux ABI structs the syscall layer this crate externalizes
//! will need to lay out in guest memory. Kept minimal and `#[repr(C)]` with
//! explicit little-endian field widths rather than depending on the host's
//! native layout, since guest memory is a byte array this crate owns, not a
//! host `struct` the compiler lays out.

/// `struct timespec` as the guest sees it: two `i64`s, always 8-byte aligned
/// regardless of host pointer width.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TimespecLinux {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl TimespecLinux {
    pub const SIZE: usize = 16;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.tv_sec.to_le_bytes());
        out[8..16].copy_from_slice(&self.tv_nsec.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        TimespecLinux {
            tv_sec: i64::from_le_bytes(b[0..8].try_into().unwrap()),
            tv_nsec: i64::from_le_bytes(b[8..16].try_into().unwrap()),
        }
    }
}

/// `struct iovec` as the guest sees it: a pointer and a length, both 8
/// bytes on this emulator's only supported ABI (x86-64).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[repr(C)]
pub struct IovecLinux {
    pub iov_base: u64,
    pub iov_len: u64,
}

impl IovecLinux {
    pub const SIZE: usize = 16;

    pub fn from_bytes(b: &[u8]) -> Self {
        IovecLinux {
            iov_base: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            iov_len: u64::from_le_bytes(b[8..16].try_into().unwrap()),
        }
    }
}

/// The subset of `struct stat` this core's test harness populates: enough
/// fields for `fstat`/`stat`-backed tests to assert on, not the full
/// glibc layout (which also varies by libc ABI version).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[repr(C)]
pub struct StatLinuxMinimal {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
}

impl StatLinuxMinimal {
    pub const SIZE: usize = 56;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.st_dev.to_le_bytes());
        out[8..16].copy_from_slice(&self.st_ino.to_le_bytes());
        out[16..20].copy_from_slice(&self.st_mode.to_le_bytes());
        out[20..24].copy_from_slice(&self.st_nlink.to_le_bytes());
        out[24..28].copy_from_slice(&self.st_uid.to_le_bytes());
        out[28..32].copy_from_slice(&self.st_gid.to_le_bytes());
        out[32..40].copy_from_slice(&self.st_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.st_blksize.to_le_bytes());
        out[48..56].copy_from_slice(&self.st_blocks.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_round_trips_through_bytes() {
        let t = TimespecLinux { tv_sec: 12345, tv_nsec: 678 };
        assert_eq!(TimespecLinux::from_bytes(&t.to_bytes()), t);
    }

    #[test]
    fn iovec_reads_little_endian_fields() {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&64u64.to_le_bytes());
        let iov = IovecLinux::from_bytes(&bytes);
        assert_eq!(iov.iov_base, 0x1000);
        assert_eq!(iov.iov_len, 64);
    }
}
