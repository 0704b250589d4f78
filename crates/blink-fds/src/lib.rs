//! Guest file-descriptor bookkeeping: the guest-fd-number space and the
//! host-fildes-keyed table of open files/sockets it maps onto.
//!
//! The source splits this into two structures (`fds.h`/`fds.c`):
//!
//! - `MachineFds`/`MachineFd` is the guest-fd-number allocator — a dense
//!   array indexed by the small integer the guest program sees, with a
//!   freelist of numbers released by `close()` so they get reused before the
//!   array grows. Its own `.c` implementation wasn't available to build
//!   against, so [`MachineFds`] below is a fresh design against the header's
//!   shape: a `Vec` of slots plus a freelist of released indices.
//! - `Fd`/`Fds` is the host side: one entry per open host fildes, holding the
//!   socket metadata `InheritFd` fills in (`socktype`, `norestart`, the
//!   bound address) and an MRU-ordered list so repeat lookups of the
//!   most-recently-used fd are fast. The source threads this as a
//!   doubly-linked `dll`; here it's a `Vec<Fd>` with move-to-front-on-hit,
//!   which gives the same amortized behavior without manual prev/next
//!   pointers.

pub mod ancillary;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{self, SockaddrStorage};
use nix::sys::time::TimeVal;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FdsError {
    #[error("fildes {0} is not open")]
    NotOpen(RawFd),
    #[error("fildes must be non-negative, got {0}")]
    NegativeFildes(RawFd),
    #[error(transparent)]
    Host(#[from] HostIoError),
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("host syscall failed: {0}")]
pub struct HostIoError(pub nix::errno::Errno);

/// One open host file descriptor and the metadata `InheritFd` records about
/// it. `cloexec` mirrors the `O_CLOEXEC` bit tracked in `oflags` in the
/// source; kept as its own field here since `SysCloseExec` only cares about
/// that one bit.
#[derive(Debug, Clone)]
pub struct Fd {
    pub fildes: RawFd,
    pub oflags: OFlag,
    pub socktype: Option<i32>,
    pub norestart: bool,
    pub saddr: Option<SockaddrStorage>,
    pub cloexec: bool,
}

impl Fd {
    fn new(fildes: RawFd, oflags: OFlag) -> Self {
        Fd {
            fildes,
            oflags,
            socktype: None,
            norestart: false,
            saddr: None,
            cloexec: oflags.contains(OFlag::O_CLOEXEC),
        }
    }
}

fn get_fd_socket_type(fildes: RawFd) -> Option<i32> {
    socket::getsockopt(fildes, socket::sockopt::SockType)
        .ok()
        .map(|t| t as i32)
}

fn is_no_restart_socket(fildes: RawFd) -> bool {
    socket::getsockopt(fildes, socket::sockopt::ReceiveTimeout)
        .map(|tv: TimeVal| tv.tv_sec() != 0 || tv.tv_usec() != 0)
        .unwrap_or(false)
}

/// All open host fildes for one `System`, most-recently-used first.
#[derive(Debug, Default)]
pub struct Fds {
    list: Vec<Fd>,
}

impl Fds {
    pub fn new() -> Self {
        Fds::default()
    }

    /// Registers an already-open host fildes, inserted at the front (most
    /// recently used position), matching `dll_make_first` in `AddFd`.
    pub fn add_fd(&mut self, fildes: RawFd, oflags: OFlag) -> Result<&Fd, FdsError> {
        if fildes < 0 {
            return Err(FdsError::NegativeFildes(fildes));
        }
        self.list.insert(0, Fd::new(fildes, oflags));
        Ok(&self.list[0])
    }

    /// Adds a new fildes inheriting socket metadata from an existing `Fd`
    /// (used when a `dup`/`fork`-like syscall clones a descriptor).
    pub fn fork_fd(
        &mut self,
        fildes: RawFd,
        oflags: OFlag,
        from: Option<&Fd>,
    ) -> Result<&Fd, FdsError> {
        if fildes < 0 {
            return Err(FdsError::NegativeFildes(fildes));
        }
        let mut fd = Fd::new(fildes, oflags);
        if let Some(from) = from {
            fd.socktype = from.socktype;
            fd.norestart = from.norestart;
            fd.saddr = from.saddr;
        }
        self.list.insert(0, fd);
        Ok(&self.list[0])
    }

    /// Finds `fildes`, bumping it to the front of the MRU list unless it was
    /// already there (matching the `lru` flag in `GetFd`, which skips the
    /// bump when the hit is already first).
    pub fn get_fd(&mut self, fildes: RawFd) -> Result<&Fd, FdsError> {
        if fildes < 0 {
            return Err(FdsError::NegativeFildes(fildes));
        }
        let idx = self
            .list
            .iter()
            .position(|fd| fd.fildes == fildes)
            .ok_or(FdsError::NotOpen(fildes))?;
        if idx != 0 {
            let fd = self.list.remove(idx);
            self.list.insert(0, fd);
        }
        Ok(&self.list[0])
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Removes and returns the entry for `fildes`, if open. The caller is
    /// responsible for actually closing the host descriptor (mirrors
    /// `CloseFd` calling `IB(fd->cb->close)` after `FreeFd`).
    pub fn remove_fd(&mut self, fildes: RawFd) -> Option<Fd> {
        let idx = self.list.iter().position(|fd| fd.fildes == fildes)?;
        Some(self.list.remove(idx))
    }

    /// Removes and returns every entry whose fildes falls in `[first, last]`,
    /// matching `SysCloseRange`.
    pub fn remove_range(&mut self, first: RawFd, last: RawFd) -> Vec<Fd> {
        let mut removed = Vec::new();
        self.list.retain(|fd| {
            if fd.fildes >= first && fd.fildes <= last {
                removed.push(fd.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Removes and returns every entry with `cloexec` set, matching
    /// `SysCloseExec`.
    pub fn remove_cloexec(&mut self) -> Vec<Fd> {
        let mut removed = Vec::new();
        self.list.retain(|fd| {
            if fd.cloexec {
                removed.push(fd.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Fills in `socktype`/`norestart`/`saddr` for a freshly added `Fd` by
    /// querying the host kernel, matching `InheritFd`.
    pub fn inherit(&mut self, fildes: RawFd) {
        let Some(fd) = self.list.iter_mut().find(|fd| fd.fildes == fildes) else {
            return;
        };
        if let Some(socktype) = get_fd_socket_type(fildes) {
            fd.socktype = Some(socktype);
            fd.norestart = is_no_restart_socket(fildes);
            fd.saddr = socket::getsockname(fildes).ok();
        }
    }

    /// Adds an already-open standard stream (stdin/stdout/stderr) to the
    /// table, matching `AddStdFd`.
    pub fn add_std_fd(&mut self, fildes: RawFd) -> Result<(), FdsError> {
        let flags = fcntl(fildes, FcntlArg::F_GETFL).map_err(HostIoError)?;
        let oflags = OFlag::from_bits_truncate(flags);
        self.add_fd(fildes, oflags)?;
        self.inherit(fildes);
        Ok(())
    }
}

/// One slot in the guest-fd-number space: either occupied by the host
/// fildes backing it, or free and on the reuse list.
#[derive(Debug, Default)]
pub struct MachineFds {
    slots: Vec<Option<RawFd>>,
    freed: Vec<i32>,
}

impl MachineFds {
    pub fn new() -> Self {
        MachineFds::default()
    }

    /// Allocates the next guest fd number, preferring a previously-released
    /// one (matching the header's `MachineFdClosed` freelist), and binds it
    /// to `fildes`. Returns the guest fd number.
    pub fn add(&mut self, fildes: RawFd) -> i32 {
        if let Some(idx) = self.freed.pop() {
            self.slots[idx as usize] = Some(fildes);
            return idx;
        }
        self.slots.push(Some(fildes));
        (self.slots.len() - 1) as i32
    }

    /// Releases a guest fd number back onto the freelist.
    pub fn remove(&mut self, guest_fd: i32) {
        if let Some(slot) = self.slots.get_mut(guest_fd as usize) {
            if slot.take().is_some() {
                self.freed.push(guest_fd);
            }
        }
    }

    /// The host fildes a guest fd number currently maps to, if any.
    pub fn resolve(&self, guest_fd: i32) -> Option<RawFd> {
        self.slots.get(guest_fd as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_fd_is_found_by_get_fd() {
        let mut fds = Fds::new();
        fds.add_fd(7, OFlag::O_RDWR).unwrap();
        assert_eq!(fds.get_fd(7).unwrap().fildes, 7);
    }

    #[test]
    fn get_fd_on_absent_fildes_is_not_open() {
        let mut fds = Fds::new();
        assert_eq!(fds.get_fd(3).unwrap_err(), FdsError::NotOpen(3));
    }

    #[test]
    fn get_fd_bumps_hit_to_front() {
        let mut fds = Fds::new();
        fds.add_fd(1, OFlag::empty()).unwrap();
        fds.add_fd(2, OFlag::empty()).unwrap();
        fds.add_fd(3, OFlag::empty()).unwrap();
        // MRU order is [3, 2, 1]; touching 1 should move it to the front.
        fds.get_fd(1).unwrap();
        assert_eq!(fds.list[0].fildes, 1);
    }

    #[test]
    fn fork_fd_inherits_socket_metadata() {
        let mut fds = Fds::new();
        fds.add_fd(5, OFlag::empty()).unwrap();
        {
            let fd = fds.list.get_mut(0).unwrap();
            fd.socktype = Some(1);
            fd.norestart = true;
        }
        let from = fds.list[0].clone();
        fds.fork_fd(6, OFlag::empty(), Some(&from)).unwrap();
        let forked = fds.get_fd(6).unwrap();
        assert_eq!(forked.socktype, Some(1));
        assert!(forked.norestart);
    }

    #[test]
    fn remove_range_takes_only_fildes_in_bounds() {
        let mut fds = Fds::new();
        fds.add_fd(1, OFlag::empty()).unwrap();
        fds.add_fd(5, OFlag::empty()).unwrap();
        fds.add_fd(10, OFlag::empty()).unwrap();
        let removed = fds.remove_range(2, 8);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].fildes, 5);
        assert_eq!(fds.count(), 2);
    }

    #[test]
    fn remove_cloexec_takes_only_flagged_entries() {
        let mut fds = Fds::new();
        fds.add_fd(1, OFlag::O_CLOEXEC).unwrap();
        fds.add_fd(2, OFlag::empty()).unwrap();
        let removed = fds.remove_cloexec();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].fildes, 1);
        assert_eq!(fds.count(), 1);
    }

    #[test]
    fn negative_fildes_is_rejected() {
        let mut fds = Fds::new();
        assert_eq!(
            fds.add_fd(-1, OFlag::empty()).unwrap_err(),
            FdsError::NegativeFildes(-1)
        );
    }

    #[test]
    fn machine_fds_reuses_freed_numbers_before_growing() {
        let mut mfds = MachineFds::new();
        let a = mfds.add(100);
        let b = mfds.add(101);
        mfds.remove(a);
        let c = mfds.add(102);
        assert_eq!(c, a);
        assert_eq!(mfds.resolve(b), Some(101));
        assert_eq!(mfds.resolve(a), Some(102));
    }

    #[test]
    fn machine_fds_resolve_after_remove_is_none() {
        let mut mfds = MachineFds::new();
        let a = mfds.add(42);
        mfds.remove(a);
        assert_eq!(mfds.resolve(a), None);
    }
}
