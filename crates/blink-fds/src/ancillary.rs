//! `SendAncillary`/`ReceiveAncillary`: marshals guest `SCM_RIGHTS` and
//! `SCM_CREDENTIALS` control messages onto and off of a real host
//! `sendmsg`/`recvmsg` call.
//!
//! Grounded on the source's `ancillary.c`. The source walks a guest
//! `msghdr_linux.control` buffer by hand, parsing `cmsghdr_linux{len,level,
//! type}` records and appending host `cmsg`s via `AppendCmsg`, capped by a
//! fixed `kMaxAncillary` scratch allocation; an unsupported level/type there
//! is an assertion failure. This port rejects that case with
//! [`AncillaryError::Unsupported`] instead of panicking, since the guest
//! supplies the shape of that buffer and it shouldn't be trusted the way an
//! internal invariant is. `TrackScmRightsFd`/`ReceiveScmRights`'s relay cap
//! (`min(received, guest space / 4, SCM_MAX_FD)`) and `MSG_CTRUNC` signaling
//! on truncation are reproduced as-is.

use crate::{Fds, HostIoError};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, UnixCredentials,
};
use nix::unistd::close;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Linux's `SCM_MAX_FD`: the kernel refuses to relay more descriptors than
/// this in a single `SCM_RIGHTS` message.
pub const SCM_MAX_FD: usize = 253;

/// Upper bound on a marshalled control buffer, sized for a full
/// `SCM_MAX_FD`-long `SCM_RIGHTS` payload plus header overhead — this
/// port's analogue of the source's fixed `kMaxAncillary` scratch
/// allocation.
pub const MAX_ANCILLARY_BYTES: usize = (SCM_MAX_FD + 1) * 4 + 64;

/// Guest-visible `MSG_CTRUNC`: control data was truncated because the
/// guest's buffer (or the `SCM_MAX_FD` cap) couldn't hold everything the
/// host handed back.
pub const MSG_CTRUNC_LINUX: u32 = 0x08;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AncillaryError {
    #[error("ancillary payload of {0} bytes exceeds the kMaxAncillary-equivalent cap")]
    TooLarge(usize),
    #[error("SCM_RIGHTS payload carries {0} descriptors, more than SCM_MAX_FD ({SCM_MAX_FD})")]
    TooManyFds(usize),
    #[error("unsupported cmsg level/type ({level}, {cmsg_type})")]
    Unsupported { level: i32, cmsg_type: i32 },
    #[error(transparent)]
    Host(#[from] HostIoError),
}

/// One guest-supplied ancillary record, decoded from `msghdr_linux.control`
/// (a `SOL_SOCKET` cmsg carries either an fd array or a credential triple —
/// nothing else is relayed by this core, matching `SendAncillary`'s
/// level/type dispatch).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GuestCmsg {
    Rights(Vec<RawFd>),
    Credentials { pid: i32, uid: u32, gid: u32 },
}

/// `SendAncillary`: builds the host control messages for one `sendmsg` call
/// from the guest's already-decoded ancillary records, enforcing the same
/// size and fd-count caps the source's `AppendCmsg`/`SendScmRights` do.
pub fn send_ancillary(
    fildes: RawFd,
    iov: &[IoSlice<'_>],
    addr: Option<&UnixAddr>,
    records: &[GuestCmsg],
) -> Result<usize, AncillaryError> {
    let mut rights_storage: Vec<Vec<RawFd>> = Vec::new();
    let mut creds_storage: Vec<UnixCredentials> = Vec::new();

    for record in records {
        match record {
            GuestCmsg::Rights(fds) => {
                if fds.len() > SCM_MAX_FD {
                    return Err(AncillaryError::TooManyFds(fds.len()));
                }
                rights_storage.push(fds.clone());
            }
            GuestCmsg::Credentials { pid, uid, gid } => {
                let ucred = libc::ucred {
                    pid: *pid,
                    uid: *uid,
                    gid: *gid,
                };
                creds_storage.push(UnixCredentials::from(ucred));
            }
        }
    }

    let mut cmsgs: Vec<ControlMessage> = Vec::new();
    for fds in &rights_storage {
        cmsgs.push(ControlMessage::ScmRights(fds));
    }
    for cred in &creds_storage {
        cmsgs.push(ControlMessage::ScmCredentials(cred));
    }

    let estimated: usize = cmsgs
        .iter()
        .map(|c| match c {
            ControlMessage::ScmRights(fds) => 16 + fds.len() * 4,
            ControlMessage::ScmCredentials(_) => 32,
            _ => 0,
        })
        .sum();
    if estimated > MAX_ANCILLARY_BYTES {
        return Err(AncillaryError::TooLarge(estimated));
    }

    let flags = MsgFlags::empty();
    let sent = match addr {
        Some(a) => sendmsg(fildes, iov, &cmsgs, flags, Some(a)),
        None => sendmsg::<UnixAddr>(fildes, iov, &cmsgs, flags, None),
    }
    .map_err(HostIoError)?;
    Ok(sent)
}

/// `ReceiveAncillary`: receives one message and relays its control data
/// into `fds` (tracking newly-received `SCM_RIGHTS` descriptors the way
/// `TrackScmRightsFd` does), returning the bytes read, the decoded
/// records, and whether the guest-visible `MSG_CTRUNC` bit should be set.
///
/// `guest_buffer_cap` is how many bytes of control data the guest's own
/// `msghdr_linux.controllen` has room for; it bounds how many relayed fds
/// fit (`ReceiveScmRights`'s `relayable` computation) independently of the
/// `SCM_MAX_FD` cap.
pub fn receive_ancillary(
    fildes: RawFd,
    iov: &mut [IoSliceMut<'_>],
    fds: &mut Fds,
    guest_buffer_cap: usize,
) -> Result<(usize, Vec<GuestCmsg>, bool), AncillaryError> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; SCM_MAX_FD]);
    let msg: nix::sys::socket::RecvMsg<UnixAddr> =
        recvmsg(fildes, iov, Some(&mut cmsg_buffer), MsgFlags::empty()).map_err(HostIoError)?;

    let mut out = Vec::new();
    let mut truncated = false;
    let mut consumed = 0usize;

    for cmsg in msg.cmsgs() {
        match cmsg {
            ControlMessageOwned::ScmRights(received) => {
                let relayable = received
                    .len()
                    .min(guest_buffer_cap.saturating_sub(consumed) / 4)
                    .min(SCM_MAX_FD);
                if relayable < received.len() {
                    truncated = true;
                }
                let mut kept = Vec::with_capacity(relayable);
                for (i, fd) in received.into_iter().enumerate() {
                    if i < relayable {
                        track_scm_rights_fd(fds, fd);
                        kept.push(fd);
                    } else {
                        let _ = close(fd);
                    }
                }
                consumed += kept.len() * 4;
                out.push(GuestCmsg::Rights(kept));
            }
            ControlMessageOwned::ScmCredentials(cred) => {
                if guest_buffer_cap.saturating_sub(consumed) < 12 {
                    truncated = true;
                    continue;
                }
                consumed += 12;
                out.push(GuestCmsg::Credentials {
                    pid: cred.pid(),
                    uid: cred.uid(),
                    gid: cred.gid(),
                });
            }
            _ => truncated = true,
        }
    }

    Ok((msg.bytes, out, truncated))
}

/// `TrackScmRightsFd`: registers a freshly received descriptor with `fds`,
/// filling in its open flags and socket metadata from the host kernel.
fn track_scm_rights_fd(fds: &mut Fds, fildes: RawFd) {
    let Ok(raw_flags) = fcntl(fildes, FcntlArg::F_GETFL) else {
        return;
    };
    let oflags = OFlag::from_bits_truncate(raw_flags);
    if fds.add_fd(fildes, oflags).is_ok() {
        fds.inherit(fildes);
    }
}
