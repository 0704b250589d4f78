//! Guest signal delivery, modelled as a per-machine queue drained at safe
//! points rather than the source's coroutine-like host-signal-handler
//! delivery (REDESIGN FLAGS §9: "no host-signal handler may touch machine
//! state other than atomic flags and the bounded signal-pending bitmap").

use std::collections::VecDeque;

/// Linux guest signal numbers actually referenced by this core (§6).
pub const SIGHUP_LINUX: u32 = 1;
pub const SIGINT_LINUX: u32 = 2;
pub const SIGILL_LINUX: u32 = 4;
pub const SIGTRAP_LINUX: u32 = 5;
pub const SIGABRT_LINUX: u32 = 6;
pub const SIGBUS_LINUX: u32 = 7;
pub const SIGFPE_LINUX: u32 = 8;
pub const SIGKILL_LINUX: u32 = 9;
pub const SIGUSR1_LINUX: u32 = 10;
pub const SIGSEGV_LINUX: u32 = 11;
pub const SIGUSR2_LINUX: u32 = 12;
pub const SIGPIPE_LINUX: u32 = 13;
pub const SIGALRM_LINUX: u32 = 14;
pub const SIGTERM_LINUX: u32 = 15;
pub const SIGCHLD_LINUX: u32 = 17;
pub const SIGCONT_LINUX: u32 = 18;
pub const SIGSTOP_LINUX: u32 = 19;
pub const SIGSYS_LINUX: u32 = 31;

/// Bitmask of signals Blink always delivers synchronously, regardless of
/// the guest's `sigaction`: `System::blinksigs` in the data model.
pub const BLINK_SYNC_SIGNALS: u64 = (1 << SIGSEGV_LINUX)
    | (1 << SIGILL_LINUX)
    | (1 << SIGFPE_LINUX)
    | (1 << SIGSYS_LINUX)
    | (1 << SIGTRAP_LINUX);

/// A guest thread's disposition for one signal number, the Rust analogue of
/// `struct sigaction_linux` reduced to what the dispatch loop needs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Disposition {
    #[default]
    Default,
    Ignore,
    /// Guest handler address. `restart` mirrors `SA_RESTART`: whether a
    /// host call interrupted by this signal should be retried rather than
    /// report `EINTR` to the guest.
    Handler { addr: u64, restart: bool },
}

/// One queued delivery: the signal number plus enough siginfo to populate
/// `siginfo_linux` when the handler runs (`si_addr` for fault signals).
#[derive(Debug, Clone, Copy)]
pub struct PendingSignal {
    pub signo: u32,
    pub si_addr: Option<u64>,
}

/// Per-machine signal state: the guest's blocked-signal mask and the queue
/// of deliveries waiting for the next safe point.
#[derive(Debug, Default)]
pub struct SignalState {
    pub mask: u64,
    pub dispositions: [Disposition; 64],
    queue: VecDeque<PendingSignal>,
}

impl SignalState {
    pub fn new() -> Self {
        SignalState::default()
    }

    /// Enqueues `signo` for delivery at the next safe point, unless it is
    /// currently blocked by `mask` (SIGKILL/SIGSTOP are never blockable,
    /// matching the kernel).
    pub fn raise(&mut self, signo: u32, si_addr: Option<u64>) {
        if signo != SIGKILL_LINUX && signo != SIGSTOP_LINUX && (self.mask >> signo) & 1 != 0 {
            tracing::trace!(signo, "signal raised while blocked, queued anyway");
        }
        self.queue.push_back(PendingSignal { signo, si_addr });
    }

    /// `true` if a signal is queued and not blocked — the dispatcher's
    /// safe-point check (c) in §5.
    pub fn has_deliverable(&self) -> bool {
        self.queue
            .iter()
            .any(|p| p.signo == SIGKILL_LINUX || (self.mask >> p.signo) & 1 == 0)
    }

    /// Pops the next deliverable signal, leaving still-blocked ones queued.
    pub fn next_deliverable(&mut self) -> Option<PendingSignal> {
        let idx = self
            .queue
            .iter()
            .position(|p| p.signo == SIGKILL_LINUX || (self.mask >> p.signo) & 1 == 0)?;
        self.queue.remove(idx)
    }

    pub fn disposition(&self, signo: u32) -> Disposition {
        self.dispositions
            .get(signo as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_disposition(&mut self, signo: u32, disp: Disposition) {
        if let Some(slot) = self.dispositions.get_mut(signo as usize) {
            *slot = disp;
        }
    }

    /// `true` if the guest's default action for `signo` is to terminate the
    /// process (used to decide whether a fatal signal with default
    /// disposition must re-raise the translated host signal per §6).
    pub fn is_fatal_by_default(signo: u32) -> bool {
        !matches!(signo, SIGCHLD_LINUX | SIGCONT_LINUX)
    }
}

/// Outcome of a blocking host call that may be interrupted by a signal,
/// per §5 "Suspension" and P7.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InterruptOutcome {
    /// Retry the host call: the interrupting signal's disposition carries
    /// `SA_RESTART`-equivalent semantics and the fd's `norestart` is false.
    Restart,
    /// Report `-EINTR` to the guest.
    ReportEintr,
}

/// `CheckInterrupt`: given the signal that just broke a blocking host call
/// and whether the target fd opted out of restart, decides whether to
/// retry or surface `EINTR`.
pub fn check_interrupt(disposition: Disposition, fd_norestart: bool) -> InterruptOutcome {
    match disposition {
        Disposition::Handler { restart: true, .. } if !fd_norestart => InterruptOutcome::Restart,
        _ => InterruptOutcome::ReportEintr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_signal_is_not_deliverable_until_unblocked() {
        let mut s = SignalState::new();
        s.mask = 1 << SIGUSR1_LINUX;
        s.raise(SIGUSR1_LINUX, None);
        assert!(!s.has_deliverable());
        s.mask = 0;
        assert!(s.has_deliverable());
        let p = s.next_deliverable().unwrap();
        assert_eq!(p.signo, SIGUSR1_LINUX);
    }

    #[test]
    fn sigkill_is_always_deliverable() {
        let mut s = SignalState::new();
        s.mask = u64::MAX;
        s.raise(SIGKILL_LINUX, None);
        assert!(s.has_deliverable());
    }

    #[test]
    fn restart_requires_both_sa_restart_and_fd_allows_it() {
        let handler = Disposition::Handler { addr: 0x1000, restart: true };
        assert_eq!(check_interrupt(handler, false), InterruptOutcome::Restart);
        assert_eq!(check_interrupt(handler, true), InterruptOutcome::ReportEintr);
        assert_eq!(check_interrupt(Disposition::Default, false), InterruptOutcome::ReportEintr);
    }
}
