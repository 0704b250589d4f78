//! Bridges `blink_jit`'s portable `Stub` sequences to something the
//! dispatcher can actually execute.
//!
//! `blink-jit` deliberately doesn't emit raw machine code — its `Stub::Op`
//! slot is "a call to a pre-compiled micro-op", addressed by an opaque
//! index the way the source's function-pointer table would be. This
//! crate's [`OpcodeTable`](crate::traits::OpcodeTable) is decode-based
//! (it executes a `DecodedInsn`, not an indexed micro-op), so compiling a
//! path here means recording, alongside each `Stub::Op` slot, the guest
//! address it was compiled from; running the path means walking that
//! side-table back through the ordinary ICache-aware fetch the interpreter
//! already uses. The performance property the component provides — the
//! dispatcher skips the hook-table lookup and fresh decode on every
//! instruction of a hot path — is what's captured; the side-table replaces
//! "jump into native code" with "the path is already known, walk it
//! directly".

use blink_types::Gva;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default number of times a guest address must be reached before it's
/// considered worth compiling. No source constant for this was present in
/// the retrieved pack; 32 is a conservative middle ground between "compile
/// everything" (pure overhead on cold code) and "never compile" (no JIT
/// benefit at all).
pub const DEFAULT_HOT_THRESHOLD: u32 = 32;

/// Upper bound on how many instructions one compiled path covers.
pub const MAX_PATH_LEN: usize = 64;

pub struct JitRuntime {
    hot_threshold: u32,
    visits: Mutex<HashMap<u64, u32>>,
    paths: Mutex<HashMap<u32, Vec<Gva>>>,
}

impl JitRuntime {
    pub fn new(hot_threshold: u32) -> Self {
        JitRuntime {
            hot_threshold,
            visits: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        JitRuntime::new(DEFAULT_HOT_THRESHOLD)
    }

    /// Bumps `virt`'s visit counter. Returns `true` exactly once, the first
    /// time the counter crosses the hot threshold, signalling the caller
    /// should attempt to compile a path starting there.
    pub fn note_visit(&self, virt: u64) -> bool {
        let mut visits = self.visits.lock().unwrap();
        let count = visits.entry(virt).or_insert(0);
        *count += 1;
        *count == self.hot_threshold
    }

    pub fn record_path(&self, block_id: u32, gvas: Vec<Gva>) {
        self.paths.lock().unwrap().insert(block_id, gvas);
    }

    pub fn path_for(&self, block_id: u32) -> Option<Vec<Gva>> {
        self.paths.lock().unwrap().get(&block_id).cloned()
    }

    /// Drops every recorded path whose first instruction lies on `page`,
    /// called alongside `Jit::reset_jit_page` so the side-table doesn't
    /// outlive the hooks it backs.
    pub fn forget_page(&self, page: u64, page_size: u64) {
        self.paths
            .lock()
            .unwrap()
            .retain(|_, gvas| gvas.first().map(|g| (g.raw() as u64) & !(page_size - 1) != page).unwrap_or(true));
    }
}

impl Default for JitRuntime {
    fn default() -> Self {
        JitRuntime::with_defaults()
    }
}
