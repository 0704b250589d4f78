//! Model-checks the stripe spinlock's mutual exclusion under loom's
//! exhaustive interleaving exploration. Runs only under `--cfg loom`; loom
//! itself caps the thread/interleaving count so this stays fast enough for
//! CI.

#![cfg(loom)]

use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

#[test]
fn stripe_lock_excludes_concurrent_critical_sections() {
    loom::model(|| {
        let lock = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    while lock
                        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        thread::yield_now();
                    }
                    let before = counter.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(before, 0, "two threads observed the stripe held concurrently");
                    counter.fetch_sub(1, Ordering::Relaxed);
                    lock.store(false, Ordering::Release);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    });
}
