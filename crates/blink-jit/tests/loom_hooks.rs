//! Model-checks that a reader of the hook table never observes a torn
//! write: it either sees the old value or the new one, never a mix, even
//! though the generation-counter retry loop isn't backed by real atomics on
//! the table storage itself. Runs only under `--cfg loom`.

#![cfg(loom)]

use blink_jit::Jit;
use loom::thread;

#[test]
fn concurrent_set_and_get_never_observe_a_torn_value() {
    loom::model(|| {
        let jit = std::sync::Arc::new(Jit::with_defaults());

        let writer = {
            let jit = jit.clone();
            thread::spawn(move || {
                let block = jit.start_jit(0x1000).unwrap();
                jit.finish_jit(block);
            })
        };

        let reader = {
            let jit = jit.clone();
            thread::spawn(move || {
                let value = jit.hooks().get(0x1000);
                assert!(value.is_none() || value == Some(0));
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    });
}
