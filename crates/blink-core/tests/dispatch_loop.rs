//! Integration coverage for the `Actor` loop against a toy `OpcodeTable`:
//! straight-line execution, hot-loop JIT compilation terminating promptly
//! under an async kill, self-modifying code becoming visible after an
//! ICache invalidation, and signal delivery at a safe point.

use blink_core::halt::MachineHalt;
use blink_core::loader::load_flat;
use blink_core::traits::OpcodeTable;
use blink_core::{step, JitRuntime, Machine, System};
use blink_pagetab::Prot;
use blink_types::{CpuMode, Gva};
use blink_x86::{classify, BranchKind, DecodedInsn};
use std::sync::atomic::Ordering;

/// Executes the handful of mnemonics the tests below assemble by hand:
/// falls through everything except unconditional jumps (taken directly)
/// and `ret` (treated as the test program's exit).
struct ToyOps;

impl OpcodeTable for ToyOps {
    fn execute(&self, _system: &System, machine: &mut Machine, insn: &DecodedInsn) -> Result<(), MachineHalt> {
        match classify(insn.instruction()) {
            BranchKind::Unconditional => {
                let target = blink_x86::branch_target(insn.instruction()).unwrap();
                machine.ip = Gva::new(target as i64).unwrap();
            }
            BranchKind::Return => {
                return Err(MachineHalt::ExitThread(0));
            }
            _ => {
                let len = insn.len() as i64;
                machine.ip = machine.ip.checked_add(len).unwrap();
            }
        }
        Ok(())
    }
}

fn gva(addr: i64) -> Gva {
    Gva::new(addr).unwrap()
}

#[test]
fn interpreter_runs_nops_then_exits_on_ret() {
    let system = System::new(CpuMode::Long, 1 << 20).unwrap();
    let jit_rt = JitRuntime::with_defaults();
    let mut machine = system.new_machine(None, Some(1));
    let ops = ToyOps;

    {
        let mut pt = system.pagetab.lock().unwrap();
        // nop; nop; nop; ret
        load_flat(&mut pt, gva(0x1000), &[0x90, 0x90, 0x90, 0xC3]).unwrap();
    }
    machine.ip = gva(0x1000);

    let mut steps = 0;
    loop {
        match step(&system, &jit_rt, &mut machine, &ops) {
            Ok(()) => {
                steps += 1;
                assert!(steps < 100, "runaway loop");
            }
            Err(MachineHalt::ExitThread(code)) => {
                assert_eq!(code, 0);
                break;
            }
            Err(other) => panic!("unexpected halt: {other:?}"),
        }
    }
    assert_eq!(steps, 3);
}

#[test]
fn hot_tight_loop_gets_compiled_and_still_stops_promptly_when_killed() {
    let system = System::new(CpuMode::Long, 1 << 20).unwrap();
    let jit_rt = JitRuntime::new(4); // low threshold so the test doesn't spin long
    let mut machine = system.new_machine(None, Some(1));
    let ops = ToyOps;

    {
        let mut pt = system.pagetab.lock().unwrap();
        // eb fe: jmp $-2, an infinite tight loop back to itself.
        load_flat(&mut pt, gva(0x2000), &[0xEB, 0xFE]).unwrap();
    }
    machine.ip = gva(0x2000);

    // Run enough iterations to cross the hot threshold and get a compiled
    // path installed, confirming the JIT path is actually exercised.
    for _ in 0..10 {
        step(&system, &jit_rt, &mut machine, &ops).unwrap();
    }
    assert!(system.jit.block_count() >= 1);

    // Now simulate another thread's KillOtherThreads: the next `step` must
    // observe it within one iteration even though this is a compiled path,
    // since `run_compiled_path` is not a native tight loop (P6).
    machine.killed.store(true, Ordering::Release);
    let result = step(&system, &jit_rt, &mut machine, &ops);
    assert!(matches!(result, Err(MachineHalt::Halt)));
}

#[test]
fn self_modifying_write_is_observed_after_icache_invalidation() {
    let system = System::new(CpuMode::Long, 1 << 20).unwrap();
    let jit_rt = JitRuntime::with_defaults();
    let mut machine = system.new_machine(None, Some(1));
    let ops = ToyOps;

    {
        let mut pt = system.pagetab.lock().unwrap();
        pt.reserve_virtual(gva(0x3000), 4096, Prot::RW).unwrap();
        blink_memory::store(&mut pt, gva(0x3000), &[0x90, 0xC3]).unwrap(); // nop; ret
    }
    machine.ip = gva(0x3000);
    step(&system, &jit_rt, &mut machine, &ops).unwrap(); // executes + caches the nop

    // Another thread patches the nop into a ret and announces the change.
    {
        let mut pt = system.pagetab.lock().unwrap();
        blink_memory::store(&mut pt, gva(0x3000), &[0xC3]).unwrap();
    }
    system.invalidate_system(&[&machine], true, true);
    machine.ip = gva(0x3000);

    let result = step(&system, &jit_rt, &mut machine, &ops);
    assert!(matches!(result, Err(MachineHalt::ExitThread(0))));
}

#[test]
fn fatal_default_signal_unwinds_the_thread_at_the_next_safe_point() {
    let system = System::new(CpuMode::Long, 1 << 20).unwrap();
    let jit_rt = JitRuntime::with_defaults();
    let mut machine = system.new_machine(None, Some(1));
    let ops = ToyOps;

    {
        let mut pt = system.pagetab.lock().unwrap();
        load_flat(&mut pt, gva(0x4000), &[0x90, 0x90]).unwrap();
    }
    machine.ip = gva(0x4000);
    machine.signals.raise(blink_core::signals::SIGTERM_LINUX, None);

    let result = step(&system, &jit_rt, &mut machine, &ops);
    assert!(matches!(
        result,
        Err(MachineHalt::Signaled(sig)) if sig == blink_core::signals::SIGTERM_LINUX
    ));
}

#[test]
fn handler_disposition_redirects_ip_instead_of_terminating() {
    let system = System::new(CpuMode::Long, 1 << 20).unwrap();
    let jit_rt = JitRuntime::with_defaults();
    let mut machine = system.new_machine(None, Some(1));
    let ops = ToyOps;

    {
        let mut pt = system.pagetab.lock().unwrap();
        load_flat(&mut pt, gva(0x5000), &[0x90]).unwrap();
        load_flat(&mut pt, gva(0x6000), &[0xC3]).unwrap();
    }
    machine.ip = gva(0x5000);
    machine.signals.set_disposition(
        blink_core::signals::SIGUSR1_LINUX,
        blink_core::signals::Disposition::Handler { addr: 0x6000, restart: false },
    );
    machine.signals.raise(blink_core::signals::SIGUSR1_LINUX, None);

    let result = step(&system, &jit_rt, &mut machine, &ops);
    assert!(matches!(result, Err(MachineHalt::ExitThread(0))));
}
