//! The fetch/decode/execute loop (`Actor`, §4.4) plus the compile-and-run
//! path that bridges into [`crate::tier`].

use crate::halt::MachineHalt;
use crate::machine::Machine;
use crate::signals::{Disposition, SignalState, SIGSEGV_LINUX};
use crate::system::System;
use crate::tier::{JitRuntime, MAX_PATH_LEN};
use crate::traits::OpcodeTable;
use blink_decoder::DecodeMode;
use blink_pagetab::{PAGE_U, PAGE_XD};
use blink_types::{CpuMode, Gva};
use blink_x86::{self, BranchKind, DecodedInsn};

fn decode_mode(mode: CpuMode) -> DecodeMode {
    match mode {
        CpuMode::Real => DecodeMode::Bits16,
        CpuMode::Legacy => DecodeMode::Bits32,
        CpuMode::Long => DecodeMode::Bits64,
    }
}

/// `LoadInstruction(m, m.ip)`: fetches and decodes the instruction at
/// `machine.ip`, consulting the ICache on the common (non-page-straddling)
/// path and falling back to a temporary cross-page buffer otherwise.
fn load_instruction(system: &System, machine: &mut Machine) -> Result<DecodedInsn, MachineHalt> {
    let ip = machine.ip;
    let mode = decode_mode(system.mode);
    let mut pt = system.pagetab.lock().unwrap();

    if ip.fits_in_one_page(blink_decoder::MAX_INSTRUCTION_LEN as u64) {
        let page = ip.page_base();
        let entry = pt
            .resolve(page, PAGE_U)
            .map_err(|_| MachineHalt::SegFault { addr: ip, protection: false })?;
        if entry.raw() & PAGE_XD != 0 {
            return Err(MachineHalt::ProtectionFault { ip });
        }
        let frame = entry.table_address();
        let offset = ip.page_offset() as usize;
        let bytes = pt.frame_bytes(frame);
        let window = &bytes[offset..];

        if machine.opcache.page_matches(page.raw() as u64, frame) {
            if let Some(cached) = machine.opcache.lookup(ip.raw() as u64, window) {
                system.perf.bump_icache_hits();
                return Ok(cached.clone());
            }
        }
        system.perf.bump_icache_misses();
        let insn = blink_x86::decode(window, ip.raw() as u64, mode)
            .map_err(|_| MachineHalt::DecodeError { ip })?;
        let len = insn.len();
        machine.opcache.remember_page(page.raw() as u64, frame);
        machine.opcache.insert(ip.raw() as u64, &window[..len], insn.clone());
        Ok(insn)
    } else {
        // Straddles a page boundary: copy up to MAX_INSTRUCTION_LEN bytes
        // across pages into a scratch buffer and decode from there, per §4.4
        // (this path also covers decoding past a file mapping's EOF page).
        let mut buf = Vec::with_capacity(blink_decoder::MAX_INSTRUCTION_LEN);
        let mut cursor = ip;
        for _ in 0..blink_decoder::MAX_INSTRUCTION_LEN {
            let page = cursor.page_base();
            let entry = match pt.resolve(page, PAGE_U) {
                Ok(e) => e,
                Err(_) => break,
            };
            if entry.raw() & PAGE_XD != 0 {
                break;
            }
            let frame = entry.table_address();
            let bytes = pt.frame_bytes(frame);
            buf.push(bytes[cursor.page_offset() as usize]);
            cursor = match cursor.checked_add(1) {
                Ok(c) => c,
                Err(_) => break,
            };
        }
        if buf.is_empty() {
            return Err(MachineHalt::SegFault { addr: ip, protection: false });
        }
        system.perf.bump_icache_misses();
        blink_x86::decode(&buf, ip.raw() as u64, mode).map_err(|_| MachineHalt::DecodeError { ip })
    }
}

/// Executes exactly one guest instruction through the interpreter path
/// (fetch, decode, dispatch to the opcode table). Does not touch safe
/// points; the caller (`step`) handles those.
fn step_interpreted<O: OpcodeTable>(
    system: &System,
    machine: &mut Machine,
    ops: &O,
) -> Result<(), MachineHalt> {
    let insn = load_instruction(system, machine)?;
    system.perf.bump_instructions_retired();
    let result = ops.execute(system, machine, &insn);
    if let Err(MachineHalt::SegFault { addr, .. }) = result {
        machine.signals.raise(SIGSEGV_LINUX, Some(addr.raw() as u64));
    }
    result
}

/// Attempts to compile a straight-line path starting at `machine.ip`: walks
/// forward decoding (not executing) instructions, stopping at the first
/// branch/call/return/abnormal instruction or after `MAX_PATH_LEN`
/// instructions, whichever comes first. On success, installs the hook and
/// records the guest-address side-table in `jit_rt` (§4.7's `StartJit` /
/// `FinishJit`, adapted per [`crate::tier`]).
fn compile_hot_path(system: &System, jit_rt: &JitRuntime, machine: &mut Machine, start: Gva) {
    let mode = decode_mode(system.mode);
    let mut block = match system.jit.start_jit(start.raw() as u64) {
        Ok(b) => b,
        Err(_) => return,
    };
    machine.compiling = true;

    let mut gvas = Vec::new();
    let mut cursor = start;
    let mut tail_target: Option<u64> = None;
    {
        let mut pt = system.pagetab.lock().unwrap();
        for _ in 0..MAX_PATH_LEN {
            let page = cursor.page_base();
            let entry = match pt.resolve(page, PAGE_U) {
                Ok(e) if e.raw() & PAGE_XD == 0 => e,
                _ => break,
            };
            let frame = entry.table_address();
            let offset = cursor.page_offset() as usize;
            let bytes = pt.frame_bytes(frame);
            if !cursor.fits_in_one_page(blink_decoder::MAX_INSTRUCTION_LEN as u64) {
                break;
            }
            let window = &bytes[offset..];
            let insn = match blink_x86::decode(window, cursor.raw() as u64, mode) {
                Ok(i) => i,
                Err(_) => break,
            };
            let kind = blink_x86::classify(insn.instruction());
            block.append_op(gvas.len() as u32);
            gvas.push(cursor);
            let len = insn.len();
            match kind {
                BranchKind::Straight => {
                    cursor = match cursor.checked_add(len as i64) {
                        Ok(c) => c,
                        Err(_) => break,
                    };
                }
                BranchKind::Unconditional => {
                    if let Some(target) = blink_x86::branch_target(insn.instruction()) {
                        tail_target = Some(target);
                    }
                    break;
                }
                // Conditional/Call/Return/Abnormal all terminate the path;
                // the interpreter always takes over from there.
                _ => break,
            }
        }
    }

    if gvas.is_empty() {
        system.jit.abandon_jit(block);
        machine.compiling = false;
        return;
    }
    if let Some(target) = tail_target {
        block.append_jump(target);
        let stub_index = block.len() - 1;
        system.jit.record_jit_jump(block.id, cursor.raw() as u64, stub_index, target);
    }
    let id = system.jit.finish_jit(block);
    jit_rt.record_path(id, gvas);
    system.perf.bump_jit_blocks_compiled();
    machine.compiling = false;
}

/// Walks an already-compiled path, one guest instruction at a time, via the
/// same ICache-aware fetch the interpreter uses. Still checks safe points
/// between every instruction (P6): a compiled path is not a native
/// tight loop, so an async `killed`/signal is observed within one
/// instruction of being set, never spinning unboundedly.
fn run_compiled_path<O: OpcodeTable>(
    system: &System,
    machine: &mut Machine,
    ops: &O,
    gvas: &[Gva],
) -> Result<(), MachineHalt> {
    for &gva in gvas {
        if machine.observe_invalidation() | machine.observe_icache_invalidation() {
            // The path's premise (this page is still mapped+unchanged) may
            // no longer hold; fall back to the interpreter for this step.
            machine.ip = gva;
            return step_interpreted(system, machine, ops);
        }
        if machine.is_killed() {
            return Err(MachineHalt::Halt);
        }
        if machine.signals.has_deliverable() {
            machine.ip = gva;
            deliver_pending_signal(machine)?;
            return step_interpreted(system, machine, ops);
        }
        machine.ip = gva;
        step_interpreted(system, machine, ops)?;
    }
    Ok(())
}

/// Safe-point check (d): pops one deliverable signal and acts on its
/// disposition. `Ignore`/non-fatal-`Default` are dropped silently;
/// `Handler` redirects `ip` to the guest handler (this core does not build
/// a sigreturn frame or honor altstacks — that belongs to the syscall/ABI
/// layer this crate externalizes); fatal-`Default` unwinds the thread.
fn deliver_pending_signal(machine: &mut Machine) -> Result<(), MachineHalt> {
    let Some(pending) = machine.signals.next_deliverable() else {
        return Ok(());
    };
    match machine.signals.disposition(pending.signo) {
        Disposition::Ignore => Ok(()),
        Disposition::Handler { addr, .. } => {
            machine.oldip = machine.ip;
            machine.ip = blink_types::Gva::new_unchecked(addr as i64);
            Ok(())
        }
        Disposition::Default => {
            if SignalState::is_fatal_by_default(pending.signo) {
                Err(MachineHalt::Signaled(pending.signo))
            } else {
                Ok(())
            }
        }
    }
}

/// One iteration of `Actor`: the full safe-point-checked instruction step.
/// Returns `Ok(())` having executed exactly one guest instruction (or, when
/// running a compiled path, the whole straight-line run), or the
/// `MachineHalt` that stopped the machine.
pub fn step<O: OpcodeTable>(
    system: &System,
    jit_rt: &JitRuntime,
    machine: &mut Machine,
    ops: &O,
) -> Result<(), MachineHalt> {
    machine.observe_invalidation();
    machine.observe_icache_invalidation();
    if machine.is_killed() {
        return Err(MachineHalt::Halt);
    }
    deliver_pending_signal(machine)?;

    let ip_raw = machine.ip.raw() as u64;
    let result = if let Some(stub_id) = system.jit.hooks().get(ip_raw) {
        match jit_rt.path_for(stub_id) {
            Some(gvas) => run_compiled_path(system, machine, ops, &gvas),
            // Staging hook: another thread is still compiling this address.
            None => step_interpreted(system, machine, ops),
        }
    } else {
        let start_ip = machine.ip;
        let outcome = step_interpreted(system, machine, ops);
        if outcome.is_ok() && !machine.compiling && jit_rt.note_visit(ip_raw) {
            compile_hot_path(system, jit_rt, machine, start_ip);
        }
        outcome
    };

    machine.collect_garbage();
    system.sync_memstat();
    result
}
