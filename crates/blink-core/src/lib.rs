//! The emulator core: guest address space, the fetch/decode/dispatch loop,
//! and the state a `System`/`Machine` pair carries between instructions.
//!
//! This crate wires together the lower-level crates (`blink-pagetab`,
//! `blink-memory`, `blink-x86`, `blink-jit`, ...) into the `Actor` loop of
//! §4.4 and externalizes the two pieces spec.md puts out of scope —
//! opcode semantics and syscall translation — as the [`traits::OpcodeTable`]
//! and [`traits::SyscallDispatcher`] traits.

pub mod abi;
pub mod dispatcher;
pub mod halt;
pub mod loader;
pub mod machine;
pub mod opcache;
pub mod signals;
pub mod system;
pub mod tier;
pub mod tlb;
pub mod traits;

pub use dispatcher::step;
pub use halt::MachineHalt;
pub use machine::Machine;
pub use system::System;
pub use tier::JitRuntime;
pub use traits::{OpcodeTable, SyscallDispatcher};
