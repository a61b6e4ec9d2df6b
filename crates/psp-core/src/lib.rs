//! Allegrex CPU core: dynamic binary translation, translated-code cache,
//! execution loop, and the HLE syscall bridge.
//!
//! The outer shell constructs a [`Psp`], registers syscalls against its HLE
//! directory, loads a game with [`Psp::setup_game`], and drives
//! [`Psp::execute_block`] from a dedicated CPU thread. Peripheral models and
//! individual service implementations live outside this crate.

pub mod cpu;
pub mod hle;
pub mod input;
pub mod jit;
pub mod mem;
pub mod psp;
#[cfg(feature = "trace")]
pub mod trace;

pub use psp::{CoreError, GameInfo, Psp, RunState, StopHandle};
