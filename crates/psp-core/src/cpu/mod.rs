pub mod cop0;
pub mod exceptions;
pub mod fpu;
pub mod instruction;
mod interp;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub use psp_dynarec::CpuContext;

use crate::cpu::cop0::Cop0;
use crate::cpu::exceptions::ExceptionCode;

/// A guest fault recorded by a helper while compiled code was running.
/// Delivered by the engine once the block has exited (imprecise, as the
/// architecture permits for bus errors).
#[derive(Debug, Clone, Copy)]
pub struct PendingTrap {
    pub code: ExceptionCode,
    pub epc: u32,
    pub bad_vaddr: Option<u32>,
}

/// The Allegrex CPU: the aligned register record compiled code addresses
/// directly, plus the coprocessor-0 state and interpreter bookkeeping.
pub struct Allegrex {
    /// Live register file. Allocated once; every other component holds a
    /// non-owning reference for the CPU's lifetime.
    pub ctx: CpuContext,
    pub cop0: Cop0,
    /// True when the next instruction to execute sits in a branch delay slot.
    pub in_delay_slot: bool,
    /// Fault parked by a JIT helper, delivered at the next block boundary.
    pub pending_trap: Option<PendingTrap>,
    /// Break-request word. Shared with `StopHandle`s on other threads;
    /// compiled code polls it at every block entry.
    pub break_flag: Arc<AtomicU32>,
    /// Ring buffer of recent PCs for crash diagnosis.
    pub pc_history: [u32; 64],
    pub pc_history_idx: usize,
    pub step_count: u64,
}

/// A saved thread context, produced and consumed by the scheduler hook.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    pub fpr: [u32; 32],
    pub fcr31: u32,
}

impl Allegrex {
    pub fn new() -> Self {
        Self {
            ctx: CpuContext::new(),
            cop0: Cop0::new(),
            in_delay_slot: false,
            pending_trap: None,
            break_flag: Arc::new(AtomicU32::new(0)),
            pc_history: [0; 64],
            pc_history_idx: 0,
            step_count: 0,
        }
    }

    pub fn break_requested(&self) -> bool {
        self.break_flag.load(Ordering::Acquire) != 0
    }

    pub fn clear_break(&self) {
        self.break_flag.store(0, Ordering::Release);
    }

    /// Record an exception in COP0 and redirect execution to the handler.
    pub fn deliver_exception(
        &mut self,
        code: ExceptionCode,
        epc: u32,
        in_delay_slot: bool,
        bad_vaddr: Option<u32>,
    ) {
        let vector = self.cop0.raise(code, epc, in_delay_slot, bad_vaddr);
        self.ctx.pc = vector;
        self.ctx.next_pc = vector.wrapping_add(4);
        self.in_delay_slot = false;
    }

    /// Capture the architectural state of the running thread.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            gpr: self.ctx.gpr,
            hi: self.ctx.hi,
            lo: self.ctx.lo,
            pc: self.ctx.pc,
            fpr: self.ctx.fpr,
            fcr31: self.ctx.fcr31,
        }
    }

    /// Install a saved thread context. Only legal between blocks; the loop
    /// re-reads the context after every dispatcher return, so the swap takes
    /// effect at the next dispatch.
    pub fn restore(&mut self, snapshot: &ContextSnapshot) {
        self.ctx.gpr = snapshot.gpr;
        self.ctx.gpr[0] = 0;
        self.ctx.hi = snapshot.hi;
        self.ctx.lo = snapshot.lo;
        self.ctx.pc = snapshot.pc;
        self.ctx.next_pc = snapshot.pc.wrapping_add(4);
        self.ctx.fpr = snapshot.fpr;
        self.ctx.fcr31 = snapshot.fcr31;
        self.in_delay_slot = false;
    }
}

impl Default for Allegrex {
    fn default() -> Self {
        Self::new()
    }
}
