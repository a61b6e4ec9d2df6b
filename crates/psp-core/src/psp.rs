//! The top-level CPU component: owns the context, memory map, syscall table,
//! user exports, input latch, and execution engine, and exposes the API the
//! outer shell drives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cpu::{Allegrex, ContextSnapshot};
use crate::hle::{ExportModule, ServiceDirectory, SyscallTable, UserExports};
use crate::input::CtrlState;
use crate::jit::Engine;
use crate::mem::{mask_address, MemoryError, MemoryMap, RAM_BASE, RAM_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Executable arena exhausted or other unrecoverable backend failure.
    #[error("code cache exhausted: {0}")]
    CacheExhausted(String),
    #[error("setup rejected: {0}")]
    Setup(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Execution loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Breaking,
    Stopped,
}

/// Break-flag bit reported by `execute_block`.
pub const BREAK_REQUESTED: u32 = 1;

/// What the outer shell needs to know about the loaded image.
#[derive(Debug, Clone)]
pub struct GameInfo {
    pub title: String,
    pub entry_point: u32,
}

/// Cross-thread stop handle. `stop` is idempotent and safe from any thread;
/// compiled code observes the flag at its next block entry.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicU32>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(1, Ordering::Release);
    }
}

/// Cumulative counters surfaced by `print_statistics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStats {
    pub instructions_executed: u64,
    pub blocks_dispatched: u64,
    pub syscalls_invoked: u64,
    pub cycle_count: u64,
}

/// Statistics dump table: explicit descriptors instead of field reflection.
const STAT_READERS: &[(&str, fn(&CoreStats) -> u64)] = &[
    ("instructions_executed", |s| s.instructions_executed),
    ("blocks_dispatched", |s| s.blocks_dispatched),
    ("syscalls_invoked", |s| s.syscalls_invoked),
    ("cycle_count", |s| s.cycle_count),
];

/// The CPU component as the outer shell sees it.
pub struct Psp {
    pub cpu: Allegrex,
    pub mem: MemoryMap,
    pub syscalls: SyscallTable,
    pub exports: UserExports,
    pub input: Arc<CtrlState>,
    engine: Engine,
    directory: Box<dyn ServiceDirectory>,
    state: RunState,
    contexts: Vec<Option<ContextSnapshot>>,
    current_tcs: i32,
    stats: CoreStats,
    has_executed: bool,
    #[cfg(feature = "trace")]
    tracer: Option<crate::trace::Tracer>,
}

impl Psp {
    pub fn new(directory: Box<dyn ServiceDirectory>) -> Self {
        Self {
            cpu: Allegrex::new(),
            mem: MemoryMap::new(),
            syscalls: SyscallTable::new(),
            exports: UserExports::new(),
            input: Arc::new(CtrlState::new()),
            engine: Engine::from_env(),
            directory,
            state: RunState::Idle,
            contexts: Vec::new(),
            current_tcs: -1,
            stats: CoreStats::default(),
            has_executed: false,
            #[cfg(feature = "trace")]
            tracer: crate::trace::Tracer::from_env(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    // Syscalls / exports.

    /// Resolve `nid` against the HLE directory and reserve the next SID.
    /// Returns -1 when the directory does not know the NID.
    pub fn register_syscall(&mut self, nid: u32) -> i32 {
        self.syscalls.register(nid, self.directory.as_ref())
    }

    pub fn register_user_exports(&mut self, module: &ExportModule) {
        self.exports.register_module(module);
    }

    pub fn lookup_user_export(&self, nid: u32) -> u32 {
        self.exports.lookup(nid)
    }

    // Setup and teardown.

    /// Load the boot image and point the CPU at the entry. Must precede the
    /// first `execute_block`.
    pub fn setup_game(&mut self, game: &GameInfo, boot_stream: &[u8]) -> Result<(), CoreError> {
        if self.has_executed {
            return Err(CoreError::Setup("game already set up".into()));
        }
        let entry = mask_address(game.entry_point);
        self.mem
            .load_image(entry, boot_stream)
            .map_err(|_| CoreError::Setup(format!("image does not fit at {:#010X}", entry)))?;

        self.cpu.ctx.pc = game.entry_point;
        self.cpu.ctx.next_pc = game.entry_point.wrapping_add(4);
        // Stack at the top of user RAM, with a scratch margin.
        self.cpu.ctx.gpr[29] = RAM_BASE + RAM_SIZE - 0x100;
        log::info!(
            "setup_game: \"{}\" entry={:#010X} image={} bytes engine={}",
            game.title,
            game.entry_point,
            boot_stream.len(),
            self.engine.name()
        );
        self.state = RunState::Idle;
        Ok(())
    }

    /// Release guest memory and compiled code at teardown.
    pub fn cleanup(&mut self) {
        self.engine.flush();
        self.mem.clear();
        self.contexts.clear();
        self.current_tcs = -1;
        self.state = RunState::Stopped;
    }

    // Execution.

    /// Dispatch one block chain (or one interpreter step when cold).
    /// Returns the break flags; nonzero means the loop should return control
    /// to the caller.
    pub fn execute_block(&mut self) -> Result<u32, CoreError> {
        self.state = RunState::Running;
        self.has_executed = true;

        #[cfg(feature = "trace")]
        if let Some(tracer) = self.tracer.as_mut() {
            let pc = self.cpu.ctx.pc;
            let word = self.mem.read_u32(mask_address(pc)).unwrap_or(0);
            tracer.record(pc, word);
        }

        let retired = self
            .engine
            .execute(&mut self.cpu, &mut self.mem, &mut self.syscalls);
        self.stats.instructions_executed = self.stats.instructions_executed.wrapping_add(retired);
        self.stats.blocks_dispatched += 1;
        self.stats.cycle_count = self.cpu.ctx.cycle_count;

        // Stores that touched code pages invalidate before the next fetch.
        for (start, len) in self.mem.take_code_invalidations() {
            self.engine.invalidate_range(start, len);
        }

        if let Some(message) = self.engine.take_fatal() {
            self.state = RunState::Stopped;
            return Err(CoreError::CacheExhausted(message));
        }

        if self.cpu.break_requested() {
            self.state = RunState::Breaking;
            return Ok(BREAK_REQUESTED);
        }
        Ok(0)
    }

    /// Request a cooperative stop. Safe from any thread via `stop_handle`.
    pub fn stop(&mut self) {
        self.cpu.break_flag.store(1, Ordering::Release);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { flag: Arc::clone(&self.cpu.break_flag) }
    }

    /// Clear a pending break and resume dispatching.
    pub fn resume(&mut self) {
        self.cpu.clear_break();
        if self.state == RunState::Breaking {
            self.state = RunState::Running;
        }
    }

    // Scheduler hook: thread context storage.

    /// Allocate storage for a guest thread context. Returns its TCS id.
    pub fn allocate_context_storage(&mut self, pc: u32, registers: &[u32; 32]) -> i32 {
        let mut snapshot = ContextSnapshot {
            gpr: *registers,
            hi: 0,
            lo: 0,
            pc,
            fpr: [0; 32],
            fcr31: 0,
        };
        snapshot.gpr[0] = 0;
        if let Some(slot) = self.contexts.iter().position(|slot| slot.is_none()) {
            self.contexts[slot] = Some(snapshot);
            return slot as i32;
        }
        self.contexts.push(Some(snapshot));
        (self.contexts.len() - 1) as i32
    }

    pub fn release_context_storage(&mut self, tcs_id: i32) {
        if let Some(slot) = self.contexts.get_mut(tcs_id as usize) {
            *slot = None;
        }
        if self.current_tcs == tcs_id {
            self.current_tcs = -1;
        }
    }

    /// Switch the active guest thread. Legal only between blocks: the loop
    /// re-reads the context after every dispatcher return, so the swap takes
    /// effect at the next dispatch. The outgoing state is saved back into
    /// the previously active storage.
    pub fn switch_context(&mut self, new_tcs_id: i32) {
        if self.current_tcs >= 0 {
            let snapshot = self.cpu.snapshot();
            if let Some(slot) = self.contexts.get_mut(self.current_tcs as usize) {
                *slot = Some(snapshot);
            }
        }
        if let Some(Some(snapshot)) = self.contexts.get(new_tcs_id as usize) {
            let snapshot = snapshot.clone();
            self.cpu.restore(&snapshot);
            self.current_tcs = new_tcs_id;
        } else {
            log::warn!("switch_context to unknown TCS {}", new_tcs_id);
        }
    }

    // Statistics.

    pub fn stats(&self) -> CoreStats {
        self.stats
    }

    pub fn print_statistics(&self) {
        let mut stats = self.stats;
        stats.syscalls_invoked = self
            .syscalls
            .stats()
            .map(|(_, _, count)| count)
            .sum();

        log::info!("CPU statistics ({} engine):", self.engine.name());
        for (name, reader) in STAT_READERS {
            log::info!("  {:26} {}", name, reader(&stats));
        }
        if let Some(line) = self.engine.stats_line() {
            log::info!("  dynarec: {}", line);
        }

        let total: u64 = self.syscalls.stats().map(|(_, _, c)| c).sum();
        if total > 0 {
            log::info!("Syscall statistics (percent of all calls):");
            for (sid, nid, count) in self.syscalls.stats() {
                let percent = (count as f64 / total as f64) * 100.0;
                log::info!("  sid={:4} nid={:#010X} {:10}x {:5.1}%", sid, nid, count, percent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hle::{ArgKind, HleContext, ServiceEntry};

    struct Directory;

    fn svc_add_args(_ctx: &mut HleContext<'_>, args: &[u32]) -> u32 {
        args.iter().sum::<u32>().wrapping_add(0x100)
    }

    impl ServiceDirectory for Directory {
        fn resolve(&self, nid: u32) -> Option<ServiceEntry> {
            (nid == 0xCAFE_0001).then_some(ServiceEntry {
                func: svc_add_args,
                args: &[ArgKind::Word, ArgKind::Word],
            })
        }
    }

    fn boot_words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn setup_game_loads_image_and_points_pc_at_entry() {
        let mut psp = Psp::new(Box::new(Directory));
        let game = GameInfo { title: "demo".into(), entry_point: RAM_BASE + 0x100 };
        // addiu v0, r0, 3; jr ra; nop
        psp.setup_game(&game, &boot_words(&[0x2402_0003, 0x03E0_0008, 0x0000_0000]))
            .unwrap();
        assert_eq!(psp.cpu.ctx.pc, RAM_BASE + 0x100);
        assert_eq!(psp.mem.read_u32(RAM_BASE + 0x100).unwrap(), 0x2402_0003);
        assert_ne!(psp.cpu.ctx.gpr[29], 0);

        psp.cpu.ctx.gpr[31] = RAM_BASE + 0x200;
        psp.execute_block().unwrap();
        assert_eq!(psp.cpu.ctx.gpr[2], 3);
    }

    #[test]
    fn setup_game_rejects_oversized_or_repeated_images() {
        let mut psp = Psp::new(Box::new(Directory));
        let game = GameInfo { title: "bad".into(), entry_point: 0x0300_0000 };
        assert!(psp.setup_game(&game, &[0u8; 16]).is_err());

        let game = GameInfo { title: "ok".into(), entry_point: RAM_BASE };
        psp.setup_game(&game, &boot_words(&[0x0000_0000])).unwrap();
        psp.execute_block().unwrap();
        assert!(matches!(
            psp.setup_game(&game, &boot_words(&[0])),
            Err(CoreError::Setup(_))
        ));
    }

    #[test]
    fn syscall_reaches_host_service_with_marshalled_args() {
        let mut psp = Psp::new(Box::new(Directory));
        let sid = psp.register_syscall(0xCAFE_0001);
        assert_eq!(sid, 0);
        assert_eq!(psp.register_syscall(0xDEAD_0000), -1);

        let game = GameInfo { title: "svc".into(), entry_point: RAM_BASE + 0x400 };
        psp.setup_game(
            &game,
            &boot_words(&[
                0x2404_0005,              // addiu a0, r0, 5
                0x2405_0007,              // addiu a1, r0, 7
                ((sid as u32) << 6) | 0x0C, // syscall
            ]),
        )
        .unwrap();

        // Run until the syscall completes.
        for _ in 0..8 {
            psp.execute_block().unwrap();
            if psp.cpu.ctx.gpr[2] != 0 {
                break;
            }
        }
        assert_eq!(psp.cpu.ctx.gpr[2], 5 + 7 + 0x100);
        assert_eq!(psp.cpu.ctx.pc, RAM_BASE + 0x400 + 12);
        assert_eq!(psp.syscalls.call_count(0), 1);
    }

    #[test]
    fn stop_handle_breaks_the_loop_and_resume_clears_it() {
        let mut psp = Psp::new(Box::new(Directory));
        let game = GameInfo { title: "loop".into(), entry_point: RAM_BASE + 0x800 };
        // Tight loop: j self; nop.
        let target = (RAM_BASE + 0x800) >> 2;
        psp.setup_game(
            &game,
            &boot_words(&[(0x02 << 26) | (target & 0x03FF_FFFF), 0x0000_0000]),
        )
        .unwrap();

        let handle = psp.stop_handle();
        handle.stop();
        handle.stop(); // idempotent

        let mut flags = 0;
        for _ in 0..4 {
            flags = psp.execute_block().unwrap();
            if flags != 0 {
                break;
            }
        }
        assert_eq!(flags, BREAK_REQUESTED);
        assert_eq!(psp.state(), RunState::Breaking);

        psp.resume();
        assert_eq!(psp.state(), RunState::Running);
        assert!(!psp.cpu.break_requested());
    }

    #[test]
    fn context_switch_swaps_threads_between_blocks() {
        let mut psp = Psp::new(Box::new(Directory));
        let game = GameInfo { title: "threads".into(), entry_point: RAM_BASE };
        psp.setup_game(&game, &boot_words(&[0x0000_0000])).unwrap();

        let mut regs_a = [0u32; 32];
        regs_a[4] = 0xAAAA;
        let mut regs_b = [0u32; 32];
        regs_b[4] = 0xBBBB;
        let tcs_a = psp.allocate_context_storage(RAM_BASE + 0x1000, &regs_a);
        let tcs_b = psp.allocate_context_storage(RAM_BASE + 0x2000, &regs_b);

        psp.switch_context(tcs_a);
        assert_eq!(psp.cpu.ctx.pc, RAM_BASE + 0x1000);
        assert_eq!(psp.cpu.ctx.gpr[4], 0xAAAA);

        // Mutate thread A's state, then swap to B and back.
        psp.cpu.ctx.gpr[4] = 0xA1A1;
        psp.switch_context(tcs_b);
        assert_eq!(psp.cpu.ctx.gpr[4], 0xBBBB);
        assert_eq!(psp.cpu.ctx.pc, RAM_BASE + 0x2000);

        psp.switch_context(tcs_a);
        assert_eq!(psp.cpu.ctx.gpr[4], 0xA1A1, "outgoing state must be saved");

        psp.release_context_storage(tcs_b);
        psp.switch_context(tcs_b); // logs and keeps current thread
        assert_eq!(psp.cpu.ctx.gpr[4], 0xA1A1);
    }

    #[test]
    fn user_exports_resolve_after_registration() {
        let mut psp = Psp::new(Box::new(Directory));
        psp.register_user_exports(&crate::hle::ExportModule {
            name: "mod".into(),
            exports: vec![crate::hle::ModuleExport {
                nid: 0x5555_0001,
                address: RAM_BASE + 0x3000,
                is_system: false,
            }],
        });
        assert_eq!(psp.lookup_user_export(0x5555_0001), RAM_BASE + 0x3000);
        assert_eq!(psp.lookup_user_export(0x5555_0002), 0);
    }
}
