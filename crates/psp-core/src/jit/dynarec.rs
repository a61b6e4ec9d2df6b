//! Dynarec execution engine: dispatches compiled blocks, chains cached
//! successors, and falls back to the interpreter for cold or uncompilable
//! code.

use std::collections::HashMap;

use psp_dynarec::{
    BlockExit, CompileError, CompiledBlock, CraneliftCompiler, EnsureResult, ExitReason,
    InstructionSource, Recompiler, RecompilerConfig, RecompilerStats, RuntimeHelpers, TRAP_BD_BIT,
};

use crate::cpu::exceptions::ExceptionCode;
use crate::cpu::{fpu, Allegrex, PendingTrap};
use crate::hle::SyscallTable;
use crate::jit::{ExecutionEngine, Interpreter};
use crate::mem::{mask_address, MemoryMap, RAM_BASE};

#[derive(Debug, Clone, Copy, Default)]
pub struct DynarecRuntimeStats {
    pub native_blocks_executed: u64,
    pub native_instructions_executed: u64,
    pub native_fallback_ops: u64,
    /// Block-to-block transitions taken without a dispatcher round-trip.
    pub chained_transitions: u64,
    /// Dispatcher entries (one per `execute` call that ran native code).
    pub dispatch_entries: u64,
    pub native_gas_exits: u64,
    pub syscall_exits: u64,
    pub trap_exits: u64,
    pub break_exits: u64,
    pub fallback_instructions_executed: u64,
    pub fallback_early_guard: u64,
    pub fallback_guard_after_lookup: u64,
    pub fallback_no_block: u64,
    pub fallback_failed_cache: u64,
    pub fallback_cold: u64,
    pub ensure_compiled_calls: u64,
    pub ensure_compiled_compiled: u64,
    pub ensure_compiled_compile_failed: u64,
    pub ensure_compiled_cache_hit: u64,
    pub invalidate_calls: u64,
    pub invalidate_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DynarecStats {
    pub runtime: DynarecRuntimeStats,
    pub recompiler: RecompilerStats,
    pub block_cache_len: usize,
    pub failed_cache_len: usize,
    pub hot_threshold: u16,
    pub max_block_instructions: u32,
    pub native_gas_limit: u32,
    /// 0 means unlimited chaining (bounded by `native_gas_limit`).
    pub chain_limit: u32,
}

#[derive(Clone, Copy)]
enum FallbackReason {
    EarlyGuard,
    GuardAfterLookup,
    NoBlock,
    FailedCache,
    Cold,
}

struct MemSource<'a> {
    mem: &'a mut MemoryMap,
}

impl InstructionSource for MemSource<'_> {
    fn read_u32(&mut self, pc: u32) -> Result<u32, CompileError> {
        self.mem.read_u32(pc).map_err(|_| CompileError::Fetch { pc })
    }
}

/// Raw-pointer bundle handed to the JIT helpers as the `user` pointer.
struct HelperEnv {
    cpu: *mut Allegrex,
    mem: *mut MemoryMap,
    syscalls: *mut SyscallTable,
}

fn park_trap(cpu: &mut Allegrex, code: ExceptionCode, pc: u32, bad_vaddr: Option<u32>) {
    // First fault wins; later ones in the same block are dropped.
    if cpu.pending_trap.is_none() {
        cpu.pending_trap = Some(PendingTrap { code, epc: pc, bad_vaddr });
    }
}

unsafe extern "C" fn cb_load_u8(user: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: `user` is the HelperEnv built by `run_native_block`; its raw
    // pointers come from live mutable references held across the call.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    match mem.read_u8(addr) {
        Ok(v) => u32::from(v),
        Err(_) => {
            park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
            0
        }
    }
}

unsafe extern "C" fn cb_load_u16(user: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    match mem.read_u16(addr) {
        Ok(v) => u32::from(v),
        Err(_) => {
            park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
            0
        }
    }
}

unsafe extern "C" fn cb_load_u32(user: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    match mem.read_u32(addr) {
        Ok(v) => v,
        Err(_) => {
            park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
            0
        }
    }
}

unsafe extern "C" fn cb_store_u8(user: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    if mem.write_u8(addr, value as u8).is_err() {
        park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
    }
}

unsafe extern "C" fn cb_store_u16(user: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    if mem.write_u16(addr, value as u16).is_err() {
        park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
    }
}

unsafe extern "C" fn cb_store_u32(user: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    if mem.write_u32(addr, value).is_err() {
        park_trap(cpu, ExceptionCode::BusErrorData, pc, Some(addr));
    }
}

unsafe extern "C" fn cb_cop0_read(user: *mut u8, reg: u32) -> u32 {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    cpu.cop0.read_reg(reg as usize)
}

unsafe extern "C" fn cb_cop0_write(user: *mut u8, reg: u32, value: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    cpu.cop0.write_reg(reg as usize, value);
}

unsafe extern "C" fn cb_syscall(user: *mut u8, sid: u32, pc: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    let syscalls = unsafe { &mut *env.syscalls };
    if syscalls.invoke(sid, cpu, mem).is_err() {
        park_trap(cpu, ExceptionCode::Syscall, pc, None);
    }
}

unsafe extern "C" fn cb_fallback_exec(user: *mut u8, raw: u32, pc: u32) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    let mem = unsafe { &mut *env.mem };
    let syscalls = unsafe { &mut *env.syscalls };
    cpu.interp_one(raw, pc, mem, syscalls);
}

unsafe extern "C" fn cb_eret_target(user: *mut u8) -> u32 {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    cpu.cop0.eret()
}

unsafe extern "C" fn cb_fpu_enter(user: *mut u8) {
    // SAFETY: as above.
    let env = unsafe { &mut *(user as *mut HelperEnv) };
    let cpu = unsafe { &mut *env.cpu };
    fpu::apply_host_rounding(cpu.ctx.fcr31);
}

unsafe extern "C" fn cb_fpu_leave(_user: *mut u8) {
    fpu::restore_host_rounding();
}

/// Dynarec engine with interpreter fallback.
pub struct DynarecEngine {
    fallback: Interpreter,
    recompiler: Recompiler,
    runtime: DynarecRuntimeStats,
    hot_counts: HashMap<u32, u16>,
    hot_threshold: u16,
    max_block_instructions: u32,
    min_native_instructions: u32,
    native_gas_limit: u32,
    /// 0 means unlimited chaining (bounded by `native_gas_limit`).
    chain_limit: u32,
    fatal: Option<String>,
}

impl DynarecEngine {
    fn parse_env_u16(name: &str, default: u16) -> u16 {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    fn parse_env_u32(name: &str, default: u32) -> u32 {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    fn parse_env_u32_allow_zero(name: &str, default: u32) -> u32 {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(default)
    }

    pub fn new() -> Self {
        // Blocks compile on first execution by default; the threshold is a
        // tuning knob for compile-latency-sensitive setups.
        let hot_threshold = Self::parse_env_u16("PSP_DYNAREC_HOT_THRESHOLD", 1);
        let max_block_instructions = Self::parse_env_u32("PSP_DYNAREC_MAX_BLOCK_INSNS", 256);
        let min_native_instructions = Self::parse_env_u32("PSP_DYNAREC_MIN_BLOCK_INSNS", 1);
        let native_gas_limit = Self::parse_env_u32("PSP_DYNAREC_NATIVE_GAS", 4096);
        let chain_limit = Self::parse_env_u32_allow_zero("PSP_DYNAREC_CHAIN_LIMIT", 0);
        let compiler = Box::<CraneliftCompiler>::default();
        let recompiler = Recompiler::new(compiler, RecompilerConfig { max_block_instructions });
        Self {
            fallback: Interpreter,
            recompiler,
            runtime: DynarecRuntimeStats::default(),
            hot_counts: HashMap::new(),
            hot_threshold,
            max_block_instructions,
            min_native_instructions,
            native_gas_limit,
            chain_limit,
            fatal: None,
        }
    }

    pub fn stats(&self) -> DynarecStats {
        DynarecStats {
            runtime: self.runtime,
            recompiler: self.recompiler.stats(),
            block_cache_len: self.recompiler.cache_len(),
            failed_cache_len: self.recompiler.failed_cache_len(),
            hot_threshold: self.hot_threshold,
            max_block_instructions: self.max_block_instructions,
            native_gas_limit: self.native_gas_limit,
            chain_limit: self.chain_limit,
        }
    }

    pub fn cache_generation(&self) -> u64 {
        self.recompiler.generation()
    }

    pub fn take_fatal(&mut self) -> Option<String> {
        self.fatal.take()
    }

    pub fn stats_line(&self) -> String {
        let stats = self.stats();
        format!(
            "native_blocks={} native_instr={} native_fallback_ops={} chained={} dispatch_entries={} gas_exits={} syscall_exits={} trap_exits={} break_exits={} fallback_instr={} fallback_early_guard={} fallback_guard_after_lookup={} fallback_no_block={} fallback_failed_cache={} fallback_cold={} ensure_calls={} ensure_compiled={} ensure_failed={} ensure_cache_hit={} recompiler_blocks={} recompiler_failures={} recompiler_invalidated={} invalidate_calls={} invalidate_bytes={} cache_len={} failed_cache_len={} hot_threshold={} max_block_insns={} native_gas={} chain_limit={} generation={}",
            stats.runtime.native_blocks_executed,
            stats.runtime.native_instructions_executed,
            stats.runtime.native_fallback_ops,
            stats.runtime.chained_transitions,
            stats.runtime.dispatch_entries,
            stats.runtime.native_gas_exits,
            stats.runtime.syscall_exits,
            stats.runtime.trap_exits,
            stats.runtime.break_exits,
            stats.runtime.fallback_instructions_executed,
            stats.runtime.fallback_early_guard,
            stats.runtime.fallback_guard_after_lookup,
            stats.runtime.fallback_no_block,
            stats.runtime.fallback_failed_cache,
            stats.runtime.fallback_cold,
            stats.runtime.ensure_compiled_calls,
            stats.runtime.ensure_compiled_compiled,
            stats.runtime.ensure_compiled_compile_failed,
            stats.runtime.ensure_compiled_cache_hit,
            stats.recompiler.blocks_compiled,
            stats.recompiler.compile_failures,
            stats.recompiler.invalidated_blocks,
            stats.runtime.invalidate_calls,
            stats.runtime.invalidate_bytes,
            stats.block_cache_len,
            stats.failed_cache_len,
            stats.hot_threshold,
            stats.max_block_instructions,
            stats.native_gas_limit,
            stats.chain_limit,
            self.recompiler.generation(),
        )
    }

    pub fn reset_stats(&mut self) {
        self.runtime = DynarecRuntimeStats::default();
        self.recompiler.reset_stats();
    }

    fn run_fallback(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        reason: FallbackReason,
    ) -> u64 {
        let retired = self.fallback.execute(cpu, mem, syscalls);
        self.runtime.fallback_instructions_executed = self
            .runtime
            .fallback_instructions_executed
            .wrapping_add(retired);
        match reason {
            FallbackReason::EarlyGuard => self.runtime.fallback_early_guard += 1,
            FallbackReason::GuardAfterLookup => self.runtime.fallback_guard_after_lookup += 1,
            FallbackReason::NoBlock => self.runtime.fallback_no_block += 1,
            FallbackReason::FailedCache => self.runtime.fallback_failed_cache += 1,
            FallbackReason::Cold => self.runtime.fallback_cold += 1,
        }
        retired
    }

    fn should_attempt_compile(&mut self, key: u32) -> bool {
        let entry = self.hot_counts.entry(key).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry >= self.hot_threshold
    }

    fn can_run_native_block(&self, cpu: &Allegrex, block: &CompiledBlock, key: u32) -> bool {
        if block.instruction_count == 0 {
            return false;
        }
        if block.instruction_count < self.min_native_instructions {
            return false;
        }
        // Blocks dominated by fallback-delegated ops are slower than the
        // plain interpreter path.
        if block.fallback_op_count != 0 && block.fallback_op_count >= block.instruction_count {
            return false;
        }
        // Delay-slot state needs instruction-granular execution.
        if cpu.in_delay_slot || cpu.ctx.next_pc != cpu.ctx.pc.wrapping_add(4) {
            return false;
        }
        key == mask_address(cpu.ctx.pc)
    }

    fn drain_invalidations(&mut self, mem: &mut MemoryMap) {
        if !mem.has_pending_invalidations() {
            return;
        }
        for (start, len) in mem.take_code_invalidations() {
            self.runtime.invalidate_calls += 1;
            self.runtime.invalidate_bytes += u64::from(len);
            self.recompiler.invalidate_range(start, len);
        }
    }

    /// Run one compiled block. Returns retired instructions and whether the
    /// chain may continue.
    fn run_native_block(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        block: &CompiledBlock,
    ) -> (u64, bool) {
        let start_pc = cpu.ctx.pc;
        let cpu_ptr: *mut Allegrex = cpu;
        let mem_ptr: *mut MemoryMap = mem;
        let syscalls_ptr: *mut SyscallTable = syscalls;
        let mut env = HelperEnv { cpu: cpu_ptr, mem: mem_ptr, syscalls: syscalls_ptr };

        // SAFETY: the env raw pointers come from the mutable references
        // above and stay valid for the duration of the block call; compiled
        // code only touches them through the helper functions.
        let mut helpers = RuntimeHelpers {
            user: (&mut env as *mut HelperEnv).cast::<u8>(),
            load_u8: cb_load_u8,
            load_u16: cb_load_u16,
            load_u32: cb_load_u32,
            store_u8: cb_store_u8,
            store_u16: cb_store_u16,
            store_u32: cb_store_u32,
            cop0_read: cb_cop0_read,
            cop0_write: cb_cop0_write,
            syscall: cb_syscall,
            fallback_exec: cb_fallback_exec,
            eret_target: cb_eret_target,
            fpu_enter: cb_fpu_enter,
            fpu_leave: cb_fpu_leave,
            break_flag: cpu.break_flag.as_ptr(),
            fastmem_base: mem.ram_base_ptr(),
            fastmem_start: RAM_BASE,
            fastmem_len: mem.ram_len(),
        };

        let execution = {
            // SAFETY: `cpu_ptr` is valid; the context is only otherwise
            // reachable through the helper env, which accesses disjoint
            // fields or runs strictly before/after the compiled code touches
            // the register file.
            let ctx = unsafe { &mut (*cpu_ptr).ctx };
            block.execute(ctx, &mut helpers, start_pc)
        };

        let retired = execution.retired_instructions;
        let exit: BlockExit = execution.exit;

        cpu.ctx.gpr[0] = 0;
        cpu.step_count = cpu.step_count.wrapping_add(u64::from(retired));
        cpu.cop0.advance_count(retired);
        cpu.pc_history[cpu.pc_history_idx] = start_pc;
        cpu.pc_history_idx = (cpu.pc_history_idx + 1) & 63;

        self.runtime.native_blocks_executed += 1;
        self.runtime.native_instructions_executed = self
            .runtime
            .native_instructions_executed
            .wrapping_add(u64::from(retired));
        self.runtime.native_fallback_ops = self
            .runtime
            .native_fallback_ops
            .wrapping_add(u64::from(block.fallback_op_count));

        let mut chainable = false;
        match exit.reason {
            ExitReason::Normal => {
                cpu.ctx.pc = exit.next_pc;
                cpu.ctx.next_pc = exit.next_pc.wrapping_add(4);
                chainable = true;
            }
            ExitReason::Syscall => {
                // The shim already ran inside the block; control returns to
                // the dispatcher so the kernel can reschedule between blocks.
                cpu.ctx.pc = exit.next_pc;
                cpu.ctx.next_pc = exit.next_pc.wrapping_add(4);
                self.runtime.syscall_exits += 1;
            }
            ExitReason::Trap => {
                let code = ExceptionCode::from_raw(exit.payload & 0x7F);
                let in_delay = exit.payload & TRAP_BD_BIT != 0;
                cpu.deliver_exception(code, exit.next_pc, in_delay, None);
                self.runtime.trap_exits += 1;
            }
            ExitReason::HostBreak => {
                cpu.ctx.pc = exit.next_pc;
                cpu.ctx.next_pc = exit.next_pc.wrapping_add(4);
                self.runtime.break_exits += 1;
            }
        }

        // Faults recorded by helpers mid-block (bus errors, unknown SIDs)
        // are delivered now, at the block boundary.
        if let Some(trap) = cpu.pending_trap.take() {
            cpu.deliver_exception(trap.code, trap.epc, false, trap.bad_vaddr);
            self.runtime.trap_exits += 1;
            chainable = false;
        }

        (u64::from(retired), chainable)
    }

    fn run_native_chain(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        first_block: CompiledBlock,
    ) -> u64 {
        let mut total_retired = 0u64;
        let gas_limit = u64::from(self.native_gas_limit.max(1));
        let mut blocks_left = (self.chain_limit != 0).then_some(self.chain_limit);
        let mut block = first_block;
        self.runtime.dispatch_entries += 1;

        loop {
            let (retired, chainable) = self.run_native_block(cpu, mem, syscalls, &block);
            total_retired = total_retired.wrapping_add(retired);

            // Guest stores must be observed before any successor fetch.
            self.drain_invalidations(mem);

            if !chainable {
                break;
            }
            if total_retired >= gas_limit {
                self.runtime.native_gas_exits += 1;
                break;
            }
            if let Some(left) = blocks_left.as_mut() {
                *left -= 1;
                if *left == 0 {
                    break;
                }
            }
            if cpu.in_delay_slot || cpu.ctx.next_pc != cpu.ctx.pc.wrapping_add(4) {
                break;
            }

            let key = mask_address(cpu.ctx.pc);
            let Some(next_block) = self.recompiler.lookup(key).copied() else {
                break;
            };
            if !self.can_run_native_block(cpu, &next_block, key) {
                break;
            }
            block = next_block;
            self.runtime.chained_transitions += 1;
        }

        total_retired
    }
}

impl Default for DynarecEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine for DynarecEngine {
    fn execute(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
    ) -> u64 {
        if cpu.in_delay_slot || cpu.ctx.next_pc != cpu.ctx.pc.wrapping_add(4) {
            return self.run_fallback(cpu, mem, syscalls, FallbackReason::EarlyGuard);
        }

        let key = mask_address(cpu.ctx.pc);
        if let Some(block) = self.recompiler.lookup(key).copied() {
            if self.can_run_native_block(cpu, &block, key) {
                return self.run_native_chain(cpu, mem, syscalls, block);
            }
            return self.run_fallback(cpu, mem, syscalls, FallbackReason::GuardAfterLookup);
        }

        if self.recompiler.is_failed_cached(key) {
            return self.run_fallback(cpu, mem, syscalls, FallbackReason::FailedCache);
        }
        if !self.should_attempt_compile(key) {
            return self.run_fallback(cpu, mem, syscalls, FallbackReason::Cold);
        }

        self.runtime.ensure_compiled_calls += 1;
        let ensure_result = {
            let mut source = MemSource { mem };
            self.recompiler.ensure_compiled(key, &mut source)
        };
        match ensure_result {
            EnsureResult::CacheHit => self.runtime.ensure_compiled_cache_hit += 1,
            EnsureResult::Compiled => {
                self.runtime.ensure_compiled_compiled += 1;
                self.hot_counts.remove(&key);
                if let Some(block) = self.recompiler.lookup(key) {
                    mem.mark_code_range(block.start_pc, block.end_pc.wrapping_sub(block.start_pc));
                }
            }
            EnsureResult::CompileFailed => {
                self.runtime.ensure_compiled_compile_failed += 1;
                match self.recompiler.last_error() {
                    Some(CompileError::Backend { message }) => {
                        // Backend failures (including an exhausted executable
                        // arena) are fatal to the session.
                        log::error!("dynarec backend failure at {:#010X}: {}", key, message);
                        self.fatal = Some(message.clone());
                    }
                    Some(err) => {
                        log::debug!("dynarec compile failed at {:#010X}: {:?}", key, err);
                    }
                    None => {}
                }
            }
        }

        if let Some(block) = self.recompiler.lookup(key).copied() {
            if self.can_run_native_block(cpu, &block, key) {
                return self.run_native_chain(cpu, mem, syscalls, block);
            }
            return self.run_fallback(cpu, mem, syscalls, FallbackReason::GuardAfterLookup);
        }

        self.run_fallback(cpu, mem, syscalls, FallbackReason::NoBlock)
    }

    fn invalidate_range(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.runtime.invalidate_calls += 1;
        self.runtime.invalidate_bytes += u64::from(len);
        self.recompiler.invalidate_range(start, len);
    }

    fn flush(&mut self) {
        self.recompiler.flush_all();
        self.hot_counts.clear();
    }

    fn name(&self) -> &'static str {
        self.recompiler.backend_name()
    }
}
