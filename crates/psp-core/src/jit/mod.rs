use crate::cpu::Allegrex;
use crate::hle::SyscallTable;
use crate::mem::MemoryMap;

mod dynarec;

pub use dynarec::{DynarecEngine, DynarecRuntimeStats, DynarecStats};

/// Execution engine abstraction.
///
/// The interpreter engine always exists; the dynarec engine compiles hot
/// blocks and falls back to the interpreter for cold or uncompilable code.
pub trait ExecutionEngine {
    /// Execute one unit of work: one instruction for the interpreter, one
    /// compiled block chain for the dynarec. Returns retired instructions.
    fn execute(&mut self, cpu: &mut Allegrex, mem: &mut MemoryMap, syscalls: &mut SyscallTable)
        -> u64;

    /// Invalidate any compiled code covering `[start, start+len)` in masked
    /// guest addresses.
    fn invalidate_range(&mut self, start: u32, len: u32);

    /// Drop all compiled code (module unload, teardown).
    fn flush(&mut self);

    fn name(&self) -> &'static str;
}

/// The reference interpreter as an engine.
#[derive(Default)]
pub struct Interpreter;

impl ExecutionEngine for Interpreter {
    fn execute(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
    ) -> u64 {
        cpu.step(mem, syscalls)
    }

    fn invalidate_range(&mut self, _start: u32, _len: u32) {
        // Nothing cached.
    }

    fn flush(&mut self) {}

    fn name(&self) -> &'static str {
        "interpreter"
    }
}

/// Runtime-selected execution engine.
pub enum Engine {
    Interpreter(Interpreter),
    Dynarec(DynarecEngine),
}

impl Engine {
    pub fn interpreter() -> Self {
        Self::Interpreter(Interpreter)
    }

    pub fn dynarec() -> Self {
        Self::Dynarec(DynarecEngine::new())
    }

    /// Build the engine from the environment. The dynarec is the default;
    /// `PSP_DYNAREC=0|off|false|no` selects the pure interpreter.
    pub fn from_env() -> Self {
        let raw = std::env::var("PSP_DYNAREC").unwrap_or_default();
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "0" | "off" | "false" | "no" => Self::interpreter(),
            "" | "1" | "on" | "true" | "yes" | "cranelift" => Self::dynarec(),
            _ => {
                log::warn!("Unknown PSP_DYNAREC value {:?}; using dynarec", raw);
                Self::dynarec()
            }
        }
    }

    pub fn execute(
        &mut self,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
    ) -> u64 {
        match self {
            Engine::Interpreter(engine) => engine.execute(cpu, mem, syscalls),
            Engine::Dynarec(engine) => engine.execute(cpu, mem, syscalls),
        }
    }

    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        match self {
            Engine::Interpreter(engine) => engine.invalidate_range(start, len),
            Engine::Dynarec(engine) => engine.invalidate_range(start, len),
        }
    }

    pub fn flush(&mut self) {
        match self {
            Engine::Interpreter(engine) => ExecutionEngine::flush(engine),
            Engine::Dynarec(engine) => ExecutionEngine::flush(engine),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Interpreter(engine) => engine.name(),
            Engine::Dynarec(engine) => engine.name(),
        }
    }

    pub fn stats_line(&self) -> Option<String> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Dynarec(engine) => Some(engine.stats_line()),
        }
    }

    pub fn dynarec_stats(&self) -> Option<DynarecStats> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Dynarec(engine) => Some(engine.stats()),
        }
    }

    /// A backend failure that should tear the session down (executable
    /// memory exhaustion), if one occurred.
    pub fn take_fatal(&mut self) -> Option<String> {
        match self {
            Engine::Interpreter(_) => None,
            Engine::Dynarec(engine) => engine.take_fatal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hle::{ArgKind, HleContext, ServiceDirectory, ServiceEntry};
    use crate::mem::RAM_BASE;

    struct NullDirectory;

    impl ServiceDirectory for NullDirectory {
        fn resolve(&self, _nid: u32) -> Option<ServiceEntry> {
            None
        }
    }

    struct OneService;

    fn svc_const(_ctx: &mut HleContext<'_>, _args: &[u32]) -> u32 {
        0x1234
    }

    impl ServiceDirectory for OneService {
        fn resolve(&self, nid: u32) -> Option<ServiceEntry> {
            (nid == 0xABCD_0001).then_some(ServiceEntry { func: svc_const, args: &[ArgKind::Word] })
        }
    }

    fn load_program(mem: &mut MemoryMap, start: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            mem.write_u32(start + (i as u32) * 4, *w).unwrap();
        }
    }

    fn fresh_cpu(pc: u32) -> Allegrex {
        let mut cpu = Allegrex::new();
        cpu.ctx.pc = pc;
        cpu.ctx.next_pc = pc.wrapping_add(4);
        cpu
    }

    fn run_until_pc(
        engine: &mut Engine,
        cpu: &mut Allegrex,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        end_pc: u32,
        max_calls: u32,
    ) {
        let mut calls = 0;
        while cpu.ctx.pc != end_pc && calls < max_calls {
            let retired = engine.execute(cpu, mem, syscalls);
            assert!(retired > 0, "engine retired zero instructions");
            for (start, len) in mem.take_code_invalidations() {
                engine.invalidate_range(start, len);
            }
            calls += 1;
        }
        assert_eq!(cpu.ctx.pc, end_pc, "engine did not reach target pc");
    }

    fn assert_cpu_equal(a: &Allegrex, b: &Allegrex) {
        assert_eq!(a.ctx.gpr, b.ctx.gpr);
        assert_eq!(a.ctx.pc, b.ctx.pc);
        assert_eq!(a.ctx.next_pc, b.ctx.next_pc);
        assert_eq!(a.ctx.hi, b.ctx.hi);
        assert_eq!(a.ctx.lo, b.ctx.lo);
        assert_eq!(a.ctx.fpr, b.ctx.fpr);
        assert_eq!(a.ctx.fcr31, b.ctx.fcr31);
        assert_eq!(a.in_delay_slot, b.in_delay_slot);
    }

    /// Run the same program on the interpreter and the dynarec and compare
    /// the full architectural state at the join point.
    fn differential(words: &[u32], end_index: u32, setup: impl Fn(&mut Allegrex, &mut MemoryMap)) {
        let start = RAM_BASE + 0x4000;
        let end_pc = start + end_index * 4;

        let mut mem_a = MemoryMap::new();
        load_program(&mut mem_a, start, words);
        let mut cpu_a = fresh_cpu(start);
        setup(&mut cpu_a, &mut mem_a);
        let mut syscalls_a = SyscallTable::new();
        let mut interp = Engine::interpreter();
        run_until_pc(&mut interp, &mut cpu_a, &mut mem_a, &mut syscalls_a, end_pc, 4096);

        let mut mem_b = MemoryMap::new();
        load_program(&mut mem_b, start, words);
        let mut cpu_b = fresh_cpu(start);
        setup(&mut cpu_b, &mut mem_b);
        let mut syscalls_b = SyscallTable::new();
        let mut dynarec = Engine::dynarec();
        run_until_pc(&mut dynarec, &mut cpu_b, &mut mem_b, &mut syscalls_b, end_pc, 4096);

        assert_cpu_equal(&cpu_a, &cpu_b);
    }

    #[test]
    fn dynarec_matches_interpreter_on_arith_and_memory() {
        differential(
            &[
                0x3C0C_0800, // lui t4, 0x0800
                0x2408_0005, // addiu t0, r0, 5
                0x2409_0007, // addiu t1, r0, 7
                0x0109_5021, // addu t2, t0, t1
                0xAD8A_0100, // sw t2, 0x100(t4)
                0x8D8B_0100, // lw t3, 0x100(t4)
                0x3562_1234, // ori v0, t3, 0x1234
                0x0000_0005, // reserved: block terminator sentinel
            ],
            7,
            |_, _| {},
        );
    }

    #[test]
    fn dynarec_matches_interpreter_on_branch_delay_slots() {
        differential(
            &[
                0x2408_0001, // addiu t0, r0, 1
                0x1108_0002, // beq t0, t0, +2
                0x2409_0007, // addiu t1, r0, 7 (delay slot)
                0x2409_0063, // addiu t1, r0, 99 (skipped)
                0x3522_0000, // ori v0, t1, 0
                0x0000_0005, // reserved sentinel
            ],
            5,
            |_, _| {},
        );
    }

    #[test]
    fn dynarec_matches_interpreter_on_backward_loop() {
        differential(
            &[
                0x3C0C_0800, // lui t4, 0x0800
                0x2408_0000, // addiu t0, r0, 0
                0x2409_0008, // addiu t1, r0, 8
                0x240A_0000, // addiu t2, r0, 0
                0x2508_0001, // addiu t0, t0, 1
                0x0148_5021, // addu t2, t2, t0
                0x1509_FFFD, // bne t0, t1, -3
                0xAD88_0100, // sw t0, 0x100(t4) (delay slot)
                0xAD8A_0104, // sw t2, 0x104(t4)
                0x8D8B_0100, // lw t3, 0x100(t4)
                0x8D8D_0104, // lw t5, 0x104(t4)
                0x0000_0005, // reserved sentinel
            ],
            11,
            |_, _| {},
        );
    }

    #[test]
    fn dynarec_matches_interpreter_on_unaligned_ops() {
        // lwr/lwl pair assembling an unaligned word, then swl/swr storing it
        // back unaligned.
        let lwr = (0x26u32 << 26) | (8 << 21) | (9 << 16) | 0x101;
        let lwl = (0x22u32 << 26) | (8 << 21) | (9 << 16) | 0x104;
        let swr = (0x2Eu32 << 26) | (8 << 21) | (9 << 16) | 0x201;
        let swl = (0x2Au32 << 26) | (8 << 21) | (9 << 16) | 0x204;
        differential(
            &[
                0x3C08_0800, // lui t0, 0x0800
                lwr,
                lwl,
                swr,
                swl,
                0x0000_0005, // reserved sentinel
            ],
            5,
            |_, mem| {
                mem.write_u32(RAM_BASE + 0x100, 0x0011_2233).unwrap();
                mem.write_u32(RAM_BASE + 0x104, 0x4455_6677).unwrap();
            },
        );
    }

    #[test]
    fn dynarec_matches_interpreter_on_overflow_trap() {
        // add r1, t0, t0 with t0 = 0x7FFFFFFF traps; both engines must land
        // on the same exception vector with the same COP0 state.
        let start = RAM_BASE + 0x4000;
        let words = [
            0x3C08_7FFF, // lui t0, 0x7FFF
            0x3508_FFFF, // ori t0, t0, 0xFFFF
            0x0108_0820, // add r1, t0, t0
        ];

        let mut run = |mut engine: Engine| {
            let mut mem = MemoryMap::new();
            load_program(&mut mem, start, &words);
            let mut cpu = fresh_cpu(start);
            let mut syscalls = SyscallTable::new();
            let mut fuel = 64;
            while cpu.ctx.pc != 0x8000_0180 && fuel > 0 {
                engine.execute(&mut cpu, &mut mem, &mut syscalls);
                fuel -= 1;
            }
            cpu
        };

        let a = run(Engine::interpreter());
        let b = run(Engine::dynarec());
        assert_eq!(a.ctx.pc, 0x8000_0180);
        assert_eq!(a.cop0.regs[crate::cpu::cop0::Cop0::EPC], start + 8);
        assert_eq!(
            a.cop0.regs[crate::cpu::cop0::Cop0::EPC],
            b.cop0.regs[crate::cpu::cop0::Cop0::EPC]
        );
        assert_eq!(
            a.cop0.regs[crate::cpu::cop0::Cop0::CAUSE] & 0x7C,
            b.cop0.regs[crate::cpu::cop0::Cop0::CAUSE] & 0x7C
        );
        assert_eq!(a.ctx.gpr[1], b.ctx.gpr[1]);
        assert_eq!(a.ctx.gpr[1], 0, "trapped add must not write rd");
    }

    #[test]
    fn self_modifying_store_recompiles_block() {
        // S3: overwrite an instruction inside an already-compiled block; the
        // next execution must observe the new instruction.
        let start = RAM_BASE + 0x6000;
        let mut mem = MemoryMap::new();
        // Block: addiu v0, r0, 1; jr ra; nop
        load_program(&mut mem, start, &[0x2402_0001, 0x03E0_0008, 0x0000_0000]);
        let mut cpu = fresh_cpu(start);
        cpu.ctx.gpr[31] = start + 0x100;
        let mut syscalls = SyscallTable::new();
        let mut engine = Engine::dynarec();

        let gen_before = match &engine {
            Engine::Dynarec(e) => e.cache_generation(),
            _ => unreachable!(),
        };

        engine.execute(&mut cpu, &mut mem, &mut syscalls);
        assert_eq!(cpu.ctx.gpr[2], 1);
        assert_eq!(cpu.ctx.pc, start + 0x100);

        // Guest store rewrites the first instruction: addiu v0, r0, 2.
        mem.write_u32(start, 0x2402_0002).unwrap();
        for (s, l) in mem.take_code_invalidations() {
            engine.invalidate_range(s, l);
        }

        cpu.ctx.pc = start;
        cpu.ctx.next_pc = start + 4;
        engine.execute(&mut cpu, &mut mem, &mut syscalls);
        assert_eq!(cpu.ctx.gpr[2], 2, "stale block served after overwrite");

        let gen_after = match &engine {
            Engine::Dynarec(e) => e.cache_generation(),
            _ => unreachable!(),
        };
        assert!(gen_after > gen_before, "generation must advance");
    }

    #[test]
    fn syscall_round_trip_through_registered_shim() {
        // S4: SYSCALL with a registered SID returns the shim result in v0
        // and resumes at pc+4.
        let start = RAM_BASE + 0x7000;
        let mut syscalls = SyscallTable::new();
        let sid = syscalls.register(0xABCD_0001, &OneService);
        assert_eq!(sid, 0);

        let mut mem = MemoryMap::new();
        load_program(
            &mut mem,
            start,
            &[
                ((sid as u32) << 6) | 0x0C, // syscall
                0x0000_0005,                // reserved sentinel
            ],
        );
        let mut cpu = fresh_cpu(start);
        let mut engine = Engine::dynarec();
        engine.execute(&mut cpu, &mut mem, &mut syscalls);

        assert_eq!(cpu.ctx.gpr[2], 0x1234);
        assert_eq!(cpu.ctx.pc, start + 4);
        assert_eq!(syscalls.call_count(0), 1);
    }

    #[test]
    fn chained_blocks_avoid_dispatcher_round_trips() {
        // S5: three blocks ending in unconditional jumps to each other; once
        // hot, a single dispatch runs the whole chain.
        let start = RAM_BASE + 0x8000;
        let mut mem = MemoryMap::new();
        let block_b = start + 0x40;
        let block_c = start + 0x80;
        let j = |target: u32| (0x02u32 << 26) | ((target >> 2) & 0x03FF_FFFF);
        // A: counter += 1; j B; nop
        load_program(&mut mem, start, &[0x2508_0001, j(block_b), 0x0000_0000]);
        // B: j C; nop
        load_program(&mut mem, block_b, &[j(block_c), 0x0000_0000]);
        // C: loop back to A while t0 < 64
        let back = ((i64::from(start) - i64::from(block_c + 8)) >> 2) as i16 as u16;
        load_program(
            &mut mem,
            block_c,
            &[
                0x2909_0040,                                    // slti t1, t0, 64
                (0x05u32 << 26) | (9 << 21) | u32::from(back), // bne t1, r0, A
                0x0000_0000,                                    // nop (delay)
            ],
        );

        let mut cpu = fresh_cpu(start);
        let mut syscalls = SyscallTable::new();
        let mut engine = Engine::dynarec();

        let mut dispatches = 0u32;
        while cpu.ctx.gpr[8] < 64 && dispatches < 10_000 {
            engine.execute(&mut cpu, &mut mem, &mut syscalls);
            dispatches += 1;
        }
        assert_eq!(cpu.ctx.gpr[8], 64);

        let stats = engine.dynarec_stats().unwrap();
        assert!(
            stats.runtime.chained_transitions > 0,
            "hot traversals must chain without dispatcher round-trips"
        );
        // Far fewer dispatches than block executions.
        assert!(u64::from(dispatches) < stats.runtime.native_blocks_executed);
    }

    #[test]
    fn stop_from_another_thread_halts_compiled_loop() {
        // S6: an infinite guest loop; stop() flips the break flag from a
        // different thread and execute() must return within the gas bound.
        let start = RAM_BASE + 0x9000;
        let mut mem = MemoryMap::new();
        let j = |target: u32| (0x02u32 << 26) | ((target >> 2) & 0x03FF_FFFF);
        load_program(&mut mem, start, &[0x2508_0001, j(start), 0x0000_0000]);

        let mut cpu = fresh_cpu(start);
        let mut syscalls = SyscallTable::new();
        let mut engine = Engine::dynarec();

        let flag = std::sync::Arc::clone(&cpu.break_flag);
        let stopper = std::thread::spawn(move || {
            flag.store(1, std::sync::atomic::Ordering::Release);
        });
        stopper.join().unwrap();

        // The flag is visible before this dispatch: it must return promptly
        // without running the loop to the gas limit forever.
        let retired = engine.execute(&mut cpu, &mut mem, &mut syscalls);
        let stats = engine.dynarec_stats().unwrap();
        let bound = u64::from(stats.native_gas_limit) + u64::from(stats.max_block_instructions);
        assert!(retired <= bound);
        assert!(cpu.break_requested());
    }

    #[test]
    fn unknown_nid_registration_fails_cleanly() {
        let mut syscalls = SyscallTable::new();
        assert_eq!(syscalls.register(0x1234_5678, &NullDirectory), -1);
    }
}
