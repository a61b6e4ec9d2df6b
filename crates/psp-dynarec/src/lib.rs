//! Dynarec infrastructure for the Allegrex CPU core.
//!
//! This crate keeps backend/compiler concerns separate from core emulation
//! logic: instruction decoding, block construction and analysis, the
//! Cranelift code generator, and the translated-code cache live here. The
//! core crate owns the register file, memory map, and dispatch loop.

use std::collections::{HashMap, HashSet};

pub mod abi;
pub mod builder;
pub mod decode;
mod emit;

pub use abi::{
    BlockExecution, BlockExit, CompiledBlock, CpuContext, ExitReason, RuntimeHelpers, TRAP_BD_BIT,
};
pub use emit::{CraneliftCompiler, EXC_BREAKPOINT, EXC_OVERFLOW};

/// Input needed to compile a guest basic block.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest {
    /// Start address of the block, with the cached/uncached mirror bits
    /// already folded. This is the cache key.
    pub start_pc: u32,
    /// Hard cap on guest instructions per block.
    pub max_instructions: u32,
}

/// Guest instruction source used by the compiler.
pub trait InstructionSource {
    fn read_u32(&mut self, pc: u32) -> Result<u32, CompileError>;
}

/// Compilation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Source memory could not be read.
    Fetch { pc: u32 },
    /// The block starts on (or its first delay slot holds) a reserved
    /// encoding; executing it must raise a guest trap, which the fallback
    /// interpreter does precisely.
    Reserved { pc: u32, raw: u32 },
    /// No full instruction fits under the block cap.
    TooLong { pc: u32 },
    /// Backend failure (including executable-memory exhaustion).
    Backend { message: String },
}

/// Backend trait for block compilers.
///
/// Backends treat `start_pc` as the cache key; invalidation is always in
/// masked guest physical addresses.
pub trait BlockCompiler {
    fn name(&self) -> &'static str;
    fn compile(
        &mut self,
        request: &CompileRequest,
        source: &mut dyn InstructionSource,
    ) -> Result<CompiledBlock, CompileError>;
    /// Retire every compiled block and release executable memory. Called
    /// only after the cache has dropped all entry pointers.
    fn flush(&mut self) {}
}

/// Compiler configuration.
#[derive(Debug, Clone, Copy)]
pub struct RecompilerConfig {
    pub max_block_instructions: u32,
}

impl Default for RecompilerConfig {
    fn default() -> Self {
        // Long straight-line runs pessimize compile latency; the cap keeps it
        // predictable and is configurable by the engine.
        Self { max_block_instructions: 256 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureResult {
    CacheHit,
    Compiled,
    CompileFailed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecompilerStats {
    pub cache_hits: u64,
    pub failed_cache_hits: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
    pub invalidated_blocks: u64,
    pub flushes: u64,
}

const PAGE_SHIFT: u32 = 12;

/// Core recompiler pipeline: translated-code cache + backend compiler.
///
/// Single-writer: all mutation happens on the CPU thread. The generation
/// counter advances whenever cached code is retired, so block-linking logic
/// can detect stale successors.
pub struct Recompiler {
    compiler: Box<dyn BlockCompiler>,
    config: RecompilerConfig,
    cache: HashMap<u32, CompiledBlock>,
    failed_cache: HashSet<u32>,
    /// Pages covered by at least one cached block, with a count per page.
    /// Lets `invalidate_range` skip the interval scan for data-only writes.
    page_refs: HashMap<u32, u32>,
    generation: u64,
    stats: RecompilerStats,
    last_error: Option<CompileError>,
}

impl Recompiler {
    pub fn new(compiler: Box<dyn BlockCompiler>, config: RecompilerConfig) -> Self {
        Self {
            compiler,
            config,
            cache: HashMap::new(),
            failed_cache: HashSet::new(),
            page_refs: HashMap::new(),
            generation: 0,
            stats: RecompilerStats::default(),
            last_error: None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.compiler.name()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn failed_cache_len(&self) -> usize {
        self.failed_cache.len()
    }

    /// Monotonic counter, bumped whenever cached code is retired.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> RecompilerStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = RecompilerStats::default();
        self.last_error = None;
    }

    pub fn last_error(&self) -> Option<&CompileError> {
        self.last_error.as_ref()
    }

    pub fn lookup(&self, start_pc: u32) -> Option<&CompiledBlock> {
        self.cache.get(&start_pc)
    }

    pub fn is_failed_cached(&self, start_pc: u32) -> bool {
        self.failed_cache.contains(&start_pc)
    }

    /// True when any cached block's source range intersects the page holding
    /// `addr`. The memory map consults this to decide whether a write needs
    /// an invalidation notification.
    pub fn page_has_code(&self, addr: u32) -> bool {
        self.page_refs.contains_key(&(addr >> PAGE_SHIFT))
    }

    fn add_page_refs(&mut self, block: &CompiledBlock) {
        if block.end_pc <= block.start_pc {
            return;
        }
        for page in (block.start_pc >> PAGE_SHIFT)..=((block.end_pc - 1) >> PAGE_SHIFT) {
            *self.page_refs.entry(page).or_insert(0) += 1;
        }
    }

    fn drop_page_refs(&mut self, block: &CompiledBlock) {
        if block.end_pc <= block.start_pc {
            return;
        }
        for page in (block.start_pc >> PAGE_SHIFT)..=((block.end_pc - 1) >> PAGE_SHIFT) {
            if let Some(count) = self.page_refs.get_mut(&page) {
                *count -= 1;
                if *count == 0 {
                    self.page_refs.remove(&page);
                }
            }
        }
    }

    /// Look up or compile the block at `start_pc`. Failed compilations are
    /// negatively cached so cold uncompilable code does not retry every
    /// dispatch.
    pub fn ensure_compiled(
        &mut self,
        start_pc: u32,
        source: &mut dyn InstructionSource,
    ) -> EnsureResult {
        if self.cache.contains_key(&start_pc) {
            self.stats.cache_hits += 1;
            return EnsureResult::CacheHit;
        }
        if self.failed_cache.contains(&start_pc) {
            self.stats.cache_hits += 1;
            self.stats.failed_cache_hits += 1;
            return EnsureResult::CacheHit;
        }

        let request = CompileRequest {
            start_pc,
            max_instructions: self.config.max_block_instructions.max(1),
        };
        match self.compiler.compile(&request, source) {
            Ok(block) => {
                self.stats.blocks_compiled += 1;
                self.failed_cache.remove(&start_pc);
                self.add_page_refs(&block);
                self.cache.insert(start_pc, block);
                EnsureResult::Compiled
            }
            Err(err) => {
                self.stats.compile_failures += 1;
                self.failed_cache.insert(start_pc);
                self.last_error = Some(err);
                EnsureResult::CompileFailed
            }
        }
    }

    /// Evict every block whose source range intersects `[start, start+len)`.
    /// Bumps the generation counter when anything was retired.
    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);

        // Page-bitmap short-circuit: most guest writes touch pages with no
        // cached code.
        let any_code = ((start >> PAGE_SHIFT)..=((end - 1) >> PAGE_SHIFT))
            .any(|page| self.page_refs.contains_key(&page));
        if !any_code && self.failed_cache.is_empty() {
            return;
        }

        let keys_to_drop: Vec<u32> = self
            .cache
            .iter()
            .filter_map(|(key, block)| {
                let overlap = block.start_pc < end && start < block.end_pc;
                overlap.then_some(*key)
            })
            .collect();

        let mut evicted = false;
        for key in keys_to_drop {
            if let Some(block) = self.cache.remove(&key) {
                self.drop_page_refs(&block);
                self.stats.invalidated_blocks += 1;
                evicted = true;
            }
        }

        let failed_to_drop: Vec<u32> = self
            .failed_cache
            .iter()
            .copied()
            .filter(|addr| *addr >= start && *addr < end)
            .collect();
        for key in failed_to_drop {
            self.failed_cache.remove(&key);
        }

        if evicted {
            self.generation += 1;
        }
    }

    /// Empty the cache and retire the backend's executable memory. In-flight
    /// chained jumps observe the generation bump and fall back to dispatcher
    /// lookup.
    pub fn flush_all(&mut self) {
        self.cache.clear();
        self.failed_cache.clear();
        self.page_refs.clear();
        self.generation += 1;
        self.stats.flushes += 1;
        self.compiler.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        words: HashMap<u32, u32>,
    }

    impl FixedSource {
        fn with_program(start: u32, words: &[u32]) -> Self {
            let mut map = HashMap::new();
            for (i, w) in words.iter().enumerate() {
                map.insert(start + (i as u32) * 4, *w);
            }
            Self { words: map }
        }
    }

    impl InstructionSource for FixedSource {
        fn read_u32(&mut self, pc: u32) -> Result<u32, CompileError> {
            self.words.get(&pc).copied().ok_or(CompileError::Fetch { pc })
        }
    }

    fn recompiler() -> Recompiler {
        Recompiler::new(
            Box::<CraneliftCompiler>::default(),
            RecompilerConfig { max_block_instructions: 64 },
        )
    }

    // addiu t0, t0, 1 x4 then jr ra / nop.
    fn simple_program() -> Vec<u32> {
        vec![
            0x2508_0001,
            0x2508_0001,
            0x2508_0001,
            0x2508_0001,
            0x03E0_0008,
            0x0000_0000,
        ]
    }

    #[test]
    fn ensure_compiled_caches_blocks() {
        let start = 0x0880_0000;
        let mut rec = recompiler();
        let mut src = FixedSource::with_program(start, &simple_program());

        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::Compiled);
        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::CacheHit);
        assert_eq!(rec.cache_len(), 1);
        assert_eq!(rec.stats().blocks_compiled, 1);
        assert_eq!(rec.stats().cache_hits, 1);

        let block = rec.lookup(start).unwrap();
        assert_eq!(block.instruction_count, 6);
        assert!(block.has_control_flow);
        assert!(rec.page_has_code(start));
        assert!(!rec.page_has_code(start + 0x10_0000));
    }

    #[test]
    fn failed_compiles_are_negatively_cached() {
        let start = 0x0880_1000;
        let mut rec = recompiler();
        // First word is a reserved SPECIAL encoding.
        let mut src = FixedSource::with_program(start, &[0x0000_0005]);

        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::CompileFailed);
        assert!(rec.is_failed_cached(start));
        assert!(matches!(rec.last_error(), Some(CompileError::Reserved { .. })));
        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::CacheHit);
        assert_eq!(rec.stats().failed_cache_hits, 1);
    }

    #[test]
    fn overlapping_write_evicts_and_bumps_generation() {
        let start = 0x0880_2000;
        let mut rec = recompiler();
        let mut src = FixedSource::with_program(start, &simple_program());
        rec.ensure_compiled(start, &mut src);
        let gen_before = rec.generation();

        // Write inside the block's source range.
        rec.invalidate_range(start + 8, 4);
        assert_eq!(rec.cache_len(), 0);
        assert!(rec.generation() > gen_before);
        assert_eq!(rec.stats().invalidated_blocks, 1);

        // A recompile after the write is a fresh block.
        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::Compiled);
    }

    #[test]
    fn non_overlapping_write_is_a_cheap_no_op() {
        let start = 0x0880_3000;
        let mut rec = recompiler();
        let mut src = FixedSource::with_program(start, &simple_program());
        rec.ensure_compiled(start, &mut src);
        let gen_before = rec.generation();

        // Different page entirely: the page bitmap short-circuits.
        rec.invalidate_range(0x0890_0000, 64);
        assert_eq!(rec.cache_len(), 1);
        assert_eq!(rec.generation(), gen_before);
        assert_eq!(rec.stats().invalidated_blocks, 0);
    }

    #[test]
    fn flush_all_empties_cache_and_bumps_generation() {
        let start = 0x0880_4000;
        let mut rec = recompiler();
        let mut src = FixedSource::with_program(start, &simple_program());
        rec.ensure_compiled(start, &mut src);
        let gen_before = rec.generation();

        rec.flush_all();
        assert_eq!(rec.cache_len(), 0);
        assert!(rec.generation() > gen_before);
        assert_eq!(rec.stats().flushes, 1);

        // The backend accepts new work after a flush.
        assert_eq!(rec.ensure_compiled(start, &mut src), EnsureResult::Compiled);
    }
}
