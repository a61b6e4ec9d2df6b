//! Cranelift backend: lowers a built block trace to host machine code.
//!
//! One IR function is emitted per guest basic block. The dispatcher calling
//! convention is part of the JIT ABI (`abi` module): the context pointer and
//! helper table arrive as arguments, fields are addressed by constant offset,
//! and the return value packs the exit reason with the next guest PC.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, AbiParam, Block, FuncRef, InstBuilder, MemFlags, Type, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};

use crate::abi::{BlockEntry, BlockExit, CompiledBlock, CpuContext, ExitReason, RuntimeHelpers};
use crate::builder::{build_trace, BlockTrace, ConstMap, TraceStep};
use crate::decode::{
    branch_is_likely, branch_link, op_def, op_is_pure, BranchKind, ExitOp, Op,
};
use crate::{BlockCompiler, CompileError, CompileRequest, InstructionSource};

/// Guest address mask folding the cached/uncached mirrors.
const SEGMENT_MASK: u32 = 0x3FFF_FFFF;

/// Cause codes delivered through trap exits (MIPS Cause.ExcCode values).
pub const EXC_OVERFLOW: u32 = 12;
pub const EXC_BREAKPOINT: u32 = 9;

// Bridges from generated code into the helper table. Generated code passes
// the helper-table pointer; the bridge forwards to the registered function
// with its `user` pointer.

unsafe extern "C" fn psp_jit_load_u8(helpers: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: generated code passes the helper-table pointer it was entered with.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: helper pointers are installed by the owning core.
    unsafe { (h.load_u8)(h.user, addr, pc) }
}

unsafe extern "C" fn psp_jit_load_u16(helpers: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.load_u16)(h.user, addr, pc) }
}

unsafe extern "C" fn psp_jit_load_u32(helpers: *mut u8, addr: u32, pc: u32) -> u32 {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.load_u32)(h.user, addr, pc) }
}

unsafe extern "C" fn psp_jit_store_u8(helpers: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.store_u8)(h.user, addr, value, pc) }
}

unsafe extern "C" fn psp_jit_store_u16(helpers: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.store_u16)(h.user, addr, value, pc) }
}

unsafe extern "C" fn psp_jit_store_u32(helpers: *mut u8, addr: u32, value: u32, pc: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.store_u32)(h.user, addr, value, pc) }
}

unsafe extern "C" fn psp_jit_cop0_read(helpers: *mut u8, reg: u32) -> u32 {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.cop0_read)(h.user, reg) }
}

unsafe extern "C" fn psp_jit_cop0_write(helpers: *mut u8, reg: u32, value: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.cop0_write)(h.user, reg, value) }
}

unsafe extern "C" fn psp_jit_syscall(helpers: *mut u8, sid: u32, pc: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.syscall)(h.user, sid, pc) }
}

unsafe extern "C" fn psp_jit_fallback_exec(helpers: *mut u8, raw: u32, pc: u32) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.fallback_exec)(h.user, raw, pc) }
}

unsafe extern "C" fn psp_jit_eret_target(helpers: *mut u8) -> u32 {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.eret_target)(h.user) }
}

unsafe extern "C" fn psp_jit_fpu_enter(helpers: *mut u8) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.fpu_enter)(h.user) }
}

unsafe extern "C" fn psp_jit_fpu_leave(helpers: *mut u8) {
    // SAFETY: as above.
    let h = unsafe { &*(helpers as *const RuntimeHelpers) };
    // SAFETY: as above.
    unsafe { (h.fpu_leave)(h.user) }
}

#[derive(Clone, Copy)]
struct HelperRefs {
    load_u8: FuncRef,
    load_u16: FuncRef,
    load_u32: FuncRef,
    store_u8: FuncRef,
    store_u16: FuncRef,
    store_u32: FuncRef,
    cop0_read: FuncRef,
    cop0_write: FuncRef,
    syscall: FuncRef,
    fallback_exec: FuncRef,
    eret_target: FuncRef,
    fpu_enter: FuncRef,
    fpu_leave: FuncRef,
}

#[derive(Clone, Copy)]
struct FastmemValues {
    base: Value,
    start: Value,
    len: Value,
}

/// Per-function emission state.
struct BlockEmitter<'a> {
    bcx: FunctionBuilder<'a>,
    ptr_ty: Type,
    ctx_ptr: Value,
    helpers_ptr: Value,
    helpers: HelperRefs,
    fastmem: FastmemValues,
    /// Flags for context-field access (always aligned, never trapping).
    ctx_flags: MemFlags,
    /// Flags for fastmem guest-memory access (may be unaligned).
    mem_flags: MemFlags,
    exit_block: Block,
}

impl BlockEmitter<'_> {
    fn iconst32(&mut self, value: u32) -> Value {
        self.bcx.ins().iconst(types::I32, i64::from(value as i32))
    }

    fn load_gpr(&mut self, reg: u8, consts: &ConstMap) -> Value {
        if reg == 0 {
            return self.iconst32(0);
        }
        if let Some(value) = consts[usize::from(reg)] {
            return self.iconst32(value);
        }
        self.bcx
            .ins()
            .load(types::I32, self.ctx_flags, self.ctx_ptr, CpuContext::gpr_offset(reg))
    }

    fn store_gpr(&mut self, reg: u8, value: Value) {
        if reg != 0 {
            self.bcx
                .ins()
                .store(self.ctx_flags, value, self.ctx_ptr, CpuContext::gpr_offset(reg));
        }
    }

    fn load_fpr_bits(&mut self, reg: u8) -> Value {
        self.bcx
            .ins()
            .load(types::I32, self.ctx_flags, self.ctx_ptr, CpuContext::fpr_offset(reg))
    }

    fn store_fpr_bits(&mut self, reg: u8, bits: Value) {
        self.bcx
            .ins()
            .store(self.ctx_flags, bits, self.ctx_ptr, CpuContext::fpr_offset(reg));
    }

    fn load_fpr_f32(&mut self, reg: u8) -> Value {
        let bits = self.load_fpr_bits(reg);
        self.bcx.ins().bitcast(types::F32, MemFlags::new(), bits)
    }

    fn store_fpr_f32(&mut self, reg: u8, value: Value) {
        let bits = self.bcx.ins().bitcast(types::I32, MemFlags::new(), value);
        self.store_fpr_bits(reg, bits);
    }

    fn load_hi(&mut self) -> Value {
        self.bcx
            .ins()
            .load(types::I32, self.ctx_flags, self.ctx_ptr, CpuContext::hi_offset())
    }

    fn store_hi(&mut self, value: Value) {
        self.bcx
            .ins()
            .store(self.ctx_flags, value, self.ctx_ptr, CpuContext::hi_offset());
    }

    fn load_lo(&mut self) -> Value {
        self.bcx
            .ins()
            .load(types::I32, self.ctx_flags, self.ctx_ptr, CpuContext::lo_offset())
    }

    fn store_lo(&mut self, value: Value) {
        self.bcx
            .ins()
            .store(self.ctx_flags, value, self.ctx_ptr, CpuContext::lo_offset());
    }

    fn load_fcr31(&mut self) -> Value {
        self.bcx
            .ins()
            .load(types::I32, self.ctx_flags, self.ctx_ptr, CpuContext::fcr31_offset())
    }

    fn store_fcr31(&mut self, value: Value) {
        self.bcx
            .ins()
            .store(self.ctx_flags, value, self.ctx_ptr, CpuContext::fcr31_offset());
    }

    /// Read the HI:LO pair as one 64-bit accumulator.
    fn load_acc(&mut self) -> Value {
        let hi = self.load_hi();
        let lo = self.load_lo();
        let hi64 = self.bcx.ins().uextend(types::I64, hi);
        let lo64 = self.bcx.ins().uextend(types::I64, lo);
        let hi_shifted = self.bcx.ins().ishl_imm(hi64, 32);
        self.bcx.ins().bor(hi_shifted, lo64)
    }

    fn store_acc(&mut self, acc: Value) {
        let lo = self.bcx.ins().ireduce(types::I32, acc);
        let hi64 = self.bcx.ins().ushr_imm(acc, 32);
        let hi = self.bcx.ins().ireduce(types::I32, hi64);
        self.store_lo(lo);
        self.store_hi(hi);
    }

    /// Pack (reason, payload, next_pc) into the block return value.
    fn pack_exit(&mut self, reason: ExitReason, payload: u32, next_pc: Value) -> Value {
        let pc64 = self.bcx.ins().uextend(types::I64, next_pc);
        let high = BlockExit::pack_high(reason, payload);
        if high == 0 {
            pc64
        } else {
            let high = self.bcx.ins().iconst(types::I64, high as i64);
            self.bcx.ins().bor(pc64, high)
        }
    }

    fn index_to_ptr(&mut self, index: Value) -> Value {
        if self.ptr_ty == types::I32 {
            index
        } else {
            self.bcx.ins().uextend(self.ptr_ty, index)
        }
    }

    /// Fold the cached/uncached mirrors and test for the main-RAM window.
    fn fastmem_guard(&mut self, addr: Value) -> (Value, Value) {
        let masked = self.bcx.ins().band_imm(addr, i64::from(SEGMENT_MASK));
        let off = self.bcx.ins().isub(masked, self.fastmem.start);
        let in_range = self
            .bcx
            .ins()
            .icmp(IntCC::UnsignedLessThan, off, self.fastmem.len);
        let off_ptr = self.index_to_ptr(off);
        let host_addr = self.bcx.ins().iadd(self.fastmem.base, off_ptr);
        (in_range, host_addr)
    }

    /// Emit a guest load: inline fast path for main RAM, helper otherwise.
    /// Returns the zero-extended 32-bit raw value.
    fn emit_load(&mut self, addr: Value, width: u8, helper: FuncRef, pc: Value) -> Value {
        let (in_range, host_addr) = self.fastmem_guard(addr);

        let fast_block = self.bcx.create_block();
        let slow_block = self.bcx.create_block();
        let done_block = self.bcx.create_block();
        self.bcx.append_block_param(done_block, types::I32);
        self.bcx
            .ins()
            .brif(in_range, fast_block, &[], slow_block, &[]);

        self.bcx.switch_to_block(fast_block);
        let fast_val = match width {
            1 => {
                let raw = self.bcx.ins().load(types::I8, self.mem_flags, host_addr, 0);
                self.bcx.ins().uextend(types::I32, raw)
            }
            2 => {
                let raw = self.bcx.ins().load(types::I16, self.mem_flags, host_addr, 0);
                self.bcx.ins().uextend(types::I32, raw)
            }
            4 => self.bcx.ins().load(types::I32, self.mem_flags, host_addr, 0),
            _ => unreachable!("unsupported load width"),
        };
        let args = [fast_val.into()];
        self.bcx.ins().jump(done_block, &args);

        self.bcx.switch_to_block(slow_block);
        let call = self.bcx.ins().call(helper, &[self.helpers_ptr, addr, pc]);
        let slow_val = self.bcx.inst_results(call)[0];
        let args = [slow_val.into()];
        self.bcx.ins().jump(done_block, &args);

        self.bcx.switch_to_block(done_block);
        self.bcx.block_params(done_block)[0]
    }

    /// Emit a guest store. Stores always take the helper so the memory map
    /// can invalidate code pages inline on the CPU thread.
    fn emit_store(&mut self, addr: Value, value: Value, helper: FuncRef, pc: Value) {
        self.bcx
            .ins()
            .call(helper, &[self.helpers_ptr, addr, value, pc]);
    }

    /// Compute an effective address, folding known-constant bases.
    fn effective_addr(&mut self, base: u8, imm: i16, consts: &ConstMap) -> Value {
        if let Some(base_val) = (base == 0).then_some(0).or(consts[usize::from(base)]) {
            return self.iconst32(base_val.wrapping_add(imm as u32));
        }
        let base_val = self.load_gpr(base, consts);
        self.bcx.ins().iadd_imm(base_val, i64::from(imm))
    }

    /// Overflow-trapping add/sub. Branches to the exit block with a trap
    /// exit when the 32-bit signed result overflows; the destination is left
    /// unwritten on that path.
    fn emit_trapping_arith(
        &mut self,
        lhs: Value,
        rhs: Value,
        is_sub: bool,
        dest: u8,
        epc: Value,
        bd: bool,
        retired: Value,
    ) {
        let l64 = self.bcx.ins().sextend(types::I64, lhs);
        let r64 = self.bcx.ins().sextend(types::I64, rhs);
        let (wide, narrow) = if is_sub {
            (self.bcx.ins().isub(l64, r64), self.bcx.ins().isub(lhs, rhs))
        } else {
            (self.bcx.ins().iadd(l64, r64), self.bcx.ins().iadd(lhs, rhs))
        };
        let renarrow = self.bcx.ins().sextend(types::I64, narrow);
        let overflow = self.bcx.ins().icmp(IntCC::NotEqual, wide, renarrow);

        let ok_block = self.bcx.create_block();
        let payload = EXC_OVERFLOW | if bd { crate::abi::TRAP_BD_BIT } else { 0 };
        let packed = self.pack_exit(ExitReason::Trap, payload, epc);
        let trap_args = [packed.into(), retired.into()];
        self.bcx
            .ins()
            .brif(overflow, self.exit_block, &trap_args, ok_block, &[]);

        self.bcx.switch_to_block(ok_block);
        self.store_gpr(dest, narrow);
    }

    /// Lower one straight-line op.
    ///
    /// `pc` is the op's own address; `epc`/`bd` identify the instruction to
    /// report if the op traps (the branch PC for delay-slot ops). `retired`
    /// is the count of instructions completed before this one.
    #[allow(clippy::too_many_arguments)]
    fn emit_op(
        &mut self,
        op: Op,
        pc: Value,
        epc: Value,
        bd: bool,
        consts: &ConstMap,
        live_out: u32,
        retired: Value,
    ) {
        // A pure op whose only def is provably dead within the block emits
        // nothing.
        if op_is_pure(op) {
            if let Some(def) = op_def(op) {
                if live_out & (1u32 << def) == 0 {
                    return;
                }
            }
        }

        match op {
            Op::Addi { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.iconst32(imm as u32);
                self.emit_trapping_arith(lhs, rhs, false, rt, epc, bd, retired);
            }
            Op::Addiu { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let sum = self.bcx.ins().iadd_imm(lhs, i64::from(imm));
                self.store_gpr(rt, sum);
            }
            Op::Slti { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let cmp = self
                    .bcx
                    .ins()
                    .icmp_imm(IntCC::SignedLessThan, lhs, i64::from(imm));
                let result = self.bcx.ins().uextend(types::I32, cmp);
                self.store_gpr(rt, result);
            }
            Op::Sltiu { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                // The immediate is sign-extended, then compared unsigned.
                let cmp = self.bcx.ins().icmp_imm(
                    IntCC::UnsignedLessThan,
                    lhs,
                    i64::from(imm as u32 as i32),
                );
                let result = self.bcx.ins().uextend(types::I32, cmp);
                self.store_gpr(rt, result);
            }
            Op::Andi { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let result = self.bcx.ins().band_imm(lhs, i64::from(imm));
                self.store_gpr(rt, result);
            }
            Op::Ori { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let result = self.bcx.ins().bor_imm(lhs, i64::from(imm));
                self.store_gpr(rt, result);
            }
            Op::Xori { rs, rt, imm } => {
                let lhs = self.load_gpr(rs, consts);
                let result = self.bcx.ins().bxor_imm(lhs, i64::from(imm));
                self.store_gpr(rt, result);
            }
            Op::Lui { rt, imm } => {
                let value = self.iconst32((imm as u32) << 16);
                self.store_gpr(rt, value);
            }
            Op::Add { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                self.emit_trapping_arith(lhs, rhs, false, rd, epc, bd, retired);
            }
            Op::Sub { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                self.emit_trapping_arith(lhs, rhs, true, rd, epc, bd, retired);
            }
            Op::Addu { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().iadd(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Subu { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().isub(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::And { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().band(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Or { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().bor(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Xor { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().bxor(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Nor { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let or_val = self.bcx.ins().bor(lhs, rhs);
                let result = self.bcx.ins().bnot(or_val);
                self.store_gpr(rd, result);
            }
            Op::Slt { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let cmp = self.bcx.ins().icmp(IntCC::SignedLessThan, lhs, rhs);
                let result = self.bcx.ins().uextend(types::I32, cmp);
                self.store_gpr(rd, result);
            }
            Op::Sltu { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let cmp = self.bcx.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs);
                let result = self.bcx.ins().uextend(types::I32, cmp);
                self.store_gpr(rd, result);
            }
            Op::Max { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().smax(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Min { rs, rt, rd } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let result = self.bcx.ins().smin(lhs, rhs);
                self.store_gpr(rd, result);
            }
            Op::Clz { rs, rd } => {
                let value = self.load_gpr(rs, consts);
                let result = self.bcx.ins().clz(value);
                self.store_gpr(rd, result);
            }
            Op::Clo { rs, rd } => {
                let value = self.load_gpr(rs, consts);
                let inverted = self.bcx.ins().bnot(value);
                let result = self.bcx.ins().clz(inverted);
                self.store_gpr(rd, result);
            }
            Op::Sll { rt, rd, sa } => {
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().ishl_imm(value, i64::from(sa));
                self.store_gpr(rd, result);
            }
            Op::Srl { rt, rd, sa } => {
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().ushr_imm(value, i64::from(sa));
                self.store_gpr(rd, result);
            }
            Op::Sra { rt, rd, sa } => {
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().sshr_imm(value, i64::from(sa));
                self.store_gpr(rd, result);
            }
            Op::Rotr { rt, rd, sa } => {
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().rotr_imm(value, i64::from(sa));
                self.store_gpr(rd, result);
            }
            Op::Sllv { rs, rt, rd } => {
                let amount = self.load_gpr(rs, consts);
                let amount = self.bcx.ins().band_imm(amount, 0x1F);
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().ishl(value, amount);
                self.store_gpr(rd, result);
            }
            Op::Srlv { rs, rt, rd } => {
                let amount = self.load_gpr(rs, consts);
                let amount = self.bcx.ins().band_imm(amount, 0x1F);
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().ushr(value, amount);
                self.store_gpr(rd, result);
            }
            Op::Srav { rs, rt, rd } => {
                let amount = self.load_gpr(rs, consts);
                let amount = self.bcx.ins().band_imm(amount, 0x1F);
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().sshr(value, amount);
                self.store_gpr(rd, result);
            }
            Op::Rotrv { rs, rt, rd } => {
                let amount = self.load_gpr(rs, consts);
                let amount = self.bcx.ins().band_imm(amount, 0x1F);
                let value = self.load_gpr(rt, consts);
                let result = self.bcx.ins().rotr(value, amount);
                self.store_gpr(rd, result);
            }
            Op::Ext { rs, rt, lsb, size } => {
                let mask = ((1u64 << size) - 1) as u32;
                let value = self.load_gpr(rs, consts);
                let shifted = self.bcx.ins().ushr_imm(value, i64::from(lsb));
                let result = self.bcx.ins().band_imm(shifted, i64::from(mask as i32));
                self.store_gpr(rt, result);
            }
            Op::Ins { rs, rt, lsb, size } => {
                let field_mask = (((1u64 << size) - 1) as u32) << lsb;
                let old = self.load_gpr(rt, consts);
                let kept = self.bcx.ins().band_imm(old, i64::from(!field_mask as i32));
                let src = self.load_gpr(rs, consts);
                let shifted = self.bcx.ins().ishl_imm(src, i64::from(lsb));
                let field = self
                    .bcx
                    .ins()
                    .band_imm(shifted, i64::from(field_mask as i32));
                let result = self.bcx.ins().bor(kept, field);
                self.store_gpr(rt, result);
            }
            Op::Seb { rt, rd } => {
                let value = self.load_gpr(rt, consts);
                let low = self.bcx.ins().ireduce(types::I8, value);
                let result = self.bcx.ins().sextend(types::I32, low);
                self.store_gpr(rd, result);
            }
            Op::Seh { rt, rd } => {
                let value = self.load_gpr(rt, consts);
                let low = self.bcx.ins().ireduce(types::I16, value);
                let result = self.bcx.ins().sextend(types::I32, low);
                self.store_gpr(rd, result);
            }
            Op::Wsbh { rt, rd } => {
                // Swap bytes within each halfword.
                let value = self.load_gpr(rt, consts);
                let lows = self.bcx.ins().band_imm(value, 0x00FF_00FF);
                let lows_up = self.bcx.ins().ishl_imm(lows, 8);
                let highs = self.bcx.ins().ushr_imm(value, 8);
                let highs_masked = self.bcx.ins().band_imm(highs, 0x00FF_00FF);
                let result = self.bcx.ins().bor(lows_up, highs_masked);
                self.store_gpr(rd, result);
            }
            Op::Mfhi { rd } => {
                let value = self.load_hi();
                self.store_gpr(rd, value);
            }
            Op::Mthi { rs } => {
                let value = self.load_gpr(rs, consts);
                self.store_hi(value);
            }
            Op::Mflo { rd } => {
                let value = self.load_lo();
                self.store_gpr(rd, value);
            }
            Op::Mtlo { rs } => {
                let value = self.load_gpr(rs, consts);
                self.store_lo(value);
            }
            Op::Mult { rs, rt } | Op::Multu { rs, rt } => {
                let signed = matches!(op, Op::Mult { .. });
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let (l64, r64) = if signed {
                    (
                        self.bcx.ins().sextend(types::I64, lhs),
                        self.bcx.ins().sextend(types::I64, rhs),
                    )
                } else {
                    (
                        self.bcx.ins().uextend(types::I64, lhs),
                        self.bcx.ins().uextend(types::I64, rhs),
                    )
                };
                let product = self.bcx.ins().imul(l64, r64);
                self.store_acc(product);
            }
            Op::Madd { rs, rt } | Op::Maddu { rs, rt } | Op::Msub { rs, rt } | Op::Msubu { rs, rt } => {
                let signed = matches!(op, Op::Madd { .. } | Op::Msub { .. });
                let subtract = matches!(op, Op::Msub { .. } | Op::Msubu { .. });
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let (l64, r64) = if signed {
                    (
                        self.bcx.ins().sextend(types::I64, lhs),
                        self.bcx.ins().sextend(types::I64, rhs),
                    )
                } else {
                    (
                        self.bcx.ins().uextend(types::I64, lhs),
                        self.bcx.ins().uextend(types::I64, rhs),
                    )
                };
                let product = self.bcx.ins().imul(l64, r64);
                let acc = self.load_acc();
                let result = if subtract {
                    self.bcx.ins().isub(acc, product)
                } else {
                    self.bcx.ins().iadd(acc, product)
                };
                self.store_acc(result);
            }
            Op::Div { rs, rt } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let is_zero = self.bcx.ins().icmp_imm(IntCC::Equal, rhs, 0);
                let is_min = self
                    .bcx
                    .ins()
                    .icmp_imm(IntCC::Equal, lhs, i64::from(i32::MIN));
                let is_neg_one = self.bcx.ins().icmp_imm(IntCC::Equal, rhs, -1);
                let is_overflow = self.bcx.ins().band(is_min, is_neg_one);
                let skip = self.bcx.ins().bor(is_zero, is_overflow);
                let one = self.iconst32(1);
                let safe_rhs = self.bcx.ins().select(skip, one, rhs);
                let quot = self.bcx.ins().sdiv(lhs, safe_rhs);
                let rem = self.bcx.ins().srem(lhs, safe_rhs);
                // Division corner cases leave HI/LO unchanged, matching the
                // interpreter.
                let old_lo = self.load_lo();
                let old_hi = self.load_hi();
                let lo = self.bcx.ins().select(skip, old_lo, quot);
                let hi = self.bcx.ins().select(skip, old_hi, rem);
                self.store_lo(lo);
                self.store_hi(hi);
            }
            Op::Divu { rs, rt } => {
                let lhs = self.load_gpr(rs, consts);
                let rhs = self.load_gpr(rt, consts);
                let is_zero = self.bcx.ins().icmp_imm(IntCC::Equal, rhs, 0);
                let one = self.iconst32(1);
                let safe_rhs = self.bcx.ins().select(is_zero, one, rhs);
                let quot = self.bcx.ins().udiv(lhs, safe_rhs);
                let rem = self.bcx.ins().urem(lhs, safe_rhs);
                let old_lo = self.load_lo();
                let old_hi = self.load_hi();
                let lo = self.bcx.ins().select(is_zero, old_lo, quot);
                let hi = self.bcx.ins().select(is_zero, old_hi, rem);
                self.store_lo(lo);
                self.store_hi(hi);
            }
            Op::Lb { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let raw = self.emit_load(addr, 1, self.helpers.load_u8, pc);
                let narrow = self.bcx.ins().ireduce(types::I8, raw);
                let value = self.bcx.ins().sextend(types::I32, narrow);
                self.store_gpr(rt, value);
            }
            Op::Lbu { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.emit_load(addr, 1, self.helpers.load_u8, pc);
                self.store_gpr(rt, value);
            }
            Op::Lh { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let raw = self.emit_load(addr, 2, self.helpers.load_u16, pc);
                let narrow = self.bcx.ins().ireduce(types::I16, raw);
                let value = self.bcx.ins().sextend(types::I32, narrow);
                self.store_gpr(rt, value);
            }
            Op::Lhu { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.emit_load(addr, 2, self.helpers.load_u16, pc);
                self.store_gpr(rt, value);
            }
            Op::Lw { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.emit_load(addr, 4, self.helpers.load_u32, pc);
                self.store_gpr(rt, value);
            }
            Op::Sb { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.load_gpr(rt, consts);
                self.emit_store(addr, value, self.helpers.store_u8, pc);
            }
            Op::Sh { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.load_gpr(rt, consts);
                self.emit_store(addr, value, self.helpers.store_u16, pc);
            }
            Op::Sw { base, rt, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.load_gpr(rt, consts);
                self.emit_store(addr, value, self.helpers.store_u32, pc);
            }
            Op::Lwc1 { base, ft, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.emit_load(addr, 4, self.helpers.load_u32, pc);
                self.store_fpr_bits(ft, value);
            }
            Op::Swc1 { base, ft, imm } => {
                let addr = self.effective_addr(base, imm, consts);
                let value = self.load_fpr_bits(ft);
                self.emit_store(addr, value, self.helpers.store_u32, pc);
            }
            Op::Mfc0 { rt, rd } => {
                let reg = self.iconst32(u32::from(rd));
                let call = self
                    .bcx
                    .ins()
                    .call(self.helpers.cop0_read, &[self.helpers_ptr, reg]);
                let value = self.bcx.inst_results(call)[0];
                self.store_gpr(rt, value);
            }
            Op::Mtc0 { rt, rd } => {
                let reg = self.iconst32(u32::from(rd));
                let value = self.load_gpr(rt, consts);
                self.bcx
                    .ins()
                    .call(self.helpers.cop0_write, &[self.helpers_ptr, reg, value]);
            }
            Op::Mfc1 { rt, fs } => {
                let bits = self.load_fpr_bits(fs);
                self.store_gpr(rt, bits);
            }
            Op::Mtc1 { rt, fs } => {
                let value = self.load_gpr(rt, consts);
                self.store_fpr_bits(fs, value);
            }
            Op::Cfc1 { rt, fs } => {
                let value = if fs == 31 {
                    self.load_fcr31()
                } else {
                    self.iconst32(0)
                };
                self.store_gpr(rt, value);
            }
            Op::Ctc1 { rt, fs } => {
                if fs == 31 {
                    let value = self.load_gpr(rt, consts);
                    self.store_fcr31(value);
                }
            }
            Op::AddS { fd, fs, ft } => {
                let lhs = self.load_fpr_f32(fs);
                let rhs = self.load_fpr_f32(ft);
                let result = self.bcx.ins().fadd(lhs, rhs);
                self.store_fpr_f32(fd, result);
            }
            Op::SubS { fd, fs, ft } => {
                let lhs = self.load_fpr_f32(fs);
                let rhs = self.load_fpr_f32(ft);
                let result = self.bcx.ins().fsub(lhs, rhs);
                self.store_fpr_f32(fd, result);
            }
            Op::MulS { fd, fs, ft } => {
                let lhs = self.load_fpr_f32(fs);
                let rhs = self.load_fpr_f32(ft);
                let result = self.bcx.ins().fmul(lhs, rhs);
                self.store_fpr_f32(fd, result);
            }
            Op::DivS { fd, fs, ft } => {
                let lhs = self.load_fpr_f32(fs);
                let rhs = self.load_fpr_f32(ft);
                let result = self.bcx.ins().fdiv(lhs, rhs);
                self.store_fpr_f32(fd, result);
            }
            Op::SqrtS { fd, fs } => {
                let value = self.load_fpr_f32(fs);
                let result = self.bcx.ins().sqrt(value);
                self.store_fpr_f32(fd, result);
            }
            Op::AbsS { fd, fs } => {
                let value = self.load_fpr_f32(fs);
                let result = self.bcx.ins().fabs(value);
                self.store_fpr_f32(fd, result);
            }
            Op::MovS { fd, fs } => {
                let bits = self.load_fpr_bits(fs);
                self.store_fpr_bits(fd, bits);
            }
            Op::NegS { fd, fs } => {
                let value = self.load_fpr_f32(fs);
                let result = self.bcx.ins().fneg(value);
                self.store_fpr_f32(fd, result);
            }
            Op::TruncWS { fd, fs } => {
                let value = self.load_fpr_f32(fs);
                let result = self.bcx.ins().fcvt_to_sint_sat(types::I32, value);
                self.store_fpr_bits(fd, result);
            }
            Op::CvtSW { fd, fs } => {
                let bits = self.load_fpr_bits(fs);
                let result = self.bcx.ins().fcvt_from_sint(types::F32, bits);
                self.store_fpr_f32(fd, result);
            }
            Op::CCondS { cond, fs, ft } => {
                let lhs = self.load_fpr_f32(fs);
                let rhs = self.load_fpr_f32(ft);
                // Predicate field: bit 0 = unordered, bits 2:1 = {eq, lt}.
                // Signaling variants (bit 3) share the predicate.
                let cc = match cond & 0x7 {
                    0x0 => None,
                    0x1 => Some(FloatCC::Unordered),
                    0x2 => Some(FloatCC::Equal),
                    0x3 => Some(FloatCC::UnorderedOrEqual),
                    0x4 => Some(FloatCC::LessThan),
                    0x5 => Some(FloatCC::UnorderedOrLessThan),
                    0x6 => Some(FloatCC::LessThanOrEqual),
                    _ => Some(FloatCC::UnorderedOrLessThanOrEqual),
                };
                let flag = match cc {
                    Some(cc) => {
                        let cmp = self.bcx.ins().fcmp(cc, lhs, rhs);
                        let bit = self.iconst32(1 << 23);
                        let zero = self.iconst32(0);
                        self.bcx.ins().select(cmp, bit, zero)
                    }
                    None => self.iconst32(0),
                };
                let fcr = self.load_fcr31();
                let cleared = self.bcx.ins().band_imm(fcr, i64::from(!(1u32 << 23) as i32));
                let result = self.bcx.ins().bor(cleared, flag);
                self.store_fcr31(result);
            }
            Op::Syscall { code } => {
                // Reached only as the delay slot of `jr $ra`; the branch
                // emitter wires the exit.
                let sid = self.iconst32(code);
                self.bcx
                    .ins()
                    .call(self.helpers.syscall, &[self.helpers_ptr, sid, pc]);
            }
            Op::Break { .. } => {
                unreachable!("BREAK is never a straight-line op")
            }
            Op::HostStep { raw } => {
                let raw = self.iconst32(raw);
                self.bcx
                    .ins()
                    .call(self.helpers.fallback_exec, &[self.helpers_ptr, raw, pc]);
            }
            Op::Sync | Op::CacheOp | Op::Nop => {}
        }
    }
}

/// Condition shape of a conditional branch.
enum BranchCond {
    Cmp(IntCC, u8, u8),
    CmpZero(IntCC, u8),
    Cop1 { expect_set: bool },
}

fn branch_cond(branch: BranchKind) -> Option<(BranchCond, i16)> {
    use BranchKind::*;
    Some(match branch {
        Beq { rs, rt, offset } | Beql { rs, rt, offset } => {
            (BranchCond::Cmp(IntCC::Equal, rs, rt), offset)
        }
        Bne { rs, rt, offset } | Bnel { rs, rt, offset } => {
            (BranchCond::Cmp(IntCC::NotEqual, rs, rt), offset)
        }
        Blez { rs, offset } | Blezl { rs, offset } => {
            (BranchCond::CmpZero(IntCC::SignedLessThanOrEqual, rs), offset)
        }
        Bgtz { rs, offset } | Bgtzl { rs, offset } => {
            (BranchCond::CmpZero(IntCC::SignedGreaterThan, rs), offset)
        }
        Bltz { rs, offset } | Bltzl { rs, offset } | Bltzal { rs, offset } => {
            (BranchCond::CmpZero(IntCC::SignedLessThan, rs), offset)
        }
        Bgez { rs, offset } | Bgezl { rs, offset } | Bgezal { rs, offset } => {
            (BranchCond::CmpZero(IntCC::SignedGreaterThanOrEqual, rs), offset)
        }
        Bc1f { offset } | Bc1fl { offset } => (BranchCond::Cop1 { expect_set: false }, offset),
        Bc1t { offset } | Bc1tl { offset } => (BranchCond::Cop1 { expect_set: true }, offset),
        J { .. } | Jal { .. } | Jr { .. } | Jalr { .. } => return None,
    })
}

/// Cranelift backend compiler.
pub struct CraneliftCompiler {
    module: JITModule,
    context: cranelift_codegen::Context,
    builder_context: FunctionBuilderContext,
    load_u8_id: FuncId,
    load_u16_id: FuncId,
    load_u32_id: FuncId,
    store_u8_id: FuncId,
    store_u16_id: FuncId,
    store_u32_id: FuncId,
    cop0_read_id: FuncId,
    cop0_write_id: FuncId,
    syscall_id: FuncId,
    fallback_exec_id: FuncId,
    eret_target_id: FuncId,
    fpu_enter_id: FuncId,
    fpu_leave_id: FuncId,
    next_symbol_id: u64,
}

impl Default for CraneliftCompiler {
    fn default() -> Self {
        let env_level = std::env::var("PSP_DYNAREC_OPT_LEVEL")
            .unwrap_or_else(|_| "speed".to_string())
            .to_ascii_lowercase();
        let opt_level = match env_level.as_str() {
            "none" => "none",
            "speed_and_size" | "speed-size" => "speed_and_size",
            "speed" => "speed",
            other => {
                log::warn!("Unknown PSP_DYNAREC_OPT_LEVEL={:?}; using \"speed\"", other);
                "speed"
            }
        };

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level)
            .expect("set cranelift opt_level");
        let flags = settings::Flags::new(flag_builder);

        let isa_builder = cranelift_native::builder().expect("create host ISA builder");
        let isa = isa_builder.finish(flags).expect("finish host ISA");
        let mut jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
        jit_builder.symbol("psp_jit_load_u8", psp_jit_load_u8 as *const u8);
        jit_builder.symbol("psp_jit_load_u16", psp_jit_load_u16 as *const u8);
        jit_builder.symbol("psp_jit_load_u32", psp_jit_load_u32 as *const u8);
        jit_builder.symbol("psp_jit_store_u8", psp_jit_store_u8 as *const u8);
        jit_builder.symbol("psp_jit_store_u16", psp_jit_store_u16 as *const u8);
        jit_builder.symbol("psp_jit_store_u32", psp_jit_store_u32 as *const u8);
        jit_builder.symbol("psp_jit_cop0_read", psp_jit_cop0_read as *const u8);
        jit_builder.symbol("psp_jit_cop0_write", psp_jit_cop0_write as *const u8);
        jit_builder.symbol("psp_jit_syscall", psp_jit_syscall as *const u8);
        jit_builder.symbol("psp_jit_fallback_exec", psp_jit_fallback_exec as *const u8);
        jit_builder.symbol("psp_jit_eret_target", psp_jit_eret_target as *const u8);
        jit_builder.symbol("psp_jit_fpu_enter", psp_jit_fpu_enter as *const u8);
        jit_builder.symbol("psp_jit_fpu_leave", psp_jit_fpu_leave as *const u8);
        let mut module = JITModule::new(jit_builder);
        let ptr_ty = module.target_config().pointer_type();

        let mut load_sig = module.make_signature();
        load_sig.params.push(AbiParam::new(ptr_ty));
        load_sig.params.push(AbiParam::new(types::I32));
        load_sig.params.push(AbiParam::new(types::I32));
        load_sig.returns.push(AbiParam::new(types::I32));

        let mut store_sig = module.make_signature();
        store_sig.params.push(AbiParam::new(ptr_ty));
        store_sig.params.push(AbiParam::new(types::I32));
        store_sig.params.push(AbiParam::new(types::I32));
        store_sig.params.push(AbiParam::new(types::I32));

        let mut cop0_read_sig = module.make_signature();
        cop0_read_sig.params.push(AbiParam::new(ptr_ty));
        cop0_read_sig.params.push(AbiParam::new(types::I32));
        cop0_read_sig.returns.push(AbiParam::new(types::I32));

        let mut cop0_write_sig = module.make_signature();
        cop0_write_sig.params.push(AbiParam::new(ptr_ty));
        cop0_write_sig.params.push(AbiParam::new(types::I32));
        cop0_write_sig.params.push(AbiParam::new(types::I32));

        let mut binary_sig = module.make_signature();
        binary_sig.params.push(AbiParam::new(ptr_ty));
        binary_sig.params.push(AbiParam::new(types::I32));
        binary_sig.params.push(AbiParam::new(types::I32));

        let mut ctx_ret_sig = module.make_signature();
        ctx_ret_sig.params.push(AbiParam::new(ptr_ty));
        ctx_ret_sig.returns.push(AbiParam::new(types::I32));

        let mut ctx_only_sig = module.make_signature();
        ctx_only_sig.params.push(AbiParam::new(ptr_ty));

        let declare = |module: &mut JITModule, name: &str, sig: &cranelift_codegen::ir::Signature| {
            module
                .declare_function(name, Linkage::Import, sig)
                .unwrap_or_else(|e| panic!("declare {name}: {e}"))
        };

        let load_u8_id = declare(&mut module, "psp_jit_load_u8", &load_sig);
        let load_u16_id = declare(&mut module, "psp_jit_load_u16", &load_sig);
        let load_u32_id = declare(&mut module, "psp_jit_load_u32", &load_sig);
        let store_u8_id = declare(&mut module, "psp_jit_store_u8", &store_sig);
        let store_u16_id = declare(&mut module, "psp_jit_store_u16", &store_sig);
        let store_u32_id = declare(&mut module, "psp_jit_store_u32", &store_sig);
        let cop0_read_id = declare(&mut module, "psp_jit_cop0_read", &cop0_read_sig);
        let cop0_write_id = declare(&mut module, "psp_jit_cop0_write", &cop0_write_sig);
        let syscall_id = declare(&mut module, "psp_jit_syscall", &binary_sig);
        let fallback_exec_id = declare(&mut module, "psp_jit_fallback_exec", &binary_sig);
        let eret_target_id = declare(&mut module, "psp_jit_eret_target", &ctx_ret_sig);
        let fpu_enter_id = declare(&mut module, "psp_jit_fpu_enter", &ctx_only_sig);
        let fpu_leave_id = declare(&mut module, "psp_jit_fpu_leave", &ctx_only_sig);

        let context = module.make_context();

        Self {
            module,
            context,
            builder_context: FunctionBuilderContext::new(),
            load_u8_id,
            load_u16_id,
            load_u32_id,
            store_u8_id,
            store_u16_id,
            store_u32_id,
            cop0_read_id,
            cop0_write_id,
            syscall_id,
            fallback_exec_id,
            eret_target_id,
            fpu_enter_id,
            fpu_leave_id,
            next_symbol_id: 0,
        }
    }
}

fn op_touches_fpu(op: Op) -> bool {
    matches!(
        op,
        Op::AddS { .. }
            | Op::SubS { .. }
            | Op::MulS { .. }
            | Op::DivS { .. }
            | Op::SqrtS { .. }
            | Op::AbsS { .. }
            | Op::NegS { .. }
            | Op::TruncWS { .. }
            | Op::CvtSW { .. }
            | Op::CCondS { .. }
    )
}

fn trace_touches_fpu(trace: &BlockTrace) -> bool {
    trace.steps.iter().any(|step| match *step {
        TraceStep::Op { op, .. } => op_touches_fpu(op),
        TraceStep::Branch { delay_op, .. } => op_touches_fpu(delay_op),
        TraceStep::Exit { .. } => false,
    })
}

impl BlockCompiler for CraneliftCompiler {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile(
        &mut self,
        request: &CompileRequest,
        source: &mut dyn InstructionSource,
    ) -> Result<CompiledBlock, CompileError> {
        let trace = build_trace(request, source)?;
        let has_fpu = trace_touches_fpu(&trace);

        self.context.clear();
        let ptr_ty = self.module.target_config().pointer_type();
        let sig = &mut self.context.func.signature;
        sig.params.clear();
        sig.returns.clear();
        sig.params.push(AbiParam::new(ptr_ty)); // *mut CpuContext
        sig.params.push(AbiParam::new(ptr_ty)); // *mut RuntimeHelpers
        sig.params.push(AbiParam::new(types::I32)); // start_pc
        sig.params.push(AbiParam::new(ptr_ty)); // *mut u32 retired_out
        sig.returns.push(AbiParam::new(types::I64));

        let mut bcx = FunctionBuilder::new(&mut self.context.func, &mut self.builder_context);
        let entry_block = bcx.create_block();
        bcx.append_block_params_for_function_params(entry_block);
        bcx.switch_to_block(entry_block);

        let ctx_ptr = bcx.block_params(entry_block)[0];
        let helpers_ptr = bcx.block_params(entry_block)[1];
        let start_pc = bcx.block_params(entry_block)[2];
        let retired_out = bcx.block_params(entry_block)[3];

        let mut ctx_flags = MemFlags::new();
        ctx_flags.set_notrap();
        ctx_flags.set_aligned();
        let mut mem_flags = MemFlags::new();
        mem_flags.set_notrap();

        let fastmem_base = bcx.ins().load(
            ptr_ty,
            ctx_flags,
            helpers_ptr,
            std::mem::offset_of!(RuntimeHelpers, fastmem_base) as i32,
        );
        let fastmem_start = bcx.ins().load(
            types::I32,
            ctx_flags,
            helpers_ptr,
            std::mem::offset_of!(RuntimeHelpers, fastmem_start) as i32,
        );
        let fastmem_len = bcx.ins().load(
            types::I32,
            ctx_flags,
            helpers_ptr,
            std::mem::offset_of!(RuntimeHelpers, fastmem_len) as i32,
        );

        // Break-flag poll: leave before retiring anything if a stop was
        // requested.
        let break_ptr = bcx.ins().load(
            ptr_ty,
            ctx_flags,
            helpers_ptr,
            std::mem::offset_of!(RuntimeHelpers, break_flag) as i32,
        );
        let break_val = bcx.ins().load(types::I32, ctx_flags, break_ptr, 0);
        let break_requested = bcx.ins().icmp_imm(IntCC::NotEqual, break_val, 0);
        let break_block = bcx.create_block();
        let body_block = bcx.create_block();
        bcx.ins()
            .brif(break_requested, break_block, &[], body_block, &[]);

        bcx.switch_to_block(break_block);
        let pc64 = bcx.ins().uextend(types::I64, start_pc);
        let high = bcx.ins().iconst(
            types::I64,
            BlockExit::pack_high(ExitReason::HostBreak, 0) as i64,
        );
        let packed_break = bcx.ins().bor(pc64, high);
        let zero32 = bcx.ins().iconst(types::I32, 0);
        bcx.ins().store(ctx_flags, zero32, retired_out, 0);
        bcx.ins().return_(&[packed_break]);

        bcx.switch_to_block(body_block);

        let helpers = HelperRefs {
            load_u8: self.module.declare_func_in_func(self.load_u8_id, bcx.func),
            load_u16: self.module.declare_func_in_func(self.load_u16_id, bcx.func),
            load_u32: self.module.declare_func_in_func(self.load_u32_id, bcx.func),
            store_u8: self.module.declare_func_in_func(self.store_u8_id, bcx.func),
            store_u16: self.module.declare_func_in_func(self.store_u16_id, bcx.func),
            store_u32: self.module.declare_func_in_func(self.store_u32_id, bcx.func),
            cop0_read: self.module.declare_func_in_func(self.cop0_read_id, bcx.func),
            cop0_write: self
                .module
                .declare_func_in_func(self.cop0_write_id, bcx.func),
            syscall: self.module.declare_func_in_func(self.syscall_id, bcx.func),
            fallback_exec: self
                .module
                .declare_func_in_func(self.fallback_exec_id, bcx.func),
            eret_target: self
                .module
                .declare_func_in_func(self.eret_target_id, bcx.func),
            fpu_enter: self.module.declare_func_in_func(self.fpu_enter_id, bcx.func),
            fpu_leave: self.module.declare_func_in_func(self.fpu_leave_id, bcx.func),
        };

        if has_fpu {
            bcx.ins().call(helpers.fpu_enter, &[helpers_ptr]);
        }

        // Exit block: (packed result, retired count).
        let exit_block = bcx.create_block();
        bcx.append_block_param(exit_block, types::I64);
        bcx.append_block_param(exit_block, types::I32);

        let step_blocks: Vec<Block> = trace
            .steps
            .iter()
            .map(|_| {
                let block = bcx.create_block();
                bcx.append_block_param(block, types::I32);
                block
            })
            .collect();

        let mut pc_to_index = HashMap::with_capacity(trace.steps.len());
        for (idx, step) in trace.steps.iter().enumerate() {
            pc_to_index.insert(step.pc(), idx);
        }

        let zero_retired = bcx.ins().iconst(types::I32, 0);
        let args = [zero_retired.into()];
        bcx.ins().jump(step_blocks[0], &args);

        let mut em = BlockEmitter {
            bcx,
            ptr_ty,
            ctx_ptr,
            helpers_ptr,
            helpers,
            fastmem: FastmemValues {
                base: fastmem_base,
                start: fastmem_start,
                len: fastmem_len,
            },
            ctx_flags,
            mem_flags,
            exit_block,
        };

        for (step_idx, step) in trace.steps.iter().enumerate() {
            let step_block = step_blocks[step_idx];
            em.bcx.switch_to_block(step_block);
            let retired = em.bcx.block_params(step_block)[0];
            let delta = i64::from(step.pc().wrapping_sub(trace.start_pc));
            let current_pc = em.bcx.ins().iadd_imm(start_pc, delta);
            let consts = &trace.consts_in[step_idx];
            let live_out = trace.live_out[step_idx];

            match *step {
                TraceStep::Op { op, .. } => {
                    em.emit_op(op, current_pc, current_pc, false, consts, live_out, retired);
                    let retired_after = em.bcx.ins().iadd_imm(retired, 1);
                    if let Some(next_block) = step_blocks.get(step_idx + 1).copied() {
                        let args = [retired_after.into()];
                        em.bcx.ins().jump(next_block, &args);
                    } else {
                        let next_pc = em.bcx.ins().iadd_imm(current_pc, 4);
                        let packed = em.pack_exit(ExitReason::Normal, 0, next_pc);
                        let args = [packed.into(), retired_after.into()];
                        em.bcx.ins().jump(exit_block, &args);
                    }
                }
                TraceStep::Exit { exit, .. } => match exit {
                    ExitOp::Syscall { code } => {
                        let sid = em.iconst32(code);
                        em.bcx
                            .ins()
                            .call(em.helpers.syscall, &[em.helpers_ptr, sid, current_pc]);
                        let next_pc = em.bcx.ins().iadd_imm(current_pc, 4);
                        let retired_after = em.bcx.ins().iadd_imm(retired, 1);
                        let packed = em.pack_exit(ExitReason::Syscall, code, next_pc);
                        let args = [packed.into(), retired_after.into()];
                        em.bcx.ins().jump(exit_block, &args);
                    }
                    ExitOp::Break { .. } => {
                        // Guest breakpoint: trap with EPC at the BREAK.
                        let packed = em.pack_exit(ExitReason::Trap, EXC_BREAKPOINT, current_pc);
                        let args = [packed.into(), retired.into()];
                        em.bcx.ins().jump(exit_block, &args);
                    }
                    ExitOp::Eret => {
                        let call = em
                            .bcx
                            .ins()
                            .call(em.helpers.eret_target, &[em.helpers_ptr]);
                        let target = em.bcx.inst_results(call)[0];
                        let retired_after = em.bcx.ins().iadd_imm(retired, 1);
                        let packed = em.pack_exit(ExitReason::Normal, 0, target);
                        let args = [packed.into(), retired_after.into()];
                        em.bcx.ins().jump(exit_block, &args);
                    }
                },
                TraceStep::Branch { pc, branch, delay_op, continue_fallthrough } => {
                    let delay_pc = em.bcx.ins().iadd_imm(current_pc, 4);
                    let fallthrough_pc = em.bcx.ins().iadd_imm(current_pc, 8);
                    let fallthrough_block = continue_fallthrough
                        .then(|| step_blocks.get(step_idx + 1).copied())
                        .flatten();

                    match branch_cond(branch) {
                        None => {
                            // Unconditional: J/JAL/JR/JALR.
                            let target: Value = match branch {
                                BranchKind::J { target } | BranchKind::Jal { target } => {
                                    let upper = em
                                        .bcx
                                        .ins()
                                        .band_imm(current_pc, i64::from(0xF000_0000u32 as i32));
                                    let low = em.iconst32(target << 2);
                                    em.bcx.ins().bor(upper, low)
                                }
                                BranchKind::Jr { rs } | BranchKind::Jalr { rs, .. } => {
                                    // Target uses the pre-delay-slot value.
                                    em.load_gpr(rs, consts)
                                }
                                _ => unreachable!(),
                            };
                            if let Some(link) = branch_link(branch) {
                                let ret_addr = em.bcx.ins().iadd_imm(current_pc, 8);
                                em.store_gpr(link, ret_addr);
                            }

                            let syscall_delay = matches!(delay_op, Op::Syscall { .. });
                            em.emit_op(delay_op, delay_pc, current_pc, true, consts, u32::MAX, retired);
                            let retired_after = em.bcx.ins().iadd_imm(retired, 2);
                            let packed = if let Op::Syscall { code } = delay_op {
                                em.pack_exit(ExitReason::Syscall, code, target)
                            } else {
                                em.pack_exit(ExitReason::Normal, 0, target)
                            };
                            debug_assert!(
                                !syscall_delay || matches!(branch, BranchKind::Jr { .. })
                            );
                            let args = [packed.into(), retired_after.into()];
                            em.bcx.ins().jump(exit_block, &args);
                        }
                        Some((cond, offset)) => {
                            let cond_taken = match cond {
                                BranchCond::Cmp(cc, rs, rt) => {
                                    let lhs = em.load_gpr(rs, consts);
                                    let rhs = em.load_gpr(rt, consts);
                                    em.bcx.ins().icmp(cc, lhs, rhs)
                                }
                                BranchCond::CmpZero(cc, rs) => {
                                    let lhs = em.load_gpr(rs, consts);
                                    em.bcx.ins().icmp_imm(cc, lhs, 0)
                                }
                                BranchCond::Cop1 { expect_set } => {
                                    let fcr = em.load_fcr31();
                                    let bit = em.bcx.ins().band_imm(fcr, i64::from(1u32 << 23));
                                    if expect_set {
                                        em.bcx.ins().icmp_imm(IntCC::NotEqual, bit, 0)
                                    } else {
                                        em.bcx.ins().icmp_imm(IntCC::Equal, bit, 0)
                                    }
                                }
                            };

                            // The AL variants write the link register whether
                            // or not the branch is taken.
                            if let Some(link) = branch_link(branch) {
                                let ret_addr = em.bcx.ins().iadd_imm(current_pc, 8);
                                em.store_gpr(link, ret_addr);
                            }

                            let taken_delta = 4 + (i64::from(offset) << 2);
                            let taken_pc = em.bcx.ins().iadd_imm(current_pc, taken_delta);
                            let target_key = pc
                                .wrapping_add(4)
                                .wrapping_add(((offset as i32) << 2) as u32);
                            // Forward-only internal chaining keeps the CFG
                            // acyclic; backward targets exit to the dispatcher.
                            let taken_block = pc_to_index
                                .get(&target_key)
                                .copied()
                                .filter(|idx| *idx > step_idx)
                                .map(|idx| step_blocks[idx]);

                            if branch_is_likely(branch) {
                                // Likely: the delay slot is annulled when the
                                // branch is not taken.
                                let taken_exec = em.bcx.create_block();
                                let skip_retired = em.bcx.ins().iadd_imm(retired, 1);
                                match fallthrough_block {
                                    Some(fallthrough) => {
                                        let fargs = [skip_retired.into()];
                                        em.bcx.ins().brif(
                                            cond_taken,
                                            taken_exec,
                                            &[],
                                            fallthrough,
                                            &fargs,
                                        );
                                    }
                                    None => {
                                        let packed =
                                            em.pack_exit(ExitReason::Normal, 0, fallthrough_pc);
                                        let fargs = [packed.into(), skip_retired.into()];
                                        em.bcx.ins().brif(
                                            cond_taken,
                                            taken_exec,
                                            &[],
                                            exit_block,
                                            &fargs,
                                        );
                                    }
                                }

                                em.bcx.switch_to_block(taken_exec);
                                em.emit_op(
                                    delay_op, delay_pc, current_pc, true, consts, u32::MAX, retired,
                                );
                                let taken_retired = em.bcx.ins().iadd_imm(retired, 2);
                                match taken_block {
                                    Some(target) => {
                                        let targs = [taken_retired.into()];
                                        em.bcx.ins().jump(target, &targs);
                                    }
                                    None => {
                                        let packed = em.pack_exit(ExitReason::Normal, 0, taken_pc);
                                        let targs = [packed.into(), taken_retired.into()];
                                        em.bcx.ins().jump(exit_block, &targs);
                                    }
                                }
                            } else {
                                // Normal conditional: the delay slot runs on
                                // both paths, after the condition is latched.
                                em.emit_op(
                                    delay_op, delay_pc, current_pc, true, consts, u32::MAX, retired,
                                );
                                let retired_after = em.bcx.ins().iadd_imm(retired, 2);
                                match (taken_block, fallthrough_block) {
                                    (Some(taken), Some(fallthrough)) => {
                                        let args = [retired_after.into()];
                                        em.bcx
                                            .ins()
                                            .brif(cond_taken, taken, &args, fallthrough, &args);
                                    }
                                    (Some(taken), None) => {
                                        let packed =
                                            em.pack_exit(ExitReason::Normal, 0, fallthrough_pc);
                                        let targs = [retired_after.into()];
                                        let fargs = [packed.into(), retired_after.into()];
                                        em.bcx
                                            .ins()
                                            .brif(cond_taken, taken, &targs, exit_block, &fargs);
                                    }
                                    (None, Some(fallthrough)) => {
                                        let packed = em.pack_exit(ExitReason::Normal, 0, taken_pc);
                                        let targs = [packed.into(), retired_after.into()];
                                        let fargs = [retired_after.into()];
                                        em.bcx.ins().brif(
                                            cond_taken,
                                            exit_block,
                                            &targs,
                                            fallthrough,
                                            &fargs,
                                        );
                                    }
                                    (None, None) => {
                                        let packed_taken =
                                            em.pack_exit(ExitReason::Normal, 0, taken_pc);
                                        let packed_fall =
                                            em.pack_exit(ExitReason::Normal, 0, fallthrough_pc);
                                        let targs = [packed_taken.into(), retired_after.into()];
                                        let fargs = [packed_fall.into(), retired_after.into()];
                                        em.bcx.ins().brif(
                                            cond_taken,
                                            exit_block,
                                            &targs,
                                            exit_block,
                                            &fargs,
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Epilogue: record retired instructions, advance the cycle counter,
        // restore the host FP environment, return the packed exit.
        em.bcx.switch_to_block(exit_block);
        let packed = em.bcx.block_params(exit_block)[0];
        let retired = em.bcx.block_params(exit_block)[1];
        em.bcx.ins().store(ctx_flags, retired, retired_out, 0);
        let cycles = em.bcx.ins().load(
            types::I64,
            ctx_flags,
            ctx_ptr,
            CpuContext::cycle_count_offset(),
        );
        let retired64 = em.bcx.ins().uextend(types::I64, retired);
        let cycles = em.bcx.ins().iadd(cycles, retired64);
        em.bcx
            .ins()
            .store(ctx_flags, cycles, ctx_ptr, CpuContext::cycle_count_offset());
        if has_fpu {
            em.bcx.ins().call(em.helpers.fpu_leave, &[em.helpers_ptr]);
        }
        em.bcx.ins().return_(&[packed]);

        em.bcx.seal_all_blocks();
        let BlockEmitter { bcx, .. } = em;
        bcx.finalize();

        let symbol = format!("psp_jit_block_{}", self.next_symbol_id);
        self.next_symbol_id += 1;

        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &self.context.func.signature)
            .map_err(|e| CompileError::Backend { message: format!("declare_function: {e}") })?;
        self.module
            .define_function(func_id, &mut self.context)
            .map_err(|e| CompileError::Backend { message: format!("define_function: {e}") })?;
        self.module.clear_context(&mut self.context);
        self.module
            .finalize_definitions()
            .map_err(|e| CompileError::Backend { message: format!("finalize_definitions: {e}") })?;

        let entry = BlockEntry(self.module.get_finalized_function(func_id));

        Ok(CompiledBlock {
            start_pc: trace.start_pc,
            end_pc: trace
                .start_pc
                .wrapping_add(trace.instruction_count.saturating_mul(4)),
            instruction_count: trace.instruction_count,
            fallback_op_count: trace.fallback_op_count,
            has_control_flow: trace.has_control_flow,
            ended_on_reserved: trace.ended_on_reserved,
            entry,
        })
    }

    fn flush(&mut self) {
        let old = std::mem::take(self);
        // SAFETY: the recompiler evicts every compiled block before calling
        // flush, so no entry pointer into the old module remains.
        unsafe { old.module.free_memory() };
    }
}
