//! Reference interpreter.
//!
//! Executes one instruction per `step`, sharing the typed decoder with the
//! dynarec so both paths agree on the closed opcode set. The dynarec leans on
//! this path three ways: cold code runs here until it turns hot, recognized
//! ops it does not lower natively come back through `interp_one`, and
//! differential tests use it as the architectural oracle.

use psp_dynarec::decode::{self, BranchKind, Decoded, ExitOp, Op};

use crate::cpu::exceptions::ExceptionCode;
use crate::cpu::fpu;
use crate::cpu::instruction::Instruction;
use crate::cpu::{Allegrex, PendingTrap};
use crate::hle::SyscallTable;
use crate::mem::{mask_address, MemoryMap};

/// Guest trap raised mid-instruction; converted to COP0 state by `step`.
struct Trap {
    code: ExceptionCode,
    bad_vaddr: Option<u32>,
}

impl Trap {
    fn new(code: ExceptionCode) -> Self {
        Self { code, bad_vaddr: None }
    }

    fn bus(code: ExceptionCode, addr: u32) -> Self {
        Self { code, bad_vaddr: Some(addr) }
    }
}

type OpResult = Result<(), Trap>;

// Unaligned access merge tables (little-endian).
const LWL_MASK: [u32; 4] = [0x00FF_FFFF, 0x0000_FFFF, 0x0000_00FF, 0x0000_0000];
const LWL_SHIFT: [u32; 4] = [24, 16, 8, 0];
const LWR_MASK: [u32; 4] = [0x0000_0000, 0xFF00_0000, 0xFFFF_0000, 0xFFFF_FF00];
const LWR_SHIFT: [u32; 4] = [0, 8, 16, 24];
const SWL_MASK: [u32; 4] = [0xFFFF_FF00, 0xFFFF_0000, 0xFF00_0000, 0x0000_0000];
const SWL_SHIFT: [u32; 4] = [24, 16, 8, 0];
const SWR_MASK: [u32; 4] = [0x0000_0000, 0x0000_00FF, 0x0000_FFFF, 0x00FF_FFFF];
const SWR_SHIFT: [u32; 4] = [0, 8, 16, 24];

impl Allegrex {
    /// Execute one instruction. Returns retired instruction count (always 1;
    /// faulting instructions retire as the exception dispatch).
    pub fn step(&mut self, mem: &mut MemoryMap, syscalls: &mut SyscallTable) -> u64 {
        self.pc_history[self.pc_history_idx] = self.ctx.pc;
        self.pc_history_idx = (self.pc_history_idx + 1) & 63;
        self.step_count += 1;

        let current_pc = self.ctx.pc;
        // Save and clear the delay-slot flag; branches re-set it.
        let was_delay = self.in_delay_slot;
        self.in_delay_slot = false;

        let raw = match mem.read_u32(mask_address(current_pc)) {
            Ok(raw) => raw,
            Err(_) => {
                return self.take_trap(
                    ExceptionCode::BusErrorInstruction,
                    current_pc,
                    was_delay,
                    Some(current_pc),
                );
            }
        };

        // Advance PC before execution so branches rewrite next_pc.
        self.ctx.pc = self.ctx.next_pc;
        self.ctx.next_pc = self.ctx.next_pc.wrapping_add(4);

        let result = match decode::decode(raw) {
            Decoded::Op(op) => self.exec_op(op, mem, syscalls, current_pc),
            Decoded::Branch(branch) => {
                self.exec_branch(branch, current_pc);
                Ok(())
            }
            Decoded::Exit(exit) => self.exec_exit(exit, mem, syscalls, current_pc),
            Decoded::Reserved => Err(Trap::new(ExceptionCode::ReservedInstruction)),
        };

        if let Err(trap) = result {
            return self.take_trap(trap.code, current_pc, was_delay, trap.bad_vaddr);
        }

        // r0 is hardwired to zero.
        self.ctx.gpr[0] = 0;
        self.ctx.cycle_count = self.ctx.cycle_count.wrapping_add(1);
        self.cop0.advance_count(1);
        1
    }

    /// Execute one recognized non-control-flow instruction on behalf of
    /// compiled code. PC state is untouched; faults are parked for the
    /// engine to deliver after the block exits.
    pub fn interp_one(&mut self, raw: u32, pc: u32, mem: &mut MemoryMap, syscalls: &mut SyscallTable) {
        let result = match decode::decode_op(raw) {
            Some(op) => self.exec_op(op, mem, syscalls, pc),
            None => Err(Trap::new(ExceptionCode::ReservedInstruction)),
        };
        if let Err(trap) = result {
            self.pending_trap = Some(PendingTrap {
                code: trap.code,
                epc: pc,
                bad_vaddr: trap.bad_vaddr,
            });
        }
        self.ctx.gpr[0] = 0;
    }

    #[cold]
    fn take_trap(
        &mut self,
        code: ExceptionCode,
        current_pc: u32,
        was_delay: bool,
        bad_vaddr: Option<u32>,
    ) -> u64 {
        let epc = if was_delay {
            current_pc.wrapping_sub(4)
        } else {
            current_pc
        };
        self.deliver_exception(code, epc, was_delay, bad_vaddr);
        self.ctx.gpr[0] = 0;
        self.ctx.cycle_count = self.ctx.cycle_count.wrapping_add(1);
        self.cop0.advance_count(1);
        1
    }

    fn exec_exit(
        &mut self,
        exit: ExitOp,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        _pc: u32,
    ) -> OpResult {
        match exit {
            ExitOp::Syscall { code } => {
                if syscalls.invoke(code, self, mem).is_err() {
                    return Err(Trap::new(ExceptionCode::Syscall));
                }
                Ok(())
            }
            ExitOp::Break { .. } => Err(Trap::new(ExceptionCode::Breakpoint)),
            ExitOp::Eret => {
                let target = self.cop0.eret();
                self.ctx.pc = target;
                self.ctx.next_pc = target.wrapping_add(4);
                Ok(())
            }
        }
    }

    fn exec_branch(&mut self, branch: BranchKind, pc: u32) {
        use BranchKind::*;

        let reg = |r: u8| self.ctx.gpr[usize::from(r)];
        let rel_target = |offset: i16| pc.wrapping_add(4).wrapping_add(((offset as i32) << 2) as u32);

        // Condition and target latch before the link register is written,
        // matching the generated code.
        let (taken, target) = match branch {
            J { target } | Jal { target } => {
                (true, (pc & 0xF000_0000) | (target << 2))
            }
            Jr { rs } | Jalr { rs, .. } => (true, reg(rs)),
            Beq { rs, rt, offset } | Beql { rs, rt, offset } => {
                (reg(rs) == reg(rt), rel_target(offset))
            }
            Bne { rs, rt, offset } | Bnel { rs, rt, offset } => {
                (reg(rs) != reg(rt), rel_target(offset))
            }
            Blez { rs, offset } | Blezl { rs, offset } => {
                ((reg(rs) as i32) <= 0, rel_target(offset))
            }
            Bgtz { rs, offset } | Bgtzl { rs, offset } => {
                ((reg(rs) as i32) > 0, rel_target(offset))
            }
            Bltz { rs, offset } | Bltzl { rs, offset } | Bltzal { rs, offset } => {
                ((reg(rs) as i32) < 0, rel_target(offset))
            }
            Bgez { rs, offset } | Bgezl { rs, offset } | Bgezal { rs, offset } => {
                ((reg(rs) as i32) >= 0, rel_target(offset))
            }
            Bc1f { offset } | Bc1fl { offset } => {
                (!fpu::condition(self.ctx.fcr31), rel_target(offset))
            }
            Bc1t { offset } | Bc1tl { offset } => {
                (fpu::condition(self.ctx.fcr31), rel_target(offset))
            }
        };

        // The linking variants write the return address whether or not the
        // branch is taken.
        if let Some(link) = decode::branch_link(branch) {
            self.ctx.gpr[usize::from(link)] = pc.wrapping_add(8);
        }

        if taken {
            self.ctx.next_pc = target;
            self.in_delay_slot = true;
        } else if decode::branch_is_likely(branch) {
            // Annulled delay slot: skip it entirely.
            self.ctx.pc = pc.wrapping_add(8);
            self.ctx.next_pc = pc.wrapping_add(12);
        } else {
            self.in_delay_slot = true;
        }
    }

    fn load_u8(&self, mem: &MemoryMap, addr: u32) -> Result<u8, Trap> {
        mem.read_u8(addr)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn load_u16(&self, mem: &MemoryMap, addr: u32) -> Result<u16, Trap> {
        mem.read_u16(addr)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn load_u32(&self, mem: &MemoryMap, addr: u32) -> Result<u32, Trap> {
        mem.read_u32(addr)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn store_u8(&self, mem: &mut MemoryMap, addr: u32, val: u8) -> OpResult {
        mem.write_u8(addr, val)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn store_u16(&self, mem: &mut MemoryMap, addr: u32, val: u16) -> OpResult {
        mem.write_u16(addr, val)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn store_u32(&self, mem: &mut MemoryMap, addr: u32, val: u32) -> OpResult {
        mem.write_u32(addr, val)
            .map_err(|_| Trap::bus(ExceptionCode::BusErrorData, addr))
    }

    fn acc(&self) -> u64 {
        (u64::from(self.ctx.hi) << 32) | u64::from(self.ctx.lo)
    }

    fn set_acc(&mut self, acc: u64) {
        self.ctx.lo = acc as u32;
        self.ctx.hi = (acc >> 32) as u32;
    }

    fn exec_op(
        &mut self,
        op: Op,
        mem: &mut MemoryMap,
        syscalls: &mut SyscallTable,
        pc: u32,
    ) -> OpResult {
        let reg = |cpu: &Self, r: u8| cpu.ctx.gpr[usize::from(r)];
        macro_rules! set {
            ($cpu:expr, $r:expr, $v:expr) => {{
                let value = $v;
                if $r != 0 {
                    $cpu.ctx.gpr[usize::from($r)] = value;
                }
            }};
        }

        match op {
            Op::Addi { rs, rt, imm } => {
                match (reg(self, rs) as i32).checked_add(i32::from(imm)) {
                    Some(sum) => set!(self, rt, sum as u32),
                    None => return Err(Trap::new(ExceptionCode::Overflow)),
                }
            }
            Op::Addiu { rs, rt, imm } => {
                set!(self, rt, reg(self, rs).wrapping_add(imm as u32))
            }
            Op::Slti { rs, rt, imm } => {
                set!(self, rt, u32::from((reg(self, rs) as i32) < i32::from(imm)))
            }
            Op::Sltiu { rs, rt, imm } => {
                set!(self, rt, u32::from(reg(self, rs) < imm as u32))
            }
            Op::Andi { rs, rt, imm } => set!(self, rt, reg(self, rs) & u32::from(imm)),
            Op::Ori { rs, rt, imm } => set!(self, rt, reg(self, rs) | u32::from(imm)),
            Op::Xori { rs, rt, imm } => set!(self, rt, reg(self, rs) ^ u32::from(imm)),
            Op::Lui { rt, imm } => set!(self, rt, (imm as u32) << 16),
            Op::Add { rs, rt, rd } => {
                match (reg(self, rs) as i32).checked_add(reg(self, rt) as i32) {
                    Some(sum) => set!(self, rd, sum as u32),
                    None => return Err(Trap::new(ExceptionCode::Overflow)),
                }
            }
            Op::Sub { rs, rt, rd } => {
                match (reg(self, rs) as i32).checked_sub(reg(self, rt) as i32) {
                    Some(diff) => set!(self, rd, diff as u32),
                    None => return Err(Trap::new(ExceptionCode::Overflow)),
                }
            }
            Op::Addu { rs, rt, rd } => {
                set!(self, rd, reg(self, rs).wrapping_add(reg(self, rt)))
            }
            Op::Subu { rs, rt, rd } => {
                set!(self, rd, reg(self, rs).wrapping_sub(reg(self, rt)))
            }
            Op::And { rs, rt, rd } => set!(self, rd, reg(self, rs) & reg(self, rt)),
            Op::Or { rs, rt, rd } => set!(self, rd, reg(self, rs) | reg(self, rt)),
            Op::Xor { rs, rt, rd } => set!(self, rd, reg(self, rs) ^ reg(self, rt)),
            Op::Nor { rs, rt, rd } => set!(self, rd, !(reg(self, rs) | reg(self, rt))),
            Op::Slt { rs, rt, rd } => {
                set!(self, rd, u32::from((reg(self, rs) as i32) < (reg(self, rt) as i32)))
            }
            Op::Sltu { rs, rt, rd } => {
                set!(self, rd, u32::from(reg(self, rs) < reg(self, rt)))
            }
            Op::Max { rs, rt, rd } => {
                set!(self, rd, (reg(self, rs) as i32).max(reg(self, rt) as i32) as u32)
            }
            Op::Min { rs, rt, rd } => {
                set!(self, rd, (reg(self, rs) as i32).min(reg(self, rt) as i32) as u32)
            }
            Op::Clz { rs, rd } => set!(self, rd, reg(self, rs).leading_zeros()),
            Op::Clo { rs, rd } => set!(self, rd, reg(self, rs).leading_ones()),
            Op::Sll { rt, rd, sa } => set!(self, rd, reg(self, rt) << sa),
            Op::Srl { rt, rd, sa } => set!(self, rd, reg(self, rt) >> sa),
            Op::Sra { rt, rd, sa } => set!(self, rd, ((reg(self, rt) as i32) >> sa) as u32),
            Op::Rotr { rt, rd, sa } => set!(self, rd, reg(self, rt).rotate_right(u32::from(sa))),
            Op::Sllv { rs, rt, rd } => {
                set!(self, rd, reg(self, rt) << (reg(self, rs) & 0x1F))
            }
            Op::Srlv { rs, rt, rd } => {
                set!(self, rd, reg(self, rt) >> (reg(self, rs) & 0x1F))
            }
            Op::Srav { rs, rt, rd } => {
                set!(self, rd, ((reg(self, rt) as i32) >> (reg(self, rs) & 0x1F)) as u32)
            }
            Op::Rotrv { rs, rt, rd } => {
                set!(self, rd, reg(self, rt).rotate_right(reg(self, rs) & 0x1F))
            }
            Op::Ext { rs, rt, lsb, size } => {
                let mask = ((1u64 << size) - 1) as u32;
                set!(self, rt, (reg(self, rs) >> lsb) & mask)
            }
            Op::Ins { rs, rt, lsb, size } => {
                let mask = (((1u64 << size) - 1) as u32) << lsb;
                let merged = (reg(self, rt) & !mask) | ((reg(self, rs) << lsb) & mask);
                set!(self, rt, merged)
            }
            Op::Seb { rt, rd } => set!(self, rd, reg(self, rt) as i8 as i32 as u32),
            Op::Seh { rt, rd } => set!(self, rd, reg(self, rt) as i16 as i32 as u32),
            Op::Wsbh { rt, rd } => {
                let v = reg(self, rt);
                set!(self, rd, ((v & 0x00FF_00FF) << 8) | ((v >> 8) & 0x00FF_00FF))
            }
            Op::Mfhi { rd } => set!(self, rd, self.ctx.hi),
            Op::Mthi { rs } => self.ctx.hi = reg(self, rs),
            Op::Mflo { rd } => set!(self, rd, self.ctx.lo),
            Op::Mtlo { rs } => self.ctx.lo = reg(self, rs),
            Op::Mult { rs, rt } => {
                let product =
                    i64::from(reg(self, rs) as i32) * i64::from(reg(self, rt) as i32);
                self.set_acc(product as u64);
            }
            Op::Multu { rs, rt } => {
                let product = u64::from(reg(self, rs)) * u64::from(reg(self, rt));
                self.set_acc(product);
            }
            Op::Madd { rs, rt } => {
                let product =
                    i64::from(reg(self, rs) as i32) * i64::from(reg(self, rt) as i32);
                self.set_acc(self.acc().wrapping_add(product as u64));
            }
            Op::Maddu { rs, rt } => {
                let product = u64::from(reg(self, rs)) * u64::from(reg(self, rt));
                self.set_acc(self.acc().wrapping_add(product));
            }
            Op::Msub { rs, rt } => {
                let product =
                    i64::from(reg(self, rs) as i32) * i64::from(reg(self, rt) as i32);
                self.set_acc(self.acc().wrapping_sub(product as u64));
            }
            Op::Msubu { rs, rt } => {
                let product = u64::from(reg(self, rs)) * u64::from(reg(self, rt));
                self.set_acc(self.acc().wrapping_sub(product));
            }
            Op::Div { rs, rt } => {
                let lhs = reg(self, rs) as i32;
                let rhs = reg(self, rt) as i32;
                // Corner cases leave HI/LO unchanged, matching compiled code.
                if rhs != 0 && !(lhs == i32::MIN && rhs == -1) {
                    self.ctx.lo = (lhs / rhs) as u32;
                    self.ctx.hi = (lhs % rhs) as u32;
                }
            }
            Op::Divu { rs, rt } => {
                let lhs = reg(self, rs);
                let rhs = reg(self, rt);
                if rhs != 0 {
                    self.ctx.lo = lhs / rhs;
                    self.ctx.hi = lhs % rhs;
                }
            }
            Op::Lb { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                let val = self.load_u8(mem, addr)? as i8 as i32 as u32;
                set!(self, rt, val)
            }
            Op::Lbu { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                let val = u32::from(self.load_u8(mem, addr)?);
                set!(self, rt, val)
            }
            Op::Lh { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                let val = self.load_u16(mem, addr)? as i16 as i32 as u32;
                set!(self, rt, val)
            }
            Op::Lhu { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                let val = u32::from(self.load_u16(mem, addr)?);
                set!(self, rt, val)
            }
            Op::Lw { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                let val = self.load_u32(mem, addr)?;
                set!(self, rt, val)
            }
            Op::Sb { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                self.store_u8(mem, addr, reg(self, rt) as u8)?;
            }
            Op::Sh { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                self.store_u16(mem, addr, reg(self, rt) as u16)?;
            }
            Op::Sw { base, rt, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                self.store_u32(mem, addr, reg(self, rt))?;
            }
            Op::Lwc1 { base, ft, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                self.ctx.fpr[usize::from(ft)] = self.load_u32(mem, addr)?;
            }
            Op::Swc1 { base, ft, imm } => {
                let addr = reg(self, base).wrapping_add(imm as u32);
                self.store_u32(mem, addr, self.ctx.fpr[usize::from(ft)])?;
            }
            Op::Mfc0 { rt, rd } => {
                set!(self, rt, self.cop0.read_reg(usize::from(rd)))
            }
            Op::Mtc0 { rt, rd } => {
                let value = reg(self, rt);
                self.cop0.write_reg(usize::from(rd), value);
            }
            Op::Mfc1 { rt, fs } => set!(self, rt, self.ctx.fpr[usize::from(fs)]),
            Op::Mtc1 { rt, fs } => self.ctx.fpr[usize::from(fs)] = reg(self, rt),
            Op::Cfc1 { rt, fs } => {
                let value = if fs == 31 { self.ctx.fcr31 } else { 0 };
                set!(self, rt, value)
            }
            Op::Ctc1 { rt, fs } => {
                if fs == 31 {
                    self.ctx.fcr31 = reg(self, rt);
                }
            }
            Op::AddS { fd, fs, ft } => self.fp_binary(fd, fs, ft, |a, b| a + b),
            Op::SubS { fd, fs, ft } => self.fp_binary(fd, fs, ft, |a, b| a - b),
            Op::MulS { fd, fs, ft } => self.fp_binary(fd, fs, ft, |a, b| a * b),
            Op::DivS { fd, fs, ft } => self.fp_binary(fd, fs, ft, |a, b| a / b),
            Op::SqrtS { fd, fs } => self.fp_unary(fd, fs, f32::sqrt),
            Op::AbsS { fd, fs } => self.fp_unary(fd, fs, f32::abs),
            Op::MovS { fd, fs } => {
                self.ctx.fpr[usize::from(fd)] = self.ctx.fpr[usize::from(fs)]
            }
            Op::NegS { fd, fs } => self.fp_unary(fd, fs, |v| -v),
            Op::TruncWS { fd, fs } => {
                let val = f32::from_bits(self.ctx.fpr[usize::from(fs)]);
                self.ctx.fpr[usize::from(fd)] = (val as i32) as u32;
            }
            Op::CvtSW { fd, fs } => {
                let val = self.ctx.fpr[usize::from(fs)] as i32;
                self.ctx.fpr[usize::from(fd)] = (val as f32).to_bits();
            }
            Op::CCondS { cond, fs, ft } => {
                let a = f32::from_bits(self.ctx.fpr[usize::from(fs)]);
                let b = f32::from_bits(self.ctx.fpr[usize::from(ft)]);
                let unordered = a.is_nan() || b.is_nan();
                let result = match cond & 0x7 {
                    0x0 => false,
                    0x1 => unordered,
                    0x2 => a == b,
                    0x3 => unordered || a == b,
                    0x4 => a < b,
                    0x5 => unordered || a < b,
                    0x6 => a <= b,
                    _ => unordered || a <= b,
                };
                fpu::set_condition(&mut self.ctx.fcr31, result);
            }
            Op::Syscall { code } => {
                if syscalls.invoke(code, self, mem).is_err() {
                    return Err(Trap::new(ExceptionCode::Syscall));
                }
            }
            Op::Break { .. } => return Err(Trap::new(ExceptionCode::Breakpoint)),
            Op::HostStep { raw } => self.exec_raw_fallback(raw, mem, pc)?,
            Op::Sync | Op::CacheOp | Op::Nop => {}
        }
        Ok(())
    }

    fn fp_binary(&mut self, fd: u8, fs: u8, ft: u8, f: impl Fn(f32, f32) -> f32) {
        let a = f32::from_bits(self.ctx.fpr[usize::from(fs)]);
        let b = f32::from_bits(self.ctx.fpr[usize::from(ft)]);
        self.ctx.fpr[usize::from(fd)] = f(a, b).to_bits();
    }

    fn fp_unary(&mut self, fd: u8, fs: u8, f: impl Fn(f32) -> f32) {
        let a = f32::from_bits(self.ctx.fpr[usize::from(fs)]);
        self.ctx.fpr[usize::from(fd)] = f(a).to_bits();
    }

    /// Ops the dynarec delegates: unaligned left/right memory accesses and
    /// rounding-mode-sensitive conversions.
    fn exec_raw_fallback(&mut self, raw: u32, mem: &mut MemoryMap, _pc: u32) -> OpResult {
        let instr = Instruction(raw);
        match instr.opcode() {
            // lwl / lwr / swl / swr
            0x22 | 0x26 | 0x2A | 0x2E => {
                let addr = self.ctx.gpr[instr.rs()].wrapping_add(instr.simm() as u32);
                let aligned = addr & !3;
                let b = (addr & 3) as usize;
                let rt = instr.rt();
                match instr.opcode() {
                    0x22 => {
                        let word = self.load_u32(mem, aligned)?;
                        let merged =
                            (self.ctx.gpr[rt] & LWL_MASK[b]) | (word << LWL_SHIFT[b]);
                        if rt != 0 {
                            self.ctx.gpr[rt] = merged;
                        }
                    }
                    0x26 => {
                        let word = self.load_u32(mem, aligned)?;
                        let merged =
                            (self.ctx.gpr[rt] & LWR_MASK[b]) | (word >> LWR_SHIFT[b]);
                        if rt != 0 {
                            self.ctx.gpr[rt] = merged;
                        }
                    }
                    0x2A => {
                        let word = self.load_u32(mem, aligned)?;
                        let merged = (word & SWL_MASK[b]) | (self.ctx.gpr[rt] >> SWL_SHIFT[b]);
                        self.store_u32(mem, aligned, merged)?;
                    }
                    _ => {
                        let word = self.load_u32(mem, aligned)?;
                        let merged = (word & SWR_MASK[b]) | (self.ctx.gpr[rt] << SWR_SHIFT[b]);
                        self.store_u32(mem, aligned, merged)?;
                    }
                }
                Ok(())
            }
            // COP1 single-format conversions that honor the rounding mode:
            // round/ceil/floor.w.s and cvt.w.s.
            0x11 => {
                let fs = instr.rd();
                let fd = instr.sa();
                let val = f32::from_bits(self.ctx.fpr[fs]);
                let word = match instr.funct() {
                    0x0C => fpu::round_nearest_even(val),
                    0x0E => if val.is_nan() { 0 } else { val.ceil() as i32 },
                    0x0F => if val.is_nan() { 0 } else { val.floor() as i32 },
                    0x24 => fpu::round_to_word(val, self.ctx.fcr31),
                    _ => return Err(Trap::new(ExceptionCode::ReservedInstruction)),
                };
                self.ctx.fpr[fd] = word as u32;
                Ok(())
            }
            _ => Err(Trap::new(ExceptionCode::ReservedInstruction)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::cop0::Cop0;
    use crate::cpu::Allegrex;
    use crate::hle::SyscallTable;
    use crate::mem::{MemoryMap, RAM_BASE};

    fn setup(words: &[u32]) -> (Allegrex, MemoryMap, SyscallTable) {
        let mut mem = MemoryMap::new();
        for (i, w) in words.iter().enumerate() {
            mem.write_u32(RAM_BASE + (i as u32) * 4, *w).unwrap();
        }
        let mut cpu = Allegrex::new();
        cpu.ctx.pc = RAM_BASE;
        cpu.ctx.next_pc = RAM_BASE + 4;
        (cpu, mem, SyscallTable::new())
    }

    fn run(cpu: &mut Allegrex, mem: &mut MemoryMap, syscalls: &mut SyscallTable, steps: u32) {
        for _ in 0..steps {
            cpu.step(mem, syscalls);
        }
    }

    #[test]
    fn arithmetic_and_untaken_branch_with_delay_slot() {
        // Load 5 and 7, add, branch-if-zero (not taken), delay slot writes 1,
        // fall-through target writes 2.
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x2401_0005, // addiu r1, r0, 5
            0x2402_0007, // addiu r2, r0, 7
            0x0022_1820, // add r3, r1, r2
            0x1060_0002, // beq r3, r0, +2
            0x2404_0001, // addiu r4, r0, 1 (delay slot)
            0x2404_0002, // addiu r4, r0, 2
        ]);
        run(&mut cpu, &mut mem, &mut syscalls, 6);
        assert_eq!(cpu.ctx.gpr[3], 12);
        assert_eq!(cpu.ctx.gpr[4], 2, "fall-through target must run last");
        assert_eq!(cpu.ctx.pc, RAM_BASE + 24);
    }

    #[test]
    fn delay_slot_executes_exactly_once_on_taken_branch() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x1000_0002, // beq r0, r0, +2 (always taken)
            0x2404_0001, // addiu r4, r4, ... delay slot increments r4
            0x2405_0063, // addiu r5, r0, 99 (skipped)
            0x2406_0002, // addiu r6, r0, 2 (branch target)
        ]);
        // Make the delay slot an increment so double execution is visible.
        mem.write_u32(RAM_BASE + 4, 0x2484_0001).unwrap(); // addiu r4, r4, 1
        run(&mut cpu, &mut mem, &mut syscalls, 3);
        assert_eq!(cpu.ctx.gpr[4], 1, "delay slot must run exactly once");
        assert_eq!(cpu.ctx.gpr[5], 0, "branch shadow must be skipped");
        assert_eq!(cpu.ctx.gpr[6], 2);
    }

    #[test]
    fn likely_branch_annuls_delay_slot_when_not_taken() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x2401_0001, // addiu r1, r0, 1
            0x5020_0002, // beql r1, r0, +2 (not taken)
            0x2404_0063, // addiu r4, r0, 99 (annulled)
            0x2405_0002, // addiu r5, r0, 2
        ]);
        run(&mut cpu, &mut mem, &mut syscalls, 3);
        assert_eq!(cpu.ctx.gpr[4], 0, "annulled delay slot must not run");
        assert_eq!(cpu.ctx.gpr[5], 2);
    }

    #[test]
    fn overflow_trap_reports_faulting_pc_and_preserves_rd() {
        // add r1, r1, r1 with r1 = 0x7FFFFFFF.
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x0021_0820, // add r1, r1, r1
        ]);
        cpu.ctx.gpr[1] = 0x7FFF_FFFF;
        run(&mut cpu, &mut mem, &mut syscalls, 1);
        assert_eq!(cpu.ctx.gpr[1], 0x7FFF_FFFF, "rd unchanged on overflow");
        assert_eq!(cpu.cop0.regs[Cop0::EPC], RAM_BASE);
        assert_eq!((cpu.cop0.regs[Cop0::CAUSE] >> 2) & 0x1F, 12);
        assert_eq!(cpu.ctx.pc, 0x8000_0180);
    }

    #[test]
    fn r0_stays_zero_through_every_writer() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x2400_0055, // addiu r0, r0, 0x55
            0x3C00_FFFF, // lui r0, 0xFFFF
            0x8C40_0000, // lw r0, 0(r2)
            0x0000_0010, // mfhi r0
        ]);
        cpu.ctx.gpr[2] = RAM_BASE;
        cpu.ctx.hi = 0x1234_5678;
        run(&mut cpu, &mut mem, &mut syscalls, 4);
        assert_eq!(cpu.ctx.gpr[0], 0);
    }

    #[test]
    fn jal_and_jr_round_trip() {
        let target = (RAM_BASE + 0x40) >> 2;
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            (0x03 << 26) | (target & 0x03FF_FFFF), // jal RAM_BASE+0x40
            0x2404_0001,                           // addiu r4, r0, 1 (delay)
            0x2405_0005,                           // addiu r5, r0, 5 (return point)
        ]);
        // Callee: jr ra with a delay slot.
        mem.write_u32(RAM_BASE + 0x40, 0x03E0_0008).unwrap(); // jr ra
        mem.write_u32(RAM_BASE + 0x44, 0x2406_0006).unwrap(); // addiu r6, r0, 6
        run(&mut cpu, &mut mem, &mut syscalls, 5);
        assert_eq!(cpu.ctx.gpr[31], RAM_BASE + 8);
        assert_eq!(cpu.ctx.gpr[4], 1);
        assert_eq!(cpu.ctx.gpr[6], 6);
        assert_eq!(cpu.ctx.gpr[5], 5);
    }

    #[test]
    fn unaligned_left_right_pair_assembles_word()  {
        // Standard unaligned load: lwl/lwr pair at offset 1.
        let lwl = (0x22u32 << 26) | (1 << 21) | (8 << 16) | 0x104; // lwl r8, 0x104(r1)
        let lwr = (0x26u32 << 26) | (1 << 21) | (8 << 16) | 0x101; // lwr r8, 0x101(r1)
        let (mut cpu, mut mem, mut syscalls) = setup(&[lwl, lwr]);
        cpu.ctx.gpr[1] = RAM_BASE;
        mem.write_u32(RAM_BASE + 0x100, 0x4433_2211).unwrap();
        mem.write_u32(RAM_BASE + 0x104, 0x8877_6655).unwrap();
        run(&mut cpu, &mut mem, &mut syscalls, 2);
        // Bytes at 0x101..0x105 little-endian: 0x55443322.
        assert_eq!(cpu.ctx.gpr[8], 0x5544_3322);
    }

    #[test]
    fn reserved_instruction_raises_guest_trap() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x0000_0005, // reserved SPECIAL funct
        ]);
        run(&mut cpu, &mut mem, &mut syscalls, 1);
        assert_eq!((cpu.cop0.regs[Cop0::CAUSE] >> 2) & 0x1F, 10);
        assert_eq!(cpu.cop0.regs[Cop0::EPC], RAM_BASE);
        assert_eq!(cpu.ctx.pc, 0x8000_0180);
    }

    #[test]
    fn bad_address_becomes_guest_bus_error() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x8C28_0000, // lw r8, 0(r1) with r1 pointing nowhere
        ]);
        cpu.ctx.gpr[1] = 0x0300_0000;
        run(&mut cpu, &mut mem, &mut syscalls, 1);
        assert_eq!((cpu.cop0.regs[Cop0::CAUSE] >> 2) & 0x1F, 7);
        assert_eq!(cpu.cop0.regs[Cop0::BAD_VADDR], 0x0300_0000);
        assert_eq!(cpu.ctx.pc, 0x8000_0180);
    }

    #[test]
    fn eret_returns_to_epc_and_reenables_interrupts() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x4200_0018, // eret
        ]);
        cpu.cop0.regs[Cop0::STATUS] |= 0x02;
        cpu.cop0.regs[Cop0::EPC] = RAM_BASE + 0x500;
        run(&mut cpu, &mut mem, &mut syscalls, 1);
        assert_eq!(cpu.ctx.pc, RAM_BASE + 0x500);
        assert_eq!(cpu.cop0.regs[Cop0::STATUS] & 0x02, 0);
    }

    #[test]
    fn fp_compare_drives_bc1_branches() {
        let (mut cpu, mut mem, mut syscalls) = setup(&[
            0x4600_083C, // c.lt.s f1, f0
            0x4501_0002, // bc1t +2
            0x2404_0001, // addiu r4, r0, 1 (delay)
            0x2405_0063, // addiu r5, r0, 99 (skipped)
            0x2406_0002, // addiu r6, r0, 2 (target)
        ]);
        cpu.ctx.fpr[1] = 1.0f32.to_bits();
        cpu.ctx.fpr[0] = 2.0f32.to_bits();
        run(&mut cpu, &mut mem, &mut syscalls, 4);
        assert_eq!(cpu.ctx.gpr[4], 1);
        assert_eq!(cpu.ctx.gpr[5], 0);
        assert_eq!(cpu.ctx.gpr[6], 2);
    }
}
