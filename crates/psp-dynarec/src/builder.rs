//! Block construction: linear scan from a start PC into a single-entry,
//! multi-exit trace, plus the analysis the generator consumes (backward
//! liveness and forward constant propagation).

use crate::decode::{
    self, branch_is_conditional, branch_link, op_def, op_uses, BranchKind, Decoded, ExitOp, Op,
};
use crate::{CompileError, CompileRequest, InstructionSource};

/// Known-constant registers at one program point. r0 is always `Some(0)`.
pub type ConstMap = [Option<u32>; 32];

/// One scanned guest instruction (or branch/delay pair).
#[derive(Debug, Clone, Copy)]
pub enum TraceStep {
    Op {
        pc: u32,
        op: Op,
    },
    /// A control transfer and its delay-slot instruction, emitted as a unit.
    Branch {
        pc: u32,
        branch: BranchKind,
        delay_op: Op,
        /// Conditional branches fall through into the next step.
        continue_fallthrough: bool,
    },
    /// SYSCALL / BREAK / ERET: terminates the block with no delay slot.
    Exit {
        pc: u32,
        exit: ExitOp,
    },
}

impl TraceStep {
    pub fn pc(&self) -> u32 {
        match self {
            TraceStep::Op { pc, .. } | TraceStep::Branch { pc, .. } | TraceStep::Exit { pc, .. } => {
                *pc
            }
        }
    }

    /// Guest instructions this step covers.
    pub fn instruction_count(&self) -> u32 {
        match self {
            TraceStep::Branch { .. } => 2,
            _ => 1,
        }
    }
}

/// A scanned and analyzed block, ready for lowering.
#[derive(Debug, Clone)]
pub struct BlockTrace {
    pub start_pc: u32,
    pub steps: Vec<TraceStep>,
    pub instruction_count: u32,
    pub fallback_op_count: u32,
    pub has_control_flow: bool,
    pub ended_on_reserved: bool,
    /// Registers possibly read after each step (bitmask, parallel to
    /// `steps`). A clear bit proves the step's def is dead within the block.
    pub live_out: Vec<u32>,
    /// Known register constants on entry to each step.
    pub consts_in: Vec<ConstMap>,
}

fn is_fallback(op: Op) -> bool {
    matches!(op, Op::HostStep { .. })
}

/// Scan and analyze a block starting at `request.start_pc`.
pub fn build_trace(
    request: &CompileRequest,
    source: &mut dyn InstructionSource,
) -> Result<BlockTrace, CompileError> {
    let max_instructions = request.max_instructions.max(1);
    let mut steps = Vec::new();
    let mut pc = request.start_pc;
    let mut decoded = 0u32;
    let mut fallback_op_count = 0u32;
    let mut has_control_flow = false;
    let mut ended_on_reserved = false;

    while decoded < max_instructions {
        let raw = match source.read_u32(pc) {
            Ok(raw) => raw,
            Err(err) => {
                if steps.is_empty() {
                    return Err(err);
                }
                break;
            }
        };

        if let Some(exit) = decode::decode_terminator(raw) {
            steps.push(TraceStep::Exit { pc, exit });
            decoded += 1;
            has_control_flow = true;
            break;
        }

        if let Some(branch) = decode::decode_branch(raw) {
            // A branch and its delay slot are included as a unit or not at
            // all; bail out to the cap exit if only one slot remains.
            if decoded + 2 > max_instructions {
                if steps.is_empty() {
                    return Err(CompileError::TooLong { pc });
                }
                break;
            }
            let delay_pc = pc.wrapping_add(4);
            let delay_raw = match source.read_u32(delay_pc) {
                Ok(raw) => raw,
                Err(err) => {
                    if steps.is_empty() {
                        return Err(err);
                    }
                    break;
                }
            };

            let delay_op = match decode::decode(delay_raw) {
                // A branch in a branch delay slot is architecturally
                // undefined; treat the pair as a reserved encoding.
                Decoded::Branch(_) => {
                    if steps.is_empty() {
                        return Err(CompileError::Reserved { pc, raw: delay_raw });
                    }
                    ended_on_reserved = true;
                    break;
                }
                // The PSP import-stub shape: `jr $ra` with the SYSCALL in
                // the delay slot. Any other terminator there is reserved.
                Decoded::Exit(ExitOp::Syscall { code })
                    if matches!(branch, BranchKind::Jr { .. }) =>
                {
                    Op::Syscall { code }
                }
                Decoded::Exit(_) => {
                    if steps.is_empty() {
                        return Err(CompileError::Reserved { pc, raw: delay_raw });
                    }
                    ended_on_reserved = true;
                    break;
                }
                Decoded::Op(op) => op,
                Decoded::Reserved => {
                    if steps.is_empty() {
                        return Err(CompileError::Reserved { pc: delay_pc, raw: delay_raw });
                    }
                    ended_on_reserved = true;
                    break;
                }
            };

            if is_fallback(delay_op) {
                fallback_op_count += 1;
            }
            let continue_fallthrough = branch_is_conditional(branch);
            steps.push(TraceStep::Branch { pc, branch, delay_op, continue_fallthrough });
            has_control_flow = true;
            decoded += 2;
            pc = pc.wrapping_add(8);
            if !continue_fallthrough {
                break;
            }
            continue;
        }

        match decode::decode_op(raw) {
            Some(op) => {
                if is_fallback(op) {
                    fallback_op_count += 1;
                }
                steps.push(TraceStep::Op { pc, op });
                decoded += 1;
                pc = pc.wrapping_add(4);
            }
            None => {
                // Reserved encoding: end the block here so the fall-through
                // exit lands the dispatcher on it and the trap is raised
                // precisely.
                if steps.is_empty() {
                    return Err(CompileError::Reserved { pc, raw });
                }
                ended_on_reserved = true;
                break;
            }
        }
    }

    if steps.is_empty() {
        return Err(CompileError::TooLong { pc: request.start_pc });
    }

    let live_out = compute_liveness(&steps);
    let consts_in = compute_constants(&steps);
    let instruction_count = steps.iter().map(TraceStep::instruction_count).sum();

    Ok(BlockTrace {
        start_pc: request.start_pc,
        steps,
        instruction_count,
        fallback_op_count,
        has_control_flow,
        ended_on_reserved,
        live_out,
        consts_in,
    })
}

/// Backward liveness sweep.
///
/// Any step that can leave the block (branches, terminators, helper-visible
/// ops) makes every register live; between those points, a register whose
/// next event is a redefinition is dead.
fn compute_liveness(steps: &[TraceStep]) -> Vec<u32> {
    let mut live_out = vec![u32::MAX; steps.len()];
    let mut live = u32::MAX;
    for (idx, step) in steps.iter().enumerate().rev() {
        live_out[idx] = live;
        match *step {
            TraceStep::Op { op, .. } => {
                if op_uses(op) == u32::MAX {
                    live = u32::MAX;
                } else {
                    if let Some(def) = op_def(op) {
                        live &= !(1u32 << def);
                    }
                    live |= op_uses(op);
                }
            }
            // Conservative: a branch may exit with any register live, and
            // the delay op executes on both paths.
            TraceStep::Branch { .. } | TraceStep::Exit { .. } => {
                live = u32::MAX;
            }
        }
        // r0 is never meaningfully live.
        live &= !1;
    }
    live_out
}

/// Forward constant propagation over trivially known immediates.
///
/// Tracks `lui`/`addiu`/`ori`/`xori`/`andi` chains rooted at constants so the
/// generator can fold address materialization. Helper-visible ops clobber
/// everything they may write.
fn compute_constants(steps: &[TraceStep]) -> Vec<ConstMap> {
    let mut consts: ConstMap = [None; 32];
    consts[0] = Some(0);
    let mut consts_in = Vec::with_capacity(steps.len());

    for step in steps {
        consts_in.push(consts);
        match *step {
            TraceStep::Op { op, .. } => {
                apply_op_constants(&mut consts, op);
            }
            TraceStep::Branch { branch, delay_op, .. } => {
                if let Some(link) = branch_link(branch) {
                    consts[usize::from(link)] = None;
                }
                apply_op_constants(&mut consts, delay_op);
                // Taken edges leave the block; the map only needs to stay
                // valid on the fall-through path, which the delay op ends.
            }
            TraceStep::Exit { .. } => {}
        }
        consts[0] = Some(0);
    }
    consts_in
}

fn apply_op_constants(consts: &mut ConstMap, op: Op) {
    let known = |consts: &ConstMap, r: u8| consts[usize::from(r)];
    match op {
        Op::Lui { rt, imm } => {
            consts[usize::from(rt)] = Some((imm as u32) << 16);
        }
        Op::Addiu { rs, rt, imm } => {
            consts[usize::from(rt)] = known(consts, rs).map(|v| v.wrapping_add(imm as u32));
        }
        Op::Ori { rs, rt, imm } => {
            consts[usize::from(rt)] = known(consts, rs).map(|v| v | u32::from(imm));
        }
        Op::Xori { rs, rt, imm } => {
            consts[usize::from(rt)] = known(consts, rs).map(|v| v ^ u32::from(imm));
        }
        Op::Andi { rs, rt, imm } => {
            consts[usize::from(rt)] = known(consts, rs).map(|v| v & u32::from(imm));
        }
        Op::Syscall { .. } | Op::Break { .. } | Op::HostStep { .. } => {
            // The helper may write any register.
            *consts = [None; 32];
        }
        _ => {
            if let Some(def) = op_def(op) {
                consts[usize::from(def)] = None;
            }
        }
    }
    consts[0] = Some(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSource {
        words: std::collections::HashMap<u32, u32>,
    }

    impl TestSource {
        fn with_program(start: u32, words: &[u32]) -> Self {
            let mut map = std::collections::HashMap::new();
            for (i, w) in words.iter().enumerate() {
                map.insert(start + (i as u32) * 4, *w);
            }
            Self { words: map }
        }
    }

    impl InstructionSource for TestSource {
        fn read_u32(&mut self, pc: u32) -> Result<u32, CompileError> {
            self.words.get(&pc).copied().ok_or(CompileError::Fetch { pc })
        }
    }

    fn request(start_pc: u32) -> CompileRequest {
        CompileRequest { start_pc, max_instructions: 64 }
    }

    #[test]
    fn branch_consumes_exactly_one_delay_slot() {
        let start = 0x0880_0000;
        let mut src = TestSource::with_program(
            start,
            &[
                0x2408_0005, // addiu t0, r0, 5
                0x1100_0002, // beq t0, r0, +2
                0x2409_0001, // addiu t1, r0, 1 (delay)
                0x2409_0002, // addiu t1, r0, 2
                0x0800_0000, // j (unconditional: ends block after delay)
                0x0000_0000, // nop (delay)
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_eq!(trace.instruction_count, 6);
        assert!(trace.has_control_flow);
        assert!(matches!(
            trace.steps[1],
            TraceStep::Branch { continue_fallthrough: true, .. }
        ));
        assert!(matches!(
            trace.steps[3],
            TraceStep::Branch { continue_fallthrough: false, .. }
        ));
    }

    #[test]
    fn syscall_stops_block_without_delay_slot() {
        let start = 0x0880_0100;
        let mut src = TestSource::with_program(
            start,
            &[
                0x2402_0001,       // addiu v0, r0, 1
                (17 << 6) | 0x0C,  // syscall 17
                0x2402_0002,       // unreachable
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_eq!(trace.steps.len(), 2);
        assert!(matches!(
            trace.steps[1],
            TraceStep::Exit { exit: ExitOp::Syscall { code: 17 }, .. }
        ));
        assert_eq!(trace.instruction_count, 2);
    }

    #[test]
    fn syscall_in_jr_delay_slot_is_accepted() {
        let start = 0x0880_0200;
        let mut src = TestSource::with_program(
            start,
            &[
                0x03E0_0008,      // jr ra
                (42 << 6) | 0x0C, // syscall 42 (delay slot)
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert!(matches!(
            trace.steps[0],
            TraceStep::Branch { delay_op: Op::Syscall { code: 42 }, .. }
        ));
    }

    #[test]
    fn branch_in_delay_slot_is_reserved() {
        let start = 0x0880_0300;
        let mut src = TestSource::with_program(
            start,
            &[
                0x1000_0001, // beq r0, r0, +1
                0x1000_0001, // beq in the delay slot
            ],
        );
        let err = build_trace(&request(start), &mut src).unwrap_err();
        assert!(matches!(err, CompileError::Reserved { .. }));
    }

    #[test]
    fn reserved_encoding_ends_block_early() {
        let start = 0x0880_0400;
        let mut src = TestSource::with_program(
            start,
            &[
                0x2408_0001, // addiu t0, r0, 1
                0x0000_0005, // SPECIAL funct 0x05: reserved
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert!(trace.ended_on_reserved);
        assert!(!trace.has_control_flow);
    }

    #[test]
    fn hard_cap_produces_synthetic_fallthrough() {
        let start = 0x0880_0500;
        let words: Vec<u32> = (0..32).map(|_| 0x2508_0001).collect(); // addiu t0, t0, 1
        let mut src = TestSource::with_program(start, &words);
        let req = CompileRequest { start_pc: start, max_instructions: 8 };
        let trace = build_trace(&req, &mut src).unwrap();
        assert_eq!(trace.instruction_count, 8);
        assert!(!trace.has_control_flow);
    }

    #[test]
    fn constants_fold_lui_ori_pairs() {
        let start = 0x0880_0600;
        let mut src = TestSource::with_program(
            start,
            &[
                0x3C08_0890, // lui t0, 0x0890
                0x3508_1234, // ori t0, t0, 0x1234
                0x8D09_0000, // lw t1, 0(t0)
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_eq!(trace.consts_in[1][8], Some(0x0890_0000));
        assert_eq!(trace.consts_in[2][8], Some(0x0890_1234));
        // The load's def kills the constant for t1, r0 stays pinned.
        assert_eq!(trace.consts_in[2][0], Some(0));
    }

    #[test]
    fn liveness_kills_overwritten_defs() {
        let start = 0x0880_0700;
        let mut src = TestSource::with_program(
            start,
            &[
                0x2408_0001, // addiu t0, r0, 1   (dead: overwritten below)
                0x2408_0002, // addiu t0, r0, 2
                0x0100_4821, // addu t1, t0, r0
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        // After step 0 the next event for t0 is a redefinition.
        assert_eq!(trace.live_out[0] & (1 << 8), 0);
        // After step 1, t0 is read by the addu.
        assert_ne!(trace.live_out[1] & (1 << 8), 0);
    }

    #[test]
    fn helper_visible_ops_make_everything_live() {
        let start = 0x0880_0800;
        let lwl = (0x22u32 << 26) | (9 << 21) | (8 << 16); // lwl t0, 0(t1)
        let mut src = TestSource::with_program(
            start,
            &[
                0x2408_0001, // addiu t0, r0, 1
                lwl,         // host-step: reads the whole register file
                0x2408_0002, // addiu t0, r0, 2
            ],
        );
        let trace = build_trace(&request(start), &mut src).unwrap();
        assert_ne!(trace.live_out[0] & (1 << 8), 0);
    }
}
