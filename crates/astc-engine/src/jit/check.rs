//! Symbolic stack verification
//!
//! Walks the instruction graph from the entry point computing the operand
//! stack depth at every reachable instruction. Underflow, inconsistent
//! depths at a merge point, and branches to non-boundaries are all rejected
//! before any code is emitted.

use rustc_hash::FxHashMap;

use crate::bytecode::{stack_effect, AstcProgram, Instr};
use crate::codegen::CodegenError;

/// Maximum operand stack depth the engine accepts
pub const MAX_STACK_DEPTH: u32 = 4096;

/// Compute the stack depth at the entry of every reachable instruction
///
/// The returned map is keyed by payload offset. Branches to the end of the
/// payload are allowed (they fall into the trap exit); everything else must
/// land on an instruction boundary.
pub fn stack_check(program: &AstcProgram) -> Result<FxHashMap<u32, u32>, CodegenError> {
    let index: FxHashMap<u32, usize> = program
        .instrs
        .iter()
        .enumerate()
        .map(|(i, (pc, _))| (*pc, i))
        .collect();
    let end = program.end_offset();

    let mut depths: FxHashMap<u32, u32> = FxHashMap::default();
    let mut worklist: Vec<(u32, u32)> = Vec::new();

    let schedule = |pc: u32,
                        depth: u32,
                        depths: &mut FxHashMap<u32, u32>,
                        worklist: &mut Vec<(u32, u32)>|
     -> Result<(), CodegenError> {
        if pc == end {
            // Falls into the trap exit; no instruction to check.
            return Ok(());
        }
        if !index.contains_key(&pc) {
            return Err(CodegenError::UnpatchableJump(pc));
        }
        match depths.get(&pc) {
            Some(&known) if known != depth => {
                Err(CodegenError::InvalidInstructionSequence(format!(
                    "stack depth {} at offset {} conflicts with earlier depth {}",
                    depth, pc, known
                )))
            }
            Some(_) => Ok(()),
            None => {
                depths.insert(pc, depth);
                worklist.push((pc, depth));
                Ok(())
            }
        }
    };

    if !program.instrs.is_empty() {
        schedule(program.entry_offset, 0, &mut depths, &mut worklist)?;
    }

    while let Some((pc, depth)) = worklist.pop() {
        let idx = index[&pc];
        let (_, instr) = &program.instrs[idx];
        let (pops, pushes) = stack_effect(instr);
        if depth < pops {
            return Err(CodegenError::InvalidInstructionSequence(format!(
                "stack underflow at offset {}: depth {} with {} pops",
                pc, depth, pops
            )));
        }
        let after = depth - pops + pushes;
        if after > MAX_STACK_DEPTH {
            return Err(CodegenError::InvalidInstructionSequence(format!(
                "stack depth {} at offset {} exceeds the limit",
                after, pc
            )));
        }

        let next_pc = program
            .instrs
            .get(idx + 1)
            .map(|(pc, _)| *pc)
            .unwrap_or(end);

        match instr {
            Instr::Halt => {}
            Instr::Jump(target) | Instr::CallUser(target) => {
                schedule(*target, after, &mut depths, &mut worklist)?;
            }
            Instr::JumpIfFalse(target) => {
                schedule(*target, after, &mut depths, &mut worklist)?;
                schedule(next_pc, after, &mut depths, &mut worklist)?;
            }
            _ => {
                schedule(next_pc, after, &mut depths, &mut worklist)?;
            }
        }
    }

    Ok(depths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{AstcProgram, ProgramBuilder};

    fn parse(bytes: Vec<u8>) -> AstcProgram {
        AstcProgram::parse(&bytes, false).unwrap()
    }

    #[test]
    fn test_depths_match_static_table() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        let program = parse(builder.finish(0));
        let depths = stack_check(&program).unwrap();
        assert_eq!(depths[&0], 0); // before first const
        assert_eq!(depths[&5], 1); // before second const
        assert_eq!(depths[&10], 2); // before add
        assert_eq!(depths[&11], 1); // before halt
    }

    #[test]
    fn test_underflow_rejected() {
        let mut builder = ProgramBuilder::new();
        builder.add(); // pops two from an empty stack
        let program = parse(builder.halt_value(0).finish(0));
        assert!(matches!(
            stack_check(&program),
            Err(CodegenError::InvalidInstructionSequence(_))
        ));
    }

    #[test]
    fn test_merge_depth_conflict_rejected() {
        // Jumping back to offset 0 with depth 1 conflicts with entry depth 0.
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1).jump(0);
        let program = parse(builder.finish(0));
        assert!(matches!(
            stack_check(&program),
            Err(CodegenError::InvalidInstructionSequence(_))
        ));
    }

    #[test]
    fn test_branch_to_non_boundary_rejected() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1).jump(2); // 2 is inside the const operand
        let program = parse(builder.finish(0));
        assert!(matches!(
            stack_check(&program),
            Err(CodegenError::UnpatchableJump(2))
        ));
    }

    #[test]
    fn test_branch_to_payload_end_allowed() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1);
        let end = builder.pos() + 5; // after the jump itself
        builder.jump(end);
        let program = parse(builder.finish(0));
        stack_check(&program).unwrap();
    }

    #[test]
    fn test_balanced_branches_merge() {
        // if (x) {1} else {2} shaped: both sides reach the join at depth 1.
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1);
        let to_else = builder.jump_if_false_placeholder();
        builder.const_i32(10);
        let to_join = builder.jump_placeholder();
        builder.patch_target(to_else, builder.pos());
        builder.const_i32(20);
        builder.patch_target(to_join, builder.pos());
        builder.halt();
        let program = parse(builder.finish(0));
        stack_check(&program).unwrap();
    }
}
