//! Reference interpreter
//!
//! Direct execution of the decoded instruction stream with the same
//! observable semantics as compiled code: 64-bit operand slots carrying
//! 32-bit values, 32-bit local slots, two's-complement arithmetic on the
//! low halves, division traps, and libc forwarding through the same
//! resolver. The optimizer equivalence tests use this as their oracle.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::bytecode::{AstcProgram, Instr};
use crate::forwarding::{call_forwarded, LibcResolver, MAX_LIBC_ARGS};
use crate::jit::StringPool;

/// Interpreter errors
#[derive(Debug, Error)]
pub enum InterpError {
    /// Execution trapped (division by zero or overflow, or control fell off
    /// the end of the program)
    #[error("Trap during execution: {0}")]
    Trap(String),

    /// An instruction popped from an empty stack
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(u32),

    /// A branch landed outside any instruction boundary
    #[error("Invalid jump target {target} at offset {pc}")]
    InvalidJumpTarget {
        /// Offset of the branching instruction
        pc: u32,
        /// The bad target
        target: u32,
    },

    /// The program uses something the interpreter cannot do
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A `LIBC_CALL` id has no registered forwarding function
    #[error("Unresolved libc function id {0:#06x}")]
    UnresolvedLibcFunction(u16),
}

/// Execute a parsed program and return the value HALT popped
pub fn run(program: &AstcProgram, libc: Option<&dyn LibcResolver>) -> Result<i32, InterpError> {
    let index: FxHashMap<u32, usize> = program
        .instrs
        .iter()
        .enumerate()
        .map(|(i, (pc, _))| (*pc, i))
        .collect();
    let end = program.end_offset();
    let pool = StringPool::build(&program.strings);

    // Local slots are 32-bit values at byte offsets, like the compiled
    // frame.
    let mut max_local_end = 0usize;
    for (_, instr) in &program.instrs {
        if let Instr::StoreLocal(off) | Instr::LoadLocal(off) = instr {
            max_local_end = max_local_end.max(*off as usize + 4);
        }
    }
    let mut locals = vec![0u8; max_local_end.max(48)];

    let mut stack: Vec<i64> = Vec::new();
    let mut ip = match index.get(&program.entry_offset) {
        Some(&i) => i,
        None => {
            return Err(InterpError::Trap(
                "entry offset is not an instruction boundary".into(),
            ))
        }
    };

    loop {
        let Some((pc, instr)) = program.instrs.get(ip) else {
            return Err(InterpError::Trap(
                "execution fell off the end of the program".into(),
            ));
        };
        let pc = *pc;
        let mut pop = |stack: &mut Vec<i64>| stack.pop().ok_or(InterpError::StackUnderflow(pc));

        // Branch helper: end-of-payload traps, anything else must be a
        // boundary.
        let branch_to = |target: u32| -> Result<Option<usize>, InterpError> {
            if target == end {
                return Ok(None);
            }
            index
                .get(&target)
                .map(|&i| Some(i))
                .ok_or(InterpError::InvalidJumpTarget { pc, target })
        };

        match instr {
            Instr::Nop => ip += 1,
            Instr::Halt => {
                let value = pop(&mut stack)?;
                return Ok(value as i32);
            }
            Instr::ConstI32(v) => {
                stack.push((*v as u32) as i64);
                ip += 1;
            }
            Instr::ConstString(i) => {
                let ptr = pool.address_of(*i).ok_or_else(|| {
                    InterpError::UnsupportedFeature(format!("string index {} out of range", i))
                })?;
                stack.push(ptr as i64);
                ip += 1;
            }
            Instr::Add | Instr::Sub | Instr::Mul => {
                let b = pop(&mut stack)? as i32;
                let a = pop(&mut stack)? as i32;
                let result = match instr {
                    Instr::Add => a.wrapping_add(b),
                    Instr::Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                };
                stack.push((result as u32) as i64);
                ip += 1;
            }
            Instr::Div => {
                let b = pop(&mut stack)? as i32;
                let a = pop(&mut stack)? as i32;
                let result = a
                    .checked_div(b)
                    .ok_or_else(|| InterpError::Trap("integer division trap".into()))?;
                stack.push((result as u32) as i64);
                ip += 1;
            }
            Instr::StoreLocal(off) => {
                let value = pop(&mut stack)? as u32;
                let off = *off as usize;
                locals[off..off + 4].copy_from_slice(&value.to_le_bytes());
                ip += 1;
            }
            Instr::LoadLocal(off) => {
                let off = *off as usize;
                let value = u32::from_le_bytes(locals[off..off + 4].try_into().unwrap());
                stack.push(value as i64);
                ip += 1;
            }
            Instr::Jump(target) | Instr::CallUser(target) => match branch_to(*target)? {
                Some(next) => ip = next,
                None => {
                    return Err(InterpError::Trap(
                        "execution fell off the end of the program".into(),
                    ))
                }
            },
            Instr::JumpIfFalse(target) => {
                let cond = pop(&mut stack)? as i32;
                if cond == 0 {
                    match branch_to(*target)? {
                        Some(next) => ip = next,
                        None => {
                            return Err(InterpError::Trap(
                                "execution fell off the end of the program".into(),
                            ))
                        }
                    }
                } else {
                    ip += 1;
                }
            }
            Instr::LibcCall { func_id, argc } => {
                if *argc as usize > MAX_LIBC_ARGS {
                    return Err(InterpError::UnsupportedFeature(format!(
                        "libc call with {} arguments exceeds the four-register convention",
                        argc
                    )));
                }
                let resolver = libc.ok_or_else(|| {
                    InterpError::UnsupportedFeature(
                        "program performs libc calls but no resolver is attached".into(),
                    )
                })?;
                let ptr = resolver
                    .resolve(*func_id)
                    .ok_or(InterpError::UnresolvedLibcFunction(*func_id))?;
                let mut args = Vec::with_capacity(*argc as usize);
                for _ in 0..*argc {
                    args.push(pop(&mut stack)?);
                }
                args.reverse();
                // Safety: the resolver vouches for the target's C ABI; the
                // argument count was bounded above.
                let result = unsafe { call_forwarded(ptr, &args) };
                stack.push(result);
                ip += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{AstcProgram, ProgramBuilder};
    use crate::forwarding::LibcResolver;

    fn exec(bytes: Vec<u8>) -> Result<i32, InterpError> {
        let program = AstcProgram::parse(&bytes, false).unwrap();
        run(&program, None)
    }

    #[test]
    fn test_s1_constant_arithmetic() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).const_i32(7).add().halt();
        assert_eq!(exec(builder.finish(0)).unwrap(), 12);
    }

    #[test]
    fn test_s2_locals() {
        let mut builder = ProgramBuilder::new();
        builder
            .const_i32(3)
            .store_local(4)
            .const_i32(4)
            .store_local(8)
            .load_local(4)
            .load_local(8)
            .mul()
            .halt();
        assert_eq!(exec(builder.finish(0)).unwrap(), 12);
    }

    #[test]
    fn test_arithmetic_edge_cases() {
        let cases: &[(i32, i32, fn(&mut ProgramBuilder), i32)] = &[
            (i32::MAX, 1, |b| {
                b.add();
            }, i32::MIN),
            (i32::MIN, 1, |b| {
                b.sub();
            }, i32::MAX),
            (-7, 3, |b| {
                b.mul();
            }, -21),
            (-7, 2, |b| {
                b.div();
            }, -3),
        ];
        for (a, b, op, expected) in cases {
            let mut builder = ProgramBuilder::new();
            builder.const_i32(*a).const_i32(*b);
            op(&mut builder);
            builder.halt();
            assert_eq!(exec(builder.finish(0)).unwrap(), *expected);
        }
    }

    #[test]
    fn test_division_by_zero_traps() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(6).const_i32(0).div().halt();
        assert!(matches!(exec(builder.finish(0)), Err(InterpError::Trap(_))));
    }

    #[test]
    fn test_division_overflow_traps() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(i32::MIN).const_i32(-1).div().halt();
        assert!(matches!(exec(builder.finish(0)), Err(InterpError::Trap(_))));
    }

    #[test]
    fn test_branching_loop() {
        // local0 = 5; acc(local4) = 0; while (local0) { acc += local0; local0 -= 1 }
        let mut builder = ProgramBuilder::new();
        builder.const_i32(5).store_local(0);
        builder.const_i32(0).store_local(4);
        let loop_start = builder.pos();
        builder.load_local(0);
        let exit = builder.jump_if_false_placeholder();
        builder.load_local(4).load_local(0).add().store_local(4);
        builder.load_local(0).const_i32(1).sub().store_local(0);
        builder.jump(loop_start);
        builder.patch_target(exit, builder.pos());
        builder.load_local(4).halt();
        assert_eq!(exec(builder.finish(0)).unwrap(), 15);
    }

    #[test]
    fn test_fall_off_end_traps() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1);
        assert!(matches!(exec(builder.finish(0)), Err(InterpError::Trap(_))));
    }

    #[test]
    fn test_entry_offset_starts_mid_program() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(1).halt(); // skipped
        let entry = builder.pos();
        builder.const_i32(9).halt();
        let program = AstcProgram::parse(&builder.finish(entry), false).unwrap();
        assert_eq!(run(&program, None).unwrap(), 9);
    }

    #[test]
    fn test_call_user_transfers_control() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(20);
        let site = builder.pos();
        builder.call_user(0); // placeholder target, patched below
        let f = builder.pos();
        builder.const_i32(2).mul().halt();
        builder.patch_target(site + 1, f);
        assert_eq!(exec(builder.finish(0)).unwrap(), 40);
    }

    struct CountingResolver {
        target: unsafe extern "C" fn(usize) -> usize,
    }

    unsafe extern "C" fn double_it(x: usize) -> usize {
        x * 2
    }

    impl LibcResolver for CountingResolver {
        fn resolve(&self, func_id: u16) -> Option<*const u8> {
            (func_id == 1).then(|| self.target as *const u8)
        }

        fn name(&self, func_id: u16) -> Option<&str> {
            (func_id == 1).then_some("double_it")
        }
    }

    #[test]
    fn test_libc_call_through_resolver() {
        let mut builder = ProgramBuilder::new();
        builder.const_i32(21).libc_call(1, 1).halt();
        let program = AstcProgram::parse(&builder.finish(0), false).unwrap();
        let resolver = CountingResolver { target: double_it };
        assert_eq!(run(&program, Some(&resolver)).unwrap(), 42);
    }

    #[test]
    fn test_libc_call_unknown_id() {
        let mut builder = ProgramBuilder::new();
        builder.libc_call(0xDEAD, 0).halt();
        let program = AstcProgram::parse(&builder.finish(0), false).unwrap();
        let resolver = CountingResolver { target: double_it };
        assert!(matches!(
            run(&program, Some(&resolver)),
            Err(InterpError::UnresolvedLibcFunction(0xDEAD))
        ));
    }

    #[test]
    fn test_libc_call_without_resolver() {
        let mut builder = ProgramBuilder::new();
        builder.libc_call(1, 0).halt();
        assert!(matches!(
            exec(builder.finish(0)),
            Err(InterpError::UnsupportedFeature(_))
        ));
    }
}
