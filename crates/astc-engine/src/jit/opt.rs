//! Peephole optimization
//!
//! Three passes over the decoded instruction list, all gated on the
//! context's optimization flag (the driver skips this module entirely when
//! it is off):
//! - constant folding of `CONST a; CONST b; ADD|SUB|MUL`
//! - collapsing runs of NOPs to a single NOP
//! - suppressing code between a HALT and the next jump target
//!
//! Eliminated instructions keep their payload offset in the list as `None`
//! entries so branch targets still map to a code offset.

use rustc_hash::FxHashSet;

use crate::bytecode::Instr;

/// Result of the optimization pass
#[derive(Debug)]
pub struct OptOutcome {
    /// Instruction list with eliminated entries as `None`
    pub instrs: Vec<(u32, Option<Instr>)>,
    /// Number of peephole rewrites performed
    pub applied: u32,
}

/// Payload offsets that some branch can land on
fn jump_targets(instrs: &[(u32, Instr)]) -> FxHashSet<u32> {
    let mut targets = FxHashSet::default();
    for (_, instr) in instrs {
        match instr {
            Instr::Jump(t) | Instr::JumpIfFalse(t) | Instr::CallUser(t) => {
                targets.insert(*t);
            }
            _ => {}
        }
    }
    targets
}

/// Run every peephole pass and return the rewritten list
pub fn optimize(instrs: &[(u32, Instr)]) -> OptOutcome {
    let targets = jump_targets(instrs);
    let mut items: Vec<(u32, Option<Instr>)> =
        instrs.iter().map(|(pc, i)| (*pc, Some(i.clone()))).collect();
    let mut applied = 0;

    applied += fold_constants(&mut items, &targets);
    applied += collapse_nops(&mut items, &targets);
    applied += suppress_after_halt(&mut items, &targets);

    OptOutcome { instrs: items, applied }
}

/// `CONST a; CONST b; OP` computes at compile time when no branch lands in
/// the middle of the triple. Runs to a fixpoint so chains fold through.
fn fold_constants(items: &mut [(u32, Option<Instr>)], targets: &FxHashSet<u32>) -> u32 {
    let mut applied = 0;
    loop {
        let mut changed = false;
        // Indices of surviving instructions.
        let live: Vec<usize> = (0..items.len()).filter(|&i| items[i].1.is_some()).collect();
        for w in live.windows(3) {
            let (i, j, k) = (w[0], w[1], w[2]);
            let (Some(Instr::ConstI32(a)), Some(Instr::ConstI32(b))) =
                (&items[i].1, &items[j].1)
            else {
                continue;
            };
            let (a, b) = (*a, *b);
            let folded = match items[k].1 {
                Some(Instr::Add) => a.wrapping_add(b),
                Some(Instr::Sub) => a.wrapping_sub(b),
                Some(Instr::Mul) => a.wrapping_mul(b),
                _ => continue,
            };
            // A branch into the middle of the triple observes intermediate
            // stack state; leave such triples alone.
            if targets.contains(&items[j].0) || targets.contains(&items[k].0) {
                continue;
            }
            items[i].1 = Some(Instr::ConstI32(folded));
            items[j].1 = None;
            items[k].1 = None;
            applied += 1;
            changed = true;
            break;
        }
        if !changed {
            return applied;
        }
    }
}

/// Consecutive NOPs collapse to one. A NOP that is a branch target still
/// collapses: its offset maps to the next emitted instruction, which is
/// where a NOP would have fallen through anyway.
fn collapse_nops(items: &mut [(u32, Option<Instr>)], _targets: &FxHashSet<u32>) -> u32 {
    let mut applied = 0;
    let mut previous_was_nop = false;
    for item in items.iter_mut() {
        match &item.1 {
            Some(Instr::Nop) => {
                if previous_was_nop {
                    item.1 = None;
                    applied += 1;
                }
                previous_was_nop = true;
            }
            Some(_) => previous_was_nop = false,
            None => {}
        }
    }
    applied
}

/// Code after a HALT is unreachable until the next jump target
fn suppress_after_halt(items: &mut [(u32, Option<Instr>)], targets: &FxHashSet<u32>) -> u32 {
    let mut applied = 0;
    let mut dead = false;
    for item in items.iter_mut() {
        if targets.contains(&item.0) {
            dead = false;
        }
        if dead && item.1.is_some() {
            item.1 = None;
            applied += 1;
            continue;
        }
        if matches!(item.1, Some(Instr::Halt)) {
            dead = true;
        }
    }
    applied
}
