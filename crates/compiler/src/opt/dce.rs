//! Dead Code Elimination
//!
//! Removes instructions whose result is unused and whose effect class makes
//! them deletable (`pure` and `read_heap`). Guards are never deleted here:
//! they are control-dependence, removable only when simplify or SCCP proves
//! them no-ops. Runs to a local fixed point so chains of dead producers
//! disappear in one pass.

use crate::opt::PassStats;
use crate::tir::{Function, ValueId};
use std::collections::HashMap;

pub fn run(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut changed = false;
    loop {
        let mut uses: HashMap<ValueId, usize> = HashMap::new();
        for b in func.block_ids() {
            let block = func.block(b);
            for inst in &block.insts {
                for &a in &inst.args {
                    *uses.entry(a).or_insert(0) += 1;
                }
            }
            for v in block.term.operands() {
                *uses.entry(v).or_insert(0) += 1;
            }
        }

        let before: usize = func.blocks.iter().map(|b| b.insts.len()).sum();
        for b in func.block_ids() {
            func.block_mut(b).insts.retain(|inst| {
                if inst.kind.is_guard() {
                    return true;
                }
                if !inst.kind.effect().is_removable_when_unused() {
                    return true;
                }
                match inst.result {
                    Some(r) => uses.get(&r).copied().unwrap_or(0) > 0,
                    // A result-less instruction with a removable effect does
                    // nothing at all.
                    None => false,
                }
            });
        }
        let after: usize = func.blocks.iter().map(|b| b.insts.len()).sum();
        if after == before {
            break;
        }
        stats.dce_removed += (before - after) as u64;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tir::builder::FunctionBuilder;
    use crate::tir::{OpKind, Tier, Ty};

    #[test]
    fn test_dead_chain_removed_in_one_run() {
        let mut b = FunctionBuilder::new("deadchain", vec![Ty::Int], Tier::Tier0);
        let x = b.param(0);
        let one = b.const_int(1);
        let dead1 = b.ins(OpKind::Add, vec![x, one]);
        let _dead2 = b.ins(OpKind::Mul, vec![dead1, one]);
        b.ret(x);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        // Everything but nothing remains: the whole chain plus the constant
        // feeding it was dead.
        assert!(f.block(Function::ENTRY).insts.is_empty());
        assert_eq!(stats.dce_removed, 3);
    }

    #[test]
    fn test_side_effects_survive() {
        let mut b = FunctionBuilder::new("effects", vec![Ty::List], Tier::Tier0);
        let list = b.param(0);
        let one = b.const_int(1);
        let _len = b.ins(
            OpKind::CallIntrinsic { name: "list.append".into() },
            vec![list, one],
        );
        b.ret(list);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(!run(&mut f, &mut stats));
        assert_eq!(f.block(Function::ENTRY).insts.len(), 2);
    }

    #[test]
    fn test_guards_never_deleted_by_dce() {
        use crate::tir::{GuardOp, TagKind, Terminator};
        let mut b = FunctionBuilder::new("guarded", vec![Ty::Any], Tier::Tier1);
        let deopt = b.new_block(vec![]);
        let x = b.param(0);
        b.ins_guard(GuardOp::Tag { tag: TagKind::Int }, 2, vec![x], deopt);
        b.ret(x);
        b.switch_to(deopt);
        b.terminate(Terminator::Return(x));
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(!run(&mut f, &mut stats));
        assert!(f.block(Function::ENTRY).insts[0].kind.is_guard());
    }
}
