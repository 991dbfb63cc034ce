//! IR Verifier
//!
//! Structural and semantic checks run after building and after every
//! pipeline iteration:
//!
//! - every value is defined exactly once;
//! - every use is dominated by its definition (the cross-block
//!   definite-assignment rule; passes call this before committing a rewrite
//!   that expands value reuse, and skip the rewrite on failure);
//! - terminator targets exist and branch arguments match target parameter
//!   counts;
//! - tier legality: Tier-0 functions contain no guards and no deopt edges;
//!   Tier-1 guards carry exactly one deopt target.

use super::{BlockId, Function, Terminator, Tier, ValueId};
use crate::opt::cfg::Cfg;
use std::collections::HashMap;

/// Verify a function. Returns the first violation found.
pub fn verify(func: &Function) -> Result<(), String> {
    let cfg = Cfg::compute(func);
    verify_definitions(func)?;
    verify_dominance(func, &cfg)?;
    verify_terminators(func)?;
    verify_tier(func)?;
    Ok(())
}

/// Where a value is defined: block plus instruction position (params are
/// position 0, instruction i is position i + 1).
#[derive(Clone, Copy)]
struct DefSite {
    block: BlockId,
    position: usize,
}

fn collect_defs(func: &Function) -> Result<HashMap<ValueId, DefSite>, String> {
    let mut defs: HashMap<ValueId, DefSite> = HashMap::new();
    let mut define = |v: ValueId, site: DefSite| -> Result<(), String> {
        if defs.insert(v, site).is_some() {
            return Err(format!("value {} defined more than once", v));
        }
        Ok(())
    };
    for b in func.block_ids() {
        let block = func.block(b);
        for (v, _) in &block.params {
            define(*v, DefSite { block: b, position: 0 })?;
        }
        for (i, inst) in block.insts.iter().enumerate() {
            if let Some(r) = inst.result {
                define(
                    r,
                    DefSite {
                        block: b,
                        position: i + 1,
                    },
                )?;
            }
        }
    }
    Ok(defs)
}

fn verify_definitions(func: &Function) -> Result<(), String> {
    collect_defs(func).map(|_| ())
}

fn verify_dominance(func: &Function, cfg: &Cfg) -> Result<(), String> {
    let defs = collect_defs(func)?;
    let check_use = |v: ValueId, block: BlockId, position: usize| -> Result<(), String> {
        let Some(def) = defs.get(&v) else {
            return Err(format!("use of undefined value {} in {}", v, block));
        };
        if def.block == block {
            if def.position > position {
                return Err(format!(
                    "use of {} in {} precedes its definition",
                    v, block
                ));
            }
            return Ok(());
        }
        if !cfg.dominates(def.block, block) {
            return Err(format!(
                "use of {} in {} is not dominated by its definition in {}",
                v, block, def.block
            ));
        }
        Ok(())
    };

    for b in func.block_ids() {
        if !cfg.reachable[b.0 as usize] {
            continue; // dead blocks are pruned by canonicalize, not verified
        }
        let block = func.block(b);
        for (i, inst) in block.insts.iter().enumerate() {
            for &arg in &inst.args {
                check_use(arg, b, i + 1)?;
            }
        }
        for v in block.term.operands() {
            check_use(v, b, block.insts.len() + 1)?;
        }
    }
    Ok(())
}

fn verify_terminators(func: &Function) -> Result<(), String> {
    let n = func.blocks.len() as u32;
    for b in func.block_ids() {
        let block = func.block(b);
        for target in block.term.successors() {
            if target.0 >= n {
                return Err(format!("{} targets nonexistent block {}", b, target));
            }
        }
        // Branch argument counts must match target parameter counts.
        let check_args = |target: BlockId, given: usize| -> Result<(), String> {
            let expected = func.block(target).params.len();
            if expected != given {
                return Err(format!(
                    "{} passes {} argument(s) to {} which expects {}",
                    b, given, target, expected
                ));
            }
            Ok(())
        };
        match &block.term {
            Terminator::Jump { target, args } => check_args(*target, args.len())?,
            Terminator::Branch {
                then_target,
                then_args,
                else_target,
                else_args,
                ..
            } => {
                check_args(*then_target, then_args.len())?;
                check_args(*else_target, else_args.len())?;
            }
            Terminator::TryStart { body, handler } => {
                check_args(*body, 0)?;
                // The handler receives the in-flight exception value.
                let handler_params = func.block(*handler).params.len();
                if handler_params > 1 {
                    return Err(format!(
                        "{} try handler {} takes {} parameters (at most 1)",
                        b, handler, handler_params
                    ));
                }
            }
            Terminator::TryEnd { cont } => check_args(*cont, 0)?,
            Terminator::StateSwitch {
                targets, default, ..
            } => {
                for (_, t) in targets {
                    check_args(*t, 0)?;
                }
                check_args(*default, 0)?;
            }
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => {}
        }
    }
    Ok(())
}

fn verify_tier(func: &Function) -> Result<(), String> {
    for b in func.block_ids() {
        for inst in &func.block(b).insts {
            let is_guard = inst.kind.is_guard();
            match func.tier {
                Tier::Tier0 => {
                    if is_guard {
                        return Err(format!(
                            "tier-0 function contains a guard in {}",
                            b
                        ));
                    }
                    if inst.deopt.is_some() {
                        return Err(format!(
                            "tier-0 function contains a deopt edge in {}",
                            b
                        ));
                    }
                }
                Tier::Tier1 => {
                    if is_guard && inst.deopt.is_none() {
                        return Err(format!("guard in {} lacks a deopt target", b));
                    }
                    if !is_guard && inst.deopt.is_some() {
                        return Err(format!(
                            "non-guard instruction in {} carries a deopt edge",
                            b
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// The cross-block definite-assignment check on its own, for passes that
/// must validate an expanded value reuse before committing it.
pub fn verify_definite_assignment(func: &Function) -> Result<(), String> {
    let cfg = Cfg::compute(func);
    verify_dominance(func, &cfg)
}

#[cfg(test)]
mod tests {
    use super::super::builder::FunctionBuilder;
    use super::super::{GuardOp, OpKind, TagKind, Terminator, Tier, Ty, ValueId};
    use super::*;

    #[test]
    fn test_valid_function_passes() {
        let mut b = FunctionBuilder::new("ok", vec![Ty::Int], Tier::Tier0);
        let x = b.param(0);
        let one = b.const_int(1);
        let sum = b.ins(OpKind::Add, vec![x, one]);
        b.ret(sum);
        assert_eq!(verify(&b.finish()), Ok(()));
    }

    #[test]
    fn test_use_before_def_rejected() {
        let mut b = FunctionBuilder::new("bad", vec![], Tier::Tier0);
        // Use a value id that is never defined.
        let phantom = ValueId(999);
        b.ret(phantom);
        let err = verify(&b.finish()).unwrap_err();
        assert!(err.contains("undefined value"));
    }

    #[test]
    fn test_non_dominating_def_rejected() {
        let mut b = FunctionBuilder::new("bad_dom", vec![Ty::Bool], Tier::Tier0);
        let then_b = b.new_block(vec![]);
        let else_b = b.new_block(vec![]);
        let join = b.new_block(vec![]);
        let cond = b.param(0);
        b.branch(cond, then_b, vec![], else_b, vec![]);
        b.switch_to(then_b);
        let only_here = b.const_int(1);
        b.jump(join, vec![]);
        b.switch_to(else_b);
        b.jump(join, vec![]);
        b.switch_to(join);
        // Using a then-branch value at the join is not dominated.
        b.ret(only_here);
        let err = verify(&b.finish()).unwrap_err();
        assert!(err.contains("not dominated"), "got: {}", err);
    }

    #[test]
    fn test_branch_arg_count_mismatch() {
        let mut b = FunctionBuilder::new("bad_args", vec![], Tier::Tier0);
        let target = b.new_block(vec![Ty::Int]);
        b.jump(target, vec![]); // expects one argument
        b.switch_to(target);
        let params = b.block_params(target);
        b.ret(params[0]);
        let err = verify(&b.finish()).unwrap_err();
        assert!(err.contains("expects 1"), "got: {}", err);
    }

    #[test]
    fn test_tier0_rejects_guards() {
        let mut b = FunctionBuilder::new("t0_guard", vec![Ty::Int], Tier::Tier0);
        let deopt = b.new_block(vec![]);
        let x = b.param(0);
        b.ins_guard(GuardOp::Tag { tag: TagKind::Int }, 1, vec![x], deopt);
        b.ret(x);
        b.switch_to(deopt);
        b.terminate(Terminator::Unreachable);
        let err = verify(&b.finish()).unwrap_err();
        assert!(err.contains("tier-0"), "got: {}", err);
    }

    #[test]
    fn test_tier1_guard_needs_deopt() {
        let mut b = FunctionBuilder::new("t1_bare", vec![Ty::Int], Tier::Tier1);
        let x = b.param(0);
        // A guard inserted without a deopt edge (bypassing ins_guard).
        b.ins_void(
            OpKind::Guard {
                op: GuardOp::Tag { tag: TagKind::Int },
                site: 0,
            },
            vec![x],
        );
        b.ret(x);
        let err = verify(&b.finish()).unwrap_err();
        assert!(err.contains("lacks a deopt target"), "got: {}", err);
    }
}
