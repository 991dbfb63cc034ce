//! Simplify
//!
//! The first pass of every pipeline iteration: trivial block-parameter
//! elision, proven-no-op guard removal from type facts, and constant folding
//! of compile-time operators. Everything here is a local rewrite; edge
//! threading belongs to SCCP and region surgery to canonicalize.

use crate::opt::cfg::Cfg;
use crate::opt::{replace_uses, PassStats};
use crate::tfa::{Trust, TypeFacts};
use crate::tir::verify::verify_definite_assignment;
use crate::tir::{BlockId, Const, Function, GuardOp, OpKind, TagKind, Terminator, ValueId};
use std::collections::HashMap;

pub fn run(
    func: &mut Function,
    cfg: &Cfg,
    tfa: &TypeFacts,
    module: &str,
    stats: &mut PassStats,
) -> bool {
    let mut changed = false;
    changed |= fold_constants(func, cfg, stats);
    changed |= remove_proven_guards(func, tfa, module, stats);
    changed |= elide_trivial_params(func, cfg, stats);
    changed
}

// =============================================================================
// Constant folding
// =============================================================================

fn fold_constants(func: &mut Function, cfg: &Cfg, stats: &mut PassStats) -> bool {
    let mut consts: HashMap<ValueId, Const> = HashMap::new();
    for b in func.block_ids() {
        for inst in &func.block(b).insts {
            if let (Some(r), OpKind::Const(c)) = (inst.result, &inst.kind) {
                consts.insert(r, c.clone());
            }
        }
    }

    let mut changed = false;
    for &b in &cfg.rpo {
        // Indexed loop: folding rewrites instructions in place.
        for i in 0..func.block(b).insts.len() {
            let inst = &func.block(b).insts[i];
            if inst.result.is_none() || matches!(inst.kind, OpKind::Const(_)) {
                continue;
            }
            let args: Option<Vec<Const>> = inst
                .args
                .iter()
                .map(|a| consts.get(a).cloned())
                .collect();
            let Some(args) = args else { continue };
            let Some(folded) = eval(&inst.kind, &args) else {
                continue;
            };
            let result = inst.result.unwrap();
            let inst = &mut func.block_mut(b).insts[i];
            inst.kind = OpKind::Const(folded.clone());
            inst.args.clear();
            consts.insert(result, folded);
            stats.simplify_applied += 1;
            changed = true;
        }
    }
    changed
}

/// Fold one compile-time operator over constant operands. Division and
/// modulo fold only for provably nonzero divisors (folding narrows their
/// effect from throw to pure, which is the legal direction).
pub(crate) fn eval(kind: &OpKind, args: &[Const]) -> Option<Const> {
    use Const::*;
    match (kind, args) {
        (OpKind::Add, [Int(a), Int(b)]) => a.checked_add(*b).map(Int),
        (OpKind::Sub, [Int(a), Int(b)]) => a.checked_sub(*b).map(Int),
        (OpKind::Mul, [Int(a), Int(b)]) => a.checked_mul(*b).map(Int),
        (OpKind::Add, [Float(a), Float(b)]) => Some(Float(a + b)),
        (OpKind::Sub, [Float(a), Float(b)]) => Some(Float(a - b)),
        (OpKind::Mul, [Float(a), Float(b)]) => Some(Float(a * b)),
        (OpKind::Div, [Float(a), Float(b)]) if *b != 0.0 => Some(Float(a / b)),
        (OpKind::Div, [Int(a), Int(b)]) if *b != 0 => Some(Float(*a as f64 / *b as f64)),
        (OpKind::FloorDiv, [Int(a), Int(b)]) if *b != 0 => Some(Int(a.div_euclid(*b))),
        (OpKind::Mod, [Int(a), Int(b)]) if *b != 0 => Some(Int(a.rem_euclid(*b))),
        (OpKind::Neg, [Int(a)]) => a.checked_neg().map(Int),
        (OpKind::Neg, [Float(a)]) => Some(Float(-a)),
        (OpKind::Not, [c]) => Some(Bool(!c.truthy())),
        (OpKind::BoolAnd, [a, b]) => Some(Bool(a.truthy() && b.truthy())),
        (OpKind::BoolOr, [a, b]) => Some(Bool(a.truthy() || b.truthy())),
        (OpKind::CmpEq, [a, b]) => Some(Bool(a == b)),
        (OpKind::CmpNe, [a, b]) => Some(Bool(a != b)),
        (OpKind::CmpLt, [Int(a), Int(b)]) => Some(Bool(a < b)),
        (OpKind::CmpLe, [Int(a), Int(b)]) => Some(Bool(a <= b)),
        (OpKind::CmpGt, [Int(a), Int(b)]) => Some(Bool(a > b)),
        (OpKind::CmpGe, [Int(a), Int(b)]) => Some(Bool(a >= b)),
        (OpKind::CmpLt, [Float(a), Float(b)]) => Some(Bool(a < b)),
        (OpKind::CmpLe, [Float(a), Float(b)]) => Some(Bool(a <= b)),
        (OpKind::CmpGt, [Float(a), Float(b)]) => Some(Bool(a > b)),
        (OpKind::CmpGe, [Float(a), Float(b)]) => Some(Bool(a >= b)),
        (OpKind::TypeOf, [c]) => Some(Str(type_name(c).into())),
        (OpKind::Contains, [Str(h), Str(n)]) => Some(Bool(h.contains(n.as_str()))),
        (OpKind::Index, [Str(s), Int(i)]) => {
            let i = usize::try_from(*i).ok()?;
            s.chars().nth(i).map(|c| Str(c.to_string()))
        }
        (OpKind::Len, [Str(s)]) => Some(Int(s.chars().count() as i64)),
        _ => Option::None,
    }
}

fn type_name(c: &Const) -> &'static str {
    match c {
        Const::Int(_) => "int",
        Const::Float(_) => "float",
        Const::Bool(_) => "bool",
        Const::None => "none",
        Const::Str(_) => "str",
        Const::Pending => "pending",
    }
}

// =============================================================================
// Guard removal from type facts
// =============================================================================

fn remove_proven_guards(
    func: &mut Function,
    tfa: &TypeFacts,
    module: &str,
    stats: &mut PassStats,
) -> bool {
    if func.param_names.is_empty() {
        return false;
    }
    // Map each parameter value to its trusted fact type, if any.
    let mut trusted: HashMap<ValueId, String> = HashMap::new();
    for (i, (v, _)) in func.params.iter().enumerate() {
        let Some(name) = func.param_names.get(i) else {
            continue;
        };
        if let Some(fact) = tfa.param_fact(module, &func.name, name)
            && fact.trust == Trust::Trusted
        {
            trusted.insert(*v, fact.ty.clone());
        }
    }
    if trusted.is_empty() {
        return false;
    }

    let mut changed = false;
    for b in func.block_ids() {
        let block = func.block_mut(b);
        let before = block.insts.len();
        block.insts.retain(|inst| {
            let OpKind::Guard { op, .. } = &inst.kind else {
                return true;
            };
            let Some(&subject) = inst.args.first() else {
                return true;
            };
            let Some(fact_ty) = trusted.get(&subject) else {
                return true;
            };
            !guard_proven_by_fact(op, fact_ty)
        });
        let removed = before - block.insts.len();
        if removed > 0 {
            stats.simplify_applied += removed as u64;
            changed = true;
        }
    }
    changed
}

/// Does a trusted fact of type `fact_ty` prove this guard passes?
fn guard_proven_by_fact(op: &GuardOp, fact_ty: &str) -> bool {
    match op {
        GuardOp::Tag { tag: TagKind::Int } => fact_ty == "int",
        GuardOp::Tag { tag: TagKind::Bool } => fact_ty == "bool",
        GuardOp::Tag { tag: TagKind::NoneTag } => fact_ty == "none",
        GuardOp::Tag { tag: TagKind::SmallStr } => false, // length-dependent
        GuardOp::Tag { tag: TagKind::Handle } => false,
        _ => false,
    }
}

// =============================================================================
// Trivial block-parameter elision
// =============================================================================

fn elide_trivial_params(func: &mut Function, cfg: &Cfg, stats: &mut PassStats) -> bool {
    // Snapshot: the rewrite is reverted wholesale if the verifier rejects it.
    let snapshot = func.clone();
    let mut subst: HashMap<ValueId, ValueId> = HashMap::new();
    let mut changed = false;

    for b in func.block_ids() {
        if b == Function::ENTRY {
            continue; // entry params are the function signature
        }
        if !cfg.reachable[b.0 as usize] {
            continue;
        }
        // Walk param positions right to left so removals keep indices valid.
        let param_count = func.block(b).params.len();
        for j in (0..param_count).rev() {
            let param = func.block(b).params[j].0;
            let mut unique: Option<ValueId> = None;
            let mut trivial = true;
            for &p in &cfg.preds[b.0 as usize] {
                if !cfg.reachable[p.0 as usize] {
                    continue;
                }
                for (target, args) in edge_args(&func.block(p).term) {
                    if target != b {
                        continue;
                    }
                    let passed = resolve(&subst, args[j]);
                    if passed == param {
                        continue; // self-carried (loop identity)
                    }
                    match unique {
                        None => unique = Some(passed),
                        Some(u) if u == passed => {}
                        Some(_) => {
                            trivial = false;
                        }
                    }
                }
            }
            let Some(replacement) = unique else { continue };
            if !trivial {
                continue;
            }
            // Drop the parameter and its argument on every incoming edge.
            subst.insert(param, replacement);
            func.block_mut(b).params.remove(j);
            for p in func.block_ids() {
                remove_edge_arg(&mut func.block_mut(p).term, b, j);
            }
            stats.simplify_applied += 1;
            changed = true;
        }
    }

    if !changed {
        return false;
    }
    replace_uses(func, &subst);
    if verify_definite_assignment(func).is_err() {
        // The expanded reuse failed verification: skip the transformation.
        *func = snapshot;
        return false;
    }
    changed
}

fn resolve(subst: &HashMap<ValueId, ValueId>, mut v: ValueId) -> ValueId {
    while let Some(&next) = subst.get(&v) {
        v = next;
    }
    v
}

/// (target, args) pairs of a terminator's argument-carrying edges.
fn edge_args(term: &Terminator) -> Vec<(BlockId, &Vec<ValueId>)> {
    match term {
        Terminator::Jump { target, args } => vec![(*target, args)],
        Terminator::Branch {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => vec![(*then_target, then_args), (*else_target, else_args)],
        _ => Vec::new(),
    }
}

fn remove_edge_arg(term: &mut Terminator, target: BlockId, index: usize) {
    match term {
        Terminator::Jump { target: t, args } if *t == target => {
            if index < args.len() {
                args.remove(index);
            }
        }
        Terminator::Branch {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => {
            if *then_target == target && index < then_args.len() {
                then_args.remove(index);
            }
            if *else_target == target && index < else_args.len() {
                else_args.remove(index);
            }
        }
        _ => {}
    }
}
