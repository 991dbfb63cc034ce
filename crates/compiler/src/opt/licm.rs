//! Loop-Invariant Code Motion & Induction Analysis
//!
//! Natural loops are found through back edges (a successor that dominates
//! its predecessor). Pure instructions whose operands are loop-invariant
//! hoist into the unique preheader; `read_heap` instructions hoist only when
//! the loop body contains no interfering write, call, or suspension.
//! Guards never move: they are control-dependent on their block.
//!
//! Induction analysis recognizes affine inductions (start, step, bound,
//! compare op) over header parameters, feeding vector-reduction lowering and
//! bound proofs.

use crate::opt::cfg::Cfg;
use crate::opt::PassStats;
use crate::tir::verify::verify_definite_assignment;
use crate::tir::{BlockId, Const, Effect, Function, Inst, OpKind, Terminator, ValueId};
use std::collections::{BTreeMap, HashSet};

/// One natural loop.
struct Loop {
    header: BlockId,
    /// All blocks in the loop body, header included.
    body: HashSet<BlockId>,
    /// Unique predecessor outside the loop, when there is one.
    preheader: Option<BlockId>,
    /// Latch blocks (sources of back edges).
    latches: Vec<BlockId>,
}

fn find_loops(func: &Function, cfg: &Cfg) -> Vec<Loop> {
    // Back edges in deterministic block order.
    let mut loops: BTreeMap<BlockId, Loop> = BTreeMap::new();
    for b in func.block_ids() {
        if !cfg.reachable[b.0 as usize] {
            continue;
        }
        for s in func.block(b).term.successors() {
            if cfg.dominates(s, b) {
                let entry = loops.entry(s).or_insert_with(|| Loop {
                    header: s,
                    body: HashSet::from([s]),
                    preheader: None,
                    latches: Vec::new(),
                });
                entry.latches.push(b);
            }
        }
    }

    let mut result: Vec<Loop> = loops.into_values().collect();
    for lp in &mut result {
        // Body: blocks that reach a latch backwards without passing the
        // header.
        let mut stack: Vec<BlockId> = lp.latches.clone();
        while let Some(b) = stack.pop() {
            if lp.body.insert(b) || b == lp.header {
                if b == lp.header {
                    continue;
                }
                for &p in &cfg.preds[b.0 as usize] {
                    if !lp.body.contains(&p) {
                        stack.push(p);
                    }
                }
            }
        }
        // Preheader: the single predecessor of the header outside the loop.
        let outside: Vec<BlockId> = cfg.preds[lp.header.0 as usize]
            .iter()
            .copied()
            .filter(|p| !lp.body.contains(p) && cfg.reachable[p.0 as usize])
            .collect();
        if outside.len() == 1 {
            lp.preheader = Some(outside[0]);
        }
    }
    result
}

pub fn run(func: &mut Function, stats: &mut PassStats) -> bool {
    let snapshot = func.clone();
    let cfg = Cfg::compute(func);
    let loops = find_loops(func, &cfg);
    let mut changed = false;

    for lp in &loops {
        let Some(preheader) = lp.preheader else {
            continue;
        };
        // The preheader must dominate the header for hoisted defs to
        // dominate every use in the loop.
        if !cfg.dominates(preheader, lp.header) {
            continue;
        }

        let loop_has_interference = lp.body.iter().any(|&b| {
            func.block(b).insts.iter().any(|i| {
                matches!(
                    i.kind.effect(),
                    Effect::WriteHeap(_) | Effect::OpaqueCall | Effect::Suspend
                )
            })
        });

        // Values defined inside the loop (params + results).
        let mut defined_in_loop: HashSet<ValueId> = HashSet::new();
        for &b in &lp.body {
            for (v, _) in &func.block(b).params {
                defined_in_loop.insert(*v);
            }
            for inst in &func.block(b).insts {
                if let Some(r) = inst.result {
                    defined_in_loop.insert(r);
                }
            }
        }

        // Collect hoistable instructions in deterministic body order.
        let mut hoisted: Vec<Inst> = Vec::new();
        let mut hoisted_values: HashSet<ValueId> = HashSet::new();
        let mut body_order: Vec<BlockId> =
            cfg.rpo.iter().copied().filter(|b| lp.body.contains(b)).collect();
        body_order.retain(|&b| cfg.reachable[b.0 as usize]);

        for &b in &body_order {
            let block = func.block_mut(b);
            let mut kept = Vec::with_capacity(block.insts.len());
            for inst in block.insts.drain(..) {
                let effect = inst.kind.effect();
                let hoistable_effect = match effect {
                    Effect::Pure => true,
                    Effect::ReadHeap => !loop_has_interference,
                    _ => false,
                };
                let invariant_args = inst.args.iter().all(|a| {
                    !defined_in_loop.contains(a) || hoisted_values.contains(a)
                });
                if hoistable_effect
                    && !inst.kind.is_guard()
                    && !matches!(inst.kind, OpKind::Const(_))
                    && inst.result.is_some()
                    && invariant_args
                {
                    hoisted_values.insert(inst.result.unwrap());
                    hoisted.push(inst);
                } else {
                    kept.push(inst);
                }
            }
            block.insts = kept;
        }

        if hoisted.is_empty() {
            continue;
        }
        stats.licm_hoisted += hoisted.len() as u64;
        func.block_mut(preheader).insts.extend(hoisted);
        changed = true;
    }

    if changed && verify_definite_assignment(func).is_err() {
        // The motion broke dominance somewhere subtle: skip it entirely.
        *func = snapshot;
        return false;
    }
    changed
}

// =============================================================================
// Induction analysis
// =============================================================================

/// An affine induction over a loop header parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Induction {
    pub header: BlockId,
    pub param: ValueId,
    /// Initial value from the preheader edge, when constant.
    pub start: Option<Const>,
    /// Per-iteration step.
    pub step: i64,
    /// Loop bound from the header's exit compare, when constant.
    pub bound: Option<(OpKind, Const)>,
}

/// Detect affine inductions: a header parameter whose back-edge argument is
/// `param + const`.
pub fn find_inductions(func: &Function) -> Vec<Induction> {
    let cfg = Cfg::compute(func);
    let loops = find_loops(func, &cfg);
    let mut out = Vec::new();

    for lp in &loops {
        for (pos, (param, _)) in func.block(lp.header).params.iter().enumerate() {
            // Step: every latch passes param + step for this position.
            let mut step: Option<i64> = None;
            let mut affine = true;
            for &latch in &lp.latches {
                let Some(arg) = edge_arg(func, latch, lp.header, pos) else {
                    affine = false;
                    break;
                };
                match add_of_const(func, arg, *param) {
                    Some(s) if step.is_none() || step == Some(s) => step = Some(s),
                    _ => {
                        affine = false;
                        break;
                    }
                }
            }
            let (true, Some(step)) = (affine, step) else {
                continue;
            };

            // Start: the preheader's passed argument, when constant.
            let start = lp.preheader.and_then(|ph| {
                let arg = edge_arg(func, ph, lp.header, pos)?;
                const_def(func, arg)
            });

            // Bound: header exits through a compare of the param against a
            // constant.
            let bound = match &func.block(lp.header).term {
                Terminator::Branch { cond, .. } => compare_against_const(func, *cond, *param),
                _ => None,
            };

            out.push(Induction {
                header: lp.header,
                param: *param,
                start,
                step,
                bound,
            });
        }
    }
    out
}

/// The argument passed for `target`'s parameter `pos` along `pred -> target`.
fn edge_arg(func: &Function, pred: BlockId, target: BlockId, pos: usize) -> Option<ValueId> {
    match &func.block(pred).term {
        Terminator::Jump { target: t, args } if *t == target => args.get(pos).copied(),
        Terminator::Branch {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => {
            if *then_target == target {
                then_args.get(pos).copied()
            } else if *else_target == target {
                else_args.get(pos).copied()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// If `v` is defined as `base + const` (either operand order), the constant.
fn add_of_const(func: &Function, v: ValueId, base: ValueId) -> Option<i64> {
    let inst = find_def(func, v)?;
    if !matches!(inst.kind, OpKind::Add) {
        return None;
    }
    let [a, b] = inst.args.as_slice() else {
        return None;
    };
    let other = if *a == base {
        *b
    } else if *b == base {
        *a
    } else {
        return None;
    };
    match const_def(func, other)? {
        Const::Int(n) => Some(n),
        _ => None,
    }
}

fn find_def<'f>(func: &'f Function, v: ValueId) -> Option<&'f Inst> {
    for b in func.block_ids() {
        for inst in &func.block(b).insts {
            if inst.result == Some(v) {
                return Some(inst);
            }
        }
    }
    None
}

fn const_def(func: &Function, v: ValueId) -> Option<Const> {
    match &find_def(func, v)?.kind {
        OpKind::Const(c) => Some(c.clone()),
        _ => None,
    }
}

/// If `cond` is `cmp(param, const)`, the compare kind and bound.
fn compare_against_const(func: &Function, cond: ValueId, param: ValueId) -> Option<(OpKind, Const)> {
    let inst = find_def(func, cond)?;
    if !matches!(
        inst.kind,
        OpKind::CmpLt | OpKind::CmpLe | OpKind::CmpGt | OpKind::CmpGe | OpKind::CmpNe
    ) {
        return None;
    }
    let [a, b] = inst.args.as_slice() else {
        return None;
    };
    if *a != param {
        return None;
    }
    Some((inst.kind.clone(), const_def(func, *b)?))
}
