//! Canonicalize
//!
//! Region-aware CFG cleanup, run last in each pipeline iteration:
//! dead-label pruning, no-op jump elision through empty blocks, collapsing
//! of branches whose arms agree, dead try-body suffix pruning after a raise
//! proven to exit, branch-tail merging, and dominance-safe hoisting of
//! duplicate branch guards into the branching block.
//!
//! Dead blocks are emptied in place (tombstoned) rather than renumbered:
//! block ids stay stable for deopt edges and serialized artifacts, and the
//! rewrite is idempotent.

use crate::opt::cfg::Cfg;
use crate::opt::PassStats;
use crate::tir::{BlockId, Function, OpKind, Terminator};
use std::collections::HashSet;

pub fn run(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut changed = false;
    changed |= prune_dead_blocks(func, stats);
    changed |= thread_empty_blocks(func, stats);
    changed |= collapse_same_target_branches(func, stats);
    changed |= prune_after_raise(func, stats);
    changed |= hoist_duplicate_branch_guards(func, stats);
    changed |= merge_branch_tails(func, stats);
    changed
}

/// Blocks unreachable from the entry (through terminator and deopt edges)
/// are emptied: dead-label pruning.
fn prune_dead_blocks(func: &mut Function, stats: &mut PassStats) -> bool {
    let cfg = Cfg::compute(func);
    let mut changed = false;
    for b in func.block_ids() {
        if cfg.reachable[b.0 as usize] {
            continue;
        }
        let block = func.block_mut(b);
        if block.params.is_empty()
            && block.insts.is_empty()
            && matches!(block.term, Terminator::Unreachable)
        {
            continue; // already a tombstone
        }
        block.params.clear();
        block.insts.clear();
        block.term = Terminator::Unreachable;
        stats.canon_blocks_removed += 1;
        changed = true;
    }
    changed
}

/// A branch whose arms are the same block with the same arguments is a jump.
fn collapse_same_target_branches(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut changed = false;
    for b in func.block_ids() {
        let term = &func.block(b).term;
        if let Terminator::Branch {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } = term
            && then_target == else_target
            && then_args == else_args
        {
            let target = *then_target;
            let args = then_args.clone();
            func.block_mut(b).term = Terminator::Jump { target, args };
            stats.canon_jumps_elided += 1;
            changed = true;
        }
    }
    changed
}

/// Retarget edges that pass through an empty, parameterless forwarding
/// block (no-op jump elision / empty-region collapsing). Deopt targets are
/// never threaded: the deopt entry must stay where the guard points.
fn thread_empty_blocks(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut deopt_targets: HashSet<BlockId> = HashSet::new();
    for b in func.block_ids() {
        for inst in &func.block(b).insts {
            if let Some(d) = inst.deopt {
                deopt_targets.insert(d);
            }
        }
    }

    // Resolve each block to its forwarding destination, following chains
    // with a visited set so empty-block cycles cannot loop.
    let resolve = |start: BlockId, func: &Function| -> BlockId {
        let mut cur = start;
        let mut seen = HashSet::new();
        loop {
            if !seen.insert(cur) {
                return start; // cycle of empty blocks: leave untouched
            }
            if deopt_targets.contains(&cur) || cur == Function::ENTRY {
                return cur;
            }
            let block = func.block(cur);
            if !block.params.is_empty() || !block.insts.is_empty() {
                return cur;
            }
            match &block.term {
                Terminator::Jump { target, args } if args.is_empty() && *target != cur => {
                    cur = *target;
                }
                _ => return cur,
            }
        }
    };

    let mut changed = false;
    for b in func.block_ids() {
        let mut term = func.block(b).term.clone();
        let mut rewrote = false;
        match &mut term {
            Terminator::Jump { target, .. } => {
                let dest = resolve(*target, func);
                if dest != *target {
                    *target = dest;
                    rewrote = true;
                }
            }
            Terminator::Branch {
                then_target,
                else_target,
                ..
            } => {
                let t = resolve(*then_target, func);
                if t != *then_target {
                    *then_target = t;
                    rewrote = true;
                }
                let e = resolve(*else_target, func);
                if e != *else_target {
                    *else_target = e;
                    rewrote = true;
                }
            }
            _ => {}
        }
        if rewrote {
            func.block_mut(b).term = term;
            stats.canon_jumps_elided += 1;
            changed = true;
        }
    }
    changed
}

/// Instructions after a `Raise` never execute; prune the suffix and mark the
/// fallthrough unreachable (dead try-body suffix pruning).
fn prune_after_raise(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut changed = false;
    for b in func.block_ids() {
        let block = func.block(b);
        let Some(pos) = block.insts.iter().position(|i| matches!(i.kind, OpKind::Raise))
        else {
            continue;
        };
        let has_suffix = pos + 1 < block.insts.len();
        let falls_through = !matches!(block.term, Terminator::Unreachable);
        if !has_suffix && !falls_through {
            continue;
        }
        let block = func.block_mut(b);
        block.insts.truncate(pos + 1);
        block.term = Terminator::Unreachable;
        stats.canon_blocks_removed += 1;
        changed = true;
    }
    changed
}

/// When both arms of a branch begin with the same guard and have no other
/// predecessors, hoist one copy into the branching block (dominance-safe:
/// the branch block dominates both arms).
fn hoist_duplicate_branch_guards(func: &mut Function, stats: &mut PassStats) -> bool {
    let cfg = Cfg::compute(func);
    let mut changed = false;
    for b in func.block_ids() {
        let Terminator::Branch {
            then_target,
            else_target,
            ..
        } = func.block(b).term
        else {
            continue;
        };
        if then_target == else_target {
            continue;
        }
        if cfg.preds[then_target.0 as usize].len() != 1
            || cfg.preds[else_target.0 as usize].len() != 1
        {
            continue;
        }
        let (then_first, else_first) = (
            func.block(then_target).insts.first(),
            func.block(else_target).insts.first(),
        );
        let (Some(a), Some(e)) = (then_first, else_first) else {
            continue;
        };
        if !a.kind.is_guard() || a != e {
            continue;
        }
        let guard = a.clone();
        func.block_mut(then_target).insts.remove(0);
        func.block_mut(else_target).insts.remove(0);
        func.block_mut(b).insts.push(guard);
        stats.canon_guards_hoisted += 1;
        changed = true;
    }
    changed
}

/// Merge a branch whose arms are distinct parameterless blocks with
/// identical bodies and terminators (branch-tail merging).
fn merge_branch_tails(func: &mut Function, stats: &mut PassStats) -> bool {
    let cfg = Cfg::compute(func);
    let mut changed = false;
    for b in func.block_ids() {
        let Terminator::Branch {
            cond,
            then_target,
            then_args,
            else_target,
            else_args,
        } = func.block(b).term.clone()
        else {
            continue;
        };
        if then_target == else_target || !then_args.is_empty() || !else_args.is_empty() {
            continue;
        }
        if cfg.preds[then_target.0 as usize].len() != 1
            || cfg.preds[else_target.0 as usize].len() != 1
        {
            continue;
        }
        let (t, e) = (func.block(then_target), func.block(else_target));
        if !t.params.is_empty() || t != e {
            continue;
        }
        // Both arms are byte-identical: the condition no longer matters.
        let _ = cond;
        func.block_mut(b).term = Terminator::Jump {
            target: then_target,
            args: Vec::new(),
        };
        stats.canon_jumps_elided += 1;
        changed = true;
    }
    changed
}
