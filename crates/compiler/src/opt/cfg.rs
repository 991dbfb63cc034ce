//! Control-Flow Graph Scaffolding
//!
//! Predecessors, successors, reverse post-order, and immediate dominators
//! for one function. Rebuilt as the first step of every pipeline iteration:
//! passes may invalidate edges, and every downstream analysis assumes a
//! fresh graph.
//!
//! Dominators use the iterative RPO intersection algorithm; graphs here are
//! small enough that the simple formulation wins.

use crate::tir::{BlockId, Function};

/// Computed CFG facts for one function.
pub struct Cfg {
    pub preds: Vec<Vec<BlockId>>,
    pub succs: Vec<Vec<BlockId>>,
    /// Reverse post-order over reachable blocks, entry first. This is the
    /// canonical visitation order for every pass.
    pub rpo: Vec<BlockId>,
    /// Immediate dominator per block (`None` for the entry and for
    /// unreachable blocks).
    pub idom: Vec<Option<BlockId>>,
    pub reachable: Vec<bool>,
}

impl Cfg {
    pub fn compute(func: &Function) -> Cfg {
        let n = func.blocks.len();
        let mut succs = vec![Vec::new(); n];
        let mut preds = vec![Vec::new(); n];
        for b in func.block_ids() {
            // Guard deopt edges are control-flow edges: the deopt target is
            // part of the same function and shares the SSA live set.
            for inst in &func.block(b).insts {
                if let Some(d) = inst.deopt
                    && !succs[b.0 as usize].contains(&d)
                {
                    succs[b.0 as usize].push(d);
                    preds[d.0 as usize].push(b);
                }
            }
            for s in func.block(b).term.successors() {
                succs[b.0 as usize].push(s);
                preds[s.0 as usize].push(b);
            }
        }

        // Depth-first postorder from the entry.
        let mut reachable = vec![false; n];
        let mut postorder: Vec<BlockId> = Vec::with_capacity(n);
        let mut stack: Vec<(BlockId, usize)> = vec![(Function::ENTRY, 0)];
        reachable[Function::ENTRY.0 as usize] = true;
        while let Some(&mut (b, ref mut next)) = stack.last_mut() {
            if *next < succs[b.0 as usize].len() {
                let s = succs[b.0 as usize][*next];
                *next += 1;
                if !reachable[s.0 as usize] {
                    reachable[s.0 as usize] = true;
                    stack.push((s, 0));
                }
            } else {
                postorder.push(b);
                stack.pop();
            }
        }
        let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();

        // RPO numbering for the intersection walk.
        let mut rpo_number = vec![usize::MAX; n];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_number[b.0 as usize] = i;
        }

        // Iterative dominator computation.
        let mut idom: Vec<Option<BlockId>> = vec![None; n];
        idom[Function::ENTRY.0 as usize] = Some(Function::ENTRY);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in &preds[b.0 as usize] {
                    if !reachable[p.0 as usize] || idom[p.0 as usize].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_number, p, cur),
                    });
                }
                if let Some(ni) = new_idom
                    && idom[b.0 as usize] != Some(ni)
                {
                    idom[b.0 as usize] = Some(ni);
                    changed = true;
                }
            }
        }
        // The entry's self-idom is an algorithm artifact; expose None.
        idom[Function::ENTRY.0 as usize] = None;

        Cfg {
            preds,
            succs,
            rpo,
            idom,
            reachable,
        }
    }

    /// True when `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.reachable[b.0 as usize] {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur.0 as usize] {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }
}

fn intersect(
    idom: &[Option<BlockId>],
    rpo_number: &[usize],
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_number[a.0 as usize] > rpo_number[b.0 as usize] {
            a = idom[a.0 as usize].expect("processed predecessor has an idom");
        }
        while rpo_number[b.0 as usize] > rpo_number[a.0 as usize] {
            b = idom[b.0 as usize].expect("processed predecessor has an idom");
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tir::builder::FunctionBuilder;
    use crate::tir::{Terminator, Tier, Ty, ValueId};

    /// Diamond: b0 -> b1 | b2 -> b3.
    fn diamond() -> Function {
        let mut b = FunctionBuilder::new("diamond", vec![Ty::Bool], Tier::Tier0);
        let then_b = b.new_block(vec![]);
        let else_b = b.new_block(vec![]);
        let join = b.new_block(vec![]);
        let cond = b.param(0);
        b.terminate(Terminator::Branch {
            cond,
            then_target: then_b,
            then_args: vec![],
            else_target: else_b,
            else_args: vec![],
        });
        b.switch_to(then_b);
        b.terminate(Terminator::Jump {
            target: join,
            args: vec![],
        });
        b.switch_to(else_b);
        b.terminate(Terminator::Jump {
            target: join,
            args: vec![],
        });
        b.switch_to(join);
        let none = b.const_none();
        b.terminate(Terminator::Return(none));
        b.finish()
    }

    #[test]
    fn test_diamond_dominators() {
        let f = diamond();
        let cfg = Cfg::compute(&f);
        assert_eq!(cfg.rpo[0], BlockId(0));
        assert!(cfg.dominates(BlockId(0), BlockId(3)));
        assert!(!cfg.dominates(BlockId(1), BlockId(3)));
        assert!(!cfg.dominates(BlockId(2), BlockId(3)));
        assert_eq!(cfg.idom[3], Some(BlockId(0)));
        assert!(cfg.reachable.iter().all(|&r| r));
    }

    #[test]
    fn test_unreachable_block_detected() {
        let mut b = FunctionBuilder::new("dead", vec![], Tier::Tier0);
        let dead = b.new_block(vec![]);
        let none = b.const_none();
        b.terminate(Terminator::Return(none));
        b.switch_to(dead);
        b.terminate(Terminator::Return(ValueId(0)));
        let f = b.finish();
        let cfg = Cfg::compute(&f);
        assert!(!cfg.reachable[dead.0 as usize]);
        assert!(!cfg.rpo.contains(&dead));
    }
}
