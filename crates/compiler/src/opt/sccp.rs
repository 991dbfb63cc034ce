//! Sparse Conditional Constant Propagation
//!
//! The classic three-point lattice {unknown, constant, overdefined} with
//! explicit executable-edge tracking: an unreachable branch never promotes
//! its block-parameter inputs, so `if False: y = 1/0` compiles with the
//! throwing arm pruned and the divisor never evaluated.
//!
//! Guards do not thread: a guard whose subject is a known constant that
//! satisfies the check is removed outright; any other guard keeps its
//! failure edge, which terminates at the deopt entry.

use crate::opt::simplify::eval;
use crate::opt::PassStats;
use crate::tir::{
    BlockId, Const, Function, GuardOp, Inst, OpKind, TagKind, Terminator, ValueId,
};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
enum Lattice {
    Unknown,
    Known(Const),
    Over,
}

impl Lattice {
    fn meet(&self, other: &Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Unknown, x) | (x, Lattice::Unknown) => x.clone(),
            (Lattice::Known(a), Lattice::Known(b)) if a == b => Lattice::Known(a.clone()),
            _ => Lattice::Over,
        }
    }
}

struct Solver<'f> {
    func: &'f Function,
    values: HashMap<ValueId, Lattice>,
    /// Blocks using each value (instruction operands and terminator
    /// operands). Lowering a value re-evaluates exactly these blocks; this
    /// is what makes the propagation sparse and, with the unconditional
    /// edge re-meet below, sound for loop-carried block parameters.
    uses: HashMap<ValueId, Vec<BlockId>>,
    exec_edge: HashSet<(BlockId, BlockId)>,
    exec_block: HashSet<BlockId>,
    flow: VecDeque<(BlockId, BlockId)>,
    blocks_to_visit: VecDeque<BlockId>,
}

impl<'f> Solver<'f> {
    fn value(&self, v: ValueId) -> Lattice {
        self.values.get(&v).cloned().unwrap_or(Lattice::Unknown)
    }

    fn set(&mut self, v: ValueId, l: Lattice) -> bool {
        let old = self.value(v);
        let new = old.meet(&l);
        if new != old {
            self.values.insert(v, new);
            // Every use site sees the lowered value on its next visit.
            if let Some(users) = self.uses.get(&v) {
                for &b in users {
                    self.blocks_to_visit.push_back(b);
                }
            }
            true
        } else {
            false
        }
    }

    fn build_use_lists(&mut self) {
        for b in self.func.block_ids() {
            let block = self.func.block(b);
            let mut record = |v: ValueId, uses: &mut HashMap<ValueId, Vec<BlockId>>| {
                let entry = uses.entry(v).or_default();
                if !entry.contains(&b) {
                    entry.push(b);
                }
            };
            for inst in &block.insts {
                for &a in &inst.args {
                    record(a, &mut self.uses);
                }
            }
            for v in block.term.operands() {
                record(v, &mut self.uses);
            }
        }
    }

    fn solve(&mut self) {
        self.build_use_lists();
        // Function parameters are runtime inputs.
        for (v, _) in &self.func.params {
            self.values.insert(*v, Lattice::Over);
        }
        self.mark_block(Function::ENTRY);

        while let Some(b) = self.blocks_to_visit.pop_front() {
            self.visit_block(b);
        }
        while let Some((p, s)) = self.flow.pop_front() {
            if self.exec_edge.insert((p, s)) {
                self.mark_block(s);
            }
            // Meet edge arguments on every pop, not only on the first
            // activation: a predecessor can lower an argument after the
            // edge already fired (a back edge discovered after the exit
            // edge, a long path joining a short one), and the target's
            // parameters must follow it down the lattice.
            self.propagate_edge_args(p, s);
            while let Some(b) = self.blocks_to_visit.pop_front() {
                self.visit_block(b);
            }
        }
    }

    fn mark_block(&mut self, b: BlockId) {
        self.exec_block.insert(b);
        self.blocks_to_visit.push_back(b);
    }

    /// Meet edge arguments into the target's block parameters.
    fn propagate_edge_args(&mut self, p: BlockId, s: BlockId) {
        let func = self.func;
        let pairs: Vec<(BlockId, &Vec<ValueId>)> = match &func.block(p).term {
            Terminator::Jump { target, args } => vec![(*target, args)],
            Terminator::Branch {
                then_target,
                then_args,
                else_target,
                else_args,
                ..
            } => vec![(*then_target, then_args), (*else_target, else_args)],
            _ => Vec::new(),
        };
        for (target, args) in pairs {
            if target != s {
                continue;
            }
            for ((param, _), arg) in func.block(s).params.iter().zip(args.iter()) {
                let incoming = self.value(*arg);
                if self.set(*param, incoming) {
                    self.blocks_to_visit.push_back(s);
                }
            }
        }
    }

    fn visit_block(&mut self, b: BlockId) {
        if !self.exec_block.contains(&b) {
            return;
        }
        let func = self.func;
        let block = func.block(b);
        for inst in &block.insts {
            // Lattice changes push the value's use blocks through set().
            self.visit_inst(inst);
        }
        self.visit_terminator(b, &block.term);
    }

    fn visit_inst(&mut self, inst: &Inst) -> bool {
        let Some(result) = inst.result else {
            return false;
        };
        let lattice = match &inst.kind {
            OpKind::Const(c) => Lattice::Known(c.clone()),
            kind if foldable(kind) => {
                let args: Vec<Lattice> = inst.args.iter().map(|a| self.value(*a)).collect();
                if args.iter().any(|l| *l == Lattice::Over) {
                    Lattice::Over
                } else if args.iter().any(|l| *l == Lattice::Unknown) {
                    Lattice::Unknown
                } else {
                    let consts: Vec<Const> = args
                        .into_iter()
                        .map(|l| match l {
                            Lattice::Known(c) => c,
                            _ => unreachable!(),
                        })
                        .collect();
                    match eval(&inst.kind, &consts) {
                        Some(c) => Lattice::Known(c),
                        None => Lattice::Over,
                    }
                }
            }
            _ => Lattice::Over,
        };
        self.set(result, lattice)
    }

    fn visit_terminator(&mut self, b: BlockId, term: &Terminator) {
        match term {
            Terminator::Jump { target, .. } => self.flow.push_back((b, *target)),
            Terminator::Branch {
                cond,
                then_target,
                else_target,
                ..
            } => match self.value(*cond) {
                Lattice::Known(c) => {
                    let taken = if c.truthy() { *then_target } else { *else_target };
                    self.flow.push_back((b, taken));
                }
                Lattice::Over => {
                    self.flow.push_back((b, *then_target));
                    self.flow.push_back((b, *else_target));
                }
                Lattice::Unknown => {}
            },
            Terminator::StateSwitch {
                state,
                targets,
                default,
            } => match self.value(*state) {
                Lattice::Known(Const::Int(n)) => {
                    let taken = targets
                        .iter()
                        .find(|(v, _)| *v == n)
                        .map(|(_, t)| *t)
                        .unwrap_or(*default);
                    self.flow.push_back((b, taken));
                }
                Lattice::Unknown => {}
                _ => {
                    for (_, t) in targets {
                        self.flow.push_back((b, *t));
                    }
                    self.flow.push_back((b, *default));
                }
            },
            // Try regions track both normal and exceptional completion.
            Terminator::TryStart { body, handler } => {
                self.flow.push_back((b, *body));
                self.flow.push_back((b, *handler));
            }
            Terminator::TryEnd { cont } => self.flow.push_back((b, *cont)),
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => {}
        }
        // Guard-failure edges stay executable unless the guard provably
        // passes; they terminate at the deopt entry.
        let func = self.func;
        for inst in &func.block(b).insts {
            if let Some(deopt) = inst.deopt
                && self.guard_proves_pass(inst) != Some(true)
            {
                self.flow.push_back((b, deopt));
            }
        }
    }

    /// Whether a guard is statically decided by the lattice.
    fn guard_proves_pass(&self, inst: &Inst) -> Option<bool> {
        let OpKind::Guard { op, .. } = &inst.kind else {
            return None;
        };
        let subject = self.value(*inst.args.first()?);
        let Lattice::Known(c) = subject else {
            return None;
        };
        match op {
            GuardOp::Tag { tag } => Some(matches!(
                (tag, &c),
                (TagKind::Int, Const::Int(_))
                    | (TagKind::Bool, Const::Bool(_))
                    | (TagKind::NoneTag, Const::None)
            )),
            GuardOp::Ne { constant } => Some(c != *constant),
            _ => None,
        }
    }
}

fn foldable(kind: &OpKind) -> bool {
    matches!(
        kind,
        OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::FloorDiv
            | OpKind::Mod
            | OpKind::Neg
            | OpKind::Not
            | OpKind::BoolAnd
            | OpKind::BoolOr
            | OpKind::CmpEq
            | OpKind::CmpNe
            | OpKind::CmpLt
            | OpKind::CmpLe
            | OpKind::CmpGt
            | OpKind::CmpGe
            | OpKind::TypeOf
            | OpKind::Contains
            | OpKind::Index
            | OpKind::Len
    )
}

/// Run SCCP on one function: fold proven constants, thread decided
/// branches, and drop guards that provably pass.
pub fn run(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut solver = Solver {
        func,
        values: HashMap::new(),
        uses: HashMap::new(),
        exec_edge: HashSet::new(),
        exec_block: HashSet::new(),
        flow: VecDeque::new(),
        blocks_to_visit: VecDeque::new(),
    };
    solver.solve();
    let values = solver.values;
    let exec_block = solver.exec_block;

    let mut changed = false;
    for b in func.block_ids() {
        if !exec_block.contains(&b) {
            continue; // unreachable: canonicalize prunes, nothing to fold
        }

        // Fold instructions whose lattice value is a constant. Only effects
        // that narrow legally are rewritten (pure, read_heap, and throwing
        // operators whose fold proves no throw).
        for i in 0..func.block(b).insts.len() {
            let inst = &func.block(b).insts[i];
            let Some(result) = inst.result else { continue };
            if matches!(inst.kind, OpKind::Const(_)) {
                continue;
            }
            if !foldable(&inst.kind) {
                continue;
            }
            if let Some(Lattice::Known(c)) = values.get(&result).cloned() {
                let inst = &mut func.block_mut(b).insts[i];
                inst.kind = OpKind::Const(c);
                inst.args.clear();
                stats.sccp_folds += 1;
                changed = true;
            }
        }

        // Remove guards that provably pass.
        let before = func.block(b).insts.len();
        func.block_mut(b).insts.retain(|inst| {
            let OpKind::Guard { op, .. } = &inst.kind else {
                return true;
            };
            let Some(&subject) = inst.args.first() else {
                return true;
            };
            let Some(Lattice::Known(c)) = values.get(&subject) else {
                return true;
            };
            let passes = match op {
                GuardOp::Tag { tag } => matches!(
                    (tag, c),
                    (TagKind::Int, Const::Int(_))
                        | (TagKind::Bool, Const::Bool(_))
                        | (TagKind::NoneTag, Const::None)
                ),
                GuardOp::Ne { constant } => c != constant,
                _ => false,
            };
            !passes
        });
        if func.block(b).insts.len() != before {
            stats.sccp_folds += (before - func.block(b).insts.len()) as u64;
            changed = true;
        }

        // Thread branches whose condition is decided.
        let new_term = match &func.block(b).term {
            Terminator::Branch {
                cond,
                then_target,
                then_args,
                else_target,
                else_args,
            } => match values.get(cond) {
                Some(Lattice::Known(c)) => {
                    let (target, args) = if c.truthy() {
                        (*then_target, then_args.clone())
                    } else {
                        (*else_target, else_args.clone())
                    };
                    Some(Terminator::Jump { target, args })
                }
                _ => None,
            },
            Terminator::StateSwitch {
                state,
                targets,
                default,
            } => match values.get(state) {
                Some(Lattice::Known(Const::Int(n))) => {
                    let target = targets
                        .iter()
                        .find(|(v, _)| v == n)
                        .map(|(_, t)| *t)
                        .unwrap_or(*default);
                    Some(Terminator::Jump {
                        target,
                        args: Vec::new(),
                    })
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(t) = new_term {
            func.block_mut(b).term = t;
            stats.sccp_edges_pruned += 1;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tir::builder::FunctionBuilder;
    use crate::tir::{Tier, Ty};

    /// `if False: y = 1/0 else: y = 5; return y`: the throwing arm must be
    /// pruned without evaluating the division.
    #[test]
    fn test_false_branch_pruned_without_evaluating_throw() {
        let mut b = FunctionBuilder::new("cond", vec![], Tier::Tier0);
        let then_b = b.new_block(vec![]);
        let else_b = b.new_block(vec![]);
        let join = b.new_block(vec![Ty::Any]);
        let flag = b.const_bool(false);
        b.branch(flag, then_b, vec![], else_b, vec![]);

        b.switch_to(then_b);
        let one = b.const_int(1);
        let zero = b.const_int(0);
        let div = b.ins(OpKind::Div, vec![one, zero]);
        b.jump(join, vec![div]);

        b.switch_to(else_b);
        let five = b.const_int(5);
        b.jump(join, vec![five]);

        b.switch_to(join);
        let params = b.block_params(join);
        b.ret(params[0]);

        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));

        // Entry now jumps straight to the else arm.
        match &f.block(Function::ENTRY).term {
            Terminator::Jump { target, .. } => assert_eq!(*target, else_b),
            other => panic!("expected threaded jump, got {:?}", other),
        }
        // The division was never folded or evaluated: its block is simply
        // unreachable and still contains the division untouched.
        assert!(f.block(then_b)
            .insts
            .iter()
            .any(|i| matches!(i.kind, OpKind::Div)));
        // The join parameter is the constant 5 along the only executable
        // edge; the phi input from the dead arm was never promoted.
        assert!(stats.sccp_edges_pruned >= 1);
    }

    #[test]
    fn test_transitive_folding() {
        let mut b = FunctionBuilder::new("arith", vec![], Tier::Tier0);
        let two = b.const_int(2);
        let three = b.const_int(3);
        let sum = b.ins(OpKind::Add, vec![two, three]);
        let doubled = b.ins(OpKind::Mul, vec![sum, two]);
        b.ret(doubled);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        let insts = &f.block(Function::ENTRY).insts;
        assert!(matches!(
            insts.last().unwrap().kind,
            OpKind::Const(Const::Int(10))
        ));
    }

    #[test]
    fn test_overdefined_params_not_folded() {
        let mut b = FunctionBuilder::new("dyn", vec![Ty::Int], Tier::Tier0);
        let x = b.param(0);
        let one = b.const_int(1);
        let sum = b.ins(OpKind::Add, vec![x, one]);
        b.ret(sum);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(!run(&mut f, &mut stats));
        assert!(matches!(
            f.block(Function::ENTRY).insts.last().unwrap().kind,
            OpKind::Add
        ));
    }

    #[test]
    fn test_loop_carried_param_not_folded_from_first_edge() {
        // i enters the header as Known(0) and the exit edge fires before
        // the back edge has been processed; once the back edge meets the
        // incremented value into the header parameter, every downstream
        // fact must follow it to overdefined. Nothing here may fold.
        let mut b = FunctionBuilder::new("counter", vec![Ty::Bool], Tier::Tier0);
        let header = b.new_block(vec![Ty::Any]);
        let body = b.new_block(vec![]);
        let exit = b.new_block(vec![]);
        let cond = b.param(0);
        let zero = b.const_int(0);
        b.jump(header, vec![zero]);

        b.switch_to(header);
        let i = b.block_params(header)[0];
        b.branch(cond, exit, vec![], body, vec![]);

        b.switch_to(body);
        let one = b.const_int(1);
        let i2 = b.ins(OpKind::Add, vec![i, one]);
        b.jump(header, vec![i2]);

        b.switch_to(exit);
        // A use of the loop-carried parameter outside the loop: with a
        // stale Known(0) this would fold to a wrong constant.
        let r = b.ins(OpKind::Add, vec![i, zero]);
        b.ret(r);

        let mut f = b.finish();
        let mut stats = PassStats::default();
        let changed = run(&mut f, &mut stats);
        assert!(!changed, "nothing is provably constant here");
        assert_eq!(stats.sccp_folds, 0);
        assert!(matches!(
            f.block(body).insts.last().unwrap().kind,
            OpKind::Add
        ));
        assert!(matches!(
            f.block(exit).insts.last().unwrap().kind,
            OpKind::Add
        ));
    }

    #[test]
    fn test_long_path_join_meets_to_overdefined() {
        // Join M receives Known(5) from the short path and Known(7) from
        // the longer one; the forwarded parameter chain must settle at
        // overdefined regardless of which edge activates first.
        let mut b = FunctionBuilder::new("join", vec![Ty::Bool], Tier::Tier0);
        let long = b.new_block(vec![]);
        let m = b.new_block(vec![Ty::Any]);
        let t = b.new_block(vec![Ty::Any]);
        let cond = b.param(0);
        let five = b.const_int(5);
        b.branch(cond, long, vec![], m, vec![five]);

        b.switch_to(long);
        let seven = b.const_int(7);
        b.jump(m, vec![seven]);

        b.switch_to(m);
        let mp = b.block_params(m)[0];
        b.jump(t, vec![mp]);

        b.switch_to(t);
        let tp = b.block_params(t)[0];
        let zero = b.const_int(0);
        let r = b.ins(OpKind::Add, vec![tp, zero]);
        b.ret(r);

        let mut f = b.finish();
        let mut stats = PassStats::default();
        run(&mut f, &mut stats);
        assert_eq!(stats.sccp_folds, 0, "the join parameter is not constant");
        assert!(matches!(
            f.block(t).insts.last().unwrap().kind,
            OpKind::Add
        ));
    }

    #[test]
    fn test_guard_on_known_int_removed() {
        use crate::tir::GuardOp;
        let mut b = FunctionBuilder::new("guarded", vec![], Tier::Tier1);
        let deopt = b.new_block(vec![]);
        let c = b.const_int(7);
        b.ins_guard(GuardOp::Tag { tag: TagKind::Int }, 4, vec![c], deopt);
        b.ret(c);
        b.switch_to(deopt);
        let zero = b.const_int(0);
        b.ret(zero);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        assert!(!f
            .block(Function::ENTRY)
            .insts
            .iter()
            .any(|i| i.kind.is_guard()));
    }
}
