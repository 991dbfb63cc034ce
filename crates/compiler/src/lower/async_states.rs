//! Async State-Machine Lowering
//!
//! Converts a function containing suspension points into a cooperative poll
//! body, without a host event loop:
//!
//! - a new dispatch entry block reads the frame's state slot (the lowered
//!   function's leading `state` parameter) and `StateSwitch`es on it;
//! - every suspension point (`StateYield`, `ChanSendYield`,
//!   `ChanRecvYield`) is assigned an *encoded resume target* (the bitwise
//!   NOT of its resume index) and splits its block: the prefix ends by
//!   returning the reserved pending constant, the suffix becomes the resume
//!   continuation reached through the dispatch switch;
//! - values live across a suspension are spilled to the coroutine frame's
//!   locals area (`FrameStore` before the yield, `FrameLoad` at resume), so
//!   the continuation is dominance-clean.
//!
//! Encoded targets are strictly negative, so they can never collide with the
//! non-negative logical states (0 = start, 1 = done).
//!
//! Values that cross a suspension point between *blocks* must already have
//! been normalized into block-local shape by the frontend; the lowering
//! rejects the construct otherwise rather than guess at a spill plan.

use crate::error::{CompileError, Location};
use crate::tir::{
    Block, BlockId, Const, Function, Inst, OpKind, Terminator, Ty, ValueId,
};
use std::collections::{HashMap, HashSet};

/// Encode a resume index as a state-slot value (bitwise NOT).
pub fn encode_resume(index: u32) -> i64 {
    !(index as i64)
}

/// True when the op suspends the coroutine.
fn is_suspension(kind: &OpKind) -> bool {
    matches!(
        kind,
        OpKind::StateYield { .. } | OpKind::ChanSendYield { .. } | OpKind::ChanRecvYield { .. }
    )
}

fn set_resume(kind: &mut OpKind, resume: u32) {
    match kind {
        OpKind::StateYield { resume: r }
        | OpKind::ChanSendYield { resume: r }
        | OpKind::ChanRecvYield { resume: r } => *r = resume,
        _ => {}
    }
}

/// Lower one async function into its poll form. The result takes a leading
/// `state: int` parameter and dispatches on it; the original entry is state
/// 0 and each continuation is an encoded resume target.
pub fn lower_async(func: &Function) -> Result<Function, CompileError> {
    if !func
        .blocks
        .iter()
        .any(|b| b.insts.iter().any(|i| is_suspension(&i.kind)))
    {
        return Err(CompileError::Unsupported {
            what: "async lowering of a function with no suspension points".into(),
            at: Location {
                function: func.name.clone(),
                line: 0,
            },
        });
    }

    let mut out = func.clone();
    out.name = format!("{}$poll", func.name);

    // Leading state parameter.
    let state_param = ValueId(out.next_value);
    out.next_value += 1;
    out.params.insert(0, (state_param, Ty::Int));
    if !out.param_names.is_empty() {
        out.param_names.insert(0, "state".into());
    }
    out.blocks[0].params.insert(0, (state_param, Ty::Int));

    // Split every block at its suspension points. Resume indices are
    // assigned in deterministic block-then-position order.
    let mut resume_index: u32 = 0;
    let mut continuations: Vec<(i64, BlockId)> = Vec::new();
    let mut frame_slots: u32 = 0;

    let mut b = 0usize;
    while b < out.blocks.len() {
        let Some(pos) = out.blocks[b]
            .insts
            .iter()
            .position(|i| is_suspension(&i.kind))
        else {
            b += 1;
            continue;
        };

        let suffix: Vec<Inst> = out.blocks[b].insts.split_off(pos + 1);
        let term = std::mem::replace(&mut out.blocks[b].term, Terminator::Unreachable);
        let line = out.blocks[b].insts[pos].line;

        // Values defined in the prefix (or function params) and used in the
        // suffix must be spilled through the frame.
        let mut defined_before: HashSet<ValueId> =
            func.params.iter().map(|(v, _)| *v).collect();
        for (v, _) in &out.blocks[b].params {
            defined_before.insert(*v);
        }
        for inst in &out.blocks[b].insts {
            if let Some(r) = inst.result {
                defined_before.insert(r);
            }
        }
        let yield_result = out.blocks[b].insts[pos].result;

        let mut live: Vec<ValueId> = Vec::new();
        let mut seen = HashSet::new();
        let mut visit = |v: ValueId, live: &mut Vec<ValueId>, seen: &mut HashSet<ValueId>| {
            if defined_before.contains(&v) && Some(v) != yield_result && seen.insert(v) {
                live.push(v);
            }
        };
        for inst in &suffix {
            for &a in &inst.args {
                visit(a, &mut live, &mut seen);
            }
        }
        for v in term.operands() {
            visit(v, &mut live, &mut seen);
        }

        // Reject cross-block liveness over the suspension: a value defined
        // before the split and used beyond the continuation block would
        // need a frontend-provided spill plan.
        for (later, block) in out.blocks.iter().enumerate() {
            if later == b {
                continue;
            }
            for inst in &block.insts {
                for &a in &inst.args {
                    if defined_before.contains(&a)
                        && Some(a) != yield_result
                        && !func.params.iter().any(|(p, _)| *p == a)
                        && is_defined_in_prefix(&out.blocks[b], a)
                    {
                        return Err(CompileError::Unsupported {
                            what: format!(
                                "value {} is live across a suspension into another block",
                                a
                            ),
                            at: Location {
                                function: func.name.clone(),
                                line,
                            },
                        });
                    }
                }
            }
        }

        // Assign the encoded resume target.
        let encoded = encode_resume(resume_index);
        set_resume(&mut out.blocks[b].insts[pos].kind, resume_index);

        // Spill live values before the suspension point.
        let mut spills: HashMap<ValueId, u32> = HashMap::new();
        for &v in &live {
            let slot = frame_slots;
            frame_slots += 1;
            spills.insert(v, slot);
            let insert_pos = out.blocks[b].insts.len() - 1;
            out.blocks[b].insts.insert(
                insert_pos,
                Inst {
                    result: None,
                    kind: OpKind::FrameStore { slot },
                    args: vec![v],
                    deopt: None,
                    line,
                },
            );
        }

        // The prefix suspends: return the pending marker.
        let pending = ValueId(out.next_value);
        out.next_value += 1;
        out.blocks[b].insts.push(Inst {
            result: Some(pending),
            kind: OpKind::Const(Const::Pending),
            args: vec![],
            deopt: None,
            line,
        });
        out.blocks[b].term = Terminator::Return(pending);

        // The continuation reloads spilled values under fresh ids.
        let mut cont_insts: Vec<Inst> = Vec::new();
        let mut subst: HashMap<ValueId, ValueId> = HashMap::new();
        for &v in &live {
            let fresh = ValueId(out.next_value);
            out.next_value += 1;
            subst.insert(v, fresh);
            cont_insts.push(Inst {
                result: Some(fresh),
                kind: OpKind::FrameLoad {
                    slot: spills[&v],
                },
                args: vec![],
                deopt: None,
                line,
            });
        }
        // The yield's own result is re-materialized as the resume argument
        // delivered through frame slot convention: slot of the yield result
        // is the next slot.
        if let Some(r) = yield_result {
            let fresh = ValueId(out.next_value);
            out.next_value += 1;
            subst.insert(r, fresh);
            let slot = frame_slots;
            frame_slots += 1;
            cont_insts.push(Inst {
                result: Some(fresh),
                kind: OpKind::FrameLoad { slot },
                args: vec![],
                deopt: None,
                line,
            });
        }
        let mut suffix = suffix;
        let mut cont_term = term;
        for inst in &mut suffix {
            for a in inst.args.iter_mut() {
                if let Some(&n) = subst.get(a) {
                    *a = n;
                }
            }
        }
        rewrite_term_operands(&mut cont_term, &subst);
        cont_insts.extend(suffix);

        out.blocks.push(Block {
            params: Vec::new(),
            insts: cont_insts,
            term: cont_term,
        });
        let cont_id = BlockId(out.blocks.len() as u32 - 1);
        continuations.push((encoded, cont_id));
        resume_index += 1;
        // Re-scan the same block: it may have held further suspensions
        // (they are now in the continuation, so scanning continues there).
        b += 1;
    }

    // Build the dispatch entry: the old entry body moves to a fresh block
    // and the entry becomes a bare StateSwitch.
    let old_entry_body = Block {
        params: Vec::new(),
        insts: std::mem::take(&mut out.blocks[0].insts),
        term: std::mem::replace(&mut out.blocks[0].term, Terminator::Unreachable),
    };
    out.blocks.push(old_entry_body);
    let start_block = BlockId(out.blocks.len() as u32 - 1);

    out.blocks[0].term = Terminator::StateSwitch {
        state: state_param,
        targets: {
            let mut targets = vec![(0i64, start_block)];
            targets.extend(continuations.iter().copied());
            targets
        },
        // An unknown state (including "done") is a poll-after-completion:
        // the runtime raises; the IR marks it unreachable.
        default: {
            out.blocks.push(Block {
                params: Vec::new(),
                insts: Vec::new(),
                term: Terminator::Unreachable,
            });
            BlockId(out.blocks.len() as u32 - 1)
        },
    };

    Ok(out)
}

fn is_defined_in_prefix(block: &Block, v: ValueId) -> bool {
    block.insts.iter().any(|i| i.result == Some(v))
}

fn rewrite_term_operands(term: &mut Terminator, subst: &HashMap<ValueId, ValueId>) {
    let fix = |v: &mut ValueId| {
        if let Some(&n) = subst.get(v) {
            *v = n;
        }
    };
    match term {
        Terminator::Jump { args, .. } => args.iter_mut().for_each(fix),
        Terminator::Branch {
            cond,
            then_args,
            else_args,
            ..
        } => {
            fix(cond);
            then_args.iter_mut().for_each(fix);
            else_args.iter_mut().for_each(fix);
        }
        Terminator::Return(v) | Terminator::Throw(v) => fix(v),
        Terminator::StateSwitch { state, .. } => fix(state),
        Terminator::TryStart { .. } | Terminator::TryEnd { .. } | Terminator::Unreachable => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tir::builder::FunctionBuilder;
    use crate::tir::{Tier, Ty};

    /// recv from a channel, add 1, return.
    fn recv_add_one() -> Function {
        let mut b = FunctionBuilder::new("pump", vec![Ty::Chan], Tier::Tier0);
        let ch = b.param(0);
        let got = b.ins(OpKind::ChanRecvYield { resume: 0 }, vec![ch]);
        let one = b.const_int(1);
        let sum = b.ins(OpKind::Add, vec![got, one]);
        b.ret(sum);
        b.finish()
    }

    #[test]
    fn test_lowering_builds_dispatch_switch() {
        let f = recv_add_one();
        let poll = lower_async(&f).unwrap();
        assert_eq!(poll.name, "pump$poll");
        // Leading state parameter.
        assert_eq!(poll.params[0].1, Ty::Int);
        match &poll.block(Function::ENTRY).term {
            Terminator::StateSwitch { targets, .. } => {
                // Start state plus one continuation.
                assert_eq!(targets[0].0, 0);
                assert_eq!(targets.len(), 2);
                // The continuation's key is the encoded resume target.
                assert_eq!(targets[1].0, encode_resume(0));
                assert!(targets[1].0 < 0, "encoded targets are negative");
            }
            other => panic!("expected dispatch switch, got {:?}", other),
        }
        assert_eq!(crate::tir::verify::verify(&poll), Ok(()));
    }

    #[test]
    fn test_suspension_returns_pending() {
        let f = recv_add_one();
        let poll = lower_async(&f).unwrap();
        // Find the block holding the recv-yield: it must end by returning
        // the pending constant.
        let suspend_block = poll
            .blocks
            .iter()
            .find(|b| b.insts.iter().any(|i| matches!(i.kind, OpKind::ChanRecvYield { .. })))
            .expect("suspension block exists");
        assert!(matches!(
            suspend_block.insts.last().unwrap().kind,
            OpKind::Const(Const::Pending)
        ));
        assert!(matches!(suspend_block.term, Terminator::Return(_)));
    }

    #[test]
    fn test_continuation_reloads_resume_value() {
        let f = recv_add_one();
        let poll = lower_async(&f).unwrap();
        // The continuation re-materializes the received value from the
        // frame and finishes the add.
        let cont = poll
            .blocks
            .iter()
            .find(|b| {
                b.insts.iter().any(|i| matches!(i.kind, OpKind::FrameLoad { .. }))
                    && b.insts.iter().any(|i| matches!(i.kind, OpKind::Add))
            })
            .expect("continuation exists");
        assert!(matches!(cont.term, Terminator::Return(_)));
    }

    #[test]
    fn test_prefix_values_spilled() {
        // A value computed before the yield and used after it must go
        // through the frame.
        let mut b = FunctionBuilder::new("spilly", vec![Ty::Chan, Ty::Int], Tier::Tier0);
        let (ch, x) = (b.param(0), b.param(1));
        let doubled = b.ins(OpKind::Add, vec![x, x]);
        let got = b.ins(OpKind::ChanRecvYield { resume: 0 }, vec![ch]);
        let sum = b.ins(OpKind::Add, vec![doubled, got]);
        b.ret(sum);
        let poll = lower_async(&b.finish()).unwrap();
        let stores = poll
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i.kind, OpKind::FrameStore { .. }))
            .count();
        assert_eq!(stores, 1, "the doubled value spills");
        assert_eq!(crate::tir::verify::verify(&poll), Ok(()));
    }

    #[test]
    fn test_sync_function_rejected() {
        let mut b = FunctionBuilder::new("plain", vec![Ty::Int], Tier::Tier0);
        let x = b.param(0);
        b.ret(x);
        assert!(lower_async(&b.finish()).is_err());
    }
}
