//! Common Subexpression Elimination
//!
//! Pure and `read_heap` operations are candidates. Availability is tracked
//! with epoch counters rather than explicit invalidation sweeps:
//!
//! - every heap write bumps the total write epoch;
//! - a class-scoped write (`write_heap(class)`) bumps that class's epoch;
//! - an opaque call (or suspension) bumps the call epoch, which every
//!   `read_heap` entry is sensitive to.
//!
//! A cached `read_heap` entry records the epochs at creation and is valid
//! only while they are unchanged: a slot load survives writes to other
//! classes but dies at a write to its own class, and any call kills every
//! cached read. Pure entries never expire.
//!
//! The pass is block-local (entries do not flow across block boundaries);
//! duplicate results are rewritten through a substitution map applied to the
//! whole function afterwards.

use crate::opt::{replace_uses, PassStats};
use crate::tir::{Effect, Function, OpKind, ValueId};
use molt_core::ClassId;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Epochs {
    writes: u64,
    calls: u64,
    class: u64,
}

struct BlockScan {
    /// Every heap write, scoped or not.
    any_writes: u64,
    /// Writes with no class scope (could touch anything).
    unscoped_writes: u64,
    /// Conservative barriers: calls, throws, suspensions.
    calls: u64,
    per_class: HashMap<ClassId, u64>,
}

impl BlockScan {
    fn new() -> Self {
        BlockScan {
            any_writes: 0,
            unscoped_writes: 0,
            calls: 0,
            per_class: HashMap::new(),
        }
    }

    fn snapshot_for(&self, effect: Effect, scope: Option<ClassId>) -> Epochs {
        match (effect, scope) {
            (Effect::Pure, _) => Epochs {
                writes: 0,
                calls: 0,
                class: 0,
            },
            // A class-scoped read ignores writes to other classes but dies
            // at a write to its class, any unscoped write, or any call.
            (_, Some(c)) => Epochs {
                writes: self.unscoped_writes,
                calls: self.calls,
                class: self.per_class.get(&c).copied().unwrap_or(0),
            },
            // An unscoped read dies at any write or call.
            (_, None) => Epochs {
                writes: self.any_writes,
                calls: self.calls,
                class: 0,
            },
        }
    }

    fn observe(&mut self, effect: Effect) {
        match effect {
            Effect::Pure | Effect::ReadHeap => {}
            Effect::WriteHeap(Some(c)) => {
                self.any_writes += 1;
                *self.per_class.entry(c).or_insert(0) += 1;
            }
            Effect::WriteHeap(None) => {
                self.any_writes += 1;
                self.unscoped_writes += 1;
            }
            Effect::OpaqueCall | Effect::Throw | Effect::Suspend => {
                self.any_writes += 1;
                self.unscoped_writes += 1;
                self.calls += 1;
            }
        }
    }
}

/// The class a read is scoped to, when it has one.
fn read_scope(kind: &OpKind) -> Option<ClassId> {
    match kind {
        OpKind::SlotLoad { class, .. } => Some(*class),
        _ => None,
    }
}

pub fn run(func: &mut Function, stats: &mut PassStats) -> bool {
    let mut subst: HashMap<ValueId, ValueId> = HashMap::new();
    let mut merged = 0u64;

    for b in func.block_ids() {
        let mut scan = BlockScan::new();
        let mut avail: HashMap<(OpKind, Vec<ValueId>), (ValueId, Epochs)> = HashMap::new();

        let block = func.block_mut(b);
        block.insts.retain_mut(|inst| {
            // Canonicalize operands through the substitutions made so far so
            // a duplicate of a duplicate still matches.
            for a in inst.args.iter_mut() {
                let mut v = *a;
                while let Some(&next) = subst.get(&v) {
                    v = next;
                }
                *a = v;
            }

            let effect = inst.kind.effect();
            let candidate = effect.is_cse_candidate()
                && inst.result.is_some()
                && !inst.kind.is_guard()
                && !matches!(inst.kind, OpKind::Const(_));
            if candidate {
                let key = (inst.kind.clone(), inst.args.clone());
                let scope = read_scope(&inst.kind);
                let current = scan.snapshot_for(effect, scope);
                if let Some((prior, at)) = avail.get(&key) {
                    if *at == current {
                        subst.insert(inst.result.unwrap(), *prior);
                        merged += 1;
                        return false; // drop the duplicate
                    }
                }
                avail.insert(key, (inst.result.unwrap(), current));
            }
            scan.observe(effect);
            true
        });
    }

    if merged == 0 {
        return false;
    }
    replace_uses(func, &subst);
    stats.cse_merged += merged;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tir::builder::FunctionBuilder;
    use crate::tir::{Terminator, Tier, Ty};

    #[test]
    fn test_pure_duplicates_merged() {
        let mut b = FunctionBuilder::new("dup", vec![Ty::Int, Ty::Int], Tier::Tier0);
        let (x, y) = (b.param(0), b.param(1));
        let a = b.ins(OpKind::Add, vec![x, y]);
        let c = b.ins(OpKind::Add, vec![x, y]);
        let sum = b.ins(OpKind::Mul, vec![a, c]);
        b.ret(sum);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        assert_eq!(stats.cse_merged, 1);
        let insts = &f.block(Function::ENTRY).insts;
        assert_eq!(insts.len(), 2);
        // Both operands of the multiply are the surviving add.
        assert_eq!(insts[1].args[0], insts[1].args[1]);
    }

    #[test]
    fn test_scoped_write_invalidates_only_its_class() {
        let mut b = FunctionBuilder::new(
            "scoped",
            vec![Ty::Object(64), Ty::Object(65), Ty::Any],
            Tier::Tier0,
        );
        let (obj_a, obj_b, v) = (b.param(0), b.param(1), b.param(2));
        let load1 = b.ins(OpKind::SlotLoad { class: 64, offset: 0 }, vec![obj_a]);
        // A write to a different class does not invalidate class 64 loads.
        b.ins_void(OpKind::SlotStore { class: 65, offset: 0 }, vec![obj_b, v]);
        let load2 = b.ins(OpKind::SlotLoad { class: 64, offset: 0 }, vec![obj_a]);
        // A write to class 64 does invalidate.
        b.ins_void(OpKind::SlotStore { class: 64, offset: 0 }, vec![obj_a, v]);
        let load3 = b.ins(OpKind::SlotLoad { class: 64, offset: 0 }, vec![obj_a]);
        let partial = b.ins(OpKind::Add, vec![load1, load2]);
        let total = b.ins(OpKind::Add, vec![partial, load3]);
        b.ret(total);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        assert_eq!(stats.cse_merged, 1, "only the pre-store duplicate merges");
    }

    #[test]
    fn test_unscoped_write_invalidates_scoped_reads() {
        let mut b = FunctionBuilder::new(
            "anywrite",
            vec![Ty::Object(64), Ty::Any, Ty::Any],
            Tier::Tier0,
        );
        let (obj, idx, v) = (b.param(0), b.param(1), b.param(2));
        let load1 = b.ins(OpKind::SlotLoad { class: 64, offset: 0 }, vec![obj]);
        // An unscoped store could alias any storage, class 64 included.
        b.ins_void(OpKind::IndexStore, vec![obj, idx, v]);
        let load2 = b.ins(OpKind::SlotLoad { class: 64, offset: 0 }, vec![obj]);
        let sum = b.ins(OpKind::Add, vec![load1, load2]);
        b.ret(sum);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(!run(&mut f, &mut stats));
    }

    #[test]
    fn test_call_invalidates_all_reads() {
        let mut b = FunctionBuilder::new("callbar", vec![Ty::List], Tier::Tier0);
        let list = b.param(0);
        let len1 = b.ins(OpKind::Len, vec![list]);
        b.ins_void(OpKind::Call { symbol: "opaque".into() }, vec![]);
        let len2 = b.ins(OpKind::Len, vec![list]);
        let sum = b.ins(OpKind::Add, vec![len1, len2]);
        b.ret(sum);
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(!run(&mut f, &mut stats), "call is a conservative barrier");
    }

    #[test]
    fn test_merged_value_used_across_blocks() {
        let mut b = FunctionBuilder::new("crossblock", vec![Ty::Int], Tier::Tier0);
        let next = b.new_block(vec![]);
        let x = b.param(0);
        let a = b.ins(OpKind::Add, vec![x, x]);
        let dup = b.ins(OpKind::Add, vec![x, x]);
        b.jump(next, vec![]);
        b.switch_to(next);
        let out = b.ins(OpKind::Mul, vec![dup, a]);
        b.terminate(Terminator::Return(out));
        let mut f = b.finish();
        let mut stats = PassStats::default();
        assert!(run(&mut f, &mut stats));
        // The cross-block use of the dropped duplicate was rewritten.
        let use_block = f.block(next);
        assert_eq!(use_block.insts[0].args[0], use_block.insts[0].args[1]);
        assert_eq!(crate::tir::verify::verify(&f), Ok(()));
    }
}
