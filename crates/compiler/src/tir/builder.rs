//! Function Builder
//!
//! Frontends and tests construct TIR through this builder: blocks with typed
//! parameters, instructions with minted SSA results, and explicit
//! terminators. Blocks start with an `Unreachable` placeholder terminator so
//! a half-built function is visibly incomplete rather than silently wrong.

use super::{
    Block, BlockId, Const, EffectSummary, Function, GuardOp, Inst, OpKind, Terminator, Tier, Ty,
    ValueId,
};

pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
    line: u32,
}

impl FunctionBuilder {
    /// Start a function; the entry block's parameters are the function
    /// parameters.
    pub fn new(name: impl Into<String>, params: Vec<Ty>, tier: Tier) -> Self {
        let mut next_value = 0u32;
        let param_list: Vec<(ValueId, Ty)> = params
            .into_iter()
            .map(|ty| {
                let id = ValueId(next_value);
                next_value += 1;
                (id, ty)
            })
            .collect();
        let entry = Block {
            params: param_list.clone(),
            insts: Vec::new(),
            term: Terminator::Unreachable,
        };
        FunctionBuilder {
            func: Function {
                name: name.into(),
                params: param_list,
                param_names: Vec::new(),
                blocks: vec![entry],
                effects: EffectSummary::default(),
                tier,
                next_value,
            },
            current: Function::ENTRY,
            line: 0,
        }
    }

    /// Record source parameter names (type facts are keyed by them).
    pub fn set_param_names(&mut self, names: Vec<String>) {
        self.func.param_names = names;
    }

    /// The i-th function parameter's value.
    pub fn param(&self, i: usize) -> ValueId {
        self.func.params[i].0
    }

    /// Create a block with typed parameters.
    pub fn new_block(&mut self, params: Vec<Ty>) -> BlockId {
        let param_list: Vec<(ValueId, Ty)> = params
            .into_iter()
            .map(|ty| (self.func.new_value(), ty))
            .collect();
        self.func.blocks.push(Block {
            params: param_list,
            insts: Vec::new(),
            term: Terminator::Unreachable,
        });
        BlockId(self.func.blocks.len() as u32 - 1)
    }

    /// Parameter values of a block.
    pub fn block_params(&self, block: BlockId) -> Vec<ValueId> {
        self.func.block(block).params.iter().map(|(v, _)| *v).collect()
    }

    /// Switch the insertion point.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Set the source line marker for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    /// Append an instruction with a result.
    pub fn ins(&mut self, kind: OpKind, args: Vec<ValueId>) -> ValueId {
        let result = self.func.new_value();
        let inst = Inst {
            result: Some(result),
            kind,
            args,
            deopt: None,
            line: self.line,
        };
        self.func.block_mut(self.current).insts.push(inst);
        result
    }

    /// Append a result-less instruction.
    pub fn ins_void(&mut self, kind: OpKind, args: Vec<ValueId>) {
        let inst = Inst {
            result: None,
            kind,
            args,
            deopt: None,
            line: self.line,
        };
        self.func.block_mut(self.current).insts.push(inst);
    }

    /// Append a guard with its deopt target (Tier-1 only; the verifier
    /// rejects guards elsewhere).
    pub fn ins_guard(&mut self, op: GuardOp, site: u32, args: Vec<ValueId>, deopt: BlockId) {
        let inst = Inst {
            result: None,
            kind: OpKind::Guard { op, site },
            args,
            deopt: Some(deopt),
            line: self.line,
        };
        self.func.block_mut(self.current).insts.push(inst);
    }

    pub fn const_int(&mut self, n: i64) -> ValueId {
        self.ins(OpKind::Const(Const::Int(n)), vec![])
    }

    pub fn const_float(&mut self, f: f64) -> ValueId {
        self.ins(OpKind::Const(Const::Float(f)), vec![])
    }

    pub fn const_bool(&mut self, b: bool) -> ValueId {
        self.ins(OpKind::Const(Const::Bool(b)), vec![])
    }

    pub fn const_none(&mut self) -> ValueId {
        self.ins(OpKind::Const(Const::None), vec![])
    }

    pub fn const_str(&mut self, s: impl Into<String>) -> ValueId {
        self.ins(OpKind::Const(Const::Str(s.into())), vec![])
    }

    /// Set the current block's terminator.
    pub fn terminate(&mut self, term: Terminator) {
        self.func.block_mut(self.current).term = term;
    }

    pub fn jump(&mut self, target: BlockId, args: Vec<ValueId>) {
        self.terminate(Terminator::Jump { target, args });
    }

    pub fn branch(
        &mut self,
        cond: ValueId,
        then_target: BlockId,
        then_args: Vec<ValueId>,
        else_target: BlockId,
        else_args: Vec<ValueId>,
    ) {
        self.terminate(Terminator::Branch {
            cond,
            then_target,
            then_args,
            else_target,
            else_args,
        });
    }

    pub fn ret(&mut self, v: ValueId) {
        self.terminate(Terminator::Return(v));
    }

    pub fn throw(&mut self, v: ValueId) {
        self.terminate(Terminator::Throw(v));
    }

    /// Declare the function's effect summary.
    pub fn set_effects(&mut self, effects: EffectSummary) {
        self.func.effects = effects;
    }

    /// Finish and return the function.
    pub fn finish(self) -> Function {
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_add_one() {
        let mut b = FunctionBuilder::new("add_one", vec![Ty::Int], Tier::Tier0);
        let x = b.param(0);
        let one = b.const_int(1);
        let sum = b.ins(OpKind::Add, vec![x, one]);
        b.ret(sum);
        let f = b.finish();

        assert_eq!(f.name, "add_one");
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.block(Function::ENTRY).insts.len(), 2);
        assert!(matches!(f.block(Function::ENTRY).term, Terminator::Return(v) if v == sum));
    }

    #[test]
    fn test_value_ids_are_unique() {
        let mut b = FunctionBuilder::new("ids", vec![Ty::Int, Ty::Int], Tier::Tier0);
        let blk = b.new_block(vec![Ty::Int]);
        let c = b.const_int(3);
        let mut seen = vec![b.param(0), b.param(1), c];
        seen.extend(b.block_params(blk));
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(seen.len(), dedup.len());
    }

    #[test]
    fn test_unterminated_block_is_unreachable() {
        let mut b = FunctionBuilder::new("partial", vec![], Tier::Tier0);
        let extra = b.new_block(vec![]);
        let none = b.const_none();
        b.ret(none);
        let f = b.finish();
        assert!(matches!(f.block(extra).term, Terminator::Unreachable));
    }
}
