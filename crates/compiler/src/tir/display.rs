//! Deterministic Text Rendering
//!
//! The IR's text form is stable across runs and hosts: block order is the
//! stored order, instruction order is the stored order, and no unordered
//! container is traversed. The mid-end's idempotence and determinism
//! properties are asserted against this rendering.

use super::{Const, Function, GuardOp, Inst, Module, OpKind, Terminator, Ty};
use std::fmt::{self, Write};

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Any => write!(f, "any"),
            Ty::Int => write!(f, "int"),
            Ty::Float => write!(f, "float"),
            Ty::Bool => write!(f, "bool"),
            Ty::NoneTy => write!(f, "none"),
            Ty::Str => write!(f, "str"),
            Ty::Bytes => write!(f, "bytes"),
            Ty::List => write!(f, "list"),
            Ty::Dict => write!(f, "dict"),
            Ty::Set => write!(f, "set"),
            Ty::Object(c) => write!(f, "obj<{}>", c),
            Ty::Chan => write!(f, "chan"),
            Ty::Future => write!(f, "future"),
            Ty::Gen => write!(f, "gen"),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(n) => write!(f, "int {}", n),
            Const::Float(x) => write!(f, "float {}", x),
            Const::Bool(b) => write!(f, "bool {}", b),
            Const::None => write!(f, "none"),
            Const::Str(s) => write!(f, "str {:?}", s),
            Const::Pending => write!(f, "pending"),
        }
    }
}

/// Render an instruction kind as `mnemonic` plus immediates.
fn render_kind(kind: &OpKind) -> String {
    use OpKind::*;
    match kind {
        Const(c) => format!("const.{}", c),
        Add => "add".into(),
        Sub => "sub".into(),
        Mul => "mul".into(),
        Div => "div".into(),
        FloorDiv => "floordiv".into(),
        Mod => "mod".into(),
        Neg => "neg".into(),
        Not => "not".into(),
        BoolAnd => "and".into(),
        BoolOr => "or".into(),
        CmpEq => "cmp.eq".into(),
        CmpNe => "cmp.ne".into(),
        CmpLt => "cmp.lt".into(),
        CmpLe => "cmp.le".into(),
        CmpGt => "cmp.gt".into(),
        CmpGe => "cmp.ge".into(),
        TypeOf => "typeof".into(),
        IsInstance { class } => format!("isinstance class={}", class),
        Contains => "contains".into(),
        Call { symbol } => format!("call @{}", symbol),
        CallIndirect { site } => format!("call.indirect site={}", site),
        CallIntrinsic { name } => format!("call.intrinsic {}", name),
        CallBridge {
            name,
            capability,
            site,
        } => format!("call.bridge {} cap={} site={}", name, capability, site),
        CallAsync { symbol } => format!("call.async @{}", symbol),
        AllocObject { class } => format!("alloc.object class={}", class),
        AttrLoad { name } => format!("attr.load {}", name),
        AttrStore { name } => format!("attr.store {}", name),
        SlotLoad { class, offset } => format!("slot.load class={} offset={}", class, offset),
        SlotStore { class, offset } => format!("slot.store class={} offset={}", class, offset),
        Index => "index".into(),
        IndexStore => "index.store".into(),
        ListNew => "list.new".into(),
        DictNew => "dict.new".into(),
        SetNew => "set.new".into(),
        Len => "len".into(),
        Slice => "slice".into(),
        IterNew => "iter.new".into(),
        IterNext => "iter.next".into(),
        Enumerate => "enumerate".into(),
        Str(op) => format!("str.{:?}", op).to_lowercase(),
        StrFromObj => "str.from_obj".into(),
        ExcNew { kind } => format!("exc.new {}", kind),
        ExcLast => "exc.last".into(),
        ExcClear => "exc.clear".into(),
        ExcKind => "exc.kind".into(),
        ExcMessage => "exc.message".into(),
        ExcSetCause => "exc.set_cause".into(),
        ExcContextSet => "exc.context_set".into(),
        Raise => "raise".into(),
        CheckException => "check.exception".into(),
        AllocGenerator { body } => format!("alloc.generator @{}", body),
        GenSend => "gen.send".into(),
        GenThrow => "gen.throw".into(),
        GenClose => "gen.close".into(),
        IsGenerator => "is.generator".into(),
        AIter => "aiter".into(),
        ANext => "anext".into(),
        AllocFuture { body } => format!("alloc.future @{}", body),
        StateYield { resume } => format!("state.yield resume={}", resume),
        StateTransition { resume } => format!("state.transition resume={}", resume),
        ChanNew => "chan.new".into(),
        ChanSendYield { resume } => format!("chan.send_yield resume={}", resume),
        ChanRecvYield { resume } => format!("chan.recv_yield resume={}", resume),
        FrameLoad { slot } => format!("frame.load slot={}", slot),
        FrameStore { slot } => format!("frame.store slot={}", slot),
        VecReduce { kind, trusted } => {
            format!("vec.reduce.{:?} trusted={}", kind, trusted).to_lowercase()
        }
        VecReduceRange { kind } => format!("vec.reduce_range.{:?}", kind).to_lowercase(),
        Guard { op, site } => format!("{} site={}", render_guard(op), site),
        IncRef => "inc_ref".into(),
        DecRef => "dec_ref".into(),
        Borrow => "borrow".into(),
        Release => "release".into(),
        Box { ty } => format!("box.{}", ty),
        Unbox { ty } => format!("unbox.{}", ty),
        Cast { ty } => format!("cast.{}", ty),
        Widen { ty } => format!("widen.{}", ty),
    }
}

fn render_guard(op: &GuardOp) -> String {
    match op {
        GuardOp::Type { type_id } => format!("guard.type type_id={}", type_id),
        GuardOp::Tag { tag } => format!("guard.tag {:?}", tag).to_lowercase(),
        GuardOp::Layout { layout } => format!("guard.layout layout={}", layout),
        GuardOp::DictShape { class, version } => {
            format!("guard.dict_shape class={} version={}", class, version)
        }
        GuardOp::DictHasKeys { keys } => {
            format!("guard.dict_has_keys keys=[{}]", keys.join(","))
        }
        GuardOp::LenGe { n } => format!("guard.len_ge n={}", n),
        GuardOp::IndexInBounds => "guard.index_in_bounds".into(),
        GuardOp::Callee { symbol } => format!("guard.callee symbol={}", symbol),
        GuardOp::Ne { constant } => format!("guard.ne const=({})", constant),
    }
}

fn render_inst(inst: &Inst) -> String {
    let mut out = String::new();
    if let Some(r) = inst.result {
        let _ = write!(out, "{} = ", r);
    }
    let _ = write!(out, "{}", render_kind(&inst.kind));
    if !inst.args.is_empty() {
        let args: Vec<String> = inst.args.iter().map(|a| a.to_string()).collect();
        let _ = write!(out, " {}", args.join(", "));
    }
    if let Some(d) = inst.deopt {
        let _ = write!(out, " deopt={}", d);
    }
    out
}

fn render_term(term: &Terminator) -> String {
    fn args(list: &[super::ValueId]) -> String {
        if list.is_empty() {
            String::new()
        } else {
            let rendered: Vec<String> = list.iter().map(|a| a.to_string()).collect();
            format!("({})", rendered.join(", "))
        }
    }
    match term {
        Terminator::Jump { target, args: a } => format!("jump {}{}", target, args(a)),
        Terminator::Branch {
            cond,
            then_target,
            then_args,
            else_target,
            else_args,
        } => format!(
            "branch {}, {}{}, {}{}",
            cond,
            then_target,
            args(then_args),
            else_target,
            args(else_args)
        ),
        Terminator::Return(v) => format!("return {}", v),
        Terminator::Throw(v) => format!("throw {}", v),
        Terminator::TryStart { body, handler } => {
            format!("try.start body={} handler={}", body, handler)
        }
        Terminator::TryEnd { cont } => format!("try.end cont={}", cont),
        Terminator::StateSwitch {
            state,
            targets,
            default,
        } => {
            let cases: Vec<String> = targets
                .iter()
                .map(|(v, b)| format!("{} => {}", v, b))
                .collect();
            format!(
                "state.switch {} [{}] default={}",
                state,
                cases.join(", "),
                default
            )
        }
        Terminator::Unreachable => "unreachable".into(),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tier = match self.tier {
            super::Tier::Tier0 => 0,
            super::Tier::Tier1 => 1,
        };
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(v, ty)| format!("{}: {}", v, ty))
            .collect();
        writeln!(f, "func @{}({}) tier={} {{", self.name, params.join(", "), tier)?;
        for b in self.block_ids() {
            let block = self.block(b);
            let params: Vec<String> = block
                .params
                .iter()
                .map(|(v, ty)| format!("{}: {}", v, ty))
                .collect();
            writeln!(f, "{}({}):", b, params.join(", "))?;
            for inst in &block.insts {
                writeln!(f, "  {}", render_inst(inst))?;
            }
            writeln!(f, "  {}", render_term(&block.term))?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {} {{", self.name)?;
        for global in &self.globals {
            match &global.init {
                Some(init) => {
                    writeln!(f, "global {}: {} = {}", global.name, global.ty, init)?
                }
                None => writeln!(f, "global {}: {}", global.name, global.ty)?,
            }
        }
        for class in &self.classes {
            writeln!(
                f,
                "class {} id={} slots=[{}]",
                class.name,
                class.class_id,
                class.slots.join(",")
            )?;
        }
        for func in &self.functions {
            write!(f, "{}", func)?;
        }
        writeln!(f, "}}")
    }
}
