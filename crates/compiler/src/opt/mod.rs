//! Mid-End Optimizer
//!
//! Canonicalizes and simplifies TIR before backend lowering. The pipeline
//! runs to a deterministic fixed point; each iteration is:
//!
//! ```text
//! CFG rebuild -> simplify -> SCCP -> CSE -> LICM -> canonicalize -> DCE
//! ```
//!
//! Tie-breaking follows the declared order: when two transformations apply
//! to the same instruction, simplify sees it first and canonicalize last;
//! within a pass, instructions are visited in reverse post-order. No pass
//! iterates an unordered container without sorting, so the pipeline is
//! bit-identical across runs and hosts, and idempotent: a second full run
//! over its own output changes nothing.
//!
//! An iteration cap bounds pathological oscillation; hitting it is recorded
//! in the stats and the function is still verified and usable.

pub mod canon;
pub mod cfg;
pub mod cse;
pub mod dce;
pub mod licm;
pub mod sccp;
pub mod simplify;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::tfa::TypeFacts;
use crate::tir::{verify, Function, Module, ValueId};
use std::collections::HashMap;
use tracing::debug;

/// Per-transform application counters (telemetry).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub iterations: u64,
    pub simplify_applied: u64,
    pub sccp_folds: u64,
    pub sccp_edges_pruned: u64,
    pub cse_merged: u64,
    pub licm_hoisted: u64,
    pub canon_blocks_removed: u64,
    pub canon_jumps_elided: u64,
    pub canon_guards_hoisted: u64,
    pub dce_removed: u64,
    /// RC operations materialized by the explicit-RC lowering.
    pub rc_ops_inserted: u64,
    /// True when a function hit the iteration cap before reaching a fixed
    /// point.
    pub fuel_exhausted: bool,
}

/// Rewrite every use of the mapped values (instruction operands and
/// terminator operands). Definitions are not touched.
pub fn replace_uses(func: &mut Function, subst: &HashMap<ValueId, ValueId>) {
    if subst.is_empty() {
        return;
    }
    let resolve = |mut v: ValueId| {
        while let Some(&next) = subst.get(&v) {
            v = next;
        }
        v
    };
    for b in func.block_ids() {
        let block = func.block_mut(b);
        for inst in &mut block.insts {
            for a in inst.args.iter_mut() {
                *a = resolve(*a);
            }
        }
        use crate::tir::Terminator;
        match &mut block.term {
            Terminator::Jump { args, .. } => {
                for a in args.iter_mut() {
                    *a = resolve(*a);
                }
            }
            Terminator::Branch {
                cond,
                then_args,
                else_args,
                ..
            } => {
                *cond = resolve(*cond);
                for a in then_args.iter_mut().chain(else_args.iter_mut()) {
                    *a = resolve(*a);
                }
            }
            Terminator::Return(v) | Terminator::Throw(v) => *v = resolve(*v),
            Terminator::StateSwitch { state, .. } => *state = resolve(*state),
            Terminator::TryStart { .. } | Terminator::TryEnd { .. } | Terminator::Unreachable => {}
        }
    }
}

/// Run the pipeline over one function to a fixed point.
pub fn run_function(
    func: &mut Function,
    tfa: &TypeFacts,
    module: &str,
    config: &CompilerConfig,
) -> Result<PassStats, CompileError> {
    verify::verify(func).map_err(|message| CompileError::Verifier {
        function: func.name.clone(),
        message,
    })?;

    let mut stats = PassStats::default();
    for _ in 0..config.max_pipeline_iters {
        stats.iterations += 1;
        // The CFG rebuild is always the first step of an iteration.
        let graph = cfg::Cfg::compute(func);

        let mut changed = false;
        changed |= simplify::run(func, &graph, tfa, module, &mut stats);
        changed |= sccp::run(func, &mut stats);
        changed |= cse::run(func, &mut stats);
        changed |= licm::run(func, &mut stats);
        changed |= canon::run(func, &mut stats);
        changed |= dce::run(func, &mut stats);

        if !changed {
            break;
        }
        if stats.iterations == config.max_pipeline_iters as u64 {
            stats.fuel_exhausted = true;
        }
    }

    verify::verify(func).map_err(|message| CompileError::Verifier {
        function: func.name.clone(),
        message,
    })?;
    debug!(
        function = %func.name,
        iterations = stats.iterations,
        folds = stats.sccp_folds,
        dce = stats.dce_removed,
        "mid-end fixed point"
    );
    Ok(stats)
}

/// Run the pipeline over every function in a module. Functions are
/// processed in module order; stats are summed.
pub fn run_pipeline(
    module: &mut Module,
    tfa: &TypeFacts,
    config: &CompilerConfig,
) -> Result<PassStats, CompileError> {
    let module_name = module.name.clone();
    let mut total = PassStats::default();
    for func in &mut module.functions {
        let stats = run_function(func, tfa, &module_name, config)?;
        total.iterations += stats.iterations;
        total.simplify_applied += stats.simplify_applied;
        total.sccp_folds += stats.sccp_folds;
        total.sccp_edges_pruned += stats.sccp_edges_pruned;
        total.cse_merged += stats.cse_merged;
        total.licm_hoisted += stats.licm_hoisted;
        total.canon_blocks_removed += stats.canon_blocks_removed;
        total.canon_jumps_elided += stats.canon_jumps_elided;
        total.canon_guards_hoisted += stats.canon_guards_hoisted;
        total.dce_removed += stats.dce_removed;
        total.fuel_exhausted |= stats.fuel_exhausted;
    }
    Ok(total)
}
