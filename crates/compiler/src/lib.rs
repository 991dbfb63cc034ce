//! Molt Compiler Mid-End
//!
//! The typed SSA IR, the canonicalization/SCCP fixed-point pipeline, the
//! guard/deopt legality rules, the async state-machine and explicit-RC
//! lowerings, and the backend-agnostic emitter interface. The frontend (AST
//! to TIR) and the machine backends live out of tree; this crate consumes
//! `.tir` module artifacts and type-facts artifacts and produces verified,
//! optimized modules plus deterministic reference output.
//!
//! ```rust,ignore
//! use moltc::{compile_module, CompilerConfig};
//!
//! let mut module = moltc::artifact::read_module_json(&source_text)?;
//! let stats = compile_module(&mut module, &tfa, &CompilerConfig::default())?;
//! let bytes = moltc::emit(&module, &mut moltc::backend::TextBackend::new())?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod lower;
pub mod opt;
pub mod tfa;
pub mod tir;

pub use backend::{Backend, TextBackend};
pub use config::{CompilerConfig, EmitFormat, OptLevel, Tier};
pub use error::CompileError;
pub use opt::PassStats;
pub use tfa::TypeFacts;

use tir::Module;

/// Run the full mid-end on a module: call checks, site assignment, the
/// optimization fixed point, and final verification.
pub fn compile_module(
    module: &mut Module,
    tfa: &TypeFacts,
    config: &CompilerConfig,
) -> Result<PassStats, CompileError> {
    lower::check_calls(module, config)?;
    lower::assign_call_sites(module);
    let stats = match config.opt_level {
        config::OptLevel::O0 => {
            for func in &module.functions {
                tir::verify::verify(func).map_err(|message| CompileError::Verifier {
                    function: func.name.clone(),
                    message,
                })?;
            }
            PassStats::default()
        }
        config::OptLevel::O1 => opt::run_pipeline(module, tfa, config)?,
    };
    Ok(stats)
}

/// Emit a compiled module through a backend.
pub fn emit(module: &Module, backend: &mut dyn Backend) -> Result<Vec<u8>, CompileError> {
    backend.emit_module(module)
}

/// Module artifact serialization: JSON for inspection, bincode for the
/// compact interchange form.
pub mod artifact {
    use super::tir::Module;

    pub fn write_module_json(module: &Module) -> Result<String, String> {
        serde_json::to_string_pretty(module).map_err(|e| e.to_string())
    }

    pub fn read_module_json(content: &str) -> Result<Module, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    pub fn write_module_bin(module: &Module) -> Result<Vec<u8>, String> {
        bincode::serialize(module).map_err(|e| e.to_string())
    }

    pub fn read_module_bin(bytes: &[u8]) -> Result<Module, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}
