//! Call Lowering Checks & Site Assignment
//!
//! - assigns inline-cache site ids to indirect and bridge call sites, in a
//!   deterministic function-then-block-then-instruction order, so the
//!   per-site feedback counters line up across identical builds;
//! - checks every `CallIntrinsic` against the manifest (a missing intrinsic
//!   is a compile-time error, never a silent fallback);
//! - checks every `CallBridge` capability tag against both the manifest and
//!   the build's granted capability set.

use crate::config::CompilerConfig;
use crate::error::{CompileError, Location};
use crate::tir::{Module, OpKind};
use molt_core::{Capability, IntrinsicsManifest};

/// Assign site ids to every `CallIndirect` and `CallBridge`. Returns the
/// number of sites assigned.
pub fn assign_call_sites(module: &mut Module) -> u32 {
    let mut next: u32 = 0;
    for func in &mut module.functions {
        for b in 0..func.blocks.len() {
            for inst in &mut func.blocks[b].insts {
                match &mut inst.kind {
                    OpKind::CallIndirect { site } | OpKind::CallBridge { site, .. } => {
                        *site = next;
                        next += 1;
                    }
                    OpKind::Guard { site, .. } => {
                        *site = next;
                        next += 1;
                    }
                    _ => {}
                }
            }
        }
    }
    next
}

/// Validate intrinsic references and bridge capabilities.
pub fn check_calls(module: &Module, config: &CompilerConfig) -> Result<(), CompileError> {
    let manifest = IntrinsicsManifest::canonical();
    for func in &module.functions {
        for b in 0..func.blocks.len() {
            for inst in &func.blocks[b].insts {
                match &inst.kind {
                    OpKind::CallIntrinsic { name } => {
                        if manifest.get(name).is_none() {
                            return Err(CompileError::MissingIntrinsic {
                                name: name.clone(),
                                at: Location {
                                    function: func.name.clone(),
                                    line: inst.line,
                                },
                            });
                        }
                    }
                    OpKind::CallBridge {
                        name, capability, ..
                    } => {
                        let Some(def) = manifest.get(name) else {
                            return Err(CompileError::MissingIntrinsic {
                                name: name.clone(),
                                at: Location {
                                    function: func.name.clone(),
                                    line: inst.line,
                                },
                            });
                        };
                        // The instruction's tag must match the manifest.
                        let declared = def.capability.map(|c| c.name().to_string());
                        if declared.as_deref() != Some(capability.as_str()) {
                            return Err(CompileError::ManifestDrift(format!(
                                "bridge '{}' tagged '{}' but manifest declares '{}'",
                                name,
                                capability,
                                declared.as_deref().unwrap_or("<none>")
                            )));
                        }
                        // And the build must grant it.
                        let Some(cap) = Capability::parse(capability) else {
                            return Err(CompileError::ManifestDrift(format!(
                                "bridge '{}' carries unknown capability '{}'",
                                name, capability
                            )));
                        };
                        if !config.capabilities.contains(cap) {
                            return Err(CompileError::CapabilityMismatch {
                                name: name.clone(),
                                capability: capability.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
