//! Compiler configuration.
//!
//! Builder-style options threaded through the pipeline: compilation tier,
//! optimization fuel, the build's granted capability set (bridge calls
//! against ungranted capabilities are compile-time errors), and artifact
//! paths.

use molt_core::CapabilitySet;
use std::path::PathBuf;

/// Compilation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    /// Strict: no speculative guards, no deopt edges; failures are throws.
    #[default]
    Tier0,
    /// Speculative: guards allowed, each with exactly one deopt target.
    Tier1,
}

/// How hard the mid-end works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// Verification and lowering only.
    O0,
    /// The full canonicalization/SCCP fixed point.
    #[default]
    O1,
}

/// Output artifact format for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitFormat {
    /// Deterministic reference text artifact.
    #[default]
    Text,
    /// JSON module dump (inspectable).
    Json,
    /// Compact binary module artifact.
    Bin,
}

/// Configuration for one compilation.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub tier: Tier,
    pub opt_level: OptLevel,
    /// Fixed-point iteration cap for the mid-end (defense against
    /// oscillating rewrites; hitting it is recorded in pass stats).
    pub max_pipeline_iters: usize,
    /// Capabilities this build grants to bridge calls.
    pub capabilities: CapabilitySet,
    /// Type facts artifact path, when one is supplied.
    pub tfa_path: Option<PathBuf>,
    /// Override manifest path (defaults to the embedded canonical manifest).
    pub manifest_path: Option<PathBuf>,
    pub emit: EmitFormat,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            tier: Tier::default(),
            opt_level: OptLevel::default(),
            max_pipeline_iters: 16,
            capabilities: CapabilitySet::empty(),
            tfa_path: None,
            manifest_path: None,
            emit: EmitFormat::default(),
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }

    pub fn with_capabilities(mut self, caps: CapabilitySet) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_tfa(mut self, path: impl Into<PathBuf>) -> Self {
        self.tfa_path = Some(path.into());
        self
    }

    pub fn with_emit(mut self, emit: EmitFormat) -> Self {
        self.emit = emit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_core::Capability;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::new();
        assert_eq!(config.tier, Tier::Tier0);
        assert_eq!(config.opt_level, OptLevel::O1);
        assert!(config.capabilities.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = CompilerConfig::new()
            .with_tier(Tier::Tier1)
            .with_capabilities(CapabilitySet::empty().with(Capability::Net))
            .with_emit(EmitFormat::Json);
        assert_eq!(config.tier, Tier::Tier1);
        assert!(config.capabilities.contains(Capability::Net));
        assert_eq!(config.emit, EmitFormat::Json);
    }
}
