//! Reference Text Backend
//!
//! Emits the deterministic `.mir` text artifact: a header followed by the
//! module's canonical rendering. This is the backend used by tests (the
//! determinism and idempotence properties are asserted against its output)
//! and by `moltc opt --emit text`; machine backends implement the same
//! trait out of tree.

use super::Backend;
use crate::error::CompileError;
use crate::tir::Module;
use std::fmt::Write;

/// Artifact format version.
pub const MIR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct TextBackend;

impl TextBackend {
    pub fn new() -> Self {
        TextBackend
    }
}

impl Backend for TextBackend {
    fn name(&self) -> &str {
        "text"
    }

    fn emit_module(&mut self, module: &Module) -> Result<Vec<u8>, CompileError> {
        let mut out = String::new();
        writeln!(out, "; molt-mir v{}", MIR_FORMAT_VERSION)?;
        writeln!(out, "; module {}", module.name)?;
        writeln!(
            out,
            "; functions={} globals={} classes={}",
            module.functions.len(),
            module.globals.len(),
            module.classes.len()
        )?;
        write!(out, "{}", module)?;
        Ok(out.into_bytes())
    }
}
