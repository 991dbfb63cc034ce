//! Backend Interface
//!
//! The mid-end hands TIR to a backend-agnostic emitter. The core imposes no
//! backend choice; every implementation must honor four contracts:
//!
//! 1. every TIR opcode has a lowering that preserves its documented
//!    semantics; an opcode the backend cannot lower is a hard error, not a
//!    silent fallback;
//! 2. guard failures branch to the instruction's declared deopt target with
//!    no observable reordering of visible effects across the guard;
//! 3. async state tables use the encoded resume targets produced by the
//!    async lowering (bitwise-NOT instruction indices);
//! 4. RC operations are emitted exactly where the explicit
//!    `IncRef`/`DecRef`/`Borrow`/`Release` instructions appear; the backend
//!    inserts none of its own.
//!
//! Emitted modules import the runtime ABI (`molt_alloc`, `molt_inc_ref`,
//! `molt_dec_ref`, `molt_handle_resolve`, `molt_stream_send`,
//! `molt_stream_close`, intrinsic entry points); a WASM emitter additionally
//! imports shared memory and an indirect function table.

pub mod text;

use crate::error::CompileError;
use crate::tir::Module;

/// A code emitter consuming TIR.
pub trait Backend {
    /// Short name used in diagnostics and artifact headers.
    fn name(&self) -> &str;

    /// Emit a whole module. The output must be deterministic: identical
    /// modules produce byte-identical artifacts on every host.
    fn emit_module(&mut self, module: &Module) -> Result<Vec<u8>, CompileError>;
}

pub use text::TextBackend;
