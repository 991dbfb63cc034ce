//! Molt Runtime
//!
//! The object runtime linked into every Molt output binary: NaN-boxed values
//! resolve through a generational handle table, reclamation is reference
//! counting with deferred cycle collection, and async functions run as
//! cooperative poll state machines with no host event loop.
//!
//! Produced binaries import the C-symbol surface in [`abi`]; the Rust API is
//! exposed for the compiler's tests and for host adapters. All heap mutation
//! flows through the runtime token ([`gil::with_gil`]); handle-table reads
//! are lock-free and token-free.

pub mod abi;
pub mod bigint;
pub mod cancel;
pub mod channel;
pub mod classes;
pub mod containers;
pub mod cycle;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod dispatch;
pub mod exceptions;
pub mod feedback;
pub mod gil;
pub mod handle_table;
pub mod intrinsics;
pub mod object;
pub mod rc;
pub mod scheduler;

pub use cancel::CancelToken;
pub use exceptions::{ExcKind, ExceptionData, RuntimeFault};
pub use gil::{with_gil, with_gil_entry, PyToken};
pub use handle_table::{HandleTable, ObjectRef};
pub use object::{HeapObject, ObjectHeader, Payload, HEADER_SIZE};
pub use scheduler::{block_on, block_on_deadline, poll_future, Coroutine, PollCx, WaitOutcome};
