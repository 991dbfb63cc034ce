//! Effect classes shared by the intrinsics manifest and the compiler IR.
//!
//! Every intrinsic and every IR instruction carries one of these classes.
//! They are the single source of truth for what the mid-end may reorder,
//! cache, or delete: `pure` operations are CSE/DCE candidates, `read_heap`
//! operations cache until an interfering write, `call` is a conservative
//! barrier, and `suspend` marks async yield points that pin state-machine
//! lowering.

use serde::{Deserialize, Serialize};

/// Class identifier assigned by the runtime class registry.
pub type ClassId = u32;

/// The coarse effect of an operation.
///
/// The IR refines `write_heap` with a class scope (see the compiler's
/// instruction effects); at the manifest level the scope is the intrinsic's
/// declared parameter class and a bare `write_heap` is conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectClass {
    /// No side effect and no heap read; freely cacheable and deletable.
    Pure,
    /// Reads mutable heap state but writes none.
    ReadHeap,
    /// Writes heap state; invalidates reads scoped by class.
    WriteHeap,
    /// Opaque call; conservative barrier for every cached read.
    Call,
    /// May raise an exception.
    Throw,
    /// Async yield point; splits coroutine state machines.
    Suspend,
}

impl EffectClass {
    /// True when the mid-end may deduplicate two identical operations of this
    /// class between interfering writes.
    pub fn is_cse_candidate(self) -> bool {
        matches!(self, EffectClass::Pure | EffectClass::ReadHeap)
    }

    /// True when an unused result makes the whole operation deletable.
    pub fn is_removable_when_unused(self) -> bool {
        matches!(self, EffectClass::Pure | EffectClass::ReadHeap)
    }
}

impl std::fmt::Display for EffectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EffectClass::Pure => "pure",
            EffectClass::ReadHeap => "read_heap",
            EffectClass::WriteHeap => "write_heap",
            EffectClass::Call => "call",
            EffectClass::Throw => "throw",
            EffectClass::Suspend => "suspend",
        };
        write!(f, "{}", s)
    }
}
