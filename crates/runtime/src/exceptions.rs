//! Exception Machinery
//!
//! Raised exceptions are first-class data: a kind, a message, optional
//! carried value (`StopIteration.value`), explicit `__cause__`, implicit
//! `__context__`, a suppression bit, and a traceback assembled from
//! instruction line markers.
//!
//! The active exception lives in a thread-local cell so compiled code can
//! raise without threading an error value through every frame; `Throw`
//! lowers to a store into this cell and `CheckException` to a load. Internal
//! faults (stale handles observed outside recovery sites, manifest drift,
//! scheduler invariant violations) are a separate type: they are bugs, not
//! user-visible exceptions, and are fatal where observed.

use molt_core::Value;
use std::cell::RefCell;

// =============================================================================
// Kinds
// =============================================================================

/// User-visible exception kinds raised by the runtime and compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    Attribute,
    Type,
    Value,
    Index,
    Key,
    StopIteration,
    Cancelled,
    BridgeUnavailable,
}

impl ExcKind {
    /// Source-language spelling of the kind.
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::Attribute => "AttributeError",
            ExcKind::Type => "TypeError",
            ExcKind::Value => "ValueError",
            ExcKind::Index => "IndexError",
            ExcKind::Key => "KeyError",
            ExcKind::StopIteration => "StopIteration",
            ExcKind::Cancelled => "Cancelled",
            ExcKind::BridgeUnavailable => "BridgeUnavailable",
        }
    }
}

// =============================================================================
// Exception data
// =============================================================================

/// A traceback entry: one instruction line marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMarker {
    pub function: String,
    pub line: u32,
}

/// A raised exception.
#[derive(Debug, Clone)]
pub struct ExceptionData {
    pub kind: ExcKind,
    pub message: String,
    /// Carried payload; `StopIteration` uses it for the return value.
    pub value: Option<Value>,
    /// Explicit chain (`raise X from Y`).
    pub cause: Option<Box<ExceptionData>>,
    /// Implicit chain, set by `raise` while another exception is active.
    pub context: Option<Box<ExceptionData>>,
    /// True when an explicit `from` suppressed the implicit context.
    pub suppress_context: bool,
    /// Innermost frame first.
    pub traceback: Vec<LineMarker>,
}

impl ExceptionData {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        ExceptionData {
            kind,
            message: message.into(),
            value: None,
            cause: None,
            context: None,
            suppress_context: false,
            traceback: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Value, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Attribute, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Index, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::Key, message)
    }

    /// `StopIteration` carrying the generator's return value.
    pub fn stop_iteration(value: Value) -> Self {
        let mut exc = Self::new(ExcKind::StopIteration, "");
        exc.value = Some(value);
        exc
    }

    pub fn cancelled() -> Self {
        Self::new(ExcKind::Cancelled, "operation cancelled")
    }

    pub fn bridge_unavailable(name: &str) -> Self {
        Self::new(
            ExcKind::BridgeUnavailable,
            format!("bridge call '{}' denied: capability not granted", name),
        )
    }

    /// Attach an explicit cause, suppressing the implicit context.
    pub fn with_cause(mut self, cause: ExceptionData) -> Self {
        self.cause = Some(Box::new(cause));
        self.suppress_context = true;
        self
    }

    /// Append a traceback marker (innermost first).
    pub fn push_frame(&mut self, function: impl Into<String>, line: u32) {
        self.traceback.push(LineMarker {
            function: function.into(),
            line,
        });
    }
}

impl std::fmt::Display for ExceptionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), self.message)
        }
    }
}

// =============================================================================
// Thread-local active exception
// =============================================================================

thread_local! {
    /// The currently propagating exception, if any.
    static CURRENT: RefCell<Option<ExceptionData>> = const { RefCell::new(None) };
}

/// Raise an exception. If one is already active and the new exception has no
/// explicit chain, the active one becomes its implicit `__context__`.
pub fn raise(mut exc: ExceptionData) {
    if let Some(active) = take_current()
        && exc.context.is_none()
        && !exc.suppress_context
    {
        exc.context = Some(Box::new(active));
    }
    CURRENT.with(|c| *c.borrow_mut() = Some(exc));
}

/// The active exception, cloned, without clearing it.
pub fn last() -> Option<ExceptionData> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Take (and clear) the active exception.
pub fn take_current() -> Option<ExceptionData> {
    CURRENT.with(|c| c.borrow_mut().take())
}

/// True while an exception is propagating.
pub fn has_pending() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Clear any active exception.
pub fn clear() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Kind of the active exception, if any.
pub fn current_kind() -> Option<ExcKind> {
    CURRENT.with(|c| c.borrow().as_ref().map(|e| e.kind))
}

/// Message of the active exception, if any.
pub fn current_message() -> Option<String> {
    CURRENT.with(|c| c.borrow().as_ref().map(|e| e.message.clone()))
}

/// Set the explicit `__cause__` of the active exception.
/// No-op when nothing is propagating.
pub fn set_cause(cause: ExceptionData) {
    CURRENT.with(|c| {
        if let Some(active) = c.borrow_mut().as_mut() {
            active.cause = Some(Box::new(cause));
            active.suppress_context = true;
        }
    });
}

/// Replace the implicit `__context__` of the active exception.
pub fn context_set(context: ExceptionData) {
    CURRENT.with(|c| {
        if let Some(active) = c.borrow_mut().as_mut() {
            active.context = Some(Box::new(context));
        }
    });
}

// =============================================================================
// Internal faults
// =============================================================================

/// Internal-only errors. These are never surfaced as language exceptions;
/// observed outside a recovery site they are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFault {
    /// A stale handle reached a site whose contract requires liveness.
    StaleHandle,
    /// Lowered code referenced an intrinsic absent from the dispatch table.
    MissingIntrinsic(String),
    /// The cooperative scheduler observed an impossible state.
    ScheduleInvariantViolation(String),
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeFault::StaleHandle => write!(f, "stale handle dereference"),
            RuntimeFault::MissingIntrinsic(name) => {
                write!(f, "missing intrinsic '{}'", name)
            }
            RuntimeFault::ScheduleInvariantViolation(msg) => {
                write!(f, "schedule invariant violation: {}", msg)
            }
        }
    }
}

impl std::error::Error for RuntimeFault {}
