//! Cancellation Tokens
//!
//! Immutable-shared tokens with a single atomic cancelled bit. Tokens are
//! request-scoped with task overrides: a child token observes its parent's
//! cancellation, while cancelling the child leaves the parent untouched.
//!
//! Cancellation is never injected at arbitrary points. It is observed only
//! at declared cooperative check sites, at `await`, and at `block_on`
//! re-entry; the check raises `Cancelled` synchronously in the coroutine, so
//! its `finally` blocks run like any other unwind.

use crate::exceptions::ExceptionData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    cancelled: AtomicBool,
    parent: Option<Arc<Inner>>,
}

/// A shared cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh root token (request scope).
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// A task-scoped override. The child observes the parent's cancellation;
    /// cancelling the child does not propagate upward.
    pub fn child(&self) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Set the cancelled bit. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// True when this token or any ancestor is cancelled.
    pub fn is_cancelled(&self) -> bool {
        let mut cur = Some(&self.inner);
        while let Some(inner) = cur {
            if inner.cancelled.load(Ordering::Acquire) {
                return true;
            }
            cur = inner.parent.as_ref();
        }
        false
    }

    /// The cooperative check intrinsic: raises `Cancelled` when the bit is
    /// observed set.
    pub fn check(&self) -> Result<(), ExceptionData> {
        if self.is_cancelled() {
            Err(ExceptionData::cancelled())
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
