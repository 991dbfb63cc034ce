//! Runtime Token (GIL)
//!
//! A single global runtime instance guarded by an explicit token. Every
//! mutation entrypoint takes a `&mut PyToken`; there is no ambient singleton
//! a caller can mutate without one. Handle-table reads are the one exception:
//! they are lock-free and token-free (see `handle_table`).
//!
//! User threads may run while the token is released (I/O-bound waits) but
//! must re-acquire it before touching objects. Re-entrant acquisition on one
//! thread is a scheduling invariant violation, not a deadlock: we detect it
//! eagerly and abort with a diagnostic.

use crate::classes::ClassRegistry;
use crate::cycle::CycleRing;
use crate::scheduler::SchedulerState;
use molt_core::CapabilitySet;
use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Everything mutable behind the token: the class registry, the scheduler's
/// ready queue, the cycle-candidate ring, and the process capability set.
pub struct RuntimeState {
    pub classes: ClassRegistry,
    pub sched: SchedulerState,
    pub cycle: CycleRing,
    pub caps: CapabilitySet,
}

impl RuntimeState {
    fn new() -> Self {
        RuntimeState {
            classes: ClassRegistry::new(),
            sched: SchedulerState::new(),
            cycle: CycleRing::new(),
            caps: CapabilitySet::empty(),
        }
    }
}

/// The capability object required to mutate runtime state.
///
/// A `PyToken` is proof of exclusive access to the [`RuntimeState`]; passing
/// it by `&mut` down the call stack is what serializes heap mutation.
pub struct PyToken<'rt> {
    state: MutexGuard<'rt, RuntimeState>,
}

impl<'rt> std::ops::Deref for PyToken<'rt> {
    type Target = RuntimeState;
    fn deref(&self) -> &RuntimeState {
        &self.state
    }
}

impl<'rt> std::ops::DerefMut for PyToken<'rt> {
    fn deref_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }
}

static RUNTIME: OnceLock<Mutex<RuntimeState>> = OnceLock::new();

thread_local! {
    /// Re-entrancy sentinel: set while this thread holds the token.
    static HOLDS_TOKEN: Cell<bool> = const { Cell::new(false) };
}

fn runtime() -> &'static Mutex<RuntimeState> {
    RUNTIME.get_or_init(|| Mutex::new(RuntimeState::new()))
}

/// Acquire the runtime token and run `f` with it.
///
/// # Panics
/// Panics on re-entrant acquisition from the same thread; nested `with_gil`
/// is a scheduling invariant violation (a suspension point inside a token
/// section would deadlock the cooperative scheduler).
pub fn with_gil<R>(f: impl FnOnce(&mut PyToken) -> R) -> R {
    struct Sentinel;
    impl Drop for Sentinel {
        fn drop(&mut self) {
            HOLDS_TOKEN.with(|held| held.set(false));
        }
    }

    HOLDS_TOKEN.with(|held| {
        assert!(
            !held.get(),
            "schedule invariant violation: re-entrant with_gil on one thread"
        );
        held.set(true);
    });
    let _sentinel = Sentinel;
    let guard = runtime().lock().unwrap_or_else(|poisoned| {
        // A panicking holder leaves the state observable; the registries are
        // kept consistent at every await of the lock, so continue.
        poisoned.into_inner()
    });
    let mut token = PyToken { state: guard };
    f(&mut token)
}

/// Module-entry acquisition: initializes the intrinsic dispatch table (and
/// verifies it against the manifest) before running `f`. Produced binaries
/// call this once from `main`; later acquisitions use [`with_gil`].
pub fn with_gil_entry<R>(f: impl FnOnce(&mut PyToken) -> R) -> R {
    crate::intrinsics::ensure_initialized();
    with_gil(f)
}

/// True while the current thread holds the token. Used by debug assertions
/// in code that must only run inside a token section.
pub fn current_thread_holds_token() -> bool {
    HOLDS_TOKEN.with(|held| held.get())
}
