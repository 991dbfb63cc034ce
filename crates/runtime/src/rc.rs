//! Reference Counting
//!
//! Deterministic reclamation for acyclic object graphs. Every IR instruction
//! that transfers ownership lowers to one of the four explicit operations
//! here: `inc_ref`, `dec_ref`, `borrow`, `release`. The backend inserts
//! nothing implicitly.
//!
//! Decrement-to-zero finalizes the object, releases its outgoing references
//! (iteratively, so deep structures cannot overflow the stack), and returns
//! the slot to the handle table. An object with outstanding weak references
//! leaves a tombstone carrying the weak count instead.
//!
//! A decrement that lands above zero on a tracked compound object queues the
//! object as a cycle candidate; see `cycle` for the deferred trial-deletion
//! pass that reclaims dead cycles.

use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::flags;
use molt_core::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live borrow-token count (debug accounting for the lowering invariant that
/// no borrow survives a potential deallocation site).
static ACTIVE_BORROWS: AtomicUsize = AtomicUsize::new(0);

/// Increment the strong count of a handle value. Non-handles are no-ops.
///
/// # Panics
/// Incrementing a stale handle is heap corruption (an internal
/// `StaleHandle` fault) and aborts.
pub fn inc_ref(v: Value) {
    if !v.is_handle() {
        return;
    }
    let table = HandleTable::global();
    let obj = table
        .resolve(v)
        .unwrap_or_else(|| panic!("{}", crate::exceptions::RuntimeFault::StaleHandle));
    if obj.header.has_flag(flags::IMMORTAL) {
        return;
    }
    obj.header.rc_strong.fetch_add(1, Ordering::AcqRel);
}

/// Decrement the strong count of a handle value; reclaim on zero.
///
/// Reclamation cascades through the object's outgoing references with an
/// explicit worklist. Requires the runtime token: finalization mutates
/// payloads and the handle table.
pub fn dec_ref(token: &mut PyToken<'_>, v: Value) {
    let table = HandleTable::global();
    let mut worklist = vec![v];

    while let Some(v) = worklist.pop() {
        if !v.is_handle() {
            continue;
        }
        let index = v.as_handle().index;
        let Some(obj) = table.resolve(v) else {
            panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
        };
        if obj.header.has_flag(flags::IMMORTAL) {
            continue;
        }

        let old = obj.header.rc_strong.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "dec_ref underflow on index {}", index);

        if old > 1 {
            // Still referenced. A tracked compound object may now be an
            // interior member of a dead cycle; queue it for trial deletion.
            if obj.header.has_flag(flags::TRACKED)
                && !obj.header.has_flag(flags::CYCLE_CANDIDATE)
            {
                obj.header.set_flag(flags::CYCLE_CANDIDATE);
                drop(obj);
                token.cycle.push(v);
            }
            continue;
        }

        // Reached zero: finalize exactly once, release children, free.
        if !obj.header.has_flag(flags::FINALIZED) {
            obj.header.set_flag(flags::FINALIZED);
        }
        let payload = obj.take_payload(token);
        worklist.extend(payload.child_handles());
        let has_weak = obj.header.weak_count() > 0;
        drop(payload);
        drop(obj);

        if has_weak {
            table.tombstone_slot(token, index);
        } else {
            table.release_slot(token, index);
        }
    }
}

// =============================================================================
// Borrows
// =============================================================================

/// A non-owning alias of a handle value, valid until the next potential
/// deallocation site. The compiler's lowering guarantees the lifetime bound;
/// the runtime only counts them for debug verification.
pub struct BorrowToken {
    value: Value,
}

impl BorrowToken {
    pub fn value(&self) -> Value {
        self.value
    }
}

impl Drop for BorrowToken {
    fn drop(&mut self) {
        ACTIVE_BORROWS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Create a non-owning alias without touching the reference count.
pub fn borrow(v: Value) -> BorrowToken {
    ACTIVE_BORROWS.fetch_add(1, Ordering::AcqRel);
    BorrowToken { value: v }
}

/// Release a borrow. Equivalent to dropping the token; the explicit form
/// mirrors the IR's `Release` instruction.
pub fn release(token: BorrowToken) {
    drop(token);
}

/// Number of live borrow tokens (debug verification).
pub fn active_borrows() -> usize {
    ACTIVE_BORROWS.load(Ordering::Acquire)
}

// =============================================================================
// Weak references
// =============================================================================

/// Register a weak reference to a live object.
pub fn weak_inc(v: Value) {
    if !v.is_handle() {
        return;
    }
    let table = HandleTable::global();
    let obj = table
        .resolve(v)
        .unwrap_or_else(|| panic!("{}", crate::exceptions::RuntimeFault::StaleHandle));
    obj.header.rc_weak.fetch_add(1, Ordering::AcqRel);
}

/// Drop a weak reference. When the last weak reference to a strong-dead
/// tombstone drains, the slot is finally released.
pub fn weak_dec(token: &mut PyToken<'_>, v: Value) {
    if !v.is_handle() {
        return;
    }
    let table = HandleTable::global();
    let Some(obj) = table.resolve_for_weak(v) else {
        panic!("{}", crate::exceptions::RuntimeFault::StaleHandle);
    };
    let old = obj.header.rc_weak.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(old > 0, "weak_dec underflow");
    let now_drained = old == 1 && obj.header.strong_count() == 0;
    let index = v.as_handle().index;
    drop(obj);
    if now_drained {
        table.release_tombstone(token, index);
    }
}

/// Attempt to upgrade a weak reference to a strong one. Returns the handle
/// value with an incremented strong count while the object is alive, `None`
/// once the strong count has reached zero.
pub fn weak_upgrade(v: Value) -> Option<Value> {
    let table = HandleTable::global();
    let obj = table.resolve_for_weak(v)?;
    // A tombstone keeps its allocation but its strong count is zero.
    if obj.header.strong_count() == 0 {
        return None;
    }
    obj.header.rc_strong.fetch_add(1, Ordering::AcqRel);
    Some(v)
}
