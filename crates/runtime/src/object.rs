//! Heap Object Model
//!
//! Every handle-addressed object is a fixed header followed by a
//! type-specific payload. The header layout is `#[repr(C)]` and its size is a
//! runtime constant exported to codegen (`molt_header_size`): emitted code
//! computes payload offsets from it.
//!
//! Payload access is serialized by the runtime token: both the shared and the
//! exclusive accessor take a token borrow, which is what makes the
//! `UnsafeCell` sound. The header's reference counts and flags are atomics
//! and may be touched without the token (RC fast paths).

use crate::bigint::BigInt;
use crate::channel::ChannelState;
use crate::containers::{DictKey, OrderedDict, OrderedSet};
use crate::exceptions::ExceptionData;
use crate::gil::PyToken;
use crate::scheduler::{FutureState, GeneratorState};
use molt_core::{ClassId, Value};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// Builtin type ids
// =============================================================================

// Builtin kinds occupy low type ids; user classes start at FIRST_CLASS_ID.
pub const TYPE_LIST: u32 = 1;
pub const TYPE_STR: u32 = 2;
pub const TYPE_BYTES: u32 = 3;
pub const TYPE_BYTEARRAY: u32 = 4;
pub const TYPE_DICT: u32 = 5;
pub const TYPE_SET: u32 = 6;
pub const TYPE_FLOAT: u32 = 7;
pub const TYPE_BIGINT: u32 = 8;
pub const TYPE_CLOSURE: u32 = 9;
pub const TYPE_GENERATOR: u32 = 10;
pub const TYPE_CHANNEL: u32 = 11;
pub const TYPE_FUTURE: u32 = 12;
pub const TYPE_EXCEPTION: u32 = 13;

/// First type id available to the class registry.
pub const FIRST_CLASS_ID: ClassId = 64;

// =============================================================================
// Header
// =============================================================================

/// Object flag bits.
pub mod flags {
    /// Participates in cycle collection (compound type).
    pub const TRACKED: u32 = 1 << 0;
    /// Pinned as a root; never collected.
    pub const ROOTED: u32 = 1 << 1;
    /// Never reclaimed; RC ops are no-ops.
    pub const IMMORTAL: u32 = 1 << 2;
    /// Currently queued in the cycle-candidate ring.
    pub const CYCLE_CANDIDATE: u32 = 1 << 3;
    /// Layout asserted trusted by the type-facts artifact; shape guards elided.
    pub const TRUSTED_LAYOUT: u32 = 1 << 4;
    /// Finalizer has run; must not run again.
    pub const FINALIZED: u32 = 1 << 5;
}

/// The fixed header preceding every payload.
#[repr(C)]
pub struct ObjectHeader {
    /// Discriminates the payload variant (builtin kind or class id).
    pub type_id: u32,
    /// Snapshot of the class version counter at allocation; shape guards
    /// compare against the registry's current counter.
    pub class_version: u32,
    /// Strong reference count.
    pub rc_strong: AtomicU32,
    /// Weak reference count.
    pub rc_weak: AtomicU32,
    /// Flag bits (see [`flags`]).
    pub flags: AtomicU32,
    /// Copy of the handle-table slot generation, for tombstone validation.
    pub r#gen: u32,
}

/// Header size in bytes, exported to codegen through the runtime ABI.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    pub fn strong_count(&self) -> u32 {
        self.rc_strong.load(Ordering::Acquire)
    }

    pub fn weak_count(&self) -> u32 {
        self.rc_weak.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Type-specific object body.
#[derive(Debug)]
pub enum Payload {
    /// Class instance with a fixed attribute slot layout.
    Instance { class_id: ClassId, slots: Vec<Value> },
    List(Vec<Value>),
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    Dict(OrderedDict),
    Set(OrderedSet),
    /// Boxed float (identity-bearing; arithmetic results stay inline).
    Float(f64),
    BigInt(BigInt),
    /// Captured slots + the function symbol they feed.
    Closure { function: u32, captures: Vec<Value> },
    Generator(GeneratorState),
    Channel(ChannelState),
    Future(FutureState),
    Exception(Box<ExceptionData>),
    /// Strong storage reclaimed; slot tombstoned for outstanding weak refs.
    Freed,
}

impl Payload {
    /// The builtin type id for this payload variant.
    pub fn type_id(&self) -> u32 {
        match self {
            Payload::Instance { class_id, .. } => *class_id,
            Payload::List(_) => TYPE_LIST,
            Payload::Str(_) => TYPE_STR,
            Payload::Bytes(_) => TYPE_BYTES,
            Payload::ByteArray(_) => TYPE_BYTEARRAY,
            Payload::Dict(_) => TYPE_DICT,
            Payload::Set(_) => TYPE_SET,
            Payload::Float(_) => TYPE_FLOAT,
            Payload::BigInt(_) => TYPE_BIGINT,
            Payload::Closure { .. } => TYPE_CLOSURE,
            Payload::Generator(_) => TYPE_GENERATOR,
            Payload::Channel(_) => TYPE_CHANNEL,
            Payload::Future(_) => TYPE_FUTURE,
            Payload::Exception(_) => TYPE_EXCEPTION,
            Payload::Freed => 0,
        }
    }

    /// True for compound types that can form reference cycles and therefore
    /// participate in the cycle collector.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            Payload::Instance { .. }
                | Payload::List(_)
                | Payload::Dict(_)
                | Payload::Set(_)
                | Payload::Closure { .. }
                | Payload::Generator(_)
                | Payload::Channel(_)
                | Payload::Future(_)
        )
    }

    /// Collect the outgoing handle-valued edges of this payload. Drives both
    /// recursive release on free and the cycle collector's traversal.
    pub fn child_handles(&self) -> Vec<Value> {
        fn push_if_handle(out: &mut Vec<Value>, v: Value) {
            if v.is_handle() {
                out.push(v);
            }
        }
        let mut out = Vec::new();
        match self {
            Payload::Instance { slots, .. } => {
                for &v in slots {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::List(items) => {
                for &v in items {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Dict(d) => {
                for (k, v) in d.iter() {
                    push_if_handle(&mut out, k.to_value());
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Set(s) => {
                for k in s.iter() {
                    push_if_handle(&mut out, k.to_value());
                }
            }
            Payload::Closure { captures, .. } => {
                for &v in captures {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Generator(g) => {
                for &v in &g.frame.locals {
                    push_if_handle(&mut out, v);
                }
                if let Some(v) = g.sent {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Channel(c) => {
                // Queued values are owned by the channel. Waiter entries are
                // not counted references and must not appear here.
                for &v in c.queued() {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Future(fut) => {
                for &v in &fut.frame.locals {
                    push_if_handle(&mut out, v);
                }
                if let Some(Ok(v)) = &fut.completed {
                    push_if_handle(&mut out, *v);
                }
            }
            Payload::Exception(exc) => {
                if let Some(v) = exc.value {
                    push_if_handle(&mut out, v);
                }
            }
            Payload::Str(_)
            | Payload::Bytes(_)
            | Payload::ByteArray(_)
            | Payload::Float(_)
            | Payload::BigInt(_)
            | Payload::Freed => {}
        }
        out
    }

    /// Element count for `Len`-style operations, when the variant has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Payload::List(items) => Some(items.len()),
            Payload::Str(s) => Some(s.chars().count()),
            Payload::Bytes(b) | Payload::ByteArray(b) => Some(b.len()),
            Payload::Dict(d) => Some(d.len()),
            Payload::Set(s) => Some(s.len()),
            _ => None,
        }
    }
}

// =============================================================================
// HeapObject
// =============================================================================

/// A header plus payload, owned by the handle table for its lifetime.
pub struct HeapObject {
    pub header: ObjectHeader,
    payload: UnsafeCell<Payload>,
}

// Safety: the payload cell is only accessed through token-taking accessors,
// and the token serializes all such access; header fields are atomics.
unsafe impl Send for HeapObject {}
unsafe impl Sync for HeapObject {}

impl HeapObject {
    /// Build an object with rc_strong = 1 and flags derived from the payload.
    pub fn new(payload: Payload, generation: u32, class_version: u32) -> Box<HeapObject> {
        let mut initial_flags = 0;
        if payload.is_tracked() {
            initial_flags |= flags::TRACKED;
        }
        Box::new(HeapObject {
            header: ObjectHeader {
                type_id: payload.type_id(),
                class_version,
                rc_strong: AtomicU32::new(1),
                rc_weak: AtomicU32::new(0),
                flags: AtomicU32::new(initial_flags),
                r#gen: generation,
            },
            payload: UnsafeCell::new(payload),
        })
    }

    /// Shared payload access under the token.
    pub fn payload<'a>(&'a self, _token: &'a PyToken<'_>) -> &'a Payload {
        // Safety: the token serializes every payload access.
        unsafe { &*self.payload.get() }
    }

    /// Exclusive payload access under the token.
    #[allow(clippy::mut_from_ref)]
    pub fn payload_mut<'a>(&'a self, _token: &'a mut PyToken<'_>) -> &'a mut Payload {
        // Safety: the exclusive token borrow guarantees no concurrent access.
        unsafe { &mut *self.payload.get() }
    }

    /// Replace the payload with the tombstone marker, returning the body.
    /// Used by the reclamation path to run releases outside the cell.
    pub fn take_payload(&self, _token: &mut PyToken<'_>) -> Payload {
        // Safety: exclusive token borrow, as above.
        unsafe { std::mem::replace(&mut *self.payload.get(), Payload::Freed) }
    }
}

/// Convenience for constructing dict keys at call sites that already hold
/// first-class values.
pub fn dict_key(v: Value) -> DictKey {
    DictKey::from_value(v)
}
