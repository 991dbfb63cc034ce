//! Handle Table
//!
//! The process-wide map from (index, generation) handles to heap objects, and
//! the sole source of pointer provenance: no raw address ever leaks into a
//! value word, and every dereference flows through a generation-validated
//! slot.
//!
//! ## Structure
//!
//! The table is append-mostly and segmented. Slots live in fixed-size
//! segments; a segment, once published through the atomic segment count, is
//! never moved or freed, so readers index it without any lock. Growth
//! (publishing a fresh segment) happens under the growth lock and is the only
//! structural change writers ever make.
//!
//! ## Reader protocol
//!
//! Readers never block writers. A resolve is: bump the reader count, load the
//! slot generation, load the pointer, re-check the generation, hand out a
//! guard. Reclamation never frees an object directly; it unlinks the pointer
//! and parks the allocation in a graveyard that is drained only when the
//! reader count is zero. All four racing operations are SeqCst: if a
//! reclaimer observed zero readers, any later reader's pointer load observes
//! the unlinked slot.
//!
//! ## Generations
//!
//! A slot's generation increments on every unregister. A handle resolves iff
//! its generation equals the slot's. When a generation would pass the 17-bit
//! ceiling the index is retired outright: proving that no stale handle
//! survives a wrap is not worth one slot in a 2^30 index space.

use crate::gil::PyToken;
use crate::object::{HeapObject, Payload};
use molt_core::{Handle, Value, MAX_GENERATION};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Slots per segment (2^14).
const SEGMENT_SIZE: usize = 1 << 14;

/// Maximum number of segments (bounds the table at 2^22 live objects).
const MAX_SEGMENTS: usize = 256;

/// One table slot.
struct Slot {
    /// Current generation. Starts at 1, bumps on unregister.
    r#gen: AtomicU32,
    /// Owned object pointer, null while the slot is vacant.
    ptr: AtomicPtr<HeapObject>,
    /// Cached type id of the occupant (0 while vacant).
    type_id: AtomicU32,
}

/// A resolved object reference.
///
/// Holding one keeps the reader count non-zero, which pins every parked
/// allocation in the graveyard; the underlying object cannot be freed while
/// the guard lives.
pub struct ObjectRef<'a> {
    obj: &'a HeapObject,
    table: &'a HandleTable,
}

impl<'a> std::ops::Deref for ObjectRef<'a> {
    type Target = HeapObject;
    fn deref(&self) -> &HeapObject {
        self.obj
    }
}

impl<'a> Drop for ObjectRef<'a> {
    fn drop(&mut self) {
        if self.table.readers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.table.try_drain_graveyard();
        }
    }
}

/// The process-wide handle table.
pub struct HandleTable {
    segments: [AtomicPtr<Slot>; MAX_SEGMENTS],
    /// Published segment count; segments below it are immutable and readable.
    seg_count: AtomicUsize,
    /// Growth + fresh-index state.
    growth: Mutex<GrowthState>,
    /// Vacated indices, most recently freed last. LIFO reuse keeps the
    /// table dense and makes free-then-alloc deterministic: the next
    /// allocation takes the last freed index with its bumped generation.
    free_list: Mutex<Vec<u32>>,
    /// In-flight resolve guards.
    readers: AtomicUsize,
    /// Unlinked allocations awaiting a quiescent point.
    graveyard: Mutex<Vec<*mut HeapObject>>,

    // Lifecycle counters (diagnostics; all lock-free).
    pub live_count: AtomicU64,
    pub total_allocated: AtomicU64,
    pub total_freed: AtomicU64,
    pub retired_slots: AtomicU64,
}

// Safety: the graveyard holds exclusively-owned pointers; all other shared
// state is atomic or lock-protected.
unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

struct GrowthState {
    /// Next never-used index.
    next_fresh: u32,
}

impl HandleTable {
    fn new() -> Self {
        HandleTable {
            segments: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            seg_count: AtomicUsize::new(0),
            growth: Mutex::new(GrowthState { next_fresh: 0 }),
            free_list: Mutex::new(Vec::new()),
            readers: AtomicUsize::new(0),
            graveyard: Mutex::new(Vec::new()),
            live_count: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            retired_slots: AtomicU64::new(0),
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static HandleTable {
        static TABLE: std::sync::OnceLock<HandleTable> = std::sync::OnceLock::new();
        TABLE.get_or_init(HandleTable::new)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a heap object and register a slot for it. Returns a tagged
    /// handle value with `rc_strong == 1`.
    ///
    /// Allocation is a mutation entrypoint and requires the runtime token.
    pub fn alloc(&self, _token: &mut PyToken<'_>, payload: Payload, class_version: u32) -> Value {
        let index = self.claim_index();
        let slot = self.slot(index).expect("claimed index is published");
        let generation = slot.r#gen.load(Ordering::Acquire);
        debug_assert!(generation >= 1 && generation <= MAX_GENERATION);

        let type_id = payload.type_id();
        let obj = HeapObject::new(payload, generation, class_version);
        slot.type_id.store(type_id, Ordering::Release);
        slot.ptr.store(Box::into_raw(obj), Ordering::SeqCst);

        self.live_count.fetch_add(1, Ordering::Relaxed);
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        Value::from_handle(Handle::new(index, generation))
    }

    fn claim_index(&self) -> u32 {
        if let Some(index) = self.free_list.lock().unwrap().pop() {
            return index;
        }

        let mut growth = self.growth.lock().unwrap();
        let index = growth.next_fresh;
        let seg = index as usize / SEGMENT_SIZE;
        assert!(
            seg < MAX_SEGMENTS,
            "handle table exhausted ({} slots)",
            MAX_SEGMENTS * SEGMENT_SIZE
        );
        if seg >= self.seg_count.load(Ordering::Acquire) {
            self.publish_segment(seg);
        }
        growth.next_fresh += 1;
        index
    }

    /// Allocate and publish one segment. Caller holds the growth lock.
    fn publish_segment(&self, seg: usize) {
        let mut slots = Vec::with_capacity(SEGMENT_SIZE);
        for _ in 0..SEGMENT_SIZE {
            slots.push(Slot {
                r#gen: AtomicU32::new(1),
                ptr: AtomicPtr::new(std::ptr::null_mut()),
                type_id: AtomicU32::new(0),
            });
        }
        let boxed: Box<[Slot]> = slots.into_boxed_slice();
        // Segments are immortal once published; readers index them lock-free.
        let leaked = Box::leak(boxed);
        self.segments[seg].store(leaked.as_mut_ptr(), Ordering::Release);
        self.seg_count.store(seg + 1, Ordering::Release);
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        let seg = index as usize / SEGMENT_SIZE;
        if seg >= self.seg_count.load(Ordering::Acquire) {
            return None;
        }
        let base = self.segments[seg].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // Safety: published segments are immortal and SEGMENT_SIZE long.
        Some(unsafe { &*base.add(index as usize % SEGMENT_SIZE) })
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve a handle value. Returns `None` for non-handles, stale
    /// generations, and vacated slots; never dereferences a stale pointer.
    pub fn resolve(&self, v: Value) -> Option<ObjectRef<'_>> {
        if !v.is_handle() {
            return None;
        }
        let h = v.as_handle();
        self.readers.fetch_add(1, Ordering::SeqCst);
        match self.resolve_inner(h) {
            Some(obj) => Some(ObjectRef { obj, table: self }),
            None => {
                if self.readers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.try_drain_graveyard();
                }
                None
            }
        }
    }

    fn resolve_inner(&self, h: Handle) -> Option<&HeapObject> {
        let slot = self.slot(h.index)?;
        let g1 = slot.r#gen.load(Ordering::SeqCst);
        if g1 != h.generation {
            return None;
        }
        let p = slot.ptr.load(Ordering::SeqCst);
        if p.is_null() {
            return None;
        }
        // Generation re-check: a reclaim between the two loads unlinks first
        // and bumps the generation, so a torn read fails here.
        if slot.r#gen.load(Ordering::SeqCst) != g1 {
            return None;
        }
        // Safety: non-null under a matching generation with the reader count
        // held; frees are parked until the count drains.
        Some(unsafe { &*p })
    }

    /// Resolve for the weak-reference protocol: matches the occupant by the
    /// header's generation copy instead of the slot generation, so a
    /// tombstoned object (strong-dead, weak refs outstanding) is still
    /// reachable for weak bookkeeping. A reused slot never matches, because
    /// the new occupant's header carries the bumped generation.
    pub fn resolve_for_weak(&self, v: Value) -> Option<ObjectRef<'_>> {
        if !v.is_handle() {
            return None;
        }
        let h = v.as_handle();
        self.readers.fetch_add(1, Ordering::SeqCst);
        let found = (|| {
            let slot = self.slot(h.index)?;
            let p = slot.ptr.load(Ordering::SeqCst);
            if p.is_null() {
                return None;
            }
            // Safety: non-null with the reader count held; see resolve_inner.
            let obj = unsafe { &*p };
            if obj.header.r#gen != h.generation {
                return None;
            }
            Some(obj)
        })();
        match found {
            Some(obj) => Some(ObjectRef { obj, table: self }),
            None => {
                if self.readers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.try_drain_graveyard();
                }
                None
            }
        }
    }

    /// The cached type id of a live handle, without touching the object.
    pub fn slot_type_id(&self, v: Value) -> Option<u32> {
        if !v.is_handle() {
            return None;
        }
        let h = v.as_handle();
        let slot = self.slot(h.index)?;
        if slot.r#gen.load(Ordering::Acquire) != h.generation {
            return None;
        }
        let id = slot.type_id.load(Ordering::Acquire);
        if id == 0 { None } else { Some(id) }
    }

    /// Current generation of a slot (diagnostics and tests).
    pub fn slot_generation(&self, index: u32) -> Option<u32> {
        self.slot(index).map(|s| s.r#gen.load(Ordering::Acquire))
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Unregister a slot whose object is fully dead (no weak refs): bump the
    /// generation, unlink the pointer, park the allocation, recycle the index.
    ///
    /// Called from the RC layer under the runtime token.
    pub fn release_slot(&self, _token: &mut PyToken<'_>, index: u32) {
        let slot = self.slot(index).expect("releasing an unpublished slot");
        let old_gen = self.bump_generation(slot);
        let p = slot.ptr.swap(std::ptr::null_mut(), Ordering::SeqCst);
        slot.type_id.store(0, Ordering::Release);
        if !p.is_null() {
            self.park(p);
        }
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        self.total_freed.fetch_add(1, Ordering::Relaxed);
        self.recycle_index(index, old_gen);
    }

    /// Tombstone a slot whose object still has weak references: the
    /// generation bumps (strong handles go stale) but the allocation stays,
    /// carrying the weak count, and the index is withheld from reuse.
    pub fn tombstone_slot(&self, _token: &mut PyToken<'_>, index: u32) {
        let slot = self.slot(index).expect("tombstoning an unpublished slot");
        self.bump_generation(slot);
        slot.type_id.store(0, Ordering::Release);
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        self.total_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a tombstone once its weak count drained: unlink, park, recycle.
    pub fn release_tombstone(&self, _token: &mut PyToken<'_>, index: u32) {
        let slot = self.slot(index).expect("releasing an unpublished tombstone");
        let r#gen = slot.r#gen.load(Ordering::Acquire);
        let p = slot.ptr.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !p.is_null() {
            self.park(p);
        }
        self.recycle_index(index, r#gen);
    }

    fn bump_generation(&self, slot: &Slot) -> u32 {
        let old = slot.r#gen.load(Ordering::Acquire);
        debug_assert!(old <= MAX_GENERATION);
        let new = if old == MAX_GENERATION { old } else { old + 1 };
        slot.r#gen.store(new, Ordering::SeqCst);
        new
    }

    fn recycle_index(&self, index: u32, gen_after_bump: u32) {
        if gen_after_bump >= MAX_GENERATION {
            // Generation space exhausted: retire the index for the life of
            // the process rather than wrap into live handles.
            self.retired_slots.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.free_list.lock().unwrap().push(index);
    }

    fn park(&self, p: *mut HeapObject) {
        self.graveyard.lock().unwrap().push(p);
        if self.readers.load(Ordering::SeqCst) == 0 {
            self.try_drain_graveyard();
        }
    }

    fn try_drain_graveyard(&self) {
        // try_lock: a contending drain will finish the job; never block a
        // reader's drop path.
        let Ok(mut parked) = self.graveyard.try_lock() else {
            return;
        };
        if self.readers.load(Ordering::SeqCst) != 0 {
            return;
        }
        for p in parked.drain(..) {
            // Safety: unlinked from every slot and no reader is in flight.
            drop(unsafe { Box::from_raw(p) });
        }
    }

    /// Number of objects currently live (excluding tombstones).
    pub fn live(&self) -> u64 {
        self.live_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_alloc_resolve_roundtrip() {
        let table = HandleTable::global();
        let v = with_gil(|token| {
            table.alloc(token, Payload::List(vec![Value::from_int(1)]), 0)
        });
        assert!(v.is_handle());
        let obj = table.resolve(v).expect("fresh handle resolves");
        assert_eq!(obj.header.type_id, crate::object::TYPE_LIST);
        assert_eq!(obj.header.strong_count(), 1);
        assert_eq!(obj.header.r#gen, v.as_handle().generation);
    }

    #[test]
    #[serial]
    fn test_stale_handle_fails_and_index_reuses() {
        let table = HandleTable::global();
        let v = with_gil(|token| table.alloc(token, Payload::List(Vec::new()), 0));
        let h = v.as_handle();

        with_gil(|token| table.release_slot(token, h.index));
        assert!(table.resolve(v).is_none(), "stale handle must not resolve");

        // The index comes back with the next generation.
        let v2 = with_gil(|token| table.alloc(token, Payload::List(Vec::new()), 0));
        let h2 = v2.as_handle();
        assert_eq!(h2.index, h.index);
        assert_eq!(h2.generation, h.generation + 1);
        assert!(table.resolve(v).is_none());
        assert!(table.resolve(v2).is_some());
        with_gil(|token| table.release_slot(token, h2.index));
    }

    #[test]
    #[serial]
    fn test_resolve_non_handle_values() {
        let table = HandleTable::global();
        assert!(table.resolve(Value::from_int(5)).is_none());
        assert!(table.resolve(Value::NONE).is_none());
        assert!(table.resolve(Value::from_float(2.5)).is_none());
    }

    #[test]
    #[serial]
    fn test_slot_type_id_cache() {
        let table = HandleTable::global();
        let v = with_gil(|token| table.alloc(token, Payload::Str("hi".into()), 0));
        assert_eq!(table.slot_type_id(v), Some(crate::object::TYPE_STR));
        with_gil(|token| table.release_slot(token, v.as_handle().index));
        assert_eq!(table.slot_type_id(v), None);
    }

    #[test]
    #[serial]
    fn test_guard_pins_reclamation() {
        let table = HandleTable::global();
        let v = with_gil(|token| table.alloc(token, Payload::Str("pinned".into()), 0));
        let guard = table.resolve(v).unwrap();

        // Release while a guard is live: the slot goes stale immediately but
        // the allocation is parked, so the guard's referent stays valid.
        with_gil(|token| table.release_slot(token, v.as_handle().index));
        assert!(table.resolve(v).is_none());
        assert_eq!(guard.header.type_id, crate::object::TYPE_STR);
        drop(guard);
    }

    #[test]
    #[serial]
    fn test_live_counter_tracks() {
        let table = HandleTable::global();
        let before = table.live();
        let v = with_gil(|token| table.alloc(token, Payload::List(Vec::new()), 0));
        assert_eq!(table.live(), before + 1);
        with_gil(|token| table.release_slot(token, v.as_handle().index));
        assert_eq!(table.live(), before);
    }
}
