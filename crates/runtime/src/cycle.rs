//! Deferred Cycle Collection
//!
//! Reference counting reclaims acyclic garbage deterministically; dead cycles
//! among tracked compound objects are reclaimed by a deferred trial-deletion
//! pass (Bacon–Rajan). A decrement that lands above zero on a tracked object
//! queues it in a bounded candidate ring; `collect_cycles` periodically
//! drains the ring, simulates the deletion of every internal edge in the
//! candidate subgraph, and frees the members whose simulated counts reach
//! zero with no external support.
//!
//! The collector never moves objects. It only unregisters handle slots, so
//! every reclaimed member's generation bumps and stale handles fail to
//! resolve exactly as they do after an ordinary free.
//!
//! The pass runs while holding the runtime token; nothing mutates the heap
//! underneath the subgraph snapshot.

use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::flags;
use molt_core::Value;
use std::collections::{BTreeMap, VecDeque};

/// Default capacity of the candidate ring.
const DEFAULT_RING_CAPACITY: usize = 1024;

/// Bounded buffer of cycle candidates (handle values, so a freed-and-reused
/// slot is detected by generation mismatch at drain time).
pub struct CycleRing {
    buf: VecDeque<Value>,
    capacity: usize,
    /// Candidates dropped because the ring was full. A dropped candidate is
    /// only a missed collection opportunity, never a leaked invariant: the
    /// next interior decrement re-queues it.
    pub overflow: u64,
}

impl CycleRing {
    pub fn new() -> Self {
        CycleRing {
            buf: VecDeque::with_capacity(DEFAULT_RING_CAPACITY),
            capacity: DEFAULT_RING_CAPACITY,
            overflow: 0,
        }
    }

    pub fn push(&mut self, v: Value) {
        if self.buf.len() >= self.capacity {
            self.overflow += 1;
            return;
        }
        self.buf.push_back(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn drain(&mut self) -> Vec<Value> {
        self.buf.drain(..).collect()
    }
}

impl Default for CycleRing {
    fn default() -> Self {
        CycleRing::new()
    }
}

/// One node of the candidate subgraph snapshot.
struct Node {
    value: Value,
    strong: u32,
    weak: u32,
    rooted: bool,
    /// Outgoing edges into tracked snapshot members (by index).
    tracked_edges: Vec<u32>,
    /// All outgoing handle edges (for releasing non-cycle references).
    all_edges: Vec<Value>,
}

/// Run one trial-deletion pass over the queued candidates. Returns the
/// number of objects reclaimed.
pub fn collect_cycles(token: &mut PyToken<'_>) -> usize {
    let candidates = token.cycle.drain();
    if candidates.is_empty() {
        return 0;
    }
    let table = HandleTable::global();

    // Phase 1: snapshot the subgraph reachable from live candidates through
    // tracked edges. BTreeMap keys the traversal by index so the pass is
    // deterministic run to run.
    let mut nodes: BTreeMap<u32, Node> = BTreeMap::new();
    let mut frontier: Vec<Value> = Vec::new();
    for v in candidates {
        let Some(obj) = table.resolve(v) else {
            continue; // freed (or reused) since it was queued
        };
        obj.header.clear_flag(flags::CYCLE_CANDIDATE);
        drop(obj);
        frontier.push(v);
    }
    while let Some(v) = frontier.pop() {
        let index = v.as_handle().index;
        if nodes.contains_key(&index) {
            continue;
        }
        let Some(obj) = table.resolve(v) else {
            continue;
        };
        let children = obj.payload(token).child_handles();
        let mut tracked_edges = Vec::new();
        for &child in &children {
            if let Some(child_obj) = table.resolve(child) {
                if child_obj.header.has_flag(flags::TRACKED) {
                    tracked_edges.push(child.as_handle().index);
                    drop(child_obj);
                    frontier.push(child);
                }
            }
        }
        nodes.insert(
            index,
            Node {
                value: v,
                strong: obj.header.strong_count(),
                weak: obj.header.weak_count(),
                rooted: obj.header.has_flag(flags::ROOTED)
                    || obj.header.has_flag(flags::IMMORTAL),
                tracked_edges,
                all_edges: children,
            },
        );
    }

    // Phase 2: trial deletion. Simulate removing every internal edge; a
    // member still supported afterwards is externally reachable.
    let mut trial: BTreeMap<u32, i64> = nodes
        .iter()
        .map(|(&idx, n)| (idx, n.strong as i64))
        .collect();
    for node in nodes.values() {
        for &target in &node.tracked_edges {
            if nodes.contains_key(&target) {
                *trial.get_mut(&target).expect("snapshot member") -= 1;
            }
        }
    }

    // Phase 3: scan. Members with external support (or pinned roots) keep
    // everything they reach; the rest are white.
    let mut black: BTreeMap<u32, bool> = nodes.keys().map(|&k| (k, false)).collect();
    let mut scan: Vec<u32> = nodes
        .iter()
        .filter(|(idx, n)| n.rooted || trial[idx] > 0)
        .map(|(&idx, _)| idx)
        .collect();
    while let Some(idx) = scan.pop() {
        let marked = black.get_mut(&idx).expect("snapshot member");
        if *marked {
            continue;
        }
        *marked = true;
        for &target in &nodes[&idx].tracked_edges {
            if nodes.contains_key(&target) && !black[&target] {
                scan.push(target);
            }
        }
    }

    // Phase 4: collect the white members. Internal edges die with the cycle;
    // edges leaving it are released normally so external objects see an
    // ordinary decrement.
    let white: Vec<u32> = nodes
        .keys()
        .copied()
        .filter(|idx| !black[idx])
        .collect();
    for &idx in &white {
        let node = &nodes[&idx];
        let Some(obj) = table.resolve(node.value) else {
            continue;
        };
        obj.header.set_flag(flags::FINALIZED);
        let payload = obj.take_payload(token);
        drop(payload);
        drop(obj);
        for &edge in &node.all_edges {
            let target = edge.as_handle().index;
            let internal = nodes.contains_key(&target) && !black[&target];
            if !internal {
                crate::rc::dec_ref(token, edge);
            }
        }
        if node.weak > 0 {
            table.tombstone_slot(token, idx);
        } else {
            table.release_slot(token, idx);
        }
    }

    white.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;
    use crate::object::Payload;
    use crate::rc::{dec_ref, inc_ref, weak_inc, weak_upgrade};
    use serial_test::serial;

    fn alloc_list(token: &mut PyToken<'_>, items: Vec<Value>) -> Value {
        HandleTable::global().alloc(token, Payload::List(items), 0)
    }

    /// Build the A[0]=B, B[0]=A two-cycle and drop the external references.
    fn build_dead_pair() -> (Value, Value) {
        with_gil(|token| {
            let a = alloc_list(token, Vec::new());
            let b = alloc_list(token, Vec::new());
            inc_ref(b);
            if let Payload::List(items) =
                HandleTable::global().resolve(a).unwrap().payload_mut(token)
            {
                items.push(b);
            }
            inc_ref(a);
            if let Payload::List(items) =
                HandleTable::global().resolve(b).unwrap().payload_mut(token)
            {
                items.push(a);
            }
            // Drop both external references; each interior count stays 1.
            dec_ref(token, a);
            dec_ref(token, b);
            (a, b)
        })
    }

    #[test]
    #[serial]
    fn test_two_object_cycle_is_collected() {
        let table = HandleTable::global();
        let (a, b) = build_dead_pair();
        // Still alive: only the cycle keeps them.
        assert!(table.resolve(a).is_some());
        assert!(table.resolve(b).is_some());

        let collected = with_gil(collect_cycles);
        assert_eq!(collected, 2);
        assert!(table.resolve(a).is_none());
        assert!(table.resolve(b).is_none());

        // Both slots show incremented generations.
        assert_eq!(
            table.slot_generation(a.as_handle().index),
            Some(a.as_handle().generation + 1)
        );
        assert_eq!(
            table.slot_generation(b.as_handle().index),
            Some(b.as_handle().generation + 1)
        );
    }

    #[test]
    #[serial]
    fn test_externally_held_cycle_survives() {
        let table = HandleTable::global();
        let (a, b) = build_dead_pair();
        // Resurrect an external reference to A before collection runs.
        inc_ref(a);
        // Re-queue: the earlier candidates were drained into this pass.
        with_gil(|token| token.cycle.push(a));
        let collected = with_gil(collect_cycles);
        assert_eq!(collected, 0, "externally supported cycle must survive");
        assert!(table.resolve(a).is_some());
        assert!(table.resolve(b).is_some());

        // Drop the external ref and collect for real.
        with_gil(|token| {
            dec_ref(token, a);
        });
        let collected = with_gil(collect_cycles);
        assert_eq!(collected, 2);
    }

    #[test]
    #[serial]
    fn test_collect_handles_stale_candidates() {
        // A candidate freed before the pass runs is skipped silently.
        let v = with_gil(|token| {
            let v = alloc_list(token, Vec::new());
            inc_ref(v);
            dec_ref(token, v); // queues candidate
            dec_ref(token, v); // frees it outright
            v
        });
        assert!(HandleTable::global().resolve(v).is_none());
        let collected = with_gil(collect_cycles);
        assert_eq!(collected, 0);
    }

    #[test]
    #[serial]
    fn test_cycle_member_with_weak_ref_tombstones() {
        let table = HandleTable::global();
        let (a, b) = build_dead_pair();
        weak_inc(a);
        let collected = with_gil(collect_cycles);
        assert_eq!(collected, 2);
        // Strong resolution fails for both; the weak upgrade observes death.
        assert!(table.resolve(a).is_none());
        assert!(table.resolve(b).is_none());
        assert!(weak_upgrade(a).is_none());
        // Drain the weak count so the tombstoned slot is finally released.
        with_gil(|token| crate::rc::weak_dec(token, a));
    }

    #[test]
    #[serial]
    fn test_ring_overflow_is_counted() {
        with_gil(|token| {
            let start_overflow = token.cycle.overflow;
            let v = Value::from_handle(molt_core::Handle::new(1, 1));
            for _ in 0..(DEFAULT_RING_CAPACITY + 5) {
                token.cycle.push(v);
            }
            assert_eq!(token.cycle.overflow, start_overflow + 5);
            // Drain so later tests start clean.
            let _ = token.cycle.drain();
        });
    }
}
