//! Insertion-Ordered Containers
//!
//! Dict and set payloads preserve insertion order: iteration over a dict
//! yields keys in the order they were first inserted, matching the source
//! language's observable semantics and keeping codegen deterministic.
//!
//! Keys are restricted to hashable value shapes. Handles hash by identity
//! (index, generation), which is correct because the encoding is canonical
//! and a live handle's bits never change.

use molt_core::Value;
use std::collections::HashMap;

/// A hashable projection of a [`Value`] usable as a dict/set key.
///
/// Floats are keyed by raw bits; the canonical-NaN rule in the encoding
/// guarantees two equal floats (NaN aside) have equal bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DictKey(u64);

impl DictKey {
    /// Project a value to a key. Every first-class value word works: the
    /// encoding is canonical, so bit equality is semantic equality for all
    /// boxed values and for non-NaN floats.
    pub fn from_value(v: Value) -> DictKey {
        DictKey(v.to_bits())
    }

    pub fn to_value(self) -> Value {
        // Keys are only ever built from first-class value words.
        unsafe { Value::from_bits(self.0) }
    }
}

/// Insertion-ordered hash map for dict payloads.
///
/// Entries live in a dense vector; the index map points at live positions.
/// Removal tombstones the vector slot and a periodic compaction (on growth)
/// keeps the dense form bounded by 2x the live count.
#[derive(Debug, Default)]
pub struct OrderedDict {
    entries: Vec<Option<(DictKey, Value)>>,
    index: HashMap<DictKey, usize>,
    live: usize,
}

impl OrderedDict {
    pub fn new() -> Self {
        OrderedDict::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: DictKey) -> Option<Value> {
        let pos = *self.index.get(&key)?;
        self.entries[pos].map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: DictKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Insert or overwrite. Returns the previous value when overwriting; the
    /// entry keeps its original insertion position on overwrite.
    pub fn insert(&mut self, key: DictKey, value: Value) -> Option<Value> {
        if let Some(&pos) = self.index.get(&key) {
            let slot = self.entries[pos].as_mut().expect("indexed entry is live");
            let old = slot.1;
            slot.1 = value;
            return Some(old);
        }
        self.maybe_compact();
        self.index.insert(key, self.entries.len());
        self.entries.push(Some((key, value)));
        self.live += 1;
        None
    }

    /// Remove an entry, returning its value.
    pub fn remove(&mut self, key: DictKey) -> Option<Value> {
        let pos = self.index.remove(&key)?;
        let (_, value) = self.entries[pos].take().expect("indexed entry is live");
        self.live -= 1;
        Some(value)
    }

    /// Iterate live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (DictKey, Value)> + '_ {
        self.entries.iter().filter_map(|e| *e)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = DictKey> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(_, v)| v)
    }

    fn maybe_compact(&mut self) {
        if self.entries.len() < 8 || self.entries.len() < self.live * 2 {
            return;
        }
        let old = std::mem::take(&mut self.entries);
        self.index.clear();
        for entry in old.into_iter().flatten() {
            self.index.insert(entry.0, self.entries.len());
            self.entries.push(Some(entry));
        }
    }
}

/// Insertion-ordered set for set payloads. A thin wrapper over the dict.
#[derive(Debug, Default)]
pub struct OrderedSet {
    inner: OrderedDict,
}

impl OrderedSet {
    pub fn new() -> Self {
        OrderedSet::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, key: DictKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Add a member. Returns true when newly inserted.
    pub fn insert(&mut self, key: DictKey) -> bool {
        self.inner.insert(key, Value::NONE).is_none()
    }

    /// Remove a member if present. Never raises; `discard` semantics.
    pub fn discard(&mut self, key: DictKey) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = DictKey> + '_ {
        self.inner.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> DictKey {
        DictKey::from_value(Value::from_int(n))
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut d = OrderedDict::new();
        for n in [5, 1, 9, 3] {
            d.insert(key(n), Value::from_int(n * 10));
        }
        let keys: Vec<i64> = d.keys().map(|k| k.to_value().as_int()).collect();
        assert_eq!(keys, vec![5, 1, 9, 3]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut d = OrderedDict::new();
        d.insert(key(1), Value::from_int(10));
        d.insert(key(2), Value::from_int(20));
        let old = d.insert(key(1), Value::from_int(11));
        assert_eq!(old.unwrap().as_int(), 10);
        let keys: Vec<i64> = d.keys().map(|k| k.to_value().as_int()).collect();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(d.get(key(1)).unwrap().as_int(), 11);
    }

    #[test]
    fn test_remove_and_len() {
        let mut d = OrderedDict::new();
        d.insert(key(1), Value::from_int(10));
        d.insert(key(2), Value::from_int(20));
        assert_eq!(d.len(), 2);
        assert_eq!(d.remove(key(1)).unwrap().as_int(), 10);
        assert_eq!(d.len(), 1);
        assert!(d.remove(key(1)).is_none());
        let keys: Vec<i64> = d.keys().map(|k| k.to_value().as_int()).collect();
        assert_eq!(keys, vec![2]);
    }

    #[test]
    fn test_compaction_preserves_order() {
        let mut d = OrderedDict::new();
        for n in 0..32 {
            d.insert(key(n), Value::from_int(n));
        }
        for n in 0..24 {
            d.remove(key(n));
        }
        // Trigger compaction via further growth.
        for n in 100..110 {
            d.insert(key(n), Value::from_int(n));
        }
        let keys: Vec<i64> = d.keys().map(|k| k.to_value().as_int()).collect();
        let expected: Vec<i64> = (24..32).chain(100..110).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_set_semantics() {
        let mut s = OrderedSet::new();
        assert!(s.insert(key(1)));
        assert!(!s.insert(key(1)));
        assert!(s.contains(key(1)));
        assert!(s.discard(key(1)));
        assert!(!s.discard(key(1)));
        assert!(s.is_empty());
    }

    #[test]
    fn test_small_str_keys() {
        let mut d = OrderedDict::new();
        let k = DictKey::from_value(Value::try_from_str("name").unwrap());
        d.insert(k, Value::from_int(1));
        let k2 = DictKey::from_value(Value::try_from_str("name").unwrap());
        assert_eq!(d.get(k2).unwrap().as_int(), 1);
    }
}
