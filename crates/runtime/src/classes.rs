//! Class Registry
//!
//! Every class carries a method table, an ordered fixed-offset attribute
//! slot layout, an MRO computed by C3 linearization, and a monotonic version
//! counter. Attribute shape changes bump the version; shape guards compare a
//! snapshot against the current counter and deoptimize on mismatch.
//!
//! The registry lives behind the runtime token. Reads used by guards go
//! through the token like any other class access; the hot path in emitted
//! code compares against the version snapshot cached in the object header.

use crate::object::FIRST_CLASS_ID;
use molt_core::ClassId;
use std::collections::{BTreeMap, HashMap};

/// Input layout for class registration.
#[derive(Debug, Clone, Default)]
pub struct ClassLayout {
    pub name: String,
    /// Attribute slots declared by this class (order fixes offsets).
    pub slots: Vec<String>,
    /// Direct bases, most-derived-first as written in the class statement.
    pub bases: Vec<ClassId>,
    /// Method name to function symbol id.
    pub methods: BTreeMap<String, u32>,
}

/// A registered class.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub class_id: ClassId,
    pub name: String,
    /// Monotonic shape version; bumped on any layout change.
    pub version: u32,
    /// Full slot table: inherited slots first (MRO order), then own slots.
    /// A slot's position is its fixed offset in instance payloads.
    pub slots: Vec<String>,
    pub methods: BTreeMap<String, u32>,
    pub bases: Vec<ClassId>,
    /// C3 linearization, self first.
    pub mro: Vec<ClassId>,
}

/// The process class registry (token-guarded).
pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    by_name: HashMap<String, ClassId>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            classes: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a class and return its id.
    ///
    /// Fails on duplicate names, unknown bases, and C3-inconsistent
    /// hierarchies. All failures are compile-time errors at the frontend
    /// boundary; at runtime they only occur for hand-built layouts.
    pub fn register_class(&mut self, layout: ClassLayout) -> Result<ClassId, String> {
        if layout.name.trim().is_empty() {
            return Err("class name cannot be empty".into());
        }
        if self.by_name.contains_key(&layout.name) {
            return Err(format!("duplicate class '{}'", layout.name));
        }
        for &base in &layout.bases {
            if self.get(base).is_none() {
                return Err(format!(
                    "class '{}' inherits from unregistered class id {}",
                    layout.name, base
                ));
            }
        }

        let class_id = FIRST_CLASS_ID + self.classes.len() as u32;
        let mro = self.linearize(class_id, &layout.bases, &layout.name)?;

        // Inherited slots first (walking the MRO from most-base to
        // most-derived keeps base offsets stable), then own slots.
        let mut slots: Vec<String> = Vec::new();
        for &ancestor in mro.iter().rev() {
            if ancestor == class_id {
                continue;
            }
            let anc = self.get(ancestor).expect("mro member registered");
            for slot in &anc.slots {
                if !slots.contains(slot) {
                    slots.push(slot.clone());
                }
            }
        }
        for slot in &layout.slots {
            if !slots.contains(slot) {
                slots.push(slot.clone());
            }
        }

        self.by_name.insert(layout.name.clone(), class_id);
        self.classes.push(ClassDescriptor {
            class_id,
            name: layout.name,
            version: 1,
            slots,
            methods: layout.methods,
            bases: layout.bases,
            mro,
        });
        Ok(class_id)
    }

    /// C3 linearization: merge of parent linearizations plus the parent list.
    fn linearize(
        &self,
        class_id: ClassId,
        bases: &[ClassId],
        name: &str,
    ) -> Result<Vec<ClassId>, String> {
        let mut sequences: Vec<Vec<ClassId>> = bases
            .iter()
            .map(|&b| self.get(b).expect("base registered").mro.clone())
            .collect();
        sequences.push(bases.to_vec());

        let mut result = vec![class_id];
        loop {
            sequences.retain(|s| !s.is_empty());
            if sequences.is_empty() {
                return Ok(result);
            }
            // A good head appears in no sequence's tail.
            let mut chosen = None;
            for seq in &sequences {
                let head = seq[0];
                let in_tail = sequences.iter().any(|s| s[1..].contains(&head));
                if !in_tail {
                    chosen = Some(head);
                    break;
                }
            }
            let Some(head) = chosen else {
                return Err(format!(
                    "inconsistent class hierarchy for '{}': no C3 linearization exists",
                    name
                ));
            };
            result.push(head);
            for seq in &mut sequences {
                seq.retain(|&c| c != head);
            }
        }
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassDescriptor> {
        if id < FIRST_CLASS_ID {
            return None;
        }
        self.classes.get((id - FIRST_CLASS_ID) as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClassDescriptor> {
        self.by_name.get(name).and_then(|&id| self.get(id))
    }

    /// Current shape version of a class.
    pub fn version(&self, id: ClassId) -> Option<u32> {
        self.get(id).map(|c| c.version)
    }

    /// Bump the shape version (attribute layout changed). Shape guards
    /// holding the old snapshot fail from now on.
    pub fn bump_class_version(&mut self, id: ClassId) -> Result<u32, String> {
        if id < FIRST_CLASS_ID {
            return Err(format!("type id {} is not a registered class", id));
        }
        let Some(desc) = self.classes.get_mut((id - FIRST_CLASS_ID) as usize) else {
            return Err(format!("unknown class id {}", id));
        };
        desc.version += 1;
        Ok(desc.version)
    }

    /// Fixed offset of an attribute slot, if structified.
    pub fn slot_offset(&self, id: ClassId, attr: &str) -> Option<usize> {
        self.get(id)?.slots.iter().position(|s| s == attr)
    }

    /// Resolve a method through the MRO.
    pub fn method(&self, id: ClassId, name: &str) -> Option<u32> {
        for &ancestor in &self.get(id)?.mro {
            if let Some(&sym) = self.get(ancestor)?.methods.get(name) {
                return Some(sym);
            }
        }
        None
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        ClassRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(name: &str, slots: &[&str], bases: &[ClassId]) -> ClassLayout {
        ClassLayout {
            name: name.into(),
            slots: slots.iter().map(|s| s.to_string()).collect(),
            bases: bases.to_vec(),
            methods: BTreeMap::new(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ClassRegistry::new();
        let id = reg.register_class(layout("Point", &["x", "y"], &[])).unwrap();
        assert!(id >= FIRST_CLASS_ID);
        let desc = reg.get(id).unwrap();
        assert_eq!(desc.name, "Point");
        assert_eq!(desc.mro, vec![id]);
        assert_eq!(reg.slot_offset(id, "x"), Some(0));
        assert_eq!(reg.slot_offset(id, "y"), Some(1));
        assert_eq!(reg.slot_offset(id, "z"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = ClassRegistry::new();
        reg.register_class(layout("A", &[], &[])).unwrap();
        assert!(reg.register_class(layout("A", &[], &[])).is_err());
    }

    #[test]
    fn test_inherited_slot_offsets_stable() {
        let mut reg = ClassRegistry::new();
        let base = reg.register_class(layout("Base", &["a"], &[])).unwrap();
        let derived = reg
            .register_class(layout("Derived", &["b"], &[base]))
            .unwrap();
        // Base slots keep their offsets in derived instances.
        assert_eq!(reg.slot_offset(base, "a"), Some(0));
        assert_eq!(reg.slot_offset(derived, "a"), Some(0));
        assert_eq!(reg.slot_offset(derived, "b"), Some(1));
    }

    #[test]
    fn test_c3_diamond() {
        let mut reg = ClassRegistry::new();
        let o = reg.register_class(layout("O", &[], &[])).unwrap();
        let a = reg.register_class(layout("A", &[], &[o])).unwrap();
        let b = reg.register_class(layout("B", &[], &[o])).unwrap();
        let d = reg.register_class(layout("D", &[], &[a, b])).unwrap();
        // Classic diamond: D A B O.
        assert_eq!(reg.get(d).unwrap().mro, vec![d, a, b, o]);
    }

    #[test]
    fn test_c3_inconsistent_hierarchy_rejected() {
        let mut reg = ClassRegistry::new();
        let a = reg.register_class(layout("A", &[], &[])).unwrap();
        let b = reg.register_class(layout("B", &[], &[])).unwrap();
        let ab = reg.register_class(layout("AB", &[], &[a, b])).unwrap();
        let ba = reg.register_class(layout("BA", &[], &[b, a])).unwrap();
        // Merging (A,B) and (B,A) orders has no consistent linearization.
        assert!(reg.register_class(layout("C", &[], &[ab, ba])).is_err());
    }

    #[test]
    fn test_method_resolution_walks_mro() {
        let mut reg = ClassRegistry::new();
        let mut base = layout("Shape", &[], &[]);
        base.methods.insert("area".into(), 100);
        base.methods.insert("name".into(), 101);
        let base_id = reg.register_class(base).unwrap();

        let mut derived = layout("Circle", &[], &[base_id]);
        derived.methods.insert("area".into(), 200);
        let derived_id = reg.register_class(derived).unwrap();

        assert_eq!(reg.method(derived_id, "area"), Some(200), "override wins");
        assert_eq!(reg.method(derived_id, "name"), Some(101), "inherited");
        assert_eq!(reg.method(derived_id, "missing"), None);
    }

    #[test]
    fn test_version_bump() {
        let mut reg = ClassRegistry::new();
        let id = reg.register_class(layout("A", &["x"], &[])).unwrap();
        assert_eq!(reg.version(id), Some(1));
        assert_eq!(reg.bump_class_version(id), Ok(2));
        assert_eq!(reg.version(id), Some(2));
        assert!(reg.bump_class_version(1).is_err(), "builtin ids rejected");
    }
}
