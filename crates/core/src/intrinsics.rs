//! Intrinsics Manifest
//!
//! The single canonical list of runtime-callable primitives, shared by the
//! compiler (for lowering) and the runtime (for dispatch). Both sides are
//! checked against the same manifest; any drift between what the compiler
//! emits and what the runtime registers is a build error, never a silent
//! fallback.
//!
//! The manifest is declarative TOML:
//!
//! ```toml
//! version = 1
//!
//! [[intrinsic]]
//! name = "str.find"
//! params = ["str", "str"]
//! returns = "int"
//! effect = "pure"
//!
//! [[intrinsic]]
//! name = "fs.read_file"
//! params = ["str"]
//! returns = "bytes"
//! effect = "call"
//! capability = "fs.read"
//! ```
//!
//! Capability-gated intrinsics consult the process capability set before
//! executing; ungated intrinsics never touch it.

use crate::capability::Capability;
use crate::effect::EffectClass;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Manifest format version understood by this toolchain.
pub const MANIFEST_VERSION: u32 = 1;

/// Coarse value kinds used in intrinsic signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Any first-class value.
    Any,
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    List,
    Dict,
    Set,
    Obj,
    Chan,
    Future,
    None,
}

/// A single intrinsic declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrinsicDef {
    /// Stable dotted name, e.g. `"list.append"`. This is the name the
    /// compiler emits and the runtime dispatches on.
    pub name: String,
    /// Parameter kinds, left to right.
    #[serde(default)]
    pub params: Vec<ValueKind>,
    /// Result kind.
    pub returns: ValueKind,
    /// Effect class driving mid-end legality.
    pub effect: EffectClass,
    /// Capability required before the intrinsic may execute.
    #[serde(default)]
    pub capability: Option<Capability>,
}

/// A parsed, validated intrinsics manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrinsicsManifest {
    /// Format version; must equal [`MANIFEST_VERSION`].
    pub version: u32,
    #[serde(rename = "intrinsic", default)]
    pub intrinsics: Vec<IntrinsicDef>,
}

impl IntrinsicsManifest {
    /// Parse a manifest from TOML content and validate it.
    pub fn parse(content: &str) -> Result<Self, String> {
        let manifest: Self = toml::from_str(content)
            .map_err(|e| format!("failed to parse intrinsics manifest: {}", e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate version, name uniqueness, and non-empty names.
    fn validate(&self) -> Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!(
                "intrinsics manifest version {} not supported (expected {})",
                self.version, MANIFEST_VERSION
            ));
        }
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (idx, def) in self.intrinsics.iter().enumerate() {
            if def.name.trim().is_empty() {
                return Err(format!("intrinsic {} has an empty name", idx + 1));
            }
            if let Some(prev) = seen.insert(def.name.as_str(), idx) {
                return Err(format!(
                    "duplicate intrinsic '{}' (entries {} and {})",
                    def.name,
                    prev + 1,
                    idx + 1
                ));
            }
        }
        Ok(())
    }

    /// Look up an intrinsic by name.
    pub fn get(&self, name: &str) -> Option<&IntrinsicDef> {
        self.intrinsics.iter().find(|d| d.name == name)
    }

    /// Stable dispatch index of an intrinsic: its position in the manifest.
    /// Compiler and runtime both derive their tables from this ordering.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.intrinsics.iter().position(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.intrinsics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intrinsics.is_empty()
    }

    /// The canonical manifest embedded in the toolchain. Parsed once.
    pub fn canonical() -> &'static IntrinsicsManifest {
        static CANONICAL: OnceLock<IntrinsicsManifest> = OnceLock::new();
        CANONICAL.get_or_init(|| {
            IntrinsicsManifest::parse(CANONICAL_MANIFEST_TOML)
                .expect("embedded canonical manifest is valid")
        })
    }
}

/// The canonical intrinsics manifest. The runtime's dispatch table and the
/// compiler's lowering tables are both generated from this text; a mismatch
/// on either side fails at initialization.
pub const CANONICAL_MANIFEST_TOML: &str = r#"
version = 1

# --- console ---

[[intrinsic]]
name = "console.print"
params = ["any"]
returns = "none"
effect = "call"

# --- string methods ---

[[intrinsic]]
name = "str.find"
params = ["str", "str"]
returns = "int"
effect = "pure"

[[intrinsic]]
name = "str.split"
params = ["str", "str"]
returns = "list"
effect = "pure"

[[intrinsic]]
name = "str.replace"
params = ["str", "str", "str"]
returns = "str"
effect = "pure"

[[intrinsic]]
name = "str.format"
params = ["str", "list"]
returns = "str"
effect = "pure"

[[intrinsic]]
name = "str.startswith"
params = ["str", "str"]
returns = "bool"
effect = "pure"

[[intrinsic]]
name = "str.endswith"
params = ["str", "str"]
returns = "bool"
effect = "pure"

[[intrinsic]]
name = "str.count"
params = ["str", "str"]
returns = "int"
effect = "pure"

[[intrinsic]]
name = "str.join"
params = ["str", "list"]
returns = "str"
effect = "read_heap"

[[intrinsic]]
name = "str.capitalize"
params = ["str"]
returns = "str"
effect = "pure"

[[intrinsic]]
name = "str.strip"
params = ["str"]
returns = "str"
effect = "pure"

[[intrinsic]]
name = "str.from_obj"
params = ["any"]
returns = "str"
effect = "read_heap"

# --- bytes & bytearray methods ---
# The same method family as str (the source language's bytes type has no
# format method); search ops take and return byte offsets. Every entry
# accepts bytes or bytearray subjects.

[[intrinsic]]
name = "bytes.from_str"
params = ["str"]
returns = "bytes"
effect = "pure"

[[intrinsic]]
name = "bytes.find"
params = ["bytes", "bytes"]
returns = "int"
effect = "pure"

[[intrinsic]]
name = "bytes.split"
params = ["bytes", "bytes"]
returns = "list"
effect = "pure"

[[intrinsic]]
name = "bytes.replace"
params = ["bytes", "bytes", "bytes"]
returns = "bytes"
effect = "pure"

[[intrinsic]]
name = "bytes.startswith"
params = ["bytes", "bytes"]
returns = "bool"
effect = "pure"

[[intrinsic]]
name = "bytes.endswith"
params = ["bytes", "bytes"]
returns = "bool"
effect = "pure"

[[intrinsic]]
name = "bytes.count"
params = ["bytes", "bytes"]
returns = "int"
effect = "pure"

[[intrinsic]]
name = "bytes.join"
params = ["bytes", "list"]
returns = "bytes"
effect = "read_heap"

[[intrinsic]]
name = "bytes.capitalize"
params = ["bytes"]
returns = "bytes"
effect = "pure"

[[intrinsic]]
name = "bytes.strip"
params = ["bytes"]
returns = "bytes"
effect = "pure"

[[intrinsic]]
name = "bytearray.new"
params = ["bytes"]
returns = "bytes"
effect = "write_heap"

[[intrinsic]]
name = "bytearray.append"
params = ["bytes", "int"]
returns = "none"
effect = "write_heap"

# --- containers ---

[[intrinsic]]
name = "list.append"
params = ["list", "any"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "list.pop"
params = ["list"]
returns = "any"
effect = "write_heap"

[[intrinsic]]
name = "list.extend"
params = ["list", "list"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "dict.get"
params = ["dict", "any"]
returns = "any"
effect = "read_heap"

[[intrinsic]]
name = "dict.set"
params = ["dict", "any", "any"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "dict.pop"
params = ["dict", "any"]
returns = "any"
effect = "write_heap"

[[intrinsic]]
name = "dict.keys"
params = ["dict"]
returns = "list"
effect = "read_heap"

[[intrinsic]]
name = "set.add"
params = ["set", "any"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "set.discard"
params = ["set", "any"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "iter.new"
params = ["any"]
returns = "obj"
effect = "read_heap"

[[intrinsic]]
name = "iter.next"
params = ["obj"]
returns = "any"
effect = "write_heap"

# --- numerics ---

[[intrinsic]]
name = "math.abs"
params = ["any"]
returns = "any"
effect = "pure"

[[intrinsic]]
name = "math.floor"
params = ["float"]
returns = "int"
effect = "pure"

[[intrinsic]]
name = "math.ceil"
params = ["float"]
returns = "int"
effect = "pure"

# --- channels & async ---

[[intrinsic]]
name = "chan.new"
params = ["int"]
returns = "chan"
effect = "write_heap"

[[intrinsic]]
name = "chan.send"
params = ["chan", "any"]
returns = "any"
effect = "suspend"

[[intrinsic]]
name = "chan.recv"
params = ["chan"]
returns = "any"
effect = "suspend"

[[intrinsic]]
name = "chan.close"
params = ["chan"]
returns = "none"
effect = "write_heap"

[[intrinsic]]
name = "cancel.check"
params = []
returns = "none"
effect = "throw"

# --- streams (runtime ABI bridge) ---

[[intrinsic]]
name = "stream.send"
params = ["int", "bytes"]
returns = "int"
effect = "call"

[[intrinsic]]
name = "stream.close"
params = ["int"]
returns = "none"
effect = "call"

# --- capability-gated host bridges ---

[[intrinsic]]
name = "fs.read_file"
params = ["str"]
returns = "bytes"
effect = "call"
capability = "fs.read"

[[intrinsic]]
name = "fs.write_file"
params = ["str", "bytes"]
returns = "none"
effect = "call"
capability = "fs.write"

[[intrinsic]]
name = "net.connect"
params = ["str", "int"]
returns = "int"
effect = "call"
capability = "net"

[[intrinsic]]
name = "env.get"
params = ["str"]
returns = "any"
effect = "call"
capability = "env.read"

[[intrinsic]]
name = "proc.spawn"
params = ["list"]
returns = "int"
effect = "call"
capability = "proc.spawn"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_manifest_parses() {
        let manifest = IntrinsicsManifest::canonical();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert!(manifest.len() > 30);
    }

    #[test]
    fn test_lookup_and_index_agree() {
        let manifest = IntrinsicsManifest::canonical();
        let idx = manifest.index_of("list.append").expect("list.append exists");
        assert_eq!(manifest.intrinsics[idx].name, "list.append");
        assert_eq!(manifest.intrinsics[idx].effect, EffectClass::WriteHeap);
    }

    #[test]
    fn test_bytes_method_family_declared() {
        let manifest = IntrinsicsManifest::canonical();
        for name in [
            "bytes.find",
            "bytes.split",
            "bytes.replace",
            "bytes.startswith",
            "bytes.endswith",
            "bytes.count",
            "bytes.join",
            "bytes.capitalize",
            "bytes.strip",
            "bytearray.append",
        ] {
            assert!(manifest.get(name).is_some(), "missing {}", name);
        }
        assert_eq!(
            manifest.get("bytearray.append").unwrap().effect,
            EffectClass::WriteHeap
        );
    }

    #[test]
    fn test_capability_gated_entries() {
        let manifest = IntrinsicsManifest::canonical();
        let def = manifest.get("fs.read_file").unwrap();
        assert_eq!(def.capability, Some(Capability::FsRead));
        let def = manifest.get("str.find").unwrap();
        assert_eq!(def.capability, None);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let toml = r#"
version = 1

[[intrinsic]]
name = "x"
returns = "none"
effect = "pure"

[[intrinsic]]
name = "x"
returns = "none"
effect = "pure"
"#;
        let err = IntrinsicsManifest::parse(toml).unwrap_err();
        assert!(err.contains("duplicate intrinsic 'x'"), "got: {}", err);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let toml = r#"
version = 99

[[intrinsic]]
name = "x"
returns = "none"
effect = "pure"
"#;
        let err = IntrinsicsManifest::parse(toml).unwrap_err();
        assert!(err.contains("version 99"), "got: {}", err);
    }

    #[test]
    fn test_rejects_empty_name() {
        let toml = r#"
version = 1

[[intrinsic]]
name = "  "
returns = "none"
effect = "pure"
"#;
        assert!(IntrinsicsManifest::parse(toml).is_err());
    }

    #[test]
    fn test_suspend_intrinsics_declared() {
        let manifest = IntrinsicsManifest::canonical();
        assert_eq!(
            manifest.get("chan.send").unwrap().effect,
            EffectClass::Suspend
        );
        assert_eq!(
            manifest.get("chan.recv").unwrap().effect,
            EffectClass::Suspend
        );
    }
}
