//! Type Facts Artifact
//!
//! A machine-readable record of per-symbol types and trust levels, produced
//! by an external analysis tool and consumed by the optimizer. Trust drives
//! guard placement:
//!
//! - `trusted` facts eliminate guards outright;
//! - `guarded` facts insert a guard plus a deopt edge;
//! - `advisory` facts are documentation and change nothing.
//!
//! ```json
//! { "schema_version": 1, "tool": "molt-infer", "strict": false,
//!   "modules": { "app": {
//!       "globals": { "LIMIT": { "type": "int", "trust": "trusted" } },
//!       "functions": { "hot": {
//!           "params": { "x": { "type": "int", "trust": "guarded" } },
//!           "locals": {}, "returns": { "type": "int", "trust": "advisory" } } } } } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Supported schema version.
pub const TFA_SCHEMA_VERSION: u32 = 1;

/// How much the optimizer may rely on a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    /// Documentation only.
    Advisory,
    /// Speculate, guarded by a deopt edge.
    Guarded,
    /// Assume without a guard.
    Trusted,
}

/// One type fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(rename = "type")]
    pub ty: String,
    pub trust: Trust,
}

/// Facts for one function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionFacts {
    #[serde(default)]
    pub params: BTreeMap<String, Fact>,
    #[serde(default)]
    pub locals: BTreeMap<String, Fact>,
    #[serde(default)]
    pub returns: Option<Fact>,
}

/// Facts for one module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleFacts {
    #[serde(default)]
    pub globals: BTreeMap<String, Fact>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionFacts>,
}

/// The whole artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeFacts {
    pub schema_version: u32,
    pub tool: String,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleFacts>,
}

impl TypeFacts {
    /// An empty artifact (no facts, nothing speculated).
    pub fn empty() -> Self {
        TypeFacts {
            schema_version: TFA_SCHEMA_VERSION,
            tool: String::new(),
            strict: false,
            modules: BTreeMap::new(),
        }
    }

    /// Parse and validate a JSON artifact.
    pub fn parse(content: &str) -> Result<Self, String> {
        let facts: TypeFacts = serde_json::from_str(content)
            .map_err(|e| format!("failed to parse type facts artifact: {}", e))?;
        if facts.schema_version != TFA_SCHEMA_VERSION {
            return Err(format!(
                "type facts schema version {} not supported (expected {})",
                facts.schema_version, TFA_SCHEMA_VERSION
            ));
        }
        Ok(facts)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::parse(&content)
    }

    /// Look up the fact for a function parameter.
    pub fn param_fact(&self, module: &str, function: &str, param: &str) -> Option<&Fact> {
        self.modules
            .get(module)?
            .functions
            .get(function)?
            .params
            .get(param)
    }

    /// Look up the fact for a module global.
    pub fn global_fact(&self, module: &str, symbol: &str) -> Option<&Fact> {
        self.modules.get(module)?.globals.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "schema_version": 1,
        "tool": "molt-infer",
        "strict": true,
        "modules": {
            "app": {
                "globals": { "LIMIT": { "type": "int", "trust": "trusted" } },
                "functions": {
                    "hot": {
                        "params": { "x": { "type": "int", "trust": "guarded" } },
                        "locals": { "i": { "type": "int", "trust": "advisory" } },
                        "returns": { "type": "int", "trust": "advisory" }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let tfa = TypeFacts::parse(SAMPLE).unwrap();
        assert!(tfa.strict);
        let fact = tfa.param_fact("app", "hot", "x").unwrap();
        assert_eq!(fact.ty, "int");
        assert_eq!(fact.trust, Trust::Guarded);
        let g = tfa.global_fact("app", "LIMIT").unwrap();
        assert_eq!(g.trust, Trust::Trusted);
        assert!(tfa.param_fact("app", "hot", "y").is_none());
    }

    #[test]
    fn test_rejects_wrong_schema() {
        let bad = SAMPLE.replace("\"schema_version\": 1", "\"schema_version\": 9");
        assert!(TypeFacts::parse(&bad).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let tfa = TypeFacts::load(&path).unwrap();
        assert_eq!(tfa.tool, "molt-infer");
        assert!(TypeFacts::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let tfa = TypeFacts::parse(SAMPLE).unwrap();
        let a = serde_json::to_string(&tfa).unwrap();
        let b = serde_json::to_string(&TypeFacts::parse(&a).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
