//! Process-level capability set.
//!
//! Capability-gated intrinsics and FFI-bridge calls consult this set before
//! executing. The set is fixed at process entry; the core never widens it.

use serde::{Deserialize, Serialize};

/// A single grantable capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "fs.read")]
    FsRead,
    #[serde(rename = "fs.write")]
    FsWrite,
    #[serde(rename = "net")]
    Net,
    #[serde(rename = "env.read")]
    EnvRead,
    #[serde(rename = "proc.spawn")]
    ProcSpawn,
}

impl Capability {
    /// All capabilities, in declaration order (stable for display).
    pub const ALL: [Capability; 5] = [
        Capability::FsRead,
        Capability::FsWrite,
        Capability::Net,
        Capability::EnvRead,
        Capability::ProcSpawn,
    ];

    /// The manifest spelling of this capability.
    pub fn name(self) -> &'static str {
        match self {
            Capability::FsRead => "fs.read",
            Capability::FsWrite => "fs.write",
            Capability::Net => "net",
            Capability::EnvRead => "env.read",
            Capability::ProcSpawn => "proc.spawn",
        }
    }

    /// Parse the manifest spelling.
    pub fn parse(s: &str) -> Option<Capability> {
        match s {
            "fs.read" => Some(Capability::FsRead),
            "fs.write" => Some(Capability::FsWrite),
            "net" => Some(Capability::Net),
            "env.read" => Some(Capability::EnvRead),
            "proc.spawn" => Some(Capability::ProcSpawn),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        match self {
            Capability::FsRead => 1 << 0,
            Capability::FsWrite => 1 << 1,
            Capability::Net => 1 << 2,
            Capability::EnvRead => 1 << 3,
            Capability::ProcSpawn => 1 << 4,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A compact set of granted capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set: every gated intrinsic is denied.
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Every capability granted. Useful for tests and trusted tooling.
    pub fn all() -> Self {
        let mut set = CapabilitySet::empty();
        for cap in Capability::ALL {
            set.grant(cap);
        }
        set
    }

    pub fn grant(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.grant(cap);
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a comma-separated grant list, e.g. `"fs.read,net"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut set = CapabilitySet::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let cap = Capability::parse(part)
                .ok_or_else(|| format!("unknown capability '{}'", part))?;
            set.grant(cap);
        }
        Ok(set)
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for cap in Capability::ALL {
            if self.contains(cap) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", cap)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_contains() {
        let mut set = CapabilitySet::empty();
        assert!(!set.contains(Capability::Net));
        set.grant(Capability::Net);
        assert!(set.contains(Capability::Net));
        assert!(!set.contains(Capability::FsWrite));
    }

    #[test]
    fn test_parse_roundtrip() {
        let set = CapabilitySet::parse("fs.read, net").unwrap();
        assert!(set.contains(Capability::FsRead));
        assert!(set.contains(Capability::Net));
        assert!(!set.contains(Capability::EnvRead));
        assert_eq!(set.to_string(), "fs.read,net");
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(CapabilitySet::parse("fs.read,teleport").is_err());
    }

    #[test]
    fn test_all_and_empty() {
        assert!(CapabilitySet::empty().is_empty());
        let all = CapabilitySet::all();
        for cap in Capability::ALL {
            assert!(all.contains(cap));
        }
    }
}
