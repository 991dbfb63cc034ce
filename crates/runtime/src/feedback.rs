//! Runtime Feedback
//!
//! Per-guard-site, per-reason counters incremented when speculation fails.
//! An external specialization loop consumes the counters to propose
//! re-specialization; no observable program behavior depends on them.
//!
//! The feedback artifact is deterministic JSON: sites and reasons are both
//! emitted in sorted order, so two identical runs produce byte-identical
//! files.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Guard-site identifier assigned by the compiler.
pub type SiteId = u32;

/// Why a guard failed (or a gated call was denied).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeoptReason {
    GuardTagTypeMismatch,
    GuardTypeMismatch,
    GuardLayoutMismatch,
    /// guard_dict_shape: subject was None.
    NullObj,
    /// guard_dict_shape: subject was not a heap object.
    NonObject,
    /// guard_dict_shape: object's class differs from the expected class.
    ClassMismatch,
    /// guard_dict_shape: type id is a builtin kind, not a registered class.
    NonTypeClass,
    /// guard_dict_shape: the compiled-in version snapshot is invalid.
    ExpectedVersionInvalid,
    /// guard_dict_shape: class version moved past the snapshot.
    VersionMismatch,
    GuardCalleeMismatch,
    GuardNeEqual,
    GuardIndexOutOfBounds,
    GuardLenTooSmall,
    GuardDictKeysMissing,
    InvokeFfiBridgeCapabilityDenied,
}

impl DeoptReason {
    /// Stable reason name used in the feedback artifact.
    pub fn as_str(self) -> &'static str {
        match self {
            DeoptReason::GuardTagTypeMismatch => "guard_tag_type_mismatch",
            DeoptReason::GuardTypeMismatch => "guard_type_mismatch",
            DeoptReason::GuardLayoutMismatch => "guard_layout_mismatch",
            DeoptReason::NullObj => "null_obj",
            DeoptReason::NonObject => "non_object",
            DeoptReason::ClassMismatch => "class_mismatch",
            DeoptReason::NonTypeClass => "non_type_class",
            DeoptReason::ExpectedVersionInvalid => "expected_version_invalid",
            DeoptReason::VersionMismatch => "version_mismatch",
            DeoptReason::GuardCalleeMismatch => "guard_callee_mismatch",
            DeoptReason::GuardNeEqual => "guard_ne_equal",
            DeoptReason::GuardIndexOutOfBounds => "guard_index_out_of_bounds",
            DeoptReason::GuardLenTooSmall => "guard_len_too_small",
            DeoptReason::GuardDictKeysMissing => "guard_dict_keys_missing",
            DeoptReason::InvokeFfiBridgeCapabilityDenied => {
                "invoke_ffi_bridge_capability_denied"
            }
        }
    }
}

/// Feedback artifact schema version.
pub const FEEDBACK_VERSION: u32 = 1;

static COUNTERS: Mutex<BTreeMap<SiteId, BTreeMap<&'static str, u64>>> =
    Mutex::new(BTreeMap::new());

/// Increment one per-site, per-reason counter.
pub fn record(site: SiteId, reason: DeoptReason) {
    let mut counters = COUNTERS.lock().unwrap();
    *counters
        .entry(site)
        .or_default()
        .entry(reason.as_str())
        .or_insert(0) += 1;
}

/// Current count for a site/reason pair.
pub fn count(site: SiteId, reason: DeoptReason) -> u64 {
    COUNTERS
        .lock()
        .unwrap()
        .get(&site)
        .and_then(|m| m.get(reason.as_str()).copied())
        .unwrap_or(0)
}

/// A sorted snapshot of every counter.
pub fn snapshot() -> BTreeMap<SiteId, BTreeMap<&'static str, u64>> {
    COUNTERS.lock().unwrap().clone()
}

/// Reset all counters (tests and per-run isolation).
pub fn reset() {
    COUNTERS.lock().unwrap().clear();
}

/// Serialize the counters as the deterministic feedback JSON document.
#[cfg(feature = "feedback-json")]
pub fn to_json() -> String {
    use serde::Serialize;

    #[derive(Serialize)]
    struct FeedbackFile {
        version: u32,
        per_site: BTreeMap<String, BTreeMap<&'static str, u64>>,
    }

    let per_site = snapshot()
        .into_iter()
        .map(|(site, reasons)| (site.to_string(), reasons))
        .collect();
    serde_json::to_string_pretty(&FeedbackFile {
        version: FEEDBACK_VERSION,
        per_site,
    })
    .expect("feedback serialization cannot fail")
}

/// Write the per-run feedback artifact.
#[cfg(feature = "feedback-json")]
pub fn write_feedback_file(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::write(path, to_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_record_and_count() {
        reset();
        assert_eq!(count(3, DeoptReason::GuardTagTypeMismatch), 0);
        record(3, DeoptReason::GuardTagTypeMismatch);
        record(3, DeoptReason::GuardTagTypeMismatch);
        record(3, DeoptReason::VersionMismatch);
        assert_eq!(count(3, DeoptReason::GuardTagTypeMismatch), 2);
        assert_eq!(count(3, DeoptReason::VersionMismatch), 1);
        assert_eq!(count(4, DeoptReason::VersionMismatch), 0);
        reset();
    }

    #[test]
    #[serial]
    #[cfg(feature = "feedback-json")]
    fn test_json_is_deterministic_and_sorted() {
        reset();
        record(10, DeoptReason::VersionMismatch);
        record(2, DeoptReason::NullObj);
        record(10, DeoptReason::ClassMismatch);
        let a = to_json();
        let b = to_json();
        assert_eq!(a, b, "identical state serializes identically");
        // Sites appear in sorted numeric-string order; reasons sorted within.
        let class_pos = a.find("class_mismatch").unwrap();
        let version_pos = a.find("version_mismatch").unwrap();
        assert!(class_pos < version_pos);
        assert!(a.contains("\"version\": 1"));
        reset();
    }

    #[test]
    #[serial]
    #[cfg(feature = "feedback-json")]
    fn test_write_feedback_file() {
        reset();
        record(1, DeoptReason::InvokeFfiBridgeCapabilityDenied);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.json");
        write_feedback_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("invoke_ffi_bridge_capability_denied"));
        reset();
    }
}
