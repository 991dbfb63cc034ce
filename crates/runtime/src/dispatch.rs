//! Call Binding & Dispatch
//!
//! Argument binding implements the full positional / keyword / varargs /
//! keyword-only / positional-only rules with defaults; arity and keyword
//! errors are `TypeError`s with precise messages.
//!
//! Indirect call sites carry an inline cache of (callee type_id, class
//! version) checked by `guard_callee`; a miss falls back to full dispatch,
//! records per-site feedback, and repopulates the cache. The other guard
//! primitives live here too: all are side-effect-free checks whose failure
//! transfers control to a deopt target in emitted code, never raising by
//! themselves.

use crate::exceptions::ExceptionData;
use crate::feedback::{self, DeoptReason, SiteId};
use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::{dict_key, flags, Payload, FIRST_CLASS_ID};
use molt_core::{Capability, Value, ValueTag};
use std::sync::atomic::{AtomicU64, Ordering};

/// Arity limit for the inline register-passing convention; calls beyond it
/// go through the variadic trampoline (a slice of boxed words).
pub const MAX_INLINE_ARGS: usize = 8;

/// A runtime-callable function in slice convention.
pub type RawFn = fn(&mut PyToken<'_>, &[Value]) -> Result<Value, ExceptionData>;

/// The variadic trampoline: arbitrary arity beyond the inline-friendly
/// limit travels as one contiguous slice of value words. Emitted code
/// switches convention at [`MAX_INLINE_ARGS`]; the runtime side is uniform.
pub fn call_varargs(
    token: &mut PyToken<'_>,
    f: RawFn,
    args: &[Value],
) -> Result<Value, ExceptionData> {
    f(token, args)
}

// =============================================================================
// Argument binding
// =============================================================================

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        ParamSpec {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// A callee's full binding signature.
#[derive(Debug, Clone, Default)]
pub struct BindSpec {
    /// Parameters before the `/` marker: positional-only.
    pub pos_only: Vec<ParamSpec>,
    /// Ordinary parameters: positional or keyword.
    pub pos_or_kw: Vec<ParamSpec>,
    /// Accepts `*args`.
    pub varargs: bool,
    /// Parameters after the `*` marker: keyword-only.
    pub kw_only: Vec<ParamSpec>,
    /// Accepts `**kwargs`.
    pub kwargs: bool,
}

/// The result of a successful bind: one slot per declared parameter in
/// declaration order, plus overflow buckets.
#[derive(Debug)]
pub struct BoundArgs {
    pub slots: Vec<Value>,
    pub varargs: Vec<Value>,
    pub extra_kwargs: Vec<(String, Value)>,
}

/// Bind call arguments against a signature.
pub fn bind(
    spec: &BindSpec,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<BoundArgs, ExceptionData> {
    let n_pos_params = spec.pos_only.len() + spec.pos_or_kw.len();
    let n_slots = n_pos_params + spec.kw_only.len();
    let mut slots: Vec<Option<Value>> = vec![None; n_slots];
    let mut varargs = Vec::new();
    let mut extra_kwargs: Vec<(String, Value)> = Vec::new();

    // Positional arguments fill pos-only then pos-or-kw, overflowing into
    // *args when declared.
    for (i, &arg) in args.iter().enumerate() {
        if i < n_pos_params {
            slots[i] = Some(arg);
        } else if spec.varargs {
            varargs.push(arg);
        } else {
            return Err(ExceptionData::type_error(format!(
                "takes {} positional argument{} but {} were given",
                n_pos_params,
                if n_pos_params == 1 { "" } else { "s" },
                args.len()
            )));
        }
    }

    // Keyword arguments.
    for (name, value) in kwargs {
        if let Some(pos) = spec.pos_or_kw.iter().position(|p| &p.name == name) {
            let slot = spec.pos_only.len() + pos;
            if slots[slot].is_some() {
                return Err(ExceptionData::type_error(format!(
                    "got multiple values for argument '{}'",
                    name
                )));
            }
            slots[slot] = Some(*value);
        } else if let Some(pos) = spec.kw_only.iter().position(|p| &p.name == name) {
            let slot = n_pos_params + pos;
            if slots[slot].is_some() {
                return Err(ExceptionData::type_error(format!(
                    "got multiple values for argument '{}'",
                    name
                )));
            }
            slots[slot] = Some(*value);
        } else if spec.pos_only.iter().any(|p| &p.name == name) && !spec.kwargs {
            return Err(ExceptionData::type_error(format!(
                "argument '{}' is positional-only",
                name
            )));
        } else if spec.kwargs {
            extra_kwargs.push((name.clone(), *value));
        } else {
            return Err(ExceptionData::type_error(format!(
                "got an unexpected keyword argument '{}'",
                name
            )));
        }
    }

    // Defaults, then missing-argument errors.
    let all_params = spec
        .pos_only
        .iter()
        .chain(spec.pos_or_kw.iter())
        .chain(spec.kw_only.iter());
    let mut bound = Vec::with_capacity(n_slots);
    for (i, param) in all_params.enumerate() {
        match slots[i] {
            Some(v) => bound.push(v),
            None => match param.default {
                Some(d) => bound.push(d),
                None => {
                    let kind = if i >= n_pos_params {
                        "keyword-only argument"
                    } else {
                        "required positional argument"
                    };
                    return Err(ExceptionData::type_error(format!(
                        "missing {}: '{}'",
                        kind, param.name
                    )));
                }
            },
        }
    }

    Ok(BoundArgs {
        slots: bound,
        varargs,
        extra_kwargs,
    })
}

// =============================================================================
// Inline-cache sites
// =============================================================================

/// One indirect-call inline cache: packed (type_id, class_version), zero
/// when empty.
pub struct CallSite {
    pub site_id: SiteId,
    key: AtomicU64,
}

impl CallSite {
    pub const fn new(site_id: SiteId) -> Self {
        CallSite {
            site_id,
            key: AtomicU64::new(0),
        }
    }

    fn pack(type_id: u32, version: u32) -> u64 {
        ((type_id as u64) << 32) | version as u64
    }

    /// `guard_callee`: compare the cached (type_id, version) pair. A miss
    /// records feedback and reports false; the caller falls back to full
    /// dispatch and then repopulates.
    pub fn guard_callee(&self, type_id: u32, version: u32) -> bool {
        let key = Self::pack(type_id, version);
        if self.key.load(Ordering::Acquire) == key {
            return true;
        }
        feedback::record(self.site_id, DeoptReason::GuardCalleeMismatch);
        false
    }

    /// Repopulate after a fallback dispatch.
    pub fn populate(&self, type_id: u32, version: u32) {
        self.key.store(Self::pack(type_id, version), Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.key.load(Ordering::Acquire) == 0
    }
}

// =============================================================================
// Guard primitives
// =============================================================================

/// `guard_tag`: NaN-box tag check.
pub fn guard_tag(site: SiteId, v: Value, expected: ValueTag) -> bool {
    let ok = v.is_boxed() && v.tag_bits() == expected as u8;
    if !ok {
        feedback::record(site, DeoptReason::GuardTagTypeMismatch);
    }
    ok
}

/// `guard_type`: heap type id check through the slot cache.
pub fn guard_type(site: SiteId, v: Value, type_id: u32) -> bool {
    let ok = HandleTable::global().slot_type_id(v) == Some(type_id);
    if !ok {
        feedback::record(site, DeoptReason::GuardTypeMismatch);
    }
    ok
}

/// `guard_layout`: compound object's cached layout fingerprint (the header
/// class_version snapshot) still matches.
pub fn guard_layout(site: SiteId, v: Value, expected_version: u32) -> bool {
    let table = HandleTable::global();
    let ok = match table.resolve(v) {
        Some(obj) => {
            obj.header.has_flag(flags::TRUSTED_LAYOUT)
                || obj.header.class_version == expected_version
        }
        None => false,
    };
    if !ok {
        feedback::record(site, DeoptReason::GuardLayoutMismatch);
    }
    ok
}

/// `guard_dict_shape`: the full shape check with per-reason feedback.
pub fn guard_dict_shape(
    token: &PyToken<'_>,
    site: SiteId,
    v: Value,
    expected_class: u32,
    expected_version: u32,
) -> bool {
    if v.is_none() {
        feedback::record(site, DeoptReason::NullObj);
        return false;
    }
    let table = HandleTable::global();
    let Some(type_id) = table.slot_type_id(v) else {
        feedback::record(site, DeoptReason::NonObject);
        return false;
    };
    if type_id < FIRST_CLASS_ID {
        feedback::record(site, DeoptReason::NonTypeClass);
        return false;
    }
    if type_id != expected_class {
        feedback::record(site, DeoptReason::ClassMismatch);
        return false;
    }
    if expected_version == 0 {
        feedback::record(site, DeoptReason::ExpectedVersionInvalid);
        return false;
    }
    if token.classes.version(expected_class) != Some(expected_version) {
        feedback::record(site, DeoptReason::VersionMismatch);
        return false;
    }
    true
}

/// `guard_dict_has_keys`: every listed key present.
pub fn guard_dict_has_keys(
    token: &PyToken<'_>,
    site: SiteId,
    d: Value,
    keys: &[Value],
) -> bool {
    let table = HandleTable::global();
    let ok = match table.resolve(d) {
        Some(obj) => match obj.payload(token) {
            Payload::Dict(map) => keys.iter().all(|&k| map.contains_key(dict_key(k))),
            _ => false,
        },
        None => false,
    };
    if !ok {
        feedback::record(site, DeoptReason::GuardDictKeysMissing);
    }
    ok
}

/// `guard_len_ge`: container length is at least `n`.
pub fn guard_len_ge(token: &PyToken<'_>, site: SiteId, a: Value, n: usize) -> bool {
    let table = HandleTable::global();
    let ok = match table.resolve(a) {
        Some(obj) => obj.payload(token).len().is_some_and(|len| len >= n),
        None => false,
    };
    if !ok {
        feedback::record(site, DeoptReason::GuardLenTooSmall);
    }
    ok
}

/// `guard_index_in_bounds`: `0 <= i < len(a)`.
pub fn guard_index_in_bounds(token: &PyToken<'_>, site: SiteId, a: Value, i: i64) -> bool {
    let table = HandleTable::global();
    let ok = i >= 0
        && match table.resolve(a) {
            Some(obj) => obj
                .payload(token)
                .len()
                .is_some_and(|len| (i as usize) < len),
            None => false,
        };
    if !ok {
        feedback::record(site, DeoptReason::GuardIndexOutOfBounds);
    }
    ok
}

/// `guard_ne`: value differs from a compiled-in constant.
pub fn guard_ne(site: SiteId, v: Value, constant: Value) -> bool {
    let ok = !v.same_bits(constant);
    if !ok {
        feedback::record(site, DeoptReason::GuardNeEqual);
    }
    ok
}

// =============================================================================
// FFI-bridge calls
// =============================================================================

/// Invoke a capability-gated bridge intrinsic. Denial increments the
/// per-site counter and raises `BridgeUnavailable`.
pub fn bridge_call(
    token: &mut PyToken<'_>,
    site: SiteId,
    name: &str,
    required: Capability,
    args: &[Value],
) -> Result<Value, ExceptionData> {
    if !token.caps.contains(required) {
        feedback::record(site, DeoptReason::InvokeFfiBridgeCapabilityDenied);
        return Err(ExceptionData::bridge_unavailable(name));
    }
    crate::intrinsics::dispatch_by_name(token, name, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;
    use serial_test::serial;

    fn spec_full() -> BindSpec {
        // def f(a, /, b, c=3, *args, d, e=5, **kw)
        BindSpec {
            pos_only: vec![ParamSpec::required("a")],
            pos_or_kw: vec![
                ParamSpec::required("b"),
                ParamSpec::with_default("c", Value::from_int(3)),
            ],
            varargs: true,
            kw_only: vec![
                ParamSpec::required("d"),
                ParamSpec::with_default("e", Value::from_int(5)),
            ],
            kwargs: true,
        }
    }

    #[test]
    fn test_bind_positional_and_defaults() {
        let spec = spec_full();
        let args = [Value::from_int(1), Value::from_int(2)];
        let kwargs = [("d".to_string(), Value::from_int(4))];
        let bound = bind(&spec, &args, &kwargs).unwrap();
        let ints: Vec<i64> = bound.slots.iter().map(|v| v.as_int()).collect();
        assert_eq!(ints, vec![1, 2, 3, 4, 5]);
        assert!(bound.varargs.is_empty());
        assert!(bound.extra_kwargs.is_empty());
    }

    #[test]
    fn test_bind_varargs_overflow() {
        let spec = spec_full();
        let args: Vec<Value> = (1..=5).map(Value::from_int).collect();
        let kwargs = [("d".to_string(), Value::from_int(9))];
        let bound = bind(&spec, &args, &kwargs).unwrap();
        assert_eq!(bound.slots[2].as_int(), 3);
        let extra: Vec<i64> = bound.varargs.iter().map(|v| v.as_int()).collect();
        assert_eq!(extra, vec![4, 5]);
    }

    #[test]
    fn test_bind_rejects_arity_overflow_without_varargs() {
        let spec = BindSpec {
            pos_or_kw: vec![ParamSpec::required("x")],
            ..BindSpec::default()
        };
        let args = [Value::from_int(1), Value::from_int(2)];
        let err = bind(&spec, &args, &[]).unwrap_err();
        assert!(err.message.contains("takes 1 positional argument but 2"));
    }

    #[test]
    fn test_bind_duplicate_value_rejected() {
        let spec = spec_full();
        let args = [Value::from_int(1), Value::from_int(2)];
        let kwargs = [
            ("b".to_string(), Value::from_int(9)),
            ("d".to_string(), Value::from_int(4)),
        ];
        let err = bind(&spec, &args, &kwargs).unwrap_err();
        assert!(err.message.contains("multiple values for argument 'b'"));
    }

    #[test]
    fn test_bind_positional_only_as_keyword() {
        let spec = BindSpec {
            pos_only: vec![ParamSpec::required("a")],
            ..BindSpec::default()
        };
        let kwargs = [("a".to_string(), Value::from_int(1))];
        let err = bind(&spec, &[], &kwargs).unwrap_err();
        assert!(err.message.contains("positional-only"));
    }

    #[test]
    fn test_bind_unknown_keyword() {
        let spec = BindSpec {
            pos_or_kw: vec![ParamSpec::required("x")],
            ..BindSpec::default()
        };
        let kwargs = [("y".to_string(), Value::from_int(1))];
        let err = bind(&spec, &[Value::from_int(1)], &kwargs).unwrap_err();
        assert!(err.message.contains("unexpected keyword argument 'y'"));
    }

    #[test]
    fn test_bind_missing_required() {
        let spec = spec_full();
        let err = bind(&spec, &[Value::from_int(1)], &[]).unwrap_err();
        assert!(err.message.contains("required positional argument: 'b'"));
        let kwargs: Vec<(String, Value)> = vec![];
        let err = bind(
            &spec,
            &[Value::from_int(1), Value::from_int(2)],
            &kwargs,
        )
        .unwrap_err();
        assert!(err.message.contains("keyword-only argument: 'd'"));
    }

    #[test]
    fn test_bind_extra_kwargs_bucket() {
        let spec = spec_full();
        let args = [Value::from_int(1), Value::from_int(2)];
        let kwargs = [
            ("d".to_string(), Value::from_int(4)),
            ("other".to_string(), Value::from_int(77)),
        ];
        let bound = bind(&spec, &args, &kwargs).unwrap();
        assert_eq!(bound.extra_kwargs.len(), 1);
        assert_eq!(bound.extra_kwargs[0].0, "other");
    }

    #[test]
    #[serial]
    fn test_variadic_trampoline() {
        fn sum_all(_t: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
            Ok(Value::from_int(args.iter().map(|v| v.as_int()).sum()))
        }
        with_gil(|token| {
            let args: Vec<Value> = (1..=12).map(Value::from_int).collect();
            assert!(args.len() > MAX_INLINE_ARGS);
            let out = call_varargs(token, sum_all, &args).unwrap();
            assert_eq!(out.as_int(), 78);
        });
    }

    #[test]
    #[serial]
    fn test_call_site_cache_cycle() {
        feedback::reset();
        let site = CallSite::new(900);
        assert!(site.is_empty());
        // Cold: miss, then populate, then hit.
        assert!(!site.guard_callee(64, 1));
        assert_eq!(
            feedback::count(900, DeoptReason::GuardCalleeMismatch),
            1
        );
        site.populate(64, 1);
        assert!(site.guard_callee(64, 1));
        // Shape change: version bump misses again.
        assert!(!site.guard_callee(64, 2));
        assert_eq!(
            feedback::count(900, DeoptReason::GuardCalleeMismatch),
            2
        );
        feedback::reset();
    }

    #[test]
    #[serial]
    fn test_guard_tag_records_reason() {
        feedback::reset();
        assert!(guard_tag(7, Value::from_int(1), ValueTag::Int));
        assert!(!guard_tag(7, Value::from_float(2.5), ValueTag::Int));
        assert_eq!(feedback::count(7, DeoptReason::GuardTagTypeMismatch), 1);
        feedback::reset();
    }

    #[test]
    #[serial]
    fn test_guard_dict_shape_reasons() {
        feedback::reset();
        with_gil(|token| {
            // None subject.
            assert!(!guard_dict_shape(token, 20, Value::NONE, 64, 1));
            assert_eq!(feedback::count(20, DeoptReason::NullObj), 1);
            // Scalar subject.
            assert!(!guard_dict_shape(token, 20, Value::from_int(1), 64, 1));
            assert_eq!(feedback::count(20, DeoptReason::NonObject), 1);
        });
        feedback::reset();
    }

    #[test]
    #[serial]
    fn test_guard_dict_shape_version_tracking() {
        feedback::reset();
        with_gil(|token| {
            let class_id = token
                .classes
                .register_class(crate::classes::ClassLayout {
                    name: format!("ShapeProbe{}", feedback::FEEDBACK_VERSION),
                    slots: vec!["x".into()],
                    ..Default::default()
                })
                .unwrap();
            let version = token.classes.version(class_id).unwrap();
            let inst = HandleTable::global().alloc(
                token,
                Payload::Instance {
                    class_id,
                    slots: vec![Value::NONE],
                },
                version,
            );
            assert!(guard_dict_shape(token, 21, inst, class_id, version));
            // Bump the class version: the snapshot goes stale.
            token.classes.bump_class_version(class_id).unwrap();
            assert!(!guard_dict_shape(token, 21, inst, class_id, version));
            assert_eq!(feedback::count(21, DeoptReason::VersionMismatch), 1);
            crate::rc::dec_ref(token, inst);
        });
        feedback::reset();
    }

    #[test]
    #[serial]
    fn test_bounds_guards() {
        feedback::reset();
        with_gil(|token| {
            let list = HandleTable::global().alloc(
                token,
                Payload::List(vec![Value::from_int(1), Value::from_int(2)]),
                0,
            );
            assert!(guard_len_ge(token, 30, list, 2));
            assert!(!guard_len_ge(token, 30, list, 3));
            assert!(guard_index_in_bounds(token, 31, list, 1));
            assert!(!guard_index_in_bounds(token, 31, list, 2));
            assert!(!guard_index_in_bounds(token, 31, list, -1));
            crate::rc::dec_ref(token, list);
        });
        feedback::reset();
    }
}
