//! Runtime Intrinsic Dispatch
//!
//! The dispatch table is generated from the canonical manifest in
//! `molt-core`: table index == manifest index, so the compiler's lowering
//! tables and this table can never disagree on numbering. Initialization
//! verifies that every manifest entry has an implementation; drift between
//! manifest and runtime aborts the process before any user code runs.
//!
//! A missing intrinsic at dispatch time is `MissingIntrinsic` and fatal,
//! never a silent fallback. Capability-gated intrinsics consult the process
//! capability set before executing; the host-bridge entries (filesystem,
//! network, process) are deny-by-default stubs that a host adapter replaces
//! at startup.

use crate::exceptions::ExceptionData;
use crate::gil::PyToken;
use crate::handle_table::HandleTable;
use crate::object::{dict_key, Payload};
use crate::scheduler::{decode_resume, encode_resume, PollCx, STATE_DONE};
use molt_core::{IntrinsicsManifest, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::OnceLock;

/// Signature of every intrinsic implementation.
pub type IntrinsicFn = fn(&mut PyToken<'_>, &[Value]) -> Result<Value, ExceptionData>;

struct Table {
    fns: Vec<IntrinsicFn>,
    by_name: HashMap<&'static str, usize>,
}

static TABLE: OnceLock<Table> = OnceLock::new();

/// Build and verify the dispatch table. Idempotent; called from
/// `with_gil_entry` and from tests.
///
/// # Panics
/// Panics when the manifest declares an intrinsic this runtime does not
/// implement (manifest drift is a build error surfaced at init).
pub fn ensure_initialized() {
    TABLE.get_or_init(|| {
        let manifest = IntrinsicsManifest::canonical();
        let mut fns = Vec::with_capacity(manifest.len());
        let mut by_name = HashMap::new();
        for (idx, def) in manifest.intrinsics.iter().enumerate() {
            let Some(f) = builtin_impl(&def.name) else {
                panic!(
                    "intrinsics manifest drift: '{}' declared but not implemented",
                    def.name
                );
            };
            // The manifest is immortal; leak one copy of the name for the key.
            let name: &'static str = def.name.clone().leak();
            by_name.insert(name, idx);
            fns.push(f);
        }
        Table { fns, by_name }
    });
}

/// Check that the manifest and this runtime agree. Used by the compiler's
/// `check` command through the ABI and by tests.
pub fn verify_manifest() -> Result<(), String> {
    let manifest = IntrinsicsManifest::canonical();
    let mut missing = Vec::new();
    for def in &manifest.intrinsics {
        if builtin_impl(&def.name).is_none() {
            missing.push(def.name.clone());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("unimplemented intrinsics: {}", missing.join(", ")))
    }
}

/// Dispatch by manifest index (the form emitted code uses).
pub fn dispatch(
    token: &mut PyToken<'_>,
    index: usize,
    args: &[Value],
) -> Result<Value, ExceptionData> {
    ensure_initialized();
    let table = TABLE.get().expect("dispatch table initialized");
    let Some(&f) = table.fns.get(index) else {
        panic!(
            "{}",
            crate::exceptions::RuntimeFault::MissingIntrinsic(format!("index {}", index))
        );
    };
    let manifest = IntrinsicsManifest::canonical();
    if let Some(required) = manifest.intrinsics[index].capability
        && !token.caps.contains(required)
    {
        return Err(ExceptionData::bridge_unavailable(
            &manifest.intrinsics[index].name,
        ));
    }
    f(token, args)
}

/// Dispatch by name (shim surface and tests).
pub fn dispatch_by_name(
    token: &mut PyToken<'_>,
    name: &str,
    args: &[Value],
) -> Result<Value, ExceptionData> {
    ensure_initialized();
    let table = TABLE.get().expect("dispatch table initialized");
    let Some(&idx) = table.by_name.get(name) else {
        panic!(
            "{}",
            crate::exceptions::RuntimeFault::MissingIntrinsic(name.to_string())
        );
    };
    dispatch(token, idx, args)
}

// =============================================================================
// Value helpers
// =============================================================================

/// Materialize any value as display text.
pub fn value_to_string(token: &PyToken<'_>, v: Value) -> Result<String, ExceptionData> {
    if v.is_float() {
        return Ok(format_float(v.as_float()));
    }
    if v.is_int() {
        return Ok(v.as_int().to_string());
    }
    if v.is_bool() {
        return Ok(if v.as_bool() { "True" } else { "False" }.into());
    }
    if v.is_none() {
        return Ok("None".into());
    }
    if v.is_small_str() {
        return Ok(v.as_small_str().as_str().to_string());
    }
    if v.is_handle() {
        let table = HandleTable::global();
        let Some(obj) = table.resolve(v) else {
            return Err(ExceptionData::value_error("stale reference"));
        };
        let text = match obj.payload(token) {
            Payload::Str(s) => s.clone(),
            Payload::BigInt(b) => b.to_string(),
            Payload::Float(f) => format_float(*f),
            Payload::Bytes(b) | Payload::ByteArray(b) => format!("{} bytes", b.len()),
            Payload::List(items) => format!("[{} items]", items.len()),
            Payload::Dict(d) => format!("{{{} entries}}", d.len()),
            Payload::Set(s) => format!("{{{} members}}", s.len()),
            other => format!("<object type_id={}>", other.type_id()),
        };
        return Ok(text);
    }
    Err(ExceptionData::type_error("value has no text form"))
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Extract string content from a small string or a heap string.
pub fn get_str(token: &PyToken<'_>, v: Value) -> Result<String, ExceptionData> {
    if v.is_small_str() {
        return Ok(v.as_small_str().as_str().to_string());
    }
    if v.is_handle() {
        let table = HandleTable::global();
        if let Some(obj) = table.resolve(v)
            && let Payload::Str(s) = obj.payload(token)
        {
            return Ok(s.clone());
        }
    }
    Err(ExceptionData::type_error("expected a str"))
}

/// Allocate a string value: inline when it fits, heap handle otherwise.
pub fn alloc_str(token: &mut PyToken<'_>, s: String) -> Value {
    match Value::try_from_str(&s) {
        Some(v) => v,
        None => HandleTable::global().alloc(token, Payload::Str(s), 0),
    }
}

/// Extract byte content from a bytes or bytearray object.
pub fn get_bytes(token: &PyToken<'_>, v: Value) -> Result<Vec<u8>, ExceptionData> {
    if v.is_handle() {
        let table = HandleTable::global();
        if let Some(obj) = table.resolve(v) {
            match obj.payload(token) {
                Payload::Bytes(b) | Payload::ByteArray(b) => return Ok(b.clone()),
                _ => {}
            }
        }
    }
    Err(ExceptionData::type_error("expected bytes"))
}

/// Allocate an immutable bytes object.
pub fn alloc_bytes(token: &mut PyToken<'_>, data: Vec<u8>) -> Value {
    HandleTable::global().alloc(token, Payload::Bytes(data), 0)
}

/// Byte offset of the first occurrence of a subslice. An empty needle
/// matches at offset 0.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Box an integer: inline when it fits, heap BigInt otherwise.
pub fn box_int(token: &mut PyToken<'_>, n: i64) -> Value {
    match Value::try_from_int(n) {
        Some(v) => v,
        None => HandleTable::global().alloc(
            token,
            Payload::BigInt(crate::bigint::BigInt::from_i64(n)),
            0,
        ),
    }
}

fn get_list_items(token: &PyToken<'_>, v: Value) -> Result<Vec<Value>, ExceptionData> {
    let table = HandleTable::global();
    let Some(obj) = table.resolve(v) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    match obj.payload(token) {
        Payload::List(items) => Ok(items.clone()),
        _ => Err(ExceptionData::type_error("expected a list")),
    }
}

fn char_index_of(haystack: &str, byte_idx: usize) -> i64 {
    haystack[..byte_idx].chars().count() as i64
}

// =============================================================================
// Implementations
// =============================================================================

/// Resolve an intrinsic name to its built-in implementation.
fn builtin_impl(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "console.print" => in_print,
        "str.find" => in_str_find,
        "str.split" => in_str_split,
        "str.replace" => in_str_replace,
        "str.format" => in_str_format,
        "str.startswith" => in_str_startswith,
        "str.endswith" => in_str_endswith,
        "str.count" => in_str_count,
        "str.join" => in_str_join,
        "str.capitalize" => in_str_capitalize,
        "str.strip" => in_str_strip,
        "str.from_obj" => in_str_from_obj,
        "bytes.from_str" => in_bytes_from_str,
        "bytes.find" => in_bytes_find,
        "bytes.split" => in_bytes_split,
        "bytes.replace" => in_bytes_replace,
        "bytes.startswith" => in_bytes_startswith,
        "bytes.endswith" => in_bytes_endswith,
        "bytes.count" => in_bytes_count,
        "bytes.join" => in_bytes_join,
        "bytes.capitalize" => in_bytes_capitalize,
        "bytes.strip" => in_bytes_strip,
        "bytearray.new" => in_bytearray_new,
        "bytearray.append" => in_bytearray_append,
        "list.append" => in_list_append,
        "list.pop" => in_list_pop,
        "list.extend" => in_list_extend,
        "dict.get" => in_dict_get,
        "dict.set" => in_dict_set,
        "dict.pop" => in_dict_pop,
        "dict.keys" => in_dict_keys,
        "set.add" => in_set_add,
        "set.discard" => in_set_discard,
        "iter.new" => in_iter_new,
        "iter.next" => in_iter_next,
        "math.abs" => in_math_abs,
        "math.floor" => in_math_floor,
        "math.ceil" => in_math_ceil,
        "chan.new" => in_chan_new,
        "chan.send" => in_chan_send,
        "chan.recv" => in_chan_recv,
        "chan.close" => in_chan_close,
        "cancel.check" => in_cancel_check,
        "stream.send" => in_stream_send,
        "stream.close" => in_stream_close,
        "env.get" => in_env_get,
        // Host bridges: deny-by-default stubs behind their capabilities; a
        // host adapter installs real implementations out of tree.
        "fs.read_file" => in_bridge_stub_fs_read,
        "fs.write_file" => in_bridge_stub_fs_write,
        "net.connect" => in_bridge_stub_net,
        "proc.spawn" => in_bridge_stub_proc,
        _ => return None,
    })
}

fn arg(args: &[Value], i: usize) -> Result<Value, ExceptionData> {
    args.get(i).copied().ok_or_else(|| {
        ExceptionData::type_error(format!("missing intrinsic argument {}", i))
    })
}

fn in_print(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let text = value_to_string(token, arg(args, 0)?)?;
    println!("{}", text);
    Ok(Value::NONE)
}

fn in_str_find(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let needle = get_str(token, arg(args, 1)?)?;
    match s.find(&needle) {
        Some(byte_idx) => Ok(Value::from_int(char_index_of(&s, byte_idx))),
        None => Ok(Value::from_int(-1)),
    }
}

fn in_str_split(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let sep = get_str(token, arg(args, 1)?)?;
    if sep.is_empty() {
        return Err(ExceptionData::value_error("empty separator"));
    }
    let parts: Vec<String> = s.split(&sep).map(str::to_string).collect();
    let items: Vec<Value> = parts
        .into_iter()
        .map(|p| alloc_str(token, p))
        .collect();
    Ok(HandleTable::global().alloc(token, Payload::List(items), 0))
}

fn in_str_replace(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let from = get_str(token, arg(args, 1)?)?;
    let to = get_str(token, arg(args, 2)?)?;
    if from.is_empty() {
        return Err(ExceptionData::value_error("empty pattern"));
    }
    Ok(alloc_str(token, s.replace(&from, &to)))
}

fn in_str_format(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let template = get_str(token, arg(args, 0)?)?;
    let values = get_list_items(token, arg(args, 1)?)?;
    let mut out = String::with_capacity(template.len());
    let mut next = 0usize;
    let mut rest = template.as_str();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        let Some(&v) = values.get(next) else {
            return Err(ExceptionData::index_error(
                "not enough values for format placeholders",
            ));
        };
        out.push_str(&value_to_string(token, v)?);
        next += 1;
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    Ok(alloc_str(token, out))
}

fn in_str_startswith(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let prefix = get_str(token, arg(args, 1)?)?;
    Ok(Value::from_bool(s.starts_with(&prefix)))
}

fn in_str_endswith(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let suffix = get_str(token, arg(args, 1)?)?;
    Ok(Value::from_bool(s.ends_with(&suffix)))
}

fn in_str_count(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let needle = get_str(token, arg(args, 1)?)?;
    if needle.is_empty() {
        // Count of the empty string is len + 1, by convention.
        return Ok(Value::from_int(s.chars().count() as i64 + 1));
    }
    Ok(Value::from_int(s.matches(&needle).count() as i64))
}

fn in_str_join(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let sep = get_str(token, arg(args, 0)?)?;
    let items = get_list_items(token, arg(args, 1)?)?;
    let mut parts = Vec::with_capacity(items.len());
    for v in items {
        parts.push(get_str(token, v)?);
    }
    Ok(alloc_str(token, parts.join(&sep)))
}

fn in_str_capitalize(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    };
    Ok(alloc_str(token, out))
}

fn in_str_strip(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    Ok(alloc_str(token, s.trim().to_string()))
}

fn in_str_from_obj(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let text = value_to_string(token, arg(args, 0)?)?;
    Ok(alloc_str(token, text))
}

fn in_bytes_from_str(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = get_str(token, arg(args, 0)?)?;
    Ok(alloc_bytes(token, s.into_bytes()))
}

fn in_bytes_find(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let needle = get_bytes(token, arg(args, 1)?)?;
    match find_subslice(&data, &needle) {
        Some(offset) => Ok(Value::from_int(offset as i64)),
        None => Ok(Value::from_int(-1)),
    }
}

fn in_bytes_split(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let sep = get_bytes(token, arg(args, 1)?)?;
    if sep.is_empty() {
        return Err(ExceptionData::value_error("empty separator"));
    }
    let mut parts: Vec<Vec<u8>> = Vec::new();
    let mut rest = &data[..];
    while let Some(pos) = find_subslice(rest, &sep) {
        parts.push(rest[..pos].to_vec());
        rest = &rest[pos + sep.len()..];
    }
    parts.push(rest.to_vec());
    let items: Vec<Value> = parts
        .into_iter()
        .map(|p| alloc_bytes(token, p))
        .collect();
    Ok(HandleTable::global().alloc(token, Payload::List(items), 0))
}

fn in_bytes_replace(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let from = get_bytes(token, arg(args, 1)?)?;
    let to = get_bytes(token, arg(args, 2)?)?;
    if from.is_empty() {
        return Err(ExceptionData::value_error("empty pattern"));
    }
    let mut out = Vec::with_capacity(data.len());
    let mut rest = &data[..];
    while let Some(pos) = find_subslice(rest, &from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(&to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    Ok(alloc_bytes(token, out))
}

fn in_bytes_startswith(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let prefix = get_bytes(token, arg(args, 1)?)?;
    Ok(Value::from_bool(data.starts_with(&prefix)))
}

fn in_bytes_endswith(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let suffix = get_bytes(token, arg(args, 1)?)?;
    Ok(Value::from_bool(data.ends_with(&suffix)))
}

fn in_bytes_count(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let needle = get_bytes(token, arg(args, 1)?)?;
    if needle.is_empty() {
        // Count of the empty slice is len + 1, matching the str convention.
        return Ok(Value::from_int(data.len() as i64 + 1));
    }
    let mut count: i64 = 0;
    let mut rest = &data[..];
    while let Some(pos) = find_subslice(rest, &needle) {
        count += 1;
        rest = &rest[pos + needle.len()..];
    }
    Ok(Value::from_int(count))
}

fn in_bytes_join(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let sep = get_bytes(token, arg(args, 0)?)?;
    let items = get_list_items(token, arg(args, 1)?)?;
    let mut out: Vec<u8> = Vec::new();
    for (i, v) in items.into_iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&get_bytes(token, v)?);
    }
    Ok(alloc_bytes(token, out))
}

fn in_bytes_capitalize(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let mut data = get_bytes(token, arg(args, 0)?)?;
    // ASCII semantics: uppercase the first byte, lowercase the rest.
    if let Some((first, rest)) = data.split_first_mut() {
        first.make_ascii_uppercase();
        rest.make_ascii_lowercase();
    }
    Ok(alloc_bytes(token, data))
}

fn in_bytes_strip(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    Ok(alloc_bytes(token, data[start..end].to_vec()))
}

fn in_bytearray_new(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let data = get_bytes(token, arg(args, 0)?)?;
    Ok(HandleTable::global().alloc(token, Payload::ByteArray(data), 0))
}

fn in_bytearray_append(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let array = arg(args, 0)?;
    let byte = arg(args, 1)?;
    if !byte.is_int() {
        return Err(ExceptionData::type_error("expected an int"));
    }
    let n = byte.as_int();
    if !(0..=255).contains(&n) {
        return Err(ExceptionData::value_error("byte must be in range(0, 256)"));
    }
    let table = HandleTable::global();
    let Some(obj) = table.resolve(array) else {
        return Err(ExceptionData::type_error("expected a bytearray"));
    };
    // Only the mutable variant accepts writes; immutable bytes do not.
    let Payload::ByteArray(data) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a bytearray"));
    };
    data.push(n as u8);
    Ok(Value::NONE)
}

fn in_list_append(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let list = arg(args, 0)?;
    let value = arg(args, 1)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(list) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    let Payload::List(items) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    // Ownership of the stored value transfers to the list.
    items.push(value);
    Ok(Value::NONE)
}

fn in_list_pop(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let list = arg(args, 0)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(list) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    let Payload::List(items) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    items
        .pop()
        .ok_or_else(|| ExceptionData::index_error("pop from empty list"))
}

fn in_list_extend(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let dst = arg(args, 0)?;
    let src_items = get_list_items(token, arg(args, 1)?)?;
    for &v in &src_items {
        crate::rc::inc_ref(v);
    }
    let table = HandleTable::global();
    let Some(obj) = table.resolve(dst) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    let Payload::List(items) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a list"));
    };
    items.extend(src_items);
    Ok(Value::NONE)
}

fn in_dict_get(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let d = arg(args, 0)?;
    let key = arg(args, 1)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(d) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    let Payload::Dict(map) = obj.payload(token) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    let found = map.get(dict_key(key)).unwrap_or(Value::NONE);
    drop(obj);
    // Reads hand out a fresh reference.
    crate::rc::inc_ref(found);
    Ok(found)
}

fn in_dict_set(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let d = arg(args, 0)?;
    let key = arg(args, 1)?;
    let value = arg(args, 2)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(d) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    let Payload::Dict(map) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    let old = map.insert(dict_key(key), value);
    drop(obj);
    // Ownership of key and value transferred in; the displaced value is out.
    if let Some(old) = old {
        crate::rc::dec_ref(token, old);
    }
    Ok(Value::NONE)
}

fn in_dict_pop(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let d = arg(args, 0)?;
    let key = arg(args, 1)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(d) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    let Payload::Dict(map) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a dict"));
    };
    match map.remove(dict_key(key)) {
        Some(v) => {
            drop(obj);
            // The key's reference dies with the entry.
            if key.is_handle() {
                crate::rc::dec_ref(token, key);
            }
            Ok(v)
        }
        None => Err(ExceptionData::key_error(format!(
            "{:?}",
            value_to_string(token, key).unwrap_or_else(|_| "<key>".into())
        ))),
    }
}

fn in_dict_keys(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let d = arg(args, 0)?;
    let table = HandleTable::global();
    let keys: Vec<Value> = {
        let Some(obj) = table.resolve(d) else {
            return Err(ExceptionData::type_error("expected a dict"));
        };
        let Payload::Dict(map) = obj.payload(token) else {
            return Err(ExceptionData::type_error("expected a dict"));
        };
        map.keys().map(|k| k.to_value()).collect()
    };
    for &k in &keys {
        crate::rc::inc_ref(k);
    }
    Ok(table.alloc(token, Payload::List(keys), 0))
}

fn in_set_add(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = arg(args, 0)?;
    let member = arg(args, 1)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(s) else {
        return Err(ExceptionData::type_error("expected a set"));
    };
    let Payload::Set(set) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a set"));
    };
    let inserted = set.insert(dict_key(member));
    drop(obj);
    if !inserted && member.is_handle() {
        // Already present: the caller's transferred reference is surplus.
        crate::rc::dec_ref(token, member);
    }
    Ok(Value::NONE)
}

fn in_set_discard(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let s = arg(args, 0)?;
    let member = arg(args, 1)?;
    let table = HandleTable::global();
    let Some(obj) = table.resolve(s) else {
        return Err(ExceptionData::type_error("expected a set"));
    };
    let Payload::Set(set) = obj.payload_mut(token) else {
        return Err(ExceptionData::type_error("expected a set"));
    };
    let removed = set.discard(dict_key(member));
    drop(obj);
    if removed && member.is_handle() {
        crate::rc::dec_ref(token, member);
    }
    Ok(Value::NONE)
}

fn in_iter_new(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let subject = arg(args, 0)?;
    let table = HandleTable::global();
    let items: Vec<Value> = {
        let Some(obj) = table.resolve(subject) else {
            return Err(ExceptionData::type_error("object is not iterable"));
        };
        match obj.payload(token) {
            Payload::List(items) => items.clone(),
            Payload::Dict(d) => d.keys().map(|k| k.to_value()).collect(),
            Payload::Set(s) => s.iter().map(|k| k.to_value()).collect(),
            _ => return Err(ExceptionData::type_error("object is not iterable")),
        }
    };
    for &v in &items {
        crate::rc::inc_ref(v);
    }
    // The iterator is a generator yielding the snapshot in order.
    let mut queue: std::collections::VecDeque<Value> = items.into();
    let coro = move |cx: &mut PollCx<'_, '_>| match queue.pop_front() {
        Some(v) => {
            cx.frame.state = encode_resume(decode_resume(cx.frame.state).map_or(0, |i| i + 1));
            Ok(v)
        }
        None => {
            cx.frame.state = STATE_DONE;
            Ok(Value::NONE)
        }
    };
    Ok(crate::scheduler::gen_new(token, Box::new(coro)))
}

fn in_iter_next(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let it = arg(args, 0)?;
    crate::scheduler::gen_send(token, it, Value::NONE)
}

fn in_math_abs(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let v = arg(args, 0)?;
    if v.is_float() {
        return Ok(Value::from_float(v.as_float().abs()));
    }
    if v.is_int() {
        return Ok(box_int(token, v.as_int().abs()));
    }
    if v.is_handle() {
        let table = HandleTable::global();
        if let Some(obj) = table.resolve(v)
            && let Payload::BigInt(b) = obj.payload(token)
        {
            let abs = if b.is_negative() { b.neg() } else { b.clone() };
            drop(obj);
            return Ok(table.alloc(token, Payload::BigInt(abs), 0));
        }
    }
    Err(ExceptionData::type_error("bad operand type for abs()"))
}

fn in_math_floor(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let v = arg(args, 0)?;
    if !v.is_float() {
        return Err(ExceptionData::type_error("expected a float"));
    }
    Ok(box_int(token, v.as_float().floor() as i64))
}

fn in_math_ceil(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let v = arg(args, 0)?;
    if !v.is_float() {
        return Err(ExceptionData::type_error("expected a float"));
    }
    Ok(box_int(token, v.as_float().ceil() as i64))
}

fn in_chan_new(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let cap = arg(args, 0)?;
    if !cap.is_int() {
        return Err(ExceptionData::type_error("channel capacity must be an int"));
    }
    let capacity = match cap.as_int() {
        n if n <= 0 => None, // unbounded
        n => Some(n as usize),
    };
    crate::channel::chan_new(token, capacity).map_err(ExceptionData::value_error)
}

/// Synchronous shim form of channel send: true when queued, false when the
/// channel was full. Compiled coroutines use the `ChanSendYield` suspension
/// op instead.
fn in_chan_send(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    use crate::channel::SendResult;
    let chan = arg(args, 0)?;
    let value = arg(args, 1)?;
    match crate::channel::chan_send(token, chan, value, None) {
        SendResult::Sent => Ok(Value::TRUE),
        SendResult::Pending => Ok(Value::FALSE),
        SendResult::Closed => Err(ExceptionData::value_error("send on closed channel")),
    }
}

/// Synchronous shim form of channel receive; `PENDING` when empty.
fn in_chan_recv(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    use crate::channel::RecvResult;
    let chan = arg(args, 0)?;
    match crate::channel::chan_recv(token, chan, None) {
        RecvResult::Received(v) => Ok(v),
        RecvResult::Pending => Ok(Value::PENDING),
        RecvResult::Closed => Err(ExceptionData::stop_iteration(Value::NONE)),
    }
}

fn in_chan_close(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    crate::channel::chan_close(token, arg(args, 0)?);
    Ok(Value::NONE)
}

fn in_cancel_check(_token: &mut PyToken<'_>, _args: &[Value]) -> Result<Value, ExceptionData> {
    if let Some(cancel) = crate::scheduler::current_cancel_token() {
        cancel.check()?;
    }
    Ok(Value::NONE)
}

fn in_stream_send(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let stream = arg(args, 0)?;
    let data = arg(args, 1)?;
    if !stream.is_int() {
        return Err(ExceptionData::type_error("stream id must be an int"));
    }
    let bytes: Vec<u8> = {
        let table = HandleTable::global();
        let Some(obj) = table.resolve(data) else {
            return Err(ExceptionData::type_error("expected bytes"));
        };
        match obj.payload(token) {
            Payload::Bytes(b) | Payload::ByteArray(b) => b.clone(),
            Payload::Str(s) => s.clone().into_bytes(),
            _ => return Err(ExceptionData::type_error("expected bytes")),
        }
    };
    let written = match stream.as_int() {
        1 => std::io::stdout().write(&bytes),
        2 => std::io::stderr().write(&bytes),
        other => {
            return Err(ExceptionData::value_error(format!(
                "unknown stream id {}",
                other
            )))
        }
    };
    match written {
        Ok(n) => Ok(Value::from_int(n as i64)),
        Err(e) => Err(ExceptionData::value_error(format!("stream write: {}", e))),
    }
}

fn in_stream_close(_token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let stream = arg(args, 0)?;
    if !stream.is_int() {
        return Err(ExceptionData::type_error("stream id must be an int"));
    }
    // Standard streams close with the process; host streams are adapter-owned.
    Ok(Value::NONE)
}

fn in_env_get(token: &mut PyToken<'_>, args: &[Value]) -> Result<Value, ExceptionData> {
    let name = get_str(token, arg(args, 0)?)?;
    match std::env::var(&name) {
        Ok(v) => Ok(alloc_str(token, v)),
        Err(_) => Ok(Value::NONE),
    }
}

fn in_bridge_stub_fs_read(_: &mut PyToken<'_>, _: &[Value]) -> Result<Value, ExceptionData> {
    Err(ExceptionData::bridge_unavailable("fs.read_file"))
}

fn in_bridge_stub_fs_write(_: &mut PyToken<'_>, _: &[Value]) -> Result<Value, ExceptionData> {
    Err(ExceptionData::bridge_unavailable("fs.write_file"))
}

fn in_bridge_stub_net(_: &mut PyToken<'_>, _: &[Value]) -> Result<Value, ExceptionData> {
    Err(ExceptionData::bridge_unavailable("net.connect"))
}

fn in_bridge_stub_proc(_: &mut PyToken<'_>, _: &[Value]) -> Result<Value, ExceptionData> {
    Err(ExceptionData::bridge_unavailable("proc.spawn"))
}
