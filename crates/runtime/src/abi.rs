//! Runtime ABI
//!
//! The stable C-symbol surface imported by every backend-emitted module:
//! allocation, reference counting, handle resolution, boxing, streams, and
//! error accessors. Emitted code never holds the runtime token across an ABI
//! call; each entry point acquires it internally, which keeps the token
//! discipline inside the runtime.
//!
//! Pointer-lifetime warning on the error accessors: the returned C string is
//! valid only until the next error-accessor call on the same thread. Callers
//! copy immediately.

use crate::exceptions;
use crate::gil::with_gil;
use crate::handle_table::HandleTable;
use crate::object::{self, Payload, HEADER_SIZE};
use molt_core::{CapabilitySet, Value};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

thread_local! {
    /// Cached C string backing the last error pointer handed out.
    static ERROR_CSTRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Object header size in bytes; emitted code computes payload offsets from it.
#[unsafe(no_mangle)]
pub extern "C" fn molt_header_size() -> u32 {
    HEADER_SIZE as u32
}

/// Initialize the runtime: build and verify the intrinsic dispatch table and
/// install the process capability set (comma-separated grant list, may be
/// null for the empty set). Returns false when the capability string is
/// malformed.
///
/// # Safety
/// `caps` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn molt_runtime_init(caps: *const c_char) -> bool {
    let parsed = if caps.is_null() {
        CapabilitySet::empty()
    } else {
        let text = unsafe { CStr::from_ptr(caps) }.to_string_lossy();
        match CapabilitySet::parse(&text) {
            Ok(set) => set,
            Err(_) => return false,
        }
    };
    crate::intrinsics::ensure_initialized();
    #[cfg(feature = "diagnostics")]
    crate::diagnostics::install();
    with_gil(|token| token.caps = parsed);
    true
}

/// Allocate an empty object of a builtin kind. Returns the handle value
/// bits, or 0 for an unknown type id.
#[unsafe(no_mangle)]
pub extern "C" fn molt_alloc(type_id: u32) -> u64 {
    let payload = match type_id {
        object::TYPE_LIST => Payload::List(Vec::new()),
        object::TYPE_STR => Payload::Str(String::new()),
        object::TYPE_BYTES => Payload::Bytes(Vec::new()),
        object::TYPE_BYTEARRAY => Payload::ByteArray(Vec::new()),
        object::TYPE_DICT => Payload::Dict(crate::containers::OrderedDict::new()),
        object::TYPE_SET => Payload::Set(crate::containers::OrderedSet::new()),
        _ => return 0,
    };
    with_gil(|token| HandleTable::global().alloc(token, payload, 0)).to_bits()
}

/// Increment the strong count of a handle word. No-op for scalars.
#[unsafe(no_mangle)]
pub extern "C" fn molt_inc_ref(bits: u64) {
    // Safety: ABI callers only pass value words produced by this runtime.
    crate::rc::inc_ref(unsafe { Value::from_bits(bits) });
}

/// Decrement the strong count of a handle word; reclaims on zero.
#[unsafe(no_mangle)]
pub extern "C" fn molt_dec_ref(bits: u64) {
    let v = unsafe { Value::from_bits(bits) };
    if !v.is_handle() {
        return;
    }
    with_gil(|token| crate::rc::dec_ref(token, v));
}

/// Resolve a handle word. Returns the live object's type id, or 0 when the
/// handle is stale or not a handle (the documented None-sentinel contract).
#[unsafe(no_mangle)]
pub extern "C" fn molt_handle_resolve(bits: u64) -> u32 {
    let v = unsafe { Value::from_bits(bits) };
    HandleTable::global().slot_type_id(v).unwrap_or(0)
}

/// Box an integer, promoting to a heap BigInt outside the inline range.
#[unsafe(no_mangle)]
pub extern "C" fn molt_box_int(n: i64) -> u64 {
    match Value::try_from_int(n) {
        Some(v) => v.to_bits(),
        None => with_gil(|token| crate::intrinsics::box_int(token, n)).to_bits(),
    }
}

/// Box a float (canonicalizing hostile NaNs).
#[unsafe(no_mangle)]
pub extern "C" fn molt_box_float(f: f64) -> u64 {
    Value::from_float(f).to_bits()
}

/// Unbox an integer: inline ints directly, BigInt handles when they fit.
/// Sets the thread error and returns 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn molt_unbox_int(bits: u64) -> i64 {
    let v = unsafe { Value::from_bits(bits) };
    if v.is_int() {
        return v.as_int();
    }
    if v.is_handle() {
        let narrowed = with_gil(|token| {
            HandleTable::global().resolve(v).and_then(|obj| {
                if let Payload::BigInt(b) = obj.payload(token) {
                    b.to_i64()
                } else {
                    None
                }
            })
        });
        if let Some(n) = narrowed {
            return n;
        }
    }
    exceptions::raise(exceptions::ExceptionData::type_error(
        "value is not an integer",
    ));
    0
}

/// Unbox a float. Sets the thread error and returns NaN for non-floats.
#[unsafe(no_mangle)]
pub extern "C" fn molt_unbox_float(bits: u64) -> f64 {
    let v = unsafe { Value::from_bits(bits) };
    if v.is_float() {
        return v.as_float();
    }
    exceptions::raise(exceptions::ExceptionData::type_error(
        "value is not a float",
    ));
    f64::NAN
}

/// The canonical None bits (emitted code embeds this constant).
#[unsafe(no_mangle)]
pub extern "C" fn molt_none_value() -> u64 {
    Value::NONE.to_bits()
}

/// The reserved pending marker bits.
#[unsafe(no_mangle)]
pub extern "C" fn molt_pending_value() -> u64 {
    Value::PENDING.to_bits()
}

/// Write bytes to a host stream (1 = stdout, 2 = stderr). Returns bytes
/// written, or -1 with the thread error set.
///
/// # Safety
/// `ptr` must reference `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn molt_stream_send(stream: i32, ptr: *const u8, len: usize) -> i64 {
    use std::io::Write;
    if ptr.is_null() {
        exceptions::raise(exceptions::ExceptionData::value_error("null stream buffer"));
        return -1;
    }
    let data = unsafe { std::slice::from_raw_parts(ptr, len) };
    let written = match stream {
        1 => std::io::stdout().write(data),
        2 => std::io::stderr().write(data),
        other => {
            exceptions::raise(exceptions::ExceptionData::value_error(format!(
                "unknown stream id {}",
                other
            )));
            return -1;
        }
    };
    match written {
        Ok(n) => n as i64,
        Err(e) => {
            exceptions::raise(exceptions::ExceptionData::value_error(format!(
                "stream write: {}",
                e
            )));
            -1
        }
    }
}

/// Close a host stream. Standard streams close with the process.
#[unsafe(no_mangle)]
pub extern "C" fn molt_stream_close(_stream: i32) {}

/// Run one cycle-collection pass; returns the number of objects reclaimed.
#[unsafe(no_mangle)]
pub extern "C" fn molt_collect_cycles() -> u64 {
    with_gil(|token| crate::cycle::collect_cycles(token)) as u64
}

/// Write the per-run guard feedback artifact. Returns false on I/O failure
/// or a malformed path.
///
/// # Safety
/// `path` must be a valid NUL-terminated string.
#[cfg(feature = "feedback-json")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn molt_write_feedback(path: *const c_char) -> bool {
    if path.is_null() {
        return false;
    }
    let Ok(path) = unsafe { CStr::from_ptr(path) }.to_str() else {
        return false;
    };
    crate::feedback::write_feedback_file(std::path::Path::new(path)).is_ok()
}

// =============================================================================
// Error accessors
// =============================================================================

/// True while an exception is propagating on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn molt_has_error() -> bool {
    exceptions::has_pending()
}

/// The active exception's rendered form, or null. See the module note on
/// pointer lifetime.
#[unsafe(no_mangle)]
pub extern "C" fn molt_get_error() -> *const c_char {
    match exceptions::last() {
        Some(exc) => cache_error_string(exc.to_string()),
        None => ptr::null(),
    }
}

/// Take (and clear) the active exception, returning its rendered form.
#[unsafe(no_mangle)]
pub extern "C" fn molt_take_error() -> *const c_char {
    match exceptions::take_current() {
        Some(exc) => cache_error_string(exc.to_string()),
        None => ptr::null(),
    }
}

/// Clear any active exception.
#[unsafe(no_mangle)]
pub extern "C" fn molt_clear_error() {
    exceptions::clear();
    ERROR_CSTRING.with(|c| *c.borrow_mut() = None);
}

fn cache_error_string(msg: String) -> *const c_char {
    // Replace interior NULs rather than truncate the message.
    let safe: String = msg.chars().map(|c| if c == '\0' { '?' } else { c }).collect();
    let cstring = CString::new(safe).expect("nul bytes replaced");
    ERROR_CSTRING.with(|cell| {
        let ptr = cstring.as_ptr();
        *cell.borrow_mut() = Some(cstring);
        ptr
    })
}
