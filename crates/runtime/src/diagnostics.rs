//! Production Diagnostics
//!
//! Optional SIGQUIT handler (Unix, `diagnostics` feature): `kill -QUIT <pid>`
//! dumps runtime statistics to stderr without stopping the process. The dump
//! reads only lock-free counters and the feedback snapshot, so it is safe to
//! trigger while the runtime token is held elsewhere.

use crate::handle_table::HandleTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static INSTALLED: Once = Once::new();
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Install the SIGQUIT listener thread. Idempotent; called from
/// `molt_runtime_init` when the feature is enabled.
#[cfg(unix)]
pub fn install() {
    INSTALLED.call_once(|| {
        let mut signals = match signal_hook::iterator::Signals::new([signal_hook::consts::SIGQUIT])
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("molt: diagnostics handler unavailable: {}", e);
                return;
            }
        };
        std::thread::Builder::new()
            .name("molt-diagnostics".into())
            .spawn(move || {
                for _ in signals.forever() {
                    DUMP_REQUESTED.store(true, Ordering::Release);
                    dump_to_stderr();
                }
            })
            .ok();
    });
}

#[cfg(not(unix))]
pub fn install() {}

/// Render the statistics dump.
pub fn render() -> String {
    use std::fmt::Write;
    let table = HandleTable::global();
    let mut out = String::new();
    let _ = writeln!(out, "==== molt runtime diagnostics ====");
    let _ = writeln!(
        out,
        "handle table: live={} allocated={} freed={} retired={}",
        table.live_count.load(Ordering::Relaxed),
        table.total_allocated.load(Ordering::Relaxed),
        table.total_freed.load(Ordering::Relaxed),
        table.retired_slots.load(Ordering::Relaxed),
    );
    let _ = writeln!(out, "active borrows: {}", crate::rc::active_borrows());
    let feedback = crate::feedback::snapshot();
    let _ = writeln!(out, "guard sites with feedback: {}", feedback.len());
    for (site, reasons) in feedback.iter().take(16) {
        for (reason, count) in reasons {
            let _ = writeln!(out, "  site {} {} = {}", site, reason, count);
        }
    }
    let _ = writeln!(out, "==================================");
    out
}

fn dump_to_stderr() {
    eprintln!("{}", render());
}

/// True once a dump has been requested (test observability).
pub fn dump_was_requested() -> bool {
    DUMP_REQUESTED.load(Ordering::Acquire)
}
