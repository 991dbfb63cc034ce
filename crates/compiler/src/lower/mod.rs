//! Lowering Stages
//!
//! Between the mid-end and the backend handoff:
//!
//! - `async_states` rewrites suspension points into cooperative poll state
//!   machines with encoded resume targets;
//! - `rc_insert` makes ownership transfer explicit as `IncRef`/`DecRef`
//!   instructions (the backend inserts nothing);
//! - `dispatch` assigns inline-cache site ids and validates intrinsic and
//!   bridge-call references against the manifest and the build's capability
//!   set.

pub mod async_states;
pub mod dispatch;
pub mod rc_insert;

pub use async_states::lower_async;
pub use dispatch::{assign_call_sites, check_calls};
