//! Molt Core
//!
//! Shared foundation for the Molt toolchain: the NaN-boxed value encoding,
//! the versioned intrinsics manifest, effect classes, and the process
//! capability set. Both the compiler and the runtime depend on this crate at
//! an exact pinned version so that value encodings and manifests can never
//! drift between the code a backend emits and the runtime it links against.

pub mod capability;
pub mod effect;
pub mod intrinsics;
pub mod nanbox;

pub use capability::{Capability, CapabilitySet};
pub use effect::{ClassId, EffectClass};
pub use intrinsics::{IntrinsicDef, IntrinsicsManifest, ValueKind, MANIFEST_VERSION};
pub use nanbox::{
    Handle, SmallStr, Value, ValueTag, CANONICAL_NAN, MAX_GENERATION, MAX_INDEX, MAX_INLINE_INT,
    MIN_INLINE_INT, SMALL_STR_MAX_LEN,
};
