//! Compile-time error types.
//!
//! Every compile-time failure aborts compilation with a cited location.
//! There is no silent fallback path: an unsupported construct, a missing
//! intrinsic, a capability mismatch, or manifest drift all surface here.

use std::path::PathBuf;

/// A cited source location (function plus line marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    pub line: u32,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.function, self.line)
    }
}

/// Error type for compilation.
#[derive(Debug)]
pub enum CompileError {
    /// A construct the compiler does not support, with its location.
    Unsupported { what: String, at: Location },
    /// Lowering referenced an intrinsic absent from the manifest.
    MissingIntrinsic { name: String, at: Location },
    /// A bridge call requires a capability the build does not grant.
    CapabilityMismatch { name: String, capability: String },
    /// The intrinsics manifest disagrees with the toolchain.
    ManifestDrift(String),
    /// The IR verifier rejected a function.
    Verifier { function: String, message: String },
    /// An input artifact failed to load or parse.
    Artifact { path: PathBuf, message: String },
    /// A logical error in code generation.
    Codegen(String),
    /// A formatting error while writing an artifact.
    Format(std::fmt::Error),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Unsupported { what, at } => {
                write!(f, "{}: unsupported construct: {}", at, what)
            }
            CompileError::MissingIntrinsic { name, at } => {
                write!(f, "{}: missing intrinsic '{}'", at, name)
            }
            CompileError::CapabilityMismatch { name, capability } => {
                write!(
                    f,
                    "bridge call '{}' requires capability '{}' which this build does not grant",
                    name, capability
                )
            }
            CompileError::ManifestDrift(msg) => {
                write!(f, "intrinsics manifest drift: {}", msg)
            }
            CompileError::Verifier { function, message } => {
                write!(f, "verifier rejected '{}': {}", function, message)
            }
            CompileError::Artifact { path, message } => {
                write!(f, "failed to load '{}': {}", path.display(), message)
            }
            CompileError::Codegen(msg) => write!(f, "{}", msg),
            CompileError::Format(e) => write!(f, "artifact generation error: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<String> for CompileError {
    fn from(s: String) -> Self {
        CompileError::Codegen(s)
    }
}

impl From<std::fmt::Error> for CompileError {
    fn from(e: std::fmt::Error) -> Self {
        CompileError::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_cites_location() {
        let err = CompileError::Unsupported {
            what: "metaclass".into(),
            at: Location {
                function: "make_model".into(),
                line: 12,
            },
        };
        assert_eq!(
            err.to_string(),
            "make_model:12: unsupported construct: metaclass"
        );
    }

    #[test]
    fn test_from_string() {
        let err: CompileError = "boom".to_string().into();
        assert_eq!(err.to_string(), "boom");
    }
}
