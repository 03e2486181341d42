//! Artifact declarations.
//!
//! An artifact is one container image the run has to produce. Each artifact
//! names a build mechanism ([`BuildKind`]) and may depend on other artifacts
//! of the same run, either explicitly through `requires` or implicitly by
//! referencing their tags from build arguments.

mod types;

pub use types::*;
