//! Tag selection for artifacts.
//!
//! The scheduler asks a [`Tagger`] for the tag each artifact should be
//! built under before dispatching it.

use crate::artifact::Artifact;

/// Chooses the tag an artifact is built under.
pub trait Tagger: Send + Sync {
  fn tag(&self, artifact: &Artifact) -> String;
}

/// Tags every artifact as `<image_name>:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedTagger {
  tag: String,
}

impl FixedTagger {
  pub fn new(tag: impl Into<String>) -> Self {
    Self { tag: tag.into() }
  }
}

impl Default for FixedTagger {
  fn default() -> Self {
    Self::new("latest")
  }
}

impl Tagger for FixedTagger {
  fn tag(&self, artifact: &Artifact) -> String {
    format!("{}:{}", artifact.image_name, self.tag)
  }
}
