//! Run-scoped record of resolved artifact tags.
//!
//! Every run owns exactly one [`ArtifactResolver`]. The scheduler records an
//! artifact's tag once its build succeeds; in-flight builds of dependent
//! artifacts read from it while evaluating their build arguments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

/// Errors raised by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
  /// Each artifact is built once per run, so a second record is a bug.
  #[error("artifact {name} already resolved to {existing}, refusing to record {attempted}")]
  AlreadyRecorded {
    name: String,
    existing: String,
    attempted: String,
  },
}

/// Read access to resolved tags.
pub trait TagLookup {
  /// Return the tag recorded for `name`, if any.
  fn lookup(&self, name: &str) -> Option<String>;
}

/// Write-once map from artifact name to resolved tag.
#[derive(Debug, Default)]
pub struct ArtifactResolver {
  tags: RwLock<HashMap<String, String>>,
}

impl ArtifactResolver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a resolver seeded with tags of images built outside this run.
  pub fn with_prebuilt<I, K, V>(prebuilt: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let tags = prebuilt.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
    Self {
      tags: RwLock::new(tags),
    }
  }

  /// Look up the tag of an artifact.
  pub fn resolve(&self, name: &str) -> Option<String> {
    self
      .tags
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
  }

  /// Record the tag of a freshly built artifact.
  ///
  /// # Errors
  ///
  /// Returns [`ResolverError::AlreadyRecorded`] if `name` already has a tag.
  /// The existing entry is left untouched.
  pub fn record(&self, name: &str, tag: &str) -> Result<(), ResolverError> {
    let mut tags = self.tags.write().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = tags.get(name) {
      return Err(ResolverError::AlreadyRecorded {
        name: name.to_string(),
        existing: existing.clone(),
        attempted: tag.to_string(),
      });
    }

    debug!(artifact = %name, tag = %tag, "recorded artifact tag");
    tags.insert(name.to_string(), tag.to_string());
    Ok(())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.tags.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
  }

  /// Snapshot of every recorded tag, sorted by artifact name.
  pub fn tags(&self) -> BTreeMap<String, String> {
    self
      .tags
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.tags.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl TagLookup for ArtifactResolver {
  fn lookup(&self, name: &str) -> Option<String> {
    self.resolve(name)
  }
}

impl TagLookup for HashMap<String, String> {
  fn lookup(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}

impl TagLookup for BTreeMap<String, String> {
  fn lookup(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}
