//! Environment handling for build subprocesses.
//!
//! The environment handed to a build is assembled by plain concatenation, in
//! a fixed order, without deduplication:
//!
//! 1. the ambient process environment snapshot
//! 2. caller-supplied overrides
//! 3. flags computed by the backend (e.g. `DOCKER_BUILDKIT=1`)
//!
//! When the same key appears more than once, the subprocess sees the last
//! assignment. Callers rely on that ordering, so it must not be "fixed" by
//! collapsing duplicates here.

use std::collections::HashMap;

use crate::consts::BUILDKIT_ENV;

/// Supplies the ambient environment as ordered `KEY=VALUE` entries.
pub trait EnvironmentSource: Send + Sync {
  fn environ(&self) -> Vec<String>;
}

/// The environment of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl EnvironmentSource for ProcessEnvironment {
  fn environ(&self) -> Vec<String> {
    std::env::vars_os()
      .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
      .collect()
  }
}

/// A fixed environment.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment(pub Vec<String>);

impl StaticEnvironment {
  pub fn new<I, S>(entries: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(entries.into_iter().map(Into::into).collect())
  }
}

impl EnvironmentSource for StaticEnvironment {
  fn environ(&self) -> Vec<String> {
    self.0.clone()
  }
}

/// Flags a local docker build adds to the environment.
pub fn backend_flags(use_buildkit: bool) -> Vec<String> {
  if use_buildkit {
    vec![format!("{BUILDKIT_ENV}=1")]
  } else {
    Vec::new()
  }
}

/// Concatenate ambient, override and backend entries, in that order.
pub fn merge_env(ambient: Vec<String>, overrides: &[String], backend: &[String]) -> Vec<String> {
  let mut env = ambient;
  env.reserve(overrides.len() + backend.len());
  env.extend(overrides.iter().cloned());
  env.extend(backend.iter().cloned());
  env
}

/// Split a `KEY=VALUE` entry. Entries without `=` are a key with an empty value.
pub fn split_entry(entry: &str) -> (&str, &str) {
  entry.split_once('=').unwrap_or((entry, ""))
}

/// Collapse an entry list into a map with last-assignment-wins semantics.
///
/// This is how a subprocess observes the merged list; it is used for
/// placeholder lookups, never to rewrite the list itself.
pub fn effective_env(entries: &[String]) -> HashMap<String, String> {
  entries
    .iter()
    .map(|entry| {
      let (k, v) = split_entry(entry);
      (k.to_string(), v.to_string())
    })
    .collect()
}
