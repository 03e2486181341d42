//! Build-time argument evaluation.
//!
//! Turns an artifact's declared build arguments into the final mapping handed
//! to a backend. Arguments are layered, later layers overriding earlier ones:
//!
//! 1. run-mode defaults (debug mode keeps Go debug symbols)
//! 2. `requires` aliases, bound to the dependency's tag
//! 3. the artifact's declared `build_args`
//! 4. per-mode overlays from configuration
//!
//! Values are then substituted: `$${env:VAR}` from the environment snapshot
//! and `$${artifact:NAME}` from the run's resolved tags. A `None` value is
//! kept as `None` so the backend fills it from its own environment.
//!
//! Evaluation never writes to the resolver.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{Artifact, BuildKind};
use crate::consts::{DEBUG_GCFLAGS_ARG, DEBUG_GCFLAGS_VALUE};
use crate::placeholder::{self, PlaceholderError, Resolver};
use crate::resolver::TagLookup;
use crate::types::RunMode;

/// Evaluated build arguments, sorted by name.
pub type BuildArgs = BTreeMap<String, Option<String>>;

/// Errors raised while evaluating build arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
  /// A referenced artifact has no tag yet. The scheduler orders builds so
  /// this cannot happen for artifacts of the same run.
  #[error("artifact {artifact} references {reference}, which has no resolved tag")]
  UnresolvedReference { artifact: String, reference: String },

  #[error("build arg {arg} of artifact {artifact}: {source}")]
  Placeholder {
    artifact: String,
    arg: String,
    #[source]
    source: PlaceholderError,
  },
}

/// Build-arg overlays applied per run mode, on top of declared arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeOverlays(pub HashMap<RunMode, BuildArgs>);

impl ModeOverlays {
  pub fn for_mode(&self, mode: RunMode) -> Option<&BuildArgs> {
    self.0.get(&mode)
  }

  pub fn insert(&mut self, mode: RunMode, name: &str, value: Option<&str>) {
    self
      .0
      .entry(mode)
      .or_default()
      .insert(name.to_string(), value.map(str::to_string));
  }
}

/// Placeholder resolver over an environment snapshot and resolved tags.
struct EvalResolver<'a, T: TagLookup + ?Sized> {
  env: &'a HashMap<String, String>,
  tags: &'a T,
}

impl<T: TagLookup + ?Sized> Resolver for EvalResolver<'_, T> {
  fn resolve_artifact(&self, name: &str) -> Result<String, PlaceholderError> {
    self
      .tags
      .lookup(name)
      .ok_or_else(|| PlaceholderError::UnresolvedArtifact(name.to_string()))
  }

  fn resolve_env(&self, var: &str) -> Result<String, PlaceholderError> {
    Ok(self.env.get(var).cloned().unwrap_or_default())
  }
}

fn artifact_placeholder(name: &str) -> String {
  format!("$${{artifact:{name}}}")
}

/// The layered, not yet substituted, arguments of an artifact.
fn layered_args(mode: RunMode, artifact: &Artifact, overlays: &ModeOverlays) -> BuildArgs {
  let mut args = BuildArgs::new();

  if mode == RunMode::Debug {
    args.insert(DEBUG_GCFLAGS_ARG.to_string(), Some(DEBUG_GCFLAGS_VALUE.to_string()));
  }

  for dep in &artifact.requires {
    if let Some(alias) = &dep.alias {
      args.insert(alias.clone(), Some(artifact_placeholder(&dep.image_name)));
    }
  }

  if let BuildKind::Docker(docker) = &artifact.kind {
    args.extend(docker.build_args.iter().map(|(k, v)| (k.clone(), v.clone())));
  }

  if let Some(overlay) = overlays.for_mode(mode) {
    args.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
  }

  args
}

fn substitute_arg(
  artifact: &Artifact,
  arg: &str,
  value: &str,
  resolver: &impl Resolver,
) -> Result<String, EvalError> {
  placeholder::substitute(value, resolver).map_err(|source| match source {
    PlaceholderError::UnresolvedArtifact(reference) => EvalError::UnresolvedReference {
      artifact: artifact.image_name.clone(),
      reference,
    },
    source => EvalError::Placeholder {
      artifact: artifact.image_name.clone(),
      arg: arg.to_string(),
      source,
    },
  })
}

/// Evaluate the final build arguments for `artifact`.
///
/// # Errors
///
/// Returns [`EvalError::UnresolvedReference`] if a referenced artifact has no
/// tag in `tags`, and [`EvalError::Placeholder`] for malformed values.
pub fn evaluate_build_args<T: TagLookup + ?Sized>(
  mode: RunMode,
  artifact: &Artifact,
  overlays: &ModeOverlays,
  env: &HashMap<String, String>,
  tags: &T,
) -> Result<BuildArgs, EvalError> {
  let resolver = EvalResolver { env, tags };

  layered_args(mode, artifact, overlays)
    .into_iter()
    .map(|(name, value)| -> Result<_, EvalError> {
      let value = match value {
        Some(v) => Some(substitute_arg(artifact, &name, &v, &resolver)?),
        None => None,
      };
      Ok((name, value))
    })
    .collect()
}

/// Environment entries binding each aliased dependency to its tag.
///
/// Used by backends that receive dependencies through the environment
/// rather than build arguments.
pub fn dependency_env<T: TagLookup + ?Sized>(artifact: &Artifact, tags: &T) -> Result<Vec<String>, EvalError> {
  artifact
    .requires
    .iter()
    .filter_map(|dep| dep.alias.as_ref().map(|alias| (alias, &dep.image_name)))
    .map(|(alias, name)| -> Result<_, EvalError> {
      let tag = tags.lookup(name).ok_or_else(|| EvalError::UnresolvedReference {
        artifact: artifact.image_name.clone(),
        reference: name.clone(),
      })?;
      Ok(format!("{alias}={tag}"))
    })
    .collect()
}

/// Names of the artifacts `artifact` depends on in `mode`, in first-seen order.
///
/// Includes every `requires` entry and every `$${artifact:...}` reference in
/// the layered build arguments.
pub fn referenced_artifacts(
  mode: RunMode,
  artifact: &Artifact,
  overlays: &ModeOverlays,
) -> Result<Vec<String>, EvalError> {
  let mut refs: Vec<String> = Vec::new();
  let mut push = |name: String| {
    if !refs.contains(&name) {
      refs.push(name);
    }
  };

  for dep in &artifact.requires {
    push(dep.image_name.clone());
  }

  for (arg, value) in layered_args(mode, artifact, overlays) {
    let Some(value) = value else { continue };
    let names = placeholder::artifact_references(&value).map_err(|source| EvalError::Placeholder {
      artifact: artifact.image_name.clone(),
      arg,
      source,
    })?;
    names.into_iter().for_each(&mut push);
  }

  Ok(refs)
}
