//! Types for scheduling a build run.
//!
//! This module defines the error types, per-artifact and run states, the
//! structured run result, and configuration for the scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::artifact::BuiltArtifact;
use crate::buildargs::EvalError;
use crate::builder::BuildError;
use crate::resolver::ResolverError;

/// Errors that can occur while planning or executing a run.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// The dependency graph contains a cycle; no build was started.
  #[error("dependency cycle between artifacts: {}", .0.join(", "))]
  CyclicDependency(Vec<String>),

  /// An artifact references a name that is neither declared in the run nor
  /// pre-resolved.
  #[error("artifact {artifact} references unknown artifact {reference}")]
  UnresolvedReference { artifact: String, reference: String },

  /// Two artifacts in one run share a name.
  #[error("artifact {0} is declared more than once")]
  DuplicateArtifact(String),

  /// A declared artifact already has a pre-resolved tag.
  #[error("artifact {0} is declared but already has a resolved tag")]
  AlreadyResolved(String),

  #[error("evaluation error: {0}")]
  Evaluation(#[from] EvalError),

  #[error("resolver error: {0}")]
  Resolver(#[from] ResolverError),

  /// The run ended before every artifact succeeded.
  #[error("build of {first_failure} failed: {source} ({} failed, {} skipped)", .failed.len(), .skipped.len())]
  Aborted {
    first_failure: String,
    #[source]
    source: BuildError,
    failed: Vec<String>,
    skipped: Vec<String>,
  },

  /// The run was cancelled by the caller without any build failing.
  #[error("run cancelled ({} cancelled, {} skipped)", .cancelled.len(), .skipped.len())]
  Cancelled { cancelled: Vec<String>, skipped: Vec<String> },
}

/// How the scheduler reacts to a failed build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
  /// Cancel everything still running and skip everything not yet started.
  #[default]
  FailFast,
  /// Keep building; skip only artifacts whose dependencies did not succeed.
  BestEffort,
}

impl fmt::Display for FailurePolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailurePolicy::FailFast => f.write_str("fail-fast"),
      FailurePolicy::BestEffort => f.write_str("best-effort"),
    }
  }
}

impl FromStr for FailurePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
      "fail-fast" => Ok(FailurePolicy::FailFast),
      "best-effort" => Ok(FailurePolicy::BestEffort),
      other => Err(format!("unknown failure policy: {other}")),
    }
  }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteConfig {
  /// Maximum number of builds running at once. Values below 1 act as 1.
  pub concurrency: usize,

  pub failure_policy: FailurePolicy,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      concurrency: num_cpus(),
      failure_policy: FailurePolicy::default(),
    }
  }
}

impl ExecuteConfig {
  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency;
    self
  }

  pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
    self.failure_policy = policy;
    self
  }
}

/// Get the number of CPUs for default concurrency.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Lifecycle of one artifact within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
  Pending,
  Running,
  Succeeded,
  Failed,
  /// Was running when the run aborted.
  Cancelled,
  /// Never dispatched.
  Skipped,
}

impl ArtifactState {
  pub fn is_terminal(self) -> bool {
    !matches!(self, ArtifactState::Pending | ArtifactState::Running)
  }

  fn can_transition_to(self, next: ArtifactState) -> bool {
    use ArtifactState::*;
    matches!(
      (self, next),
      (Pending, Running) | (Pending, Skipped) | (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
    )
  }
}

impl fmt::Display for ArtifactState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ArtifactState::Pending => "pending",
      ArtifactState::Running => "running",
      ArtifactState::Succeeded => "succeeded",
      ArtifactState::Failed => "failed",
      ArtifactState::Cancelled => "cancelled",
      ArtifactState::Skipped => "skipped",
    };
    f.write_str(s)
  }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
  #[default]
  Planning,
  Executing,
  /// Every artifact succeeded.
  Completed,
  /// At least one artifact did not succeed.
  Aborted,
}

/// Why an artifact was never dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
  /// The run was aborted before the artifact could start.
  RunAborted,
  /// The named dependency did not succeed.
  DependencyFailed(String),
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::RunAborted => f.write_str("run aborted"),
      SkipReason::DependencyFailed(dep) => write!(f, "dependency {dep} did not succeed"),
    }
  }
}

/// Per-artifact states with validated transitions.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateTable {
  states: BTreeMap<String, ArtifactState>,
}

impl StateTable {
  pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a String>) -> Self {
    Self {
      states: names.into_iter().map(|n| (n.clone(), ArtifactState::Pending)).collect(),
    }
  }

  pub(crate) fn get(&self, name: &str) -> Option<ArtifactState> {
    self.states.get(name).copied()
  }

  /// Move `name` to `next`. Invalid transitions are logged and ignored.
  pub(crate) fn transition(&mut self, name: &str, next: ArtifactState) -> bool {
    match self.states.get_mut(name) {
      Some(state) if state.can_transition_to(next) => {
        *state = next;
        true
      }
      Some(state) => {
        error!(artifact = %name, from = %state, to = %next, "invalid artifact state transition");
        false
      }
      None => {
        error!(artifact = %name, "state transition for unknown artifact");
        false
      }
    }
  }

  pub(crate) fn into_inner(self) -> BTreeMap<String, ArtifactState> {
    self.states
  }
}

/// Outcome of a run that got past planning.
#[derive(Debug, Default)]
pub struct RunResult {
  pub state: RunState,

  /// Successfully built artifacts.
  pub built: BTreeMap<String, BuiltArtifact>,

  /// Failed builds, in the order the failures were observed.
  pub failed: Vec<(String, BuildError)>,

  /// Builds that were running when the run aborted.
  pub cancelled: Vec<String>,

  /// Artifacts never dispatched.
  pub skipped: BTreeMap<String, SkipReason>,

  /// Final state of every artifact.
  pub states: BTreeMap<String, ArtifactState>,
}

impl RunResult {
  /// Returns true if every artifact was built.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.cancelled.is_empty() && self.skipped.is_empty()
  }

  /// The first failure observed, if any.
  pub fn first_failure(&self) -> Option<(&str, &BuildError)> {
    self.failed.first().map(|(name, err)| (name.as_str(), err))
  }

  /// Number of artifacts the run accounted for.
  pub fn total(&self) -> usize {
    self.built.len() + self.failed.len() + self.cancelled.len() + self.skipped.len()
  }

  /// Tags of the built artifacts, keyed by artifact name.
  pub fn tags(&self) -> BTreeMap<String, String> {
    self
      .built
      .iter()
      .map(|(name, built)| (name.clone(), built.tag.clone()))
      .collect()
  }

  /// Convert into the final tag map, or the reason the run did not complete.
  pub fn into_tags(self) -> Result<BTreeMap<String, String>, ExecuteError> {
    if self.is_success() {
      return Ok(self.tags());
    }

    let skipped: Vec<String> = self.skipped.into_keys().collect();
    let failed: Vec<String> = self.failed.iter().map(|(name, _)| name.clone()).collect();

    match self.failed.into_iter().next() {
      Some((first_failure, source)) => Err(ExecuteError::Aborted {
        first_failure,
        source,
        failed,
        skipped,
      }),
      None => Err(ExecuteError::Cancelled {
        cancelled: self.cancelled,
        skipped,
      }),
    }
  }
}
