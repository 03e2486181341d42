//! Build scheduling.
//!
//! This module provides the entry points for running a set of artifact
//! builds. It handles:
//! - dependency ordering through [`ArtifactGraph`] layers
//! - concurrent builds within a layer, bounded by a semaphore
//! - fail-fast cancellation or best-effort skip tracking
//! - recording each built tag so dependents can reference it

pub mod dag;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, BuiltArtifact};
use crate::buildargs::ModeOverlays;
use crate::builder::{ArtifactBuilder, BuildContext, BuildError, DiscardOutput, OutputSink};
use crate::resolver::ArtifactResolver;
use crate::tag::{FixedTagger, Tagger};
use crate::types::RunMode;

pub use dag::ArtifactGraph;
pub use types::{ArtifactState, ExecuteConfig, ExecuteError, FailurePolicy, RunResult, RunState, SkipReason};

use types::StateTable;

/// What a build task reports back to the scheduler.
enum TaskOutcome {
  /// The run was cancelled before the task got a permit.
  NotStarted,
  Finished(Result<BuiltArtifact, BuildError>),
}

/// One scheduler execution over a set of artifacts.
///
/// A run owns its resolver: tags recorded here are never visible to another
/// run.
pub struct BuildRun {
  artifacts: Vec<Artifact>,
  mode: RunMode,
  config: ExecuteConfig,
  overlays: ModeOverlays,
  prebuilt: BTreeMap<String, String>,
  output: Arc<dyn OutputSink>,
  tagger: Arc<dyn Tagger>,
  cancel: CancellationToken,
}

impl BuildRun {
  pub fn new(artifacts: Vec<Artifact>, mode: RunMode) -> Self {
    Self {
      artifacts,
      mode,
      config: ExecuteConfig::default(),
      overlays: ModeOverlays::default(),
      prebuilt: BTreeMap::new(),
      output: Arc::new(DiscardOutput),
      tagger: Arc::new(FixedTagger::default()),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_config(mut self, config: ExecuteConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_overlays(mut self, overlays: ModeOverlays) -> Self {
    self.overlays = overlays;
    self
  }

  /// Tags of images built outside this run that artifacts may reference.
  pub fn with_prebuilt<I, K, V>(mut self, prebuilt: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    self
      .prebuilt
      .extend(prebuilt.into_iter().map(|(k, v)| (k.into(), v.into())));
    self
  }

  pub fn with_output(mut self, output: impl OutputSink + 'static) -> Self {
    self.output = Arc::new(output);
    self
  }

  pub fn with_tagger(mut self, tagger: impl Tagger + 'static) -> Self {
    self.tagger = Arc::new(tagger);
    self
  }

  /// Abort the run when `cancel` fires. Aborting the run never cancels the
  /// caller's token.
  pub fn with_cancellation(mut self, cancel: &CancellationToken) -> Self {
    self.cancel = cancel.child_token();
    self
  }

  /// Validate the artifacts and compute build layers without building.
  ///
  /// # Errors
  ///
  /// - `DuplicateArtifact` if two artifacts share a name
  /// - `AlreadyResolved` if a declared artifact is also pre-built
  /// - `UnresolvedReference` for references to unknown artifacts
  /// - `CyclicDependency` naming the artifacts on a cycle
  pub fn plan(&self) -> Result<ArtifactGraph, ExecuteError> {
    let graph = ArtifactGraph::from_artifacts(&self.artifacts, self.mode, &self.overlays, &self.prebuilt)?;

    if let Some(artifact) = self
      .artifacts
      .iter()
      .find(|a| self.prebuilt.contains_key(&a.image_name))
    {
      return Err(ExecuteError::AlreadyResolved(artifact.image_name.clone()));
    }

    Ok(graph)
  }

  /// Build every artifact with `builder`.
  ///
  /// Planning errors are returned as `Err` before any build starts. Once
  /// execution begins, per-artifact failures are reported in the
  /// [`RunResult`]; `Err` is only returned if the run's own bookkeeping
  /// breaks.
  pub async fn execute(self, builder: Arc<dyn ArtifactBuilder>) -> Result<RunResult, ExecuteError> {
    let graph = self.plan()?;

    info!(
      artifacts = graph.len(),
      layers = graph.layers().len(),
      concurrency = self.config.concurrency,
      policy = %self.config.failure_policy,
      mode = %self.mode,
      "starting build run"
    );

    let resolver = Arc::new(ArtifactResolver::with_prebuilt(self.prebuilt.clone()));
    let ctx = BuildContext::new(self.mode)
      .with_cancel(self.cancel.clone())
      .with_resolver(resolver.clone())
      .with_overlays(Arc::new(self.overlays.clone()));

    let artifacts: HashMap<String, Arc<Artifact>> = self
      .artifacts
      .iter()
      .map(|a| (a.image_name.clone(), Arc::new(a.clone())))
      .collect();

    let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
    let fail_fast = self.config.failure_policy == FailurePolicy::FailFast;
    let mut states = StateTable::new(self.artifacts.iter().map(|a| &a.image_name));
    let mut result = RunResult {
      state: RunState::Executing,
      ..RunResult::default()
    };

    for (layer_idx, layer) in graph.layers().iter().enumerate() {
      if ctx.cancel.is_cancelled() {
        for name in layer {
          skip(&mut states, &mut result, name, SkipReason::RunAborted);
        }
        continue;
      }

      debug!(layer = layer_idx, artifacts = layer.len(), "executing layer");

      // An artifact runs only once every dependency succeeded
      let mut ready = Vec::new();
      for name in layer {
        let failed_dep = graph
          .dependencies(name)
          .into_iter()
          .find(|dep| states.get(dep) != Some(ArtifactState::Succeeded));

        match failed_dep {
          Some(dep) => skip(&mut states, &mut result, name, SkipReason::DependencyFailed(dep)),
          None => ready.push(name.clone()),
        }
      }

      if ready.is_empty() {
        continue;
      }

      let mut join_set = JoinSet::new();

      for name in &ready {
        let Some(artifact) = artifacts.get(name).cloned() else {
          continue;
        };
        let name = name.clone();
        let tag = self.tagger.tag(&artifact);
        let ctx = ctx.clone();
        let builder = builder.clone();
        let output = self.output.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
          let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return (name, TaskOutcome::NotStarted),
            permit = semaphore.acquire_owned() => permit,
          };
          let Ok(_permit) = permit else {
            return (name, TaskOutcome::NotStarted);
          };

          debug!(artifact = %name, tag = %tag, "dispatching build");
          let mut out = output.writer(&name);
          let built = builder.build(&ctx, &mut *out, &artifact, &tag).await;

          // Cancel before the permit is released so no queued build starts
          if fail_fast && matches!(&built, Err(e) if !e.is_cancelled()) {
            ctx.cancel.cancel();
          }
          if let Err(e) = out.flush().await {
            debug!(artifact = %name, error = %e, "failed to flush build output");
          }

          (name, TaskOutcome::Finished(built))
        });
      }

      while let Some(joined) = join_set.join_next().await {
        let (name, outcome) = match joined {
          Ok(joined) => joined,
          Err(e) => {
            // The artifact is recorded as failed once the layer drains
            error!(error = %e, "build task panicked");
            if fail_fast {
              ctx.cancel.cancel();
            }
            continue;
          }
        };

        match outcome {
          TaskOutcome::NotStarted => skip(&mut states, &mut result, &name, SkipReason::RunAborted),
          TaskOutcome::Finished(Ok(built)) => {
            states.transition(&name, ArtifactState::Running);
            resolver.record(&name, &built.tag)?;
            info!(artifact = %name, tag = %built, "build succeeded");
            states.transition(&name, ArtifactState::Succeeded);
            result.built.insert(name, built);
          }
          TaskOutcome::Finished(Err(e)) if e.is_cancelled() => {
            states.transition(&name, ArtifactState::Running);
            warn!(artifact = %name, "build cancelled");
            states.transition(&name, ArtifactState::Cancelled);
            result.cancelled.push(name);
          }
          TaskOutcome::Finished(Err(e)) => {
            self.record_failure(&ctx, &mut states, &mut result, name, e);
          }
        }
      }

      // A task that panicked never reported back
      for name in ready {
        if states.get(&name) == Some(ArtifactState::Pending) {
          let err = BuildError::BuildFailed {
            artifact: name.clone(),
            cause: "build task panicked".to_string(),
          };
          self.record_failure(&ctx, &mut states, &mut result, name, err);
        }
      }
    }

    result.state = if result.is_success() {
      RunState::Completed
    } else {
      RunState::Aborted
    };
    result.states = states.into_inner();

    info!(
      built = result.built.len(),
      failed = result.failed.len(),
      cancelled = result.cancelled.len(),
      skipped = result.skipped.len(),
      state = ?result.state,
      "build run complete"
    );

    Ok(result)
  }

  fn record_failure(
    &self,
    ctx: &BuildContext,
    states: &mut StateTable,
    result: &mut RunResult,
    name: String,
    err: BuildError,
  ) {
    states.transition(&name, ArtifactState::Running);
    error!(artifact = %name, error = %err, "build failed");
    states.transition(&name, ArtifactState::Failed);
    result.failed.push((name, err));

    if self.config.failure_policy == FailurePolicy::FailFast {
      ctx.cancel.cancel();
    }
  }
}

fn skip(states: &mut StateTable, result: &mut RunResult, name: &str, reason: SkipReason) {
  warn!(artifact = %name, reason = %reason, "skipping build");
  states.transition(name, ArtifactState::Skipped);
  result.skipped.insert(name.to_string(), reason);
}

/// Build `artifacts` and return the tag of each.
///
/// # Errors
///
/// Planning errors, or [`ExecuteError::Aborted`] describing the first
/// failure when not every artifact was built.
pub async fn execute_artifacts(
  artifacts: Vec<Artifact>,
  mode: RunMode,
  config: &ExecuteConfig,
  builder: Arc<dyn ArtifactBuilder>,
) -> Result<BTreeMap<String, String>, ExecuteError> {
  BuildRun::new(artifacts, mode)
    .with_config(config.clone())
    .execute(builder)
    .await?
    .into_tags()
}

/// Build `artifacts`, aborting when `cancel` fires.
pub async fn execute_with_token(
  artifacts: Vec<Artifact>,
  mode: RunMode,
  config: &ExecuteConfig,
  builder: Arc<dyn ArtifactBuilder>,
  cancel: &CancellationToken,
) -> Result<RunResult, ExecuteError> {
  BuildRun::new(artifacts, mode)
    .with_config(config.clone())
    .with_cancellation(cancel)
    .execute(builder)
    .await
}
