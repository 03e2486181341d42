//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use dockyard_lib::artifact::{Artifact, BuiltArtifact};
use dockyard_lib::buildargs::{BuildArgs, evaluate_build_args};
use dockyard_lib::builder::{ArtifactBuilder, BuildContext, BuildError};
use dockyard_lib::tag::Tagger;

/// How the spy backend treats one artifact.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
  Succeed,
  Fail,
  /// Succeed after a delay, unless cancelled first.
  Slow(Duration),
  /// Run until the run is cancelled.
  UntilCancelled,
}

/// A backend that records every call instead of building anything.
#[derive(Default)]
pub struct SpyBuilder {
  behaviors: HashMap<String, Behavior>,
  pub started: Mutex<Vec<(String, Instant)>>,
  pub finished: Mutex<Vec<(String, Instant)>>,
  pub args: Mutex<HashMap<String, BuildArgs>>,
  pub saw_cancel: Mutex<Vec<String>>,
}

impl SpyBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: &str, behavior: Behavior) -> Self {
    self.behaviors.insert(name.to_string(), behavior);
    self
  }

  pub fn calls(&self) -> Vec<String> {
    self.started.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
  }

  pub fn started_at(&self, name: &str) -> Option<Instant> {
    find(&self.started, name)
  }

  pub fn finished_at(&self, name: &str) -> Option<Instant> {
    find(&self.finished, name)
  }
}

fn find(events: &Mutex<Vec<(String, Instant)>>, name: &str) -> Option<Instant> {
  events.lock().unwrap().iter().find(|(n, _)| n == name).map(|(_, at)| *at)
}

#[async_trait]
impl ArtifactBuilder for SpyBuilder {
  async fn build(
    &self,
    ctx: &BuildContext,
    _out: &mut (dyn AsyncWrite + Send + Unpin),
    artifact: &Artifact,
    tag: &str,
  ) -> Result<BuiltArtifact, BuildError> {
    let name = artifact.image_name.clone();
    self.started.lock().unwrap().push((name.clone(), Instant::now()));

    let args = evaluate_build_args(ctx.mode, artifact, &ctx.overlays, &HashMap::new(), ctx.resolver.as_ref())?;
    self.args.lock().unwrap().insert(name.clone(), args);

    let behavior = self.behaviors.get(&name).copied().unwrap_or(Behavior::Succeed);
    let outcome = match behavior {
      Behavior::Succeed => Ok(()),
      Behavior::Fail => Err(BuildError::BuildFailed {
        artifact: name.clone(),
        cause: "exit status 1".to_string(),
      }),
      Behavior::Slow(delay) => {
        tokio::select! {
          _ = ctx.cancel.cancelled() => Err(self.cancelled(&name)),
          _ = tokio::time::sleep(delay) => Ok(()),
        }
      }
      Behavior::UntilCancelled => {
        ctx.cancel.cancelled().await;
        Err(self.cancelled(&name))
      }
    };

    self.finished.lock().unwrap().push((name.clone(), Instant::now()));
    outcome.map(|()| BuiltArtifact::new(name, tag))
  }
}

impl SpyBuilder {
  fn cancelled(&self, name: &str) -> BuildError {
    self.saw_cancel.lock().unwrap().push(name.to_string());
    BuildError::Cancelled {
      artifact: name.to_string(),
    }
  }
}

/// Tags every artifact with the same literal tag.
pub struct LiteralTagger(pub &'static str);

impl Tagger for LiteralTagger {
  fn tag(&self, _artifact: &Artifact) -> String {
    self.0.to_string()
  }
}

/// An artifact whose build arg `arg` references `dependency`.
pub fn depends_on(name: &str, arg: &str, dependency: &str) -> Artifact {
  Artifact::docker(name).with_build_arg(arg, Some(&format!("$${{artifact:{dependency}}}")))
}
