//! Builder backends.
//!
//! Every build mechanism implements [`ArtifactBuilder`]. The scheduler only
//! ever talks to that trait, usually through a [`Builders`] dispatcher that
//! routes each artifact to the backend for its [`BuildKind`].
//!
//! # Backends
//!
//! - [`local::LocalBuilder`] - Dockerfile builds on the local daemon, through
//!   the docker CLI or the daemon HTTP API
//! - [`custom::CustomBuilder`] - an arbitrary user command

pub mod custom;
pub mod local;
pub mod process;

mod output;

pub use output::{DiscardOutput, OutputSink, StderrOutput};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, BuildKind, BuiltArtifact};
use crate::buildargs::{EvalError, ModeOverlays};
use crate::resolver::ArtifactResolver;
use crate::types::RunMode;

use custom::CustomBuilder;
use local::{LocalBuildConfig, LocalBuilder};

/// Errors a backend reports for a single artifact.
#[derive(Debug, Error)]
pub enum BuildError {
  /// The backend ran and reported failure.
  #[error("build of {artifact} failed: {cause}")]
  BuildFailed { artifact: String, cause: String },

  /// The build observed run cancellation and stopped.
  #[error("build of {artifact} cancelled")]
  Cancelled { artifact: String },

  /// No backend handles this artifact's build mechanism.
  #[error("no builder available for {kind} artifact {artifact}")]
  Unsupported { artifact: String, kind: &'static str },

  #[error("dockerfile for {artifact} not found at {}", path.display())]
  DockerfileNotFound { artifact: String, path: PathBuf },

  #[error(transparent)]
  Evaluation(#[from] EvalError),

  #[error("io error building {artifact}: {source}")]
  Io {
    artifact: String,
    #[source]
    source: std::io::Error,
  },
}

impl BuildError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, BuildError::Cancelled { .. })
  }
}

/// Run-scoped state handed to every build.
#[derive(Debug, Clone)]
pub struct BuildContext {
  /// Cancelled when the run aborts.
  pub cancel: CancellationToken,
  pub mode: RunMode,

  /// Tags of artifacts built so far in this run.
  pub resolver: Arc<ArtifactResolver>,

  pub overlays: Arc<ModeOverlays>,
}

impl BuildContext {
  pub fn new(mode: RunMode) -> Self {
    Self {
      cancel: CancellationToken::new(),
      mode,
      resolver: Arc::new(ArtifactResolver::new()),
      overlays: Arc::new(ModeOverlays::default()),
    }
  }

  pub fn with_resolver(mut self, resolver: Arc<ArtifactResolver>) -> Self {
    self.resolver = resolver;
    self
  }

  pub fn with_overlays(mut self, overlays: Arc<ModeOverlays>) -> Self {
    self.overlays = overlays;
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }
}

/// A build mechanism.
///
/// Implementations are called concurrently for different artifacts of the
/// same run. They must stop promptly once `ctx.cancel` fires, returning
/// [`BuildError::Cancelled`].
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
  async fn build(
    &self,
    ctx: &BuildContext,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    artifact: &Artifact,
    tag: &str,
  ) -> Result<BuiltArtifact, BuildError>;
}

/// Routes each artifact to the backend for its build mechanism.
#[derive(Clone, Default)]
pub struct Builders {
  docker: Option<Arc<dyn ArtifactBuilder>>,
  custom: Option<Arc<dyn ArtifactBuilder>>,
}

impl Builders {
  pub fn new() -> Self {
    Self::default()
  }

  /// Local daemon builds for Dockerfiles and shell commands for custom
  /// artifacts, sharing the same extra environment.
  pub fn local(config: LocalBuildConfig) -> Self {
    let custom = CustomBuilder::new().with_extra_env(config.extra_env.clone());
    Self::new().with_docker(LocalBuilder::new(config)).with_custom(custom)
  }

  pub fn with_docker(mut self, builder: impl ArtifactBuilder + 'static) -> Self {
    self.docker = Some(Arc::new(builder));
    self
  }

  pub fn with_custom(mut self, builder: impl ArtifactBuilder + 'static) -> Self {
    self.custom = Some(Arc::new(builder));
    self
  }

  fn for_kind(&self, kind: &BuildKind) -> Option<&Arc<dyn ArtifactBuilder>> {
    match kind {
      BuildKind::Docker(_) => self.docker.as_ref(),
      BuildKind::Custom(_) => self.custom.as_ref(),
    }
  }
}

#[async_trait]
impl ArtifactBuilder for Builders {
  async fn build(
    &self,
    ctx: &BuildContext,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    artifact: &Artifact,
    tag: &str,
  ) -> Result<BuiltArtifact, BuildError> {
    match self.for_kind(&artifact.kind) {
      Some(builder) => builder.build(ctx, out, artifact, tag).await,
      None => Err(BuildError::Unsupported {
        artifact: artifact.image_name.clone(),
        kind: artifact.kind.name(),
      }),
    }
  }
}
