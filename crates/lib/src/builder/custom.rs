//! Artifacts built by a user-supplied command.
//!
//! The command runs through the platform shell in the artifact's workspace.
//! Besides the ambient environment it receives:
//!
//! - `IMAGE` - the tag to produce
//! - `BUILD_CONTEXT` - the absolute workspace
//! - one variable per aliased dependency, set to that dependency's tag

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tracing::info;

use crate::artifact::{Artifact, BuildKind, BuiltArtifact};
use crate::buildargs::dependency_env;
use crate::consts::{CUSTOM_CONTEXT_ENV, CUSTOM_IMAGE_ENV};
use crate::env::{EnvironmentSource, ProcessEnvironment, merge_env};

use super::local::workspace_dir;
use super::process::{CommandError, CommandRunner, CommandSpec, ProcessRunner, get_shell};
use super::{ArtifactBuilder, BuildContext, BuildError};

/// Builds custom artifacts by running their build command.
pub struct CustomBuilder {
  shell: Option<String>,
  extra_env: Vec<String>,
  env_source: Arc<dyn EnvironmentSource>,
  runner: Arc<dyn CommandRunner>,
}

impl Default for CustomBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl CustomBuilder {
  pub fn new() -> Self {
    Self {
      shell: None,
      extra_env: Vec::new(),
      env_source: Arc::new(ProcessEnvironment),
      runner: Arc::new(ProcessRunner),
    }
  }

  /// Use a specific shell instead of the platform default.
  pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
    self.shell = Some(shell.into());
    self
  }

  pub fn with_extra_env(mut self, extra_env: Vec<String>) -> Self {
    self.extra_env = extra_env;
    self
  }

  pub fn with_env_source(mut self, source: impl EnvironmentSource + 'static) -> Self {
    self.env_source = Arc::new(source);
    self
  }

  pub fn with_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
    self.runner = Arc::new(runner);
    self
  }
}

#[async_trait]
impl ArtifactBuilder for CustomBuilder {
  async fn build(
    &self,
    ctx: &BuildContext,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    artifact: &Artifact,
    tag: &str,
  ) -> Result<BuiltArtifact, BuildError> {
    let BuildKind::Custom(custom) = &artifact.kind else {
      return Err(BuildError::Unsupported {
        artifact: artifact.image_name.clone(),
        kind: artifact.kind.name(),
      });
    };

    let workspace = workspace_dir(artifact)?;

    let mut artifact_env: Vec<String> = custom.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    artifact_env.push(format!("{CUSTOM_IMAGE_ENV}={tag}"));
    artifact_env.push(format!("{CUSTOM_CONTEXT_ENV}={}", workspace.display()));
    artifact_env.extend(dependency_env(artifact, ctx.resolver.as_ref())?);

    let (program, mut args) = get_shell(self.shell.as_deref());
    args.push(custom.build_command.clone());

    let spec = CommandSpec {
      program,
      args,
      dir: workspace,
      env: merge_env(self.env_source.environ(), &self.extra_env, &artifact_env),
    };

    info!(artifact = %artifact.image_name, tag = %tag, command = %custom.build_command, "running custom build");

    self.runner.run(&spec, out, &ctx.cancel).await.map_err(|e| match e {
      CommandError::Cancelled => BuildError::Cancelled {
        artifact: artifact.image_name.clone(),
      },
      CommandError::Io(source) => BuildError::Io {
        artifact: artifact.image_name.clone(),
        source,
      },
      other => BuildError::BuildFailed {
        artifact: artifact.image_name.clone(),
        cause: other.to_string(),
      },
    })?;

    Ok(BuiltArtifact::new(artifact.image_name.clone(), tag))
  }
}
