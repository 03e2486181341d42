//! Dockerfile builds on the local container daemon.
//!
//! Two strategies share the same preparation (workspace and Dockerfile
//! lookup, environment merge, build-arg evaluation):
//!
//! - [`cli`] shells out to the docker client
//! - [`api`] talks to the daemon's HTTP API directly

pub mod api;
pub mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::artifact::{Artifact, BuildKind, BuiltArtifact};
use crate::buildargs::evaluate_build_args;
use crate::consts::{DEFAULT_DOCKER_BINARY, DEFAULT_DOCKER_HOST, DOCKER_HOST_ENV};
use crate::env::{EnvironmentSource, ProcessEnvironment, backend_flags, effective_env, merge_env};

use super::process::{CommandRunner, CommandSpec, ProcessRunner};
use super::{ArtifactBuilder, BuildContext, BuildError};

use api::{DaemonApi, HttpDaemon};

/// Settings for local daemon builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBuildConfig {
  /// Build through the docker client instead of the daemon API.
  pub use_docker_cli: bool,

  /// Set `DOCKER_BUILDKIT=1` for the docker client.
  pub use_buildkit: bool,

  /// Remove intermediate containers even after a failed API build. The CLI
  /// strategy always passes `--force-rm`.
  pub force_remove: bool,

  /// `KEY=VALUE` entries appended after the ambient environment.
  pub extra_env: Vec<String>,

  pub docker_binary: String,

  /// Daemon endpoint for the API strategy. Falls back to `DOCKER_HOST`.
  pub docker_host: Option<String>,
}

impl Default for LocalBuildConfig {
  fn default() -> Self {
    Self {
      use_docker_cli: true,
      use_buildkit: false,
      force_remove: true,
      extra_env: Vec::new(),
      docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
      docker_host: None,
    }
  }
}

impl LocalBuildConfig {
  /// The daemon endpoint: configured host, then `DOCKER_HOST`, then the default.
  pub fn resolved_docker_host(&self) -> String {
    self
      .docker_host
      .clone()
      .or_else(|| std::env::var(DOCKER_HOST_ENV).ok().filter(|h| !h.is_empty()))
      .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string())
  }
}

/// Builds Docker artifacts on the local daemon.
pub struct LocalBuilder {
  config: LocalBuildConfig,
  env_source: Arc<dyn EnvironmentSource>,
  runner: Arc<dyn CommandRunner>,
  daemon: Arc<dyn DaemonApi>,
}

impl LocalBuilder {
  pub fn new(config: LocalBuildConfig) -> Self {
    let daemon = HttpDaemon::new(config.resolved_docker_host());
    Self {
      config,
      env_source: Arc::new(ProcessEnvironment),
      runner: Arc::new(ProcessRunner),
      daemon: Arc::new(daemon),
    }
  }

  pub fn with_env_source(mut self, source: impl EnvironmentSource + 'static) -> Self {
    self.env_source = Arc::new(source);
    self
  }

  pub fn with_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
    self.runner = Arc::new(runner);
    self
  }

  pub fn with_daemon(mut self, daemon: impl DaemonApi + 'static) -> Self {
    self.daemon = Arc::new(daemon);
    self
  }

  /// The environment handed to the docker client.
  pub fn build_env(&self) -> Vec<String> {
    merge_env(
      self.env_source.environ(),
      &self.config.extra_env,
      &backend_flags(self.config.use_buildkit),
    )
  }
}

/// Absolute, normalized workspace of an artifact.
pub(crate) fn workspace_dir(artifact: &Artifact) -> Result<PathBuf, BuildError> {
  dunce::canonicalize(&artifact.workspace).map_err(|source| BuildError::Io {
    artifact: artifact.image_name.clone(),
    source,
  })
}

/// Resolve the Dockerfile against the workspace; it must exist.
fn locate_dockerfile(artifact: &Artifact, workspace: &Path, dockerfile: &Path) -> Result<PathBuf, BuildError> {
  let path = workspace.join(dockerfile);
  dunce::canonicalize(&path).map_err(|_| BuildError::DockerfileNotFound {
    artifact: artifact.image_name.clone(),
    path,
  })
}

#[async_trait]
impl ArtifactBuilder for LocalBuilder {
  async fn build(
    &self,
    ctx: &BuildContext,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    artifact: &Artifact,
    tag: &str,
  ) -> Result<BuiltArtifact, BuildError> {
    let BuildKind::Docker(docker) = &artifact.kind else {
      return Err(BuildError::Unsupported {
        artifact: artifact.image_name.clone(),
        kind: artifact.kind.name(),
      });
    };

    let workspace = workspace_dir(artifact)?;
    let dockerfile = locate_dockerfile(artifact, &workspace, &docker.dockerfile)?;

    let env = self.build_env();
    let effective = effective_env(&env);
    let args = evaluate_build_args(ctx.mode, artifact, &ctx.overlays, &effective, ctx.resolver.as_ref())?;

    info!(
      artifact = %artifact.image_name,
      tag = %tag,
      strategy = if self.config.use_docker_cli { "cli" } else { "api" },
      "building artifact"
    );

    if self.config.use_docker_cli {
      let spec = CommandSpec {
        program: self.config.docker_binary.clone(),
        args: cli::docker_build_args(&dockerfile, tag, docker, &args),
        dir: workspace,
        env,
      };
      debug!(artifact = %artifact.image_name, cmd = %spec.display(), "docker build");

      self
        .runner
        .run(&spec, out, &ctx.cancel)
        .await
        .map_err(|e| cli::into_build_error(&artifact.image_name, e))?;

      return Ok(BuiltArtifact::new(artifact.image_name.clone(), tag));
    }

    let request = api::ImageBuildRequest::new(&workspace, &dockerfile, tag, docker, &args, &effective)
      .map_err(|cause| BuildError::BuildFailed {
        artifact: artifact.image_name.clone(),
        cause,
      })?
      .force_remove(self.config.force_remove);

    let digest = self
      .daemon
      .build_image(&request, out, &ctx.cancel)
      .await
      .map_err(|e| api::into_build_error(&artifact.image_name, e))?;

    let built = BuiltArtifact::new(artifact.image_name.clone(), tag);
    Ok(match digest {
      Some(digest) => built.with_digest(digest),
      None => built,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use serial_test::serial;
  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  use super::api::{DaemonError, ImageBuildRequest};
  use crate::builder::process::CommandError;
  use super::*;
  use crate::env::StaticEnvironment;
  use crate::types::RunMode;

  /// Records every command instead of running it.
  #[derive(Default, Clone)]
  struct RecordingRunner {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    fail_with: Option<i32>,
  }

  #[async_trait]
  impl CommandRunner for RecordingRunner {
    async fn run(
      &self,
      spec: &CommandSpec,
      _out: &mut (dyn AsyncWrite + Send + Unpin),
      _cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
      self.calls.lock().unwrap().push(spec.clone());
      match self.fail_with {
        Some(code) => Err(CommandError::Failed { code: Some(code) }),
        None => Ok(()),
      }
    }
  }

  #[derive(Default, Clone)]
  struct RecordingDaemon {
    requests: Arc<Mutex<Vec<ImageBuildRequest>>>,
  }

  #[async_trait]
  impl DaemonApi for RecordingDaemon {
    async fn build_image(
      &self,
      request: &ImageBuildRequest,
      _out: &mut (dyn AsyncWrite + Send + Unpin),
      _cancel: &CancellationToken,
    ) -> Result<Option<String>, DaemonError> {
      self.requests.lock().unwrap().push(request.clone());
      Ok(Some("sha256:feed".to_string()))
    }
  }

  fn workspace_with_dockerfile() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    temp
  }

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  async fn run_cli(config: LocalBuildConfig, ambient: &[&str], artifact: &Artifact) -> CommandSpec {
    let runner = RecordingRunner::default();
    let builder = LocalBuilder::new(config)
      .with_env_source(StaticEnvironment::new(ambient.iter().copied()))
      .with_runner(runner.clone());

    let built = builder
      .build(&BuildContext::new(RunMode::Dev), &mut tokio::io::sink(), artifact, "tag")
      .await
      .unwrap();
    assert_eq!(built.tag, "tag");

    let mut calls = runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    calls.remove(0)
  }

  #[tokio::test]
  async fn cli_environment_scenarios() {
    let temp = workspace_with_dockerfile();
    let artifact = Artifact::docker("app").with_workspace(temp.path());
    let dockerfile = dunce::canonicalize(temp.path().join("Dockerfile")).unwrap();
    let expected_args = strings(&["build", ".", "--file", dockerfile.to_str().unwrap(), "-t", "tag", "--force-rm"]);

    let cases: Vec<(&str, bool, Vec<String>, Vec<String>)> = vec![
      ("ambient only", false, vec![], strings(&["KEY=VALUE"])),
      (
        "extra env",
        false,
        strings(&["OTHER=VALUE"]),
        strings(&["KEY=VALUE", "OTHER=VALUE"]),
      ),
      ("buildkit", true, vec![], strings(&["KEY=VALUE", "DOCKER_BUILDKIT=1"])),
      (
        "buildkit and extra env",
        true,
        strings(&["OTHER=VALUE"]),
        strings(&["KEY=VALUE", "OTHER=VALUE", "DOCKER_BUILDKIT=1"]),
      ),
      (
        "env var collisions",
        true,
        strings(&["KEY=OTHER_VALUE", "DOCKER_BUILDKIT=0"]),
        strings(&["KEY=VALUE", "KEY=OTHER_VALUE", "DOCKER_BUILDKIT=0", "DOCKER_BUILDKIT=1"]),
      ),
    ];

    for (name, use_buildkit, extra_env, expected_env) in cases {
      let config = LocalBuildConfig {
        use_buildkit,
        extra_env,
        ..LocalBuildConfig::default()
      };
      let spec = run_cli(config, &["KEY=VALUE"], &artifact).await;

      assert_eq!(spec.program, "docker", "{name}");
      assert_eq!(spec.args, expected_args, "{name}");
      assert_eq!(spec.env, expected_env, "{name}");
      assert_eq!(spec.dir, dunce::canonicalize(temp.path()).unwrap(), "{name}");
    }
  }

  #[tokio::test]
  async fn cli_passes_resolved_artifact_references() {
    let temp = workspace_with_dockerfile();
    let artifact = Artifact::docker("app")
      .with_workspace(temp.path())
      .with_build_arg("BASE", Some("$${artifact:base}"))
      .with_build_arg("USER", Some("$${env:KEY}"))
      .with_build_arg("TOKEN", None);

    let runner = RecordingRunner::default();
    let builder = LocalBuilder::new(LocalBuildConfig::default())
      .with_env_source(StaticEnvironment::new(["KEY=VALUE"]))
      .with_runner(runner.clone());

    let resolver = Arc::new(crate::resolver::ArtifactResolver::with_prebuilt([("base", "base:abc")]));
    let ctx = BuildContext::new(RunMode::Dev).with_resolver(resolver);
    builder.build(&ctx, &mut tokio::io::sink(), &artifact, "app:v1").await.unwrap();

    let spec = runner.calls.lock().unwrap().remove(0);
    let args = spec.args.join(" ");
    assert!(args.contains("--build-arg BASE=base:abc"));
    assert!(args.contains("--build-arg TOKEN --build-arg USER=VALUE"));
    assert!(args.ends_with("--force-rm"));
  }

  #[tokio::test]
  async fn cli_failure_is_build_failed() {
    let temp = workspace_with_dockerfile();
    let artifact = Artifact::docker("app").with_workspace(temp.path());
    let builder = LocalBuilder::new(LocalBuildConfig::default())
      .with_env_source(StaticEnvironment::default())
      .with_runner(RecordingRunner {
        fail_with: Some(1),
        ..Default::default()
      });

    let err = builder
      .build(&BuildContext::new(RunMode::Dev), &mut tokio::io::sink(), &artifact, "tag")
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::BuildFailed { ref artifact, .. } if artifact == "app"));
  }

  #[tokio::test]
  async fn missing_dockerfile() {
    let temp = TempDir::new().unwrap();
    let artifact = Artifact::docker("app").with_workspace(temp.path());
    let runner = RecordingRunner::default();
    let builder = LocalBuilder::new(LocalBuildConfig::default()).with_runner(runner.clone());

    let err = builder
      .build(&BuildContext::new(RunMode::Dev), &mut tokio::io::sink(), &artifact, "tag")
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::DockerfileNotFound { .. }));
    assert!(runner.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn custom_artifacts_are_unsupported() {
    let builder = LocalBuilder::new(LocalBuildConfig::default());
    let err = builder
      .build(
        &BuildContext::new(RunMode::Dev),
        &mut tokio::io::sink(),
        &Artifact::custom("tool", "make"),
        "tag",
      )
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::Unsupported { kind: "custom", .. }));
  }

  #[tokio::test]
  async fn api_strategy_uses_daemon() {
    let temp = workspace_with_dockerfile();
    let artifact = Artifact::docker("app")
      .with_workspace(temp.path())
      .with_build_arg("FROM_ENV", None)
      .with_build_arg("MISSING", None);

    let daemon = RecordingDaemon::default();
    let runner = RecordingRunner::default();
    let config = LocalBuildConfig {
      use_docker_cli: false,
      force_remove: false,
      ..LocalBuildConfig::default()
    };
    let builder = LocalBuilder::new(config)
      .with_env_source(StaticEnvironment::new(["FROM_ENV=value"]))
      .with_runner(runner.clone())
      .with_daemon(daemon.clone());

    let built = builder
      .build(&BuildContext::new(RunMode::Debug), &mut tokio::io::sink(), &artifact, "app:v1")
      .await
      .unwrap();

    assert_eq!(built.digest.as_deref(), Some("sha256:feed"));
    assert!(runner.calls.lock().unwrap().is_empty());

    let request = daemon.requests.lock().unwrap().remove(0);
    assert_eq!(request.tag, "app:v1");
    assert_eq!(request.dockerfile, "Dockerfile");
    assert!(!request.force_remove);
    assert_eq!(request.build_args["FROM_ENV"], "value");
    assert_eq!(request.build_args["SKAFFOLD_GO_GCFLAGS"], "all=-N -l");
    assert!(!request.build_args.contains_key("MISSING"));
  }

  #[test]
  #[serial]
  fn docker_host_resolution() {
    temp_env::with_var(DOCKER_HOST_ENV, Some("tcp://10.0.0.1:2376"), || {
      assert_eq!(LocalBuildConfig::default().resolved_docker_host(), "tcp://10.0.0.1:2376");

      let config = LocalBuildConfig {
        docker_host: Some("tcp://builder:2375".to_string()),
        ..LocalBuildConfig::default()
      };
      assert_eq!(config.resolved_docker_host(), "tcp://builder:2375");
    });

    temp_env::with_var_unset(DOCKER_HOST_ENV, || {
      assert_eq!(LocalBuildConfig::default().resolved_docker_host(), DEFAULT_DOCKER_HOST);
    });
  }
}
