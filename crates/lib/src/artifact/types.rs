use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_DOCKERFILE;

/// A declared artifact. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
  /// Identity of the artifact within a run.
  pub image_name: String,

  /// Directory the build runs in; relative paths are resolved against the
  /// process working directory.
  #[serde(default = "default_workspace")]
  pub workspace: PathBuf,

  /// Other artifacts of the run this artifact needs built first.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub requires: Vec<ArtifactDependency>,

  /// The build mechanism.
  #[serde(flatten)]
  pub kind: BuildKind,
}

fn default_workspace() -> PathBuf {
  PathBuf::from(".")
}

/// The build mechanism backing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
  /// Built by the local container daemon from a Dockerfile.
  Docker(DockerArtifact),
  /// Built by an arbitrary user command.
  Custom(CustomArtifact),
}

impl BuildKind {
  pub fn name(&self) -> &'static str {
    match self {
      BuildKind::Docker(_) => "docker",
      BuildKind::Custom(_) => "custom",
    }
  }
}

/// Settings for an artifact built from a Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerArtifact {
  /// Dockerfile path, relative to the workspace.
  #[serde(default = "default_dockerfile")]
  pub dockerfile: PathBuf,

  /// Build-time arguments. A `None` value is passed to the backend without a
  /// value so it falls back to its own environment or default.
  #[serde(default)]
  pub build_args: BTreeMap<String, Option<String>>,

  /// Target stage of a multi-stage Dockerfile.
  #[serde(default)]
  pub target: Option<String>,

  /// Images used as cache sources.
  #[serde(default)]
  pub cache_from: Vec<String>,

  /// Disable the build cache.
  #[serde(default)]
  pub no_cache: bool,

  /// Networking mode for `RUN` instructions.
  #[serde(default)]
  pub network_mode: Option<String>,
}

fn default_dockerfile() -> PathBuf {
  PathBuf::from(DEFAULT_DOCKERFILE)
}

impl Default for DockerArtifact {
  fn default() -> Self {
    Self {
      dockerfile: default_dockerfile(),
      build_args: BTreeMap::new(),
      target: None,
      cache_from: Vec::new(),
      no_cache: false,
      network_mode: None,
    }
  }
}

/// Settings for an artifact built by a user-supplied command.
///
/// The command receives the tag to produce in `IMAGE` and the absolute
/// workspace in `BUILD_CONTEXT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomArtifact {
  pub build_command: String,

  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

/// An explicit dependency on another artifact of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDependency {
  pub image_name: String,

  /// When set, the dependency's tag is passed to the dependent build under
  /// this name (as a build argument or environment variable).
  #[serde(default)]
  pub alias: Option<String>,
}

impl Artifact {
  /// Declare an artifact built from `Dockerfile` in the current directory.
  pub fn docker(image_name: impl Into<String>) -> Self {
    Self {
      image_name: image_name.into(),
      workspace: default_workspace(),
      requires: Vec::new(),
      kind: BuildKind::Docker(DockerArtifact::default()),
    }
  }

  /// Declare an artifact built by a shell command.
  pub fn custom(image_name: impl Into<String>, build_command: impl Into<String>) -> Self {
    Self {
      image_name: image_name.into(),
      workspace: default_workspace(),
      requires: Vec::new(),
      kind: BuildKind::Custom(CustomArtifact {
        build_command: build_command.into(),
        env: BTreeMap::new(),
      }),
    }
  }

  pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
    self.workspace = workspace.into();
    self
  }

  /// Add a build argument. Ignored for non-Docker artifacts.
  pub fn with_build_arg(mut self, name: &str, value: Option<&str>) -> Self {
    if let BuildKind::Docker(docker) = &mut self.kind {
      docker.build_args.insert(name.to_string(), value.map(str::to_string));
    }
    self
  }

  pub fn with_requires(mut self, image_name: &str, alias: Option<&str>) -> Self {
    self.requires.push(ArtifactDependency {
      image_name: image_name.to_string(),
      alias: alias.map(str::to_string),
    });
    self
  }

  pub fn docker_config(&self) -> Option<&DockerArtifact> {
    match &self.kind {
      BuildKind::Docker(docker) => Some(docker),
      BuildKind::Custom(_) => None,
    }
  }
}

/// The outcome of a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltArtifact {
  pub image_name: String,
  pub tag: String,

  /// Image ID reported by the backend, when it reports one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub digest: Option<String>,
}

impl BuiltArtifact {
  pub fn new(image_name: impl Into<String>, tag: impl Into<String>) -> Self {
    Self {
      image_name: image_name.into(),
      tag: tag.into(),
      digest: None,
    }
  }

  pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
    self.digest = Some(digest.into());
    self
  }
}

impl fmt::Display for BuiltArtifact {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.digest {
      Some(digest) => write!(f, "{}@{}", self.tag, digest),
      None => f.write_str(&self.tag),
    }
  }
}
