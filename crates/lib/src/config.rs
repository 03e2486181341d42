//! Build plan configuration.
//!
//! A build plan is a JSON document naming the artifacts of a run together
//! with local build and scheduler settings:
//!
//! ```json
//! {
//!   "artifacts": [
//!     { "image_name": "base", "docker": {} },
//!     { "image_name": "app", "docker": { "build_args": { "BASE": "$${artifact:base}" } } }
//!   ],
//!   "local": { "use_buildkit": true },
//!   "execute": { "concurrency": 2, "failure_policy": "best-effort" },
//!   "overlays": { "debug": { "LOG_LEVEL": "debug" } }
//! }
//! ```
//!
//! `DOCKYARD_CONCURRENCY` and `DOCKYARD_FAILURE_POLICY` override the file's
//! scheduler settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::artifact::Artifact;
use crate::buildargs::ModeOverlays;
use crate::builder::Builders;
use crate::builder::local::LocalBuildConfig;
use crate::consts::{CONCURRENCY_ENV, FAILURE_POLICY_ENV};
use crate::execute::{BuildRun, ExecuteConfig, ExecuteError, FailurePolicy, RunResult};
use crate::types::RunMode;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid build plan: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid value for {name}: {message}")]
  InvalidValue { name: String, message: String },
}

/// Everything needed to run a set of builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
  pub artifacts: Vec<Artifact>,

  #[serde(default)]
  pub local: LocalBuildConfig,

  #[serde(default)]
  pub execute: ExecuteConfig,

  /// Build-arg overlays per run mode.
  #[serde(default)]
  pub overlays: ModeOverlays,

  /// Tags of images built outside the run.
  #[serde(default)]
  pub prebuilt: BTreeMap<String, String>,

  /// Tag suffix applied to every artifact.
  #[serde(default)]
  pub tag: Option<String>,
}

impl BuildPlan {
  /// Parse a plan from JSON and apply environment overrides.
  pub fn parse(json: &str) -> Result<Self, ConfigError> {
    let mut plan: BuildPlan = serde_json::from_str(json)?;
    plan.apply_env_overrides()?;
    plan.validate()?;
    Ok(plan)
  }

  /// Load a plan from a JSON file and apply environment overrides.
  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    debug!(path = ?path, "loading build plan");
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&json)
  }

  /// Apply `DOCKYARD_CONCURRENCY` and `DOCKYARD_FAILURE_POLICY`.
  pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
    if let Some(value) = env_value(CONCURRENCY_ENV) {
      self.execute.concurrency = value.parse().map_err(|_| ConfigError::InvalidValue {
        name: CONCURRENCY_ENV.to_string(),
        message: format!("expected a positive integer, got {value:?}"),
      })?;
    }

    if let Some(value) = env_value(FAILURE_POLICY_ENV) {
      self.execute.failure_policy = value
        .parse::<FailurePolicy>()
        .map_err(|message| ConfigError::InvalidValue {
          name: FAILURE_POLICY_ENV.to_string(),
          message,
        })?;
    }

    Ok(())
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.execute.concurrency == 0 {
      return Err(ConfigError::InvalidValue {
        name: "execute.concurrency".to_string(),
        message: "must be at least 1".to_string(),
      });
    }
    Ok(())
  }

  /// A run over this plan's artifacts in `mode`.
  pub fn run(&self, mode: RunMode) -> BuildRun {
    let run = BuildRun::new(self.artifacts.clone(), mode)
      .with_config(self.execute.clone())
      .with_overlays(self.overlays.clone())
      .with_prebuilt(self.prebuilt.clone());

    match &self.tag {
      Some(tag) => run.with_tagger(crate::tag::FixedTagger::new(tag.clone())),
      None => run,
    }
  }

  /// The backends configured by this plan.
  pub fn builders(&self) -> Builders {
    Builders::local(self.local.clone())
  }

  /// Build every artifact with the local backends.
  pub async fn execute(&self, mode: RunMode) -> Result<RunResult, ExecuteError> {
    self.run(mode).execute(Arc::new(self.builders())).await
  }
}

fn env_value(name: &str) -> Option<String> {
  std::env::var(name)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}
