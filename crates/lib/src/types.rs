use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The mode the outer tool is running in.
///
/// The orchestration core never interprets the mode beyond selecting which
/// build-arg overlays apply to an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
  #[default]
  Dev,
  Run,
  Build,
  Debug,
}

impl RunMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunMode::Dev => "dev",
      RunMode::Run => "run",
      RunMode::Build => "build",
      RunMode::Debug => "debug",
    }
  }
}

impl fmt::Display for RunMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RunMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "dev" => Ok(RunMode::Dev),
      "run" => Ok(RunMode::Run),
      "build" => Ok(RunMode::Build),
      "debug" => Ok(RunMode::Debug),
      other => Err(format!("unknown run mode: {other}")),
    }
  }
}
