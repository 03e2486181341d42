//! Docker client build strategy.

use std::path::Path;

use crate::artifact::DockerArtifact;
use crate::buildargs::BuildArgs;
use crate::builder::BuildError;
use crate::builder::process::CommandError;

/// Arguments for `docker build`, run from the workspace with `.` as context.
///
/// Build args come in key order. `--force-rm` is always last.
pub fn docker_build_args(dockerfile: &Path, tag: &str, docker: &DockerArtifact, args: &BuildArgs) -> Vec<String> {
  let mut argv = vec![
    "build".to_string(),
    ".".to_string(),
    "--file".to_string(),
    dockerfile.to_string_lossy().to_string(),
    "-t".to_string(),
    tag.to_string(),
  ];

  for (name, value) in args {
    argv.push("--build-arg".to_string());
    match value {
      Some(value) => argv.push(format!("{name}={value}")),
      // Let the client take the value from its environment
      None => argv.push(name.clone()),
    }
  }

  for image in &docker.cache_from {
    argv.push("--cache-from".to_string());
    argv.push(image.clone());
  }

  if let Some(target) = &docker.target {
    argv.push("--target".to_string());
    argv.push(target.clone());
  }

  if let Some(network) = &docker.network_mode {
    argv.push("--network".to_string());
    argv.push(network.clone());
  }

  if docker.no_cache {
    argv.push("--no-cache".to_string());
  }

  argv.push("--force-rm".to_string());
  argv
}

pub(crate) fn into_build_error(artifact: &str, err: CommandError) -> BuildError {
  match err {
    CommandError::Cancelled => BuildError::Cancelled {
      artifact: artifact.to_string(),
    },
    CommandError::Failed { code } => BuildError::BuildFailed {
      artifact: artifact.to_string(),
      cause: match code {
        Some(code) => format!("docker build exited with code {code}"),
        None => "docker build terminated by signal".to_string(),
      },
    },
    CommandError::Spawn { program, source } => BuildError::BuildFailed {
      artifact: artifact.to_string(),
      cause: format!("could not run {program}: {source}"),
    },
    CommandError::Io(source) => BuildError::Io {
      artifact: artifact.to_string(),
      source,
    },
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn minimal_build() {
    let argv = docker_build_args(
      &PathBuf::from("/ws/Dockerfile"),
      "tag",
      &DockerArtifact::default(),
      &BuildArgs::new(),
    );
    assert_eq!(
      argv,
      strings(&["build", ".", "--file", "/ws/Dockerfile", "-t", "tag", "--force-rm"])
    );
  }

  #[test]
  fn every_option() {
    let docker = DockerArtifact {
      target: Some("release".to_string()),
      cache_from: vec!["app:cache".to_string(), "base:cache".to_string()],
      no_cache: true,
      network_mode: Some("host".to_string()),
      ..DockerArtifact::default()
    };
    let args: BuildArgs = [
      ("Z".to_string(), Some("last".to_string())),
      ("A".to_string(), Some("a b".to_string())),
      ("PASS".to_string(), None),
    ]
    .into_iter()
    .collect();

    let argv = docker_build_args(&PathBuf::from("/ws/Dockerfile"), "app:v1", &docker, &args);
    assert_eq!(
      argv,
      strings(&[
        "build",
        ".",
        "--file",
        "/ws/Dockerfile",
        "-t",
        "app:v1",
        "--build-arg",
        "A=a b",
        "--build-arg",
        "PASS",
        "--build-arg",
        "Z=last",
        "--cache-from",
        "app:cache",
        "--cache-from",
        "base:cache",
        "--target",
        "release",
        "--network",
        "host",
        "--no-cache",
        "--force-rm",
      ])
    );
  }

  #[test]
  fn command_errors_map_to_build_errors() {
    assert!(into_build_error("app", CommandError::Cancelled).is_cancelled());

    match into_build_error("app", CommandError::Failed { code: Some(2) }) {
      BuildError::BuildFailed { artifact, cause } => {
        assert_eq!(artifact, "app");
        assert!(cause.contains("code 2"));
      }
      other => panic!("unexpected {other:?}"),
    }
  }
}
