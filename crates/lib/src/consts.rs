//! Names and defaults shared across the crate.

/// Dockerfile looked up when an artifact doesn't name one.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Default client binary for the CLI build strategy.
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

/// Daemon endpoint used by the API strategy when `DOCKER_HOST` is unset.
pub const DEFAULT_DOCKER_HOST: &str = "tcp://localhost:2375";

/// Environment variable selecting the daemon endpoint.
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Environment variable that switches the docker client to BuildKit.
pub const BUILDKIT_ENV: &str = "DOCKER_BUILDKIT";

/// Build argument injected in debug mode so Go binaries keep debug info.
pub const DEBUG_GCFLAGS_ARG: &str = "SKAFFOLD_GO_GCFLAGS";

/// Value of [`DEBUG_GCFLAGS_ARG`] in debug mode.
pub const DEBUG_GCFLAGS_VALUE: &str = "all=-N -l";

/// Environment variable overriding the scheduler's concurrency limit.
pub const CONCURRENCY_ENV: &str = "DOCKYARD_CONCURRENCY";

/// Environment variable overriding the scheduler's failure policy.
pub const FAILURE_POLICY_ENV: &str = "DOCKYARD_FAILURE_POLICY";

/// Variable carrying the tag to produce, for custom builds.
pub const CUSTOM_IMAGE_ENV: &str = "IMAGE";

/// Variable carrying the absolute workspace, for custom builds.
pub const CUSTOM_CONTEXT_ENV: &str = "BUILD_CONTEXT";
