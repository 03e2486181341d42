//! dockyard-lib: artifact build orchestration
//!
//! This crate turns a set of declared container image artifacts into built
//! tags:
//! - `Artifact`: what to build and with which backend
//! - `ArtifactGraph`: build order derived from cross-artifact references
//! - `BuildRun`: layer-by-layer scheduling with bounded concurrency
//! - `ArtifactBuilder`: the backend interface (local daemon, custom command)

pub mod artifact;
pub mod buildargs;
pub mod builder;
pub mod config;
pub mod consts;
pub mod env;
pub mod execute;
pub mod placeholder;
pub mod resolver;
pub mod tag;
pub mod types;
