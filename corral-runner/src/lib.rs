//! Corral Runner
//!
//! Executes a single Work Item inside a sandbox:
//! - Image staging: image collections are loaded into the sandbox runtime
//! - Mounts: collections, scratch space, inline JSON and git trees
//! - Job logs: throttled, timestamped, mirrored live as events
//! - Output capture: the output directory becomes a manifest
//!
//! The runner is started by the batch scheduler with the Work Item id and
//! reports the final state back to the Work-Item Store.

pub mod broken_node;
pub mod cache;
pub mod collection;
pub mod config;
pub mod image;
pub mod logging;
pub mod mounts;
pub mod output;
pub mod podman;
pub mod resolver;
pub mod runner;
pub mod sandbox;
pub mod shutdown;

pub use broken_node::BrokenNodeDetector;
pub use cache::ManifestCache;
pub use collection::CollectionWriter;
pub use config::Config;
pub use logging::{JobLogs, ThrottleLimits, ThrottledLogger};
pub use mounts::{CollectionMount, MountPlan};
pub use podman::PodmanRuntime;
pub use resolver::{CollectionResolver, KeepMountResolver};
pub use runner::{FinalState, RunOutcome, Runner};
pub use sandbox::{ContainerSpec, OutputChunk, SandboxRuntime};
