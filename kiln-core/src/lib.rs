//! kiln core library
//!
//! Image-build engine for a container development loop: synthesizes build
//! manifests with live-update ordering, streams build contexts to a build
//! daemon, decodes its output and tags images by content digest.

pub mod builder;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;

// Re-export commonly used items
pub use builder::{DaemonClient, Digest, ImageBuilder};
pub use config::BuilderConfig;
pub use error::{KilnError, Result};
pub use model::{Cmd, PathMapping, PathMatcher, PathSet, Run, SyncRule};
pub use observability::init as init_observability;
pub use oci_distribution::Reference;
