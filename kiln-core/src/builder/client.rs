//! Build daemon client interface.
//!
//! The builder only talks to the daemon through [`DaemonClient`]. Transport
//! (unix socket, TCP, TLS) and authentication belong to the implementation.

use crate::builder::context::{ContextStream, MANIFEST_NAME};
use crate::error::Result;
use async_trait::async_trait;
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Raw daemon response: concatenated JSON messages.
pub type ResponseBody = Pin<Box<dyn AsyncRead + Send>>;

/// Options sent with a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Manifest path inside the context.
    pub dockerfile: String,
    /// Remove intermediate containers after a successful build.
    pub remove: bool,
    pub build_args: BTreeMap<String, String>,
    /// Stage to stop at in a multi-stage manifest.
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    /// Always attempt to pull a newer base image.
    pub pull_parent: bool,
    /// Network mode for run steps.
    pub network: Option<String>,
    pub extra_tags: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dockerfile: MANIFEST_NAME.to_string(),
            remove: true,
            build_args: BTreeMap::new(),
            target: None,
            cache_from: Vec::new(),
            pull_parent: false,
            network: None,
            extra_tags: Vec::new(),
        }
    }
}

/// Entry of an image listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Result of inspecting a single image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    /// Full content digest, `sha256:...`.
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

/// Operations the builder needs from a container build daemon.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Start a build. The daemon reads `context` while the response streams.
    async fn image_build(
        &self,
        context: ContextStream,
        options: BuildOptions,
    ) -> Result<ResponseBody>;

    /// List images matching an exact reference filter.
    async fn image_list(&self, reference_filter: &str) -> Result<Vec<ImageSummary>>;

    /// Point `target` at the image `source`.
    async fn image_tag(&self, source: &str, target: &str) -> Result<()>;

    async fn image_inspect(&self, id: &str) -> Result<ImageInspect>;

    /// Push `reference` to its registry.
    async fn image_push(&self, reference: &Reference) -> Result<ResponseBody>;
}
