//! Image building against a container build daemon.
//!
//! Data flows one way through the submodules:
//! [`synth`] turns a build spec into a [`manifest`], [`context`] streams it
//! together with the synced files, the daemon's answer goes through
//! [`output`] (and [`trace`] for graph-solver daemons), and [`tag`] turns the
//! resulting digest into the image's tag. [`image`] drives the whole exchange.

pub mod cleanup;
pub mod client;
pub mod context;
pub mod image;
pub mod manifest;
pub mod output;
pub mod synth;
pub mod tag;
pub mod trace;

pub use cleanup::cleanup_build_error;
pub use client::{BuildOptions, DaemonClient, ImageInspect, ImageSummary, ResponseBody};
pub use context::{ContextPackager, ContextStream, PackageHandle, MANIFEST_NAME};
pub use image::{DockerBuild, ImageBuilder};
pub use manifest::{BuildManifest, BuildMode, Labels, BUILD_MODE_LABEL};
pub use output::{BuildOutput, LogWriter, OutputDecoder};
pub use synth::{ManifestSynthesizer, Synthesized};
pub use tag::{
    digest_as_tag, digest_from_aux, digest_matches_ref, parse_reference, tagged_reference, Digest,
    IMAGE_TAG_PREFIX,
};
pub use trace::TraceRenderer;
