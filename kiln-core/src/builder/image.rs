//! Image builds against a container build daemon.
//!
//! Every build follows the same path: render the manifest, stream the
//! context, decode the daemon's response, resolve the content digest and
//! tag the image with it. The three entry points differ only in where the
//! manifest comes from.

use crate::builder::client::{BuildOptions, DaemonClient};
use crate::builder::context::ContextPackager;
use crate::builder::manifest::{indent, BuildManifest, BuildMode};
use crate::builder::output::{BuildOutput, LogWriter, OutputDecoder};
use crate::builder::synth::ManifestSynthesizer;
use crate::builder::tag::{digest_from_aux, tagged_reference, Digest};
use crate::config::BuilderConfig;
use crate::error::{KilnError, Result};
use crate::model::{Cmd, PathMapping, PathMatcher, Run, SyncRule};
use crate::observability::metrics;
use oci_distribution::Reference;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A build from a user-supplied Dockerfile.
#[derive(Debug, Clone, Default)]
pub struct DockerBuild {
    /// Dockerfile contents.
    pub dockerfile: String,
    /// Directory sent as the build context.
    pub build_path: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub pull_parent: bool,
    pub network: Option<String>,
}

/// Builds, tags and pushes images through a [`DaemonClient`].
pub struct ImageBuilder<C: DaemonClient> {
    client: C,
    config: BuilderConfig,
    synthesizer: ManifestSynthesizer,
    packager: ContextPackager,
}

impl<C: DaemonClient> ImageBuilder<C> {
    pub fn new(client: C, config: BuilderConfig) -> Self {
        let synthesizer = ManifestSynthesizer::new(config.extra_labels.clone());
        let packager =
            ContextPackager::new(config.context_channel_capacity, config.context_chunk_size);
        Self { client, config, synthesizer, packager }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build `build.dockerfile` with `build.build_path` as the context root.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn build_image(
        &self,
        reference: &Reference,
        build: &DockerBuild,
        filter: Arc<dyn PathMatcher>,
        cancel: &CancellationToken,
    ) -> Result<Reference> {
        let manifest = BuildManifest::new(build.dockerfile.as_str());
        let mappings = vec![PathMapping::new(build.build_path.clone(), "/")?];
        let options = BuildOptions {
            build_args: build.build_args.clone(),
            target: build.target.clone(),
            cache_from: build.cache_from.clone(),
            pull_parent: build.pull_parent,
            network: build.network.clone(),
            ..Default::default()
        };

        self.build_from_manifest(
            reference,
            manifest,
            mappings,
            filter,
            options,
            "dockerfile",
            cancel,
        )
        .await
    }

    /// Synthesize a manifest from `base`, `syncs` and `runs`, then build it.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn fast_build_image(
        &self,
        reference: &Reference,
        base: &str,
        syncs: &[SyncRule],
        filter: Arc<dyn PathMatcher>,
        runs: &[Run],
        entrypoint: Option<&Cmd>,
        cancel: &CancellationToken,
    ) -> Result<Reference> {
        let synthesized = self
            .synthesizer
            .synthesize(BuildManifest::new(base), runs, syncs, entrypoint)
            .map_err(|e| e.wrap("fast build"))?;

        self.build_from_manifest(
            reference,
            synthesized.manifest,
            synthesized.mappings,
            filter,
            BuildOptions::default(),
            BuildMode::Scratch.as_str(),
            cancel,
        )
        .await
    }

    /// Sync files into `existing` and rerun `runs` on top of it.
    #[instrument(skip_all, fields(reference = %reference, existing = %existing))]
    pub async fn update_image(
        &self,
        reference: &Reference,
        existing: &Reference,
        syncs: &[SyncRule],
        filter: Arc<dyn PathMatcher>,
        runs: &[Run],
        cancel: &CancellationToken,
    ) -> Result<Reference> {
        let synthesized = self
            .synthesizer
            .synthesize_update(&existing.whole(), runs, syncs)
            .map_err(|e| e.wrap("update image"))?;

        self.build_from_manifest(
            reference,
            synthesized.manifest,
            synthesized.mappings,
            filter,
            BuildOptions::default(),
            BuildMode::Existing.as_str(),
            cancel,
        )
        .await
    }

    /// Tag the image `digest` with its content tag under `reference`'s
    /// repository.
    pub async fn tag_image(&self, reference: &Reference, digest: &Digest) -> Result<Reference> {
        let tagged = tagged_reference(reference, digest)?;
        self.client
            .image_tag(digest.as_str(), &tagged.whole())
            .await
            .map_err(|e| e.wrap("ImageTag"))?;
        debug!(digest = %digest, tagged = %tagged, "Tagged image");
        Ok(tagged)
    }

    /// Push `reference`, printing the daemon's progress.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn push_image(
        &self,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("Pushing {}", reference);

        let result = self
            .with_deadline(async {
                let body = self
                    .client
                    .image_push(reference)
                    .await
                    .map_err(|e| e.wrap("ImagePush"))?;
                let mut decoder = self.decoder();
                decoder.decode(body, cancel).await.map_err(|e| wrap_decode(e, "ImagePush"))
            })
            .await;

        match &result {
            Ok(_) => metrics::record_push("success"),
            Err(e) => {
                warn!(error = %e, "Push failed");
                metrics::record_push(failure_reason(e));
            }
        }
        result.map(|_| ())
    }

    /// Returns true if the daemon has an image named exactly `reference`.
    pub async fn image_exists(&self, reference: &Reference) -> Result<bool> {
        let images = self
            .client
            .image_list(&reference.whole())
            .await
            .map_err(|e| e.wrap("ImageList"))?;
        Ok(!images.is_empty())
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_from_manifest(
        &self,
        reference: &Reference,
        manifest: BuildManifest,
        mappings: Vec<PathMapping>,
        filter: Arc<dyn PathMatcher>,
        options: BuildOptions,
        mode: &str,
        cancel: &CancellationToken,
    ) -> Result<Reference> {
        let start = Instant::now();
        info!("Building Dockerfile:\n{}", indent(&manifest.to_string(), "  "));
        for mapping in &mappings {
            debug!("Adding {}", mapping.pretty_str());
        }

        let result = self
            .with_deadline(self.exchange(reference, &manifest, mappings, filter, options, cancel))
            .await;

        match &result {
            Ok(tagged) => {
                metrics::record_build(start.elapsed().as_secs_f64(), mode);
                info!(tagged = %tagged, "Build complete in {:.2}s", start.elapsed().as_secs_f64());
            }
            Err(e) => {
                metrics::record_build_failure(failure_reason(e));
                warn!(error = %e, "Build failed");
            }
        }
        result
    }

    async fn exchange(
        &self,
        reference: &Reference,
        manifest: &BuildManifest,
        mappings: Vec<PathMapping>,
        filter: Arc<dyn PathMatcher>,
        options: BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<Reference> {
        // Stops the packager on every exit, including when this future is dropped.
        let packaging = cancel.child_token();
        let _guard = packaging.clone().drop_guard();

        let (context, packager) = self.packager.package(manifest, mappings, filter, packaging);
        let body = self
            .client
            .image_build(context, options)
            .await
            .map_err(|e| e.wrap("ImageBuild"))?;

        let mut decoder = self.decoder();
        let output = decoder.decode(body, cancel).await.map_err(|e| wrap_decode(e, "ImageBuild"))?;

        let digest = self.resolve_digest(&output).await?;

        // A daemon that answers without draining the context leaves the
        // packager stalled until cancellation.
        let packaged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KilnError::Cancelled),
            joined = packager => joined,
        };
        match packaged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.wrap("ImageBuild")),
            Err(join) => {
                return Err(KilnError::Other(anyhow::anyhow!("context packager failed: {}", join)))
            }
        }

        self.tag_image(reference, &digest).await
    }

    /// Structured digest first, then the legacy short id resolved by
    /// inspection.
    async fn resolve_digest(&self, output: &BuildOutput) -> Result<Digest> {
        if let Some(aux) = &output.aux {
            return digest_from_aux(aux);
        }

        if let Some(short) = &output.short_digest {
            debug!(short = %short, "Resolving legacy build id");
            metrics::record_legacy_digest();
            let inspect = self
                .client
                .image_inspect(short)
                .await
                .map_err(|e| e.wrap("ImageInspect"))?;
            return Ok(Digest::new(inspect.id));
        }

        Err(KilnError::NoDigest)
    }

    fn decoder(&self) -> OutputDecoder<LogWriter> {
        OutputDecoder::with_progress_wait(LogWriter::new(), self.config.progress_initial_wait())
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.build_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(KilnError::Timeout(limit))),
            None => fut.await,
        }
    }
}

/// Daemon build errors and cancellation are surfaced as is; anything else
/// gets the operation name.
fn wrap_decode(e: KilnError, op: &str) -> KilnError {
    match e {
        KilnError::DaemonBuild(_) | KilnError::Cancelled => e,
        other => other.wrap(op),
    }
}

fn failure_reason(e: &KilnError) -> &'static str {
    match e.root() {
        KilnError::Cancelled => "cancelled",
        KilnError::Timeout(_) => "timeout",
        KilnError::DaemonBuild(_) => "daemon_build",
        KilnError::NoDigest => "no_digest",
        KilnError::Decode(_) | KilnError::TraceDecode { .. } | KilnError::InvalidAux { .. } => {
            "protocol"
        }
        KilnError::Transport { .. } | KilnError::Daemon { .. } | KilnError::Other(_) => "transport",
        _ => "config",
    }
}
