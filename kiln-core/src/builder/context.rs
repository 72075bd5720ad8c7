//! Build-context packaging.
//!
//! The context is a tar archive holding the manifest as `Dockerfile` plus
//! every file under the path mappings that the ignore filter lets through.
//! It is produced on a blocking task and handed to the daemon as an
//! [`AsyncRead`] over a bounded channel, so a large context is never held in
//! memory and the writer stalls while the daemon is slow to read.
//!
//! A failure on the writer side travels down the channel as an error item:
//! the daemon-side reader sees it as a failed read, never as a clean EOF.

use crate::builder::manifest::BuildManifest;
use crate::error::{KilnError, Result};
use crate::model::{PathMapping, PathMatcher};
use bytes::Bytes;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the manifest inside the context archive.
pub const MANIFEST_NAME: &str = "Dockerfile";

/// Read side of the context pipe. Fails every read once packaging is
/// cancelled, even if chunks are still queued.
pub struct ContextStream {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
    cancel: CancellationToken,
}

impl AsyncRead for ContextStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(cancelled()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Handle of the packaging task. Resolves once the archive is complete or
/// has failed.
pub type PackageHandle = JoinHandle<Result<()>>;

/// Streams build contexts through a bounded channel.
#[derive(Debug, Clone)]
pub struct ContextPackager {
    capacity: usize,
    chunk_size: usize,
}

impl Default for ContextPackager {
    fn default() -> Self {
        Self { capacity: 16, chunk_size: 64 * 1024 }
    }
}

impl ContextPackager {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self { capacity: capacity.max(1), chunk_size: chunk_size.max(1) }
    }

    /// Start packaging. Must be called from within a tokio runtime.
    pub fn package(
        &self,
        manifest: &BuildManifest,
        mappings: Vec<PathMapping>,
        filter: Arc<dyn PathMatcher>,
        cancel: CancellationToken,
    ) -> (ContextStream, PackageHandle) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let manifest = manifest.to_string();
        let chunk_size = self.chunk_size;
        let runtime = Handle::current();
        let stream_cancel = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter { tx, cancel, runtime };
            let mut writer = BufWriter::with_capacity(chunk_size, writer);
            let result = write_context(&mut writer, &manifest, &mappings, filter.as_ref());

            match result {
                Ok(()) => {
                    debug!(mappings = mappings.len(), "Build context written");
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "Packaging build context failed");
                    // Ignored if the reader is gone or the build was cancelled.
                    let (channel, _unsent) = writer.into_parts();
                    let _ = channel.send(Err(io::Error::new(e.kind(), e.to_string())));
                    Err(KilnError::transport("tarring context", e))
                }
            }
        });

        let inner = StreamReader::new(ReceiverStream::new(rx));
        (ContextStream { inner, cancel: stream_cancel }, handle)
    }
}

fn cancelled() -> io::Error {
    io::Error::other("build cancelled")
}

/// `Write` end of the channel. Each flushed buffer becomes one chunk.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl ChannelWriter {
    /// Blocks until the reader has room for `item`, the reader is gone or
    /// the build is cancelled.
    fn send(&self, item: io::Result<Bytes>) -> io::Result<()> {
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(cancelled()),
                sent = self.tx.send(item) => sent.map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "context reader closed")
                }),
            }
        })
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Ok(Bytes::copy_from_slice(buf)))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_context<W: Write>(
    writer: W,
    manifest: &str,
    mappings: &[PathMapping],
    filter: &dyn PathMatcher,
) -> io::Result<()> {
    let mut archive = tar::Builder::new(writer);
    archive.follow_symlinks(false);

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, MANIFEST_NAME, manifest.as_bytes())?;

    for mapping in mappings {
        append_mapping(&mut archive, mapping, filter)?;
    }

    let mut writer = archive.into_inner()?;
    writer.flush()
}

fn append_mapping<W: Write>(
    archive: &mut tar::Builder<W>,
    mapping: &PathMapping,
    filter: &dyn PathMatcher,
) -> io::Result<()> {
    let root = mapping.local_path();
    if std::fs::symlink_metadata(root).is_err() {
        debug!(path = %root.display(), "Skipping missing sync path");
        return Ok(());
    }

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !filter.matches(entry.path()));

    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).unwrap_or_else(|_| Path::new(""));
        let name = archive_name(mapping, rel);
        if name.is_empty() {
            // The context root itself.
            continue;
        }

        if entry.file_type().is_dir() {
            archive.append_dir(&name, entry.path())?;
        } else {
            archive.append_path_with_name(entry.path(), &name)?;
        }
    }

    Ok(())
}

fn archive_name(mapping: &PathMapping, rel: &Path) -> String {
    let mut name = mapping.archive_path().trim_end_matches('/').to_string();
    for component in rel.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}
