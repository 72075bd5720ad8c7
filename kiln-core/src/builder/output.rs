//! Build output decoding.
//!
//! The daemon answers a build or push with a stream of concatenated JSON
//! messages. Each message is split into records (see
//! [`kiln_api::DaemonRecord`]) and handled in arrival order:
//!
//! - log text is forwarded to the sink, and scanned for the legacy
//!   `Successfully built <id>` line;
//! - an error record ends decoding with a failure;
//! - progress records are printed, throttled per object id;
//! - graph-trace records go to the [`TraceRenderer`];
//! - the last other aux payload is kept for the caller.

use crate::builder::cleanup::cleanup_build_error;
use crate::builder::trace::TraceRenderer;
use crate::error::{KilnError, Result};
use kiln_api::{DaemonRecord, JsonMessage, JsonProgress};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// First wait between two progress prints for the same id. Doubles after
/// every print.
pub const DEFAULT_PROGRESS_WAIT: Duration = Duration::from_secs(5);

static LEGACY_DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Successfully built ([0-9a-f]+)\s*$").expect("Invalid legacy digest regex")
});

const READ_CHUNK: usize = 8 * 1024;
const BAR_WIDTH: usize = 50;

/// What a completed decode found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutput {
    /// Last non-trace aux payload.
    pub aux: Option<serde_json::Value>,
    /// Id from a `Successfully built <id>` line.
    pub short_digest: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ProgressThrottle {
    last_printed: Instant,
    wait: Duration,
}

/// Decodes one daemon response stream into a sink.
pub struct OutputDecoder<W: Write> {
    sink: W,
    initial_wait: Duration,
    throttle: HashMap<String, ProgressThrottle>,
    trace: TraceRenderer,
}

impl<W: Write> OutputDecoder<W> {
    pub fn new(sink: W) -> Self {
        Self::with_progress_wait(sink, DEFAULT_PROGRESS_WAIT)
    }

    pub fn with_progress_wait(sink: W, initial_wait: Duration) -> Self {
        Self { sink, initial_wait, throttle: HashMap::new(), trace: TraceRenderer::new() }
    }

    /// Graph vertices seen so far.
    pub fn trace(&self) -> &TraceRenderer {
        &self.trace
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Decode `reader` to the end.
    ///
    /// Stops at the first error record. Cancellation is checked before every
    /// read and once more after the stream ends.
    pub async fn decode<R>(
        &mut self,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput>
    where
        R: AsyncRead + Unpin,
    {
        let mut output = BuildOutput::default();
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        // Length of the incomplete message already parsed once.
        let mut pending = 0;

        loop {
            // Reads grow with a large pending message.
            buf.reserve(READ_CHUNK.max(buf.len()));
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KilnError::Cancelled),
                read = reader.read_buf(&mut buf) => {
                    read.map_err(|e| KilnError::transport("reading daemon output", e))?
                }
            };

            if needs_drain(&buf, pending) {
                let consumed = self.drain(&buf, &mut output)?;
                buf.drain(..consumed);
            }
            pending = buf.len();

            if n == 0 {
                break;
            }
        }

        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            // Truncated message at end of stream.
            if let Err(e) = serde_json::from_slice::<JsonMessage>(&buf) {
                return Err(KilnError::Decode(e));
            }
        }

        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        Ok(output)
    }

    /// Handle every complete message in `buf`. Returns the number of bytes
    /// consumed; an incomplete trailing message is left for the next read.
    fn drain(&mut self, buf: &[u8], output: &mut BuildOutput) -> Result<usize> {
        let mut messages = serde_json::Deserializer::from_slice(buf).into_iter::<JsonMessage>();
        loop {
            match messages.next() {
                Some(Ok(message)) => {
                    for record in message.into_records() {
                        self.handle_record(record, output)?;
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(KilnError::Decode(e)),
                None => break,
            }
        }
        Ok(messages.byte_offset())
    }

    fn handle_record(&mut self, record: DaemonRecord, output: &mut BuildOutput) -> Result<()> {
        match record {
            DaemonRecord::Stream(text) => {
                if let Some(caps) = LEGACY_DIGEST.captures(&text) {
                    output.short_digest = Some(caps[1].to_string());
                }
                self.sink.write_all(text.as_bytes()).map_err(write_error)?;
            }
            DaemonRecord::Error(message) => {
                return Err(KilnError::DaemonBuild(cleanup_build_error(&message)));
            }
            DaemonRecord::Progress { id, status, progress } => {
                if self.should_print(&id, &status, &progress) {
                    let line = format!("{}: {} {}", id, status, progress_string(&progress));
                    writeln!(self.sink, "{}", line.trim_end()).map_err(write_error)?;
                }
            }
            DaemonRecord::Trace(payload) => {
                self.trace.render_payload(&payload, &mut self.sink)?;
            }
            DaemonRecord::Aux(payload) => {
                debug!(aux = %payload, "Daemon aux payload");
                output.aux = Some(payload);
            }
        }
        Ok(())
    }

    fn should_print(&mut self, id: &str, status: &str, progress: &JsonProgress) -> bool {
        if progress.current == 0 && (status == "Waiting" || status == "Preparing") {
            return false;
        }

        let now = Instant::now();
        let previous = self.throttle.get(id).copied();
        let print = match previous {
            None => true,
            Some(t) => {
                progress.current == progress.total || now.duration_since(t.last_printed) > t.wait
            }
        };
        if !print {
            return false;
        }

        let wait = match previous {
            Some(t) if !t.wait.is_zero() => t.wait * 2,
            _ => self.initial_wait,
        };
        self.throttle.insert(id.to_string(), ProgressThrottle { last_printed: now, wait });
        true
    }
}

/// Every message is an object, so a pending one can only complete once a
/// closing brace arrives after the `pending` bytes already parsed.
fn needs_drain(buf: &[u8], pending: usize) -> bool {
    pending == 0 || buf[pending..].contains(&b'}')
}

fn write_error(e: io::Error) -> KilnError {
    KilnError::transport("writing build output", e)
}

/// Bar and byte counts for a progress record, e.g.
/// `[=====>      ] 1.2MB/4.8MB`. Empty when nothing is known.
pub fn progress_string(progress: &JsonProgress) -> String {
    let (current, total) = (progress.current, progress.total);
    if current <= 0 && total <= 0 {
        return String::new();
    }
    if total <= 0 {
        return format!("{:>8}", human_size(current));
    }

    let filled = ((current as f64 / total as f64 * 100.0) as usize / 2).min(BAR_WIDTH);
    let bar = format!("[{}>{}] ", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled));
    if current > total {
        return bar;
    }
    format!("{}{:>8}/{}", bar, human_size(current), human_size(total))
}

/// Decimal size with four significant digits: `512B`, `1.5kB`, `12.35MB`.
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

    let mut size = bytes.max(0) as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }

    let int_digits = if size >= 100.0 {
        3
    } else if size >= 10.0 {
        2
    } else {
        1
    };
    let mut text = format!("{:.*}", 4 - int_digits, size);
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{}{}", text, UNITS[unit])
}

/// Sink forwarding complete lines to the log.
#[derive(Debug, Default)]
pub struct LogWriter {
    pending: Vec<u8>,
}

impl LogWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            info!(target: "kiln::build", "{}", line.trim_end_matches('\r'));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            info!(target: "kiln::build", "{}", line);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use kiln_api::trace::Vertex;
    use kiln_api::StatusResponse;
    use prost::Message;

    async fn decode(input: &str) -> (Result<BuildOutput>, String) {
        let mut decoder = OutputDecoder::new(Vec::new());
        let result = decoder.decode(input.as_bytes(), &CancellationToken::new()).await;
        (result, String::from_utf8(decoder.into_sink()).unwrap())
    }

    #[tokio::test]
    async fn test_stream_forwarded_verbatim() {
        let (result, out) =
            decode(r#"{"stream":"Step 1/2 : FROM alpine\n"}{"stream":" ---> abc\n"}"#).await;
        assert_eq!(result.unwrap(), BuildOutput::default());
        assert_eq!(out, "Step 1/2 : FROM alpine\n ---> abc\n");
    }

    #[tokio::test]
    async fn test_legacy_digest_captured() {
        let (result, _) = decode(concat!(
            "{\"stream\":\"Successfully built 0123456789ab\\n\"}\n",
            "{\"stream\":\"Successfully tagged app:latest\\n\"}\n",
        ))
        .await;
        assert_eq!(result.unwrap().short_digest.as_deref(), Some("0123456789ab"));
    }

    #[tokio::test]
    async fn test_last_aux_wins() {
        let (result, _) =
            decode(r#"{"aux":{"ID":"sha256:aaa"}} {"aux":{"ID":"sha256:bbb"}}"#).await;
        assert_eq!(result.unwrap().aux, Some(serde_json::json!({"ID": "sha256:bbb"})));
    }

    #[tokio::test]
    async fn test_error_record_stops_decoding() {
        let input = concat!(
            r#"{"stream":"before\n"}"#,
            r#"{"errorDetail":{"message":"ignored"},"error":"#,
            r#""failed to solve with frontend dockerfile.v0: failed to build LLB: "#,
            r#"executor failed running [/bin/sh -c make]: runc did not terminate sucessfully"}"#,
            r#"{"stream":"after\n"}"#,
        );
        let (result, out) = decode(input).await;
        match result {
            Err(KilnError::DaemonBuild(msg)) => {
                assert_eq!(msg, "executor failed running [/bin/sh -c make]")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out, "before\n");
    }

    #[tokio::test]
    async fn test_stream_handled_before_error_in_same_message() {
        let (result, out) = decode(r#"{"stream":"last words\n","error":"boom"}"#).await;
        assert!(matches!(result, Err(KilnError::DaemonBuild(ref m)) if m == "boom"));
        assert_eq!(out, "last words\n");
    }

    #[tokio::test]
    async fn test_malformed_json_fails() {
        let (result, _) = decode(r#"{"stream":"ok"} not-json"#).await;
        assert!(matches!(result, Err(KilnError::Decode(_))));

        let (result, _) = decode(r#"{"stream":"trunc"#).await;
        assert!(matches!(result, Err(KilnError::Decode(_))));
    }

    #[tokio::test]
    async fn test_message_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(br#"{"stream":"hel"#).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(br#"lo\n"} {"aux":{"ID":"sha256:1"}}"#).await.unwrap();
        });

        let mut decoder = OutputDecoder::new(Vec::new());
        let output = decoder.decode(client, &CancellationToken::new()).await.unwrap();
        writer.await.unwrap();

        assert_eq!(String::from_utf8(decoder.into_sink()).unwrap(), "hello\n");
        assert!(output.aux.is_some());
    }

    #[tokio::test]
    async fn test_large_message_in_small_reads() {
        let text = "x".repeat(256 * 1024);
        let body = format!(r#"{{"stream":"{}"}} {{"aux":{{"ID":"sha256:1"}}}}"#, text);
        let (client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(body.as_bytes()).await.unwrap();
        });

        let mut decoder = OutputDecoder::new(Vec::new());
        let output = decoder.decode(client, &CancellationToken::new()).await.unwrap();
        writer.await.unwrap();

        assert_eq!(decoder.into_sink().len(), text.len());
        assert_eq!(output.aux, Some(serde_json::json!({"ID": "sha256:1"})));
    }

    #[test]
    fn test_needs_drain_waits_for_closing_brace() {
        let buf = br#"{"aux":"QUJD"#;
        assert!(needs_drain(buf, 0));
        assert!(!needs_drain(buf, 4));

        let buf = br#"{"aux":"QUJD"}"#;
        assert!(needs_drain(buf, 12));
    }

    #[tokio::test]
    async fn test_trace_rendered_not_kept_as_aux() {
        let response = StatusResponse {
            vertexes: vec![Vertex {
                digest: "sha256:v1".into(),
                name: "RUN make".into(),
                started: Some(Default::default()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let payload = STANDARD.encode(response.encode_to_vec());
        let input = format!(r#"{{"id":"moby.buildkit.trace","aux":"{}"}}"#, payload);

        let (result, out) = decode(&input).await;
        assert!(result.unwrap().aux.is_none());
        assert!(out.contains("RUN make"));
    }

    #[tokio::test]
    async fn test_bad_trace_payload_fails() {
        let (result, _) = decode(r#"{"id":"moby.buildkit.trace","aux":"%%%"}"#).await;
        assert!(matches!(result, Err(KilnError::TraceDecode { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_read() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut decoder = OutputDecoder::new(Vec::new());
        let result = decoder.decode(&b"{\"stream\":\"x\"}"[..], &cancel).await;
        assert!(matches!(result, Err(KilnError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        let mut decoder = OutputDecoder::new(Vec::new());
        let result = decoder.decode(client, &cancel).await;
        assert!(matches!(result, Err(KilnError::Cancelled)));
    }

    fn progress(id: &str, status: &str, current: i64, total: i64) -> String {
        format!(
            r#"{{"id":"{}","status":"{}","progressDetail":{{"current":{},"total":{}}}}}"#,
            id, status, current, total
        )
    }

    async fn feed(decoder: &mut OutputDecoder<Vec<u8>>, input: String) {
        decoder.decode(input.as_bytes(), &CancellationToken::new()).await.unwrap();
    }

    fn take_lines(decoder: &mut OutputDecoder<Vec<u8>>) -> Vec<String> {
        let lines = String::from_utf8(std::mem::take(&mut decoder.sink))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_throttled_per_id() {
        let mut decoder = OutputDecoder::new(Vec::new());

        feed(&mut decoder, progress("layer1", "Downloading", 10, 100)).await;
        assert_eq!(take_lines(&mut decoder).len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        feed(&mut decoder, progress("layer1", "Downloading", 20, 100)).await;
        assert!(take_lines(&mut decoder).is_empty());

        // A different id has its own window.
        feed(&mut decoder, progress("layer2", "Downloading", 20, 100)).await;
        assert_eq!(take_lines(&mut decoder).len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        feed(&mut decoder, progress("layer1", "Downloading", 30, 100)).await;
        assert_eq!(take_lines(&mut decoder).len(), 1);

        // The window doubled to 10s.
        tokio::time::advance(Duration::from_secs(6)).await;
        feed(&mut decoder, progress("layer1", "Downloading", 40, 100)).await;
        assert!(take_lines(&mut decoder).is_empty());

        // Completion always prints.
        feed(&mut decoder, progress("layer1", "Downloading", 100, 100)).await;
        assert_eq!(take_lines(&mut decoder).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_progress_suppressed() {
        let mut decoder = OutputDecoder::new(Vec::new());
        feed(&mut decoder, progress("layer1", "Waiting", 0, 100)).await;
        feed(&mut decoder, progress("layer1", "Preparing", 0, 0)).await;
        assert!(take_lines(&mut decoder).is_empty());

        // Still the first print for this id.
        feed(&mut decoder, progress("layer1", "Downloading", 1, 100)).await;
        assert_eq!(take_lines(&mut decoder).len(), 1);
    }

    #[tokio::test]
    async fn test_progress_line_format() {
        let mut decoder = OutputDecoder::new(Vec::new());
        feed(&mut decoder, progress("abc123", "Pushing", 1_500_000, 3_000_000)).await;
        let lines = take_lines(&mut decoder);
        assert_eq!(
            lines[0],
            format!("abc123: Pushing [{}>{}]    1.5MB/3MB", "=".repeat(25), " ".repeat(25))
        );
    }

    #[test]
    fn test_progress_string_edges() {
        let p = |current, total| JsonProgress { current, total, start: 0 };
        assert_eq!(progress_string(&p(0, 0)), "");
        assert_eq!(progress_string(&p(2048, 0)), " 2.048kB");
        assert!(progress_string(&p(200, 100)).starts_with(&format!("[{}>]", "=".repeat(50))));
        assert!(!progress_string(&p(200, 100)).contains('/'));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1500), "1.5kB");
        assert_eq!(human_size(12_345_678), "12.35MB");
        assert_eq!(human_size(3_000_000_000), "3GB");
    }

    #[test]
    fn test_log_writer_splits_lines() {
        let mut writer = LogWriter::new();
        writer.write_all(b"partial").unwrap();
        assert_eq!(writer.pending, b"partial");
        writer.write_all(b" line\nnext").unwrap();
        assert_eq!(writer.pending, b"next");
        writer.flush().unwrap();
        assert!(writer.pending.is_empty());
    }
}
