//! Graph-trace rendering.
//!
//! This is a presentation layer only. Per-vertex errors are printed but never
//! fail the build; the daemon reports the failure again as an error record.
//! Only a payload that cannot be decoded is an error here.
//!
//! The vertex table lives for one build. Each vertex prints its start line,
//! its log output and its terminal line at most once, in the order the
//! vertices were first seen.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use colored::Colorize;
use kiln_api::prost_types::Timestamp;
use kiln_api::StatusResponse;
use prost::Message;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use crate::error::{KilnError, Result};

/// Vertices named with this prefix are daemon bookkeeping (context
/// transfer, manifest loading) and are only shown when they fail.
const INTERNAL_PREFIX: &str = "[internal]";

/// One node of the daemon's execution graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    pub digest: String,
    pub name: String,
    pub error: String,
    pub started: bool,
    pub completed: bool,
    pub cached: bool,
    pub duration: Duration,
}

impl Vertex {
    fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_PREFIX)
    }
}

/// Output attributed to a vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLog {
    pub vertex: String,
    pub msg: Vec<u8>,
}

/// Convert a status batch into vertices and logs, in arrival order.
pub fn to_vertices(response: &StatusResponse) -> (Vec<Vertex>, Vec<VertexLog>) {
    let vertices = response
        .vertexes
        .iter()
        .map(|v| {
            let duration = match (&v.started, &v.completed) {
                (Some(started), Some(completed)) => elapsed(started, completed),
                _ => Duration::ZERO,
            };
            Vertex {
                digest: v.digest.clone(),
                name: v.name.clone(),
                error: v.error.clone(),
                started: v.started.is_some(),
                completed: v.completed.is_some(),
                cached: v.cached,
                duration,
            }
        })
        .collect();

    let logs = response
        .logs
        .iter()
        .map(|l| VertexLog { vertex: l.vertex.clone(), msg: l.msg.clone() })
        .collect();

    (vertices, logs)
}

fn elapsed(started: &Timestamp, completed: &Timestamp) -> Duration {
    let nanos = (completed.seconds - started.seconds) as i128 * 1_000_000_000
        + (completed.nanos - started.nanos) as i128;
    if nanos <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos.min(u64::MAX as i128) as u64)
    }
}

/// Decode the aux payload of a graph-trace record: a JSON string holding
/// base64-encoded protobuf bytes.
pub fn decode_payload(aux: &serde_json::Value) -> Result<StatusResponse> {
    let encoded = aux.as_str().ok_or_else(|| KilnError::TraceDecode {
        reason: "payload is not a string".to_string(),
    })?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| KilnError::TraceDecode { reason: format!("base64: {}", e) })?;
    StatusResponse::decode(bytes.as_slice())
        .map_err(|e| KilnError::TraceDecode { reason: format!("protobuf: {}", e) })
}

#[derive(Debug)]
struct VertexEntry {
    vertex: Vertex,
    /// Logs not yet printed.
    logs: Vec<VertexLog>,
    start_printed: bool,
    end_printed: bool,
}

/// Stateful printer for graph-trace records.
#[derive(Debug, Default)]
pub struct TraceRenderer {
    vertices: HashMap<String, VertexEntry>,
    order: Vec<String>,
}

impl TraceRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and render one graph-trace payload.
    pub fn render_payload(&mut self, aux: &serde_json::Value, out: &mut dyn Write) -> Result<()> {
        let response = decode_payload(aux)?;
        self.render(&response, out)
            .map_err(|e| KilnError::transport("writing build output", e))
    }

    /// Merge a status batch into the vertex table and print what changed.
    pub fn render(&mut self, response: &StatusResponse, out: &mut dyn Write) -> io::Result<()> {
        let (vertices, logs) = to_vertices(response);
        self.merge(vertices, logs);
        self.print(out)
    }

    /// Vertices seen so far, in first-seen order.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.order.iter().filter_map(|d| self.vertices.get(d)).map(|e| &e.vertex)
    }

    fn merge(&mut self, vertices: Vec<Vertex>, logs: Vec<VertexLog>) {
        for v in vertices {
            match self.vertices.get_mut(&v.digest) {
                Some(entry) => {
                    entry.vertex.started = v.started;
                    entry.vertex.completed = v.completed;
                    entry.vertex.cached = v.cached;
                    entry.vertex.duration = v.duration;
                    if !v.error.is_empty() {
                        entry.vertex.error = v.error;
                    }
                }
                None => {
                    self.order.push(v.digest.clone());
                    self.vertices.insert(
                        v.digest.clone(),
                        VertexEntry {
                            vertex: v,
                            logs: Vec::new(),
                            start_printed: false,
                            end_printed: false,
                        },
                    );
                }
            }
        }

        for log in logs {
            if let Some(entry) = self.vertices.get_mut(&log.vertex) {
                entry.logs.push(log);
            }
        }
    }

    fn print(&mut self, out: &mut dyn Write) -> io::Result<()> {
        for digest in &self.order {
            let Some(entry) = self.vertices.get_mut(digest) else { continue };
            let v = &entry.vertex;
            let internal = v.is_internal();
            let cached_done = v.cached && v.completed;

            if v.started && !entry.start_printed && !internal && !cached_done {
                writeln!(out, "{} {}", "▶".cyan(), v.name)?;
                entry.start_printed = true;
            }

            // Internal vertices drop their logs unprinted.
            let logs = std::mem::take(&mut entry.logs);
            if !internal {
                for log in &logs {
                    let text = String::from_utf8_lossy(&log.msg);
                    for line in text.trim_end_matches('\n').split('\n') {
                        writeln!(out, "  {} {}", "│".dimmed(), line.trim_end_matches('\r'))?;
                    }
                }
            }

            if entry.end_printed {
                continue;
            }
            if !v.error.is_empty() {
                writeln!(out, "{} {}: {}", "✗".red().bold(), v.name, v.error.red())?;
                entry.end_printed = true;
            } else if v.completed && !internal {
                if v.cached {
                    writeln!(out, "{} {} {}", "✓".green(), v.name, "(cached)".dimmed())?;
                } else {
                    let done = format!("done in {}ms", v.duration.as_millis());
                    writeln!(out, "{} {} {}", "✓".green(), v.name, done.dimmed())?;
                }
                entry.end_printed = true;
            }
        }
        Ok(())
    }
}
