//! Kiln daemon wire formats.
//!
//! This crate defines what a container-build daemon streams back to kiln:
//! the JSON message records of its build/push endpoints and the graph-trace
//! protobuf messages some daemons embed inside those records.

pub mod message;
pub mod trace;

pub use message::{DaemonRecord, JsonError, JsonMessage, JsonProgress, GRAPH_TRACE_ID};
pub use trace::{StatusResponse, Vertex, VertexLog, VertexStatus};

// Re-exported so consumers can build and inspect trace timestamps
// without pinning their own prost-types version.
pub use prost_types;
