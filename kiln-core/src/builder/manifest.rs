//! Build manifest (Dockerfile) model.
//!
//! A manifest is an append-only list of instructions. The synthesizer
//! builds one up from a base and then hands the rendered text to the
//! context packager; nothing edits instructions after they are appended.

use crate::model::Cmd;
use std::collections::BTreeMap;
use std::fmt;

/// Label recording how an image was produced.
pub const BUILD_MODE_LABEL: &str = "kiln.buildMode";

/// Value of [`BUILD_MODE_LABEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Full rebuild from the base instructions.
    Scratch,
    /// Files synced on top of an image built earlier.
    Existing,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Scratch => "scratch",
            BuildMode::Existing => "existing",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image labels, kept in key order so rendering is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels holding only the build mode.
    pub fn for_mode(mode: BuildMode) -> Self {
        let mut labels = Self::new();
        labels.insert(BUILD_MODE_LABEL, mode.as_str());
        labels
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Merge `extra` without overwriting keys already present.
    pub fn merge_extra(&mut self, extra: &BTreeMap<String, String>) {
        for (key, value) in extra {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Ordered sequence of build instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildManifest {
    instructions: Vec<String>,
}

impl BuildManifest {
    /// Start a manifest from base instructions. The base is kept as an
    /// opaque block; an empty base yields an empty manifest.
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let base = base.trim_end_matches('\n');
        let instructions = if base.trim().is_empty() { Vec::new() } else { vec![base.to_string()] };
        Self { instructions }
    }

    /// Manifest building on top of an existing image.
    pub fn from_image(image: &str) -> Self {
        Self::new(format!("FROM {}", image))
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Append a raw instruction.
    pub fn join(&mut self, instruction: impl Into<String>) -> &mut Self {
        self.instructions.push(instruction.into());
        self
    }

    /// `COPY src dest`
    pub fn copy(&mut self, src: &str, dest: &str) -> &mut Self {
        self.join(format!("COPY {} {}", src, dest))
    }

    /// Copy everything in the build context to the image root.
    pub fn add_all(&mut self) -> &mut Self {
        self.join("ADD . /")
    }

    /// `RUN`, in shell form for `sh -c` commands and exec form otherwise.
    pub fn run(&mut self, cmd: &Cmd) -> &mut Self {
        let line = format!("RUN {}", command_form(cmd));
        self.join(line)
    }

    /// Remove paths from the image. No-op for an empty list.
    pub fn rm_paths<S: AsRef<str>>(&mut self, paths: &[S]) -> &mut Self {
        if paths.is_empty() {
            return self;
        }
        let quoted: Vec<String> = paths.iter().map(|p| format!("'{}'", p.as_ref())).collect();
        self.run(&Cmd::shell(format!("rm -rf {}", quoted.join(" "))))
    }

    pub fn entrypoint(&mut self, cmd: &Cmd) -> &mut Self {
        let line = format!("ENTRYPOINT {}", command_form(cmd));
        self.join(line)
    }

    /// `LABEL "key"="value"`
    pub fn label(&mut self, key: &str, value: &str) -> &mut Self {
        let line = format!("LABEL {}={}", quote(key), quote(value));
        self.join(line)
    }

    /// Append one `LABEL` line per label: the build mode first, then the
    /// rest in key order.
    pub fn with_labels(&mut self, labels: &Labels) -> &mut Self {
        if let Some(mode) = labels.get(BUILD_MODE_LABEL) {
            self.label(BUILD_MODE_LABEL, mode);
        }
        for (key, value) in labels.iter().filter(|(k, _)| *k != BUILD_MODE_LABEL) {
            self.label(key, value);
        }
        self
    }
}

impl fmt::Display for BuildManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.instructions.join("\n"))
    }
}

fn command_form(cmd: &Cmd) -> String {
    if cmd.is_shell_standard_form() {
        cmd.argv[2].clone()
    } else {
        serde_json::to_string(&cmd.argv).unwrap_or_default()
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// Indent every line of `text`, keeping a trailing newline if present.
pub fn indent(text: &str, prefix: &str) -> String {
    if text.is_empty() {
        return prefix.to_string();
    }
    let trailing_newline = text.ends_with('\n');
    let mut result: Vec<String> =
        text.trim_end_matches('\n').split('\n').map(|line| format!("{}{}", prefix, line)).collect();
    if trailing_newline {
        result.push(String::new());
    }
    result.join("\n")
}
