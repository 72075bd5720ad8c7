//! Build specification model.
//!
//! Sync rules, run steps and the local-to-container path mappings derived
//! from them. Everything here is plain data plus the file matching used to
//! resolve which local files a mapping contributes to a build.

use crate::error::{KilnError, Result};
use glob::{MatchOptions, Pattern};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Correspondence between a local path and a path in the build context.
///
/// The container path is rooted at the build-context root, which is also
/// the image root, so it doubles as the destination inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathMapping {
    local_path: PathBuf,
    container_path: String,
}

impl PathMapping {
    pub fn new(local_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Result<Self> {
        let local_path = local_path.into();
        let container_path = container_path.into();

        if local_path.as_os_str().is_empty() || container_path.is_empty() {
            return Err(KilnError::InvalidPathMapping {
                local: local_path,
                container: container_path,
                reason: "both paths must be non-empty".to_string(),
            });
        }

        Ok(Self { local_path, container_path })
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn container_path(&self) -> &str {
        &self.container_path
    }

    /// Container path without the leading `/`, as stored in the context archive.
    pub fn archive_path(&self) -> &str {
        self.container_path.trim_start_matches('/')
    }

    /// `'local' --> 'container'`, for build logs.
    pub fn pretty_str(&self) -> String {
        format!("'{}' --> '{}'", self.local_path.display(), self.container_path)
    }

    /// Mapping for `child`, a path below this mapping's local path.
    fn child(&self, child: &Path) -> Result<PathMapping> {
        let rel = child.strip_prefix(&self.local_path).map_err(|_| KilnError::InvalidPathMapping {
            local: child.to_path_buf(),
            container: self.container_path.clone(),
            reason: format!("not below {}", self.local_path.display()),
        })?;

        Ok(PathMapping {
            local_path: child.to_path_buf(),
            container_path: join_container_path(&self.container_path, rel),
        })
    }
}

/// Join a relative local path onto a container path using `/` separators.
pub fn join_container_path(base: &str, rel: &Path) -> String {
    let mut joined = base.trim_end_matches('/').to_string();
    for component in rel.components() {
        joined.push('/');
        joined.push_str(&component.as_os_str().to_string_lossy());
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}

/// A rule syncing a local file or directory into the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRule {
    pub local_path: PathBuf,
    pub container_path: String,
}

impl SyncRule {
    pub fn new(local_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self { local_path: local_path.into(), container_path: container_path.into() }
    }
}

/// Convert sync rules to path mappings, preserving order.
pub fn syncs_to_path_mappings(syncs: &[SyncRule]) -> Result<Vec<PathMapping>> {
    syncs
        .iter()
        .map(|sync| PathMapping::new(sync.local_path.clone(), sync.container_path.clone()))
        .collect()
}

/// A command, as an argv vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    pub argv: Vec<String>,
}

impl Cmd {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { argv: argv.into_iter().map(Into::into).collect() }
    }

    /// A command run through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self { argv: vec!["sh".to_string(), "-c".to_string(), script.into()] }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    /// True for `["sh", "-c", script]`.
    pub fn is_shell_standard_form(&self) -> bool {
        self.argv.len() == 3 && self.argv[0] == "sh" && self.argv[1] == "-c"
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_shell_standard_form() {
            return f.write_str(&self.argv[2]);
        }
        let quoted: Vec<String> = self
            .argv
            .iter()
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("{:?}", arg)
                } else {
                    arg.clone()
                }
            })
            .collect();
        f.write_str(&quoted.join(" "))
    }
}

/// A set of file patterns, relative ones resolved against `base_directory`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    pub paths: Vec<String>,
    pub base_directory: PathBuf,
}

impl PathSet {
    pub fn new<I, S>(paths: I, base_directory: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            base_directory: base_directory.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A build step, optionally gated on trigger files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Run {
    pub cmd: Cmd,
    pub triggers: PathSet,
}

impl Run {
    /// A run with no triggers.
    pub fn new(cmd: Cmd) -> Self {
        Self { cmd, triggers: PathSet::default() }
    }

    pub fn with_triggers(mut self, triggers: PathSet) -> Self {
        self.triggers = triggers;
        self
    }
}

/// Decides whether a local path is selected.
pub trait PathMatcher: Send + Sync {
    fn matches(&self, path: &Path) -> bool;
}

/// Matches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyMatcher;

impl PathMatcher for EmptyMatcher {
    fn matches(&self, _path: &Path) -> bool {
        false
    }
}

/// Matches a path if any pattern matches it or one of its parent directories.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    patterns: Vec<Pattern>,
}

impl GlobMatcher {
    /// Build a matcher from patterns, resolving relative ones against `base`.
    pub fn new<S: AsRef<str>>(base: &Path, patterns: &[S]) -> Result<Self> {
        let escaped_base = Pattern::escape(&base.to_string_lossy());
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                let full = if Path::new(p).is_absolute() || escaped_base.is_empty() {
                    p.to_string()
                } else {
                    format!("{}/{}", escaped_base.trim_end_matches('/'), p.trim_start_matches("./"))
                };
                Pattern::new(&full).map_err(|e| KilnError::InvalidPattern {
                    pattern: p.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }
}

impl PathMatcher for GlobMatcher {
    fn matches(&self, path: &Path) -> bool {
        let options = MatchOptions { require_literal_separator: true, ..MatchOptions::new() };
        path.ancestors().any(|candidate| {
            self.patterns.iter().any(|pattern| pattern.matches_path_with(candidate, options))
        })
    }
}

/// Matcher selecting the trigger files of a run.
pub fn create_run_matcher(run: &Run) -> Result<Box<dyn PathMatcher>> {
    if run.triggers.is_empty() {
        return Ok(Box::new(EmptyMatcher));
    }
    Ok(Box::new(GlobMatcher::new(&run.triggers.base_directory, &run.triggers.paths)?))
}

/// Every file below the given mappings selected by `matcher`, as mappings of
/// their own. Mappings whose local path does not exist contribute nothing.
pub fn filter_mappings(
    mappings: &[PathMapping],
    matcher: &dyn PathMatcher,
) -> Result<Vec<PathMapping>> {
    let mut result = Vec::new();

    for mapping in mappings {
        if !mapping.local_path().exists() {
            continue;
        }

        for entry in WalkDir::new(mapping.local_path()).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(mapping.local_path()).to_path_buf();
                KilnError::IoError { path, source: e.into() }
            })?;

            if entry.file_type().is_dir() {
                continue;
            }

            if matcher.matches(entry.path()) {
                result.push(mapping.child(entry.path())?);
            }
        }
    }

    Ok(result)
}

/// Split mappings into those whose local path is gone and those still present.
pub fn missing_local_paths(
    mappings: &[PathMapping],
) -> Result<(Vec<PathMapping>, Vec<PathMapping>)> {
    let mut missing = Vec::new();
    let mut present = Vec::new();

    for mapping in mappings {
        match std::fs::symlink_metadata(mapping.local_path()) {
            Ok(_) => present.push(mapping.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(mapping.clone()),
            Err(e) => {
                let path = mapping.local_path().to_path_buf();
                return Err(KilnError::IoError { path, source: e });
            }
        }
    }

    Ok((missing, present))
}
