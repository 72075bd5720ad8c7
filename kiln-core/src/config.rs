//! Configuration management.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Image builder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Labels attached to every image built, in addition to the build mode.
    pub extra_labels: BTreeMap<String, String>,
    /// Deadline for a single daemon build or push, none by default.
    pub build_timeout_secs: Option<u64>,
    /// First backoff window between two progress lines for the same id.
    pub progress_initial_wait_ms: u64,
    /// Number of context chunks buffered between packager and daemon.
    pub context_channel_capacity: usize,
    /// Size of a single context chunk in bytes.
    pub context_chunk_size: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            extra_labels: BTreeMap::new(),
            build_timeout_secs: None,
            progress_initial_wait_ms: 5_000,
            context_channel_capacity: 16,
            context_chunk_size: 64 * 1024,
        }
    }
}

impl BuilderConfig {
    /// Load configuration from disk, falling back to defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KilnError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| KilnError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Reject values the builder cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.context_channel_capacity == 0 {
            return Err(KilnError::InvalidConfig {
                reason: "context_channel_capacity must be at least 1".to_string(),
            });
        }
        if self.context_chunk_size == 0 {
            return Err(KilnError::InvalidConfig {
                reason: "context_chunk_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    pub fn progress_initial_wait(&self) -> Duration {
        Duration::from_millis(self.progress_initial_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::load(&temp.path().join("kiln.json")).unwrap();
        assert_eq!(config, BuilderConfig::default());
        assert_eq!(config.progress_initial_wait(), Duration::from_secs(5));
        assert!(config.build_timeout().is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.json");
        std::fs::write(&path, r#"{"extra_labels":{"team":"web"},"build_timeout_secs":30}"#)
            .unwrap();

        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.extra_labels.get("team").map(String::as_str), Some("web"));
        assert_eq!(config.build_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.context_channel_capacity, 16);
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("kiln.json");
        let mut config = BuilderConfig::default();
        config.progress_initial_wait_ms = 250;
        config.save(&path).unwrap();

        assert_eq!(BuilderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.json");
        std::fs::write(&path, r#"{"context_channel_capacity":0}"#).unwrap();
        assert!(matches!(BuilderConfig::load(&path), Err(KilnError::InvalidConfig { .. })));
    }

    #[test]
    fn test_malformed_file_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kiln.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(BuilderConfig::load(&path), Err(KilnError::InvalidConfig { .. })));
    }
}
