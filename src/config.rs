//! Per-repository persistent configuration
//!
//! A small JSON document keyed off the repository UUID, holding the
//! settings that survive between sessions: the configured or previously
//! guessed branching scheme and whether the log cache is enabled.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Explicitly configured branching scheme text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branching_scheme: Option<String>,

    /// Scheme remembered from an earlier history-based guess
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guessed_branching_scheme: Option<String>,

    /// When set, the configured scheme wins over any scheme stored in the
    /// repository's own root properties
    #[serde(default)]
    pub branching_scheme_mandatory: bool,

    /// Whether the on-disk log cache is in use
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

/// Handle to a config document at a known location
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored configuration; a missing file yields the defaults
    pub fn load(&self) -> Result<RepositoryConfig> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RepositoryConfig {
                use_cache: true,
                ..RepositoryConfig::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, config: &RepositoryConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, text)?;
        tracing::debug!(path = %self.path.display(), "saved repository config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("repo.json"));
        let config = store.load().unwrap();
        assert_eq!(config.branching_scheme, None);
        assert!(config.use_cache);
        assert!(!config.branching_scheme_mandatory);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("repo.json"));
        let config = RepositoryConfig {
            branching_scheme: Some("trunk0".into()),
            guessed_branching_scheme: Some("trunk1".into()),
            branching_scheme_mandatory: true,
            use_cache: false,
        };
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.json");
        std::fs::write(&path, r#"{"branching_scheme": "trunk0"}"#).unwrap();
        let config = ConfigStore::new(&path).load().unwrap();
        assert_eq!(config.branching_scheme.as_deref(), Some("trunk0"));
        assert!(config.use_cache);
    }
}
