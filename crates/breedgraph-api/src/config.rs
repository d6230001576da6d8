use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use breedgraph_core::Release;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EVENT_WORKERS: usize = 3;
pub const DEFAULT_BEGIN_RETRIES: u32 = 5;

/// Process-wide settings, read once at start-up and shared behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BreedGraphConfig {
    pub db_path: PathBuf,
    pub event_workers: usize,
    /// Extra attempts at `BEGIN IMMEDIATE` while the database is busy.
    pub begin_retries: u32,
    pub busy_timeout_ms: u64,
    /// Release attached to models created without an explicit one.
    pub default_release: Release,
}

impl Default for BreedGraphConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./breedgraph.sqlite3"),
            event_workers: DEFAULT_EVENT_WORKERS,
            begin_retries: DEFAULT_BEGIN_RETRIES,
            busy_timeout_ms: breedgraph_store_sqlite::DEFAULT_BUSY_TIMEOUT_MS,
            default_release: Release::Private,
        }
    }
}

impl BreedGraphConfig {
    #[must_use]
    pub fn for_db(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), ..Self::default() }
    }

    /// Parse a YAML document; missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error for malformed YAML or unknown keys.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("invalid breedgraph config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("in config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when no event worker is configured.
    pub fn validate(&self) -> Result<()> {
        if self.event_workers == 0 {
            anyhow::bail!("event_workers must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_only_the_given_keys() -> Result<()> {
        let config = BreedGraphConfig::from_yaml_str(
            "db_path: /tmp/bg.sqlite3\nevent_workers: 5\ndefault_release: REGISTERED\n",
        )?;
        assert_eq!(config.db_path, PathBuf::from("/tmp/bg.sqlite3"));
        assert_eq!(config.event_workers, 5);
        assert_eq!(config.default_release, Release::Registered);
        assert_eq!(config.begin_retries, DEFAULT_BEGIN_RETRIES);
        Ok(())
    }

    #[test]
    fn unknown_keys_and_zero_workers_are_rejected() {
        assert!(BreedGraphConfig::from_yaml_str("db_url: x\n").is_err());
        assert!(BreedGraphConfig::from_yaml_str("event_workers: 0\n").is_err());
    }
}
