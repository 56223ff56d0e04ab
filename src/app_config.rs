//! Application configuration.
//!
//! Settings come from a TOML file; anything unspecified falls back to
//! defaults derived from the user's directories. Path fields are
//! tilde-expanded as they are parsed, so the rest of the crate only ever
//! sees resolved paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

/// Field-level deserializer for configured paths: rejects the empty string
/// and expands a leading `~` against the user's home directory.
fn configured_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Err(serde::de::Error::custom("path must not be empty"));
    }
    let expanded: &str = &shellexpand::tilde(&raw);
    Ok(PathBuf::from(expanded))
}

fn state_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("stashfs")
}

fn default_mount_point() -> PathBuf {
    state_dir().join("mnt")
}

fn default_cache_dir() -> PathBuf {
    state_dir().join("cache")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Backend driver settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Directory projected through the mount.
    #[serde(deserialize_with = "configured_path")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_mount_point", deserialize_with = "configured_path")]
    pub mount_point: PathBuf,

    /// Where the metadata store lives. Must survive restarts, or the cache
    /// is pointless.
    #[serde(default = "default_cache_dir", deserialize_with = "configured_path")]
    pub cache_dir: PathBuf,

    pub backend: BackendConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Validation problems, empty when the config is usable.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.mount_point == self.backend.root {
            problems.push("mount_point and backend.root must differ".to_owned());
        }
        if self.cache_dir.starts_with(&self.mount_point) {
            problems.push("cache_dir must not live inside the mount point".to_owned());
        }
        if !self.backend.root.is_absolute() {
            problems.push(format!(
                "backend.root must be absolute, got {}",
                self.backend.root.display()
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            root = "/srv/media"
            "#,
        )
        .expect("minimal config should parse");
        assert_eq!(config.backend.root, Path::new("/srv/media"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_a_relative_backend_root() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            root = "srv/media"
            "#,
        )
        .expect("config should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_an_empty_path_at_parse_time() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [backend]
            root = ""
            "#,
        );
        assert!(result.is_err(), "empty paths must fail during parsing");
    }

    #[test]
    fn expands_a_leading_tilde() {
        let config: Config = toml::from_str(
            r#"
            cache_dir = "~/stash-cache"
            [backend]
            root = "/srv/media"
            "#,
        )
        .expect("config should parse");
        if dirs::home_dir().is_some() {
            assert!(
                !config.cache_dir.starts_with("~"),
                "tilde must be resolved when a home directory exists"
            );
        }
    }
}
