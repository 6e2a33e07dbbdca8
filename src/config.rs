//! Unified configuration for a `driftless` mount.
//!
//! Follows the teacher's `serde(default)` + `toml` pattern: a single struct
//! loaded from an optional file, then overridden by CLI flags. Priority
//! chain (lowest to highest): built-in defaults, config file, CLI flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default exclude pattern applied when no `.driftless.toml` overrides it.
const DEFAULT_EXCLUDE: &str = "target/";

/// Mount and ignore-rule configuration for one side of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absolute path to the directory being mirrored.
    pub mount_root: PathBuf,

    /// Advisory label for the peer's root, sent at handshake for logging.
    pub remote_root: String,

    /// Extra include patterns (override excludes), anchored at mount root.
    pub includes: Vec<String>,

    /// Extra exclude patterns, anchored at mount root. Defaults to `target/`.
    pub excludes: Vec<String>,

    /// Path prefixes that get verbose (debug-level) per-update logging.
    pub debug_prefixes: Vec<String>,

    /// Identifies this mount to the peer; must match `[A-Za-z0-9_-]+`.
    pub mount_key: String,

    /// Address this side listens on, or connects to, for the session
    /// transport. Not part of the spec's abstract interface, but needed
    /// to actually run two sides against each other.
    pub listen_addr: Option<String>,
    pub connect_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("."),
            remote_root: String::new(),
            includes: Vec::new(),
            excludes: vec![DEFAULT_EXCLUDE.to_string()],
            debug_prefixes: Vec::new(),
            mount_key: "default".to_string(),
            listen_addr: None,
            connect_addr: None,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, falling back to defaults for
    /// anything the file omits (`#[serde(default)]` on every field).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {:?}", path))?;
                let config: Config = toml::from_str(&text)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    /// Validate the parts of the config the spec constrains directly.
    pub fn validate(&self) -> Result<()> {
        if self.mount_key.is_empty()
            || !self
                .mount_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!(
                "mount_key {:?} must match [A-Za-z0-9_-]+",
                self.mount_key
            );
        }
        Ok(())
    }

    pub fn with_mount_root(mut self, root: PathBuf) -> Self {
        self.mount_root = root;
        self
    }

    pub fn with_mount_key(mut self, key: String) -> Self {
        self.mount_key = key;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_mount_key() {
        let config = Config::default().with_mount_key("has a space".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("driftless.toml");
        std::fs::write(
            &path,
            r#"
            mount_key = "laptop-home"
            excludes = ["target/", "node_modules/"]
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.mount_key, "laptop-home");
        assert_eq!(config.excludes, vec!["target/", "node_modules/"]);
    }
}
