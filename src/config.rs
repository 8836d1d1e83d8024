//! Host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ARBOR_CONFIG or --config)
//! 3. Environment variables

use arbor_core::ControllerConfig;
use arbor_storage::SlotFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller behaviour.
    pub controller: ControllerConfig,
    /// Save slot storage.
    pub storage: StorageConfig,
}

impl Config {
    /// Loads configuration from `path` (or `ARBOR_CONFIG`), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ARBOR_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = path {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("ARBOR_SAVE_DIR") {
            self.storage.save_dir = PathBuf::from(dir);
        }
        if let Some(format) = var("ARBOR_SLOT_FORMAT") {
            match format.parse::<SlotFormat>() {
                Ok(format) => self.storage.format = format,
                Err(e) => tracing::warn!("Ignoring ARBOR_SLOT_FORMAT: {}", e),
            }
        }
        if let Some(debug) = var("ARBOR_DEBUG") {
            self.controller.debug_trace = flag(&debug);
        }
        if let Some(autosave) = var("ARBOR_AUTOSAVE") {
            self.controller.autosave_on_transition = flag(&autosave);
        }
        if let Some(slot) = var("ARBOR_AUTOSAVE_SLOT") {
            if !slot.is_empty() {
                self.controller.autosave_slot = slot;
            }
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding slot files and the slot index.
    pub save_dir: PathBuf,
    /// Encoding for newly written slots.
    pub format: SlotFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("./saves"),
            format: SlotFormat::Json,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file '{}': {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.save_dir, PathBuf::from("./saves"));
        assert_eq!(config.storage.format, SlotFormat::Json);
        assert!(!config.controller.autosave_on_transition);
        assert_eq!(config.controller.default_max_paths, 3);
    }

    #[test]
    fn test_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arbor.yaml");
        std::fs::write(
            &path,
            "controller:\n  debug_trace: true\n  default_max_depth: 8\nstorage:\n  format: binary\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.controller.debug_trace);
        assert_eq!(config.controller.default_max_depth, 8);
        assert_eq!(config.controller.autosave_slot, "autosave");
        assert_eq!(config.storage.format, SlotFormat::Binary);
        assert_eq!(config.storage.save_dir, PathBuf::from("./saves"));
    }

    #[test]
    fn test_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arbor.yaml");
        std::fs::write(&path, "storage: [not, a, map]\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ARBOR_SAVE_DIR", "/tmp/arbor"),
            ("ARBOR_SLOT_FORMAT", "binary"),
            ("ARBOR_DEBUG", "1"),
            ("ARBOR_AUTOSAVE", "true"),
            ("ARBOR_AUTOSAVE_SLOT", "quick"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.storage.save_dir, PathBuf::from("/tmp/arbor"));
        assert_eq!(config.storage.format, SlotFormat::Binary);
        assert!(config.controller.debug_trace);
        assert!(config.controller.autosave_on_transition);
        assert_eq!(config.controller.autosave_slot, "quick");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.controller, config.controller);
        assert_eq!(parsed.storage.save_dir, config.storage.save_dir);
    }
}
