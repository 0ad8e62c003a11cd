//! Settings storage
//!
//! Engine settings persisted as JSON in the data directory.

use crate::inference::generation::DEFAULT_MAX_TOKENS;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on the generation cursor (prompt tokens included)
    pub max_tokens: u32,
    /// Token capacity of the batch created on load
    pub batch_tokens: u32,
    /// Embedding width of the batch (0 = token batch)
    pub embedding_dim: u32,
    /// Maximum sequences per batch entry
    pub max_sequences: u32,
    /// NUMA-aware backend initialization
    pub use_numa: bool,
    /// Context window size
    pub context_size: u32,
    /// Inference threads (0 = native default)
    pub threads: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            batch_tokens: 512,
            embedding_dim: 0,
            max_sequences: 1,
            use_numa: false,
            context_size: 2048,
            threads: 0,
            gpu_layers: 0,
        }
    }
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Replaces zero sizes with defaults and keeps the prompt batch inside the context.
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }

        if self.batch_tokens == 0 {
            self.batch_tokens = defaults.batch_tokens;
        }

        if self.max_sequences == 0 {
            self.max_sequences = defaults.max_sequences;
        }

        if self.context_size == 0 {
            self.context_size = defaults.context_size;
        }

        self.batch_tokens = self.batch_tokens.min(self.context_size);
    }
}

/// Get the settings file path
pub fn settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load and validate settings from `path`; a missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the default location
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_tokens, 64);
        assert_eq!(settings.batch_tokens, 512);
        assert_eq!(settings.max_sequences, 1);
        assert!(!settings.use_numa);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = EngineSettings {
            max_tokens: 0,
            batch_tokens: 4096,
            max_sequences: 0,
            context_size: 1024,
            ..EngineSettings::default()
        };
        settings.validate();

        assert_eq!(settings.max_tokens, 64);
        assert_eq!(settings.max_sequences, 1);
        assert_eq!(settings.batch_tokens, 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: EngineSettings = serde_json::from_str(r#"{"max_tokens": 128}"#).unwrap();
        assert_eq!(settings.max_tokens, 128);
        assert_eq!(settings.context_size, 2048);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = EngineSettings {
            gpu_layers: 99,
            use_numa: true,
            ..EngineSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, EngineSettings::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(StorageError::Json(_))));
    }
}
