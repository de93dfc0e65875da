//! Global settings persisted in the per-user data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NotificationFlags;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Per-user global settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub theme: String,
    pub default_model: String,
    pub default_parallelism: bool,
    /// Interpreter used to run the framework agents, when not on PATH.
    pub interpreter_path: Option<String>,
    /// Overrides the bundled framework source directory.
    pub framework_path_override: Option<String>,
    /// Whether `framework.check` callers should fetch updates unprompted.
    pub auto_update: bool,
    pub notifications: NotificationFlags,
    /// Cap on live terminals across all projects.
    pub max_terminals: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            default_model: "opus".to_string(),
            default_parallelism: false,
            interpreter_path: None,
            framework_path_override: None,
            auto_update: true,
            notifications: NotificationFlags::default(),
            max_terminals: 12,
        }
    }
}

impl Settings {
    /// Load from `settings.json`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist atomically (write-temp + rename).
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// The per-user data directory holding the registry, settings, update
/// staging, and the framework source override.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AUTOBUILD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autobuild")
}
