//! Storage layer for persistent settings (JSON file)

use crate::error::FetchError;
use modelfetch_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Reads and writes the settings file
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform config location
    pub fn default_location() -> Self {
        Self::new(Settings::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub async fn load(&self) -> Result<Settings, FetchError> {
        if !self.path.exists() {
            debug!("No settings at {}, using defaults", self.path.display());
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings, creating the parent directory when needed
    pub async fn save(&self, settings: &Settings) -> Result<(), FetchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).await?;
        info!("Saved settings to {}", self.path.display());

        Ok(())
    }
}
