//! Registry of model files already on disk
//!
//! The registry is an owned value rebuilt by scanning a directory; nothing
//! about it is global.

use crate::error::FetchError;
use modelfetch_types::LocalModel;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// File extensions recognized as model weights
pub const MODEL_EXTENSIONS: [&str; 3] = ["ckpt", "pt", "safetensors"];

/// Model files found under one root directory
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    root: PathBuf,
    models: Vec<LocalModel>,
}

impl ModelRegistry {
    /// Scan `root` recursively. A missing root yields an empty registry.
    pub async fn scan(root: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let mut registry = Self {
            root: root.into(),
            models: Vec::new(),
        };
        registry.rescan().await?;
        Ok(registry)
    }

    /// Rebuild the list from disk
    pub async fn rescan(&mut self) -> Result<(), FetchError> {
        self.models.clear();
        if !self.root.is_dir() {
            return Ok(());
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && is_model_file(&path) {
                    let size = entry.metadata().await?.len();
                    self.models.push(LocalModel {
                        name: relative_name(&self.root, &path),
                        path,
                        size,
                    });
                }
            }
        }

        self.models.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} models under {}", self.models.len(), self.root.display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models(&self) -> &[LocalModel] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&LocalModel> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Combined size of every model in bytes
    pub fn total_size(&self) -> u64 {
        self.models.iter().map(|m| m.size).sum()
    }
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MODEL_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
