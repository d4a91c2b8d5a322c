//! Shared types for modelfetch
//!
//! This crate contains the data structures shared between the
//! download engine and the hosts (CLI, panels) that drive it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Download Types
// ============================================================================

/// A single resolved download: where the bytes come from and where they go.
///
/// Immutable once the engine starts working on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub target_dir: PathBuf,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, target_dir: impl Into<PathBuf>, file_name: &str) -> Self {
        let target_dir = target_dir.into();
        Self {
            url: url.into(),
            destination: target_dir.join(file_name),
            target_dir,
        }
    }

    /// Base name of the destination file
    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Mutable bookkeeping for one `download` call.
///
/// `total` is 0 until response headers arrive. Nothing here outlives the
/// call; only the partial file persists across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    pub downloaded: u64,
    pub total: u64,
    /// Whether `total` came from the server rather than the on-disk offset
    #[serde(default)]
    pub total_known: bool,
    pub retries_remaining: u32,
    pub retries_used: u32,
    pub last_error: Option<String>,
}

impl DownloadState {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            downloaded: 0,
            total: 0,
            total_known: false,
            retries_remaining: retry_budget,
            retries_used: 0,
            last_error: None,
        }
    }

    /// Spend one unit of the retry budget.
    ///
    /// Returns `false` once the budget has reached zero.
    pub fn consume_retry(&mut self, error: impl Into<String>) -> bool {
        self.last_error = Some(error.into());
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.retries_used += 1;
        self.retries_remaining > 0
    }

    /// Whether `on_disk` bytes satisfy the expected total.
    ///
    /// When the server omitted the length, `total` equals the offset the
    /// attempt started from, so reaching the end of the stream is enough.
    pub fn is_satisfied_by(&self, on_disk: u64) -> bool {
        on_disk >= self.total
    }

    /// More bytes on disk than the server says the resource has
    pub fn overshoots(&self, on_disk: u64) -> bool {
        self.total_known && on_disk > self.total
    }
}

/// Where a download currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Probing,
    Downloading,
    Retrying,
    Resuming,
    Succeeded,
    Failed,
    Cancelled,
}

impl DownloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadPhase::Succeeded | DownloadPhase::Failed | DownloadPhase::Cancelled
        )
    }
}

impl fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadPhase::Probing => "probing",
            DownloadPhase::Downloading => "downloading",
            DownloadPhase::Retrying => "retrying",
            DownloadPhase::Resuming => "resuming",
            DownloadPhase::Succeeded => "succeeded",
            DownloadPhase::Failed => "failed",
            DownloadPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of transfer progress handed to reporters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub downloaded: u64,
    pub total: u64,
    pub label: String,
    pub phase: DownloadPhase,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

/// Result of a finished download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
    pub downloaded: u64,
    pub total: u64,
    pub retries_used: u32,
    pub completed_at: DateTime<Utc>,
}

impl DownloadOutcome {
    /// One-line message for the host's result area
    pub fn message(&self) -> String {
        format!("{} successfully downloaded.", self.file_name)
    }
}

// ============================================================================
// Host Types
// ============================================================================

/// Kind of model a download belongs to; decides the destination directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelCategory {
    Checkpoint,
    Hypernetwork,
    TextualInversion,
    AestheticGradient,
    #[serde(rename = "VAE")]
    Vae,
    #[serde(rename = "LoRA")]
    Lora,
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 6] = [
        ModelCategory::Checkpoint,
        ModelCategory::Hypernetwork,
        ModelCategory::TextualInversion,
        ModelCategory::AestheticGradient,
        ModelCategory::Vae,
        ModelCategory::Lora,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ModelCategory::Checkpoint => "Checkpoint",
            ModelCategory::Hypernetwork => "Hypernetwork",
            ModelCategory::TextualInversion => "TextualInversion",
            ModelCategory::AestheticGradient => "AestheticGradient",
            ModelCategory::Vae => "VAE",
            ModelCategory::Lora => "LoRA",
        }
    }

    /// Directory relative to the models root
    pub fn default_dir(&self) -> &'static str {
        match self {
            ModelCategory::Checkpoint => "models/Stable-diffusion",
            ModelCategory::Hypernetwork => "models/hypernetworks",
            ModelCategory::TextualInversion => "embeddings",
            ModelCategory::AestheticGradient => {
                "extensions/stable-diffusion-webui-aesthetic-gradients/aesthetic_embeddings"
            }
            ModelCategory::Vae => "models/VAE",
            ModelCategory::Lora => "extensions/sd-webui-additional-networks/models/lora",
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Returned when a category label does not match any known category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCategoryError(pub String);

impl fmt::Display for ParseCategoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid model type: {}", self.0)
    }
}

impl std::error::Error for ParseCategoryError {}

impl FromStr for ModelCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "checkpoint" | "ckpt" => Ok(ModelCategory::Checkpoint),
            "hypernetwork" => Ok(ModelCategory::Hypernetwork),
            "textualinversion" | "embedding" => Ok(ModelCategory::TextualInversion),
            "aestheticgradient" => Ok(ModelCategory::AestheticGradient),
            "vae" => Ok(ModelCategory::Vae),
            "lora" => Ok(ModelCategory::Lora),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

/// Inbound request from a host: what to fetch and which category it is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub file_name: Option<String>,
    pub category: ModelCategory,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, category: ModelCategory) -> Self {
        Self {
            url: url.into(),
            file_name: None,
            category,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// A model file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalModel {
    /// Path relative to the scanned directory
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

// ============================================================================
// Settings Types
// ============================================================================

/// What a short read (stream ended cleanly before the expected total) costs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortReadPolicy {
    /// Short reads spend the retry budget like connection failures
    #[default]
    ConsumeRetry,
    /// Short reads resume without spending the budget
    Free,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root that relative category directories are resolved against
    pub models_root: PathBuf,
    /// Retry budget for connection-level failures
    pub max_retries: u32,
    /// Delay in seconds between retry attempts
    pub retry_delay_secs: u64,
    /// Size of the chunks written to disk and reported as progress
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Maximum idle time between body reads before the attempt fails
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Static headers sent with every request
    pub extra_headers: HashMap<String, String>,
    pub short_read_policy: ShortReadPolicy,
    /// Minimum interval between non-terminal progress updates
    pub progress_interval_ms: u64,
    pub categories: BTreeMap<ModelCategory, PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from("."),
            max_retries: 5,
            retry_delay_secs: 10,
            chunk_size: 1024,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            user_agent: format!("modelfetch/{}", env!("CARGO_PKG_VERSION")),
            extra_headers: HashMap::new(),
            short_read_policy: ShortReadPolicy::default(),
            progress_interval_ms: 300,
            categories: ModelCategory::ALL
                .iter()
                .map(|c| (*c, PathBuf::from(c.default_dir())))
                .collect(),
        }
    }
}

impl Settings {
    /// Absolute (or root-relative) directory for a category
    pub fn directory_for(&self, category: ModelCategory) -> PathBuf {
        let dir = self
            .categories
            .get(&category)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(category.default_dir()));
        resolve_against(&self.models_root, &dir)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Default location of the settings file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("modelfetch"))
            .unwrap_or_else(|| PathBuf::from(".modelfetch"))
            .join("settings.json")
    }
}

fn resolve_against(root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events broadcast by the core to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadStarted {
        id: Uuid,
        url: String,
        destination: PathBuf,
    },
    DownloadProgress {
        id: Uuid,
        downloaded: u64,
        total: u64,
        label: String,
    },
    DownloadPhaseChanged {
        id: Uuid,
        phase: DownloadPhase,
        label: String,
    },
    DownloadCompleted {
        outcome: DownloadOutcome,
    },
    DownloadFailed {
        id: Uuid,
        error: String,
    },
}
