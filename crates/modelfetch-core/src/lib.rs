//! modelfetch Core - Download Engine
//!
//! This crate provides the core download functionality for modelfetch.
//! It resolves model file names, downloads them with resume and retry,
//! and reports progress to whatever host is driving it.

pub mod engine;
pub mod error;
pub mod registry;
pub mod reporter;
pub mod storage;

pub use engine::{DownloadEngine, DownloadHandle, DownloadManager, EngineOptions};
pub use error::FetchError;
pub use modelfetch_types;
pub use registry::ModelRegistry;
pub use reporter::{EventReporter, Fanout, NullReporter, StatusReporter, Throttled};
pub use storage::SettingsStore;

use modelfetch_types::{CoreEvent, DownloadOutcome, FetchRequest, ModelCategory, Settings};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The main modelfetch core instance
#[derive(Clone)]
pub struct ModelFetchCore {
    /// Settings the engine was built from
    settings: Arc<Settings>,
    /// Download manager
    manager: DownloadManager,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
}

impl ModelFetchCore {
    /// Create a core with an HTTP client configured from `settings`
    pub fn new(settings: Settings) -> Result<Self, FetchError> {
        let engine = DownloadEngine::from_settings(&settings)?;
        Ok(Self::with_engine(engine, settings))
    }

    /// Create a core around an existing engine
    pub fn with_engine(engine: DownloadEngine, settings: Settings) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let manager = DownloadManager::new(engine, settings.clone(), event_tx.clone());

        Self {
            settings: Arc::new(settings),
            manager,
            event_tx,
        }
    }

    /// Load settings from `store` and build a core from them
    pub async fn from_store(store: &SettingsStore) -> Result<Self, FetchError> {
        let settings = store.load().await?;
        Self::new(settings)
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Build a request from the category label a host panel uses ("LoRA", "VAE", ...)
    pub fn request(url: impl Into<String>, category: &str) -> Result<FetchRequest, FetchError> {
        Ok(FetchRequest::new(url, category.parse::<ModelCategory>()?))
    }

    /// Look up the file name a URL would be saved under, without downloading
    pub async fn probe(&self, url: &str) -> Result<String, FetchError> {
        self.manager.engine().resolve_file_name(url).await
    }

    /// Download a model and wait for it to finish
    pub async fn download(
        &self,
        request: FetchRequest,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<DownloadOutcome, FetchError> {
        self.download_with_cancel(request, reporter, CancellationToken::new())
            .await
    }

    /// Download a model, stopping early when `cancel` fires
    pub async fn download_with_cancel(
        &self,
        request: FetchRequest,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        self.manager.fetch(request, reporter, cancel).await
    }

    /// Start a download in the background
    pub fn start(&self, request: FetchRequest, reporter: Arc<dyn StatusReporter>) -> DownloadHandle {
        self.manager.start(request, reporter)
    }

    /// Cancel a running download
    pub fn cancel(&self, id: Uuid) -> bool {
        self.manager.cancel(id)
    }

    // ========================================================================
    // Local Models
    // ========================================================================

    /// Models already present in a category directory (checkpoints by default)
    pub async fn local_models(&self, category: Option<ModelCategory>) -> Result<ModelRegistry, FetchError> {
        let category = category.unwrap_or(ModelCategory::Checkpoint);
        ModelRegistry::scan(self.settings.directory_for(category)).await
    }
}
