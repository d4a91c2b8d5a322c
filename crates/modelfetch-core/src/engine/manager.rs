//! Download Manager - turns host requests into running downloads
//!
//! This is the coordinator that:
//! - Resolves file names and category directories
//! - Serializes downloads that target the same file
//! - Runs downloads as independent tasks with cancellation

use crate::engine::{resolver, DownloadEngine};
use crate::error::FetchError;
use crate::reporter::{EventReporter, Fanout, StatusReporter, Throttled};
use chrono::Utc;
use modelfetch_types::{
    CoreEvent, DownloadOutcome, DownloadPhase, DownloadRequest, DownloadState, FetchRequest, ProgressEvent,
    Settings,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Download manager that coordinates all downloads
#[derive(Clone)]
pub struct DownloadManager {
    engine: Arc<DownloadEngine>,
    settings: Arc<Settings>,
    /// One lock per destination file, keyed by absolute path; held for the whole transfer
    path_locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
    /// Downloads currently running or waiting for their path lock
    active: Arc<RwLock<HashMap<Uuid, ActiveDownload>>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

/// Control data for a running download
struct ActiveDownload {
    url: String,
    cancel: CancellationToken,
}

/// Handle to a spawned download
pub struct DownloadHandle {
    pub id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<Result<DownloadOutcome, FetchError>>,
}

impl DownloadHandle {
    /// Ask the download to stop after the current chunk
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the download to finish
    pub async fn join(self) -> Result<DownloadOutcome, FetchError> {
        self.task
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?
    }
}

impl DownloadManager {
    pub fn new(
        engine: DownloadEngine,
        settings: Settings,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            settings: Arc::new(settings),
            path_locks: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Turn a host request into a concrete download request.
    ///
    /// Uses the explicit file name when given, otherwise probes the server.
    pub async fn resolve(
        &self,
        request: &FetchRequest,
        reporter: &dyn StatusReporter,
    ) -> Result<DownloadRequest, FetchError> {
        reporter.status("Loading Model File Name...");
        reporter.progress(&ProgressEvent {
            downloaded: 0,
            total: 0,
            label: request.url.clone(),
            phase: DownloadPhase::Probing,
        });

        let file_name = match &request.file_name {
            Some(name) => resolver::sanitize_file_name(name)
                .ok_or_else(|| FetchError::NameResolution(format!("unusable filename '{}'", name)))?,
            None => self.engine.resolve_file_name(&request.url).await?,
        };
        reporter.status(&format!("Get model name: {}", file_name));

        let target_dir = self.settings.directory_for(request.category);
        debug!(
            "Resolved {} as {} in {}",
            request.url,
            file_name,
            target_dir.display()
        );

        Ok(DownloadRequest::new(request.url.clone(), target_dir, &file_name))
    }

    /// Resolve and download, waiting for any other download of the same file
    pub async fn fetch(
        &self,
        request: FetchRequest,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        self.execute(Uuid::new_v4(), request, reporter, cancel).await
    }

    /// Start a download in the background
    pub fn start(&self, request: FetchRequest, reporter: Arc<dyn StatusReporter>) -> DownloadHandle {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let manager = self.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move { manager.execute(id, request, reporter, token).await });

        DownloadHandle { id, cancel, task }
    }

    /// Cancel a running download by id
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.active.read().get(&id) {
            Some(active) => {
                info!("Cancelling download {} ({})", id, active.url);
                active.cancel.cancel();
                true
            }
            None => {
                warn!("Download {} is not running", id);
                false
            }
        }
    }

    /// Cancel everything that is running
    pub fn cancel_all(&self) {
        for active in self.active.read().values() {
            active.cancel.cancel();
        }
    }

    /// Ids and URLs of downloads that are running or queued on a path lock
    pub fn active_downloads(&self) -> Vec<(Uuid, String)> {
        self.active
            .read()
            .iter()
            .map(|(id, active)| (*id, active.url.clone()))
            .collect()
    }

    /// Destinations that currently have a download running or waiting
    pub fn locked_paths(&self) -> Vec<PathBuf> {
        self.path_locks.lock().keys().cloned().collect()
    }

    async fn execute(
        &self,
        id: Uuid,
        request: FetchRequest,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        self.active.write().insert(
            id,
            ActiveDownload {
                url: request.url.clone(),
                cancel: cancel.clone(),
            },
        );
        let registration = Registration {
            active: self.active.clone(),
            id,
        };

        let result = self.run(id, &request, reporter, &cancel).await;

        drop(registration);
        match &result {
            Ok(outcome) => {
                let _ = self.event_tx.send(CoreEvent::DownloadCompleted {
                    outcome: outcome.clone(),
                });
            }
            Err(e) => {
                let _ = self.event_tx.send(CoreEvent::DownloadFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        id: Uuid,
        request: &FetchRequest,
        reporter: Arc<dyn StatusReporter>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        let reporter = Throttled::new(
            Fanout::new()
                .with(reporter)
                .with(EventReporter::new(id, self.event_tx.clone())),
            self.settings.progress_interval(),
        );

        let download = self.resolve(request, &reporter).await?;
        let _ = self.event_tx.send(CoreEvent::DownloadStarted {
            id,
            url: download.url.clone(),
            destination: download.destination.clone(),
        });

        let lease = self.path_lock(&download.destination);
        let state = self.download_locked(&lease.lock, &download, &reporter, cancel).await;
        drop(lease);
        let state = state?;

        Ok(DownloadOutcome {
            id,
            file_name: download.file_name(),
            path: download.destination,
            downloaded: state.downloaded,
            total: state.total,
            retries_used: state.retries_used,
            completed_at: Utc::now(),
        })
    }

    async fn download_locked(
        &self,
        lock: &AsyncMutex<()>,
        download: &DownloadRequest,
        reporter: &dyn StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<DownloadState, FetchError> {
        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        self.engine.download(download, reporter, cancel).await
    }

    fn path_lock(&self, path: &Path) -> PathLease {
        let key = lock_key(path);
        let lock = self
            .path_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        PathLease {
            locks: self.path_locks.clone(),
            key,
            lock,
        }
    }
}

/// Removes a download from the active map, even when its future is dropped
struct Registration {
    active: Arc<RwLock<HashMap<Uuid, ActiveDownload>>>,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active.write().remove(&self.id);
    }
}

/// Shared use of one destination's lock; the table entry goes with the last lease
struct PathLease {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
    key: PathBuf,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for PathLease {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The table holds one reference and this lease another
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.key);
        }
    }
}

/// Absolute, `.`-free form of `path` so equivalent spellings share a lock
fn lock_key(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut key = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                key.pop();
            }
            other => key.push(other),
        }
    }
    key
}
