//! Download engine - single-stream, append-only, resumable transfers
//!
//! One call to [`DownloadEngine::download`] drives a small state machine:
//!
//! ```text
//! Downloading --stream ends, size reached--------------> Succeeded
//! Downloading --stream ends short----------------------> Resuming --> Downloading
//! Downloading --connection failure, budget left--------> Retrying --(backoff)--> Downloading
//! Downloading --connection failure, budget spent-------> Failed
//! any         --cancellation---------------------------> Cancelled
//! ```
//!
//! Every attempt starts by measuring the destination file, so whatever a
//! failed attempt managed to append is kept and resumed from.

use crate::engine::resolver;
use crate::error::FetchError;
use crate::reporter::StatusReporter;
use futures::StreamExt;
use modelfetch_types::{DownloadPhase, DownloadRequest, DownloadState, ProgressEvent, Settings, ShortReadPolicy};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables for the retry loop
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Connection failures tolerated before giving up
    pub max_retries: u32,
    /// Backoff between a connection failure and the next attempt
    pub retry_delay: Duration,
    /// Granularity of disk writes and progress events
    pub chunk_size: usize,
    pub short_read_policy: ShortReadPolicy,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
            chunk_size: settings.chunk_size.max(1),
            short_read_policy: settings.short_read_policy,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Resumable single-connection downloader
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    client: Client,
    options: EngineOptions,
}

impl DownloadEngine {
    pub fn new(client: Client, options: EngineOptions) -> Self {
        Self { client, options }
    }

    /// Build an engine with an HTTP client configured from settings
    pub fn from_settings(settings: &Settings) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::Config(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::Config(format!("header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;

        Ok(Self::new(client, EngineOptions::from_settings(settings)))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Ask the server which file name `url` is served under
    pub async fn resolve_file_name(&self, url: &str) -> Result<String, FetchError> {
        resolver::resolve_file_name(&self.client, url).await
    }

    /// Download `request` to completion, resuming from whatever is on disk.
    ///
    /// On success the returned state holds the final size and the number of
    /// retries spent. On any error the partial file is left in place.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        reporter: &dyn StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<DownloadState, FetchError> {
        resolver::parse_url(&request.url)?;
        prepare_destination(request).await?;

        let label = request.file_name();
        let mut state = DownloadState::new(self.options.max_retries);
        let mut phase = DownloadPhase::Downloading;

        info!(
            "Downloading {} -> {} (retry budget {})",
            request.url,
            request.destination.display(),
            state.retries_remaining
        );

        loop {
            if cancel.is_cancelled() {
                return Err(self.finish_cancelled(&mut state, request, &label, reporter).await);
            }

            state.downloaded = match file_size(&request.destination).await {
                Ok(size) => size,
                Err(e) => return Err(self.fail(&mut state, &label, reporter, e)),
            };
            if phase != DownloadPhase::Downloading {
                info!("{} {} from byte {}", phase, label, state.downloaded);
                // Retrying was already reported before the backoff
                if phase == DownloadPhase::Resuming {
                    emit(reporter, &state, &label, phase);
                }
            }
            reporter.status(&format!("Downloading {}...", label));

            let attempt = self.attempt(request, &mut state, &label, reporter, cancel).await;
            state.downloaded = match file_size(&request.destination).await {
                Ok(size) => size,
                Err(e) => return Err(self.fail(&mut state, &label, reporter, e)),
            };

            phase = match attempt {
                Ok(()) if state.overshoots(state.downloaded) => {
                    let e = FetchError::SizeMismatch {
                        expected: state.total,
                        actual: state.downloaded,
                    };
                    return Err(self.fail(&mut state, &label, reporter, e));
                }
                Ok(()) if state.is_satisfied_by(state.downloaded) => DownloadPhase::Succeeded,
                Ok(()) => {
                    warn!(
                        "Stream for {} ended at {} of {} bytes",
                        label, state.downloaded, state.total
                    );
                    match self.options.short_read_policy {
                        ShortReadPolicy::Free => DownloadPhase::Resuming,
                        ShortReadPolicy::ConsumeRetry => {
                            let reason = format!(
                                "connection closed at {} of {} bytes",
                                state.downloaded, state.total
                            );
                            self.spend_retry(&mut state, reason, &label, reporter)?;
                            DownloadPhase::Resuming
                        }
                    }
                }
                Err(FetchError::Cancelled) => {
                    return Err(self.finish_cancelled(&mut state, request, &label, reporter).await);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Attempt for {} failed: {}", label, e);
                    self.spend_retry(&mut state, e.to_string(), &label, reporter)?;
                    DownloadPhase::Retrying
                }
                Err(e) => return Err(self.fail(&mut state, &label, reporter, e)),
            };

            match phase {
                DownloadPhase::Succeeded => {
                    state.total = state.total.max(state.downloaded);
                    info!(
                        "{} successfully downloaded ({} bytes, {} retries)",
                        label, state.downloaded, state.retries_used
                    );
                    emit(reporter, &state, &label, DownloadPhase::Succeeded);
                    reporter.status("Model downloaded.");
                    return Ok(state);
                }
                DownloadPhase::Retrying => {
                    reporter.status("Download failed, retrying...");
                    emit(reporter, &state, &label, DownloadPhase::Retrying);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(self.finish_cancelled(&mut state, request, &label, reporter).await);
                        }
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
                _ => {
                    reporter.status("Error: File download failed. Retrying...");
                }
            }
        }
    }

    /// One GET from the current on-disk offset to the end of the stream
    async fn attempt(
        &self,
        request: &DownloadRequest,
        state: &mut DownloadState,
        label: &str,
        reporter: &dyn StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let offset = state.downloaded;

        let mut builder = self.client.get(&request.url);
        if offset > 0 {
            debug!("Resuming {} with range bytes={}-", label, offset);
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }

        let mut file = open_append(&request.destination).await?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let remote = content_range_total(&response).unwrap_or(offset);
            if offset > remote {
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: format!("local file has {} bytes but remote has {}", offset, remote),
                });
            }
            info!("Remote has no bytes past {} for {}", offset, label);
            state.total = remote;
            state.total_known = true;
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Server {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unexpected status").to_string(),
            });
        }

        let skip = if status == StatusCode::PARTIAL_CONTENT {
            let range = content_range(&response);
            let start = range.and_then(|r| r.start).unwrap_or(offset);
            if start > offset {
                return Err(FetchError::Server {
                    status: status.as_u16(),
                    message: format!("range starts at {} but only {} bytes are on disk", start, offset),
                });
            }
            if start < offset {
                warn!(
                    "Server answered {} from byte {}, skipping {} bytes already on disk",
                    label,
                    start,
                    offset - start
                );
            }

            let total = range
                .and_then(|r| r.total)
                .or_else(|| known_length(&response).map(|len| start + len));
            state.total = total.unwrap_or(offset);
            state.total_known = total.is_some();
            offset - start
        } else {
            let length = known_length(&response);
            if let Some(len) = length {
                if offset > len {
                    return Err(FetchError::Server {
                        status: status.as_u16(),
                        message: format!("local file has {} bytes but remote has {}", offset, len),
                    });
                }
            }
            if offset > 0 {
                warn!("Server ignored range for {}, skipping {} bytes already on disk", label, offset);
            }
            state.total = length.unwrap_or(offset);
            state.total_known = length.is_some();
            offset
        };

        emit(reporter, state, label, DownloadPhase::Downloading);

        let streamed = self
            .stream_body(response, &mut file, skip, state, label, reporter, cancel)
            .await;
        file.flush().await?;
        streamed
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        response: Response,
        file: &mut File,
        mut skip: u64,
        state: &mut DownloadState,
        label: &str,
        reporter: &dyn StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            let chunk = chunk?;

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }

            for piece in data.chunks(self.options.chunk_size) {
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                file.write_all(piece).await?;
                state.downloaded += piece.len() as u64;
                emit(reporter, state, label, DownloadPhase::Downloading);
            }
        }
    }

    fn spend_retry(
        &self,
        state: &mut DownloadState,
        reason: String,
        label: &str,
        reporter: &dyn StatusReporter,
    ) -> Result<(), FetchError> {
        if state.consume_retry(reason) {
            info!(
                "{} retries left for {} ({} used)",
                state.retries_remaining, label, state.retries_used
            );
            return Ok(());
        }

        error!("Retry budget exhausted for {} at {} bytes", label, state.downloaded);
        emit(reporter, state, label, DownloadPhase::Failed);
        reporter.status("Download failed, reach max try count.");
        Err(FetchError::DownloadExhausted {
            attempts: state.retries_used,
            last_error: state.last_error.clone().unwrap_or_default(),
        })
    }

    /// Record a terminal error and report the failure
    fn fail(
        &self,
        state: &mut DownloadState,
        label: &str,
        reporter: &dyn StatusReporter,
        error: FetchError,
    ) -> FetchError {
        error!("Download of {} failed: {}", label, error);
        state.last_error = Some(error.to_string());
        emit(reporter, state, label, DownloadPhase::Failed);
        error
    }

    async fn finish_cancelled(
        &self,
        state: &mut DownloadState,
        request: &DownloadRequest,
        label: &str,
        reporter: &dyn StatusReporter,
    ) -> FetchError {
        if let Ok(size) = file_size(&request.destination).await {
            state.downloaded = size;
        }
        info!("Download of {} cancelled at {} bytes", label, state.downloaded);
        emit(reporter, state, label, DownloadPhase::Cancelled);
        FetchError::Cancelled
    }
}

fn emit(reporter: &dyn StatusReporter, state: &DownloadState, label: &str, phase: DownloadPhase) {
    reporter.progress(&ProgressEvent {
        downloaded: state.downloaded,
        total: state.total.max(state.downloaded),
        label: label.to_string(),
        phase,
    });
}

/// Size of `path`, or 0 when it does not exist yet
async fn file_size(path: &Path) -> Result<u64, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Create the target directory and make sure the destination can be appended to
async fn prepare_destination(request: &DownloadRequest) -> Result<(), FetchError> {
    tokio::fs::create_dir_all(&request.target_dir)
        .await
        .map_err(|e| FetchError::InvalidDestination {
            path: request.target_dir.clone(),
            reason: e.to_string(),
        })?;

    open_append(&request.destination).await.map(drop)
}

/// Open for append only: a crash mid-write still leaves a valid prefix
async fn open_append(path: &Path) -> Result<File, FetchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| FetchError::InvalidDestination {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Non-zero `Content-Length`
fn known_length(response: &Response) -> Option<u64> {
    response.content_length().filter(|len| *len > 0)
}

/// Parsed `Content-Range: bytes a-b/total`, `bytes */total` or `bytes a-b/*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: Option<u64>,
    total: Option<u64>,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    Some(ContentRange {
        start,
        total: total.trim().parse().ok(),
    })
}

fn content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

fn content_range_total(response: &Response) -> Option<u64> {
    content_range(response).and_then(|r| r.total)
}
