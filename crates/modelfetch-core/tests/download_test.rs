//! Engine behavior against a live (local) HTTP server

mod common;

use common::{payload, FakeServer, Reply};
use modelfetch_core::engine::{DownloadEngine, EngineOptions};
use modelfetch_core::{FetchError, NullReporter, StatusReporter};
use modelfetch_types::{DownloadPhase, DownloadRequest, ProgressEvent, ShortReadPolicy};
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BODY_LEN: usize = 10_000;

fn engine(max_retries: u32, short_read_policy: ShortReadPolicy) -> DownloadEngine {
    DownloadEngine::new(
        reqwest::Client::new(),
        EngineOptions {
            max_retries,
            retry_delay: Duration::from_millis(10),
            chunk_size: 1024,
            short_read_policy,
        },
    )
}

fn request(server: &FakeServer, dir: &Path) -> DownloadRequest {
    DownloadRequest::new(server.url("files/model"), dir, "model.safetensors")
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl StatusReporter for Recorder {
    fn progress(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

#[tokio::test]
async fn test_fresh_download_writes_whole_body() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(state.downloaded, BODY_LEN as u64);
    assert_eq!(state.total, BODY_LEN as u64);
    assert_eq!(state.retries_used, 0);
    assert_eq!(server.download_ranges(), vec![None]);
}

#[tokio::test]
async fn test_resumes_from_existing_prefix() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, &body[..3000]).unwrap();

    engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(server.download_ranges(), vec![Some("bytes=3000-".to_string())]);
}

#[tokio::test]
async fn test_dropped_connections_resume_and_spend_retries() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.script([Reply::DropAfter(4000), Reply::DropAfter(4000)]);
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(state.retries_used, 2);

    let ranges = server.download_ranges();
    assert_eq!(ranges.len(), 3);
    assert_eq!(ranges[0], None);
}

#[tokio::test]
async fn test_exhausted_budget_keeps_partial_file() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::DropAfter(1000));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::DownloadExhausted { attempts: 5, .. }));
    assert_eq!(server.download_ranges().len(), 5);

    let partial = std::fs::read(&request.destination).unwrap();
    assert!(!partial.is_empty());
    assert!(partial.len() < BODY_LEN);
    assert_eq!(&body[..partial.len()], &partial[..]);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.script([Reply::Status(503)]);
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.retries_used, 1);
    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
}

#[tokio::test]
async fn test_client_errors_fail_without_retry() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    server.default_reply(Reply::Status(403));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Server { status: 403, .. }));
    assert_eq!(server.download_ranges().len(), 1);
}

#[tokio::test]
async fn test_missing_resource_during_download() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    server.default_reply(Reply::Status(404));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::NotFound { status: 404, .. }));
    assert_eq!(server.download_ranges().len(), 1);
}

#[tokio::test]
async fn test_unknown_length_reads_to_end() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::NoLength);
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(state.downloaded, BODY_LEN as u64);
}

#[tokio::test]
async fn test_ignored_range_skips_bytes_already_on_disk() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::IgnoreRange);
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, &body[..3000]).unwrap();

    engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(server.download_ranges(), vec![Some("bytes=3000-".to_string())]);
}

#[tokio::test]
async fn test_partial_reply_from_earlier_byte_is_realigned() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::RangeFrom(0));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, &body[..3000]).unwrap();

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.downloaded, BODY_LEN as u64);
    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(server.download_ranges(), vec![Some("bytes=3000-".to_string())]);
}

#[tokio::test]
async fn test_partial_reply_past_local_end_is_rejected() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::RangeFrom(5000));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, &body[..3000]).unwrap();
    let reporter = Recorder::default();

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &reporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Server { status: 206, .. }));
    assert_eq!(std::fs::read(&request.destination).unwrap(), &body[..3000]);
    assert_eq!(reporter.events.lock().last().unwrap().phase, DownloadPhase::Failed);
}

#[tokio::test]
async fn test_destination_that_is_a_directory_is_invalid() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::create_dir(&request.destination).unwrap();

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::InvalidDestination { .. }));
    assert!(server.download_ranges().is_empty());
}

#[tokio::test]
async fn test_short_reads_spend_budget() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::CapAt(4000));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(state.retries_used, 2);
    assert_eq!(
        server.download_ranges(),
        vec![
            None,
            Some("bytes=4000-".to_string()),
            Some("bytes=8000-".to_string())
        ]
    );
}

#[tokio::test]
async fn test_short_reads_can_exhaust_budget() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    server.default_reply(Reply::CapAt(4000));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let err = engine(2, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::DownloadExhausted { attempts: 2, .. }));
    assert_eq!(std::fs::metadata(&request.destination).unwrap().len(), 8000);
}

#[tokio::test]
async fn test_free_short_reads_leave_budget_alone() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    server.default_reply(Reply::CapAt(4000));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());

    let state = engine(1, ShortReadPolicy::Free)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(state.retries_used, 0);
}

#[tokio::test]
async fn test_complete_file_is_accepted_on_416() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, &body).unwrap();

    let state = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.downloaded, BODY_LEN as u64);
    assert_eq!(state.total, BODY_LEN as u64);
    assert_eq!(std::fs::read(&request.destination).unwrap(), body);
    assert_eq!(server.download_ranges(), vec![Some("bytes=10000-".to_string())]);
}

#[tokio::test]
async fn test_local_file_larger_than_remote_fails() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    std::fs::write(&request.destination, payload(BODY_LEN + 2000)).unwrap();

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &NullReporter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Server { status: 416, .. }));
    assert_eq!(
        std::fs::metadata(&request.destination).unwrap().len(),
        (BODY_LEN + 2000) as u64
    );
}

#[tokio::test]
async fn test_cancellation_keeps_partial_file() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    server.default_reply(Reply::Stall(2048));
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    let reporter = Recorder::default();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &reporter, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Cancelled));
    assert_eq!(std::fs::metadata(&request.destination).unwrap().len(), 2048);

    let events = reporter.events.lock();
    let last = events.last().unwrap();
    assert_eq!(last.phase, DownloadPhase::Cancelled);
    assert_eq!(last.downloaded, 2048);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_succeeded() {
    let body = payload(BODY_LEN);
    let server = FakeServer::start(body).await;
    server.script([Reply::DropAfter(4000)]);
    let dir = tempfile::tempdir().unwrap();
    let request = request(&server, dir.path());
    let reporter = Recorder::default();

    engine(5, ShortReadPolicy::ConsumeRetry)
        .download(&request, &reporter, &CancellationToken::new())
        .await
        .unwrap();

    let events = reporter.events.lock();
    assert!(events.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
    assert!(events.iter().any(|e| e.phase == DownloadPhase::Retrying));
    assert!(events.iter().all(|e| e.label == "model.safetensors"));
    assert!(events.iter().filter(|e| e.phase == DownloadPhase::Downloading).count() >= 10);

    let last = events.last().unwrap();
    assert_eq!(last.phase, DownloadPhase::Succeeded);
    assert_eq!(last.downloaded, BODY_LEN as u64);
    assert_eq!(last.total, BODY_LEN as u64);
}

#[tokio::test]
async fn test_resolve_file_name_from_disposition() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    let engine = engine(5, ShortReadPolicy::ConsumeRetry);

    server.disposition(r#"attachment; filename="report.safetensors""#);
    assert_eq!(
        engine.resolve_file_name(&server.url("a")).await.unwrap(),
        "report.safetensors"
    );

    server.disposition("attachment; filename=report.safetensors");
    assert_eq!(
        engine.resolve_file_name(&server.url("a")).await.unwrap(),
        "report.safetensors"
    );

    assert_eq!(server.probe_count(), 2);
    assert!(server.download_ranges().is_empty());
}

#[tokio::test]
async fn test_resolve_file_name_failures() {
    let server = FakeServer::start(payload(BODY_LEN)).await;
    let engine = engine(5, ShortReadPolicy::ConsumeRetry);

    let err = engine.resolve_file_name(&server.url("a")).await.unwrap_err();
    assert!(matches!(err, FetchError::NameResolution(_)));

    server.probe_status(404);
    let err = engine.resolve_file_name(&server.url("a")).await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound { status: 404, .. }));
}
