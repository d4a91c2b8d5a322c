//! Status reporting - the seam between the engine and whatever displays progress
//!
//! The engine calls a reporter once per chunk, so implementations must return
//! quickly. Anything expensive (redrawing a panel, writing to a socket) should
//! sit behind [`Throttled`] or a channel.

use modelfetch_types::{CoreEvent, DownloadPhase, ProgressEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Receives progress from a running download
pub trait StatusReporter: Send + Sync {
    /// Called for every chunk written and for every phase change
    fn progress(&self, event: &ProgressEvent);

    /// Free-form status line ("Downloading x...", "Download failed, retrying...")
    fn status(&self, _label: &str) {}
}

impl<R: StatusReporter + ?Sized> StatusReporter for Arc<R> {
    fn progress(&self, event: &ProgressEvent) {
        (**self).progress(event)
    }

    fn status(&self, label: &str) {
        (**self).status(label)
    }
}

/// Discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl StatusReporter for NullReporter {
    fn progress(&self, _event: &ProgressEvent) {}
}

/// Forwards updates onto the core event bus
#[derive(Debug, Clone)]
pub struct EventReporter {
    id: Uuid,
    event_tx: broadcast::Sender<CoreEvent>,
    last_phase: Arc<Mutex<Option<DownloadPhase>>>,
}

impl EventReporter {
    pub fn new(id: Uuid, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            id,
            event_tx,
            last_phase: Arc::new(Mutex::new(None)),
        }
    }
}

impl StatusReporter for EventReporter {
    fn progress(&self, event: &ProgressEvent) {
        let phase_changed = {
            let mut last = self.last_phase.lock();
            let changed = *last != Some(event.phase);
            *last = Some(event.phase);
            changed
        };

        // Send errors only mean nobody is subscribed
        if phase_changed {
            let _ = self.event_tx.send(CoreEvent::DownloadPhaseChanged {
                id: self.id,
                phase: event.phase,
                label: event.label.clone(),
            });
        }
        let _ = self.event_tx.send(CoreEvent::DownloadProgress {
            id: self.id,
            downloaded: event.downloaded,
            total: event.total,
            label: event.label.clone(),
        });
    }
}

/// Rate-limits non-terminal progress updates to one per interval
///
/// Phase changes and the event that reaches the total always pass through,
/// so the final state is never swallowed.
pub struct Throttled<R> {
    inner: R,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl<R: StatusReporter> Throttled<R> {
    pub fn new(inner: R, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_emit: Mutex::new(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: StatusReporter> StatusReporter for Throttled<R> {
    fn progress(&self, event: &ProgressEvent) {
        let significant = event.phase != DownloadPhase::Downloading
            || (event.total > 0 && event.downloaded >= event.total);

        {
            let mut last = self.last_emit.lock();
            let due = last.map_or(true, |t| t.elapsed() >= self.interval);
            if !significant && !due {
                return;
            }
            *last = Some(Instant::now());
        }

        self.inner.progress(event);
    }

    fn status(&self, label: &str) {
        self.inner.status(label);
    }
}

/// Sends every update to several reporters in order
#[derive(Default)]
pub struct Fanout {
    reporters: Vec<Box<dyn StatusReporter>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: impl StatusReporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl StatusReporter for Fanout {
    fn progress(&self, event: &ProgressEvent) {
        for reporter in &self.reporters {
            reporter.progress(event);
        }
    }

    fn status(&self, label: &str) {
        for reporter in &self.reporters {
            reporter.status(label);
        }
    }
}
