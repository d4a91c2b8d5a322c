//! Progress bar for CLI downloads

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use modelfetch_core::StatusReporter;
use modelfetch_types::{DownloadPhase, ProgressEvent};

/// Drives a single indicatif bar from engine progress
#[derive(Clone)]
pub struct DownloadBar {
    bar: ProgressBar,
}

impl DownloadBar {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// A bar that never draws, for machine-readable output
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        Self { bar }
    }
}

impl Default for DownloadBar {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter for DownloadBar {
    fn progress(&self, event: &ProgressEvent) {
        if event.total > 0 {
            self.bar.set_length(event.total);
        }
        self.bar.set_position(event.downloaded);

        match event.phase {
            DownloadPhase::Probing => {
                self.bar.set_message(format!("{} resolving", style("?").dim()));
            }
            DownloadPhase::Retrying | DownloadPhase::Resuming => {
                self.bar
                    .set_message(format!("{} {}", style("↻").yellow(), event.phase));
            }
            DownloadPhase::Succeeded => {
                self.bar.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    event.label
                ));
            }
            DownloadPhase::Failed => {
                self.bar
                    .abandon_with_message(format!("{} Failed", style("✗").red().bold()));
            }
            DownloadPhase::Cancelled => {
                self.bar
                    .abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
            DownloadPhase::Downloading => {}
        }
    }

    fn status(&self, label: &str) {
        if !self.bar.is_finished() {
            self.bar.set_message(label.to_string());
        }
    }
}
