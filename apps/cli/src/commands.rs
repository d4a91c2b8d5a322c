//! CLI command implementations

use crate::output::{failure, format_bytes, print_output, success, truncate_name};
use crate::progress::DownloadBar;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use modelfetch_core::{FetchError, ModelFetchCore, SettingsStore, StatusReporter};
use modelfetch_types::{DownloadOutcome, FetchRequest, ModelCategory, Settings};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get_model(
    core: &ModelFetchCore,
    url: String,
    category: ModelCategory,
    name: Option<String>,
    format: OutputFormat,
) -> Result<Finished> {
    let mut request = FetchRequest::new(url, category);
    if let Some(name) = name {
        request = request.with_file_name(name);
    }

    let bar = match format {
        OutputFormat::Json => DownloadBar::hidden(),
        OutputFormat::Human | OutputFormat::Table => DownloadBar::new(),
    };
    let reporter: Arc<dyn StatusReporter> = Arc::new(bar);

    // Ctrl-C stops the transfer; the partial file stays for the next run
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling download");
                cancel.cancel();
            }
        })
    };

    let result = core.download_with_cancel(request, reporter, cancel).await;
    interrupt.abort();

    let Some(outcome) = settle(result)? else {
        failure("Download cancelled, partial file kept for resume");
        return Ok(Finished::Interrupted);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Human | OutputFormat::Table => {
            success(outcome.message());
            println!("  Path: {}", outcome.path.display());
            println!("  Size: {}", format_bytes(outcome.downloaded));
            if outcome.retries_used > 0 {
                println!("  Retries: {}", outcome.retries_used);
            }
        }
    }
    Ok(Finished::Done)
}

/// How a `get` ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    Done,
    /// Stopped by Ctrl-C
    Interrupted,
}

impl Finished {
    /// Process exit code; 130 is the shell convention for SIGINT
    pub fn exit_code(self) -> i32 {
        match self {
            Finished::Done => 0,
            Finished::Interrupted => 130,
        }
    }
}

/// Cancellation is an expected ending, not an error to report
fn settle(result: Result<DownloadOutcome, FetchError>) -> Result<Option<DownloadOutcome>> {
    match result {
        Ok(outcome) => Ok(Some(outcome)),
        Err(FetchError::Cancelled) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Outcome of probing one URL
#[derive(Serialize)]
struct ProbeResult {
    url: String,
    file_name: Option<String>,
    error: Option<String>,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file_name, &self.error) {
            (Some(name), _) => write!(f, "{} {}\n  {}", style("✓").green().bold(), style(name).cyan(), self.url),
            (None, Some(error)) => write!(f, "{} {}\n  {}", style("✗").red().bold(), self.url, style(error).red()),
            (None, None) => write!(f, "{} {}", style("·").dim(), self.url),
        }
    }
}

pub async fn probe_urls(core: &ModelFetchCore, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    if urls.is_empty() {
        return Err(anyhow!("No URLs given"));
    }

    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        debug!("Probing {}", url);
        let result = match core.probe(&url).await {
            Ok(name) => ProbeResult {
                url,
                file_name: Some(name),
                error: None,
            },
            Err(e) => ProbeResult {
                url,
                file_name: None,
                error: Some(e.to_string()),
            },
        };
        results.push(result);
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Human | OutputFormat::Table => {
            for result in &results {
                print_output(result, format)?;
            }
        }
    }

    Ok(())
}

// ============================================================================
// Local Models
// ============================================================================

pub async fn list_models(
    core: &ModelFetchCore,
    category: Option<ModelCategory>,
    format: OutputFormat,
) -> Result<()> {
    let registry = core.local_models(category).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(registry.models())?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ModelRow {
                name: String,
                size: String,
            }

            let rows: Vec<ModelRow> = registry
                .models()
                .iter()
                .map(|m| ModelRow {
                    name: truncate_name(&m.name, 48),
                    size: format_bytes(m.size),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if registry.is_empty() {
                println!(
                    "{} {}",
                    style("No models found in").dim(),
                    style(registry.root().display()).dim()
                );
                return Ok(());
            }

            for model in registry.models() {
                println!(
                    "{} {} {}",
                    style("·").dim(),
                    style(&model.name).bold(),
                    style(format_bytes(model.size)).dim()
                );
            }
            println!();
            println!(
                "{} model(s), {} in {}",
                style(registry.len()).bold(),
                format_bytes(registry.total_size()),
                registry.root().display()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    store: &SettingsStore,
    models_dir: Option<PathBuf>,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let mut settings = store.load().await?;
            if let Some(root) = models_dir {
                settings.models_root = root;
            }
            show_settings(&settings, format)?;
        }
        ConfigAction::Path => {
            println!("{}", store.path().display());
        }
        ConfigAction::Init { force } => {
            if store.path().exists() && !force {
                let overwrite = dialoguer::Confirm::new()
                    .with_prompt(format!("{} exists. Overwrite with defaults?", store.path().display()))
                    .default(false)
                    .interact()?;
                if !overwrite {
                    println!("{}", style("Settings left unchanged").dim());
                    return Ok(());
                }
            }

            let mut settings = Settings::default();
            if let Some(root) = models_dir {
                settings.models_root = root;
            }
            store.save(&settings).await?;
            success(format!("Wrote {}", store.path().display()));
        }
    }

    Ok(())
}

fn show_settings(settings: &Settings, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(settings)?);
        return Ok(());
    }

    println!("{}", style("Settings").bold());
    println!("  Models root:     {}", settings.models_root.display());
    println!("  Max retries:     {}", settings.max_retries);
    println!("  Retry delay:     {}s", settings.retry_delay_secs);
    println!("  Chunk size:      {}", format_bytes(settings.chunk_size as u64));
    println!("  Connect timeout: {}s", settings.connect_timeout_secs);
    println!("  Read timeout:    {}s", settings.read_timeout_secs);
    println!("  User agent:      {}", settings.user_agent);
    println!("  Short reads:     {:?}", settings.short_read_policy);
    println!();
    println!("{}", style("Category directories").bold());
    for category in ModelCategory::ALL {
        println!(
            "  {:<18} {}",
            category.label(),
            settings.directory_for(category).display()
        );
    }

    Ok(())
}
