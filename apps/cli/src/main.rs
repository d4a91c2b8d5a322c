//! modelfetch CLI - download model files with resume and retry
//!
//! A terminal host for the modelfetch engine: resolves file names, drops
//! models into their category directories and survives flaky connections.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use modelfetch_core::{ModelFetchCore, SettingsStore};
use modelfetch_types::ModelCategory;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// modelfetch - Resumable model downloader
#[derive(Parser)]
#[command(name = "modelfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file to use
    #[arg(long, env = "MODELFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory that category folders are resolved against
    #[arg(long, env = "MODELFETCH_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a model
    Get {
        /// URL to download
        url: String,

        /// Model category; decides the destination directory
        #[arg(short, long, default_value = "checkpoint")]
        category: ModelCategory,

        /// File name to save as instead of asking the server
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show the file name a URL would be saved under
    Probe {
        /// URLs to probe
        urls: Vec<String>,
    },

    /// List models already on disk
    List {
        /// Category to list (checkpoints by default)
        #[arg(short, long)]
        category: Option<ModelCategory>,
    },

    /// Show or create the settings file
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective settings
    Show,

    /// Print where the settings file lives
    Path,

    /// Write a settings file with default values
    Init {
        /// Overwrite an existing file without asking
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "info" } else { "warn" }));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let store = cli
        .config
        .map(SettingsStore::new)
        .unwrap_or_else(SettingsStore::default_location);

    // Execute command
    match cli.command {
        Commands::Get {
            url,
            category,
            name,
        } => {
            let core = build_core(&store, cli.models_dir).await?;
            let finished = commands::get_model(&core, url, category, name, cli.output).await?;
            if finished != commands::Finished::Done {
                std::process::exit(finished.exit_code());
            }
        }

        Commands::Probe { urls } => {
            let core = build_core(&store, cli.models_dir).await?;
            commands::probe_urls(&core, urls, cli.output).await?
        }

        Commands::List { category } => {
            let core = build_core(&store, cli.models_dir).await?;
            commands::list_models(&core, category, cli.output).await?
        }

        Commands::Config { action } => {
            commands::config_action(&store, cli.models_dir, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "modelfetch", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Load settings, apply command-line overrides and build the core
async fn build_core(store: &SettingsStore, models_dir: Option<PathBuf>) -> Result<ModelFetchCore> {
    let mut settings = store.load().await?;
    if let Some(root) = models_dir {
        settings.models_root = root;
    }
    Ok(ModelFetchCore::new(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_formats_parse() {
        for (value, expected) in [("human", "Human"), ("json", "Json"), ("table", "Table")] {
            let cli = Cli::try_parse_from(["modelfetch", "--output", value, "list"]).unwrap();
            assert_eq!(format!("{:?}", cli.output), expected);
        }
        assert!(Cli::try_parse_from(["modelfetch", "--output", "yaml", "list"]).is_err());
    }

    #[test]
    fn test_get_parses_category_label() {
        let cli = Cli::try_parse_from(["modelfetch", "get", "http://host/m", "-c", "LoRA"]).unwrap();
        match cli.command {
            Commands::Get { category, name, .. } => {
                assert_eq!(category, ModelCategory::Lora);
                assert!(name.is_none());
            }
            _ => panic!("expected get"),
        }
    }
}
