//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use serde::Serialize;
use std::fmt::Display;

/// Print a value as JSON or through its `Display` impl
pub fn print_output<T: Serialize + Display>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human | OutputFormat::Table => println!("{}", value),
    }
    Ok(())
}

/// Green check line on stdout
pub fn success(message: impl Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Red cross line on stderr
pub fn failure(message: impl Display) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Shorten long names for table cells, keeping the extension visible
pub fn truncate_name(name: &str, max: usize) -> String {
    let count = name.chars().count();
    if count <= max || max < 4 {
        return name.to_string();
    }
    let tail: String = name.chars().skip(count - (max - 3) / 2).collect();
    let head: String = name.chars().take(max - 3 - tail.chars().count()).collect();
    format!("{}...{}", head, tail)
}
