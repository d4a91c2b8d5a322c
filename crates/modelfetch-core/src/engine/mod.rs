//! Download Engine - the heart of modelfetch
//!
//! This module implements a resumable, single-stream download engine with:
//! - File name discovery from a small range probe
//! - Append-only writes that survive crashes and restarts
//! - A bounded retry budget with fixed backoff
//! - Per-destination serialization and cooperative cancellation

mod downloader;
mod manager;
pub mod resolver;

pub use downloader::*;
pub use manager::*;
