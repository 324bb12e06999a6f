//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Tail an NSQ topic, or publish stdin lines to it.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file. Defaults to ~/.config/nsqlink/tail.toml.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}
