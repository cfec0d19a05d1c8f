//! Command-line interface for voxlive
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Live voice sessions with an agent backend
#[derive(Parser, Debug)]
#[command(
    name = "voxlive",
    version,
    about = "Live voice sessions with an agent backend"
)]
pub struct Cli {
    /// Subcommand to execute (default: start an interactive session)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: session events, -vv: per-chunk diagnostics)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Agent endpoint (ws:// or wss://)
    #[arg(long, short = 'e', value_name = "URL")]
    pub endpoint: Option<String>,

    /// Audio input device (e.g., hw:0)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Audio output device
    #[arg(long, value_name = "DEVICE")]
    pub output_device: Option<String>,

    /// Turn-complete grace window. Examples: 200, 250ms, 1s
    #[arg(long, value_name = "DURATION", value_parser = parse_grace)]
    pub grace: Option<Duration>,

    /// JSON file with a context summary sent after connecting
    #[arg(long, value_name = "FILE")]
    pub context: Option<PathBuf>,
}

/// Parse a grace window.
///
/// Bare numbers are milliseconds; anything else goes through `humantime`
/// (`250ms`, `1s`, `1s500ms`).
fn parse_grace(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available audio input and output devices
    Devices,

    /// View and initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
