//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::events::StreamContext;

/// streamd - stream text generation from a local Ollama server
#[derive(Parser)]
#[command(
    name = "streamd",
    about = "Stream text generation from a local Ollama server and watch the event flow",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Ollama host, overriding the config file
    #[arg(long, global = true, value_name = "URL")]
    pub host: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check the connection and list installed models
    Models,

    /// Stream one generation per prompt, concurrently
    Run {
        /// Model to use (defaults to config `defaults.model`)
        #[arg(short, long)]
        model: Option<String>,

        /// Context tag for the streams
        #[arg(long, value_name = "CONTEXT", value_parser = parse_context)]
        context: Option<StreamContext>,

        /// Write the session log as JSON when done
        #[arg(short, long, value_name = "PATH")]
        export: Option<PathBuf>,

        /// Prompts; each one becomes its own stream
        #[arg(required = true)]
        prompts: Vec<String>,
    },
}

fn parse_context(s: &str) -> Result<StreamContext, String> {
    s.parse()
}

/// Path of the log file written by the binary
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("streamd")
        .join("logs")
        .join("streamd.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Text shown after `--help`
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let contexts: Vec<&str> = StreamContext::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "Contexts: {}\n\nLogs are written to: {}",
        contexts.join(", "),
        get_log_path().display()
    )
}
