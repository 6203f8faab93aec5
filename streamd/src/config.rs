//! streamd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::events::StreamContext;

/// Main streamd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Ollama server connection
    pub ollama: OllamaConfig,

    /// Session log bounds
    #[serde(rename = "session-log")]
    pub session_log: SessionLogConfig,

    /// Defaults for new streams
    pub defaults: DefaultsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Never fails: any problem just means "no configured level".
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let read = |path: &Path| -> Option<String> {
            let content = fs::read_to_string(path).ok()?;
            serde_yaml::from_str::<Self>(&content).ok()?.log_level
        };

        match config_path {
            Some(path) => read(path),
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .and_then(|p| read(&p)),
        }
    }

    /// Project-local `.streamd.yml`, then `~/.config/streamd/streamd.yml`
    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".streamd.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("streamd").join("streamd.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Ollama server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Base URL of the server
    pub host: String,

    /// Connect timeout, and total timeout for non-streaming calls
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Retries for transient failures before a response starts
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            timeout_ms: 300_000,
            max_retries: 3,
        }
    }
}

/// Session log bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLogConfig {
    /// Entries kept across all sessions; oldest are dropped first
    #[serde(rename = "max-entries")]
    pub max_entries: usize,

    /// Closed sessions kept; the open session is always kept
    #[serde(rename = "max-sessions")]
    pub max_sessions: usize,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_sessions: 10,
        }
    }
}

/// Defaults applied to streams started from the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub model: String,
    pub context: StreamContext,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            context: StreamContext::ManualDebug,
        }
    }
}
