//! Application configuration
//!
//! Ambient, process-wide settings that every subcommand shares: verbosity,
//! working directory, and the planning API credentials.

use std::path::PathBuf;

/// Application-wide configuration, built once in `main` and threaded through
/// to the orchestrator and logging setup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging (`-v`, `-vv`, `-vvv`).
    pub verbose: u8,
    /// Working directory commands run relative to.
    pub working_dir: PathBuf,
    /// Planning API base URL, e.g. `https://planning.example.com`.
    pub planning_base_url: String,
    /// Planning API bearer token, read from `ORCHESTRA_TOKEN`.
    pub planning_token: Option<String>,
}

impl AppConfig {
    pub fn new(verbose: u8) -> anyhow::Result<Self> {
        let working_dir = std::env::current_dir()
            .map_err(|e| anyhow::anyhow!("failed to get current directory: {e}"))?;

        Ok(Self {
            verbose,
            working_dir,
            planning_base_url: std::env::var("ORCHESTRA_PLANNING_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            planning_token: std::env::var("ORCHESTRA_TOKEN").ok(),
        })
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    /// Log level string derived from verbosity, per the same scaling the
    /// `-v` flag uses everywhere else in this crate's CLI.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,hyper=debug,reqwest=debug",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            working_dir: PathBuf::from("."),
            planning_base_url: "http://localhost:4000".to_string(),
            planning_token: None,
        }
    }
}
