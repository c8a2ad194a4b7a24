//! Oracle Sentinel CLI
//!
//! Commands:
//! - `oracle-sentinel run` - supervise every configured branch until stopped
//! - `oracle-sentinel status` - persisted shutdown state per branch
//! - `oracle-sentinel recover|halt|trip` - operator transitions on the state file
//! - `oracle-sentinel check-config` - validate configuration

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;

pub use output::OutputMode;

/// Oracle health and shutdown consistency engine
#[derive(Parser, Debug)]
#[command(name = "oracle-sentinel")]
#[command(author, version, about = "Halts dependent modules when their price oracle fails")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides --config-dir)
    #[arg(short, long, global = true, env = "SENTINEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding default.toml and <SENTINEL_ENV>.toml
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe every branch until SIGINT/SIGTERM
    Run,

    /// Show persisted shutdown state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear a temporary shutdown
    Recover {
        branch: String,
        /// Operator taking responsibility for the recovery
        #[arg(short, long)]
        operator: String,
    },

    /// Shut a branch down permanently
    Halt {
        branch: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Put a branch into temporary shutdown
    Trip {
        branch: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Validate configuration and list branches
    CheckConfig {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::load_from(&self.config_dir)?,
        };
        Ok(config)
    }
}
