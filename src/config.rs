use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordination::{GatePolicy, RegistryConfig};
use crate::domain::BranchId;
use crate::oracle::QuoteValidation;
use crate::supervisor::{RetryPolicy, SupervisorConfig};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Branches under supervision
    #[serde(default)]
    pub branches: Vec<BranchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    /// Probe interval per branch in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Registry write attempts per cycle before giving up until the next one
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,
    #[serde(default = "default_write_backoff_initial")]
    pub write_backoff_initial_ms: u64,
    #[serde(default = "default_write_backoff_max")]
    pub write_backoff_max_ms: u64,
    /// Oldest last good price still used for the deviation check
    #[serde(default = "default_reference_max_age")]
    pub reference_max_age_ms: u64,
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_write_retry_attempts() -> u32 {
    5
}

fn default_write_backoff_initial() -> u64 {
    50
}

fn default_write_backoff_max() -> u64 {
    2000
}

fn default_reference_max_age() -> u64 {
    30_000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
            write_retry_attempts: default_write_retry_attempts(),
            write_backoff_initial_ms: default_write_backoff_initial(),
            write_backoff_max_ms: default_write_backoff_max(),
            reference_max_age_ms: default_reference_max_age(),
        }
    }
}

impl SupervisorSettings {
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            write_retry: RetryPolicy {
                max_attempts: self.write_retry_attempts,
                initial_backoff: Duration::from_millis(self.write_backoff_initial_ms),
                max_backoff: Duration::from_millis(self.write_backoff_max_ms),
            },
            reference_max_age: Duration::from_millis(self.reference_max_age_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    /// Longest wait for a branch write lock before reporting contention
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Longest single state-store write before it counts as failed
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_write_timeout() -> u64 {
    500
}

fn default_store_timeout() -> u64 {
    2000
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl RegistrySettings {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            write_timeout_ms: self.write_timeout_ms,
            store_timeout_ms: self.store_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PersistenceConfig {
    /// JSON file holding shutdown states. Unset keeps state in memory only.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rotated log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchConfig {
    pub id: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub policy: GatePolicy,
}

impl BranchConfig {
    pub fn branch_id(&self) -> BranchId {
        BranchId::new(self.id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// HTTP endpoint returning a JSON document
    pub url: String,
    /// JSON pointer to the price (e.g. "/data/price")
    pub price_pointer: String,
    /// JSON pointer to the publication time in unix seconds
    #[serde(default)]
    pub published_at_pointer: Option<String>,
    /// Quotes older than this are stale
    #[serde(default)]
    pub max_quote_age_secs: Option<u64>,
    /// Largest accepted move against the last good price, in percent
    #[serde(default)]
    pub max_deviation_pct: Option<Decimal>,
}

impl SourceConfig {
    pub fn quote_validation(&self) -> QuoteValidation {
        QuoteValidation {
            max_quote_age: self
                .max_quote_age_secs
                .map(|secs| chrono::Duration::seconds(secs as i64)),
            max_deviation: self
                .max_deviation_pct
                .map(|pct| pct / Decimal::ONE_HUNDRED),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Self::with_defaults(Config::builder())?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SENTINEL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SENTINEL__SUPERVISOR__POLL_INTERVAL_MS, etc.)
            .add_source(
                Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from one explicit file, still honouring environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("supervisor.poll_interval_ms", default_poll_interval())?
            .set_default("supervisor.probe_timeout_ms", default_probe_timeout())?
            .set_default("registry.write_timeout_ms", default_write_timeout())?
            .set_default("registry.store_timeout_ms", default_store_timeout())
    }

    pub fn branch_ids(&self) -> Vec<BranchId> {
        self.branches.iter().map(BranchConfig::branch_id).collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate supervisor params
        let sup = &self.supervisor;
        if sup.poll_interval_ms == 0 {
            errors.push("supervisor.poll_interval_ms must be positive".to_string());
        }
        if sup.probe_timeout_ms == 0 {
            errors.push("supervisor.probe_timeout_ms must be positive".to_string());
        }
        if sup.probe_timeout_ms > sup.poll_interval_ms {
            errors.push(
                "supervisor.probe_timeout_ms should not exceed poll_interval_ms".to_string(),
            );
        }
        if sup.write_retry_attempts == 0 {
            errors.push("supervisor.write_retry_attempts must be at least 1".to_string());
        }
        if sup.write_backoff_initial_ms > sup.write_backoff_max_ms {
            errors.push(
                "supervisor.write_backoff_initial_ms should not exceed write_backoff_max_ms"
                    .to_string(),
            );
        }

        if sup.reference_max_age_ms < sup.poll_interval_ms {
            errors.push(
                "supervisor.reference_max_age_ms should not be shorter than poll_interval_ms"
                    .to_string(),
            );
        }

        if self.registry.write_timeout_ms == 0 {
            errors.push("registry.write_timeout_ms must be positive".to_string());
        }
        if self.registry.store_timeout_ms == 0 {
            errors.push("registry.store_timeout_ms must be positive".to_string());
        }

        // Validate branches
        if self.branches.is_empty() {
            errors.push("at least one branch must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for branch in &self.branches {
            if branch.id.trim().is_empty() {
                errors.push("branch id must not be empty".to_string());
                continue;
            }
            if !seen.insert(branch.id.as_str()) {
                errors.push(format!("duplicate branch id {}", branch.id));
            }
            if branch.source.url.trim().is_empty() {
                errors.push(format!("branch {}: source.url must not be empty", branch.id));
            }
            if !branch.source.price_pointer.starts_with('/') {
                errors.push(format!(
                    "branch {}: source.price_pointer must be a JSON pointer",
                    branch.id
                ));
            }
            if let Some(pct) = branch.source.max_deviation_pct {
                if pct <= Decimal::ZERO {
                    errors.push(format!(
                        "branch {}: source.max_deviation_pct must be positive",
                        branch.id
                    ));
                }
            }
            if branch.source.max_quote_age_secs == Some(0) {
                errors.push(format!(
                    "branch {}: source.max_quote_age_secs must be positive",
                    branch.id
                ));
            }
            for problem in branch.policy.validate() {
                errors.push(format!("branch {}: {}", branch.id, problem));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
