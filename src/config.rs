//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILVAULT_CONFIG` (environment variable)
//! 2. `~/.config/mailvault/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailvault\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{EngineConfig, RunOptions, DEFAULT_ANCHOR};
use crate::destination::FolderHandle;
use crate::export::writer::{WriterConfig, DEFAULT_MAX_ATTACHMENT_BYTES};
use crate::kv::DEFAULT_MAX_VALUE_SIZE;
use crate::ledger::LedgerConfig;
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    /// Where records come from.
    pub source: SourceConfig,
    /// Where the archive is written.
    pub destination: DestinationConfig,
    /// Per-run limits.
    pub run: RunConfig,
    pub ledger: LedgerSettings,
    pub attachments: AttachmentsConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// MBOX file to archive.
    pub mbox: Option<PathBuf>,
    /// Base search query (`from:bank label:receipts`).
    pub query: String,
    /// Records requested per search call.
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Root directory of the destination store.
    pub root: Option<PathBuf>,
    /// Name of the archive folder below the root.
    pub anchor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_records: usize,
    pub time_budget_secs: u64,
    /// Pause between records, in milliseconds.
    pub pacing_ms: u64,
    /// Persist the ledger after this many newly archived records.
    pub checkpoint_every: usize,
    /// Double-check ledger hits against the destination.
    pub verify_ledger_hits: bool,
}

/// Ledger persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Compact above this serialized size.
    pub ceiling_bytes: usize,
    pub retention_days: u32,
    /// Directory holding ledger and cursor files. Defaults to the cache dir.
    pub state_dir: Option<PathBuf>,
    /// Largest value the state store accepts.
    pub max_value_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentsConfig {
    pub max_bytes: u64,
    /// MIME types to keep (`image/*` allowed). Empty keeps everything.
    pub allowed_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mbox: None,
            query: String::new(),
            page_size: 50,
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            root: None,
            anchor: DEFAULT_ANCHOR.to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            time_budget_secs: 300,
            pacing_ms: 0,
            checkpoint_every: 25,
            verify_ledger_hits: false,
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            ceiling_bytes: 400 * 1024,
            retention_days: 90,
            state_dir: None,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            allowed_types: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

// ── Conversions into engine settings ────────────────────────────

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            base_query: self.source.query.clone(),
            page_size: self.source.page_size,
            pacing: Duration::from_millis(self.run.pacing_ms),
            checkpoint_every: self.run.checkpoint_every,
            verify_ledger_hits: self.run.verify_ledger_hits,
            anchor: FolderHandle::root().child(self.destination.anchor.clone()),
            writer: WriterConfig {
                max_attachment_bytes: self.attachments.max_bytes,
                allowed_types: self.attachments.allowed_types.clone(),
            },
            retry: RetryPolicy {
                attempts: self.retry.attempts,
                backoff: Duration::from_millis(self.retry.backoff_ms),
            },
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ceiling_bytes: self.ledger.ceiling_bytes,
            retention: chrono::Duration::days(i64::from(self.ledger.retention_days)),
            ..LedgerConfig::default()
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_records: self.run.max_records,
            time_budget: Duration::from_secs(self.run.time_budget_secs),
            force_reprocess: false,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<PathBuf> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(path)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILVAULT_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailvault").join("config.toml"))
}

/// Return the cache directory for logs and, by default, engine state.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailvault")
}

/// Directory holding the ledger and run cursor.
pub fn state_dir(config: &Config) -> PathBuf {
    match config.ledger.state_dir {
        Some(ref dir) => dir.clone(),
        None => cache_dir(config).join("state"),
    }
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailvault.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.destination.anchor, "Mail Archive");
        assert_eq!(cfg.run.max_records, 100);
        assert_eq!(cfg.ledger.ceiling_bytes, 400 * 1024);
        assert!(cfg.attachments.allowed_types.is_empty());
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let mut cfg = Config::default();
        cfg.attachments.allowed_types = vec!["image/*".into()];
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.run.time_budget_secs, cfg.run.time_budget_secs);
        assert_eq!(parsed.attachments.allowed_types, ["image/*"]);
        assert_eq!(parsed.retry.backoff_ms, 500);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[source]
query = "from:bank"

[run]
pacing_ms = 250
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.source.query, "from:bank");
        assert_eq!(cfg.source.page_size, 50);
        assert_eq!(cfg.run.pacing_ms, 250);
        assert_eq!(cfg.run.checkpoint_every, 25);
    }

    #[test]
    fn test_engine_config_conversion() {
        let mut cfg = Config::default();
        cfg.destination.anchor = "Backups".into();
        cfg.run.pacing_ms = 1500;
        let engine = cfg.engine_config();
        assert_eq!(engine.anchor, FolderHandle::root().child("Backups"));
        assert_eq!(engine.pacing, Duration::from_millis(1500));
        assert_eq!(engine.retry.attempts, 3);
        assert_eq!(cfg.ledger_config().retention, chrono::Duration::days(90));
    }
}
