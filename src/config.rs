//! TOML configuration for autocheckin.
//!
//! A layered configuration model with compiled-in defaults, an environment
//! variable override for the config file path, and a working-directory
//! fallback. Target definitions are immutable once loaded and are handed to
//! the engine read-only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "AUTOCHECKIN_CONFIG";

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "autocheckin.toml";

/// Configuration problems that disable a target (or, for file-level
/// problems, the whole configuration).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target id must not be empty")]
    EmptyTargetId,

    #[error("duplicate target id '{0}'")]
    DuplicateTarget(String),

    #[error("target '{target}' uses unknown driver '{driver}'")]
    UnknownDriver { target: String, driver: String },

    #[error("target '{target}' is missing credential variable {var}")]
    MissingCredential { target: String, var: String },

    #[error("target '{target}' has invalid endpoint: {reason}")]
    InvalidEndpoint { target: String, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), targets = config.targets.len(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. An explicit path (from the command line). Errors are fatal.
    /// 2. The path in the `AUTOCHECKIN_CONFIG` environment variable.
    /// 3. `./autocheckin.toml`.
    /// 4. Compiled-in defaults (no targets).
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUTOCHECKIN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// File-level validation. Per-target problems that only disable one
    /// target (unknown driver, missing credentials) are reported later by the
    /// orchestrator; duplicate or empty ids make the whole file unusable.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(ConfigError::EmptyTargetId);
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }
        }
        Ok(())
    }

    /// Enabled targets in configured order.
    pub fn enabled_targets(&self) -> Vec<TargetConfig> {
        self.targets.iter().filter(|t| t.enabled).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One external site this process checks into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Registry key of the driver implementation, e.g. `"http-form"`.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Override for the username environment variable name.
    #[serde(default)]
    pub username_env: Option<String>,
    /// Override for the password environment variable name.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

impl TargetConfig {
    /// Minimal enabled target using the default driver.
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            driver: default_driver(),
            username_env: None,
            password_env: None,
            endpoint: EndpointConfig::default(),
        }
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Endpoint metadata consumed by the driver. The engine never reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Site origin, e.g. `https://forum.example.com`.
    pub base_url: String,
    /// Page that only renders for an authenticated user.
    pub check_path: String,
    pub login_path: String,
    pub checkin_path: String,
    /// HTTP method for the check-in request (`POST` or `GET`).
    pub checkin_method: String,
    pub username_field: String,
    pub password_field: String,
    /// Text that must appear on the check page when logged in.
    pub logged_in_marker: Option<String>,
    /// Text that confirms a fresh check-in.
    pub success_marker: Option<String>,
    /// Text that reports the check-in was already done today.
    pub already_marker: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            check_path: "/".to_string(),
            login_path: "/login".to_string(),
            checkin_path: "/checkin".to_string(),
            checkin_method: "POST".to_string(),
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            logged_in_marker: None,
            success_marker: None,
            already_marker: None,
            timeout_secs: 30,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_driver() -> String {
    "http-form".to_string()
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// Session cache location and expiry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding one `<target-id>.json` file per target.
    pub dir: PathBuf,
    /// Maximum age of a trusted session, in days.
    pub ttl_days: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/sessions"),
            ttl_days: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Pass sequencing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between targets in serial mode (milliseconds).
    pub inter_target_delay_ms: u64,
    /// Upper bound on concurrently running targets in parallel mode.
    /// `0` means unbounded.
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inter_target_delay_ms: 3_000,
            max_concurrency: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Startup schedule consumed by `start-schedule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// 5-field cron expression.
    pub cron: String,
    pub parallel: bool,
    /// Target ids to run; empty means all enabled targets.
    pub targets: Vec<String>,
    /// `"local"`, `"utc"`, or a fixed offset such as `"+08:00"`.
    pub timezone: String,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 8 * * *".to_string(),
            parallel: false,
            targets: Vec::new(),
            timezone: "local".to_string(),
            retry_on_failure: true,
            max_retries: 3,
            retry_delay_ms: 5 * 60 * 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// API / history / logging
// ---------------------------------------------------------------------------

/// Control API of a running daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7878".to_string(),
        }
    }
}

/// SQLite run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub db_path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("data/history.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[session]
dir = "/tmp/sessions"
ttl_days = 3

[orchestrator]
inter_target_delay_ms = 500

[schedule]
cron = "30 7 * * 1-5"
parallel = true
targets = ["forum"]

[[targets]]
id = "forum"
display_name = "Forum"
[targets.endpoint]
base_url = "https://forum.example.com"
success_marker = "signed"

[[targets]]
id = "video"
enabled = false
driver = "http-form"
"#;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.ttl_days, 7);
        assert_eq!(cfg.orchestrator.inter_target_delay_ms, 3_000);
        assert_eq!(cfg.schedule.cron, "0 8 * * *");
        assert!(!cfg.schedule.parallel);
        assert_eq!(cfg.schedule.max_retries, 3);
        assert_eq!(cfg.schedule.retry_delay_ms, 300_000);
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let cfg = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.session.ttl_days, 3);
        assert_eq!(cfg.orchestrator.inter_target_delay_ms, 500);
        assert_eq!(cfg.orchestrator.max_concurrency, 0);
        assert!(cfg.schedule.parallel);
        assert_eq!(cfg.targets.len(), 2);
        assert_eq!(cfg.targets[0].driver, "http-form");
        assert_eq!(cfg.targets[0].endpoint.login_path, "/login");
        assert_eq!(cfg.targets[0].endpoint.success_marker.as_deref(), Some("signed"));
        assert!(!cfg.targets[1].enabled);
    }

    #[test]
    fn test_enabled_targets_keep_order() {
        let mut cfg = AppConfig::from_toml(SAMPLE).unwrap();
        cfg.targets.push(TargetConfig::new("third", "Third"));
        let ids: Vec<_> = cfg.enabled_targets().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["forum", "third"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[targets]]
id = "a"
[[targets]]
id = "a"
"#;
        let err = AppConfig::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("duplicate target id 'a'"));
    }

    #[test]
    fn test_label_falls_back_to_id() {
        let mut t = TargetConfig::new("site1", "");
        assert_eq!(t.label(), "site1");
        t.display_name = "Site One".to_string();
        assert_eq!(t.label(), "Site One");
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autocheckin.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.targets[0].id, "forum");
    }
}
