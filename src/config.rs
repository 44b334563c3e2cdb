//! Configuration for Conductor, read from `.conductor/conductor.toml`.
//!
//! Layering is file → environment → CLI. A missing file yields defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [runtime]
//! base_url = "http://localhost:3000/test"
//! timeout_secs = 300
//! poll_interval_secs = 2
//! stable_polls = 2
//! conversation_prefix = "pm-project-"
//! request_timeout_secs = 10
//! clear_before_execute = true
//! error_markers = ["❌", "Error:"]
//!
//! [topics]
//! gap_secs = 3600
//! history_limit = 50
//!
//! [gates]
//! expire_after_hours = 72
//!
//! [database]
//! path = ".conductor/conductor.db"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";

/// Settings for talking to the remote agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Base URL of the runtime's message API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Hard deadline for one command, measured from the start of `execute`
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between two polls of the message list
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive unchanged polls that count as quiescence
    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,
    /// Prefix joined with the project id to form the conversation id
    #[serde(default = "default_conversation_prefix")]
    pub conversation_prefix: String,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Clear the runtime conversation before each command
    #[serde(default = "default_clear_before_execute")]
    pub clear_before_execute: bool,
    /// Runtime messages starting with one of these mark the command as failed
    #[serde(default = "default_error_markers")]
    pub error_markers: Vec<String>,
}

fn default_base_url() -> String {
    "http://localhost:3000/test".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_stable_polls() -> u32 {
    2
}

fn default_conversation_prefix() -> String {
    "pm-project-".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_clear_before_execute() -> bool {
    true
}

fn default_error_markers() -> Vec<String> {
    vec!["❌".to_string(), "Error:".to_string()]
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            stable_polls: default_stable_polls(),
            conversation_prefix: default_conversation_prefix(),
            request_timeout_secs: default_request_timeout_secs(),
            clear_before_execute: default_clear_before_execute(),
            error_markers: default_error_markers(),
        }
    }
}

impl RuntimeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Topic segmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsSection {
    /// Silence (seconds) after which the next user message opens a new topic
    #[serde(default = "default_gap_secs")]
    pub gap_secs: i64,
    /// Default number of messages returned by `history`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_gap_secs() -> i64 {
    3600
}

fn default_history_limit() -> usize {
    50
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            gap_secs: default_gap_secs(),
            history_limit: default_history_limit(),
        }
    }
}

/// Approval gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatesSection {
    /// Pending gates older than this are marked expired. Unset disables expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_hours: Option<u64>,
}

impl GatesSection {
    pub fn expire_after(&self) -> Option<chrono::Duration> {
        self.expire_after_hours
            .map(|h| chrono::Duration::hours(h as i64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file, relative paths resolve against the project directory
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("conductor.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `<project_dir>/.conductor/conductor.toml`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = Self::path_in(project_dir);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn path_in(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONDUCTOR_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CONDUCTOR_RUNTIME_URL") {
            self.runtime.base_url = url;
        }
        if let Some(secs) = lookup("CONDUCTOR_RUNTIME_TIMEOUT_SECS") {
            self.runtime.timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid CONDUCTOR_RUNTIME_TIMEOUT_SECS: {}", secs))?;
        }
        if let Some(path) = lookup("CONDUCTOR_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(format) = lookup("CONDUCTOR_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Database path resolved against the project directory.
    pub fn database_path(&self, project_dir: &Path) -> PathBuf {
        if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            project_dir.join(&self.database.path)
        }
    }

    /// Return human-readable warnings for settings that are legal but suspicious.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let rt = &self.runtime;

        if rt.stable_polls == 0 {
            warnings.push(
                "runtime.stable_polls is 0: commands complete on the first poll".to_string(),
            );
        }
        if rt.poll_interval_secs == 0 {
            warnings.push("runtime.poll_interval_secs is 0: polling will spin".to_string());
        }
        if rt.poll_interval_secs * u64::from(rt.stable_polls.max(1)) >= rt.timeout_secs {
            warnings.push(format!(
                "runtime.timeout_secs ({}) leaves no room for {} stable polls at {}s",
                rt.timeout_secs, rt.stable_polls, rt.poll_interval_secs
            ));
        }
        if !rt.base_url.starts_with("http://") && !rt.base_url.starts_with("https://") {
            warnings.push(format!("runtime.base_url is not an http(s) URL: {}", rt.base_url));
        }
        if self.topics.gap_secs <= 0 {
            warnings.push("topics.gap_secs <= 0: every user message starts a topic".to_string());
        }
        if self.gates.expire_after_hours == Some(0) {
            warnings.push("gates.expire_after_hours is 0: gates expire immediately".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ConductorToml::default();
        assert_eq!(config.runtime.timeout_secs, 300);
        assert_eq!(config.runtime.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.runtime.stable_polls, 2);
        assert_eq!(config.runtime.conversation_prefix, "pm-project-");
        assert_eq!(config.topics.gap_secs, 3600);
        assert!(config.gates.expire_after().is_none());
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ConductorToml::parse(
            r#"
            [runtime]
            base_url = "http://runtime:9000"
            timeout_secs = 60

            [gates]
            expire_after_hours = 48
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.base_url, "http://runtime:9000");
        assert_eq!(config.runtime.timeout(), Duration::from_secs(60));
        assert_eq!(config.runtime.poll_interval_secs, 2);
        assert_eq!(config.gates.expire_after(), Some(chrono::Duration::hours(48)));
        assert_eq!(config.topics.history_limit, 50);
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        assert!(ConductorToml::parse("[runtime\nbase_url = ").is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = ConductorToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.runtime.timeout_secs, 300);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        let mut config = ConductorToml::default();
        config.runtime.timeout_secs = 42;
        config.logging.format = LogFormat::Json;
        config.save(&ConductorToml::path_in(dir.path())).unwrap();

        let loaded = ConductorToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.runtime.timeout_secs, 42);
        assert_eq!(loaded.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConductorToml::default();
        config
            .apply_overrides_from(|key| match key {
                "CONDUCTOR_RUNTIME_URL" => Some("http://elsewhere:1".to_string()),
                "CONDUCTOR_RUNTIME_TIMEOUT_SECS" => Some("15".to_string()),
                "CONDUCTOR_LOG_FORMAT" => Some("JSON".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.runtime.base_url, "http://elsewhere:1");
        assert_eq!(config.runtime.timeout_secs, 15);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_override_rejects_non_numeric_timeout() {
        let mut config = ConductorToml::default();
        let result = config.apply_overrides_from(|key| {
            (key == "CONDUCTOR_RUNTIME_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_database_path_resolution() {
        let config = ConductorToml::default();
        let resolved = config.database_path(Path::new("/srv/app"));
        assert_eq!(resolved, PathBuf::from("/srv/app/.conductor/conductor.db"));

        let mut config = ConductorToml::default();
        config.database.path = PathBuf::from("/var/lib/conductor.db");
        assert_eq!(
            config.database_path(Path::new("/srv/app")),
            PathBuf::from("/var/lib/conductor.db")
        );
    }

    #[test]
    fn test_validate_flags_timeout_shorter_than_stability_window() {
        let mut config = ConductorToml::default();
        config.runtime.timeout_secs = 3;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("timeout_secs"));
    }

    #[test]
    fn test_validate_flags_zero_stable_polls() {
        let mut config = ConductorToml::default();
        config.runtime.stable_polls = 0;
        assert!(config.validate().iter().any(|w| w.contains("stable_polls")));
    }
}
