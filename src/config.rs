//! Configuration management for Vigil
//!
//! The server reads a single `server.{yml,yaml,json,toml}` file from the
//! configuration directory. Every field has a default, so an empty or
//! missing file yields a working in-memory setup.

use crate::backends::{BackendConfig, Severity};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Monitors every push and resolve is delivered to
    #[serde(default = "default_monitors")]
    pub monitors: Vec<BackendConfig>,
    #[serde(default = "default_store")]
    pub store: BackendConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            schedule: ScheduleConfig::default(),
            scanner: ScannerConfig::default(),
            monitors: default_monitors(),
            store: default_store(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default level filter (`RUST_LOG` takes precedence)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Output format of log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Cycle scheduling and worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between two cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Size of the worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retries granted to a failing container task
    #[serde(default = "default_task_retries")]
    pub task_retries: usize,
    /// Time allowed for fetching one agent's container group
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Polls spread over the fetch timeout
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            workers: default_workers(),
            task_retries: default_task_retries(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            fetch_retries: default_fetch_retries(),
        }
    }
}

/// Scanner backend plus the severity threshold applied to its findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Findings at least this severe make an image fail
    #[serde(default)]
    pub severity_level: Severity,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                kind: "http".to_string(),
                endpoint: "http://localhost:8228".to_string(),
                ..Default::default()
            },
            severity_level: Severity::High,
        }
    }
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    10
}

fn default_task_retries() -> usize {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_fetch_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_monitors() -> Vec<BackendConfig> {
    vec![BackendConfig::named("log")]
}

fn default_store() -> BackendConfig {
    BackendConfig::named("memory")
}

impl ServerConfig {
    /// Apply `VIGIL_*` environment overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("VIGIL_INTERVAL_SECS") {
            self.schedule.interval_secs = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid VIGIL_INTERVAL_SECS '{}'", value))?;
        }
        if let Some(value) = lookup("VIGIL_WORKERS") {
            self.schedule.workers = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid VIGIL_WORKERS '{}'", value))?;
        }
        if let Some(value) = lookup("VIGIL_LOG_LEVEL") {
            self.general.log_level = value;
        }
        if let Some(value) = lookup("VIGIL_STORE_ENDPOINT") {
            self.store.endpoint = value;
        }
        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.schedule.interval_secs == 0 {
            return Err(anyhow!("schedule.interval_secs must be greater than zero"));
        }
        if self.schedule.workers == 0 {
            return Err(anyhow!("schedule.workers must be greater than zero"));
        }
        if self.schedule.fetch_timeout_secs == 0 {
            return Err(anyhow!("schedule.fetch_timeout_secs must be greater than zero"));
        }
        if self.schedule.fetch_retries == 0 {
            return Err(anyhow!("schedule.fetch_retries must be greater than zero"));
        }
        if self.monitors.is_empty() {
            return Err(anyhow!("at least one monitor backend must be configured"));
        }
        for backend in std::iter::once(&self.store)
            .chain(std::iter::once(&self.scanner.backend))
            .chain(self.monitors.iter())
        {
            if backend.kind.trim().is_empty() {
                return Err(anyhow!("every backend needs a type"));
            }
        }
        Ok(())
    }
}

/// Load the server configuration from the config directory
pub fn load_server_config(config_dir: &Path) -> Result<ServerConfig> {
    for name in ["server.yml", "server.yaml", "server.json", "server.toml"] {
        let path = config_dir.join(name);
        if !path.exists() {
            continue;
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ServerConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Some("toml") => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            _ => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
        };
        return Ok(config);
    }

    // Return default configuration if no config file exists
    Ok(ServerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, LogFormat::Text);
        assert_eq!(config.schedule.interval_secs, 60);
        assert_eq!(config.schedule.workers, 10);
        assert_eq!(config.schedule.task_retries, 5);
        assert_eq!(config.schedule.fetch_timeout(), Duration::from_secs(60));
        assert_eq!(config.scanner.severity_level, Severity::High);
        assert_eq!(config.monitors, vec![BackendConfig::named("log")]);
        assert_eq!(config.store.kind, "memory");
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = load_server_config(temp_dir.path()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = tempdir().unwrap();
        let yaml_content = r#"
general:
  log_level: debug
  log_format: json
schedule:
  interval_secs: 30
  workers: 4
scanner:
  type: http
  endpoint: http://scanner:8228
  username: admin
  severity_level: medium
monitors:
  - type: log
  - type: http
    endpoint: http://alerts:3030
    default_assignee: secops
    create_tickets: true
store:
  type: file
  endpoint: /var/lib/vigil
metrics:
  enabled: false
"#;
        fs::write(temp_dir.path().join("server.yml"), yaml_content).unwrap();

        let config = load_server_config(temp_dir.path()).unwrap();
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.schedule.interval(), Duration::from_secs(30));
        assert_eq!(config.schedule.workers, 4);
        // Unset fields keep their defaults
        assert_eq!(config.schedule.fetch_retries, 5);
        assert_eq!(config.scanner.backend.endpoint, "http://scanner:8228");
        assert_eq!(config.scanner.backend.username.as_deref(), Some("admin"));
        assert_eq!(config.scanner.severity_level, Severity::Medium);
        assert_eq!(config.monitors.len(), 2);
        assert_eq!(config.monitors[1].default_assignee.as_deref(), Some("secops"));
        assert!(config.monitors[1].create_tickets);
        assert_eq!(config.store.kind, "file");
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9100);
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = tempdir().unwrap();
        let json_content = r#"{
  "schedule": { "workers": 2 },
  "store": { "type": "memory" }
}"#;
        fs::write(temp_dir.path().join("server.json"), json_content).unwrap();

        let config = load_server_config(temp_dir.path()).unwrap();
        assert_eq!(config.schedule.workers, 2);
        assert_eq!(config.monitors.len(), 1);
    }

    #[test]
    fn test_load_toml_config() {
        let temp_dir = tempdir().unwrap();
        let toml_content = r#"
[schedule]
interval_secs = 120

[scanner]
type = "http"
endpoint = "http://scanner"
severity_level = "low"

[[monitors]]
type = "log"

[store]
type = "file"
endpoint = "/tmp/vigil"
"#;
        fs::write(temp_dir.path().join("server.toml"), toml_content).unwrap();

        let config = load_server_config(temp_dir.path()).unwrap();
        assert_eq!(config.schedule.interval_secs, 120);
        assert_eq!(config.scanner.severity_level, Severity::Low);
        assert_eq!(config.store.endpoint, "/tmp/vigil");
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("server.yml"), "schedule: [not, a, map]").unwrap();
        let err = load_server_config(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VIGIL_INTERVAL_SECS", "15"),
            ("VIGIL_WORKERS", "3"),
            ("VIGIL_LOG_LEVEL", "trace"),
            ("VIGIL_STORE_ENDPOINT", "/data"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.schedule.interval_secs, 15);
        assert_eq!(config.schedule.workers, 3);
        assert_eq!(config.general.log_level, "trace");
        assert_eq!(config.store.endpoint, "/data");

        let err = config
            .apply_overrides(|key| (key == "VIGIL_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("VIGIL_WORKERS"));
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        config.schedule.workers = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.schedule.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.schedule.fetch_retries = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.monitors.clear();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.store.kind = String::new();
        assert!(config.validate().is_err());
    }
}
