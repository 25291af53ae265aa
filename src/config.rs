//! Configuration loader and validator for the sync engine.
use crate::model::{
    RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETENTION_DAYS, DEFAULT_RETRY_SCHEDULE_SECS,
    DEFAULT_STALE_AFTER_SECS,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub outbox: Outbox,
    pub remote: Remote,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Overrides `sqlite://{data_dir}/lume.db` when set.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Outbox retry, staleness and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Outbox {
    pub max_attempts: u32,
    pub stale_after_seconds: u64,
    pub retry_schedule_seconds: Vec<u64>,
    pub retention_days: u64,
    pub batch_size: usize,
    /// Row cap for the unfiltered read used when a structured read fails.
    pub fallback_scan_limit: Option<u32>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_after_seconds: DEFAULT_STALE_AFTER_SECS,
            retry_schedule_seconds: DEFAULT_RETRY_SCHEDULE_SECS.to_vec(),
            retention_days: DEFAULT_RETENTION_DAYS,
            batch_size: 50,
            fallback_scan_limit: Some(5000),
        }
    }
}

/// Remote backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the config file, which wins over the default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/lume.db", self.app.data_dir))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.outbox.max_attempts,
            schedule: self
                .outbox
                .retry_schedule_seconds
                .iter()
                .map(|s| Duration::seconds(*s as i64))
                .collect(),
            stale_after: Duration::seconds(self.outbox.stale_after_seconds as i64),
            retention: Duration::days(self.outbox.retention_days as i64),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    let ob = &cfg.outbox;
    if ob.max_attempts == 0 {
        return Err(ConfigError::Invalid("outbox.max_attempts must be > 0"));
    }
    if ob.stale_after_seconds == 0 {
        return Err(ConfigError::Invalid("outbox.stale_after_seconds must be > 0"));
    }
    if ob.retry_schedule_seconds.is_empty() {
        return Err(ConfigError::Invalid("outbox.retry_schedule_seconds must be non-empty"));
    }
    if ob.retry_schedule_seconds.windows(2).any(|w| w[0] > w[1]) {
        return Err(ConfigError::Invalid(
            "outbox.retry_schedule_seconds must be non-decreasing",
        ));
    }
    if ob.batch_size == 0 {
        return Err(ConfigError::Invalid("outbox.batch_size must be > 0"));
    }
    if ob.fallback_scan_limit == Some(0) {
        return Err(ConfigError::Invalid("outbox.fallback_scan_limit must be > 0 when set"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.remote.base_url).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be an absolute URL"));
    }

    Ok(())
}

/// Returns a reference configuration file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000

outbox:
  max_attempts: 5
  stale_after_seconds: 300
  retry_schedule_seconds: [1, 5, 30, 120, 600]
  retention_days: 7
  batch_size: 50
  fallback_scan_limit: 5000

remote:
  base_url: "https://api.example.com/"
  access_token: "YOUR_ACCESS_TOKEN"
  refresh_token: "YOUR_REFRESH_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn outbox_section_is_optional() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: ./d\n  poll_interval_ms: 10\nremote:\n  base_url: https://x.test/\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.outbox, Outbox::default());
    }

    #[test]
    fn invalid_retry_schedule() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.outbox.retry_schedule_seconds = vec![];
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("retry_schedule_seconds")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.outbox.retry_schedule_seconds = vec![5, 1];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_outbox_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.outbox.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("max_attempts")));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.outbox.fallback_scan_limit = Some(0);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.outbox.fallback_scan_limit = None;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_remote_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.base_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("remote.base_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.outbox.batch_size, 50);
        assert_eq!(cfg.remote.refresh_token.as_deref(), Some("YOUR_REFRESH_TOKEN"));
    }
}
