use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    API_BASE_URL, DEFAULT_DATA_DIR, ECHO_MATCH_WINDOW_MS, PUSH_URL, RECONNECT_INITIAL_DELAY_MS,
    RECONNECT_MAX_DELAY_MS, RECONNECT_MULTIPLIER, REQUEST_TIMEOUT_MS,
};

/// Bounded exponential backoff for the push connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Give up after this many consecutive failed attempts (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
            multiplier: RECONNECT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub push_url: String,
    pub reconnect: ReconnectPolicy,
    pub echo_match_window_ms: u64,
    pub request_timeout_ms: u64,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load config from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CoreConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Override fields from SQUADLINK_* environment variables.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("SQUADLINK_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(url) = std::env::var("SQUADLINK_PUSH_URL") {
            self.push_url = url;
        }
        if let Ok(dir) = std::env::var("SQUADLINK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn echo_match_window(&self) -> Duration {
        Duration::from_millis(self.echo_match_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api_base_url: API_BASE_URL.to_string(),
            push_url: PUSH_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            echo_match_window_ms: ECHO_MATCH_WINDOW_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1_000));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(10_000));
    }

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{"apiBaseUrl": "http://localhost:8080", "reconnect": {"maxAttempts": 3}}"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.push_url, PUSH_URL);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, RECONNECT_INITIAL_DELAY_MS);
        assert_eq!(config.echo_match_window_ms, ECHO_MATCH_WINDOW_MS);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(&path, r#"{"dataDir": "/tmp/squadlink-test"}"#).unwrap();
        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/squadlink-test"));
    }
}
