//! Flowkeeper configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlowkeeperError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowkeeperConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl FlowkeeperConfig {
    /// Load config from the default path (~/.flowkeeper/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowkeeperError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FlowkeeperError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FLOWKEEPER_DB_PATH").filter(|p| !p.is_empty()) {
            self.store.path = path;
        }
        if let Some(days) = lookup("FLOWKEEPER_SESSION_TRIM_DAYS") {
            match days.parse() {
                Ok(d) => self.retention.session_trim_days = d,
                Err(_) => tracing::warn!("Ignoring invalid FLOWKEEPER_SESSION_TRIM_DAYS={days}"),
            }
        }
        if let Some(url) = lookup("FLOWKEEPER_ENGINE_URL").filter(|u| !u.is_empty()) {
            self.engine.base_url = Some(url);
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Flowkeeper home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowkeeper")
    }
}

/// Shared store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> String { "~/.flowkeeper/flowkeeper.db".into() }
fn default_busy_timeout_ms() -> u64 { 5000 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Queue names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue the batch dispatcher consumes (flow batch starts, broadcast batch sends).
    #[serde(default = "default_batch_queue")]
    pub batch: String,
    /// Queue the external event handler consumes (timeouts, campaign fires).
    #[serde(default = "default_handler_queue")]
    pub handler: String,
}

fn default_batch_queue() -> String { "start_msg_flow_batch".into() }
fn default_handler_queue() -> String { "handle_event_task".into() }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch: default_batch_queue(),
            handler: default_handler_queue(),
        }
    }
}

/// How long finished data is kept before the cleanup jobs remove it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_session_trim_days")]
    pub session_trim_days: i64,
    #[serde(default = "default_fire_trim_days")]
    pub fire_trim_days: i64,
}

fn default_session_trim_days() -> i64 { 7 }
fn default_fire_trim_days() -> i64 { 90 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_trim_days: default_session_trim_days(),
            fire_trim_days: default_fire_trim_days(),
        }
    }
}

/// Cadence and lock TTL of a single periodic job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub interval_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

fn bool_true() -> bool { true }

/// Lock TTL used when a job does not set one.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 900;

fn default_lock_ttl_secs() -> u64 { DEFAULT_LOCK_TTL_SECS }

impl JobConfig {
    pub fn new(interval_secs: u64, lock_ttl_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs,
            lock_ttl_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }
}

/// Per-job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_check_flows")]
    pub check_flows: JobConfig,
    #[serde(default = "default_check_flow_timeouts")]
    pub check_flow_timeouts: JobConfig,
    #[serde(default = "default_squash_flowpathcounts")]
    pub squash_flowpathcounts: JobConfig,
    #[serde(default = "default_squash_flowruncounts")]
    pub squash_flowruncounts: JobConfig,
    #[serde(default = "default_trim_flow_sessions")]
    pub trim_flow_sessions: JobConfig,
    #[serde(default = "default_check_campaigns")]
    pub check_campaigns: JobConfig,
    #[serde(default = "default_trim_event_fires")]
    pub trim_event_fires: JobConfig,
}

fn default_check_flows() -> JobConfig { JobConfig::new(60, DEFAULT_LOCK_TTL_SECS) }
fn default_check_flow_timeouts() -> JobConfig { JobConfig::new(20, 3600) }
fn default_squash_flowpathcounts() -> JobConfig { JobConfig::new(60, 7200) }
fn default_squash_flowruncounts() -> JobConfig { JobConfig::new(60, 7200) }
fn default_trim_flow_sessions() -> JobConfig { JobConfig::new(3600, DEFAULT_LOCK_TTL_SECS) }
fn default_check_campaigns() -> JobConfig { JobConfig::new(60, DEFAULT_LOCK_TTL_SECS) }
fn default_trim_event_fires() -> JobConfig { JobConfig::new(900, DEFAULT_LOCK_TTL_SECS) }

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            check_flows: default_check_flows(),
            check_flow_timeouts: default_check_flow_timeouts(),
            squash_flowpathcounts: default_squash_flowpathcounts(),
            squash_flowruncounts: default_squash_flowruncounts(),
            trim_flow_sessions: default_trim_flow_sessions(),
            check_campaigns: default_check_campaigns(),
            trim_event_fires: default_trim_event_fires(),
        }
    }
}

/// Worker process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name recorded as the lock holder; defaults to the hostname plus pid.
    #[serde(default)]
    pub name: Option<String>,
    /// How long the dispatcher sleeps when the batch queue is empty.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "bool_true")]
    pub dispatch: bool,
}

fn default_idle_poll_ms() -> u64 { 500 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            idle_poll_ms: default_idle_poll_ms(),
            dispatch: true,
        }
    }
}

/// HTTP bridge to the external flow/broadcast engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_engine_timeout_secs() -> u64 { 30 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_engine_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FlowkeeperConfig::default();
        assert_eq!(config.queues.batch, "start_msg_flow_batch");
        assert_eq!(config.queues.handler, "handle_event_task");
        assert_eq!(config.retention.session_trim_days, 7);
        assert_eq!(config.jobs.check_flow_timeouts.lock_ttl_secs, 3600);
        assert_eq!(config.jobs.squash_flowruncounts.lock_ttl_secs, 7200);
        assert_eq!(config.jobs.check_flows.lock_ttl_secs, DEFAULT_LOCK_TTL_SECS);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [store]
            path = "/var/lib/flowkeeper/shared.db"

            [retention]
            session_trim_days = 30

            [jobs.check_flows]
            interval_secs = 15

            [engine]
            base_url = "http://engine.internal:8000"
        "#;

        let config: FlowkeeperConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.path, "/var/lib/flowkeeper/shared.db");
        assert_eq!(config.retention.session_trim_days, 30);
        assert_eq!(config.jobs.check_flows.interval_secs, 15);
        // unspecified TTL falls back to the conservative default
        assert_eq!(config.jobs.check_flows.lock_ttl_secs, DEFAULT_LOCK_TTL_SECS);
        assert_eq!(config.engine.base_url.as_deref(), Some("http://engine.internal:8000"));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: FlowkeeperConfig = toml::from_str("").unwrap();
        assert_eq!(config.worker.idle_poll_ms, 500);
        assert!(config.worker.dispatch);
        assert_eq!(config.jobs.trim_event_fires.interval_secs, 900);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLOWKEEPER_DB_PATH", "/tmp/override.db"),
            ("FLOWKEEPER_SESSION_TRIM_DAYS", "3"),
        ]
        .into_iter()
        .collect();
        let mut config = FlowkeeperConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.store.path, "/tmp/override.db");
        assert_eq!(config.retention.session_trim_days, 3);
        assert!(config.engine.base_url.is_none());
    }

    #[test]
    fn test_invalid_env_override_is_ignored() {
        let mut config = FlowkeeperConfig::default();
        config.apply_overrides(|k| (k == "FLOWKEEPER_SESSION_TRIM_DAYS").then(|| "soon".to_string()));
        assert_eq!(config.retention.session_trim_days, 7);
    }

    #[test]
    fn test_job_durations() {
        let job = JobConfig::new(0, 60);
        assert_eq!(job.interval(), Duration::from_secs(1));
        assert_eq!(job.lock_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_home_dir() {
        let home = FlowkeeperConfig::home_dir();
        assert!(home.to_string_lossy().contains("flowkeeper"));
    }
}
