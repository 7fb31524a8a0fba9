use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PROCESSES: usize = 10;
pub const DEFAULT_PID_FILE: &str = "/tmp/txnd.pid";
pub const DEFAULT_MONITOR_FILE: &str = "/tmp/txnd.status";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5; // liveness rewrite + monitor cadence
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 1_000; // no idle slot / nothing runnable
pub const DEFAULT_DRAIN_POLL_MS: u64 = 500;
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MONITOR_BIND: &str = "127.0.0.1";
pub const DEFAULT_MONITOR_PORT: u16 = 8787;

/// Top-level config (txnd.toml + TXND_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxndConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// How the daemon isolates a running job from its own control loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// One child process per job (`txnd worker --id N`).
    #[default]
    Process,
    /// One tokio task per job inside the daemon process.
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Size of the worker slot pool.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Lock record proving a single daemon owns the queue.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Where the monitor snapshot is written. `None` disables the monitor.
    #[serde(default = "default_monitor_file")]
    pub monitor_file: Option<String>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,
    /// Upper bound on the wait for the claim lock inside `Transaction::lock`.
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    #[serde(default)]
    pub worker_mode: WorkerMode,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_processes: DEFAULT_MAX_PROCESSES,
            pid_file: default_pid_file(),
            monitor_file: default_monitor_file(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP_MS,
            drain_poll_ms: DEFAULT_DRAIN_POLL_MS,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            worker_mode: WorkerMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Health endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_bind")]
    pub bind: String,
    #[serde(default = "default_monitor_port")]
    pub port: u16,
    /// Shared secret expected in the `x-authentication` header.
    /// When unset the endpoint is open.
    pub authentication: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind: default_monitor_bind(),
            port: DEFAULT_MONITOR_PORT,
            authentication: None,
        }
    }
}

fn default_max_processes() -> usize {
    DEFAULT_MAX_PROCESSES
}
fn default_pid_file() -> String {
    DEFAULT_PID_FILE.to_string()
}
fn default_monitor_file() -> Option<String> {
    Some(DEFAULT_MONITOR_FILE.to_string())
}
fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}
fn default_idle_sleep_ms() -> u64 {
    DEFAULT_IDLE_SLEEP_MS
}
fn default_drain_poll_ms() -> u64 {
    DEFAULT_DRAIN_POLL_MS
}
fn default_claim_timeout_ms() -> u64 {
    DEFAULT_CLAIM_TIMEOUT_MS
}
fn default_monitor_bind() -> String {
    DEFAULT_MONITOR_BIND.to_string()
}
fn default_monitor_port() -> u16 {
    DEFAULT_MONITOR_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.txnd/txnd.db", home)
}

impl TxndConfig {
    /// Load config from a TOML file with TXND_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TXND_DAEMON__MAX_PROCESSES=4`. A missing file is not an error: every
    /// field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TxndConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TXND_").split("__"))
            .extract()
            .map_err(|e| crate::error::TxndError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.daemon.max_processes == 0 {
            return Err(crate::error::TxndError::Config(
                "daemon.max_processes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var("TXND_CONFIG") {
        return path;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.txnd/txnd.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = TxndConfig::load(path.to_str()).unwrap();
        assert_eq!(config.daemon.max_processes, DEFAULT_MAX_PROCESSES);
        assert_eq!(config.daemon.pid_file, DEFAULT_PID_FILE);
        assert_eq!(config.daemon.worker_mode, WorkerMode::Process);
        assert!(config.monitor.authentication.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[daemon]
max_processes = 3
worker_mode = "task"
pid_file = "/run/txnd.pid"

[monitor]
authentication = "s3cret"
"#
        )
        .unwrap();

        let config = TxndConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.daemon.max_processes, 3);
        assert_eq!(config.daemon.worker_mode, WorkerMode::Task);
        assert_eq!(config.daemon.pid_file, "/run/txnd.pid");
        assert_eq!(config.daemon.refresh_interval_secs, DEFAULT_REFRESH_INTERVAL_SECS);
        assert_eq!(config.monitor.authentication.as_deref(), Some("s3cret"));
    }

    #[test]
    fn zero_processes_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\nmax_processes = 0").unwrap();
        assert!(TxndConfig::load(file.path().to_str()).is_err());
    }
}
