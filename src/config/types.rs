//! Configuration types.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Load-shedding levers, re-read whenever the file changes.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Address the HTTP listener binds.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Registration is refused once this many workers are live.
    #[serde(default = "default_max_workers")]
    pub max_workers: i64,

    /// Attempts per unit of work before a transient failure is reported.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_min_n")]
    pub min_n: i64,

    #[serde(default = "default_max_n")]
    pub max_n: i64,

    /// Clients below this version are turned away.
    #[serde(default = "default_version")]
    pub version_required: i64,

    /// Clients below this version may finish their work but get nothing new.
    #[serde(default = "default_version")]
    pub version_for_new_tasks: i64,

    /// Where superseded clients are told to download an upgrade.
    #[serde(default = "default_code_repo")]
    pub code_repo: String,

    /// Secret for operator actions. Operator actions are refused when unset.
    #[serde(default)]
    pub operator_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind: default_bind(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            min_n: default_min_n(),
            max_n: default_max_n(),
            version_required: default_version(),
            version_for_new_tasks: default_version(),
            code_repo: default_code_repo(),
            operator_secret: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chaffin/coordinator.db")
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_workers() -> i64 {
    5000
}

fn default_max_retries() -> u32 {
    10
}

fn default_min_n() -> i64 {
    3
}

fn default_max_n() -> i64 {
    7
}

fn default_version() -> i64 {
    13
}

fn default_code_repo() -> String {
    "https://github.com/superpermutators/superperm/blob/master/DistributedChaffinMethod/DistributedChaffinMethod.c".to_string()
}

/// Emergency levers consulted on every `getTask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Answer "No tasks" to a random one in this many requests. 0 disables.
    #[serde(default)]
    pub one_in_x: u32,

    /// Seconds between client check-ins. 0 leaves it to the client.
    #[serde(default = "default_client_checkin_secs")]
    pub client_checkin_secs: i64,

    /// Seconds a client may spend in one subtree. 0 leaves it to the client.
    #[serde(default)]
    pub max_time_in_subtree: i64,

    /// Above this fraction of idle workers, clients are told to split sooner.
    #[serde(default = "default_idle_fraction")]
    pub idle_fraction: f64,

    #[serde(default = "default_idle_time_before_split")]
    pub idle_time_before_split: i64,

    #[serde(default = "default_idle_max_time_in_subtree")]
    pub idle_max_time_in_subtree: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            one_in_x: 0,
            client_checkin_secs: default_client_checkin_secs(),
            max_time_in_subtree: 0,
            idle_fraction: default_idle_fraction(),
            idle_time_before_split: default_idle_time_before_split(),
            idle_max_time_in_subtree: default_idle_max_time_in_subtree(),
        }
    }
}

fn default_client_checkin_secs() -> i64 {
    180
}

fn default_idle_fraction() -> f64 {
    0.8
}

fn default_idle_time_before_split() -> i64 {
    300
}

fn default_idle_max_time_in_subtree() -> i64 {
    30
}

/// Stall reaper schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between sweeps. 0 disables the timer.
    #[serde(default)]
    pub interval_secs: u64,

    #[serde(default = "default_stalled_task_minutes")]
    pub stalled_task_minutes: i64,

    #[serde(default = "default_stalled_client_minutes")]
    pub stalled_client_minutes: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            stalled_task_minutes: default_stalled_task_minutes(),
            stalled_client_minutes: default_stalled_client_minutes(),
        }
    }
}

fn default_stalled_task_minutes() -> i64 {
    30
}

fn default_stalled_client_minutes() -> i64 {
    60
}
