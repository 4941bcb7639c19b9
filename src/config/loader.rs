//! Configuration discovery and environment overrides.

use super::types::{Config, ThrottleConfig};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Explicit config file (overrides discovery).
pub const ENV_CONFIG_PATH: &str = "CHAFFIN_CONFIG_PATH";
pub const ENV_DB_PATH: &str = "CHAFFIN_DB_PATH";
pub const ENV_BIND: &str = "CHAFFIN_BIND";
pub const ENV_OPERATOR_SECRET: &str = "CHAFFIN_OPERATOR_SECRET";
pub const ENV_MAX_WORKERS: &str = "CHAFFIN_MAX_WORKERS";

/// Project-level config file.
const PROJECT_CONFIG: &str = "chaffin/config.yaml";

/// Loaded configuration plus the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Config,
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Discover and load configuration, then apply environment overrides.
    ///
    /// Search order: `CHAFFIN_CONFIG_PATH`, `./chaffin/config.yaml`,
    /// `~/.chaffin/config.yaml`. Missing files mean defaults.
    pub fn load() -> Result<Self> {
        let mut loader = match discover_config_path() {
            Some(path) if path.exists() => Self::load_from(path)?,
            Some(path) => {
                warn!("Config file {} not found, using defaults", path.display());
                Self {
                    config: Config::default(),
                    config_path: Some(path),
                }
            }
            None => Self {
                config: Config::default(),
                config_path: None,
            },
        };
        apply_env_overrides(&mut loader.config, |key| std::env::var(key).ok());
        Ok(loader)
    }

    /// Load from an explicit file, without environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;
        info!("Loaded config from {}", path.display());
        Ok(Self {
            config,
            config_path: Some(path),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// File the configuration was read from, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(ENV_CONFIG_PATH) {
        return Some(PathBuf::from(explicit));
    }
    let project = PathBuf::from(PROJECT_CONFIG);
    if project.exists() {
        return Some(project);
    }
    dirs::home_dir()
        .map(|home| home.join(".chaffin").join("config.yaml"))
        .filter(|path| path.exists())
}

/// Apply `CHAFFIN_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db_path) = lookup(ENV_DB_PATH) {
        config.server.db_path = PathBuf::from(db_path);
    }
    if let Some(bind) = lookup(ENV_BIND) {
        config.server.bind = bind;
    }
    if let Some(secret) = lookup(ENV_OPERATOR_SECRET) {
        config.server.operator_secret = Some(secret);
    }
    if let Some(max_workers) = lookup(ENV_MAX_WORKERS) {
        match max_workers.parse() {
            Ok(value) => config.server.max_workers = value,
            Err(_) => warn!("Ignoring non-numeric {}={}", ENV_MAX_WORKERS, max_workers),
        }
    }
}

/// Re-read only the throttle section of a config file.
pub fn reload_throttle<P: AsRef<Path>>(path: P) -> Result<ThrottleConfig> {
    Ok(Config::load(path)?.throttle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DB_PATH, "/tmp/c.db"),
            (ENV_OPERATOR_SECRET, "hunter2"),
            (ENV_MAX_WORKERS, "12"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.db_path, PathBuf::from("/tmp/c.db"));
        assert_eq!(config.server.operator_secret.as_deref(), Some("hunter2"));
        assert_eq!(config.server.max_workers, 12);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_bad_number_is_ignored() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| {
            (k == ENV_MAX_WORKERS).then(|| "lots".to_string())
        });
        assert_eq!(config.server.max_workers, 5000);
    }

    #[test]
    fn test_load_from_file_and_reload_throttle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  bind: 127.0.0.1:9000\nthrottle:\n  one_in_x: 3").unwrap();

        let loader = ConfigLoader::load_from(file.path()).unwrap();
        assert_eq!(loader.config().server.bind, "127.0.0.1:9000");
        assert_eq!(loader.config_path(), Some(file.path()));

        let throttle = reload_throttle(file.path()).unwrap();
        assert_eq!(throttle.one_in_x, 3);
    }

    #[test]
    fn test_reload_rejects_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "throttle: [unterminated").unwrap();
        assert!(reload_throttle(file.path()).is_err());
    }
}
