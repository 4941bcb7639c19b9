//! File watcher for the configuration file.
//!
//! Emits reload events through a tokio watch channel when the file changes.
//! Uses debouncing to coalesce rapid writes from editors.

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Event types emitted when the configuration file changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// The watched config file was written, created or replaced.
    ConfigYaml(PathBuf),
    /// Watcher encountered an error
    Error(String),
}

impl ConfigChangeEvent {
    /// Returns true if this event requires a config reload.
    pub fn requires_reload(&self) -> bool {
        !matches!(self, ConfigChangeEvent::Error(_))
    }
}

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for coalescing rapid changes.
    pub debounce_duration: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(500),
        }
    }
}

/// Handle to control the config watcher.
pub struct ConfigWatcherHandle {
    /// Receiver for config change events.
    pub events: watch::Receiver<Option<ConfigChangeEvent>>,
    /// Handle to the watcher task (dropping this will stop the watcher).
    _task_handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Wait for the next config change event.
    pub async fn wait_for_change(&mut self) -> Option<ConfigChangeEvent> {
        // Skip the initial None value
        loop {
            if self.events.changed().await.is_err() {
                return None; // Sender dropped
            }
            let event = self.events.borrow().clone();
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Starts watching `config_file`.
///
/// The parent directory is watched rather than the file itself so that
/// editors which replace the file on save are still seen.
pub fn start_config_watcher(
    config_file: PathBuf,
    config: WatcherConfig,
) -> Result<ConfigWatcherHandle, notify::Error> {
    let (event_tx, event_rx) = watch::channel(None);
    let (notify_tx, notify_rx) = mpsc::channel();

    let mut debouncer = new_debouncer(config.debounce_duration, notify_tx)?;

    let dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if dir.exists() {
        info!("Watching config file: {}", config_file.display());
        debouncer
            .watcher()
            .watch(&dir, notify::RecursiveMode::NonRecursive)?;
    } else {
        warn!(
            "Config directory does not exist, skipping watch: {}",
            dir.display()
        );
    }

    let task_handle = tokio::task::spawn_blocking(move || {
        // Keep the debouncer alive
        let _debouncer = debouncer;
        process_notify_events(notify_rx, event_tx, &config_file);
    });

    Ok(ConfigWatcherHandle {
        events: event_rx,
        _task_handle: task_handle,
    })
}

/// Forward debounced events that touch the config file.
fn process_notify_events(
    rx: mpsc::Receiver<Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>>,
    tx: watch::Sender<Option<ConfigChangeEvent>>,
    config_file: &Path,
) {
    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                let touched = events.iter().any(|event| {
                    matches!(
                        event.kind,
                        DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                    ) && is_config_file(&event.path, config_file)
                });
                if touched {
                    debug!("Config change detected: {}", config_file.display());
                    if tx
                        .send(Some(ConfigChangeEvent::ConfigYaml(config_file.to_path_buf())))
                        .is_err()
                    {
                        info!("Config watcher receiver dropped, stopping");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                error!("File watcher error: {}", e);
                let _ = tx.send(Some(ConfigChangeEvent::Error(e.to_string())));
            }
            Err(_) => {
                info!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

/// Events carry absolute paths; the configured path may be relative.
fn is_config_file(event_path: &Path, config_file: &Path) -> bool {
    if event_path == config_file {
        return true;
    }
    match (event_path.file_name(), config_file.file_name()) {
        (Some(a), Some(b)) if a == b => {
            let canonical = config_file.canonicalize().ok();
            canonical.is_none_or(|c| c == event_path)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_same_path() {
        let file = PathBuf::from("chaffin/config.yaml");
        assert!(is_config_file(&file, &file));
    }

    #[test]
    fn test_ignores_siblings() {
        let file = PathBuf::from("chaffin/config.yaml");
        assert!(!is_config_file(&PathBuf::from("chaffin/coordinator.db"), &file));
        assert!(!is_config_file(&PathBuf::from("chaffin/other.yaml"), &file));
    }

    #[test]
    fn test_event_requires_reload() {
        assert!(ConfigChangeEvent::ConfigYaml(PathBuf::new()).requires_reload());
        assert!(!ConfigChangeEvent::Error("test".to_string()).requires_reload());
    }
}
