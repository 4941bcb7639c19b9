//! Configuration system.
//!
//! One YAML file, discovered in this order:
//! 1. `CHAFFIN_CONFIG_PATH`
//! 2. `./chaffin/config.yaml`
//! 3. `~/.chaffin/config.yaml`
//!
//! ## Environment Variables
//! - `CHAFFIN_DB_PATH` - Database path
//! - `CHAFFIN_BIND` - Listen address
//! - `CHAFFIN_OPERATOR_SECRET` - Secret for operator actions
//! - `CHAFFIN_MAX_WORKERS` - Worker registry ceiling
//!
//! The `throttle` section is hot-reloaded when the file changes.

mod loader;
mod types;
pub mod watcher;

pub use loader::{ConfigLoader, apply_env_overrides, reload_throttle};
pub use types::*;
