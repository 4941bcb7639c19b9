//! Distributed Chaffin method coordinator
//!
//! Hands out search subtrees to volunteer workers over HTTP and tracks the
//! best strings found for each (n, waste).

use anyhow::Result;
use chaffin_coordinator::cli::{Cli, Command, CreateTaskArgs, ReapArgs};
use chaffin_coordinator::config::{
    Config, ConfigLoader, reload_throttle,
    watcher::{WatcherConfig, start_config_watcher},
};
use chaffin_coordinator::coordinator::Coordinator;
use chaffin_coordinator::db::Database;
use chaffin_coordinator::db::retry::RetryPolicy;
use chaffin_coordinator::perms::identity_prefix;
use chaffin_coordinator::server;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on --log option
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match cli.log.as_str() {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    // SAFETY: This is safe at program startup before any other threads are spawned
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("CHAFFIN_CONFIG_PATH", config_path);
        }
    }
    let mut loader = ConfigLoader::load()?;
    if let Some(db_path) = &cli.database {
        loader.config_mut().server.db_path = db_path.into();
    }
    let config_path = loader.config_path().map(PathBuf::from);
    let config = loader.into_config();
    config.ensure_db_dir()?;

    let db = Database::open(&config.server.db_path)?
        .with_retry_policy(RetryPolicy::new(config.server.max_retries));
    let db = Arc::new(db);
    let coordinator = Coordinator::new(
        Arc::clone(&db),
        config.server.clone(),
        config.throttle.clone(),
    )?;

    match cli.command {
        Some(Command::CreateTask(args)) => run_create_task(&coordinator, args)?,
        Some(Command::Reap(args)) => run_reap(&coordinator, &config, args)?,
        Some(Command::Advance) => print!("{}", coordinator.maybe_finished_all_tasks()?),
        Some(Command::Stats) => {
            let stats = db.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Some(Command::Serve) | None => run_server(coordinator, config, config_path).await?,
    }

    Ok(())
}

fn run_create_task(coordinator: &Coordinator, args: CreateTaskArgs) -> Result<()> {
    let prefix = args.prefix.unwrap_or_else(|| identity_prefix(args.n));
    let reply = coordinator.create_task(
        args.n,
        args.waste,
        &prefix,
        args.perm_to_exceed,
        args.stress_test,
    )?;
    print!("{}", reply);
    Ok(())
}

fn run_reap(coordinator: &Coordinator, config: &Config, args: ReapArgs) -> Result<()> {
    let task_minutes = args
        .task_minutes
        .unwrap_or(config.reaper.stalled_task_minutes);
    let client_minutes = args
        .client_minutes
        .unwrap_or(config.reaper.stalled_client_minutes);
    print!("{}", coordinator.cancel_stalled_tasks(task_minutes)?);
    print!("{}", coordinator.cancel_stalled_clients(client_minutes)?);
    Ok(())
}

async fn run_server(
    coordinator: Coordinator,
    config: Config,
    config_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = config_path {
        spawn_throttle_reloader(&coordinator, path);
    }
    if config.reaper.interval_secs > 0 {
        spawn_reaper(&coordinator, &config);
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (_, handle) = server::start_server(coordinator, &config.server.bind, shutdown_rx).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    let _ = shutdown_tx.send(());
    handle.await?;
    Ok(())
}

/// Swap in new throttle settings whenever the config file changes.
fn spawn_throttle_reloader(coordinator: &Coordinator, path: PathBuf) {
    let throttle = coordinator.throttle_handle();
    match start_config_watcher(path.clone(), WatcherConfig::default()) {
        Ok(mut handle) => {
            info!("Config file watcher started for throttle hot-reload");
            tokio::spawn(async move {
                while let Some(event) = handle.wait_for_change().await {
                    if !event.requires_reload() {
                        warn!("Config watcher: {:?}", event);
                        continue;
                    }
                    match reload_throttle(&path) {
                        Ok(updated) => {
                            info!(?updated, "Throttle settings reloaded");
                            throttle.store(Arc::new(updated));
                        }
                        Err(e) => warn!("Keeping previous throttle settings: {}", e),
                    }
                }
                info!("Config file watcher stopped");
            });
        }
        Err(e) => warn!(
            "Failed to start config file watcher: {}. Throttle settings are fixed until restart.",
            e
        ),
    }
}

fn spawn_reaper(coordinator: &Coordinator, config: &Config) {
    let coordinator = coordinator.clone();
    let reaper = config.reaper.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reaper.interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            let coordinator = coordinator.clone();
            let (tasks, clients) = (reaper.stalled_task_minutes, reaper.stalled_client_minutes);
            let swept = tokio::task::spawn_blocking(move || -> Result<()> {
                coordinator.db().cancel_stalled_tasks(tasks)?;
                coordinator.db().cancel_stalled_clients(clients)?;
                Ok(())
            })
            .await;
            match swept {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Stall sweep failed: {}", e),
                Err(e) => warn!("Stall sweep panicked: {}", e),
            }
        }
    });
}
