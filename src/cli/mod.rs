//! CLI command definitions for the coordinator.
//!
//! The main entry point is the `Cli` struct which contains subcommands.

use clap::{Args, Parser, Subcommand};

/// Distributed Chaffin method coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP coordinator (default if no subcommand given)
    Serve,

    /// Seed a root task for a new search
    CreateTask(CreateTaskArgs),

    /// Release stalled tasks and drop silent clients once
    Reap(ReapArgs),

    /// Check whether the latest generation is done and advance it
    Advance,

    /// Print counters, ledger and live tasks as JSON
    Stats,
}

#[derive(Args, Debug)]
pub struct CreateTaskArgs {
    /// Number of symbols
    #[arg(long)]
    pub n: i64,

    /// Wasted characters allowed
    #[arg(long)]
    pub waste: i64,

    /// Starting prefix, usually the identity permutation
    #[arg(long)]
    pub prefix: Option<String>,

    /// Only strings with more permutations than this are of interest
    #[arg(long)]
    pub perm_to_exceed: i64,

    /// Create the task in the stress-test partition
    #[arg(long)]
    pub stress_test: bool,
}

#[derive(Args, Debug)]
pub struct ReapArgs {
    /// Release assigned tasks idle for this many minutes (config default)
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
    pub task_minutes: Option<i64>,

    /// Drop idle clients silent for this many minutes (config default)
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
    pub client_minutes: Option<i64>,
}
