//! Store layer for the coordinator.
//!
//! Every mutating operation runs as one `BEGIN IMMEDIATE` transaction inside
//! the retry executor, so the rows it reads cannot change before it commits.

pub mod escalate;
pub mod finish;
pub mod reaper;
pub mod retry;
pub mod stats;
pub mod tasks;
pub mod witness;
pub mod workers;

use crate::error::StoreError;
use anyhow::Result;
use rand::Rng;
use retry::RetryPolicy;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Replace the retry policy used by every unit of work.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::Error::new(StoreError::Poisoned))
    }

    /// Run database migrations.
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.lock()?;
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    /// Execute a read with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `work` as one IMMEDIATE transaction, retried as a whole on
    /// transient failure. Dropping the transaction on error rolls it back.
    pub fn transact<F, T>(&self, op: &str, mut work: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        self.retry.run(op, || {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = work(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Smallest and largest access codes handed to workers.
pub const ACCESS_MIN: i64 = 100_000_000;
pub const ACCESS_MAX: i64 = 999_999_999;

/// Roll a fresh access code, never equal to `previous`.
pub fn new_access_code(previous: Option<i64>) -> i64 {
    let mut rng = rand::thread_rng();
    loop {
        let code = rng.gen_range(ACCESS_MIN..=ACCESS_MAX);
        if Some(code) != previous {
            return code;
        }
    }
}
