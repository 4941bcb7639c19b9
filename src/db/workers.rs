//! Worker registry operations.

use super::tasks::release_task_internal;
use super::{Database, now_ms};
use crate::types::Worker;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt;
use tracing::{info, warn};

const WORKER_COLUMNS: &str =
    "id, instance_num, ip, team, checkin_count, current_task, registered_at, last_heartbeat";

fn parse_worker_row(row: &Row) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get("id")?,
        instance_num: row.get("instance_num")?,
        ip: row.get("ip")?,
        team: row.get("team")?,
        checkin_count: row.get("checkin_count")?,
        current_task: row.get("current_task")?,
        registered_at: row.get("registered_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

/// Internal helper to find a worker by the identity triple it presents.
pub(crate) fn get_worker_internal(
    conn: &Connection,
    id: i64,
    instance_num: i64,
    ip: &str,
) -> Result<Option<Worker>> {
    let sql = format!(
        "SELECT {} FROM workers WHERE id = ?1 AND instance_num = ?2 AND ip = ?3",
        WORKER_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, instance_num, ip], parse_worker_row)
        .optional()?)
}

/// Bump a worker's check-in counter and heartbeat.
pub(crate) fn touch_worker(conn: &Connection, id: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE workers SET checkin_count = checkin_count + 1, last_heartbeat = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Clear `current_task` on whichever worker still points at a task.
pub(crate) fn clear_current_task(conn: &Connection, task_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE workers SET current_task = 0 WHERE current_task = ?1",
        params![task_id],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Registered(Worker),
    AtCapacity { live: i64, max: i64 },
}

impl fmt::Display for RegisterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterOutcome::Registered(worker) => write!(
                f,
                "Registered\nClient id: {}\nIP: {}\nprogramInstance: {}\nteam name: {}\n",
                worker.id, worker.ip, worker.instance_num, worker.team
            ),
            RegisterOutcome::AtCapacity { live, max } => {
                writeln!(f, "{}", crate::error::ProtocolError::at_capacity(*live, *max))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterOutcome {
    /// Task released back to the pool, if the worker held one.
    pub released: Option<i64>,
}

impl fmt::Display for UnregisterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OK, client record deleted")?;
        if let Some(task_id) = self.released {
            writeln!(f, "Relinquished task {}", task_id)?;
        }
        Ok(())
    }
}

impl Database {
    /// Register a worker, unless the live count has reached `max_workers`.
    pub fn register_worker(
        &self,
        instance_num: i64,
        ip: &str,
        team: &str,
        max_workers: i64,
    ) -> Result<RegisterOutcome> {
        self.transact("register", |tx| {
            let live: i64 = tx.query_row("SELECT COUNT(*) FROM workers", [], |row| row.get(0))?;
            if live >= max_workers {
                warn!(live, max_workers, "Worker registry at capacity");
                return Ok(RegisterOutcome::AtCapacity {
                    live,
                    max: max_workers,
                });
            }

            let now = now_ms();
            tx.execute(
                "INSERT INTO workers (instance_num, ip, team, registered_at, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![instance_num, ip, team, now],
            )?;
            let worker = Worker {
                id: tx.last_insert_rowid(),
                instance_num,
                ip: ip.to_string(),
                team: team.to_string(),
                checkin_count: 0,
                current_task: 0,
                registered_at: now,
                last_heartbeat: now,
            };
            info!(client_id = worker.id, ip, team, "Registered worker");
            Ok(RegisterOutcome::Registered(worker))
        })
    }

    /// Delete a worker and return its task, if any, to the pool.
    pub fn unregister_worker(&self, id: i64, instance_num: i64, ip: &str) -> Result<UnregisterOutcome> {
        self.transact("unregister", |tx| {
            let current_task = get_worker_internal(tx, id, instance_num, ip)?
                .map_or(0, |w| w.current_task);
            tx.execute(
                "DELETE FROM workers WHERE id = ?1 AND instance_num = ?2 AND ip = ?3",
                params![id, instance_num, ip],
            )?;

            let mut released = None;
            if current_task > 0
                && release_task_internal(tx, current_task, Some(id), None)? == Some(id)
            {
                released = Some(current_task);
            }
            info!(client_id = id, released = ?released, "Unregistered worker");
            Ok(UnregisterOutcome { released })
        })
    }

    /// Get a worker by id.
    pub fn get_worker(&self, id: i64) -> Result<Option<Worker>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM workers WHERE id = ?1", WORKER_COLUMNS);
            Ok(conn.query_row(&sql, params![id], parse_worker_row).optional()?)
        })
    }

    /// List all registered workers.
    pub fn list_workers(&self) -> Result<Vec<Worker>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM workers ORDER BY id", WORKER_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let workers = stmt
                .query_map([], parse_worker_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(workers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_reply() {
        let db = Database::open_in_memory().unwrap();
        let outcome = db.register_worker(3, "10.0.0.1", "Team A", 10).unwrap();
        let text = outcome.to_string();
        assert!(text.starts_with("Registered\nClient id: "));
        assert!(text.ends_with("IP: 10.0.0.1\nprogramInstance: 3\nteam name: Team A\n"));
    }

    #[test]
    fn test_unregister_reply() {
        let outcome = UnregisterOutcome { released: Some(12) };
        assert_eq!(
            outcome.to_string(),
            "OK, client record deleted\nRelinquished task 12\n"
        );
        let outcome = UnregisterOutcome { released: None };
        assert_eq!(outcome.to_string(), "OK, client record deleted\n");
    }
}
