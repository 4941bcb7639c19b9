//! Stall reaper: reclaim work from clients that stopped checking in.

use super::finish::tally_team;
use super::tasks::release_task_internal;
use super::{Database, now_ms};
use anyhow::Result;
use rusqlite::params;
use std::fmt;
use tracing::{info, warn};

const MINUTE_MS: i64 = 60 * 1000;

/// Activity older than this timestamp counts as stalled.
fn stall_cutoff(now: i64, max_minutes: i64) -> i64 {
    now.saturating_sub(max_minutes.saturating_mul(MINUTE_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedTasks(pub usize);

impl fmt::Display for ReapedTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cancelled {} tasks", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedClients(pub usize);

impl fmt::Display for ReapedClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cancelled {} clients", self.0)
    }
}

impl Database {
    /// Release Assigned tasks with no activity for `max_minutes`.
    ///
    /// Each release rolls a new access code and counts a crashout against the
    /// team that held the task.
    pub fn cancel_stalled_tasks(&self, max_minutes: i64) -> Result<ReapedTasks> {
        self.transact("cancelStalledTasks", |tx| {
            let cutoff = stall_cutoff(now_ms(), max_minutes);
            let mut stmt = tx.prepare(
                "SELECT id, client_id, team FROM tasks
                 WHERE status = 'A' AND last_activity_at < ?1 ORDER BY id",
            )?;
            let stalled = stmt
                .query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let mut cancelled = 0;
            for (task_id, client_id, team) in stalled {
                if release_task_internal(tx, task_id, None, None)?.is_none() {
                    continue;
                }
                tx.execute(
                    "UPDATE workers SET current_task = 0 WHERE id = ?1 AND current_task = ?2",
                    params![client_id, task_id],
                )?;
                tally_team(tx, &team, 0, 0, 1)?;
                warn!(task_id, client_id, team = %team, "Cancelled stalled task");
                cancelled += 1;
            }
            Ok(ReapedTasks(cancelled))
        })
    }

    /// Delete idle workers whose heartbeat is older than `max_minutes`.
    pub fn cancel_stalled_clients(&self, max_minutes: i64) -> Result<ReapedClients> {
        self.transact("cancelStalledClients", |tx| {
            let cutoff = stall_cutoff(now_ms(), max_minutes);
            let deleted = tx.execute(
                "DELETE FROM workers WHERE current_task = 0 AND last_heartbeat < ?1",
                params![cutoff],
            )?;
            if deleted > 0 {
                info!(deleted, max_minutes, "Cancelled stalled clients");
            }
            Ok(ReapedClients(deleted))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reap_replies() {
        assert_eq!(ReapedTasks(3).to_string(), "Cancelled 3 tasks\n");
        assert_eq!(ReapedClients(0).to_string(), "Cancelled 0 clients\n");
    }

    #[test]
    fn test_cutoff_saturates() {
        assert_eq!(stall_cutoff(10 * MINUTE_MS, 3), 7 * MINUTE_MS);
        assert_eq!(stall_cutoff(1_000, i64::MAX), 1_000 - i64::MAX);

        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.cancel_stalled_tasks(i64::MAX).unwrap(), ReapedTasks(0));
    }

    #[test]
    fn test_reaping_empty_store() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.cancel_stalled_tasks(30).unwrap(), ReapedTasks(0));
        assert_eq!(db.cancel_stalled_clients(60).unwrap(), ReapedClients(0));
    }
}
