//! Aggregation queries for statistics.

use super::Database;
use crate::types::{TeamStats, WitnessRecord};
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of the search's progress.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub finished_tasks: i64,
    pub redundant_tasks: i64,
    pub node_count: i64,
    /// Live task counts keyed by status code.
    pub live_tasks: BTreeMap<String, i64>,
    pub workers: i64,
    pub teams: Vec<TeamStats>,
    pub witnesses: Vec<WitnessRecord>,
}

impl Database {
    /// Read one of the scalar counters.
    pub fn counter(&self, name: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT value FROM counters WHERE name = ?1",
                [name],
                |row| row.get(0),
            )?)
        })
    }

    /// Team tallies, busiest first.
    pub fn list_teams(&self) -> Result<Vec<TeamStats>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT team, tasks_completed, node_count, crashouts FROM teams
                 ORDER BY tasks_completed DESC, team",
            )?;
            let teams = stmt
                .query_map([], |row| {
                    Ok(TeamStats {
                        team: row.get(0)?,
                        tasks_completed: row.get(1)?,
                        node_count: row.get(2)?,
                        crashouts: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(teams)
        })
    }

    /// Get aggregate statistics.
    pub fn get_stats(&self) -> Result<Stats> {
        let live_tasks = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(counts)
        })?;
        let workers =
            self.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM workers", [], |row| row.get(0))?))?;

        Ok(Stats {
            finished_tasks: self.counter("finished_tasks")?,
            redundant_tasks: self.counter("redundant_tasks")?,
            node_count: self.counter("node_count")?,
            live_tasks,
            workers,
            teams: self.list_teams()?,
            witnesses: self.list_witnesses()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.finished_tasks, 0);
        assert_eq!(stats.redundant_tasks, 0);
        assert_eq!(stats.node_count, 0);
        assert!(stats.live_tasks.is_empty());
        assert!(stats.teams.is_empty());
    }

    #[test]
    fn test_live_counts_by_status() {
        let db = Database::open_in_memory().unwrap();
        db.create_task(4, 2, "1234", 10, false).unwrap();
        db.create_task(4, 2, "12341", 10, false).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.live_tasks.get("U"), Some(&2));
        assert_eq!(serde_json::to_value(&stats).unwrap()["live_tasks"]["U"], 2);
    }
}
