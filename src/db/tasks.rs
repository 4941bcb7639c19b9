//! Task allocation, splitting, check-in and release.

use super::workers::{get_worker_internal, touch_worker};
use super::{Database, new_access_code, now_ms};
use crate::error::StoreError;
use crate::perms::count_permutations;
use crate::types::{Generation, Task, TaskRequest, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt;
use tracing::{debug, info, warn};

pub(crate) const TASK_COLUMNS: &str = "id, access, n, waste, iteration, prefix, perm_to_exceed, \
     prev_perm_ruled_out, branch_order, status, client_id, team, checkin_count, redundant, \
     parent_id, parent_prefix_len, test_flag, created_at, allocated_at, last_activity_at";

/// Parse a task from a database row.
pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let status = TaskStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown task status {}", status).into(),
        )
    })?;

    Ok(Task {
        id: row.get("id")?,
        access: row.get("access")?,
        n: row.get("n")?,
        waste: row.get("waste")?,
        iteration: row.get("iteration")?,
        prefix: row.get("prefix")?,
        perm_to_exceed: row.get("perm_to_exceed")?,
        prev_perm_ruled_out: row.get("prev_perm_ruled_out")?,
        branch_order: row.get("branch_order")?,
        status,
        client_id: row.get("client_id")?,
        team: row.get("team")?,
        checkin_count: row.get("checkin_count")?,
        redundant: row.get::<_, i64>("redundant")? != 0,
        parent_id: row.get("parent_id")?,
        parent_prefix_len: row.get("parent_prefix_len")?,
        test_flag: row.get::<_, i64>("test_flag")? != 0,
        created_at: row.get("created_at")?,
        allocated_at: row.get("allocated_at")?,
        last_activity_at: row.get("last_activity_at")?,
    })
}

/// Internal helper to get a task using an existing connection.
pub(crate) fn get_task_internal(conn: &Connection, id: i64) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], parse_task_row)
        .optional()?)
}

/// Look up a task by the capability pair every mutating call presents.
pub(crate) fn find_task_by_access(conn: &Connection, id: i64, access: i64) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE id = ?1 AND access = ?2",
        TASK_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id, access], parse_task_row)
        .optional()?)
}

/// Insert a task row (the `id` field is ignored) and return its new id.
pub(crate) fn insert_task(conn: &Connection, task: &Task) -> Result<i64> {
    conn.execute(
        "INSERT INTO tasks (access, n, waste, iteration, prefix, perm_to_exceed,
             prev_perm_ruled_out, branch_order, status, client_id, team, checkin_count,
             redundant, parent_id, parent_prefix_len, test_flag, created_at, allocated_at,
             last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            task.access,
            task.n,
            task.waste,
            task.iteration,
            task.prefix,
            task.perm_to_exceed,
            task.prev_perm_ruled_out,
            task.branch_order,
            task.status.as_str(),
            task.client_id,
            task.team,
            task.checkin_count,
            task.redundant as i64,
            task.parent_id,
            task.parent_prefix_len,
            task.test_flag as i64,
            task.created_at,
            task.allocated_at,
            task.last_activity_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A fresh root task for a generation, with no lineage.
pub(crate) fn root_task(
    generation: Generation,
    prefix: &str,
    perm_to_exceed: i64,
    prev_perm_ruled_out: i64,
    test_flag: bool,
    now: i64,
) -> Task {
    Task {
        id: 0,
        access: new_access_code(None),
        n: generation.n,
        waste: generation.waste,
        iteration: generation.iteration,
        prefix: prefix.to_string(),
        perm_to_exceed,
        prev_perm_ruled_out,
        branch_order: "0".repeat(prefix.len()),
        status: TaskStatus::Unassigned,
        client_id: 0,
        team: crate::types::DEFAULT_TEAM.to_string(),
        checkin_count: 0,
        redundant: false,
        parent_id: 0,
        parent_prefix_len: 0,
        test_flag,
        created_at: now,
        allocated_at: None,
        last_activity_at: now,
    }
}

/// Delete the speculative Pending children of a task.
pub(crate) fn delete_pending_children(conn: &Connection, parent_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM tasks WHERE parent_id = ?1 AND status = 'P'",
        params![parent_id],
    )?)
}

/// Return an Assigned task to the pool with a new access code.
///
/// Acts only when the task is Assigned and matches whichever of client and
/// access are given. Returns the client that held it.
pub(crate) fn release_task_internal(
    conn: &Connection,
    id: i64,
    expected_client: Option<i64>,
    expected_access: Option<i64>,
) -> Result<Option<i64>> {
    let Some(task) = get_task_internal(conn, id)? else {
        return Ok(None);
    };
    if task.status != TaskStatus::Assigned
        || expected_client.is_some_and(|c| c != task.client_id)
        || expected_access.is_some_and(|a| a != task.access)
    {
        return Ok(None);
    }

    let access = new_access_code(Some(task.access));
    conn.execute(
        "UPDATE tasks SET status = 'U', access = ?2, client_id = 0, allocated_at = NULL,
             last_activity_at = ?3
         WHERE id = ?1",
        params![id, access, now_ms()],
    )?;
    let orphans = delete_pending_children(conn, id)?;
    debug!(task_id = id, client_id = task.client_id, orphans, "Released task");

    Ok(Some(task.client_id))
}

/// Live (Pending, Unassigned or Assigned) tasks left in a generation.
pub(crate) fn live_generation_count(conn: &Connection, generation: Generation) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE n = ?1 AND waste = ?2 AND iteration = ?3
             AND status IN ('P', 'U', 'A')",
        params![generation.n, generation.waste, generation.iteration],
        |row| row.get(0),
    )?)
}

/// Finalized waste levels at or below this are never reported to the client.
pub fn finalized_floor(version: i64, n: i64) -> i64 {
    if version >= 8 && n == 6 { 115 } else { 0 }
}

/// A task handed to a worker, with what it needs to skip solved generations.
#[derive(Debug, Clone)]
pub struct TaskOffer {
    pub task: Task,
    /// Finalized (waste, perms) pairs above the version's floor.
    pub finalized: Vec<(i64, i64)>,
    /// Fraction of registered workers holding no task.
    pub idle_fraction: f64,
}

#[derive(Debug, Clone)]
pub enum Allocation {
    Offer(TaskOffer),
    NoTasks,
    UnknownWorker,
}

/// Outcome of a split request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Created(i64),
    /// The task was pruned; the worker should abandon it.
    Done,
    NotFound { id: i64, access: i64 },
    UnexpectedStatus(TaskStatus),
    InvalidPrefix(String),
}

impl fmt::Display for SplitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitOutcome::Created(_) => writeln!(f, "OK"),
            SplitOutcome::Done => writeln!(f, "Done"),
            SplitOutcome::NotFound { id, access } => writeln!(
                f,
                "Cancelled: No match to id={}, access={} for the task being split",
                id, access
            ),
            SplitOutcome::UnexpectedStatus(TaskStatus::Finished) => writeln!(
                f,
                "Cancelled: The task being split was marked finalised, which was unexpected"
            ),
            SplitOutcome::UnexpectedStatus(status) => writeln!(
                f,
                "Cancelled: The task being split was found to have status {}, which was unexpected",
                status
            ),
            SplitOutcome::InvalidPrefix(prefix) => {
                writeln!(f, "Error: Invalid new prefix string {}", prefix)
            }
        }
    }
}

/// Outcome of a check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    Ok,
    Done,
    NotFound { id: i64, access: i64 },
    UnexpectedStatus(TaskStatus),
}

impl fmt::Display for CheckInOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckInOutcome::Ok => writeln!(f, "OK"),
            CheckInOutcome::Done => writeln!(f, "Done"),
            CheckInOutcome::NotFound { id, access } => writeln!(
                f,
                "Cancelled: No match to id={}, access={} for the task checking in",
                id, access
            ),
            CheckInOutcome::UnexpectedStatus(TaskStatus::Finished) => writeln!(
                f,
                "Cancelled: The task checking in was marked finalised, which was unexpected"
            ),
            CheckInOutcome::UnexpectedStatus(status) => writeln!(
                f,
                "Cancelled: The task checking in was found to have status {}, which was unexpected",
                status
            ),
        }
    }
}

/// Outcome of an operator seeding a root task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(i64),
    Existed(i64),
    InvalidString,
}

impl fmt::Display for CreateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateOutcome::Created(id) => writeln!(f, "Task id: {}", id),
            CreateOutcome::Existed(id) => {
                writeln!(f, "Task id: {} already existed with those properties", id)
            }
            CreateOutcome::InvalidString => writeln!(f, "Error: Invalid string"),
        }
    }
}

impl Database {
    /// Get a task by id.
    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, id))
    }

    /// Hand the requesting worker the unassigned task with the smallest branch order.
    pub fn allocate_task(&self, request: &TaskRequest) -> Result<Allocation> {
        self.transact("getTask", |tx| {
            let now = now_ms();
            let identity = &request.worker;

            // Verify the worker first so an unknown caller never strands a task
            let Some(worker) = get_worker_internal(
                tx,
                identity.client_id,
                identity.instance_num,
                &identity.ip,
            )?
            else {
                warn!(client_id = identity.client_id, ip = %identity.ip, "getTask from unknown worker");
                return Ok(Allocation::UnknownWorker);
            };

            let sql = format!(
                "SELECT {} FROM tasks WHERE status = 'U' AND test_flag = ?1
                 ORDER BY branch_order ASC, id ASC LIMIT 1",
                TASK_COLUMNS
            );
            let candidate = tx
                .query_row(&sql, params![request.test_flag as i64], parse_task_row)
                .optional()?;

            if candidate.is_none() {
                let unassigned: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'U' AND test_flag = ?1",
                    params![request.test_flag as i64],
                    |row| row.get(0),
                )?;
                if unassigned > 0 {
                    return Err(StoreError::Inconsistent("getTask".to_string()).into());
                }
            }

            let (idle, total): (i64, i64) = tx.query_row(
                "SELECT COALESCE(SUM(current_task = 0), 0), COUNT(*) FROM workers",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let idle_fraction = if total > 0 {
                idle as f64 / total as f64
            } else {
                0.0
            };

            let offer = match candidate {
                Some(mut task) => {
                    if task.client_id != 0 {
                        warn!(task_id = task.id, client_id = task.client_id, "Unassigned task was still bound to a client");
                    }

                    let ledger_perms: Option<i64> = tx
                        .query_row(
                            "SELECT perms FROM witness_strings WHERE n = ?1 AND waste = ?2",
                            params![task.n, task.waste],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(perms) = ledger_perms
                        && perms > task.perm_to_exceed
                    {
                        debug!(task_id = task.id, from = task.perm_to_exceed, to = perms, "Raising target to ledger maximum");
                        task.perm_to_exceed = perms;
                    }

                    tx.execute(
                        "UPDATE tasks SET status = 'A', client_id = ?2, team = ?3, allocated_at = ?4,
                             last_activity_at = ?4, perm_to_exceed = ?5
                         WHERE id = ?1",
                        params![task.id, worker.id, request.team, now, task.perm_to_exceed],
                    )?;
                    task.status = TaskStatus::Assigned;
                    task.client_id = worker.id;
                    task.team = request.team.clone();
                    task.allocated_at = Some(now);
                    task.last_activity_at = now;

                    let floor = finalized_floor(request.version, task.n);
                    let mut stmt = tx.prepare(
                        "SELECT waste, perms FROM witness_strings
                         WHERE n = ?1 AND final = 1 AND waste > ?2 ORDER BY waste",
                    )?;
                    let finalized = stmt
                        .query_map(params![task.n, floor], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<rusqlite::Result<Vec<(i64, i64)>>>()?;

                    Some(TaskOffer {
                        task,
                        finalized,
                        idle_fraction,
                    })
                }
                None => None,
            };

            let new_task_id = offer.as_ref().map_or(0, |o| o.task.id);
            touch_worker(tx, worker.id, now)?;
            tx.execute(
                "UPDATE workers SET current_task = ?2 WHERE id = ?1",
                params![worker.id, new_task_id],
            )?;

            if worker.current_task != 0 && worker.current_task != new_task_id {
                warn!(client_id = worker.id, task_id = worker.current_task, "Worker asked for a task while still holding one");
                release_task_internal(tx, worker.current_task, Some(worker.id), None)?;
            }

            Ok(match offer {
                Some(offer) => {
                    info!(task_id = offer.task.id, client_id = worker.id, n = offer.task.n, waste = offer.task.waste, "Allocated task");
                    Allocation::Offer(offer)
                }
                None => Allocation::NoTasks,
            })
        })
    }

    /// Record a Pending child covering part of an Assigned task's subtree.
    pub fn split_task(
        &self,
        id: i64,
        access: i64,
        new_prefix: &str,
        branch_order: &str,
        test_flag: bool,
    ) -> Result<SplitOutcome> {
        self.transact("splitTask", |tx| {
            let now = now_ms();
            let Some(task) = find_task_by_access(tx, id, access)? else {
                return Ok(SplitOutcome::NotFound { id, access });
            };
            if task.status != TaskStatus::Assigned {
                return Ok(SplitOutcome::UnexpectedStatus(task.status));
            }
            if new_prefix.len() <= task.prefix.len()
                || !new_prefix.starts_with(&task.prefix)
                || branch_order.len() != new_prefix.len()
                || !branch_order.bytes().all(|b| b.is_ascii_digit())
                || count_permutations(new_prefix, task.n).is_none()
            {
                return Ok(SplitOutcome::InvalidPrefix(new_prefix.to_string()));
            }

            tx.execute(
                "UPDATE tasks SET checkin_count = checkin_count + 1, last_activity_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
            if task.client_id != 0 {
                touch_worker(tx, task.client_id, now)?;
            }

            if task.redundant {
                return Ok(SplitOutcome::Done);
            }
            if task.test_flag != test_flag {
                warn!(task_id = id, "Split request test flag differs from the task's");
            }

            let child = task.split_child(new_access_code(None), new_prefix, branch_order, now);
            let child_id = insert_task(tx, &child)?;
            debug!(task_id = id, child_id, prefix = new_prefix, "Split task");
            Ok(SplitOutcome::Created(child_id))
        })
    }

    /// Proof of life from the worker holding a task.
    pub fn check_in(&self, id: i64, access: i64) -> Result<CheckInOutcome> {
        self.transact("checkIn", |tx| {
            let now = now_ms();
            let Some(task) = find_task_by_access(tx, id, access)? else {
                return Ok(CheckInOutcome::NotFound { id, access });
            };
            if task.status != TaskStatus::Assigned {
                return Ok(CheckInOutcome::UnexpectedStatus(task.status));
            }

            tx.execute(
                "UPDATE tasks SET checkin_count = checkin_count + 1, last_activity_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?;
            if task.client_id != 0 {
                touch_worker(tx, task.client_id, now)?;
            }

            Ok(if task.redundant {
                CheckInOutcome::Done
            } else {
                CheckInOutcome::Ok
            })
        })
    }

    /// Give a task back voluntarily. Returns false if nothing matched.
    pub fn relinquish_task(&self, id: i64, access: i64, client_id: i64) -> Result<bool> {
        self.transact("relinquishTask", |tx| {
            if release_task_internal(tx, id, Some(client_id), Some(access))?.is_none() {
                return Ok(false);
            }
            tx.execute(
                "UPDATE workers SET current_task = 0 WHERE id = ?1 AND current_task = ?2",
                params![client_id, id],
            )?;
            info!(task_id = id, client_id, "Task relinquished");
            Ok(true)
        })
    }

    /// Seed a root task. Idempotent on (n, waste, prefix, perm_to_exceed).
    pub fn create_task(
        &self,
        n: i64,
        waste: i64,
        prefix: &str,
        perm_to_exceed: i64,
        test_flag: bool,
    ) -> Result<CreateOutcome> {
        if perm_to_exceed <= 0 || !count_permutations(prefix, n).is_some_and(|p| p > 0) {
            return Ok(CreateOutcome::InvalidString);
        }

        self.transact("createTask", |tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE n = ?1 AND waste = ?2 AND prefix = ?3
                         AND perm_to_exceed = ?4
                     ORDER BY id LIMIT 1",
                    params![n, waste, prefix, perm_to_exceed],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(CreateOutcome::Existed(id));
            }

            let generation = Generation {
                n,
                waste,
                iteration: 0,
            };
            let task = root_task(generation, prefix, perm_to_exceed, 0, test_flag, now_ms());
            let id = insert_task(tx, &task)?;
            info!(task_id = id, n, waste, perm_to_exceed, "Created root task");
            Ok(CreateOutcome::Created(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalized_floor() {
        assert_eq!(finalized_floor(13, 6), 115);
        assert_eq!(finalized_floor(7, 6), 0);
        assert_eq!(finalized_floor(13, 5), 0);
    }

    #[test]
    fn test_outcome_wire_text() {
        assert_eq!(SplitOutcome::Done.to_string(), "Done\n");
        assert_eq!(
            SplitOutcome::NotFound { id: 3, access: 9 }.to_string(),
            "Cancelled: No match to id=3, access=9 for the task being split\n"
        );
        assert_eq!(
            CheckInOutcome::UnexpectedStatus(TaskStatus::Unassigned).to_string(),
            "Cancelled: The task checking in was found to have status U, which was unexpected\n"
        );
        assert_eq!(
            CreateOutcome::Existed(4).to_string(),
            "Task id: 4 already existed with those properties\n"
        );
    }

    #[test]
    fn test_release_is_a_noop_unless_assigned() {
        let db = Database::open_in_memory().unwrap();
        let id = match db.create_task(4, 0, "1234", 1, false).unwrap() {
            CreateOutcome::Created(id) => id,
            other => panic!("unexpected: {:?}", other),
        };
        let released = db
            .with_conn(|conn| release_task_internal(conn, id, None, None))
            .unwrap();
        assert_eq!(released, None);
    }
}
