//! Task completion: archive, prune, promote children, tally.

use super::escalate::AdvanceOutcome;
use super::tasks::{TASK_COLUMNS, find_task_by_access, live_generation_count, parse_task_row};
use super::witness::{WitnessSubmission, record_witness_internal};
use super::workers::clear_current_task;
use super::{Database, now_ms};
use crate::perms::{count_permutations, factorial, implied_waste};
use crate::types::{FinishRequest, Generation, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, params};
use std::fmt;
use tracing::{error, info};

/// Marker stored as the witness of tasks pruned without being searched.
pub const REDUNDANT_WITNESS: &str = "redundant";

/// Outcome of `finishTask`.
#[derive(Debug, Clone)]
pub enum FinishOutcome {
    Finished {
        /// Set when this completion emptied its generation.
        escalation: Option<AdvanceOutcome>,
        pruned: usize,
    },
    NotFound { id: i64, access: i64 },
    UnexpectedStatus(TaskStatus),
    PrefixMismatch,
    InvalidString,
    WasteExceeded { waste: i64, allowed: i64 },
    BoundNotAbovePerms { bound: i64, perms: i64 },
}

impl fmt::Display for FinishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishOutcome::Finished { .. } => writeln!(f, "OK"),
            FinishOutcome::NotFound { id, access } => writeln!(
                f,
                "Cancelled: No match to id={}, access={} for the task being finalised. \
                 (It may have already been unexpectedly finalised.)",
                id, access
            ),
            FinishOutcome::UnexpectedStatus(TaskStatus::Finished) => writeln!(
                f,
                "Cancelled: The task being finalised was already marked finalised, which was unexpected"
            ),
            FinishOutcome::UnexpectedStatus(status) => writeln!(
                f,
                "Cancelled: The task being finalised was found to have status {}, which was unexpected",
                status
            ),
            FinishOutcome::PrefixMismatch => {
                writeln!(f, "Error: String does not start with expected prefix")
            }
            FinishOutcome::InvalidString => writeln!(f, "Error: Invalid string"),
            FinishOutcome::WasteExceeded { waste, allowed } => writeln!(
                f,
                "Error: String has waste {}, more than the task's {}",
                waste, allowed
            ),
            FinishOutcome::BoundNotAbovePerms { bound, perms } => writeln!(
                f,
                "Error: Trying to set permutations ruled out to {} while exhibiting a string with {} permutations",
                bound, perms
            ),
        }
    }
}

/// Copy a task into the archive.
#[allow(clippy::too_many_arguments)]
fn archive_task(
    conn: &Connection,
    task: &Task,
    perm_ruled_out: i64,
    excl_witness: &str,
    team: &str,
    node_count: i64,
    redundant: bool,
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO finished_tasks (original_task_id, access, n, waste, iteration, prefix,
             perm_to_exceed, prev_perm_ruled_out, perm_ruled_out, excl_witness, status,
             client_id, team, checkin_count, node_count, redundant, parent_id,
             parent_prefix_len, test_flag, allocated_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'F', ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20)",
        params![
            task.id,
            task.access,
            task.n,
            task.waste,
            task.iteration,
            task.local_prefix(),
            task.perm_to_exceed,
            task.prev_perm_ruled_out,
            perm_ruled_out,
            excl_witness,
            task.client_id,
            team,
            task.checkin_count,
            node_count,
            redundant as i64,
            task.parent_id,
            task.parent_prefix_len,
            task.test_flag as i64,
            task.allocated_at,
            now,
        ],
    )?;
    Ok(())
}

/// Archive and delete every Unassigned task of a generation. Returns the count.
fn prune_generation(
    conn: &Connection,
    generation: Generation,
    perm_ruled_out: i64,
    team: &str,
    now: i64,
) -> Result<usize> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE n = ?1 AND waste = ?2 AND iteration = ?3 AND status = 'U'",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let doomed = stmt
        .query_map(
            params![generation.n, generation.waste, generation.iteration],
            parse_task_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for task in &doomed {
        archive_task(conn, task, perm_ruled_out, REDUNDANT_WITNESS, team, 0, true, now)?;
    }
    conn.execute(
        "DELETE FROM tasks WHERE n = ?1 AND waste = ?2 AND iteration = ?3 AND status = 'U'",
        params![generation.n, generation.waste, generation.iteration],
    )?;

    // Tasks still being searched learn of it at their next check-in or split
    conn.execute(
        "UPDATE tasks SET redundant = 1
         WHERE n = ?1 AND waste = ?2 AND iteration = ?3 AND status = 'A'",
        params![generation.n, generation.waste, generation.iteration],
    )?;
    add_counter(conn, "redundant_tasks", doomed.len() as i64)?;

    Ok(doomed.len())
}

pub(crate) fn add_counter(conn: &Connection, name: &str, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE counters SET value = value + ?2 WHERE name = ?1",
        params![name, delta],
    )?;
    Ok(())
}

/// Bump a team's tallies, creating the row on first contact.
pub(crate) fn tally_team(
    conn: &Connection,
    team: &str,
    tasks_completed: i64,
    node_count: i64,
    crashouts: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO teams (team, tasks_completed, node_count, crashouts)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(team) DO UPDATE SET
             tasks_completed = tasks_completed + excluded.tasks_completed,
             node_count = node_count + excluded.node_count,
             crashouts = crashouts + excluded.crashouts",
        params![team, tasks_completed, node_count, crashouts],
    )?;
    Ok(())
}

/// What the finishing transaction decided, before any escalation.
enum Settled {
    Done {
        generation: Generation,
        live: i64,
        pruned: usize,
    },
    Rejected(FinishOutcome),
}

impl Database {
    /// Accept a worker's result for the task it holds.
    pub fn finish_task(&self, req: &FinishRequest, ip: &str) -> Result<FinishOutcome> {
        let settled = self.transact("finishTask", |tx| {
            let now = now_ms();
            let Some(task) = find_task_by_access(tx, req.id, req.access)? else {
                return Ok(Settled::Rejected(FinishOutcome::NotFound {
                    id: req.id,
                    access: req.access,
                }));
            };
            if task.status != TaskStatus::Assigned {
                return Ok(Settled::Rejected(FinishOutcome::UnexpectedStatus(task.status)));
            }
            if !req.witness.starts_with(&task.prefix) {
                return Ok(Settled::Rejected(FinishOutcome::PrefixMismatch));
            }
            let perms = match count_permutations(&req.witness, task.n) {
                Some(p) if p > 0 => p,
                _ => return Ok(Settled::Rejected(FinishOutcome::InvalidString)),
            };
            let waste = implied_waste(req.witness.len(), task.n, perms);
            if waste > task.waste {
                return Ok(Settled::Rejected(FinishOutcome::WasteExceeded {
                    waste,
                    allowed: task.waste,
                }));
            }
            if req.proven_bound <= perms {
                return Ok(Settled::Rejected(FinishOutcome::BoundNotAbovePerms {
                    bound: req.proven_bound,
                    perms,
                }));
            }

            let generation = task.generation();
            let ppro = task.prev_perm_ruled_out;
            let mut pruned = 0;
            if ppro > 0 && req.proven_bound >= ppro && req.proven_bound != factorial(task.n) + 1 {
                pruned = prune_generation(tx, generation, req.proven_bound, &req.team, now)?;
                info!(
                    task_id = task.id,
                    n = generation.n,
                    waste = generation.waste,
                    iteration = generation.iteration,
                    pruned,
                    "Generation made redundant"
                );
            }

            let suffix = &req.witness[task.prefix.len()..];
            archive_task(
                tx,
                &task,
                req.proven_bound,
                suffix,
                &req.team,
                req.node_count,
                task.redundant,
                now,
            )?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![task.id])?;
            tx.execute(
                "UPDATE tasks SET status = 'U', last_activity_at = ?2
                 WHERE parent_id = ?1 AND status = 'P'",
                params![task.id, now],
            )?;

            add_counter(tx, "finished_tasks", 1)?;
            add_counter(tx, "node_count", req.node_count)?;
            tally_team(tx, &req.team, 1, req.node_count, 0)?;
            clear_current_task(tx, task.id)?;

            record_witness_internal(
                tx,
                &WitnessSubmission {
                    n: task.n,
                    waste: task.waste,
                    perms,
                    str: &req.witness,
                    proven_bound: None,
                    team: &req.team,
                    ip,
                },
            )?;

            let live = live_generation_count(tx, generation)?;
            info!(task_id = task.id, client_id = task.client_id, perms, proven_bound = req.proven_bound, live, "Task finished");
            Ok(Settled::Done {
                generation,
                live,
                pruned,
            })
        })?;

        match settled {
            Settled::Rejected(outcome) => Ok(outcome),
            Settled::Done {
                generation,
                live,
                pruned,
            } => {
                let escalation = if live == 0 {
                    match self.advance_generation(generation) {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            error!(%generation, error = %e, "Escalation failed after finishTask");
                            None
                        }
                    }
                } else {
                    None
                };
                Ok(FinishOutcome::Finished { escalation, pruned })
            }
        }
    }
}
