//! Core types for the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a search task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Split child waiting for its parent to finish.
    Pending,
    Unassigned,
    Assigned,
    /// Only ever seen on archived rows.
    Finished,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "P",
            TaskStatus::Unassigned => "U",
            TaskStatus::Assigned => "A",
            TaskStatus::Finished => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(TaskStatus::Pending),
            "U" => Some(TaskStatus::Unassigned),
            "A" => Some(TaskStatus::Assigned),
            "F" => Some(TaskStatus::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of search work: a node of the search tree, or the subtree below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Capability secret, re-rolled on every hand-off.
    pub access: i64,
    pub n: i64,
    pub waste: i64,
    pub iteration: i64,
    pub prefix: String,
    pub perm_to_exceed: i64,
    pub prev_perm_ruled_out: i64,
    pub branch_order: String,
    pub status: TaskStatus,
    pub client_id: i64,
    pub team: String,
    pub checkin_count: i64,
    pub redundant: bool,
    pub parent_id: i64,
    pub parent_prefix_len: i64,
    pub test_flag: bool,
    pub created_at: i64,
    pub allocated_at: Option<i64>,
    pub last_activity_at: i64,
}

impl Task {
    /// The Pending child produced when a worker splits this task.
    ///
    /// Everything not named here is inherited from the parent. The child is
    /// bound to no worker until it is allocated in its own right.
    pub fn split_child(&self, access: i64, prefix: &str, branch_order: &str, now: i64) -> Task {
        Task {
            id: 0,
            access,
            prefix: prefix.to_string(),
            branch_order: branch_order.to_string(),
            status: TaskStatus::Pending,
            client_id: 0,
            checkin_count: 0,
            allocated_at: None,
            parent_id: self.id,
            parent_prefix_len: self.prefix.len() as i64,
            created_at: now,
            last_activity_at: now,
            ..self.clone()
        }
    }

    /// Portion of the prefix this task added below its parent.
    pub fn local_prefix(&self) -> &str {
        let start = (self.parent_prefix_len.max(0) as usize).min(self.prefix.len());
        &self.prefix[start..]
    }

    pub fn generation(&self) -> Generation {
        Generation {
            n: self.n,
            waste: self.waste,
            iteration: self.iteration,
        }
    }
}

/// All tasks sharing (n, waste, iteration): one pass of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub n: i64,
    pub waste: i64,
    pub iteration: i64,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.n, self.waste, self.iteration)
    }
}

/// A registered remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub instance_num: i64,
    pub ip: String,
    pub team: String,
    pub checkin_count: i64,
    /// 0 when idle.
    pub current_task: i64,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

/// Best witnessed and best excluded permutation counts for one (n, waste).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub n: i64,
    pub waste: i64,
    pub perms: i64,
    pub str: String,
    pub excl_perms: Option<i64>,
    pub is_final: bool,
    pub team: String,
    pub updated_at: i64,
}

/// Per-team tallies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStats {
    pub team: String,
    pub tasks_completed: i64,
    pub node_count: i64,
    pub crashouts: i64,
}

/// Who is asking: the triple a worker must present on every call.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub client_id: i64,
    pub instance_num: i64,
    pub ip: String,
}

/// Parameters of a `getTask` request after gate validation.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub worker: WorkerIdentity,
    pub version: i64,
    pub team: String,
    pub test_flag: bool,
}

/// Parameters of a `finishTask` request after gate validation.
#[derive(Debug, Clone)]
pub struct FinishRequest {
    pub id: i64,
    pub access: i64,
    pub proven_bound: i64,
    pub witness: String,
    pub team: String,
    pub node_count: i64,
    pub test_flag: bool,
}

/// Team name used when the client does not supply one.
pub const DEFAULT_TEAM: &str = "anonymous";
