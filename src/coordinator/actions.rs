//! Request gate and action dispatch.
//!
//! A request is a flat map of string parameters naming one `action`. The gate
//! checks parameter syntax and protocol version before anything touches the
//! store; dispatch then calls the matching [`Coordinator`] operation.

use super::Coordinator;
use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
use crate::types::{DEFAULT_TEAM, FinishRequest, TaskRequest, WorkerIdentity};
use anyhow::Result;
use regex_lite::Regex;
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Parameters exempt from the digits-and-dots rule.
const FREE_FORM: &[&str] = &["action", "pwd", "team", "stressTest"];

/// Every action the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hello,
    Register,
    Unregister,
    GetTask,
    SplitTask,
    FinishTask,
    RelinquishTask,
    CheckIn,
    WitnessString,
    CreateTask,
    CancelStalledTasks,
    CancelStalledClients,
    MaybeFinishedAllTasks,
}

impl Action {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "hello" => Action::Hello,
            "register" => Action::Register,
            "unregister" => Action::Unregister,
            "getTask" => Action::GetTask,
            "splitTask" => Action::SplitTask,
            "finishTask" => Action::FinishTask,
            "relinquishTask" => Action::RelinquishTask,
            "checkIn" => Action::CheckIn,
            "witnessString" => Action::WitnessString,
            "createTask" => Action::CreateTask,
            "cancelStalledTasks" => Action::CancelStalledTasks,
            "cancelStalledClients" => Action::CancelStalledClients,
            "maybeFinishedAllTasks" => Action::MaybeFinishedAllTasks,
            _ => return None,
        })
    }

    /// Operator actions need the secret and skip the version gate.
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            Action::CreateTask
                | Action::CancelStalledTasks
                | Action::CancelStalledClients
                | Action::MaybeFinishedAllTasks
        )
    }
}

/// Compiled parameter syntax rules.
pub struct RequestGate {
    numeric: Regex,
    team: Regex,
}

impl RequestGate {
    pub fn new() -> Result<Self> {
        Ok(Self {
            numeric: Regex::new(r"^[0-9.]+$")?,
            team: Regex::new(r"^[A-Za-z0-9 ]+$")?,
        })
    }

    /// Reject any parameter with characters outside its allowed set.
    pub fn validate<'a>(&self, raw: &'a HashMap<String, String>) -> ProtocolResult<Params<'a>> {
        for (name, value) in raw {
            let ok = match name.as_str() {
                "team" => self.team.is_match(value),
                n if FREE_FORM.contains(&n) => true,
                _ => self.numeric.is_match(value),
            };
            if !ok {
                return Err(ProtocolError::invalid_value(name));
            }
        }
        Ok(Params { raw })
    }
}

/// Validated request parameters.
pub struct Params<'a> {
    raw: &'a HashMap<String, String>,
}

impl<'a> Params<'a> {
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.raw.get(name).map(String::as_str)
    }

    pub fn string(&self, name: &str) -> ProtocolResult<&'a str> {
        self.get(name)
            .ok_or_else(|| ProtocolError::missing_field(name))
    }

    pub fn int(&self, name: &str) -> ProtocolResult<i64> {
        self.string(name)?
            .parse()
            .map_err(|_| ProtocolError::invalid_value(name))
    }

    pub fn opt_int(&self, name: &str) -> ProtocolResult<Option<i64>> {
        self.get(name)
            .map(|v| v.parse().map_err(|_| ProtocolError::invalid_value(name)))
            .transpose()
    }

    pub fn team(&self) -> String {
        self.get("team").unwrap_or(DEFAULT_TEAM).to_string()
    }

    pub fn test_flag(&self) -> bool {
        self.get("stressTest") == Some("Y")
    }

    fn worker(&self) -> ProtocolResult<WorkerIdentity> {
        Ok(WorkerIdentity {
            client_id: self.int("clientID")?,
            instance_num: self.int("programInstance")?,
            ip: self.string("IP")?.to_string(),
        })
    }
}

impl Coordinator {
    /// Handle one request and produce the text sent back.
    ///
    /// Never fails: rejections and internal errors are rendered as text.
    pub fn handle(&self, raw: &HashMap<String, String>, remote_ip: &str) -> String {
        match self.dispatch(raw, remote_ip) {
            Ok(text) => text,
            Err(err) => {
                match err.code {
                    ErrorCode::DatabaseError | ErrorCode::InternalError => {
                        error!(action = raw.get("action").map(String::as_str), error = %err, "Request failed")
                    }
                    _ => debug!(action = raw.get("action").map(String::as_str), code = ?err.code, field = ?err.field, "Request rejected"),
                }
                err.wire_text()
            }
        }
    }

    fn dispatch(&self, raw: &HashMap<String, String>, remote_ip: &str) -> ProtocolResult<String> {
        let params = self.gate.validate(raw)?;
        let name = params.string("action")?;
        let action = Action::parse(name).ok_or_else(|| ProtocolError::unknown_action(name))?;

        if action.is_operator() {
            self.require_operator(params.get("pwd"))?;
        } else if action != Action::Hello {
            self.check_version(action, &params)?;
        }

        let text = match action {
            Action::Hello => "Hello world.\n".to_string(),
            Action::Register => {
                self.register(params.int("programInstance")?, remote_ip, &params.team())?
            }
            Action::Unregister => {
                let worker = params.worker()?;
                self.unregister(worker.client_id, worker.instance_num, &worker.ip)?
            }
            Action::GetTask => self.get_task(&TaskRequest {
                worker: params.worker()?,
                version: params.int("version")?,
                team: params.team(),
                test_flag: params.test_flag(),
            })?,
            Action::SplitTask => self.split_task(
                params.int("id")?,
                params.int("access")?,
                params.string("newPrefix")?,
                params.string("branchOrder")?,
                params.test_flag(),
            )?,
            Action::FinishTask => self.finish_task(
                &FinishRequest {
                    id: params.int("id")?,
                    access: params.int("access")?,
                    proven_bound: params.int("pro")?,
                    witness: params.string("str")?.to_string(),
                    team: params.team(),
                    node_count: params.opt_int("nodeCount")?.unwrap_or(0),
                    test_flag: params.test_flag(),
                },
                remote_ip,
            )?,
            Action::RelinquishTask => self.relinquish_task(
                params.int("id")?,
                params.int("access")?,
                params.int("clientID")?,
            )?,
            Action::CheckIn => self.check_in(params.int("id")?, params.int("access")?)?,
            Action::WitnessString => {
                let (n, waste) = self.checked_size(&params)?;
                self.witness_string(
                    n,
                    waste,
                    params.string("str")?,
                    params.opt_int("pro")?,
                    &params.team(),
                    remote_ip,
                )?
            }
            Action::CreateTask => {
                let (n, waste) = self.checked_size(&params)?;
                self.create_task(
                    n,
                    waste,
                    params.string("str")?,
                    params.int("pte")?,
                    params.test_flag(),
                )?
            }
            Action::CancelStalledTasks => self.cancel_stalled_tasks(positive_minutes(&params)?)?,
            Action::CancelStalledClients => {
                self.cancel_stalled_clients(positive_minutes(&params)?)?
            }
            Action::MaybeFinishedAllTasks => self.maybe_finished_all_tasks()?,
        };
        Ok(text)
    }

    /// Hard floor for everyone; soft floor for anything that starts new work.
    fn check_version(&self, action: Action, params: &Params<'_>) -> ProtocolResult<()> {
        let server = self.server_config();
        let version = params.int("version")?;
        if version < server.version_required {
            return Err(ProtocolError::superseded(
                server.version_required,
                &server.code_repo,
            ));
        }
        if version < server.version_for_new_tasks {
            match action {
                Action::Register => {}
                Action::GetTask => {
                    // Let the client exit cleanly: it holds nothing after this
                    let worker = params.worker()?;
                    warn!(client_id = worker.client_id, version, "Unregistering superseded client");
                    self.unregister(worker.client_id, worker.instance_num, &worker.ip)?;
                }
                _ => return Ok(()),
            }
            return Err(ProtocolError::superseded(
                server.version_for_new_tasks,
                &server.code_repo,
            ));
        }
        Ok(())
    }

    fn checked_size(&self, params: &Params<'_>) -> ProtocolResult<(i64, i64)> {
        let server = self.server_config();
        let n = params.int("n")?;
        let waste = params.int("w")?;
        if n < server.min_n || n > server.max_n {
            return Err(ProtocolError::invalid_value("n"));
        }
        if waste < 0 {
            return Err(ProtocolError::invalid_value("w"));
        }
        Ok((n, waste))
    }
}

/// Stall thresholds must be a positive number of minutes.
fn positive_minutes(params: &Params<'_>) -> ProtocolResult<i64> {
    match params.int("maxMins")? {
        minutes if minutes > 0 => Ok(minutes),
        _ => Err(ProtocolError::invalid_value("maxMins")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Action::parse("getTask"), Some(Action::GetTask));
        assert_eq!(Action::parse("gettask"), None);
        assert!(Action::CreateTask.is_operator());
        assert!(!Action::FinishTask.is_operator());
    }

    #[test]
    fn test_gate_rejects_non_numeric() {
        let gate = RequestGate::new().unwrap();
        let raw = params(&[("action", "checkIn"), ("id", "12x")]);
        let err = gate.validate(&raw).err().unwrap();
        assert_eq!(err.field.as_deref(), Some("id"));
        assert_eq!(err.wire_text(), "Error: Invalid query\n");
    }

    #[test]
    fn test_gate_team_names() {
        let gate = RequestGate::new().unwrap();
        assert!(gate.validate(&params(&[("team", "Team 42")])).is_ok());
        assert!(gate.validate(&params(&[("team", "Team;DROP")])).is_err());
    }

    #[test]
    fn test_params_helpers() {
        let gate = RequestGate::new().unwrap();
        let raw = params(&[("id", "17"), ("stressTest", "Y"), ("pro", "3.5")]);
        let p = gate.validate(&raw).unwrap();
        assert_eq!(p.int("id").unwrap(), 17);
        assert!(p.test_flag());
        assert_eq!(p.team(), "anonymous");
        assert!(p.int("access").is_err());
        assert!(p.opt_int("pro").is_err());
        assert_eq!(p.opt_int("nodeCount").unwrap(), None);
    }
}
