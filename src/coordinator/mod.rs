//! Coordinator service: the operations workers and operators call.
//!
//! Each method runs one logical operation against the store and returns the
//! wire text for it. Request parsing and gating live in [`actions`].

pub mod actions;
pub mod throttle;

use crate::config::{ServerConfig, ThrottleConfig};
use crate::db::Database;
use crate::db::tasks::Allocation;
use crate::error::ProtocolError;
use crate::types::{FinishRequest, TaskRequest};
use actions::RequestGate;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

/// Shared, cheaply cloneable coordinator handle.
#[derive(Clone)]
pub struct Coordinator {
    db: Arc<Database>,
    server: Arc<ServerConfig>,
    throttle: Arc<ArcSwap<ThrottleConfig>>,
    gate: Arc<RequestGate>,
}

impl Coordinator {
    pub fn new(db: Arc<Database>, server: ServerConfig, throttle: ThrottleConfig) -> Result<Self> {
        Ok(Self {
            db,
            server: Arc::new(server),
            throttle: Arc::new(ArcSwap::from_pointee(throttle)),
            gate: Arc::new(RequestGate::new()?),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// Handle for swapping in reloaded throttle settings.
    pub fn throttle_handle(&self) -> Arc<ArcSwap<ThrottleConfig>> {
        Arc::clone(&self.throttle)
    }

    /// Hand out the next task, subject to the throttle.
    pub fn get_task(&self, request: &TaskRequest) -> Result<String> {
        let throttle = self.throttle.load();
        if throttle::shed_request(&throttle, &mut rand::thread_rng()) {
            debug!(client_id = request.worker.client_id, "Shed getTask request");
            return Ok(throttle::render_no_tasks(&throttle));
        }

        Ok(match self.db.allocate_task(request)? {
            Allocation::Offer(offer) => throttle::render_offer(&offer, &throttle),
            Allocation::NoTasks => throttle::render_no_tasks(&throttle),
            Allocation::UnknownWorker => "Error: No client found with those details\n".to_string(),
        })
    }

    pub fn register(&self, instance_num: i64, ip: &str, team: &str) -> Result<String> {
        let outcome = self
            .db
            .register_worker(instance_num, ip, team, self.server.max_workers)?;
        Ok(outcome.to_string())
    }

    pub fn unregister(&self, client_id: i64, instance_num: i64, ip: &str) -> Result<String> {
        Ok(self
            .db
            .unregister_worker(client_id, instance_num, ip)?
            .to_string())
    }

    pub fn split_task(
        &self,
        id: i64,
        access: i64,
        new_prefix: &str,
        branch_order: &str,
        test_flag: bool,
    ) -> Result<String> {
        Ok(self
            .db
            .split_task(id, access, new_prefix, branch_order, test_flag)?
            .to_string())
    }

    pub fn finish_task(&self, request: &FinishRequest, ip: &str) -> Result<String> {
        Ok(self.db.finish_task(request, ip)?.to_string())
    }

    pub fn check_in(&self, id: i64, access: i64) -> Result<String> {
        Ok(self.db.check_in(id, access)?.to_string())
    }

    pub fn relinquish_task(&self, id: i64, access: i64, client_id: i64) -> Result<String> {
        Ok(if self.db.relinquish_task(id, access, client_id)? {
            "Relinquished task\n".to_string()
        } else {
            "Error: Unable to locate task to abandon\n".to_string()
        })
    }

    pub fn witness_string(
        &self,
        n: i64,
        waste: i64,
        str: &str,
        proven_bound: Option<i64>,
        team: &str,
        ip: &str,
    ) -> Result<String> {
        Ok(self
            .db
            .witness_string(n, waste, str, proven_bound, team, ip)?
            .to_string())
    }

    pub fn create_task(
        &self,
        n: i64,
        waste: i64,
        prefix: &str,
        perm_to_exceed: i64,
        test_flag: bool,
    ) -> Result<String> {
        Ok(self
            .db
            .create_task(n, waste, prefix, perm_to_exceed, test_flag)?
            .to_string())
    }

    pub fn cancel_stalled_tasks(&self, max_minutes: i64) -> Result<String> {
        Ok(self.db.cancel_stalled_tasks(max_minutes)?.to_string())
    }

    pub fn cancel_stalled_clients(&self, max_minutes: i64) -> Result<String> {
        Ok(self.db.cancel_stalled_clients(max_minutes)?.to_string())
    }

    pub fn maybe_finished_all_tasks(&self) -> Result<String> {
        Ok(self.db.maybe_finished_all_tasks()?.to_string())
    }

    /// Fail unless `pwd` matches the configured operator secret.
    fn require_operator(&self, pwd: Option<&str>) -> Result<(), ProtocolError> {
        match (&self.server.operator_secret, pwd) {
            (Some(secret), Some(pwd)) if secret == pwd => Ok(()),
            _ => Err(ProtocolError::not_authorized()),
        }
    }
}
