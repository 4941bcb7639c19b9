//! Load-shedding decisions and the task-offer text they shape.

use crate::config::ThrottleConfig;
use crate::db::tasks::TaskOffer;
use rand::Rng;
use std::fmt::Write;

/// Whether this `getTask` is turned away regardless of available work.
pub fn shed_request<R: Rng + ?Sized>(throttle: &ThrottleConfig, rng: &mut R) -> bool {
    throttle.one_in_x > 0 && rng.gen_range(1..=throttle.one_in_x) == 1
}

/// Reply when there is nothing to hand out.
pub fn render_no_tasks(throttle: &ThrottleConfig) -> String {
    let mut out = String::new();
    if throttle.client_checkin_secs > 0 {
        let _ = writeln!(out, "timeBetweenServerCheckins: {}", throttle.client_checkin_secs);
    }
    out.push_str("No tasks\n");
    out
}

/// Render a task offer, followed by the finalized (waste,perms) pairs.
pub fn render_offer(offer: &TaskOffer, throttle: &ThrottleConfig) -> String {
    let task = &offer.task;
    let mut out = format!(
        "Task id: {}\nAccess code: {}\nn: {}\nw: {}\nstr: {}\npte: {}\npro: {}\nbranchOrder: {}\n",
        task.id,
        task.access,
        task.n,
        task.waste,
        task.prefix,
        task.perm_to_exceed,
        task.prev_perm_ruled_out,
        task.branch_order
    );

    // Many idle workers: split early and move on faster
    if offer.idle_fraction > throttle.idle_fraction && throttle.max_time_in_subtree == 0 {
        let _ = write!(
            out,
            "timeBeforeSplit: {}\nmaxTimeInSubtree: {}\n",
            throttle.idle_time_before_split, throttle.idle_max_time_in_subtree
        );
    }
    if throttle.max_time_in_subtree > 0 {
        let _ = writeln!(out, "maxTimeInSubtree: {}", throttle.max_time_in_subtree);
    }
    if throttle.client_checkin_secs > 0 {
        let _ = writeln!(out, "timeBetweenServerCheckins: {}", throttle.client_checkin_secs);
    }
    for (waste, perms) in &offer.finalized {
        let _ = writeln!(out, "({},{})", waste, perms);
    }
    out
}
