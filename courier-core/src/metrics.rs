#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! delivery control plane statistics, exposed by the external api
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};

lazy_static! {
    /// When the client started
    pub static ref START_TIME: Instant = Instant::now();
    /// client uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "client uptime (seconds)").unwrap();

    // publish metrics

    /// publish calls accepted, by execution mode
    pub static ref PUBLISH_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "publish_requests",
        "count of publish calls accepted by the dispatcher",
        &["mode"]
    )
    .unwrap();
    /// publish calls rejected before any send
    pub static ref PUBLISH_REJECTED: IntCounter = register_int_counter!(
        "publish_rejected",
        "count of publish calls rejected for invalid arguments"
    )
    .unwrap();
    /// publishes handed to the transport successfully
    pub static ref PUBLISH_SENT: IntCounter = register_int_counter!(
        "publish_sent",
        "count of publishes accepted by the transport"
    )
    .unwrap();
    /// publishes abandoned because the retry loop was interrupted
    pub static ref PUBLISH_ABANDONED: IntCounter = register_int_counter!(
        "publish_abandoned",
        "count of publishes abandoned on shutdown"
    )
    .unwrap();

    // retry metrics

    /// failed attempts that were followed by a backoff
    pub static ref RETRY_ATTEMPTS: IntCounter = register_int_counter!(
        "retry_attempts",
        "count of failed attempts retried after backoff"
    )
    .unwrap();

    // pool metrics

    /// jobs executed on the submitting task because the queue was full
    pub static ref POOL_CALLER_RUNS: IntCounterVec = register_int_counter_vec!(
        "pool_caller_runs",
        "count of jobs run by the caller because the pool queue was saturated",
        &["pool"]
    )
    .unwrap();
    /// jobs that panicked inside a pool
    pub static ref POOL_JOB_PANICS: IntCounterVec = register_int_counter_vec!(
        "pool_job_panics",
        "count of pool jobs that panicked",
        &["pool"]
    )
    .unwrap();
    /// jobs waiting in a pool queue
    pub static ref POOL_QUEUED: IntGaugeVec = register_int_gauge_vec!(
        "pool_queued",
        "count of jobs currently queued in a pool",
        &["pool"]
    )
    .unwrap();

    // scheduler metrics

    /// scheduled task failures, errors and panics
    pub static ref SCHEDULED_TASK_ERRORS: IntCounterVec = register_int_counter_vec!(
        "scheduled_task_errors",
        "count of scheduled task runs that failed",
        &["task"]
    )
    .unwrap();

    // recovery metrics

    /// unseen recovery runs that queried the broker
    pub static ref RECOVERY_RUNS: IntCounter = register_int_counter!(
        "recovery_runs",
        "count of unseen recovery runs that queried the broker"
    )
    .unwrap();
    /// recovery runs skipped because a previous run held the slot
    pub static ref RECOVERY_SKIPPED: IntCounter = register_int_counter!(
        "recovery_skipped",
        "count of unseen recovery runs skipped while a previous run was in flight"
    )
    .unwrap();
    /// recovery runs whose query failed or was rejected
    pub static ref RECOVERY_FAILED: IntCounter = register_int_counter!(
        "recovery_failed",
        "count of unseen recovery runs with a failed or rejected query"
    )
    .unwrap();
    /// recovered messages handed to a listener
    pub static ref RECOVERY_MESSAGES: IntCounter = register_int_counter!(
        "recovery_messages",
        "count of recovered messages dispatched to listeners"
    )
    .unwrap();

    // listener metrics

    /// messages whose handler failed
    pub static ref HANDLER_FAILURES: IntCounter = register_int_counter!(
        "handler_failures",
        "count of messages whose listener failed"
    )
    .unwrap();
    /// seen acknowledgements sent to the broker
    pub static ref SEEN_ACKS: IntCounter = register_int_counter!(
        "seen_acks",
        "count of seen acknowledgements sent to the broker"
    )
    .unwrap();
    /// seen acknowledgements that failed
    pub static ref SEEN_ACK_FAILURES: IntCounter = register_int_counter!(
        "seen_ack_failures",
        "count of seen acknowledgements that failed"
    )
    .unwrap();
    /// live subscriptions (re)established
    pub static ref SUBSCRIPTIONS: IntCounter = register_int_counter!(
        "subscriptions",
        "count of live subscriptions established"
    )
    .unwrap();

    // connection metrics

    /// state notifications received, by state
    pub static ref STATE_NOTIFICATIONS: IntCounterVec = register_int_counter_vec!(
        "state_notifications",
        "count of transport state notifications",
        &["state"]
    )
    .unwrap();
    /// connection gauge, 1 connected, 0 otherwise
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        "connection_state",
        "current transport connection state (1=connected, 0=disconnected/unknown)"
    )
    .unwrap();
    /// state transition side effects that failed, by hook
    pub static ref HOOK_FAILURES: IntCounterVec = register_int_counter_vec!(
        "hook_failures",
        "count of failed state transition side effects",
        &["hook"]
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{POOL_CALLER_RUNS, RECOVERY_SKIPPED, STATE_NOTIFICATIONS};

    #[test]
    fn counters_are_registered_and_exposed() {
        POOL_CALLER_RUNS.with_label_values(&["publish"]).inc();
        STATE_NOTIFICATIONS.with_label_values(&["connected"]).inc();
        RECOVERY_SKIPPED.inc();

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        for name in ["pool_caller_runs", "state_notifications", "recovery_skipped"] {
            assert!(names.contains(name), "registered metric families: {names:?}");
        }
    }
}
