//! minder-scheduler: decides when the assistant is invoked on its own.
//!
//! Three trigger families — one-shot timestamps, 5-field cron expressions,
//! fixed intervals — plus a jittered half-hourly heartbeat. A minute-tick
//! engine discovers due jobs and hands triggers to a caller-supplied
//! handler; schedule state lives in small JSON files owned exclusively by
//! this crate.

pub mod cron;
pub mod engine;
pub mod heartbeat;
pub mod store;

pub use cron::{next_cron, CronError, CronMatcher};
pub use engine::{BusyFn, Engine, TriggerHandler};
pub use heartbeat::{
    Heartbeat, HeartbeatDecision, HeartbeatError, HeartbeatState, HeartbeatStatus,
    HEARTBEAT_JOB_ID,
};
pub use store::{JobStore, ScheduleError, StoreError};

pub use minder_types::{Job, JobKind, JobMode, Trigger};
