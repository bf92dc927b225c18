//! Calendar-based triggering of orchestration passes.

pub mod cron;
pub mod engine;
pub mod profiles;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::cron::{CronExpr, ScheduleTz};
pub use self::engine::Scheduler;
pub use self::profiles::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("schedule '{0}' is already registered; stop it first")]
    Duplicate(String),

    #[error("schedule id must not be empty")]
    EmptyId,

    #[error("invalid timezone '{0}' (expected local, utc, or an offset like +08:00)")]
    InvalidTimezone(String),
}

/// How a schedule's passes are run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub parallel: bool,
    /// Target ids run in this order; empty means every enabled target.
    pub target_filter: Vec<String>,
    pub timezone: ScheduleTz,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            target_filter: Vec::new(),
            timezone: ScheduleTz::Local,
        }
    }
}

/// A registration request: id, unvalidated expression, options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub id: String,
    pub cron: String,
    pub options: ScheduleOptions,
}

/// An active schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron: CronExpr,
    pub options: ScheduleOptions,
}

/// Introspection view of one active schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub id: String,
    pub cron: String,
    pub parallel: bool,
    pub targets: Vec<String>,
    pub timezone: String,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Active schedule ids, sorted.
    pub active: Vec<String>,
    /// At least one schedule is active.
    pub running: bool,
    /// Passes started by a schedule that have not finished yet.
    pub in_flight: usize,
    pub schedules: Vec<ScheduleInfo>,
}

/// One upcoming firing from [`Scheduler::preview`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub schedule_id: String,
    pub parallel: bool,
    pub targets: Vec<String>,
}
