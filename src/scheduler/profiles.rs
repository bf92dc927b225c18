//! Default schedule and retry settings, and their overrides from config.

use std::time::Duration;

use super::{ScheduleError, ScheduleOptions, ScheduleSpec, ScheduleTz};
use crate::config::ScheduleConfig;

/// Id of the schedule registered by `start-schedule`.
pub const DEFAULT_SCHEDULE_ID: &str = "daily-checkin";

/// Whole-pass retry for scheduled firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Extra passes after the first one fails.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn from_config(cfg: &ScheduleConfig) -> Self {
        Self {
            enabled: cfg.retry_on_failure,
            max_retries: cfg.max_retries,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }

    /// Retries left after `attempts` passes have run.
    pub fn allows_another(&self, attempts: u32) -> bool {
        self.enabled && attempts <= self.max_retries
    }
}

impl Default for RetryPolicy {
    /// Three retries, five minutes apart.
    fn default() -> Self {
        Self::from_config(&ScheduleConfig::default())
    }
}

/// Daily 08:00 local, serial, all targets.
pub fn default_schedule() -> ScheduleSpec {
    let cfg = ScheduleConfig::default();
    ScheduleSpec {
        id: DEFAULT_SCHEDULE_ID.to_string(),
        cron: cfg.cron,
        options: ScheduleOptions::default(),
    }
}

/// Schedule described by the `[schedule]` config section.
pub fn from_config(cfg: &ScheduleConfig) -> Result<ScheduleSpec, ScheduleError> {
    Ok(ScheduleSpec {
        id: DEFAULT_SCHEDULE_ID.to_string(),
        cron: cfg.cron.clone(),
        options: ScheduleOptions {
            parallel: cfg.parallel,
            target_filter: cfg.targets.clone(),
            timezone: ScheduleTz::parse(&cfg.timezone)?,
        },
    })
}
