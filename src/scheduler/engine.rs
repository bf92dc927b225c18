//! Scheduler instance: one timer task per active schedule.
//!
//! Each timer sleeps until its next firing instant and hands the pass to a
//! [`TaskTracker`]. Stopping a schedule aborts its timer only; a pass that
//! already started runs to completion, and [`Scheduler::shutdown`] waits
//! for those.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::{
    CronExpr, RetryPolicy, ScheduleEntry, ScheduleError, ScheduleInfo, ScheduleOptions,
    SchedulerStatus, UpcomingRun,
};
use crate::orchestrator::Orchestrator;
use crate::report::{ReportSink, RunReport};

/// What a firing needs, shared by every timer.
struct FireContext {
    orchestrator: Arc<Orchestrator>,
    sinks: Vec<Arc<dyn ReportSink>>,
    retry: RetryPolicy,
    tracker: TaskTracker,
}

struct Active {
    entry: Arc<ScheduleEntry>,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<FireContext>,
    entries: Arc<Mutex<BTreeMap<String, Active>>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        sinks: Vec<Arc<dyn ReportSink>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(FireContext {
                orchestrator,
                sinks,
                retry,
                tracker: TaskTracker::new(),
            }),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.ctx.orchestrator
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Active>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and register a schedule, then start its timer. Must be
    /// called from within a Tokio runtime.
    ///
    /// An invalid expression or an id that is already active is refused and
    /// leaves the registered set untouched.
    pub fn add_schedule(
        &self,
        id: &str,
        cron_expr: &str,
        options: ScheduleOptions,
    ) -> Result<(), ScheduleError> {
        if id.trim().is_empty() {
            return Err(ScheduleError::EmptyId);
        }
        let cron = CronExpr::parse(cron_expr)?;
        if cron.next_after(Utc::now(), options.timezone).is_none() {
            return Err(ScheduleError::InvalidCron {
                expr: cron_expr.to_string(),
                reason: "expression never fires".to_string(),
            });
        }

        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(ScheduleError::Duplicate(id.to_string()));
        }

        let entry = Arc::new(ScheduleEntry {
            id: id.to_string(),
            cron,
            options,
        });
        let timer = tokio::spawn(run_timer(Arc::clone(&self.ctx), Arc::clone(&entry)));
        info!(
            schedule = %id,
            cron = %entry.cron,
            parallel = entry.options.parallel,
            targets = ?entry.options.target_filter,
            timezone = %entry.options.timezone,
            "schedule registered"
        );
        entries.insert(id.to_string(), Active { entry, timer });
        Ok(())
    }

    /// Unregister one schedule, or all of them. Absent ids are ignored.
    /// Returns the ids that were stopped.
    pub fn stop(&self, id: Option<&str>) -> Vec<String> {
        let mut entries = self.entries();
        let removed: Vec<(String, Active)> = match id {
            Some(id) => entries.remove_entry(id).into_iter().collect(),
            None => std::mem::take(&mut *entries).into_iter().collect(),
        };
        drop(entries);

        let mut stopped = Vec::with_capacity(removed.len());
        for (id, active) in removed {
            active.timer.abort();
            info!(schedule = %id, "schedule stopped");
            stopped.push(id);
        }
        stopped
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let entries = self.entries();
        let schedules: Vec<ScheduleInfo> = entries
            .values()
            .map(|active| {
                let entry = &active.entry;
                ScheduleInfo {
                    id: entry.id.clone(),
                    cron: entry.cron.to_string(),
                    parallel: entry.options.parallel,
                    targets: entry.options.target_filter.clone(),
                    timezone: entry.options.timezone.to_string(),
                    next_fire: entry.cron.next_after(now, entry.options.timezone),
                }
            })
            .collect();

        SchedulerStatus {
            active: entries.keys().cloned().collect(),
            running: !entries.is_empty(),
            in_flight: self.ctx.tracker.len(),
            schedules,
        }
    }

    /// Every firing of every active schedule in the next `hours`, by time.
    pub fn preview(&self, hours: u64) -> Vec<UpcomingRun> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
        let mut upcoming: Vec<UpcomingRun> = self
            .entries()
            .values()
            .flat_map(|active| {
                let entry = Arc::clone(&active.entry);
                entry
                    .cron
                    .fires_between(now, end, entry.options.timezone)
                    .into_iter()
                    .map(move |at| UpcomingRun {
                        at,
                        schedule_id: entry.id.clone(),
                        parallel: entry.options.parallel,
                        targets: entry.options.target_filter.clone(),
                    })
            })
            .collect();
        upcoming.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.schedule_id.cmp(&b.schedule_id)));
        upcoming
    }

    /// Fire a registered schedule immediately and wait for the outcome,
    /// retries included. `None` if the id is not active or the pass panicked.
    pub async fn trigger(&self, id: &str) -> Option<RunReport> {
        let entry = self.entries().get(id).map(|a| Arc::clone(&a.entry))?;
        let ctx = Arc::clone(&self.ctx);
        let pass = self.ctx.tracker.spawn(async move { fire(&ctx, &entry).await });
        pass.await.ok().flatten()
    }

    /// Manual pass outside any schedule. Published like a scheduled pass
    /// and tracked for shutdown, but never retried.
    pub async fn run_now(&self, parallel: bool) -> Option<RunReport> {
        let ctx = Arc::clone(&self.ctx);
        let pass = self.ctx.tracker.spawn(async move {
            let report = ctx.orchestrator.run_all(parallel).await;
            for sink in &ctx.sinks {
                sink.publish(&report).await;
            }
            report
        });
        match pass.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "manual pass failed");
                None
            }
        }
    }

    /// Stop every schedule, then wait for in-flight passes to finish.
    pub async fn shutdown(&self) {
        let stopped = self.stop(None);
        let pending = self.ctx.tracker.len();
        info!(stopped = stopped.len(), pending, "scheduler shutting down");
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        info!("scheduler stopped");
    }
}

async fn run_timer(ctx: Arc<FireContext>, entry: Arc<ScheduleEntry>) {
    let mut last_fired: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        // Never fire the same instant twice, even if the clock steps back.
        let from = last_fired.map_or(now, |last| last.max(now));
        let Some(next) = entry.cron.next_after(from, entry.options.timezone) else {
            warn!(schedule = %entry.id, "no further firing instants; timer exiting");
            return;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        last_fired = Some(next);

        info!(schedule = %entry.id, instant = %next.to_rfc3339(), "schedule firing");
        let ctx_for_pass = Arc::clone(&ctx);
        let entry_for_pass = Arc::clone(&entry);
        ctx.tracker.spawn(async move {
            fire(&ctx_for_pass, &entry_for_pass).await;
        });
    }
}

/// Run one firing: the pass, then whole-pass retries while it has
/// failures. Every attempt is published. A panicking pass is logged and
/// ends the firing; the schedule stays registered.
async fn fire(ctx: &FireContext, entry: &ScheduleEntry) -> Option<RunReport> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let pass = AssertUnwindSafe(run_pass(&ctx.orchestrator, &entry.options))
            .catch_unwind()
            .await;
        let report = match pass {
            Ok(report) => report,
            Err(_) => {
                error!(schedule = %entry.id, attempt = attempts, "scheduled pass panicked");
                return None;
            }
        };

        for sink in &ctx.sinks {
            sink.publish(&report).await;
        }

        if report.all_succeeded() || !ctx.retry.allows_another(attempts) {
            if !report.all_succeeded() {
                warn!(
                    schedule = %entry.id,
                    attempts,
                    failed = report.failure_count,
                    "scheduled pass finished with failures"
                );
            }
            return Some(report);
        }

        warn!(
            schedule = %entry.id,
            attempt = attempts,
            failed = report.failure_count,
            retry_in_ms = ctx.retry.delay.as_millis() as u64,
            "scheduled pass had failures; retrying"
        );
        tokio::time::sleep(ctx.retry.delay).await;
    }
}

async fn run_pass(orchestrator: &Orchestrator, options: &ScheduleOptions) -> RunReport {
    if options.target_filter.is_empty() {
        orchestrator.run_all(options.parallel).await
    } else {
        orchestrator.run_filtered(&options.target_filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::test_utils::{scripted_orchestrator, CollectSink, Outcome, ScriptedDriver};

    fn scheduler_with(
        drivers: Vec<(&str, ScriptedDriver)>,
        retry: RetryPolicy,
    ) -> (tempfile::TempDir, Scheduler, Arc<CollectSink>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = OrchestratorConfig {
            inter_target_delay_ms: 0,
            max_concurrency: 0,
        };
        let orch = scripted_orchestrator(dir.path(), drivers, &settings);
        let sink = Arc::new(CollectSink::default());
        let scheduler = Scheduler::new(Arc::new(orch), vec![sink.clone() as Arc<dyn ReportSink>], retry);
        (dir, scheduler, sink)
    }

    fn utc() -> ScheduleOptions {
        ScheduleOptions {
            timezone: crate::scheduler::ScheduleTz::Utc,
            ..ScheduleOptions::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_cron_not_registered() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        let err = scheduler.add_schedule("bad", "99 8 * * *", utc()).unwrap_err();
        assert!(err.to_string().contains("99 8 * * *"));
        let status = scheduler.status();
        assert!(status.active.is_empty());
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_duplicate_id_refused_until_stopped() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        scheduler.add_schedule("daily", "0 8 * * *", utc()).unwrap();
        assert_eq!(
            scheduler.add_schedule("daily", "0 9 * * *", utc()),
            Err(ScheduleError::Duplicate("daily".to_string()))
        );
        assert_eq!(scheduler.status().schedules[0].cron, "0 8 * * *");

        scheduler.stop(Some("daily"));
        scheduler.add_schedule("daily", "0 9 * * *", utc()).unwrap();
        assert_eq!(scheduler.status().schedules[0].cron, "0 9 * * *");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        scheduler.add_schedule("a", "0 8 * * *", utc()).unwrap();
        scheduler.add_schedule("b", "0 20 * * *", utc()).unwrap();

        assert!(scheduler.stop(Some("missing")).is_empty());
        assert_eq!(scheduler.stop(Some("a")), vec!["a"]);
        assert!(scheduler.stop(Some("a")).is_empty());
        assert_eq!(scheduler.status().active, vec!["b"]);

        assert_eq!(scheduler.stop(None), vec!["b"]);
        assert!(scheduler.stop(None).is_empty());
        assert!(!scheduler.status().running);
    }

    #[tokio::test]
    async fn test_status_reports_next_fire() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        scheduler.add_schedule("daily", "0 8 * * *", utc()).unwrap();
        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.active, vec!["daily"]);
        let next = status.schedules[0].next_fire.unwrap();
        assert!(next > Utc::now());
        assert_eq!(next.format("%H:%M").to_string(), "08:00");
    }

    #[tokio::test]
    async fn test_preview_merges_schedules() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        scheduler.add_schedule("hourly", "0 * * * *", utc()).unwrap();
        scheduler.add_schedule("daily", "30 8 * * *", utc()).unwrap();

        let upcoming = scheduler.preview(24);
        let hourly = upcoming.iter().filter(|u| u.schedule_id == "hourly").count();
        let daily = upcoming.iter().filter(|u| u.schedule_id == "daily").count();
        assert!((23..=24).contains(&hourly));
        assert_eq!(daily, 1);
        assert!(upcoming.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_retried_whole() {
        let flaky = ScriptedDriver {
            check_in: Outcome::No,
            ..ScriptedDriver::named("b")
        };
        let calls = Arc::clone(&flaky.calls);
        let good = ScriptedDriver::named("a");
        let good_calls = Arc::clone(&good.calls);
        let retry = RetryPolicy {
            enabled: true,
            max_retries: 2,
            delay: Duration::from_secs(60),
        };
        let (_dir, scheduler, sink) = scheduler_with(vec![("a", good), ("b", flaky)], retry);
        scheduler.add_schedule("daily", "0 8 * * *", utc()).unwrap();

        let report = scheduler.trigger("daily").await.unwrap();

        assert_eq!(report.failure_count, 1);
        assert_eq!(calls.check_ins(), 3);
        assert_eq!(good_calls.check_ins(), 3);
        assert_eq!(sink.reports().len(), 3);
    }

    #[tokio::test]
    async fn test_successful_pass_not_retried() {
        let driver = ScriptedDriver::named("a");
        let calls = Arc::clone(&driver.calls);
        let (_dir, scheduler, sink) = scheduler_with(vec![("a", driver)], RetryPolicy::default());
        scheduler.add_schedule("daily", "0 8 * * *", utc()).unwrap();

        let report = scheduler.trigger("daily").await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(calls.check_ins(), 1);
        assert_eq!(sink.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_schedule_runs_subset() {
        let (_dir, scheduler, _) = scheduler_with(
            vec![("a", ScriptedDriver::named("a")), ("b", ScriptedDriver::named("b"))],
            RetryPolicy::disabled(),
        );
        let options = ScheduleOptions {
            target_filter: vec!["b".to_string()],
            ..utc()
        };
        scheduler.add_schedule("only-b", "0 8 * * *", options).unwrap();

        let report = scheduler.trigger("only-b").await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].target_id, "b");
    }

    #[tokio::test]
    async fn test_trigger_unknown_schedule() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        assert!(scheduler.trigger("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_clears_schedules() {
        let (_dir, scheduler, _) = scheduler_with(Vec::new(), RetryPolicy::disabled());
        scheduler.add_schedule("daily", "0 8 * * *", utc()).unwrap();
        scheduler.shutdown().await;
        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test]
    async fn test_run_now_publishes_without_retry() {
        let driver = ScriptedDriver {
            check_in: Outcome::No,
            ..ScriptedDriver::named("a")
        };
        let calls = Arc::clone(&driver.calls);
        let (_dir, scheduler, sink) = scheduler_with(vec![("a", driver)], RetryPolicy::default());

        let report = scheduler.run_now(false).await.unwrap();

        assert_eq!(report.failure_count, 1);
        assert_eq!(calls.check_ins(), 1);
        assert_eq!(sink.reports().len(), 1);
    }
}
