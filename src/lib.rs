//! autocheckin -- session-aware scheduled check-ins for third-party sites.
//!
//! This crate provides the core library: the per-target runner state
//! machine, the session cache, the orchestrator that runs targets serially
//! or concurrently, and the scheduler that fires passes on a cron calendar.

pub mod api;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::credentials::EnvCredentials;
use crate::driver::http::HttpLauncher;
use crate::driver::DriverRegistry;
use crate::orchestrator::Orchestrator;
use crate::report::{LogSink, ReportSink, RunReport};
use crate::runner::TargetRunner;
use crate::scheduler::{RetryPolicy, ScheduleSpec, Scheduler};
use crate::session::SessionStore;
use crate::storage::HistoryStore;

/// Orchestrator for the configured targets, with the HTTP launcher, the
/// built-in drivers, and credentials from the environment.
pub fn build_orchestrator(cfg: &AppConfig) -> Orchestrator {
    let store = SessionStore::from_config(&cfg.session);
    let runner = TargetRunner::new(store, Arc::new(HttpLauncher::default()));
    Orchestrator::new(
        &cfg.targets,
        &DriverRegistry::builtin(),
        &EnvCredentials,
        runner,
        &cfg.orchestrator,
    )
}

/// Log sink plus the history database when enabled. A history database that
/// cannot be opened is logged and skipped.
pub fn build_sinks(cfg: &AppConfig) -> Vec<Arc<dyn ReportSink>> {
    let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(LogSink)];
    if cfg.history.enabled {
        match HistoryStore::open(&cfg.history.db_path) {
            Ok(store) => sinks.push(Arc::new(store)),
            Err(e) => warn!(error = %e, path = %cfg.history.db_path.display(), "run history disabled"),
        }
    }
    sinks
}

/// Hand a finished report to every sink.
pub async fn publish(sinks: &[Arc<dyn ReportSink>], report: &RunReport) {
    for sink in sinks {
        sink.publish(report).await;
    }
}

/// Start the daemon: register `schedule`, serve the control API, and run
/// until SIGINT/SIGTERM. On shutdown every schedule is stopped and passes
/// already in flight are allowed to finish.
pub async fn serve(cfg: &AppConfig, schedule: ScheduleSpec) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(cfg));
    let scheduler = Scheduler::new(
        orchestrator,
        build_sinks(cfg),
        RetryPolicy::from_config(&cfg.schedule),
    );

    scheduler
        .add_schedule(&schedule.id, &schedule.cron, schedule.options.clone())
        .with_context(|| format!("Failed to register schedule '{}'", schedule.id))?;

    if cfg.api.enabled {
        let addr: SocketAddr = cfg
            .api
            .bind
            .parse()
            .with_context(|| format!("Invalid api.bind address '{}'", cfg.api.bind))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control api on {addr}"))?;
        let app = api::router(api::state::AppState::new(scheduler.clone()));

        info!(%addr, "autocheckin listening");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(stop_schedules_on(scheduler.clone(), shutdown_signal()))
            .await
        {
            error!(error = %e, "control api failed");
        }
    } else {
        info!("control api disabled");
        stop_schedules_on(scheduler.clone(), shutdown_signal()).await;
    }

    scheduler.shutdown().await;
    Ok(())
}

/// Wait for `signal`, then stop every schedule so no new pass starts while
/// open connections drain.
async fn stop_schedules_on<F>(scheduler: Scheduler, signal: F)
where
    F: std::future::Future<Output = ()>,
{
    signal.await;
    let stopped = scheduler.stop(None);
    info!(count = stopped.len(), "schedules stopped for shutdown");
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::scheduler::ScheduleOptions;
    use crate::test_utils::{scripted_orchestrator, ScriptedDriver};

    #[tokio::test]
    async fn test_schedules_stop_as_soon_as_signal_fires() {
        let dir = tempfile::tempdir().unwrap();
        let settings = OrchestratorConfig {
            inter_target_delay_ms: 0,
            max_concurrency: 0,
        };
        let orch = scripted_orchestrator(dir.path(), vec![("a", ScriptedDriver::named("a"))], &settings);
        let scheduler = Scheduler::new(Arc::new(orch), Vec::new(), RetryPolicy::disabled());
        scheduler
            .add_schedule("daily", "0 8 * * *", ScheduleOptions::default())
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(stop_schedules_on(scheduler.clone(), async move {
            let _ = rx.await;
        }));
        tokio::task::yield_now().await;
        assert!(scheduler.status().running);

        tx.send(()).unwrap();
        waiter.await.unwrap();

        assert!(!scheduler.status().running);
        assert!(scheduler.status().active.is_empty());
        scheduler.shutdown().await;
    }
}
