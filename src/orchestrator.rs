//! Runs targets serially or concurrently and aggregates a [`RunReport`].
//!
//! Results are collected positionally, so a report always lists targets in
//! configured order whatever order the runs finish in. Parallel passes are
//! joined in place; no run outlives the pass that started it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, OrchestratorConfig, TargetConfig};
use crate::credentials::{CredentialSource, Credentials};
use crate::driver::{DriverRegistry, TargetDriver};
use crate::report::{PassMode, RunReport, RunResult};
use crate::runner::TargetRunner;
use crate::session::SessionStore;

/// An enabled target with its driver and credentials resolved at startup.
struct Prepared {
    config: TargetConfig,
    resolved: Result<(Arc<dyn TargetDriver>, Credentials), ConfigError>,
}

/// Startup readiness of one configured target.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TargetStatus {
    pub id: String,
    pub display_name: String,
    pub driver: String,
    pub enabled: bool,
    /// Configuration problem that keeps the target from running.
    pub problem: Option<String>,
}

pub struct Orchestrator {
    targets: Vec<Prepared>,
    disabled: Vec<TargetConfig>,
    runner: TargetRunner,
    inter_target_delay: Duration,
    max_concurrency: usize,
}

impl Orchestrator {
    /// Resolve drivers and credentials for every enabled target. A target
    /// whose configuration is broken stays in the plan and fails on each
    /// pass with its [`ConfigError`]; the others are unaffected.
    pub fn new(
        targets: &[TargetConfig],
        registry: &DriverRegistry,
        credentials: &dyn CredentialSource,
        runner: TargetRunner,
        settings: &OrchestratorConfig,
    ) -> Self {
        let mut prepared = Vec::new();
        let mut disabled = Vec::new();

        for target in targets {
            if !target.enabled {
                disabled.push(target.clone());
                continue;
            }
            let resolved = registry.resolve(target).and_then(|driver| {
                credentials
                    .credentials_for(target)
                    .map(|creds| (driver, creds))
            });
            if let Err(e) = &resolved {
                warn!(target = %target.id, error = %e, "target misconfigured");
            }
            prepared.push(Prepared {
                config: target.clone(),
                resolved,
            });
        }

        info!(
            enabled = prepared.len(),
            disabled = disabled.len(),
            "orchestrator ready"
        );

        Self {
            targets: prepared,
            disabled,
            runner,
            inter_target_delay: Duration::from_millis(settings.inter_target_delay_ms),
            max_concurrency: settings.max_concurrency,
        }
    }

    pub fn store(&self) -> &SessionStore {
        self.runner.store()
    }

    /// Every configured target (enabled first, in order) with its readiness.
    pub fn target_statuses(&self) -> Vec<TargetStatus> {
        let enabled = self.targets.iter().map(|t| TargetStatus {
            id: t.config.id.clone(),
            display_name: t.config.label().to_string(),
            driver: t.config.driver.clone(),
            enabled: true,
            problem: t.resolved.as_ref().err().map(|e| e.to_string()),
        });
        let disabled = self.disabled.iter().map(|t| TargetStatus {
            id: t.id.clone(),
            display_name: t.label().to_string(),
            driver: t.driver.clone(),
            enabled: false,
            problem: None,
        });
        enabled.chain(disabled).collect()
    }

    /// Run every enabled target, after purging expired sessions.
    pub async fn run_all(&self, parallel: bool) -> RunReport {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%pass_id, parallel, targets = self.targets.len(), "pass starting");

        self.store().purge_expired().await;

        let plan: Vec<&Prepared> = self.targets.iter().collect();
        let (mode, results) = if parallel {
            (PassMode::Parallel, self.run_concurrently(&plan).await)
        } else {
            (PassMode::Serial, self.run_serially(&plan).await)
        };

        RunReport::new(
            pass_id,
            mode,
            started_at,
            results,
            clock.elapsed().as_secs_f64(),
        )
    }

    /// Run one enabled target. Unknown or disabled ids produce a failed
    /// single-element report.
    pub async fn run_single(&self, target_id: &str) -> RunReport {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = match self.find(target_id) {
            Some(prepared) => self.run_target(prepared).await,
            None => {
                warn!(target = %target_id, "target not found or disabled");
                RunResult::not_found(target_id)
            }
        };

        RunReport::new(
            pass_id,
            PassMode::Single,
            started_at,
            vec![result],
            clock.elapsed().as_secs_f64(),
        )
    }

    /// Run the listed ids one at a time in the given order, with the serial
    /// inter-target delay, as one pass.
    pub async fn run_filtered(&self, target_ids: &[String]) -> RunReport {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%pass_id, targets = ?target_ids, "filtered pass starting");

        self.store().purge_expired().await;

        let mut results = Vec::with_capacity(target_ids.len());
        for (i, id) in target_ids.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            let result = match self.find(id) {
                Some(prepared) => self.run_target(prepared).await,
                None => {
                    warn!(target = %id, "target not found or disabled");
                    RunResult::not_found(id)
                }
            };
            results.push(result);
        }

        RunReport::new(
            pass_id,
            PassMode::Filtered,
            started_at,
            results,
            clock.elapsed().as_secs_f64(),
        )
    }

    fn find(&self, target_id: &str) -> Option<&Prepared> {
        self.targets.iter().find(|t| t.config.id == target_id)
    }

    async fn run_serially(&self, plan: &[&Prepared]) -> Vec<RunResult> {
        let mut results = Vec::with_capacity(plan.len());
        for (i, prepared) in plan.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            results.push(self.run_target(prepared).await);
        }
        results
    }

    async fn run_concurrently(&self, plan: &[&Prepared]) -> Vec<RunResult> {
        let runs: Vec<BoxFuture<'_, RunResult>> = plan
            .iter()
            .map(|prepared| self.run_target(prepared).boxed())
            .collect();
        if self.max_concurrency == 0 {
            futures::future::join_all(runs).await
        } else {
            // `buffered` yields in input order, not completion order.
            stream::iter(runs)
                .buffered(self.max_concurrency)
                .collect()
                .await
        }
    }

    async fn run_target(&self, prepared: &Prepared) -> RunResult {
        let target = &prepared.config;
        match &prepared.resolved {
            Ok((driver, credentials)) => {
                info!(target = %target.id, "run starting");
                self.runner.run(target, driver.as_ref(), credentials).await
            }
            Err(e) => RunResult::failure(target, "configuration error", Some(e.to_string())),
        }
    }

    async fn pause(&self) {
        if !self.inter_target_delay.is_zero() {
            tokio::time::sleep(self.inter_target_delay).await;
        }
    }
}
