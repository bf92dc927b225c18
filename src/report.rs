//! Run results, pass reports and the reporting collaborator seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TargetConfig;

/// Outcome of one target in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub target_id: String,
    pub display_name: String,
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    /// The run started from a cached session instead of an empty one.
    #[serde(default)]
    pub session_reused: bool,
    pub timestamp: DateTime<Utc>,
}

impl RunResult {
    pub fn success(target: &TargetConfig, message: &str, session_reused: bool) -> Self {
        Self {
            target_id: target.id.clone(),
            display_name: target.label().to_string(),
            success: true,
            message: message.to_string(),
            error: None,
            session_reused,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(target: &TargetConfig, message: &str, error: Option<String>) -> Self {
        Self {
            target_id: target.id.clone(),
            display_name: target.label().to_string(),
            success: false,
            message: message.to_string(),
            error,
            session_reused: false,
            timestamp: Utc::now(),
        }
    }

    /// Result for an id that is not among the enabled targets.
    pub fn not_found(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            display_name: target_id.to_string(),
            success: false,
            message: "target not found or disabled".to_string(),
            error: None,
            session_reused: false,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_session_reused(mut self, reused: bool) -> Self {
        self.session_reused = reused;
        self
    }
}

/// What kind of pass produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    Serial,
    Parallel,
    Single,
    Filtered,
}

impl std::str::FromStr for PassMode {
    type Err = UnknownPassMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(PassMode::Serial),
            "parallel" => Ok(PassMode::Parallel),
            "single" => Ok(PassMode::Single),
            "filtered" => Ok(PassMode::Filtered),
            other => Err(UnknownPassMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown pass mode '{0}'")]
pub struct UnknownPassMode(pub String);

impl std::fmt::Display for PassMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassMode::Serial => write!(f, "serial"),
            PassMode::Parallel => write!(f, "parallel"),
            PassMode::Single => write!(f, "single"),
            PassMode::Filtered => write!(f, "filtered"),
        }
    }
}

/// Aggregate of one orchestration pass. Results keep configured target
/// order regardless of completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pass_id: Uuid,
    pub mode: PassMode,
    pub started_at: DateTime<Utc>,
    pub results: Vec<RunResult>,
    pub duration_seconds: f64,
    pub success_count: usize,
    pub failure_count: usize,
}

impl RunReport {
    pub fn new(
        pass_id: Uuid,
        mode: PassMode,
        started_at: DateTime<Utc>,
        results: Vec<RunResult>,
        duration_seconds: f64,
    ) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        Self {
            pass_id,
            mode,
            started_at,
            results,
            duration_seconds,
            success_count,
            failure_count,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    pub fn result_for(&self, target_id: &str) -> Option<&RunResult> {
        self.results.iter().find(|r| r.target_id == target_id)
    }
}

/// Receives every finished pass (history database, logs, notifications).
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Publish a report. Sinks handle their own failures.
    async fn publish(&self, report: &RunReport);
}

/// Sink that writes a one-line summary per target to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn publish(&self, report: &RunReport) {
        for r in &report.results {
            if r.success {
                info!(pass_id = %report.pass_id, target = %r.target_id, message = %r.message, "check-in ok");
            } else {
                warn!(
                    pass_id = %report.pass_id,
                    target = %r.target_id,
                    message = %r.message,
                    error = r.error.as_deref().unwrap_or(""),
                    "check-in failed"
                );
            }
        }
        info!(
            pass_id = %report.pass_id,
            mode = %report.mode,
            succeeded = report.success_count,
            failed = report.failure_count,
            duration_s = format!("{:.1}", report.duration_seconds),
            "pass finished"
        );
    }
}

/// Human-readable table for the terminal.
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:<20} | {:<6} | Message\n",
        "Target", "Status"
    ));
    out.push_str(&format!("{:-<20}-|-{:-<6}-|-{:-<40}\n", "", "", ""));
    for r in &report.results {
        let status = if r.success { "OK" } else { "FAIL" };
        out.push_str(&format!("{:<20} | {:<6} | {}", r.display_name, status, r.message));
        if let Some(err) = &r.error {
            out.push_str(&format!(" ({err})"));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "\n{} succeeded, {} failed in {:.1}s ({} pass)\n",
        report.success_count, report.failure_count, report.duration_seconds, report.mode
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str) -> TargetConfig {
        TargetConfig::new(id, &id.to_uppercase())
    }

    #[test]
    fn test_counts_computed_from_results() {
        let results = vec![
            RunResult::success(&target("a"), "checked in", false),
            RunResult::failure(&target("b"), "login failed", None),
            RunResult::success(&target("c"), "checked in", true),
        ];
        let report = RunReport::new(Uuid::new_v4(), PassMode::Serial, Utc::now(), results, 1.5);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert!(!report.all_succeeded());
        assert!(report.result_for("c").unwrap().session_reused);
    }

    #[test]
    fn test_not_found_result() {
        let r = RunResult::not_found("ghost");
        assert!(!r.success);
        assert_eq!(r.message, "target not found or disabled");
    }

    #[test]
    fn test_format_report_lists_targets() {
        let results = vec![
            RunResult::success(&target("a"), "checked in", false),
            RunResult::failure(&target("b"), "check-in failed", Some("timeout".to_string())),
        ];
        let report = RunReport::new(Uuid::new_v4(), PassMode::Parallel, Utc::now(), results, 2.0);
        let text = format_report(&report);
        assert!(text.contains("A "));
        assert!(text.contains("FAIL"));
        assert!(text.contains("(timeout)"));
        assert!(text.contains("1 succeeded, 1 failed in 2.0s (parallel pass)"));
    }

    #[test]
    fn test_empty_report_succeeds() {
        let report = RunReport::new(Uuid::new_v4(), PassMode::Serial, Utc::now(), Vec::new(), 0.0);
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_log_sink_accepts_mixed_report() {
        let results = vec![
            RunResult::success(&target("a"), "checked in", false),
            RunResult::failure(&target("b"), "login failed", None),
        ];
        let report = RunReport::new(Uuid::new_v4(), PassMode::Serial, Utc::now(), results, 0.5);
        tokio_test::block_on(LogSink.publish(&report));
    }

    #[test]
    fn test_pass_mode_parses_display_form() {
        for mode in [PassMode::Serial, PassMode::Parallel, PassMode::Single, PassMode::Filtered] {
            assert_eq!(mode.to_string().parse::<PassMode>().unwrap(), mode);
        }
        assert!("sideways".parse::<PassMode>().is_err());
    }
}
