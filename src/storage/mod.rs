//! SQLite run history -- schema, pool, and the history report sink.

pub mod schema;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, types::Type, Row};
use tracing::{debug, error};
use uuid::Uuid;

use crate::report::{PassMode, ReportSink, RunReport, RunResult};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("Failed to open history database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persists every finished pass, one row per pass plus one per target.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    /// Write a report. Recording the same pass twice is a no-op.
    pub fn record(&self, report: &RunReport) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO passes
                (pass_id, mode, started_at, duration_seconds, success_count, failure_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.pass_id.to_string(),
                report.mode.to_string(),
                report.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                report.duration_seconds,
                report.success_count as i64,
                report.failure_count as i64,
            ],
        )?;

        if inserted > 0 {
            let mut stmt = tx.prepare(
                "INSERT INTO run_results
                    (pass_id, position, target_id, display_name, success, message, error,
                     session_reused, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, r) in report.results.iter().enumerate() {
                stmt.execute(params![
                    report.pass_id.to_string(),
                    position as i64,
                    r.target_id,
                    r.display_name,
                    r.success,
                    r.message,
                    r.error,
                    r.session_reused,
                    r.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ])?;
            }
        }

        tx.commit().context("Failed to commit pass history")?;
        Ok(())
    }

    /// Most recent passes first, each with its results in target order.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunReport>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT pass_id, mode, started_at, duration_seconds
             FROM passes ORDER BY started_at DESC, id DESC LIMIT ?1",
        )?;
        let headers = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    parse_uuid(row, 0)?,
                    parse_mode(row, 1)?,
                    parse_time(row, 2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut results_stmt = conn.prepare(
            "SELECT target_id, display_name, success, message, error, session_reused, finished_at
             FROM run_results WHERE pass_id = ?1 ORDER BY position",
        )?;

        let mut reports = Vec::with_capacity(headers.len());
        for (pass_id, mode, started_at, duration) in headers {
            let results = results_stmt
                .query_map(params![pass_id.to_string()], |row| {
                    Ok(RunResult {
                        target_id: row.get(0)?,
                        display_name: row.get(1)?,
                        success: row.get(2)?,
                        message: row.get(3)?,
                        error: row.get(4)?,
                        session_reused: row.get(5)?,
                        timestamp: parse_time(row, 6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            reports.push(RunReport::new(pass_id, mode, started_at, results, duration));
        }
        Ok(reports)
    }
}

#[async_trait]
impl ReportSink for HistoryStore {
    async fn publish(&self, report: &RunReport) {
        let store = self.clone();
        let report = report.clone();
        let pass_id = report.pass_id;
        let outcome = tokio::task::spawn_blocking(move || store.record(&report)).await;
        match outcome {
            Ok(Ok(())) => debug!(%pass_id, "pass recorded"),
            Ok(Err(e)) => error!(%pass_id, error = %e, "failed to record pass history"),
            Err(e) => error!(%pass_id, error = %e, "history writer task failed"),
        }
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parse_mode(row: &Row<'_>, idx: usize) -> rusqlite::Result<PassMode> {
    let text: String = row.get(idx)?;
    PassMode::from_str(&text).map_err(|e| conversion_error(idx, e))
}
