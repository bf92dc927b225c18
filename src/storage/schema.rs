//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS passes (
            id INTEGER PRIMARY KEY,
            pass_id TEXT NOT NULL UNIQUE,
            mode TEXT NOT NULL,
            started_at TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            success_count INTEGER NOT NULL,
            failure_count INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_results (
            id INTEGER PRIMARY KEY,
            pass_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            target_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            success INTEGER NOT NULL,
            message TEXT NOT NULL,
            error TEXT,
            session_reused INTEGER NOT NULL DEFAULT 0,
            finished_at TEXT NOT NULL,
            FOREIGN KEY (pass_id) REFERENCES passes(pass_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_passes_started ON passes(started_at);
        CREATE INDEX IF NOT EXISTS idx_run_results_pass ON run_results(pass_id, position);
        CREATE INDEX IF NOT EXISTS idx_run_results_target ON run_results(target_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
