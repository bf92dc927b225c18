//! Smoke tests -- verify the binary runs and the offline commands work.

use assert_cmd::Command;
use predicates::str::contains;

fn cli(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("autocheckin").unwrap();
    cmd.current_dir(dir).env_remove("AUTOCHECKIN_CONFIG");
    cmd
}

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("autocheckin.toml");
    let content = format!(
        r#"
[session]
dir = "{sessions}"

[history]
db_path = "{db}"

[schedule]
cron = "30 7 * * 1-5"
timezone = "utc"

[[targets]]
id = "forum"
display_name = "Forum"
[targets.endpoint]
base_url = "https://forum.example"

[[targets]]
id = "video"
enabled = false
"#,
        sessions = dir.join("sessions").display(),
        db = dir.join("history.db").display(),
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_help() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Session-aware scheduled check-ins"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("autocheckin"));
}

#[test]
fn test_subcommands_exist() {
    let dir = tempfile::tempdir().unwrap();
    for sub in [
        "run-all",
        "run-single",
        "run-parallel",
        "list-targets",
        "show-sessions",
        "clear-sessions",
        "start-schedule",
        "stop-schedule",
        "schedule-status",
        "schedule-preview",
        "run-now",
        "history",
    ] {
        cli(dir.path()).args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_list_targets_reports_missing_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .env_remove("AUTOCHECKIN_FORUM_USERNAME")
        .env_remove("AUTOCHECKIN_FORUM_PASSWORD")
        .arg("--config")
        .arg(&config)
        .arg("list-targets")
        .assert()
        .success()
        .stdout(contains("forum"))
        .stdout(contains("AUTOCHECKIN_FORUM_USERNAME"))
        .stdout(contains("disabled"));
}

#[test]
fn test_show_sessions_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("show-sessions")
        .assert()
        .success()
        .stdout(contains("No cached sessions"));
}

#[test]
fn test_clear_sessions_all() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["clear-sessions", "all"])
        .assert()
        .success()
        .stdout(contains("Removed 0 cached session(s)."));
}

#[test]
fn test_schedule_preview_uses_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["schedule-preview", "--hours", "168"])
        .assert()
        .success()
        .stdout(contains("30 7 * * 1-5"))
        .stdout(contains("T07:30:00"));
}

#[test]
fn test_schedule_preview_rejects_bad_cron() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["schedule-preview", "--cron", "99 8 * * *"])
        .assert()
        .failure()
        .stderr(contains("99 8 * * *"));
}

#[test]
fn test_run_single_unknown_target_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["--json", "run-single", "ghost"])
        .assert()
        .success()
        .stdout(contains("target not found or disabled"));
}

#[test]
fn test_history_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("history")
        .assert()
        .success()
        .stdout(contains("No passes recorded yet."));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["--config", "does-not-exist.toml", "list-targets"])
        .assert()
        .failure();
}
