//! Per-target run: reuse a cached session or log in, then check in.
//!
//! ```text
//! Start -> Initialized -> AuthChecked -> Authenticated ----------> CheckedIn -> Closed
//!                                    \-> LoggingIn -> Authenticated /
//! ```
//!
//! The automation handle acquired in `Start` is closed exactly once on every
//! exit path, including driver errors and driver panics. Driver faults never
//! escape a run; they become a failed [`RunResult`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::TargetConfig;
use crate::credentials::Credentials;
use crate::driver::{AutomationHandle, HandleLauncher, TargetDriver};
use crate::report::RunResult;
use crate::session::SessionStore;

/// States of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Initialized,
    AuthChecked,
    LoggingIn,
    Authenticated,
    CheckedIn,
    Closed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Start => "start",
            RunState::Initialized => "initialized",
            RunState::AuthChecked => "auth_checked",
            RunState::LoggingIn => "logging_in",
            RunState::Authenticated => "authenticated",
            RunState::CheckedIn => "checked_in",
            RunState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tracks the current state and logs each transition.
struct Machine<'a> {
    target_id: &'a str,
    state: RunState,
}

impl<'a> Machine<'a> {
    fn new(target_id: &'a str) -> Self {
        Self {
            target_id,
            state: RunState::Start,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(target = %self.target_id, from = %self.state, to = %next, "run transition");
        self.state = next;
    }
}

/// Terminal outcome of the driven part of a run.
struct Outcome {
    success: bool,
    message: &'static str,
    error: Option<String>,
}

impl Outcome {
    fn ok(message: &'static str) -> Self {
        Self {
            success: true,
            message,
            error: None,
        }
    }

    fn failed(message: &'static str, error: Option<String>) -> Self {
        Self {
            success: false,
            message,
            error,
        }
    }
}

/// Runs one target through the login/check-in state machine.
#[derive(Clone)]
pub struct TargetRunner {
    store: SessionStore,
    launcher: Arc<dyn HandleLauncher>,
}

impl TargetRunner {
    pub fn new(store: SessionStore, launcher: Arc<dyn HandleLauncher>) -> Self {
        Self { store, launcher }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Execute one run. Always produces a result.
    pub async fn run(
        &self,
        target: &TargetConfig,
        driver: &dyn TargetDriver,
        credentials: &Credentials,
    ) -> RunResult {
        let mut machine = Machine::new(&target.id);

        // Start -> Initialized. Expired or corrupt sessions are purged here,
        // before any driver call.
        let seed = self
            .store
            .load_valid(&target.id)
            .await
            .map(|record| record.storage_state);
        let reused = seed.is_some();

        let mut handle = match self.launcher.launch(target, seed).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(target = %target.id, error = %e, "could not acquire automation handle");
                return RunResult::failure(
                    target,
                    "failed to acquire automation handle",
                    Some(e.to_string()),
                );
            }
        };
        machine.enter(RunState::Initialized);
        debug!(target = %target.id, session_reused = reused, "handle ready");

        let driven = AssertUnwindSafe(self.drive(
            &mut machine,
            target,
            driver,
            credentials,
            handle.as_mut(),
        ))
        .catch_unwind()
        .await;

        if let Err(e) = handle.close().await {
            warn!(target = %target.id, error = %e, "handle teardown failed");
        }
        machine.enter(RunState::Closed);

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(target = %target.id, "driver panicked");
                Outcome::failed("driver panicked", Some(panic_message(panic.as_ref())))
            }
        };

        if outcome.success {
            info!(target = %target.id, session_reused = reused, "check-in succeeded");
            RunResult::success(target, outcome.message, reused)
        } else {
            warn!(
                target = %target.id,
                message = outcome.message,
                error = outcome.error.as_deref().unwrap_or(""),
                "run failed"
            );
            RunResult::failure(target, outcome.message, outcome.error).with_session_reused(reused)
        }
    }

    async fn drive(
        &self,
        machine: &mut Machine<'_>,
        target: &TargetConfig,
        driver: &dyn TargetDriver,
        credentials: &Credentials,
        handle: &mut dyn AutomationHandle,
    ) -> Outcome {
        // Initialized -> AuthChecked. A faulting check counts as "not logged
        // in" so the run falls toward a fresh login.
        let logged_in = match driver.check_logged_in(handle).await {
            Ok(logged_in) => logged_in,
            Err(e) => {
                warn!(target = %target.id, error = %e, "auth check failed, assuming logged out");
                false
            }
        };
        machine.enter(RunState::AuthChecked);

        if !logged_in {
            machine.enter(RunState::LoggingIn);
            match driver.login(handle, credentials).await {
                Ok(true) => match handle.storage_state().await {
                    Ok(state) => self.store.save(&target.id, &state).await,
                    Err(e) => {
                        warn!(target = %target.id, error = %e, "could not snapshot session after login");
                    }
                },
                Ok(false) => return Outcome::failed("login failed", None),
                Err(e) => return Outcome::failed("login failed", Some(e.to_string())),
            }
        }
        machine.enter(RunState::Authenticated);

        let outcome = match driver.perform_check_in(handle).await {
            Ok(true) => Outcome::ok("check-in succeeded"),
            Ok(false) => Outcome::failed("check-in not confirmed by site", None),
            Err(e) => Outcome::failed("check-in failed", Some(e.to_string())),
        };
        machine.enter(RunState::CheckedIn);
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Cookie, SessionRecord, StorageState};
    use crate::test_utils::{MemoryLauncher, Outcome as Scripted, ScriptedDriver};
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: SessionStore,
        launcher: MemoryLauncher,
        runner: TargetRunner,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), Duration::from_secs(7 * 86_400));
        let launcher = MemoryLauncher::default();
        let runner = TargetRunner::new(store.clone(), Arc::new(launcher.clone()));
        Fixture {
            _dir: dir,
            store,
            launcher,
            runner,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("user", "secret")
    }

    fn cached_state() -> StorageState {
        let mut state = StorageState::default();
        state.upsert_cookie(Cookie::new("sid", "cached", "memory"));
        state
    }

    #[tokio::test]
    async fn test_fresh_login_saves_session() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver::default();

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(result.success, "{result:?}");
        assert!(!result.session_reused);
        assert_eq!(driver.calls.logins(), 1);
        let record = fx.store.load("site1").await.unwrap();
        assert_eq!(record.storage_state.cookies[0].value, "site1-session");
        assert!(record.age(Utc::now()).num_seconds() < 5);
        assert_eq!(fx.launcher.log.closes(), 1);
    }

    #[tokio::test]
    async fn test_logged_in_never_calls_login() {
        let fx = fixture();
        fx.store.save("site1", &cached_state()).await;
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            logged_in: Scripted::Yes,
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(result.success);
        assert!(result.session_reused);
        assert_eq!(driver.calls.logins(), 0);
        assert_eq!(fx.launcher.log.seed_for("site1"), Some(Some(cached_state())));
    }

    #[tokio::test]
    async fn test_expired_session_purged_before_launch() {
        let fx = fixture();
        let record = SessionRecord {
            target_id: "site2".to_string(),
            saved_at: Utc::now() - chrono::Duration::days(8),
            storage_state: cached_state(),
        };
        std::fs::write(
            fx.store.path_for("site2"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        let target = TargetConfig::new("site2", "Site 2");
        let driver = ScriptedDriver::default();

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(result.success);
        assert!(!result.session_reused);
        assert_eq!(fx.launcher.log.seed_for("site2"), Some(None));
        assert_eq!(driver.calls.logins(), 1);
    }

    #[tokio::test]
    async fn test_login_failure_skips_check_in() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            login: Scripted::No,
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(!result.success);
        assert_eq!(result.message, "login failed");
        assert_eq!(driver.calls.check_ins(), 0);
        assert!(!fx.store.is_valid("site1").await);
        assert_eq!(fx.launcher.log.closes(), 1);
    }

    #[tokio::test]
    async fn test_login_error_captured() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            login: Scripted::Fail("connection reset".to_string()),
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert_eq!(result.message, "login failed");
        assert_eq!(result.error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_auth_check_error_falls_back_to_login() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            logged_in: Scripted::Fail("dns failure".to_string()),
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(result.success);
        assert_eq!(driver.calls.logins(), 1);
    }

    #[tokio::test]
    async fn test_check_in_error_message_captured() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            check_in: Scripted::Fail("button not found".to_string()),
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(!result.success);
        assert_eq!(result.message, "check-in failed");
        assert_eq!(result.error.as_deref(), Some("button not found"));
        // Login still succeeded, so the session is kept for the next run.
        assert!(fx.store.is_valid("site1").await);
    }

    #[tokio::test]
    async fn test_check_in_rejected() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            check_in: Scripted::No,
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(!result.success);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_driver_panic_still_closes_handle() {
        let fx = fixture();
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver {
            check_in: Scripted::Panic,
            ..ScriptedDriver::default()
        };

        let result = fx.runner.run(&target, &driver, &creds()).await;

        assert!(!result.success);
        assert_eq!(result.message, "driver panicked");
        assert_eq!(result.error.as_deref(), Some("scripted driver panic"));
        assert_eq!(fx.launcher.log.launches(), 1);
        assert_eq!(fx.launcher.log.closes(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_terminal() {
        let mut fx = fixture();
        fx.launcher.fail_launch = true;
        let runner = TargetRunner::new(fx.store.clone(), Arc::new(fx.launcher.clone()));
        let target = TargetConfig::new("site1", "Site 1");
        let driver = ScriptedDriver::default();

        let result = runner.run(&target, &driver, &creds()).await;

        assert!(!result.success);
        assert_eq!(result.message, "failed to acquire automation handle");
        assert_eq!(driver.calls.checks(), 0);
        assert_eq!(fx.launcher.log.closes(), 0);
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic");
    }
}
