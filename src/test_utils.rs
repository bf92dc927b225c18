//! Test doubles shared by unit tests and the integration suite.
//!
//! [`ScriptedDriver`] answers each capability from a fixed [`Outcome`],
//! [`MemoryLauncher`] hands out in-memory handles and counts launches and
//! teardowns, and [`PageScript`] replays canned pages for driver tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{OrchestratorConfig, TargetConfig};
use crate::credentials::{CredentialSource, Credentials};
use crate::driver::{AutomationHandle, DriverError, DriverRegistry, HandleLauncher, Page, TargetDriver};
use crate::orchestrator::Orchestrator;
use crate::report::{ReportSink, RunReport};
use crate::runner::TargetRunner;
use crate::session::{Cookie, SessionStore, StorageState};

/// Scripted answer for one driver capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Outcome {
    #[default]
    Yes,
    No,
    /// Return a `DriverError` with this message.
    Fail(String),
    /// Panic inside the driver.
    Panic,
}

impl Outcome {
    fn resolve(&self) -> Result<bool, DriverError> {
        match self {
            Outcome::Yes => Ok(true),
            Outcome::No => Ok(false),
            Outcome::Fail(msg) => Err(DriverError::Other(msg.clone())),
            Outcome::Panic => panic!("scripted driver panic"),
        }
    }
}

/// How many times each capability was invoked.
#[derive(Debug, Default)]
pub struct CallLog {
    pub check_logged_in: AtomicUsize,
    pub login: AtomicUsize,
    pub check_in: AtomicUsize,
}

impl CallLog {
    pub fn checks(&self) -> usize {
        self.check_logged_in.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.login.load(Ordering::SeqCst)
    }

    pub fn check_ins(&self) -> usize {
        self.check_in.load(Ordering::SeqCst)
    }
}

/// Driver whose answers are fixed up front.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    pub name: String,
    pub logged_in: Outcome,
    pub login: Outcome,
    pub check_in: Outcome,
    /// Delay before the check-in answer, to shape completion order.
    pub check_in_delay: Duration,
    pub calls: Arc<CallLog>,
    /// Shared log of driver names in check-in completion order.
    pub completions: Arc<Mutex<Vec<String>>>,
}

impl Default for ScriptedDriver {
    /// Not logged in; login and check-in succeed.
    fn default() -> Self {
        Self {
            name: String::new(),
            logged_in: Outcome::No,
            login: Outcome::Yes,
            check_in: Outcome::Yes,
            check_in_delay: Duration::ZERO,
            calls: Arc::new(CallLog::default()),
            completions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ScriptedDriver {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TargetDriver for ScriptedDriver {
    async fn check_logged_in(&self, _handle: &mut dyn AutomationHandle) -> Result<bool, DriverError> {
        self.calls.check_logged_in.fetch_add(1, Ordering::SeqCst);
        self.logged_in.resolve()
    }

    async fn login(
        &self,
        handle: &mut dyn AutomationHandle,
        credentials: &Credentials,
    ) -> Result<bool, DriverError> {
        self.calls.login.fetch_add(1, Ordering::SeqCst);
        let ok = self.login.resolve()?;
        if ok {
            let fields = vec![("username".to_string(), credentials.username.clone())];
            handle.submit_form("memory://login", &fields).await?;
        }
        Ok(ok)
    }

    async fn perform_check_in(&self, _handle: &mut dyn AutomationHandle) -> Result<bool, DriverError> {
        self.calls.check_in.fetch_add(1, Ordering::SeqCst);
        if !self.check_in_delay.is_zero() {
            tokio::time::sleep(self.check_in_delay).await;
        }
        let result = self.check_in.resolve();
        if let Ok(mut done) = self.completions.lock() {
            done.push(self.name.clone());
        }
        result
    }
}

/// Launch and teardown bookkeeping for [`MemoryLauncher`].
#[derive(Debug, Default)]
pub struct LaunchLog {
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    /// Seed handed to each launch, in launch order.
    pub seeds: Mutex<Vec<(String, Option<StorageState>)>>,
}

impl LaunchLog {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn seed_for(&self, target_id: &str) -> Option<Option<StorageState>> {
        self.seeds
            .lock()
            .ok()?
            .iter()
            .rev()
            .find(|(id, _)| id == target_id)
            .map(|(_, seed)| seed.clone())
    }
}

/// Launcher for in-memory handles.
#[derive(Debug, Clone, Default)]
pub struct MemoryLauncher {
    pub fail_launch: bool,
    pub log: Arc<LaunchLog>,
}

#[async_trait]
impl HandleLauncher for MemoryLauncher {
    async fn launch(
        &self,
        target: &TargetConfig,
        seed: Option<StorageState>,
    ) -> Result<Box<dyn AutomationHandle>, DriverError> {
        if let Ok(mut seeds) = self.log.seeds.lock() {
            seeds.push((target.id.clone(), seed.clone()));
        }
        if self.fail_launch {
            return Err(DriverError::Launch("browser unavailable".to_string()));
        }
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryHandle {
            target_id: target.id.clone(),
            state: seed.unwrap_or_default(),
            closed: false,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Handle that records a session cookie on any form submission.
#[derive(Debug)]
pub struct MemoryHandle {
    target_id: String,
    state: StorageState,
    closed: bool,
    log: Arc<LaunchLog>,
}

#[async_trait]
impl AutomationHandle for MemoryHandle {
    async fn goto(&mut self, url: &str) -> Result<Page, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        Ok(Page {
            url: url.to_string(),
            status: 200,
            body: String::new(),
        })
    }

    async fn submit_form(
        &mut self,
        url: &str,
        _fields: &[(String, String)],
    ) -> Result<Page, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.state
            .upsert_cookie(Cookie::new("sid", &format!("{}-session", self.target_id), "memory"));
        self.goto(url).await
    }

    async fn storage_state(&self) -> Result<StorageState, DriverError> {
        Ok(self.state.clone())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Handle that replays canned pages and records every request.
#[derive(Debug, Default)]
pub struct PageScript {
    pages: VecDeque<Page>,
    /// `"<METHOD> <url>"` per request.
    pub requests: Vec<String>,
    /// Submitted form fields, one entry per POST.
    pub forms: Vec<Vec<(String, String)>>,
}

impl PageScript {
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            pages: pages.into(),
            ..Self::default()
        }
    }

    fn next_page(&mut self, url: &str) -> Result<Page, DriverError> {
        self.pages.pop_front().ok_or_else(|| DriverError::Unexpected {
            url: url.to_string(),
            reason: "no scripted page left".to_string(),
        })
    }
}

#[async_trait]
impl AutomationHandle for PageScript {
    async fn goto(&mut self, url: &str) -> Result<Page, DriverError> {
        self.requests.push(format!("GET {url}"));
        self.next_page(url)
    }

    async fn submit_form(
        &mut self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<Page, DriverError> {
        self.requests.push(format!("POST {url}"));
        self.forms.push(fields.to_vec());
        self.next_page(url)
    }

    async fn storage_state(&self) -> Result<StorageState, DriverError> {
        Ok(StorageState::default())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Credential source that answers every variable with the same value.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub String);

impl Default for StaticCredentials {
    fn default() -> Self {
        Self("test-value".to_string())
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, _var: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Sink that keeps every published report.
#[derive(Debug, Default)]
pub struct CollectSink {
    reports: Mutex<Vec<RunReport>>,
}

impl CollectSink {
    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReportSink for CollectSink {
    async fn publish(&self, report: &RunReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}

/// Orchestrator over scripted drivers, one target per `(id, driver)` pair
/// in the given order, with sessions under `session_dir` (7-day TTL) and
/// an in-memory launcher.
pub fn scripted_orchestrator(
    session_dir: &Path,
    drivers: Vec<(&str, ScriptedDriver)>,
    settings: &OrchestratorConfig,
) -> Orchestrator {
    scripted_orchestrator_with(session_dir, drivers, settings, MemoryLauncher::default())
}

/// [`scripted_orchestrator`] with a caller-supplied launcher.
pub fn scripted_orchestrator_with(
    session_dir: &Path,
    drivers: Vec<(&str, ScriptedDriver)>,
    settings: &OrchestratorConfig,
    launcher: MemoryLauncher,
) -> Orchestrator {
    let store = SessionStore::new(session_dir, Duration::from_secs(7 * 86_400));
    let runner = TargetRunner::new(store, Arc::new(launcher));

    let mut registry = DriverRegistry::new();
    let mut targets = Vec::new();
    for (id, driver) in drivers {
        let kind = format!("scripted-{id}");
        registry.register(&kind, move |_| Ok(Arc::new(driver.clone()) as Arc<dyn TargetDriver>));
        let mut target = TargetConfig::new(id, &id.to_uppercase());
        target.driver = kind;
        targets.push(target);
    }

    Orchestrator::new(&targets, &registry, &StaticCredentials::default(), runner, settings)
}
