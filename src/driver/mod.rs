//! Target drivers and the automation handles they operate on.
//!
//! A driver knows one site's login and check-in flow; the engine only sees
//! the three capabilities of [`TargetDriver`]. Drivers are selected through a
//! static [`DriverRegistry`] keyed by the `driver` field of a target, and
//! resolved once at startup so an unknown kind surfaces as a
//! [`ConfigError`] before any run.

pub mod form;
pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ConfigError, TargetConfig};
use crate::credentials::Credentials;
use crate::session::StorageState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch automation handle: {0}")]
    Launch(String),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {url}: {reason}")]
    Unexpected { url: String, reason: String },

    #[error("automation handle already closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// A loaded page as seen by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.body.contains(needle)
    }
}

/// Browser-automation handle exclusively owned by one run.
#[async_trait]
pub trait AutomationHandle: Send {
    /// Navigate to `url` and return the resulting page.
    async fn goto(&mut self, url: &str) -> Result<Page, DriverError>;

    /// Submit a form to `url` and return the resulting page.
    async fn submit_form(
        &mut self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<Page, DriverError>;

    /// Snapshot of the handle's cookies and local storage.
    async fn storage_state(&self) -> Result<StorageState, DriverError>;

    /// Release everything the handle opened. Must be safe to call once per
    /// handle; later calls are no-ops.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Produces automation handles, optionally seeded with a cached session.
#[async_trait]
pub trait HandleLauncher: Send + Sync {
    async fn launch(
        &self,
        target: &TargetConfig,
        seed: Option<StorageState>,
    ) -> Result<Box<dyn AutomationHandle>, DriverError>;
}

/// Site-specific login and check-in behaviour.
///
/// "Not logged in" and "check-in rejected" are `Ok(false)`; `Err` is
/// reserved for transport or driver faults.
#[async_trait]
pub trait TargetDriver: Send + Sync {
    async fn check_logged_in(&self, handle: &mut dyn AutomationHandle) -> Result<bool, DriverError>;

    async fn login(
        &self,
        handle: &mut dyn AutomationHandle,
        credentials: &Credentials,
    ) -> Result<bool, DriverError>;

    async fn perform_check_in(&self, handle: &mut dyn AutomationHandle)
        -> Result<bool, DriverError>;
}

/// Builds the driver for one target.
pub type DriverFactory =
    Arc<dyn Fn(&TargetConfig) -> Result<Arc<dyn TargetDriver>, ConfigError> + Send + Sync>;

/// Startup-time mapping from driver kind to factory.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(form::KIND, |target| {
            let driver = form::FormDriver::from_target(target)?;
            Ok(Arc::new(driver) as Arc<dyn TargetDriver>)
        });
        registry
    }

    /// Add or replace the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&TargetConfig) -> Result<Arc<dyn TargetDriver>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the driver for `target`, rejecting unknown kinds.
    pub fn resolve(&self, target: &TargetConfig) -> Result<Arc<dyn TargetDriver>, ConfigError> {
        let factory = self
            .factories
            .get(&target.driver)
            .ok_or_else(|| ConfigError::UnknownDriver {
                target: target.id.clone(),
                driver: target.driver.clone(),
            })?;
        factory(target)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
