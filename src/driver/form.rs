//! Configuration-driven form login driver (`driver = "http-form"`).
//!
//! Works for sites whose login is a plain form post and whose check-in is a
//! single request. All site knowledge lives in the target's
//! [`EndpointConfig`].

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

use super::{AutomationHandle, DriverError, Page, TargetDriver};
use crate::config::{ConfigError, EndpointConfig, TargetConfig};
use crate::credentials::Credentials;

pub const KIND: &str = "http-form";

#[derive(Debug, Clone)]
pub struct FormDriver {
    target_id: String,
    base: Url,
    endpoint: EndpointConfig,
}

impl FormDriver {
    pub fn from_target(target: &TargetConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            target: target.id.clone(),
            reason,
        };

        let endpoint = target.endpoint.clone();
        if endpoint.base_url.trim().is_empty() {
            return Err(invalid("base_url is empty".to_string()));
        }
        let base = Url::parse(&endpoint.base_url)
            .map_err(|e| invalid(format!("base_url '{}': {e}", endpoint.base_url)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }
        match endpoint.checkin_method.to_ascii_uppercase().as_str() {
            "GET" | "POST" => {}
            other => return Err(invalid(format!("unsupported checkin_method '{other}'"))),
        }

        Ok(Self {
            target_id: target.id.clone(),
            base,
            endpoint,
        })
    }

    fn url(&self, path: &str) -> Result<String, DriverError> {
        self.base
            .join(path)
            .map(|u| u.to_string())
            .map_err(|e| DriverError::Unexpected {
                url: format!("{}{}", self.base, path),
                reason: e.to_string(),
            })
    }

    /// The page shows an authenticated view: 2xx, not bounced to the login
    /// page, and carrying the logged-in marker when one is configured.
    fn shows_logged_in(&self, page: &Page) -> bool {
        if !page.is_success() {
            return false;
        }
        let on_login_page = Url::parse(&page.url)
            .map(|u| u.path() == self.endpoint.login_path)
            .unwrap_or(false);
        if on_login_page {
            return false;
        }
        match &self.endpoint.logged_in_marker {
            Some(marker) => page.contains(marker),
            None => true,
        }
    }
}

#[async_trait]
impl TargetDriver for FormDriver {
    async fn check_logged_in(&self, handle: &mut dyn AutomationHandle) -> Result<bool, DriverError> {
        let page = handle.goto(&self.url(&self.endpoint.check_path)?).await?;
        let logged_in = self.shows_logged_in(&page);
        debug!(target = %self.target_id, status = page.status, logged_in, "auth check");
        Ok(logged_in)
    }

    async fn login(
        &self,
        handle: &mut dyn AutomationHandle,
        credentials: &Credentials,
    ) -> Result<bool, DriverError> {
        let fields = vec![
            (
                self.endpoint.username_field.clone(),
                credentials.username.clone(),
            ),
            (
                self.endpoint.password_field.clone(),
                credentials.secret().to_string(),
            ),
        ];
        let page = handle
            .submit_form(&self.url(&self.endpoint.login_path)?, &fields)
            .await?;
        if !page.is_success() {
            debug!(target = %self.target_id, status = page.status, "login form rejected");
            return Ok(false);
        }
        self.check_logged_in(handle).await
    }

    async fn perform_check_in(&self, handle: &mut dyn AutomationHandle) -> Result<bool, DriverError> {
        let url = self.url(&self.endpoint.checkin_path)?;
        let page = if self.endpoint.checkin_method.eq_ignore_ascii_case("GET") {
            handle.goto(&url).await?
        } else {
            handle.submit_form(&url, &[]).await?
        };
        if !page.is_success() {
            return Ok(false);
        }

        if let Some(already) = &self.endpoint.already_marker {
            if page.contains(already) {
                info!(target = %self.target_id, "already checked in today");
                return Ok(true);
            }
        }
        Ok(match &self.endpoint.success_marker {
            Some(marker) => page.contains(marker),
            None => true,
        })
    }
}
