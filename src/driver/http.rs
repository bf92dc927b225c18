//! HTTP automation handle.
//!
//! A reqwest client driven request by request, with redirects followed by
//! hand so every `Set-Cookie` along the way lands in the handle's
//! [`StorageState`]. Local-storage entries from a seeded session are carried
//! through unchanged.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{header, redirect, Client, Method, StatusCode, Url};
use tracing::debug;

use super::{AutomationHandle, DriverError, HandleLauncher, Page};
use crate::config::TargetConfig;
use crate::session::{Cookie, StorageState};

const MAX_REDIRECTS: usize = 10;

/// Launches [`HttpHandle`]s.
#[derive(Debug, Clone)]
pub struct HttpLauncher {
    user_agent: String,
}

impl Default for HttpLauncher {
    fn default() -> Self {
        Self {
            user_agent: concat!("autocheckin/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[async_trait]
impl HandleLauncher for HttpLauncher {
    async fn launch(
        &self,
        target: &TargetConfig,
        seed: Option<StorageState>,
    ) -> Result<Box<dyn AutomationHandle>, DriverError> {
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(Duration::from_secs(target.endpoint.timeout_secs.max(1)))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let mut state = seed.unwrap_or_default();
        state.drop_expired_cookies(unix_now());
        debug!(target = %target.id, cookies = state.cookies.len(), "http handle launched");

        Ok(Box::new(HttpHandle {
            client: Some(client),
            state,
        }))
    }
}

/// One run's HTTP session.
pub struct HttpHandle {
    client: Option<Client>,
    state: StorageState,
}

impl HttpHandle {
    async fn request(
        &mut self,
        method: Method,
        url: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Page, DriverError> {
        let client = self.client.clone().ok_or(DriverError::Closed)?;
        let mut current = Url::parse(url).map_err(|e| DriverError::Unexpected {
            url: url.to_string(),
            reason: format!("invalid url: {e}"),
        })?;
        let mut method = method;
        let mut form = form;

        for _ in 0..=MAX_REDIRECTS {
            let mut req = client.request(method.clone(), current.clone());
            let header_value = self.state.cookie_header_for(
                current.host_str().unwrap_or(""),
                current.path(),
                current.scheme() == "https",
            );
            if let Some(cookie) = header_value {
                req = req.header(header::COOKIE, cookie);
            }
            if let Some(fields) = form {
                req = req.form(fields);
            }

            let resp = req.send().await.map_err(|source| DriverError::Transport {
                url: current.to_string(),
                source,
            })?;
            self.absorb_cookies(&resp);

            let status = resp.status();
            if status.is_redirection() {
                if let Some(next) = redirect_target(&current, &resp) {
                    // 307/308 replay the request; everything else becomes a GET.
                    if status != StatusCode::TEMPORARY_REDIRECT
                        && status != StatusCode::PERMANENT_REDIRECT
                    {
                        method = Method::GET;
                        form = None;
                    }
                    current = next;
                    continue;
                }
            }

            let final_url = resp.url().to_string();
            let body = resp.text().await.map_err(|source| DriverError::Transport {
                url: final_url.clone(),
                source,
            })?;
            return Ok(Page {
                url: final_url,
                status: status.as_u16(),
                body,
            });
        }

        Err(DriverError::Unexpected {
            url: url.to_string(),
            reason: format!("more than {MAX_REDIRECTS} redirects"),
        })
    }

    fn absorb_cookies(&mut self, resp: &reqwest::Response) {
        let host = resp.url().host_str().unwrap_or("").to_string();
        let now = unix_now();
        for c in resp.cookies() {
            let expires = match (c.max_age(), c.expires()) {
                (Some(max_age), _) => now + max_age.as_secs_f64(),
                (None, Some(at)) => system_time_secs(at),
                (None, None) => -1.0,
            };
            let same_site = if c.same_site_strict() {
                Some("Strict".to_string())
            } else if c.same_site_lax() {
                Some("Lax".to_string())
            } else {
                None
            };
            self.state.upsert_cookie(Cookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(str::to_string).unwrap_or_else(|| host.clone()),
                path: c.path().unwrap_or("/").to_string(),
                expires,
                http_only: c.http_only(),
                secure: c.secure(),
                same_site,
            });
        }
        self.state.drop_expired_cookies(now);
    }
}

#[async_trait]
impl AutomationHandle for HttpHandle {
    async fn goto(&mut self, url: &str) -> Result<Page, DriverError> {
        self.request(Method::GET, url, None).await
    }

    async fn submit_form(
        &mut self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<Page, DriverError> {
        self.request(Method::POST, url, Some(fields)).await
    }

    async fn storage_state(&self) -> Result<StorageState, DriverError> {
        Ok(self.state.clone())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.client = None;
        Ok(())
    }
}

fn redirect_target(current: &Url, resp: &reqwest::Response) -> Option<Url> {
    let location = resp.headers().get(header::LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

fn system_time_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn unix_now() -> f64 {
    system_time_secs(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_launch_seeds_state_and_drops_expired_cookies() {
        let mut seed = StorageState::default();
        seed.upsert_cookie(Cookie::new("sid", "live", "site.example"));
        let mut stale = Cookie::new("old", "gone", "site.example");
        stale.expires = 1.0;
        seed.upsert_cookie(stale);

        let target = TargetConfig::new("site1", "Site 1");
        let handle = HttpLauncher::default()
            .launch(&target, Some(seed))
            .await
            .unwrap();
        let state = handle.storage_state().await.unwrap();
        assert_eq!(state.cookies.len(), 1);
        assert_eq!(state.cookies[0].name, "sid");
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_requests() {
        let target = TargetConfig::new("site1", "Site 1");
        let mut handle = HttpLauncher::default().launch(&target, None).await.unwrap();
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        let err = handle.goto("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, DriverError::Closed));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unexpected() {
        let target = TargetConfig::new("site1", "Site 1");
        let mut handle = HttpLauncher::default().launch(&target, None).await.unwrap();
        let err = handle.goto("not a url").await.unwrap_err();
        assert!(matches!(err, DriverError::Unexpected { .. }));
    }

    mod live_site {
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        use axum::extract::State;
        use axum::http::{header as h, HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::{get, post};
        use axum::{Form, Router};

        /// Request line and `Cookie` header of every request the site saw.
        pub type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

        fn note(seen: &Seen, line: &str, headers: &HeaderMap) -> bool {
            let cookie = headers
                .get(h::COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let authed = cookie.as_deref().is_some_and(|c| c.contains("sid=abc"));
            seen.lock().unwrap().push((line.to_string(), cookie));
            authed
        }

        async fn account(State(seen): State<Seen>, headers: HeaderMap) -> Response {
            if note(&seen, "GET /account", &headers) {
                "welcome back alice".into_response()
            } else {
                (StatusCode::FOUND, [(h::LOCATION, "/login")]).into_response()
            }
        }

        async fn login_page(State(seen): State<Seen>, headers: HeaderMap) -> &'static str {
            note(&seen, "GET /login", &headers);
            "please sign in"
        }

        async fn login_submit(
            State(seen): State<Seen>,
            headers: HeaderMap,
            Form(fields): Form<HashMap<String, String>>,
        ) -> Response {
            note(&seen, "POST /login", &headers);
            let ok = fields.get("username").map(String::as_str) == Some("alice")
                && fields.get("password").map(String::as_str) == Some("hunter2");
            if ok {
                (
                    StatusCode::FOUND,
                    [
                        (h::LOCATION, "/account"),
                        (h::SET_COOKIE, "sid=abc; Path=/; HttpOnly"),
                    ],
                )
                    .into_response()
            } else {
                "wrong password".into_response()
            }
        }

        async fn checkin(State(seen): State<Seen>, headers: HeaderMap) -> Response {
            if note(&seen, "POST /checkin", &headers) {
                "signed in today".into_response()
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }

        /// Serve the site on an ephemeral port; returns its base url.
        pub async fn spawn(seen: Seen) -> String {
            let app = Router::new()
                .route("/account", get(account))
                .route("/login", get(login_page).post(login_submit))
                .route("/checkin", post(checkin))
                .with_state(seen);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }
    }

    fn site_target(base_url: &str) -> TargetConfig {
        let mut target = TargetConfig::new("site1", "Site 1");
        target.endpoint.base_url = base_url.to_string();
        target.endpoint.check_path = "/account".to_string();
        target.endpoint.success_marker = Some("signed in today".to_string());
        target
    }

    #[tokio::test]
    async fn test_form_login_through_redirect_keeps_cookie() {
        use crate::credentials::Credentials;
        use crate::driver::form::FormDriver;
        use crate::driver::TargetDriver;

        let seen = live_site::Seen::default();
        let base = live_site::spawn(Arc::clone(&seen)).await;
        let target = site_target(&base);
        let driver = FormDriver::from_target(&target).unwrap();
        let mut handle = HttpLauncher::default().launch(&target, None).await.unwrap();

        assert!(!driver.check_logged_in(handle.as_mut()).await.unwrap());
        let creds = Credentials::new("alice", "hunter2");
        assert!(driver.login(handle.as_mut(), &creds).await.unwrap());
        assert!(driver.perform_check_in(handle.as_mut()).await.unwrap());

        let state = handle.storage_state().await.unwrap();
        let sid = state.cookies.iter().find(|c| c.name == "sid").unwrap();
        assert_eq!(sid.value, "abc");
        assert_eq!(sid.domain, "127.0.0.1");
        assert!(sid.http_only);

        let seen = seen.lock().unwrap().clone();
        let lines: Vec<&str> = seen.iter().map(|(line, _)| line.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "GET /account",
                "GET /login",
                "POST /login",
                // 302 after the form post is followed as a GET.
                "GET /account",
                "GET /account",
                "POST /checkin",
            ]
        );
        assert_eq!(seen[0].1, None);
        assert_eq!(seen[2].1, None);
        for (_, cookie) in &seen[3..] {
            assert_eq!(cookie.as_deref(), Some("sid=abc"));
        }
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_form_login_wrong_password_is_not_logged_in() {
        use crate::credentials::Credentials;
        use crate::driver::form::FormDriver;
        use crate::driver::TargetDriver;

        let base = live_site::spawn(live_site::Seen::default()).await;
        let target = site_target(&base);
        let driver = FormDriver::from_target(&target).unwrap();
        let mut handle = HttpLauncher::default().launch(&target, None).await.unwrap();

        let creds = Credentials::new("alice", "guess");
        assert!(!driver.login(handle.as_mut(), &creds).await.unwrap());
        assert!(handle.storage_state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_session_is_replayed() {
        use crate::driver::form::FormDriver;
        use crate::driver::TargetDriver;

        let seen = live_site::Seen::default();
        let base = live_site::spawn(Arc::clone(&seen)).await;
        let target = site_target(&base);
        let driver = FormDriver::from_target(&target).unwrap();
        let mut seed = StorageState::default();
        seed.upsert_cookie(Cookie::new("sid", "abc", "127.0.0.1"));
        let mut handle = HttpLauncher::default().launch(&target, Some(seed)).await.unwrap();

        assert!(driver.check_logged_in(handle.as_mut()).await.unwrap());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
