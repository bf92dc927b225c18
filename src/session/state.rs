//! Browser storage-state snapshot: cookie list plus per-origin local storage.
//!
//! The shape follows the storage-state JSON used by browser automation
//! tooling so that snapshots can be exchanged with it unchanged.

use serde::{Deserialize, Serialize};

/// Cookies and local storage captured from an automation handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageState {
    /// True when the snapshot holds no cookie and no local-storage entry.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
    }

    /// Number of session elements (cookies + local-storage entries).
    pub fn element_count(&self) -> usize {
        self.cookies.len()
            + self
                .origins
                .iter()
                .map(|o| o.local_storage.len())
                .sum::<usize>()
    }

    /// Insert or replace a cookie keyed by (name, domain, path).
    pub fn upsert_cookie(&mut self, cookie: Cookie) {
        match self.cookies.iter_mut().find(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        }) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Drop cookies whose absolute expiry (unix seconds) has passed.
    /// Session cookies (`expires < 0`) are kept.
    pub fn drop_expired_cookies(&mut self, now_unix: f64) {
        self.cookies.retain(|c| c.expires < 0.0 || c.expires > now_unix);
    }

    /// `Cookie` request-header value for a request to `host` and `path`, or
    /// `None` when nothing applies. Secure cookies are only sent when
    /// `secure` (an https request).
    pub fn cookie_header_for(&self, host: &str, path: &str, secure: bool) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host) && c.matches_path(path) && (secure || !c.secure))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; `-1` marks a session cookie.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: default_path(),
            expires: session_expiry(),
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// Domain match: an empty domain applies everywhere; otherwise the host
    /// must equal the domain or be a subdomain of it.
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        if domain.is_empty() {
            return true;
        }
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    }

    /// Path match: the request path equals the cookie path or lies beneath
    /// it at a `/` boundary.
    pub fn matches_path(&self, request_path: &str) -> bool {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        match request_path.strip_prefix(path) {
            Some(rest) => rest.is_empty() || path.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}
