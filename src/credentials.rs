//! Per-target login credentials sourced from the process environment.
//!
//! Credentials are never persisted. The secret is wiped from memory when the
//! value is dropped.

use std::fmt;

use zeroize::Zeroizing;

use crate::config::{ConfigError, TargetConfig};

/// Username and secret for one target.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.as_str()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Default environment variable names for a target id:
/// `AUTOCHECKIN_<ID>_USERNAME` and `AUTOCHECKIN_<ID>_PASSWORD`.
pub fn env_var_names(target_id: &str) -> (String, String) {
    let key: String = target_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    (
        format!("AUTOCHECKIN_{key}_USERNAME"),
        format!("AUTOCHECKIN_{key}_PASSWORD"),
    )
}

/// Where credentials come from. The process environment in production,
/// a fixed lookup in tests.
pub trait CredentialSource: Send + Sync {
    fn get(&self, var: &str) -> Option<String>;

    /// Resolve credentials for `target`, honouring per-target variable
    /// overrides. Blank values count as missing.
    fn credentials_for(&self, target: &TargetConfig) -> Result<Credentials, ConfigError> {
        let (default_user, default_pass) = env_var_names(&target.id);
        let user_var = target.username_env.clone().unwrap_or(default_user);
        let pass_var = target.password_env.clone().unwrap_or(default_pass);

        let fetch = |var: &str| {
            self.get(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingCredential {
                    target: target.id.clone(),
                    var: var.to_string(),
                })
        };

        let username = fetch(&user_var)?;
        let secret = fetch(&pass_var)?;
        Ok(Credentials::new(username, secret))
    }
}

/// Reads credentials from `std::env`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, var: &str) -> Option<String> {
        std::env::var(var).ok()
    }
}
