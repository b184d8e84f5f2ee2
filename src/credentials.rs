//! Sourcing of database credentials.
//!
//! The engine only sees the [CredentialProvider] trait; where secrets come
//! from (environment, prompt, vault) is up to the implementation.

use std::collections::BTreeMap;
use std::fmt;

use derive_more::{Display, Error};

use crate::config::DatabaseInstance;

/// Login for one database instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub auth_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// No credentials could be found for a database alias.
#[derive(Debug, Clone, Display, Error, PartialEq, Eq)]
#[display("Credentials unavailable for database `{alias}`: {reason}")]
pub struct CredentialsUnavailable {
    pub alias: String,
    pub reason: String,
}

impl CredentialsUnavailable {
    pub fn new(alias: &str, reason: impl Into<String>) -> Self {
        Self {
            alias: alias.to_string(),
            reason: reason.into(),
        }
    }
}

pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, alias: &str) -> Result<Credentials, CredentialsUnavailable>;
}

/// Reads the user from the instance config (or an override) and the password
/// from the environment variable named by [DatabaseInstance::password_env].
///
/// An unset password variable yields an empty token.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    databases: BTreeMap<String, DatabaseInstance>,
    user_override: Option<String>,
}

impl EnvCredentials {
    pub fn new(databases: BTreeMap<String, DatabaseInstance>) -> Self {
        Self {
            databases,
            user_override: None,
        }
    }

    /// Use `user` for every alias regardless of the configured user.
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user_override = user;
        self
    }
}

impl CredentialProvider for EnvCredentials {
    fn resolve(&self, alias: &str) -> Result<Credentials, CredentialsUnavailable> {
        let instance = self
            .databases
            .get(alias)
            .ok_or_else(|| CredentialsUnavailable::new(alias, "no such database configured"))?;

        let user = self
            .user_override
            .clone()
            .or_else(|| instance.user.clone())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CredentialsUnavailable::new(alias, "no user configured"))?;

        let auth_token = std::env::var(&instance.password_env).unwrap_or_default();
        if auth_token.is_empty() {
            log::debug!(target: "credentials", "No password in ${} for `{alias}`", instance.password_env);
        }

        Ok(Credentials { user, auth_token })
    }
}

/// Fixed credentials for every alias.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl StaticCredentials {
    pub fn new(user: &str, auth_token: &str) -> Self {
        Self(Credentials {
            user: user.to_string(),
            auth_token: auth_token.to_string(),
        })
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, _alias: &str) -> Result<Credentials, CredentialsUnavailable> {
        Ok(self.0.clone())
    }
}
