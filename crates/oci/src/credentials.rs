//! Registry credential resolution.

use oci_distribution::secrets::RegistryAuth;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Username sent when only a token is configured.
const TOKEN_USERNAME: &str = "token";

/// A configured registry and its credentials.
///
/// Secrets are read from configuration but never serialized.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Display name; also matched against the registry host.
    #[serde(default)]
    pub name: String,
    /// Registry URL or host.
    #[serde(default)]
    pub url: String,
    /// Username, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Password, if any.
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Bearer or personal access token, if any.
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password_set", &self.password.is_some())
            .field("token_set", &self.token.is_some())
            .finish()
    }
}

impl RegistryConfig {
    /// Normalized host this entry applies to (URL first, then name).
    #[must_use]
    pub fn host(&self) -> String {
        let url = normalize_registry(&self.url);
        if url.is_empty() {
            normalize_registry(&self.name)
        } else {
            url
        }
    }

    fn matches(&self, host: &str) -> bool {
        host == normalize_registry(&self.url) || host == normalize_registry(&self.name)
    }
}

/// Resolved credentials for one registry.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Username; empty for anonymous access.
    pub username: String,
    /// Password or token.
    pub password: Option<SecretString>,
}

impl Credentials {
    /// Anonymous credentials.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether these credentials carry no identity.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_none()
    }

    /// Convert into the registry client's auth type.
    #[must_use]
    pub fn to_registry_auth(&self) -> RegistryAuth {
        match &self.password {
            Some(password) => RegistryAuth::Basic(
                self.username.clone(),
                password.expose_secret().to_string(),
            ),
            None if !self.username.is_empty() => {
                RegistryAuth::Basic(self.username.clone(), String::new())
            }
            None => RegistryAuth::Anonymous,
        }
    }
}

/// Maps registry hosts to credentials from a configured registry list.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    registries: Vec<RegistryConfig>,
}

impl CredentialResolver {
    /// Create a resolver over the given registries.
    #[must_use]
    pub fn new(registries: Vec<RegistryConfig>) -> Self {
        Self { registries }
    }

    /// Resolve credentials for a registry host.
    ///
    /// No match is not an error: anonymous credentials are returned.
    #[must_use]
    pub fn resolve(&self, registry: &str) -> Credentials {
        let normalized = normalize_registry(registry);

        let Some(entry) = self.registries.iter().find(|r| r.matches(&normalized)) else {
            debug!(registry, normalized = %normalized, "No registry credentials found");
            return Credentials::anonymous();
        };

        let password = [&entry.password, &entry.token]
            .into_iter()
            .flatten()
            .find(|secret| !secret.expose_secret().is_empty())
            .cloned();
        let username = if entry.username.is_empty() && password.is_some() {
            TOKEN_USERNAME.to_string()
        } else {
            entry.username.clone()
        };

        debug!(
            registry,
            normalized = %normalized,
            username = %username,
            password_set = password.is_some(),
            "Resolved registry credentials"
        );

        Credentials { username, password }
    }
}

/// Normalize a registry host: trim, drop the scheme and any trailing slash.
#[must_use]
pub fn normalize_registry(value: &str) -> String {
    let trimmed = value.trim();
    let trimmed = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}
