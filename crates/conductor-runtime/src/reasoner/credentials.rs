//! Secure credential handling for reasoner backends.
//!
//! API keys are wrapped the moment they enter the process:
//!
//! - **No accidental logging**: Debug output shows `[REDACTED]`
//! - **Memory safety**: the value is zeroed on drop via the `secrecy` crate
//! - **Explicit exposure**: `.expose()` is the only way to read the value

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use super::ReasonerError;

/// A securely-stored API credential.
pub struct ApiCredential {
    value: SecretString,
    name: &'static str,
}

impl ApiCredential {
    /// Wrap a key provided programmatically.
    ///
    /// `name` is the human-readable label used in error messages, never the
    /// value itself.
    pub fn new(value: impl Into<String>, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            name,
        }
    }

    /// Load a credential from an environment variable.
    ///
    /// The variable's value is wrapped immediately and never logged.
    pub fn from_env(env_var: &str, name: &'static str) -> Result<Self, ReasonerError> {
        std::env::var(env_var)
            .map(|v| Self::new(v, name))
            .map_err(|_| {
                ReasonerError::NotConfigured(format!(
                    "{} not set: configure '{}' environment variable",
                    name, env_var
                ))
            })
    }

    /// Expose the raw value at the point of use (an HTTP header, typically).
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// True when the stored value is empty.
    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}
