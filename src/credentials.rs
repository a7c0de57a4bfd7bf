use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A registry password or token. Formatting never shows the value, only its length.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Auth material for one registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredential {
    Basic {
        username: String,
        password: SecretString,
    },
    Bearer(SecretString),
}

impl RegistryCredential {
    pub fn from_parts(username: Option<String>, token: SecretString) -> Self {
        match username {
            Some(username) if !username.is_empty() => RegistryCredential::Basic {
                username,
                password: token,
            },
            _ => RegistryCredential::Bearer(token),
        }
    }
}

/// Supplies the credential to use for a registry host, if any.
pub trait CredentialSource: Send + Sync {
    fn credential_for(&self, registry: &str) -> Option<RegistryCredential>;
}

/// Credentials fixed at startup, keyed by registry hostname.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    by_host: HashMap<String, RegistryCredential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: impl Into<String>, credential: RegistryCredential) {
        self.by_host
            .insert(registry.into().to_ascii_lowercase(), credential);
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }
}

impl CredentialSource for StaticCredentials {
    fn credential_for(&self, registry: &str) -> Option<RegistryCredential> {
        self.by_host.get(&registry.to_ascii_lowercase()).cloned()
    }
}
