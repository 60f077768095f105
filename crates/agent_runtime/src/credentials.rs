use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::lock_unpoisoned;

pub const OPENROUTER_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const ANTHROPIC_TOKEN_ENV: &str = "ANTHROPIC_AUTH_TOKEN";
/// Name of the API key inside a saved credential store.
pub const SAVED_KEY_NAME: &str = "openrouter_api_key";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store '{store}' is read-only")]
    ReadOnly { store: &'static str },

    #[error("credential value cannot be empty")]
    EmptyValue,

    #[error("credential store '{store}' failed: {message}")]
    Backend {
        store: &'static str,
        message: String,
    },
}

/// Secret storage backend.
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, name: &str, value: &str) -> Result<(), CredentialError>;
    /// Returns whether a value was removed.
    fn delete(&self, name: &str) -> Result<bool, CredentialError>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Read-only view of environment variables.
pub struct EnvCredentialStore {
    lookup: Lookup,
}

impl EnvCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        Ok((self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    fn set(&self, _name: &str, _value: &str) -> Result<(), CredentialError> {
        Err(CredentialError::ReadOnly { store: "env" })
    }

    fn delete(&self, _name: &str) -> Result<bool, CredentialError> {
        Err(CredentialError::ReadOnly { store: "env" })
    }
}

/// In-process store; values live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn with_value(name: &str, value: &str) -> Self {
        let store = Self::default();
        lock_unpoisoned(&store.values).insert(name.to_string(), value.to_string());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        Ok(lock_unpoisoned(&self.values).get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        lock_unpoisoned(&self.values).insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, CredentialError> {
        Ok(lock_unpoisoned(&self.values).remove(name).is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Env,
    Saved,
    None,
}

impl CredentialSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Saved => "saved",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStatus {
    pub has_key: bool,
    pub source: CredentialSource,
    pub masked_key: String,
}

/// API key resolution: environment first, then the saved store.
pub struct Credentials {
    env: Box<dyn CredentialStore>,
    saved: Box<dyn CredentialStore>,
}

impl Credentials {
    #[must_use]
    pub fn new(env: impl CredentialStore + 'static, saved: impl CredentialStore + 'static) -> Self {
        Self {
            env: Box::new(env),
            saved: Box::new(saved),
        }
    }

    /// Process environment plus an empty in-memory saved store.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(EnvCredentialStore::new(), MemoryCredentialStore::default())
    }

    /// A fixed key, or none, ignoring the process environment.
    #[must_use]
    pub fn fixed(key: Option<&str>) -> Self {
        let saved = match key {
            Some(key) => MemoryCredentialStore::with_value(SAVED_KEY_NAME, key),
            None => MemoryCredentialStore::default(),
        };
        Self::new(EnvCredentialStore::from_lookup(|_| None), saved)
    }

    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.resolve().map(|(key, _)| key)
    }

    #[must_use]
    pub fn has_key(&self) -> bool {
        self.resolve().is_some()
    }

    #[must_use]
    pub fn status(&self) -> CredentialStatus {
        match self.resolve() {
            Some((key, source)) => CredentialStatus {
                has_key: true,
                source,
                masked_key: mask_key(&key),
            },
            None => CredentialStatus {
                has_key: false,
                source: CredentialSource::None,
                masked_key: String::new(),
            },
        }
    }

    pub fn save_key(&self, key: &str) -> Result<(), CredentialError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CredentialError::EmptyValue);
        }
        self.saved.set(SAVED_KEY_NAME, key)
    }

    pub fn clear_saved_key(&self) -> Result<bool, CredentialError> {
        self.saved.delete(SAVED_KEY_NAME)
    }

    /// Replaces any occurrence of the active key in `text`.
    #[must_use]
    pub fn scrub(&self, text: &str) -> String {
        match self.api_key() {
            Some(key) => text.replace(&key, "***"),
            None => text.to_string(),
        }
    }

    fn resolve(&self) -> Option<(String, CredentialSource)> {
        for name in [OPENROUTER_KEY_ENV, ANTHROPIC_TOKEN_ENV] {
            if let Some(key) = read(self.env.as_ref(), name) {
                return Some((key, CredentialSource::Env));
            }
        }
        read(self.saved.as_ref(), SAVED_KEY_NAME).map(|key| (key, CredentialSource::Saved))
    }
}

fn read(store: &dyn CredentialStore, name: &str) -> Option<String> {
    match store.get(name) {
        Ok(value) => value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        Err(error) => {
            tracing::warn!(target: "mol_agent", name, error = %error, "credential lookup failed");
            None
        }
    }
}

/// `****` plus the last four characters; short keys are fully masked.
#[must_use]
pub fn mask_key(key: &str) -> String {
    let key = key.trim();
    let count = key.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 4 {
        return "****".to_string();
    }
    let suffix = key.chars().skip(count - 4).collect::<String>();
    format!("****{suffix}")
}
