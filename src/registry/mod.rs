//! Service registry: maps URI schemes to backend factories.
//!
//! A [`RegistryBuilder`] collects factories; [`RegistryBuilder::build`]
//! validates them and yields an immutable [`ServiceRegistry`]. There is no
//! process-wide instance; hosts own the registry and pass it around.

pub mod factories;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Result, SessionError};
use crate::sessions::SessionService;

pub use factories::{memory_factory, redis_factory, sqlite_factory};

/// Turns a connection URI plus host arguments into a ready backend.
///
/// Factories must not perform I/O; connections are opened lazily.
pub type SessionServiceFactory =
    Arc<dyn Fn(&str, &FactoryArgs) -> Result<Arc<dyn SessionService>> + Send + Sync>;

/// Host-injected factory arguments (`working_dir`, `ttl_secs`, `timeout_ms`).
///
/// Factories read the keys they understand and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryArgs {
    values: BTreeMap<String, String>,
}

impl FactoryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse `key` as an unsigned integer. Absent keys yield `None`.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|raw| parse_u64(key, raw))
            .transpose()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|_| {
        SessionError::Configuration(format!("'{key}' must be a non-negative integer, got '{raw}'"))
    })
}

/// Extract and lowercase the scheme of `uri` (the part before `://`).
pub fn uri_scheme(uri: &str) -> Result<String> {
    let Some((scheme, _)) = uri.trim().split_once("://") else {
        return Err(SessionError::Configuration(format!(
            "session store URI '{uri}' has no scheme (expected scheme://...)"
        )));
    };
    let scheme = scheme.to_ascii_lowercase();
    if !is_valid_scheme(&scheme) {
        return Err(SessionError::Configuration(format!(
            "session store URI '{uri}' has an invalid scheme '{scheme}'"
        )));
    }
    Ok(scheme)
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}

/// Collects scheme registrations before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    factories: HashMap<String, SessionServiceFactory>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with `memory`, `redis`, `rediss` and `sqlite`.
    pub fn with_default_backends() -> Self {
        let mut builder = Self::new();
        builder.register("memory", Arc::new(memory_factory));
        builder.register("redis", Arc::new(redis_factory));
        builder.register("rediss", Arc::new(redis_factory));
        builder.register("sqlite", Arc::new(sqlite_factory));
        builder
    }

    /// Insert or replace the factory for `scheme`. Last registration wins.
    pub fn register(&mut self, scheme: &str, factory: SessionServiceFactory) -> &mut Self {
        let scheme = scheme.trim().to_ascii_lowercase();
        if self.factories.insert(scheme.clone(), factory).is_some() {
            tracing::debug!(scheme = %scheme, "session backend factory replaced");
        }
        self
    }

    pub fn build(self) -> Result<ServiceRegistry> {
        if let Some(bad) = self.factories.keys().find(|s| !is_valid_scheme(s)) {
            return Err(SessionError::Configuration(format!(
                "invalid session backend scheme '{bad}': expected [a-z][a-z0-9+.-]*"
            )));
        }
        Ok(ServiceRegistry {
            factories: self.factories,
        })
    }
}

/// Frozen scheme → factory table.
#[derive(Clone)]
pub struct ServiceRegistry {
    factories: HashMap<String, SessionServiceFactory>,
}

impl ServiceRegistry {
    /// Resolve `uri` to a backend using the factory registered for its scheme.
    pub fn resolve(&self, uri: &str, args: &FactoryArgs) -> Result<Arc<dyn SessionService>> {
        let scheme = uri_scheme(uri)?;
        let Some(factory) = self.factories.get(&scheme) else {
            return Err(SessionError::Configuration(format!(
                "no session backend registered for scheme '{scheme}'. Registered schemes: {}",
                self.schemes().join(", ")
            )));
        };
        let service = factory(uri.trim(), args)?;
        tracing::debug!(scheme = %scheme, backend = service.name(), "session backend resolved");
        Ok(service)
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }
}
