//! Host startup sequence.
//!
//! ```text
//! Bootstrap (populating) --finish()--> Serve (populated) --bind(uri)--> SessionHost
//! ```
//!
//! Registration is only reachable on [`Bootstrap`] and resolution only on
//! [`Serve`], so a host cannot resolve a URI against a registry that is still
//! being filled.

use std::sync::Arc;

use crate::error::Result;
use crate::registry::{FactoryArgs, RegistryBuilder, ServiceRegistry, SessionServiceFactory};
use crate::sessions::SessionService;

/// Populating phase: backends may still be registered.
pub struct Bootstrap {
    builder: RegistryBuilder,
    args: FactoryArgs,
}

impl Bootstrap {
    /// Start with no backends registered.
    pub fn empty() -> Self {
        Self {
            builder: RegistryBuilder::new(),
            args: FactoryArgs::new(),
        }
    }

    /// Start with the built-in `memory`, `redis`, `rediss` and `sqlite` backends.
    pub fn new() -> Self {
        Self {
            builder: RegistryBuilder::with_default_backends(),
            args: FactoryArgs::new(),
        }
    }

    pub fn register(mut self, scheme: &str, factory: SessionServiceFactory) -> Self {
        self.builder.register(scheme, factory);
        self
    }

    /// Argument passed to every factory at bind time.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(key, value);
        self
    }

    pub fn with_args(mut self, args: FactoryArgs) -> Self {
        self.args = args;
        self
    }

    /// Freeze the registry. Fails on an invalid scheme.
    pub fn finish(self) -> Result<Serve> {
        Ok(Serve {
            registry: self.builder.build()?,
            args: self.args,
        })
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

/// Populated phase: the registry is frozen and can resolve URIs.
pub struct Serve {
    registry: ServiceRegistry,
    args: FactoryArgs,
}

impl Serve {
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Resolve `uri` once and hand back the running host.
    pub fn bind(self, uri: &str) -> Result<SessionHost> {
        let service = self.registry.resolve(uri, &self.args)?;
        tracing::info!(backend = service.name(), "session store ready");
        Ok(SessionHost {
            registry: self.registry,
            service,
            uri: uri.trim().to_string(),
        })
    }
}

/// The selected backend, shared for the lifetime of the process.
pub struct SessionHost {
    registry: ServiceRegistry,
    service: Arc<dyn SessionService>,
    uri: String,
}

impl SessionHost {
    pub fn service(&self) -> Arc<dyn SessionService> {
        Arc::clone(&self.service)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}
