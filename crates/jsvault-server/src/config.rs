//! Server configuration.
//!
//! Every field has a working default, so `ServerConfig::new()` is a valid
//! local setup. Call [`ServerConfig::validate`] before starting a host; it
//! checks the nested configs too.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::runtime::runtime_pool::MAX_RUNTIMES;
use crate::runtime::{EngineLimits, GlobalContext};
use crate::task::{PoolConfig, RegistryConfig};

/// Top-level configuration for a jsvault server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub bind: String,
    /// Tenant whose scripts serve HTTP requests
    pub tenant: String,
    /// Group whose scripts serve HTTP requests
    pub group: String,
    /// Directory served for requests no script handles
    pub static_dir: Option<PathBuf>,
    /// Number of production runtimes serving HTTP requests in parallel
    pub engines: usize,
    pub pool: PoolConfig,
    pub registry: RegistryConfig,
    /// Limits for the production runtime
    pub limits: EngineLimits,
    /// Limits for each debug session's runtime
    pub debug_limits: EngineLimits,
    pub globals: GlobalContext,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            tenant: "default".to_string(),
            group: "default".to_string(),
            static_dir: None,
            engines: 4,
            pool: PoolConfig::default(),
            registry: RegistryConfig::default(),
            limits: EngineLimits::default(),
            debug_limits: EngineLimits::debug(),
            globals: GlobalContext::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_namespace(mut self, tenant: impl Into<String>, group: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self.group = group.into();
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn with_engines(mut self, engines: usize) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_debug_limits(mut self, limits: EngineLimits) -> Self {
        self.debug_limits = limits;
        self
    }

    pub fn with_globals(mut self, globals: GlobalContext) -> Self {
        self.globals = globals;
        self
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {}", self.bind, e))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.bind_addr()?;
        if self.tenant.trim().is_empty() {
            return Err("tenant must not be empty".to_string());
        }
        if self.group.trim().is_empty() {
            return Err("group must not be empty".to_string());
        }
        if let Some(dir) = &self.static_dir {
            if !dir.is_dir() {
                return Err(format!("static directory {} does not exist", dir.display()));
            }
        }
        if self.engines == 0 || self.engines > MAX_RUNTIMES {
            return Err(format!(
                "engines must be between 1 and {} (got {})",
                MAX_RUNTIMES, self.engines
            ));
        }
        self.pool.validate()?;
        self.registry.validate()?;
        self.limits.validate()?;
        self.debug_limits.validate()
    }
}
