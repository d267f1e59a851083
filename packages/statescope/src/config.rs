//! Scope and store construction options.

use std::env;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::devtool::DevTool;
use crate::middleware::Middleware;
use crate::scope::State;

/// Environment variable overriding [`ScopeOptions::is_immutability_enabled`].
pub const IMMUTABILITY_ENV: &str = "STATESCOPE_IMMUTABILITY";

/// Environment variable overriding
/// [`ScopeOptions::is_subscribed_macro_auto_create_enabled`].
pub const SUBSCRIBED_MACROS_ENV: &str = "STATESCOPE_SUBSCRIBED_MACROS";

/// Behaviour flags fixed when a scope is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    /// `None` inherits the owning store's `is_frozen` setting.
    pub is_immutability_enabled: Option<bool>,
    /// Register an `on<Action>` subscription macro for every action.
    pub is_subscribed_macro_auto_create_enabled: bool,
}

impl ScopeOptions {
    /// Load options from environment variables. Unset variables keep defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            is_immutability_enabled: env_flag(IMMUTABILITY_ENV)?,
            is_subscribed_macro_auto_create_enabled: env_flag(SUBSCRIBED_MACROS_ENV)?
                .unwrap_or(false),
        })
    }
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<bool>()
            .map(Some)
            .with_context(|| format!("{key} must be true or false")),
        Err(_) => Ok(None),
    }
}

/// Everything needed to create a scope.
pub struct ScopeConfig<T: State> {
    /// Generated when absent.
    pub name: Option<String>,
    pub initial_state: T,
    pub options: ScopeOptions,
    /// First entry runs outermost.
    pub middleware: Vec<Arc<dyn Middleware<T>>>,
    /// Overrides the devtool inherited from the store.
    pub dev_tool: Option<Arc<DevTool>>,
}

impl<T: State> ScopeConfig<T> {
    pub fn new(initial_state: T) -> Self {
        Self {
            name: None,
            initial_state,
            options: ScopeOptions::default(),
            middleware: Vec::new(),
            dev_tool: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: ScopeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_immutability(mut self, enabled: bool) -> Self {
        self.options.is_immutability_enabled = Some(enabled);
        self
    }

    pub fn with_subscribed_macro_auto_create(mut self, enabled: bool) -> Self {
        self.options.is_subscribed_macro_auto_create_enabled = enabled;
        self
    }

    /// Append a middleware; it runs inside every middleware added before it.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_dev_tool(mut self, dev_tool: Arc<DevTool>) -> Self {
        self.dev_tool = Some(dev_tool);
        self
    }
}

impl<T: State> fmt::Debug for ScopeConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("options", &self.options)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// Options for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Generated when absent.
    pub name: Option<String>,
    /// Default immutability for scopes that do not set it themselves.
    pub is_frozen: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            is_frozen: true,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_frozen(mut self, is_frozen: bool) -> Self {
        self.is_frozen = is_frozen;
        self
    }
}
