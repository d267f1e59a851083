//! DevTool hook - observe the engine without steering it.
//!
//! A [`DevTool`] is a set of replaceable callback slots the engine calls into
//! on lifecycle events. It is a passive observer: handlers run synchronously,
//! only when installed, and are never consulted for control decisions.
//!
//! The hook is an explicit dependency. A [`Registry`](crate::Registry) owns one
//! and hands it to every store it creates, and stores hand it to their scopes,
//! so independent registries (for example in tests) never interfere.
//!
//! # Merging
//!
//! [`DevTool::set`] merges a partial [`DevToolHandlers`]: supplied slots
//! replace the previous handler, omitted slots keep theirs (a no-op by
//! default).
//!
//! ```ignore
//! registry.set_store_dev_tool(
//!     DevToolHandlers::new()
//!         .on_action(|event| println!("{} -> {}", event.action_name, event.new_state))
//!         .on_action_error(|err| eprintln!("{}", err)),
//! );
//! ```
//!
//! Payloads are JSON-typed, so one hook can observe scopes of every state type.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::{panic_message, ScopeError};
use crate::event::ScopeEvent;
use crate::macros::MacroKind;

// =============================================================================
// Payloads
// =============================================================================

/// A store was created.
#[derive(Debug, Clone, Serialize)]
pub struct StoreCreated {
    pub store_name: String,
    pub is_frozen: bool,
}

/// A store-level change.
#[derive(Debug, Clone, Serialize)]
pub struct StoreChange {
    pub store_name: String,
    pub kind: StoreChangeKind,
}

/// What changed at store level.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreChangeKind {
    CreateScope { scope_name: String },
    Lock,
    Reset,
    Restore {
        restored: Vec<String>,
        pending: Vec<String>,
    },
}

/// A scope (or composition scope) was created.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeCreated {
    pub store_name: Option<String>,
    pub scope_name: String,
    pub state: Value,
    pub is_composition: bool,
    pub is_immutability_enabled: bool,
    pub is_subscribed_macro_auto_create_enabled: bool,
}

/// A scope-level change.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeChange {
    pub store_name: Option<String>,
    pub scope_name: String,
    pub kind: ScopeChangeKind,
}

/// What changed at scope level.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeChangeKind {
    RegisterAction { action_name: String },
    RegisterMacro { macro_name: String, kind: MacroKind },
    Lock,
}

// =============================================================================
// Handlers
// =============================================================================

/// A devtool callback.
pub type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Partial set of devtool callbacks.
///
/// Built with the `on_*` methods; every slot left empty keeps its previous
/// behaviour when merged with [`DevTool::set`].
#[derive(Clone, Default)]
pub struct DevToolHandlers {
    pub on_create_store: Option<Handler<StoreCreated>>,
    pub on_change_store: Option<Handler<StoreChange>>,
    pub on_create_scope: Option<Handler<ScopeCreated>>,
    pub on_change_scope: Option<Handler<ScopeChange>>,
    pub on_action: Option<Handler<ScopeEvent<Value>>>,
    pub on_action_error: Option<Handler<ScopeError<Value>>>,
    pub on_action_listener_error: Option<Handler<ScopeError<Value>>>,
}

impl DevToolHandlers {
    /// Create an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create_store(mut self, f: impl Fn(&StoreCreated) + Send + Sync + 'static) -> Self {
        self.on_create_store = Some(Arc::new(f));
        self
    }

    pub fn on_change_store(mut self, f: impl Fn(&StoreChange) + Send + Sync + 'static) -> Self {
        self.on_change_store = Some(Arc::new(f));
        self
    }

    pub fn on_create_scope(mut self, f: impl Fn(&ScopeCreated) + Send + Sync + 'static) -> Self {
        self.on_create_scope = Some(Arc::new(f));
        self
    }

    pub fn on_change_scope(mut self, f: impl Fn(&ScopeChange) + Send + Sync + 'static) -> Self {
        self.on_change_scope = Some(Arc::new(f));
        self
    }

    pub fn on_action(mut self, f: impl Fn(&ScopeEvent<Value>) + Send + Sync + 'static) -> Self {
        self.on_action = Some(Arc::new(f));
        self
    }

    pub fn on_action_error(
        mut self,
        f: impl Fn(&ScopeError<Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_action_error = Some(Arc::new(f));
        self
    }

    pub fn on_action_listener_error(
        mut self,
        f: impl Fn(&ScopeError<Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_action_listener_error = Some(Arc::new(f));
        self
    }

    /// Overwrite the slots `partial` supplies.
    fn merge(&mut self, partial: DevToolHandlers) {
        let DevToolHandlers {
            on_create_store,
            on_change_store,
            on_create_scope,
            on_change_scope,
            on_action,
            on_action_error,
            on_action_listener_error,
        } = partial;

        if on_create_store.is_some() {
            self.on_create_store = on_create_store;
        }
        if on_change_store.is_some() {
            self.on_change_store = on_change_store;
        }
        if on_create_scope.is_some() {
            self.on_create_scope = on_create_scope;
        }
        if on_change_scope.is_some() {
            self.on_change_scope = on_change_scope;
        }
        if on_action.is_some() {
            self.on_action = on_action;
        }
        if on_action_error.is_some() {
            self.on_action_error = on_action_error;
        }
        if on_action_listener_error.is_some() {
            self.on_action_listener_error = on_action_listener_error;
        }
    }

    pub(crate) fn installed(&self) -> usize {
        [
            self.on_create_store.is_some(),
            self.on_change_store.is_some(),
            self.on_create_scope.is_some(),
            self.on_change_scope.is_some(),
            self.on_action.is_some(),
            self.on_action_error.is_some(),
            self.on_action_listener_error.is_some(),
        ]
        .into_iter()
        .filter(|installed| *installed)
        .count()
    }
}

impl std::fmt::Debug for DevToolHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevToolHandlers")
            .field("installed", &self.installed())
            .finish()
    }
}

// =============================================================================
// DevTool
// =============================================================================

/// Replaceable set of observer callbacks invoked by the engine.
#[derive(Debug, Default)]
pub struct DevTool {
    handlers: RwLock<DevToolHandlers>,
}

impl DevTool {
    /// Create a devtool with every slot a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared devtool with the given handlers installed.
    pub fn with_handlers(handlers: DevToolHandlers) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(handlers),
        })
    }

    /// Merge `partial` into the installed handlers.
    pub fn set(&self, partial: DevToolHandlers) {
        self.write().merge(partial);
    }

    /// Reset every slot to a no-op.
    pub fn clear(&self) {
        *self.write() = DevToolHandlers::default();
    }

    /// Number of installed handler slots.
    pub fn installed(&self) -> usize {
        self.read().installed()
    }

    // Handlers are cloned out of the lock before they run, so a handler may
    // itself call `set` without deadlocking.

    fn read(&self) -> RwLockReadGuard<'_, DevToolHandlers> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DevToolHandlers> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot<A>(&self, pick: impl FnOnce(&DevToolHandlers) -> Option<Handler<A>>) -> Option<Handler<A>> {
        pick(&*self.read())
    }

    fn invoke<A>(hook: &'static str, handler: Handler<A>, payload: &A) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            error!(hook, panic = %panic_message(panic.as_ref()), "devtool handler panicked");
        }
    }

    pub(crate) fn create_store(&self, payload: impl FnOnce() -> StoreCreated) {
        if let Some(handler) = self.slot(|h| h.on_create_store.clone()) {
            Self::invoke("on_create_store", handler, &payload());
        }
    }

    pub(crate) fn change_store(&self, payload: impl FnOnce() -> StoreChange) {
        if let Some(handler) = self.slot(|h| h.on_change_store.clone()) {
            Self::invoke("on_change_store", handler, &payload());
        }
    }

    pub(crate) fn create_scope(&self, payload: impl FnOnce() -> Option<ScopeCreated>) {
        if let Some(handler) = self.slot(|h| h.on_create_scope.clone()) {
            if let Some(payload) = payload() {
                Self::invoke("on_create_scope", handler, &payload);
            }
        }
    }

    pub(crate) fn change_scope(&self, payload: impl FnOnce() -> ScopeChange) {
        if let Some(handler) = self.slot(|h| h.on_change_scope.clone()) {
            Self::invoke("on_change_scope", handler, &payload());
        }
    }

    pub(crate) fn action<T: Serialize>(&self, event: &ScopeEvent<T>) {
        let Some(handler) = self.slot(|h| h.on_action.clone()) else {
            return;
        };
        match event.to_value() {
            Ok(event) => Self::invoke("on_action", handler, &event),
            Err(e) => warn!(
                scope = %event.scope_name,
                action = %event.action_name,
                error = %e,
                "devtool payload could not be serialized"
            ),
        }
    }

    pub(crate) fn action_error<T: Serialize>(&self, err: &ScopeError<T>) {
        if let Some(handler) = self.slot(|h| h.on_action_error.clone()) {
            Self::report("on_action_error", handler, err);
        }
    }

    pub(crate) fn listener_error<T: Serialize>(&self, err: &ScopeError<T>) {
        if let Some(handler) = self.slot(|h| h.on_action_listener_error.clone()) {
            Self::report("on_action_listener_error", handler, err);
        }
    }

    fn report<T: Serialize>(hook: &'static str, handler: Handler<ScopeError<Value>>, err: &ScopeError<T>) {
        match err.to_value() {
            Ok(err) => Self::invoke(hook, handler, &err),
            Err(e) => warn!(
                scope = %err.scope_name,
                action = %err.action_name,
                error = %e,
                "devtool payload could not be serialized"
            ),
        }
    }
}
