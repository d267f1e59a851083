//! # Statescope
//!
//! An in-process, observable state container. Application state is split
//! into named **scopes**; each holds an immutable snapshot that changes only
//! through actions registered on it.
//!
//! ## Core Concepts
//!
//! - [`Scope`] = one snapshot plus the actions allowed to replace it
//! - [`Store`] = named scopes with bulk reset, restore and lock
//! - [`ComposedScope`] = a read-only aggregate of several scopes
//! - [`Registry`] = named stores sharing one [`DevTool`]
//!
//! ## Architecture
//!
//! ```text
//! Registry ──owns──▶ Store ──owns──▶ Scope<T> ◀──member── ComposedScope
//!    │                 │                │                      │
//!    └──── DevTool ────┴────────────────┴──── observes ────────┘
//!
//! dispatch(action, props)
//!     │
//!     ▼
//! middleware chain ─▶ action(state, props) ─▶ commit ─▶ listeners
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Snapshots are immutable** - readers hold [`Frozen`] handles; an action
//!    returns a new value rather than editing the old one
//! 2. **Actions are the only writers** - `state` changes only through a
//!    registered action or the builtin `reset` / `restore`
//! 3. **One dispatch at a time** - nested dispatches from the running action
//!    are buffered as children; dispatches from elsewhere are rejected
//! 4. **Locks are one-way** - a locked scope or store never accepts new
//!    actions, macros or scopes again
//! 5. **Listeners cannot veto** - they run after commit and their failures
//!    are isolated and reported
//!
//! ## Example
//!
//! ```ignore
//! use statescope::{Registry, ScopeConfig, StoreConfig};
//!
//! let registry = Registry::new();
//! let store = registry.create_store(StoreConfig::new().with_name("app"))?;
//! let counter = store.create_scope(ScopeConfig::new(0_i64).with_name("counter"), false)?;
//!
//! let increment = counter.register_action("increment", |count: &i64, _: &()| Ok(count + 1))?;
//! counter.subscribe(|event| {
//!     tracing::info!(from = *event.old_state, to = *event.new_state, "counter changed");
//!     Ok(())
//! }, &["increment"])?;
//!
//! increment.dispatch(())?;
//! assert_eq!(registry.get_state()?, serde_json::json!({ "app": { "counter": 1 } }));
//! ```

// Core modules
mod compose;
mod config;
mod devtool;
mod erased;
mod error;
mod event;
mod frozen;
mod id;
mod listener;
mod macros;
mod middleware;
mod registry;
mod scope;
mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export scope types
pub use scope::{Dispatcher, Scope, State, WeakScope, RESET_ACTION, RESTORE_ACTION};

// Re-export composition and the erased view
pub use compose::{ComposedScope, MIN_MEMBERS};
pub use erased::ErasedScope;

// Re-export store and registry types
pub use registry::Registry;
pub use store::Store;

// Re-export configuration
pub use config::{
    ScopeConfig, ScopeOptions, StoreConfig, IMMUTABILITY_ENV, SUBSCRIBED_MACROS_ENV,
};

// Re-export events, snapshots and listeners
pub use event::{props, EventId, Props, ScopeEvent};
pub use frozen::{freeze, Frozen};
pub use listener::{listener, Listener, Subscription};

// Re-export error types
pub use error::{DispatchError, Error, NameKind, ScopeError};

// Re-export macro and middleware types
pub use macros::{
    is_reserved, subscription_macro_name, MacroFn, MacroKind, MemberKind, RESERVED_FUNCTIONS,
    RESERVED_GETTERS,
};
pub use middleware::{from_fn, ActionContext, ActionFn, Middleware, Next, TracingMiddleware};

// Re-export devtool types
pub use devtool::{
    DevTool, DevToolHandlers, Handler, ScopeChange, ScopeChangeKind, ScopeCreated, StoreChange,
    StoreChangeKind, StoreCreated,
};

// Re-export id generation
pub use id::{IdGenerator, COMPOSITION_PREFIX, LISTENER_PREFIX, SCOPE_PREFIX, STORE_PREFIX};
