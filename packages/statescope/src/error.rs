//! Structured error types for statescope.
//!
//! Two families of failure exist:
//!
//! - [`Error`]: configuration-class failures (duplicate names, locked
//!   mutation, unknown actions, ...). Raised synchronously at the call that
//!   violates the invariant, never recovered internally.
//! - [`ScopeError`]: the record of an action or listener that failed. It
//!   carries the reason together with the state at failure time so callers can
//!   pattern match on `{reason, old_state, scope_name, action_name, props}`.
//!
//! [`DispatchError`] combines both for `dispatch`, which may be rejected up
//! front or fail inside the action.
//!
//! # Example
//!
//! ```ignore
//! match scope.dispatch("setCounter", "x".to_string()) {
//!     Ok(state) => println!("counter is now {}", *state),
//!     Err(DispatchError::Action(err)) => {
//!         eprintln!("{} failed from state {:?}: {}", err.action_name, err.old_state, err.reason);
//!     }
//!     Err(DispatchError::Rejected(err)) => eprintln!("dispatch rejected: {}", err),
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::event::Props;
use crate::frozen::Frozen;
use crate::macros::{MacroKind, MemberKind};

// =============================================================================
// Configuration Errors
// =============================================================================

/// What kind of entity a duplicate name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Store,
    Scope,
    Action,
    Macro,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::Store => write!(f, "store"),
            NameKind::Scope => write!(f, "scope"),
            NameKind::Action => write!(f, "action"),
            NameKind::Macro => write!(f, "macro"),
        }
    }
}

/// Configuration-class failures.
///
/// These represent programmer error and are not retried.
#[derive(Debug, Error)]
pub enum Error {
    /// The scope is locked; no actions or macros may be added.
    #[error("scope {scope} is locked")]
    ScopeLocked { scope: String },

    /// The store is locked; no scopes may be added.
    #[error("store {store} is locked")]
    StoreLocked { store: String },

    /// The name is already taken.
    #[error("{kind} name {name} is already in use")]
    DuplicateName { kind: NameKind, name: String },

    /// A macro name collides with an existing member of the scope.
    #[error("macro {name} collides with existing {existing} of scope {scope}")]
    ReservedName {
        scope: String,
        name: String,
        existing: MemberKind,
    },

    /// No action with this name is registered.
    #[error("scope {scope} has no action {action}")]
    UnknownAction { scope: String, action: String },

    /// No macro of this kind is registered under this name.
    #[error("scope {scope} has no {kind} macro {name}")]
    UnknownMacro {
        scope: String,
        name: String,
        kind: MacroKind,
    },

    /// A dispatch from outside the in-progress dispatch was attempted.
    #[error("scope {scope} is dispatching; cannot start {action}")]
    DispatchUnavailable { scope: String, action: String },

    /// A composition needs at least two distinct member scopes.
    #[error("composition requires at least {required} distinct scopes, got {found}")]
    InsufficientScopes { required: usize, found: usize },

    /// No scope with this name exists in the store.
    #[error("store {store} has no scope {scope}")]
    UnknownScope { store: String, scope: String },

    /// Action props were not of the type the action was registered with.
    #[error("action {action} expects props of type {expected}")]
    PropsTypeMismatch {
        action: String,
        expected: &'static str,
    },

    /// Macro arguments or result were not of the requested type.
    #[error("macro {name} expects {expected}")]
    MacroTypeMismatch { name: String, expected: &'static str },

    /// A macro returned an error.
    #[error("macro {name} of scope {scope} failed: {source}")]
    MacroFailed {
        scope: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// State could not be converted to JSON.
    #[error("state of scope {scope} could not be serialized")]
    StateSerialization {
        scope: String,
        #[source]
        source: serde_json::Error,
    },

    /// JSON could not be converted to the scope's state type.
    #[error("state for scope {scope} could not be deserialized")]
    StateDeserialization {
        scope: String,
        #[source]
        source: serde_json::Error,
    },

    /// A restore payload was not a `{scopeName: state}` object.
    #[error("restore payload must be an object keyed by scope name")]
    InvalidRestorePayload,
}

// =============================================================================
// Scope Error Record
// =============================================================================

/// Record of a failed action or listener.
///
/// For action failures `old_state` is the state the action started from; for
/// listener failures it is the committed state the listener was handed.
pub struct ScopeError<T> {
    /// Why it failed.
    pub reason: Arc<anyhow::Error>,
    /// State at failure time.
    pub old_state: Frozen<T>,
    /// Scope the failure happened in.
    pub scope_name: String,
    /// Store owning the scope, if any.
    pub store_name: Option<String>,
    /// Action being dispatched.
    pub action_name: String,
    /// Input the action received.
    pub props: Props,
}

impl<T> ScopeError<T> {
    /// Borrow the props as `P`, if that is their type.
    pub fn props<P: Any>(&self) -> Option<&P> {
        self.props.downcast_ref::<P>()
    }

    /// Downcast the failure reason.
    pub fn downcast_reason<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.reason.downcast_ref::<E>()
    }

    /// JSON view of the record, as handed to the devtool.
    pub fn to_value(&self) -> serde_json::Result<ScopeError<serde_json::Value>>
    where
        T: Serialize,
    {
        Ok(ScopeError {
            reason: Arc::clone(&self.reason),
            old_state: Frozen::new(serde_json::to_value(&*self.old_state)?),
            scope_name: self.scope_name.clone(),
            store_name: self.store_name.clone(),
            action_name: self.action_name.clone(),
            props: Arc::clone(&self.props),
        })
    }
}

impl<T> Clone for ScopeError<T> {
    fn clone(&self) -> Self {
        Self {
            reason: Arc::clone(&self.reason),
            old_state: self.old_state.clone(),
            scope_name: self.scope_name.clone(),
            store_name: self.store_name.clone(),
            action_name: self.action_name.clone(),
            props: Arc::clone(&self.props),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ScopeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeError")
            .field("reason", &self.reason)
            .field("old_state", &self.old_state)
            .field("scope_name", &self.scope_name)
            .field("store_name", &self.store_name)
            .field("action_name", &self.action_name)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for ScopeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action {} failed in scope {}: {}",
            self.action_name, self.scope_name, self.reason
        )
    }
}

impl<T: fmt::Debug> std::error::Error for ScopeError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let reason: &(dyn std::error::Error + 'static) = (*self.reason).as_ref();
        Some(reason)
    }
}

// =============================================================================
// Dispatch Error
// =============================================================================

/// Why a dispatch did not produce a new state.
pub enum DispatchError<T> {
    /// The dispatch never started (unknown action, dispatch unavailable, ...).
    Rejected(Error),
    /// The action ran and failed.
    Action(ScopeError<T>),
}

impl<T> DispatchError<T> {
    /// The action failure record, if the action ran.
    pub fn action_error(&self) -> Option<&ScopeError<T>> {
        match self {
            DispatchError::Action(err) => Some(err),
            DispatchError::Rejected(_) => None,
        }
    }

    /// The configuration error, if the dispatch was rejected.
    pub fn rejection(&self) -> Option<&Error> {
        match self {
            DispatchError::Rejected(err) => Some(err),
            DispatchError::Action(_) => None,
        }
    }

    /// JSON view of the error, as returned by erased scopes.
    pub fn into_value(self) -> DispatchError<serde_json::Value>
    where
        T: Serialize,
    {
        match self {
            DispatchError::Rejected(err) => DispatchError::Rejected(err),
            DispatchError::Action(err) => match err.to_value() {
                Ok(err) => DispatchError::Action(err),
                Err(source) => DispatchError::Rejected(Error::StateSerialization {
                    scope: err.scope_name,
                    source,
                }),
            },
        }
    }
}

impl<T> From<Error> for DispatchError<T> {
    fn from(err: Error) -> Self {
        DispatchError::Rejected(err)
    }
}

impl<T> From<ScopeError<T>> for DispatchError<T> {
    fn from(err: ScopeError<T>) -> Self {
        DispatchError::Action(err)
    }
}

impl<T: fmt::Debug> fmt::Debug for DispatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Rejected(err) => f.debug_tuple("Rejected").field(err).finish(),
            DispatchError::Action(err) => f.debug_tuple("Action").field(err).finish(),
        }
    }
}

impl<T> fmt::Display for DispatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Rejected(err) => fmt::Display::fmt(err, f),
            DispatchError::Action(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for DispatchError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Rejected(err) => std::error::Error::source(err),
            DispatchError::Action(err) => std::error::Error::source(err),
        }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
