//! Dispatch records delivered to listeners and the devtool.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frozen::Frozen;

/// Type-erased, shared, read-only action input.
///
/// Props are moved behind an `Arc` before the action runs, so the action, the
/// resulting event and any error record all observe the same value.
pub type Props = Arc<dyn Any + Send + Sync>;

/// Wrap a value as action props.
pub fn props<P: Any + Send + Sync>(value: P) -> Props {
    Arc::new(value)
}

/// Identifier of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable record of one completed dispatch.
///
/// Events of nested dispatches carry the id of the root dispatch in `parent`.
/// The root event carries every nested event, in completion order, in
/// `children`; those children are delivered to listeners before the root.
pub struct ScopeEvent<T> {
    /// Unique id of this dispatch.
    pub id: EventId,
    /// State the action started from.
    pub old_state: Frozen<T>,
    /// State the action returned.
    pub new_state: Frozen<T>,
    /// Scope the action ran in.
    pub scope_name: String,
    /// Store owning the scope, if any.
    pub store_name: Option<String>,
    /// Name of the dispatched action.
    pub action_name: String,
    /// Input the action received.
    pub props: Props,
    /// Root dispatch this nested dispatch happened inside of.
    pub parent: Option<EventId>,
    /// Nested dispatches that completed before this root dispatch committed.
    pub children: Vec<ScopeEvent<T>>,
    /// When the action completed.
    pub dispatched_at: DateTime<Utc>,
}

impl<T> ScopeEvent<T> {
    /// Borrow the props as `P`, if that is their type.
    pub fn props<P: Any>(&self) -> Option<&P> {
        self.props.downcast_ref::<P>()
    }

    /// Returns true if this event came from a nested dispatch.
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Convert the event (and its children) to another state representation.
    pub fn try_map_state<U, E>(
        &self,
        f: &impl Fn(&T) -> Result<U, E>,
    ) -> Result<ScopeEvent<U>, E> {
        Ok(ScopeEvent {
            id: self.id,
            old_state: Frozen::new(f(&self.old_state)?),
            new_state: Frozen::new(f(&self.new_state)?),
            scope_name: self.scope_name.clone(),
            store_name: self.store_name.clone(),
            action_name: self.action_name.clone(),
            props: Arc::clone(&self.props),
            parent: self.parent,
            children: self
                .children
                .iter()
                .map(|child| child.try_map_state(f))
                .collect::<Result<_, _>>()?,
            dispatched_at: self.dispatched_at,
        })
    }

    /// JSON view of the event, as handed to the devtool and erased listeners.
    pub fn to_value(&self) -> serde_json::Result<ScopeEvent<serde_json::Value>>
    where
        T: Serialize,
    {
        self.try_map_state(&|state: &T| serde_json::to_value(state))
    }
}

impl<T> Clone for ScopeEvent<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            old_state: self.old_state.clone(),
            new_state: self.new_state.clone(),
            scope_name: self.scope_name.clone(),
            store_name: self.store_name.clone(),
            action_name: self.action_name.clone(),
            props: Arc::clone(&self.props),
            parent: self.parent,
            children: self.children.clone(),
            dispatched_at: self.dispatched_at,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ScopeEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeEvent")
            .field("id", &self.id)
            .field("scope_name", &self.scope_name)
            .field("store_name", &self.store_name)
            .field("action_name", &self.action_name)
            .field("old_state", &self.old_state)
            .field("new_state", &self.new_state)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
