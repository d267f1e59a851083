//! JSON-typed view of a scope.
//!
//! Stores and compositions hold scopes of many state types side by side. They
//! talk to them through [`ErasedScope`], which exchanges state as
//! `serde_json::Value`; the typed handle is recovered with
//! [`ErasedScope::as_any`].

use std::any::Any;

use serde_json::Value;

use crate::error::{DispatchError, Error};
use crate::event::{props, Props, ScopeEvent};
use crate::listener::{Listener, Subscription};
use crate::scope::{Scope, State, RESET_ACTION, RESTORE_ACTION};

/// A scope of any state type.
pub trait ErasedScope: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn store_name(&self) -> Option<&str>;

    fn is_locked(&self) -> bool;

    fn is_composition(&self) -> bool {
        false
    }

    fn lock(&self);

    fn support_actions(&self) -> Vec<String>;

    fn supports_action(&self, name: &str) -> bool;

    /// Current state as JSON.
    fn state_value(&self) -> Result<Value, Error>;

    /// Dispatch and return the new state as JSON.
    fn dispatch_value(
        &self,
        action_name: &str,
        props: Props,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>>;

    /// Subscribe a listener that receives JSON-typed events.
    fn subscribe_value(
        &self,
        listener: Listener<Value>,
        action_names: &[&str],
    ) -> Result<Subscription, Error>;

    fn unsubscribe(&self, listener_id: &str) -> bool;

    fn reset_value(&self, emit_event: bool) -> Result<Value, DispatchError<Value>> {
        self.dispatch_value(RESET_ACTION, props(()), emit_event)
    }

    /// Restore from JSON.
    fn restore_value(&self, state: Value, emit_event: bool) -> Result<Value, DispatchError<Value>>;

    fn as_any(&self) -> &dyn Any;
}

fn to_json<T: State>(scope: &str, state: &T) -> Result<Value, Error> {
    serde_json::to_value(state).map_err(|source| Error::StateSerialization {
        scope: scope.to_string(),
        source,
    })
}

impl<T: State> ErasedScope for Scope<T> {
    fn name(&self) -> &str {
        Scope::name(self)
    }

    fn store_name(&self) -> Option<&str> {
        Scope::store_name(self)
    }

    fn is_locked(&self) -> bool {
        Scope::is_locked(self)
    }

    fn lock(&self) {
        Scope::lock(self)
    }

    fn support_actions(&self) -> Vec<String> {
        Scope::support_actions(self)
    }

    fn supports_action(&self, name: &str) -> bool {
        Scope::supports_action(self, name)
    }

    fn state_value(&self) -> Result<Value, Error> {
        to_json(Scope::name(self), &*self.state())
    }

    fn dispatch_value(
        &self,
        action_name: &str,
        props: Props,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>> {
        let state = self
            .dispatch_props(action_name, props, emit_event)
            .map_err(DispatchError::into_value)?;
        Ok(to_json(Scope::name(self), &*state)?)
    }

    fn subscribe_value(
        &self,
        listener: Listener<Value>,
        action_names: &[&str],
    ) -> Result<Subscription, Error> {
        self.subscribe(
            move |event: &ScopeEvent<T>| listener(&event.to_value()?),
            action_names,
        )
    }

    fn unsubscribe(&self, listener_id: &str) -> bool {
        Scope::unsubscribe(self, listener_id)
    }

    fn restore_value(&self, state: Value, emit_event: bool) -> Result<Value, DispatchError<Value>> {
        let state: T = serde_json::from_value(state).map_err(|source| Error::StateDeserialization {
            scope: Scope::name(self).to_string(),
            source,
        })?;
        self.dispatch_value(RESTORE_ACTION, props(state), emit_event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for dyn ErasedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedScope")
            .field("name", &self.name())
            .field("store_name", &self.store_name())
            .field("is_composition", &self.is_composition())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn point_scope() -> Scope<Point> {
        let scope = Scope::new(ScopeConfig::new(Point { x: 0, y: 0 }).with_name("point"));
        scope
            .register_action("moveBy", |p: &Point, d: &(i32, i32)| {
                Ok(Point {
                    x: p.x + d.0,
                    y: p.y + d.1,
                })
            })
            .unwrap();
        scope
    }

    #[test]
    fn test_dispatch_value_returns_json() {
        let erased = point_scope().erased();
        let state = erased
            .dispatch_value("moveBy", props((2, 3)), true)
            .unwrap();
        assert_eq!(state, serde_json::json!({ "x": 2, "y": 3 }));
        assert_eq!(erased.state_value().unwrap(), state);
    }

    #[test]
    fn test_restore_value_deserializes() {
        let scope = point_scope();
        let erased = scope.erased();
        erased
            .restore_value(serde_json::json!({ "x": 5, "y": -1 }), true)
            .unwrap();
        assert_eq!(*scope.state(), Point { x: 5, y: -1 });

        let err = erased
            .restore_value(serde_json::json!("nowhere"), true)
            .unwrap_err();
        assert!(matches!(
            err.rejection(),
            Some(Error::StateDeserialization { .. })
        ));

        assert_eq!(erased.reset_value(true).unwrap(), serde_json::json!({ "x": 5, "y": -1 }));
    }

    #[test]
    fn test_action_failure_keeps_json_record() {
        let scope = point_scope();
        scope
            .register_action("fail", |_: &Point, _: &()| -> anyhow::Result<Point> {
                anyhow::bail!("off the map")
            })
            .unwrap();
        let err = scope
            .erased()
            .dispatch_value("fail", props(()), true)
            .unwrap_err();
        let record = err.action_error().unwrap();
        assert_eq!(*record.old_state, serde_json::json!({ "x": 0, "y": 0 }));
    }

    #[test]
    fn test_subscribe_value_receives_json_events() {
        let scope = point_scope();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scope
            .erased()
            .subscribe_value(
                crate::listener::listener(move |event: &ScopeEvent<Value>| {
                    sink.lock().unwrap().push((*event.new_state).clone());
                    Ok(())
                }),
                &["moveBy"],
            )
            .unwrap();

        scope.dispatch("moveBy", (1, 1)).unwrap();
        scope.reset().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({ "x": 1, "y": 1 })]);
    }

    #[test]
    fn test_as_any_recovers_typed_handle() {
        let scope = point_scope();
        let erased = scope.erased();
        let typed = erased.as_any().downcast_ref::<Scope<Point>>().unwrap();
        assert!(Scope::ptr_eq(typed, &scope));
        assert!(erased.as_any().downcast_ref::<Scope<i64>>().is_none());
    }
}
