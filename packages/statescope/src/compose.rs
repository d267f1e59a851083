//! Composition - one derived scope over several independently owned scopes.
//!
//! A [`ComposedScope`] presents its members' states as one JSON object keyed
//! by member name and exposes the union of their actions. It is locked from
//! construction, and it locks every member, so its action surface never
//! changes.
//!
//! ```text
//!              ┌──────────── ComposedScope "cart+user" ────────────┐
//!  dispatch ──▶│ forward to every member supporting the action     │
//!              │   cart.dispatch(...)   user.dispatch(...)         │
//!              └──────────────┬──────────────────────┬─────────────┘
//!                   member events re-published with aggregate state
//! ```
//!
//! Member events are re-published to the composition's own listeners with
//! `new_state` set to the full aggregate and `old_state` set to the aggregate
//! with the firing member's previous state substituted in.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::devtool::{DevTool, ScopeCreated};
use crate::erased::ErasedScope;
use crate::error::{DispatchError, Error, ScopeError};
use crate::event::{EventId, Props, ScopeEvent};
use crate::frozen::freeze;
use crate::id::{IdGenerator, COMPOSITION_PREFIX};
use crate::listener::{listener, Listener, ListenerSet, Subscription, Unsubscribe};
use crate::scope::{RESET_ACTION, RESTORE_ACTION};

/// Fewest distinct members a composition accepts.
pub const MIN_MEMBERS: usize = 2;

struct ComposedInner {
    name: String,
    store_name: Option<String>,
    members: Vec<Arc<dyn ErasedScope>>,
    actions: Vec<String>,
    listeners: Arc<ListenerSet<Value>>,
    member_subscriptions: Mutex<Vec<Subscription>>,
    dev_tool: Arc<DevTool>,
}

impl ComposedInner {
    fn aggregate(&self) -> Result<Value, Error> {
        let mut states = Map::new();
        for member in &self.members {
            states.insert(member.name().to_string(), member.state_value()?);
        }
        Ok(Value::Object(states))
    }

    fn republish(&self, member: usize, event: &ScopeEvent<Value>) -> anyhow::Result<()> {
        let new_state = self.aggregate()?;
        let mut old_state = new_state.clone();
        if let Value::Object(states) = &mut old_state {
            states.insert(
                self.members[member].name().to_string(),
                (*event.old_state).clone(),
            );
        }

        let event = ScopeEvent {
            id: EventId::new(),
            old_state: freeze(old_state),
            new_state: freeze(new_state),
            scope_name: self.name.clone(),
            store_name: self.store_name.clone(),
            action_name: event.action_name.clone(),
            props: Arc::clone(&event.props),
            parent: event.parent,
            children: Vec::new(),
            dispatched_at: event.dispatched_at,
        };

        self.listeners.notify(&event, |listener_id, reason| {
            warn!(
                scope = %self.name,
                action = %event.action_name,
                listener = %listener_id,
                error = %reason,
                "listener failed"
            );
            self.dev_tool.listener_error(&ScopeError {
                reason: Arc::new(reason),
                old_state: event.new_state.clone(),
                scope_name: self.name.clone(),
                store_name: self.store_name.clone(),
                action_name: event.action_name.clone(),
                props: Arc::clone(&event.props),
            });
        });
        Ok(())
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.member_subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ComposedInner {
    fn drop(&mut self) {
        for subscription in self.lock_subscriptions().drain(..) {
            subscription.unsubscribe();
        }
    }
}

/// Read-only aggregate of two or more scopes.
#[derive(Clone)]
pub struct ComposedScope {
    inner: Arc<ComposedInner>,
}

impl ComposedScope {
    /// Compose free-standing scopes. The name is generated when absent and the
    /// devtool defaults to a no-op.
    pub fn new(
        name: Option<String>,
        members: Vec<Arc<dyn ErasedScope>>,
        dev_tool: Option<Arc<DevTool>>,
    ) -> Result<Self, Error> {
        let composed = Self::build(
            name.unwrap_or_else(|| IdGenerator::unique(COMPOSITION_PREFIX)),
            None,
            members,
            dev_tool.unwrap_or_default(),
        )?;
        composed.inner.dev_tool.create_scope(|| composed.created_payload());
        Ok(composed)
    }

    pub(crate) fn build(
        name: String,
        store_name: Option<String>,
        members: Vec<Arc<dyn ErasedScope>>,
        dev_tool: Arc<DevTool>,
    ) -> Result<Self, Error> {
        let mut distinct: Vec<Arc<dyn ErasedScope>> = Vec::with_capacity(members.len());
        for member in members {
            if !distinct.iter().any(|seen| seen.name() == member.name()) {
                distinct.push(member);
            }
        }
        if distinct.len() < MIN_MEMBERS {
            return Err(Error::InsufficientScopes {
                required: MIN_MEMBERS,
                found: distinct.len(),
            });
        }

        let mut actions: Vec<String> = Vec::new();
        for member in &distinct {
            member.lock();
            for action in member.support_actions() {
                if !actions.contains(&action) {
                    actions.push(action);
                }
            }
        }

        let inner = Arc::new(ComposedInner {
            name,
            store_name,
            members: distinct,
            actions,
            listeners: Arc::new(ListenerSet::new()),
            member_subscriptions: Mutex::new(Vec::new()),
            dev_tool,
        });

        let weak: Weak<ComposedInner> = Arc::downgrade(&inner);
        let mut subscriptions = Vec::with_capacity(inner.members.len());
        for (index, member) in inner.members.iter().enumerate() {
            let weak = weak.clone();
            let forward = listener(move |event: &ScopeEvent<Value>| match weak.upgrade() {
                Some(inner) => inner.republish(index, event),
                None => Ok(()),
            });
            subscriptions.push(member.subscribe_value(forward, &[])?);
        }
        *inner.lock_subscriptions() = subscriptions;

        debug!(
            scope = %inner.name,
            store = ?inner.store_name,
            members = inner.members.len(),
            "composition created"
        );
        Ok(Self { inner })
    }

    pub(crate) fn created_payload(&self) -> Option<ScopeCreated> {
        match self.state() {
            Ok(state) => Some(ScopeCreated {
                store_name: self.inner.store_name.clone(),
                scope_name: self.inner.name.clone(),
                state,
                is_composition: true,
                is_immutability_enabled: true,
                is_subscribed_macro_auto_create_enabled: false,
            }),
            Err(e) => {
                warn!(scope = %self.inner.name, error = %e, "composition state could not be serialized");
                None
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn store_name(&self) -> Option<&str> {
        self.inner.store_name.as_deref()
    }

    /// `{member: state}` for every member.
    pub fn state(&self) -> Result<Value, Error> {
        self.inner.aggregate()
    }

    pub fn members(&self) -> &[Arc<dyn ErasedScope>] {
        &self.inner.members
    }

    pub fn member(&self, name: &str) -> Option<Arc<dyn ErasedScope>> {
        self.inner
            .members
            .iter()
            .find(|member| member.name() == name)
            .cloned()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.inner
            .members
            .iter()
            .map(|member| member.name().to_string())
            .collect()
    }

    /// Union of member actions, in member order.
    pub fn support_actions(&self) -> Vec<String> {
        self.inner.actions.clone()
    }

    pub fn supports_action(&self, name: &str) -> bool {
        self.inner.actions.iter().any(|action| action == name)
    }

    /// Compositions are locked from construction.
    pub fn is_locked(&self) -> bool {
        true
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    pub fn dispatch<P: Any + Send + Sync>(
        &self,
        action_name: &str,
        props: P,
    ) -> Result<Value, DispatchError<Value>> {
        self.dispatch_props(action_name, Arc::new(props), true)
    }

    pub fn dispatch_with<P: Any + Send + Sync>(
        &self,
        action_name: &str,
        props: P,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>> {
        self.dispatch_props(action_name, Arc::new(props), emit_event)
    }

    /// Forward the action to every member supporting it.
    ///
    /// Every supporting member is attempted; the first failure is returned,
    /// otherwise the aggregate state.
    pub fn dispatch_props(
        &self,
        action_name: &str,
        props: Props,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>> {
        match action_name {
            RESET_ACTION => return self.reset_with(emit_event),
            RESTORE_ACTION => {
                let states = props
                    .downcast_ref::<Value>()
                    .ok_or_else(|| Error::PropsTypeMismatch {
                        action: RESTORE_ACTION.to_string(),
                        expected: type_name::<Value>(),
                    })?;
                return self.restore_value(states.clone(), emit_event);
            }
            _ => {}
        }

        let targets: Vec<_> = self
            .inner
            .members
            .iter()
            .filter(|member| member.supports_action(action_name))
            .collect();
        if targets.is_empty() {
            return Err(Error::UnknownAction {
                scope: self.inner.name.clone(),
                action: action_name.to_string(),
            }
            .into());
        }

        let results = targets
            .into_iter()
            .map(|member| member.dispatch_value(action_name, Arc::clone(&props), emit_event));
        Self::first_failure(results)?;
        Ok(self.state()?)
    }

    fn first_failure(
        results: impl Iterator<Item = Result<Value, DispatchError<Value>>>,
    ) -> Result<(), DispatchError<Value>> {
        let mut first = None;
        for result in results {
            if let Err(err) = result {
                debug!(error = %err, "member dispatch failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn reset(&self) -> Result<Value, DispatchError<Value>> {
        self.reset_with(true)
    }

    /// Reset every member.
    pub fn reset_with(&self, emit_event: bool) -> Result<Value, DispatchError<Value>> {
        Self::first_failure(
            self.inner
                .members
                .iter()
                .map(|member| member.reset_value(emit_event)),
        )?;
        Ok(self.state()?)
    }

    pub fn restore(&self, states: Map<String, Value>) -> Result<Value, DispatchError<Value>> {
        self.restore_with(states, true)
    }

    /// Restore every member named in `states`; other members are untouched.
    pub fn restore_with(
        &self,
        mut states: Map<String, Value>,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>> {
        let results: Vec<_> = self
            .inner
            .members
            .iter()
            .filter_map(|member| {
                let state = states.remove(member.name())?;
                Some(member.restore_value(state, emit_event))
            })
            .collect();
        if !states.is_empty() {
            debug!(
                scope = %self.inner.name,
                ignored = ?states.keys().collect::<Vec<_>>(),
                "restore entries without a member ignored"
            );
        }
        Self::first_failure(results.into_iter())?;
        Ok(self.state()?)
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    pub fn subscribe<F>(&self, listener: F, action_names: &[&str]) -> Result<Subscription, Error>
    where
        F: Fn(&ScopeEvent<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_listener(Arc::new(listener), action_names)
    }

    pub fn subscribe_listener(
        &self,
        listener: Listener<Value>,
        action_names: &[&str],
    ) -> Result<Subscription, Error> {
        if let Some(unknown) = action_names.iter().find(|name| !self.supports_action(name)) {
            return Err(Error::UnknownAction {
                scope: self.inner.name.clone(),
                action: unknown.to_string(),
            });
        }
        let listener_id = self.inner.listeners.add(
            listener,
            action_names.iter().map(|name| name.to_string()),
        );
        let owner: Weak<dyn Unsubscribe> =
            Arc::downgrade(&self.inner.listeners) as Weak<ListenerSet<Value>>;
        Ok(Subscription::new(listener_id, owner))
    }

    pub fn unsubscribe(&self, listener_id: &str) -> bool {
        self.inner.listeners.remove(listener_id)
    }
}

impl ErasedScope for ComposedScope {
    fn name(&self) -> &str {
        ComposedScope::name(self)
    }

    fn store_name(&self) -> Option<&str> {
        ComposedScope::store_name(self)
    }

    fn is_locked(&self) -> bool {
        true
    }

    fn is_composition(&self) -> bool {
        true
    }

    fn lock(&self) {}

    fn support_actions(&self) -> Vec<String> {
        ComposedScope::support_actions(self)
    }

    fn supports_action(&self, name: &str) -> bool {
        ComposedScope::supports_action(self, name)
    }

    fn state_value(&self) -> Result<Value, Error> {
        self.state()
    }

    fn dispatch_value(
        &self,
        action_name: &str,
        props: Props,
        emit_event: bool,
    ) -> Result<Value, DispatchError<Value>> {
        self.dispatch_props(action_name, props, emit_event)
    }

    fn subscribe_value(
        &self,
        listener: Listener<Value>,
        action_names: &[&str],
    ) -> Result<Subscription, Error> {
        self.subscribe_listener(listener, action_names)
    }

    fn unsubscribe(&self, listener_id: &str) -> bool {
        ComposedScope::unsubscribe(self, listener_id)
    }

    fn reset_value(&self, emit_event: bool) -> Result<Value, DispatchError<Value>> {
        self.reset_with(emit_event)
    }

    fn restore_value(&self, state: Value, emit_event: bool) -> Result<Value, DispatchError<Value>> {
        match state {
            Value::Object(states) => self.restore_with(states, emit_event),
            _ => Err(Error::InvalidRestorePayload.into()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ComposedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedScope")
            .field("name", &self.inner.name)
            .field("store_name", &self.inner.store_name)
            .field("members", &self.member_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use crate::scope::Scope;
    use crate::testing::RecordingDevTool;
    use serde_json::json;

    fn member(name: &str, initial: i64) -> Scope<i64> {
        let scope = Scope::new(ScopeConfig::new(initial).with_name(name));
        scope.register_action("noop", |s: &i64, _: &()| Ok(*s)).unwrap();
        scope
            .register_action("add", |s: &i64, n: &i64| Ok(s + n))
            .unwrap();
        scope
    }

    fn compose(members: &[&Scope<i64>]) -> Result<ComposedScope, Error> {
        ComposedScope::new(
            Some("both".into()),
            members.iter().map(|scope| scope.erased()).collect(),
            None,
        )
    }

    #[test]
    fn test_aggregate_state_after_construction() {
        let a = member("A", 1);
        let b = member("B", 2);
        let composed = compose(&[&a, &b]).unwrap();

        assert_eq!(composed.state().unwrap(), json!({ "A": 1, "B": 2 }));
        assert!(a.is_locked() && b.is_locked());
        assert!(composed.is_locked());
        assert_eq!(composed.member_names(), vec!["A", "B"]);
    }

    #[test]
    fn test_requires_two_distinct_members() {
        let a = member("A", 1);
        let err = compose(&[&a, &a]).unwrap_err();
        assert!(matches!(err, Error::InsufficientScopes { required: 2, found: 1 }));
        let err = compose(&[]).unwrap_err();
        assert!(matches!(err, Error::InsufficientScopes { found: 0, .. }));
    }

    #[test]
    fn test_dispatch_forwards_to_supporting_members() {
        let a = member("A", 1);
        let b = Scope::new(ScopeConfig::new(10_i64).with_name("B"));
        b.register_action("double", |s: &i64, _: &()| Ok(s * 2)).unwrap();
        let composed = compose(&[&a, &b]).unwrap();

        assert_eq!(composed.dispatch("add", 5_i64).unwrap(), json!({ "A": 6, "B": 10 }));
        assert_eq!(composed.dispatch("double", ()).unwrap(), json!({ "A": 6, "B": 20 }));
        assert!(matches!(
            composed.dispatch("missing", ()).unwrap_err().rejection(),
            Some(Error::UnknownAction { .. })
        ));
        assert_eq!(
            composed.support_actions(),
            vec!["reset", "restore", "noop", "add", "double"]
        );
    }

    #[test]
    fn test_member_events_are_republished() {
        let a = member("A", 1);
        let b = member("B", 2);
        let composed = compose(&[&a, &b]).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        composed
            .subscribe(
                move |event| {
                    sink.lock().unwrap().push(event.clone());
                    Ok(())
                },
                &["add"],
            )
            .unwrap();

        b.dispatch("add", 3_i64).unwrap();
        a.dispatch("noop", ()).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope_name, "both");
        assert_eq!(*events[0].new_state, json!({ "A": 1, "B": 5 }));
        assert_eq!(*events[0].old_state, json!({ "A": 1, "B": 2 }));
        assert_eq!(events[0].props::<i64>(), Some(&3));
    }

    #[test]
    fn test_all_members_attempted_first_error_returned() {
        let a = member("A", 1);
        let b = Scope::new(ScopeConfig::new(2_i64).with_name("B"));
        b.register_action("add", |_: &i64, _: &i64| -> anyhow::Result<i64> {
            anyhow::bail!("B refuses")
        })
        .unwrap();
        let composed = compose(&[&a, &b]).unwrap();

        let err = composed.dispatch("add", 1_i64).unwrap_err();
        assert_eq!(err.action_error().unwrap().scope_name, "B");
        assert_eq!(*a.state(), 2);
    }

    #[test]
    fn test_reset_and_restore_fan_out() {
        let recorder = RecordingDevTool::new();
        let a = member("A", 1);
        let b = member("B", 2);
        let composed = ComposedScope::build(
            "both".into(),
            None,
            vec![a.erased(), b.erased()],
            recorder.dev_tool(),
        )
        .unwrap();

        let mut states = Map::new();
        states.insert("A".into(), json!(10));
        states.insert("ghost".into(), json!(0));
        assert_eq!(composed.restore(states).unwrap(), json!({ "A": 10, "B": 2 }));

        composed.dispatch("add", 1_i64).unwrap();
        assert_eq!(composed.reset().unwrap(), json!({ "A": 10, "B": 2 }));

        assert_eq!(
            composed.dispatch(RESTORE_ACTION, json!({ "B": 7 })).unwrap(),
            json!({ "A": 10, "B": 7 })
        );
        assert!(matches!(
            composed.restore_value(json!([1, 2]), true).unwrap_err().rejection(),
            Some(Error::InvalidRestorePayload)
        ));
    }

    #[test]
    fn test_subscribe_validates_union() {
        let composed = compose(&[&member("A", 1), &member("B", 2)]).unwrap();
        assert!(composed.subscribe(|_| Ok(()), &["add", "noop"]).is_ok());
        assert!(matches!(
            composed.subscribe(|_| Ok(()), &["nope"]),
            Err(Error::UnknownAction { .. })
        ));
    }

    #[test]
    fn test_dropping_composition_releases_member_listeners() {
        let a = member("A", 1);
        let b = member("B", 2);
        let composed = compose(&[&a, &b]).unwrap();
        assert_eq!(a.listener_count(), 1);
        drop(composed);
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_listener_failure_on_composition_reported() {
        let recorder = RecordingDevTool::new();
        let a = member("A", 1);
        let b = member("B", 2);
        let composed = ComposedScope::new(
            Some("both".into()),
            vec![a.erased(), b.erased()],
            Some(recorder.dev_tool()),
        )
        .unwrap();
        composed.subscribe(|_| anyhow::bail!("composite listener"), &[]).unwrap();

        let created = recorder.created_scopes();
        assert_eq!(created.len(), 1);
        assert!(created[0].is_composition);
        assert_eq!(created[0].state, json!({ "A": 1, "B": 2 }));

        a.dispatch("add", 1_i64).unwrap();
        let errors = recorder.listener_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].scope_name, "both");
        assert_eq!(*errors[0].old_state, json!({ "A": 2, "B": 2 }));
    }
}
