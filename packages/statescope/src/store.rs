//! Store - a named collection of scopes with bulk reset, restore and lock.
//!
//! A store owns its scopes by name. Scopes of different state types live side
//! by side; the store talks to them through [`ErasedScope`] and hands typed
//! handles back through [`Store::get_scope`].
//!
//! # Pending restores
//!
//! [`Store::restore`] accepts a `{scope: state}` object. States for scopes that
//! do not exist yet are kept and used as the initial state of a later
//! [`Store::create_scope`] call that opts in with
//! `use_restored_state_if_available`.
//!
//! ```ignore
//! let store = registry.create_store(StoreConfig::new().with_name("app"))?;
//! store.restore(serde_json::from_str(&saved)?)?;
//!
//! // Starts from the saved value if "counter" was in the snapshot.
//! let counter = store.create_scope(ScopeConfig::new(0_i64).with_name("counter"), true)?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::compose::ComposedScope;
use crate::config::{ScopeConfig, StoreConfig};
use crate::devtool::{DevTool, StoreChange, StoreChangeKind, StoreCreated};
use crate::erased::ErasedScope;
use crate::error::{DispatchError, Error, NameKind};
use crate::id::{IdGenerator, COMPOSITION_PREFIX, SCOPE_PREFIX, STORE_PREFIX};
use crate::scope::{Scope, ScopeParts, State};

struct StoreInner {
    name: String,
    is_frozen: bool,
    is_locked: AtomicBool,
    scopes: DashMap<String, Arc<dyn ErasedScope>>,
    states_to_restore: DashMap<String, Value>,
    ids: IdGenerator,
    dev_tool: Arc<DevTool>,
}

/// Handle to a store. Cloning is cheap and every clone refers to the same store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Back-reference held by scopes, so a scope never keeps its store alive.
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

impl Store {
    /// Create a store outside any registry, with a no-op devtool.
    pub fn new(config: StoreConfig) -> Self {
        let store = Self::build(
            config
                .name
                .unwrap_or_else(|| IdGenerator::unique(STORE_PREFIX)),
            config.is_frozen,
            Arc::default(),
        );
        store.inner.dev_tool.create_store(|| store.created_payload());
        store
    }

    pub(crate) fn build(name: String, is_frozen: bool, dev_tool: Arc<DevTool>) -> Self {
        debug!(store = %name, is_frozen, "store created");
        Self {
            inner: Arc::new(StoreInner {
                name,
                is_frozen,
                is_locked: AtomicBool::new(false),
                scopes: DashMap::new(),
                states_to_restore: DashMap::new(),
                ids: IdGenerator::new(),
                dev_tool,
            }),
        }
    }

    pub(crate) fn created_payload(&self) -> StoreCreated {
        StoreCreated {
            store_name: self.inner.name.clone(),
            is_frozen: self.inner.is_frozen,
        }
    }

    fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    fn change(&self, kind: StoreChangeKind) {
        self.inner.dev_tool.change_store(|| StoreChange {
            store_name: self.inner.name.clone(),
            kind,
        });
    }

    fn ensure_unlocked(&self) -> Result<(), Error> {
        if self.is_locked() {
            return Err(Error::StoreLocked {
                store: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    /// Next generated name for `prefix` that no scope in this store uses.
    fn fresh_name(&self, prefix: &str) -> String {
        loop {
            let name = self.inner.ids.next(prefix);
            if !self.inner.scopes.contains_key(&name) {
                return name;
            }
        }
    }

    /// Scopes in name order. Taken before fan-out so no map guard is held
    /// while scope code runs.
    fn snapshot(&self) -> Vec<Arc<dyn ErasedScope>> {
        let mut scopes: Vec<_> = self
            .inner
            .scopes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        scopes.sort_by(|a, b| a.name().cmp(b.name()));
        scopes
    }

    // =========================================================================
    // Scope Creation
    // =========================================================================

    /// Create a scope owned by this store.
    ///
    /// With `use_restored_state_if_available`, a pending restore for the
    /// scope's name replaces `initial_state` and is consumed. Immutability
    /// defaults to the store's `is_frozen`, the devtool to the store's.
    pub fn create_scope<T: State>(
        &self,
        config: ScopeConfig<T>,
        use_restored_state_if_available: bool,
    ) -> Result<Scope<T>, Error> {
        self.ensure_unlocked()?;

        let ScopeConfig {
            name,
            mut initial_state,
            options,
            middleware,
            dev_tool,
        } = config;
        let name = name.unwrap_or_else(|| self.fresh_name(SCOPE_PREFIX));

        let pending = if use_restored_state_if_available {
            self.inner
                .states_to_restore
                .get(&name)
                .map(|state| state.value().clone())
        } else {
            None
        };
        let restored = pending.is_some();
        if let Some(state) = pending {
            initial_state = serde_json::from_value(state).map_err(|source| {
                Error::StateDeserialization {
                    scope: name.clone(),
                    source,
                }
            })?;
        }

        let scope = match self.inner.scopes.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateName {
                    kind: NameKind::Scope,
                    name,
                })
            }
            Entry::Vacant(slot) => {
                let scope = Scope::build(ScopeParts {
                    name: name.clone(),
                    store: Some((self.inner.name.clone(), self.downgrade())),
                    initial_state,
                    is_immutability_enabled: options
                        .is_immutability_enabled
                        .unwrap_or(self.inner.is_frozen),
                    is_subscribed_macro_auto_create_enabled: options
                        .is_subscribed_macro_auto_create_enabled,
                    middleware,
                    dev_tool: dev_tool.unwrap_or_else(|| Arc::clone(&self.inner.dev_tool)),
                });
                slot.insert(scope.erased());
                scope
            }
        };
        if restored {
            self.inner.states_to_restore.remove(&name);
        }
        // A concurrent lock may have missed the new entry.
        if self.is_locked() {
            scope.lock();
        }

        debug!(store = %self.inner.name, scope = %name, restored, "scope added to store");
        scope.run_setup();
        scope.dev_tool().create_scope(|| scope.created_payload());
        self.change(StoreChangeKind::CreateScope { scope_name: name });
        Ok(scope)
    }

    /// Compose existing scopes of this store into a new scope.
    ///
    /// Member names are resolved first; a missing one fails with
    /// [`Error::UnknownScope`]. The name is generated when absent.
    pub fn compose_scopes(
        &self,
        name: Option<String>,
        member_names: &[&str],
    ) -> Result<ComposedScope, Error> {
        self.ensure_unlocked()?;

        let members = member_names
            .iter()
            .map(|member| {
                self.get_erased(member).ok_or_else(|| Error::UnknownScope {
                    store: self.inner.name.clone(),
                    scope: member.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let name = name.unwrap_or_else(|| self.fresh_name(COMPOSITION_PREFIX));
        if self.inner.scopes.contains_key(&name) {
            return Err(Error::DuplicateName {
                kind: NameKind::Scope,
                name,
            });
        }

        let composed = ComposedScope::build(
            name.clone(),
            Some(self.inner.name.clone()),
            members,
            Arc::clone(&self.inner.dev_tool),
        )?;
        match self.inner.scopes.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateName {
                    kind: NameKind::Scope,
                    name,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(composed.clone()));
            }
        }

        debug!(store = %self.inner.name, scope = %name, "composition added to store");
        self.inner.dev_tool.create_scope(|| composed.created_payload());
        self.change(StoreChangeKind::CreateScope { scope_name: name });
        Ok(composed)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Typed handle to a scope, if it exists and holds state of type `T`.
    pub fn get_scope<T: State>(&self, name: &str) -> Option<Scope<T>> {
        self.get_erased(name)?
            .as_any()
            .downcast_ref::<Scope<T>>()
            .cloned()
    }

    pub fn get_composition(&self, name: &str) -> Option<ComposedScope> {
        self.get_erased(name)?
            .as_any()
            .downcast_ref::<ComposedScope>()
            .cloned()
    }

    pub fn get_erased(&self, name: &str) -> Option<Arc<dyn ErasedScope>> {
        self.inner
            .scopes
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_scope(&self, name: &str) -> bool {
        self.inner.scopes.contains_key(name)
    }

    /// Scope names, compositions included, sorted.
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .scopes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Lock the store and every scope in it. Repeated calls are no-ops.
    pub fn lock(&self) {
        if self.inner.is_locked.swap(true, Ordering::SeqCst) {
            return;
        }
        for scope in self.snapshot() {
            scope.lock();
        }
        debug!(store = %self.inner.name, "store locked");
        self.change(StoreChangeKind::Lock);
    }

    pub fn reset(&self) -> Result<Map<String, Value>, DispatchError<Value>> {
        self.reset_with(true)
    }

    /// Reset every scope. Compositions are skipped since their members are
    /// reset directly.
    ///
    /// Every scope is attempted; the first failure is returned.
    pub fn reset_with(&self, emit_event: bool) -> Result<Map<String, Value>, DispatchError<Value>> {
        let mut first = None;
        for scope in self.snapshot() {
            if scope.is_composition() {
                continue;
            }
            if let Err(err) = scope.reset_value(emit_event) {
                debug!(store = %self.inner.name, scope = %scope.name(), error = %err, "reset failed");
                first.get_or_insert(err);
            }
        }
        self.change(StoreChangeKind::Reset);
        match first {
            Some(err) => Err(err),
            None => Ok(self.state()?),
        }
    }

    pub fn restore(&self, states: Map<String, Value>) -> Result<Map<String, Value>, DispatchError<Value>> {
        self.restore_with(states, true)
    }

    /// Restore scopes from a `{scope: state}` object.
    ///
    /// States for scopes that do not exist are kept as pending restores.
    /// Every existing scope is attempted; the first failure is returned.
    pub fn restore_with(
        &self,
        states: Map<String, Value>,
        emit_event: bool,
    ) -> Result<Map<String, Value>, DispatchError<Value>> {
        let mut restored = Vec::new();
        let mut pending = Vec::new();
        let mut first = None;

        for (name, state) in states {
            match self.get_erased(&name) {
                Some(scope) => match scope.restore_value(state, emit_event) {
                    Ok(_) => restored.push(name),
                    Err(err) => {
                        debug!(store = %self.inner.name, scope = %name, error = %err, "restore failed");
                        first.get_or_insert(err);
                    }
                },
                None => {
                    self.inner.states_to_restore.insert(name.clone(), state);
                    pending.push(name);
                }
            }
        }

        debug!(
            store = %self.inner.name,
            restored = restored.len(),
            pending = pending.len(),
            "store restored"
        );
        self.change(StoreChangeKind::Restore { restored, pending });
        match first {
            Some(err) => Err(err),
            None => Ok(self.state()?),
        }
    }

    /// [`Store::restore_with`] for an arbitrary JSON value, which must be an
    /// object.
    pub fn restore_value(
        &self,
        states: Value,
        emit_event: bool,
    ) -> Result<Map<String, Value>, DispatchError<Value>> {
        match states {
            Value::Object(states) => self.restore_with(states, emit_event),
            _ => Err(Error::InvalidRestorePayload.into()),
        }
    }

    /// Names with a pending restore, sorted.
    pub fn pending_restores(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .states_to_restore
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    // =========================================================================
    // Read Surface
    // =========================================================================

    /// `{scope: state}` for every scope. Compositions are left out since
    /// their state is derived from scopes already present.
    pub fn state(&self) -> Result<Map<String, Value>, Error> {
        let mut states = Map::new();
        for scope in self.snapshot() {
            if scope.is_composition() {
                continue;
            }
            states.insert(scope.name().to_string(), scope.state_value()?);
        }
        Ok(states)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked.load(Ordering::SeqCst)
    }

    /// Default immutability for scopes created in this store.
    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen
    }

    pub fn dev_tool(&self) -> &Arc<DevTool> {
        &self.inner.dev_tool
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("is_frozen", &self.inner.is_frozen)
            .field("is_locked", &self.is_locked())
            .field("scopes", &self.scope_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevTool;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn store_with(recorder: &RecordingDevTool) -> Store {
        Store::build("app".into(), true, recorder.dev_tool())
    }

    fn counter(store: &Store, name: &str, initial: i64) -> Scope<i64> {
        let scope = store
            .create_scope(ScopeConfig::new(initial).with_name(name), false)
            .unwrap();
        scope
            .register_action("increment", |count: &i64, _: &()| Ok(count + 1))
            .unwrap();
        scope
    }

    #[test]
    fn test_create_scope_links_store() {
        let store = Store::new(StoreConfig::new().with_name("app"));
        let scope = counter(&store, "counter", 0);

        assert_eq!(scope.store_name(), Some("app"));
        assert_eq!(scope.store().unwrap().name(), "app");
        assert!(scope.is_immutability_enabled());
        assert!(store.has_scope("counter"));

        let typed = store.get_scope::<i64>("counter").unwrap();
        assert!(Scope::ptr_eq(&typed, &scope));
        assert!(store.get_scope::<String>("counter").is_none());
    }

    #[test]
    fn test_duplicate_scope_name_rejected() {
        let store = Store::new(StoreConfig::new());
        counter(&store, "counter", 0);
        let err = store
            .create_scope(ScopeConfig::new(5_i64).with_name("counter"), false)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: NameKind::Scope, .. }));
        assert_eq!(*store.get_scope::<i64>("counter").unwrap().state(), 0);
    }

    #[test]
    fn test_generated_names_are_unique() {
        let store = Store::new(StoreConfig::new());
        store
            .create_scope(ScopeConfig::new(0_i64).with_name("scope-1"), false)
            .unwrap();
        let a = store.create_scope(ScopeConfig::new(0_i64), false).unwrap();
        let b = store.create_scope(ScopeConfig::new(0_i64), false).unwrap();
        assert_ne!(a.name(), b.name());
        assert_ne!(a.name(), "scope-1");
        assert_eq!(store.scope_names().len(), 3);
    }

    #[test]
    fn test_store_frozen_flag_is_default_immutability() {
        let store = Store::new(StoreConfig::new().with_frozen(false));
        let inherits = store.create_scope(ScopeConfig::new(0_i64), false).unwrap();
        let overrides = store
            .create_scope(ScopeConfig::new(0_i64).with_immutability(true), false)
            .unwrap();
        assert!(!inherits.is_immutability_enabled());
        assert!(overrides.is_immutability_enabled());
    }

    #[test]
    fn test_locked_store_refuses_scopes_and_locks_members() {
        let recorder = RecordingDevTool::new();
        let store = store_with(&recorder);
        let scope = counter(&store, "counter", 0);

        store.lock();
        store.lock();
        assert!(store.is_locked());
        assert!(scope.is_locked());
        assert!(matches!(
            store.create_scope(ScopeConfig::new(0_i64), false),
            Err(Error::StoreLocked { .. })
        ));

        let locks = recorder
            .store_changes()
            .into_iter()
            .filter(|change| change.kind == StoreChangeKind::Lock)
            .count();
        assert_eq!(locks, 1);

        // Locked scopes still dispatch.
        scope.dispatch("increment", ()).unwrap();
    }

    #[test]
    fn test_state_snapshot_and_reset() {
        let store = Store::new(StoreConfig::new());
        let counter = counter(&store, "counter", 1);
        let user = store
            .create_scope(
                ScopeConfig::new(User { name: "ann".into() }).with_name("user"),
                false,
            )
            .unwrap();
        counter.dispatch("increment", ()).unwrap();
        user.restore(User { name: "bob".into() }).unwrap();

        assert_eq!(
            Value::Object(store.state().unwrap()),
            json!({ "counter": 2, "user": { "name": "bob" } })
        );

        let state = store.reset().unwrap();
        assert_eq!(
            Value::Object(state),
            json!({ "counter": 1, "user": { "name": "bob" } })
        );
    }

    #[test]
    fn test_restore_keeps_pending_for_missing_scopes() {
        let recorder = RecordingDevTool::new();
        let store = store_with(&recorder);
        counter(&store, "counter", 0);

        let snapshot = json!({ "counter": 5, "user": { "name": "cy" } });
        let state = store.restore_value(snapshot, true).unwrap();
        assert_eq!(Value::Object(state), json!({ "counter": 5 }));
        assert_eq!(store.pending_restores(), vec!["user"]);

        let user = store
            .create_scope(
                ScopeConfig::new(User { name: "nobody".into() }).with_name("user"),
                true,
            )
            .unwrap();
        assert_eq!(user.state().name, "cy");
        assert_eq!(user.initial_state().name, "cy");
        assert!(store.pending_restores().is_empty());

        assert!(recorder.store_changes().iter().any(|change| change.kind
            == StoreChangeKind::Restore {
                restored: vec!["counter".into()],
                pending: vec!["user".into()],
            }));
    }

    #[test]
    fn test_pending_restore_ignored_without_opt_in() {
        let store = Store::new(StoreConfig::new());
        store.restore_value(json!({ "counter": 9 }), true).unwrap();
        let scope = store
            .create_scope(ScopeConfig::new(0_i64).with_name("counter"), false)
            .unwrap();
        assert_eq!(*scope.state(), 0);
        assert_eq!(store.pending_restores(), vec!["counter"]);
    }

    #[test]
    fn test_bad_pending_state_fails_creation() {
        let store = Store::new(StoreConfig::new());
        store.restore_value(json!({ "counter": "nine" }), true).unwrap();
        let err = store
            .create_scope(ScopeConfig::new(0_i64).with_name("counter"), true)
            .unwrap_err();
        assert!(matches!(err, Error::StateDeserialization { .. }));
        assert!(!store.has_scope("counter"));
    }

    #[test]
    fn test_restore_rejects_non_object() {
        let store = Store::new(StoreConfig::new());
        let err = store.restore_value(json!([1]), true).unwrap_err();
        assert!(matches!(err.rejection(), Some(Error::InvalidRestorePayload)));
    }

    #[test]
    fn test_restore_failure_still_restores_others() {
        let store = Store::new(StoreConfig::new());
        let a = counter(&store, "a", 0);
        counter(&store, "b", 0);
        let err = store
            .restore_value(json!({ "a": 3, "b": "three" }), true)
            .unwrap_err();
        assert!(matches!(err.rejection(), Some(Error::StateDeserialization { .. })));
        assert_eq!(*a.state(), 3);
    }

    #[test]
    fn test_compose_scopes() {
        let recorder = RecordingDevTool::new();
        let store = store_with(&recorder);
        let a = counter(&store, "A", 1);
        counter(&store, "B", 2);

        let composed = store.compose_scopes(None, &["A", "B"]).unwrap();
        assert_eq!(composed.state().unwrap(), json!({ "A": 1, "B": 2 }));
        assert_eq!(composed.store_name(), Some("app"));
        assert!(a.is_locked());

        assert!(store.get_composition(composed.name()).is_some());
        assert!(store.get_scope::<i64>(composed.name()).is_none());
        // Compositions are derived, so the snapshot only lists their members.
        assert_eq!(store.state().unwrap().len(), 2);

        let created = recorder.created_scopes();
        assert!(created.iter().any(|c| c.is_composition && c.scope_name == composed.name()));

        let err = store.compose_scopes(None, &["A", "missing"]).unwrap_err();
        assert!(matches!(err, Error::UnknownScope { ref scope, .. } if scope == "missing"));
        let err = store
            .compose_scopes(Some("A".into()), &["A", "B"])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
    }

    #[test]
    fn test_store_reset_skips_compositions() {
        let store = Store::new(StoreConfig::new());
        let a = counter(&store, "A", 1);
        let b = counter(&store, "B", 2);
        let composed = store.compose_scopes(Some("both".into()), &["A", "B"]).unwrap();

        let resets = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = resets.clone();
        a.subscribe(
            move |_| {
                handle.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &["reset"],
        )
        .unwrap();

        composed.dispatch("increment", ()).unwrap();
        assert_eq!((*a.state(), *b.state()), (2, 3));
        store.reset().unwrap();
        assert_eq!((*a.state(), *b.state()), (1, 2));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_scope_devtool_order() {
        let recorder = RecordingDevTool::new();
        let store = store_with(&recorder);
        counter(&store, "counter", 7);

        let created = recorder.created_scopes();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].store_name.as_deref(), Some("app"));
        assert_eq!(created[0].state, json!(7));
        assert_eq!(
            recorder.store_changes()[0].kind,
            StoreChangeKind::CreateScope {
                scope_name: "counter".into()
            }
        );
    }

    #[test]
    fn test_scope_does_not_keep_store_alive() {
        let store = Store::new(StoreConfig::new());
        let scope = counter(&store, "counter", 0);
        drop(store);
        assert!(scope.store().is_none());
        assert!(scope.store_name().is_some());
        scope.dispatch("increment", ()).unwrap();
    }
}
