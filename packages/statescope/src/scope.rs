//! Scope - one named unit of state and the actions allowed to change it.
//!
//! # Dispatch
//!
//! ```text
//! Idle ──dispatch──▶ Dispatching (root) ──action dispatches again──▶ Nested (any depth)
//!  ▲                        │                                             │
//!  └──── commit + publish ◀─┴──────────── buffered as child ◀─────────────┘
//! ```
//!
//! A dispatch started while another dispatch of the same scope is running on
//! the same thread (from the action body, or anything it calls) is *nested*:
//! it starts from the in-flight `context`, never touches the committed
//! `state`, and its event is buffered as a child of the root event. When the
//! root action returns, its state is committed, the scope goes idle, and the
//! buffered children are published in completion order, followed by the root
//! event itself.
//!
//! A dispatch attempted from another thread while a dispatch is running is
//! rejected with [`Error::DispatchUnavailable`].
//!
//! # Example
//!
//! ```ignore
//! let scope = Scope::new(ScopeConfig::new(0_i64).with_name("counter"));
//! let increment = scope.register_action("increment", |count: &i64, _: &()| Ok(count + 1))?;
//!
//! scope.subscribe(|event| {
//!     println!("{} -> {}", event.old_state, event.new_state);
//!     Ok(())
//! }, &["increment"])?;
//!
//! increment.dispatch(())?;
//! assert_eq!(*scope.state(), 1);
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, ThreadId};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::ScopeConfig;
use crate::devtool::{DevTool, ScopeChange, ScopeChangeKind, ScopeCreated};
use crate::erased::ErasedScope;
use crate::error::{panic_message, DispatchError, Error, NameKind, ScopeError};
use crate::event::{EventId, Props, ScopeEvent};
use crate::frozen::{freeze, Frozen};
use crate::id::{IdGenerator, SCOPE_PREFIX};
use crate::listener::{Listener, ListenerSet, Subscription, Unsubscribe};
use crate::macros::{is_reserved, subscription_macro_name, MacroFn, MacroKind, MacroTable};
use crate::middleware::{ActionContext, ActionFn, Middleware, Next};
use crate::store::{Store, WeakStore};

/// Builtin action returning the initial snapshot.
pub const RESET_ACTION: &str = "reset";

/// Builtin action replacing the initial snapshot.
pub const RESTORE_ACTION: &str = "restore";

/// Requirements on a scope's state type.
///
/// State is cloned out of snapshots when an action needs an owned copy, and
/// serialized for the devtool and for store snapshots.
pub trait State: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> State for T where T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

// =============================================================================
// Internals
// =============================================================================

struct ActionEntry<T> {
    action: ActionFn<T>,
    props_type: TypeId,
    props_type_name: &'static str,
    accepts: fn(&Props) -> bool,
}

impl<T> Clone for ActionEntry<T> {
    fn clone(&self) -> Self {
        Self {
            action: Arc::clone(&self.action),
            props_type: self.props_type,
            props_type_name: self.props_type_name,
            accepts: self.accepts,
        }
    }
}

fn accepts<P: Any>(props: &Props) -> bool {
    props.is::<P>()
}

impl<T: State> ActionEntry<T> {
    fn typed<P, F>(name: &str, f: F) -> Self
    where
        P: Any + Send + Sync,
        F: Fn(&T, &P) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let action_name = name.to_string();
        let action: ActionFn<T> = Arc::new(move |state: &T, props: &Props| -> anyhow::Result<T> {
            // Middleware may swap props, so the type is checked again here.
            let props = props
                .downcast_ref::<P>()
                .ok_or_else(|| Error::PropsTypeMismatch {
                    action: action_name.clone(),
                    expected: type_name::<P>(),
                })?;
            f(state, props)
        });
        Self {
            action,
            props_type: TypeId::of::<P>(),
            props_type_name: type_name::<P>(),
            accepts: accepts::<P>,
        }
    }
}

struct DispatchFrame<T> {
    owner: ThreadId,
    root_id: EventId,
    children: Vec<ScopeEvent<T>>,
    /// Initial snapshot set by a `restore` inside this dispatch, applied on commit.
    staged_initial: Option<Frozen<T>>,
}

enum Role<T> {
    Root { id: EventId },
    /// `staged` is the frame's staged initial before this dispatch ran.
    Nested {
        root_id: EventId,
        staged: Option<Frozen<T>>,
    },
}

struct ScopeCore<T: State> {
    state: Frozen<T>,
    context: Option<Frozen<T>>,
    actions: HashMap<String, ActionEntry<T>>,
    action_order: Vec<String>,
    macros: MacroTable<T>,
    is_locked: bool,
    dispatch: Option<DispatchFrame<T>>,
}

struct ScopeInner<T: State> {
    name: String,
    store_name: Option<String>,
    store: Option<WeakStore>,
    is_immutability_enabled: bool,
    is_subscribed_macro_auto_create_enabled: bool,
    middleware: Vec<Arc<dyn Middleware<T>>>,
    initial: RwLock<Frozen<T>>,
    core: Mutex<ScopeCore<T>>,
    listeners: Arc<ListenerSet<T>>,
    dev_tool: Arc<DevTool>,
}

/// Construction parameters resolved by the owner (store or [`Scope::new`]).
pub(crate) struct ScopeParts<T: State> {
    pub name: String,
    pub store: Option<(String, WeakStore)>,
    pub initial_state: T,
    pub is_immutability_enabled: bool,
    pub is_subscribed_macro_auto_create_enabled: bool,
    pub middleware: Vec<Arc<dyn Middleware<T>>>,
    pub dev_tool: Arc<DevTool>,
}

fn read_initial<T>(initial: &RwLock<Frozen<T>>) -> Frozen<T> {
    initial
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write_initial<T>(initial: &RwLock<Frozen<T>>, value: Frozen<T>) {
    *initial
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl<T: State> ScopeInner<T> {
    fn core(&self) -> MutexGuard<'_, ScopeCore<T>> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The snapshot `reset` returns to, as seen from the running dispatch.
    fn effective_initial(&self) -> Frozen<T> {
        let staged = self
            .core()
            .dispatch
            .as_ref()
            .and_then(|frame| frame.staged_initial.clone());
        staged.unwrap_or_else(|| read_initial(&self.initial))
    }

    fn stage_initial(&self, value: Frozen<T>) {
        if let Some(frame) = self.core().dispatch.as_mut() {
            frame.staged_initial = Some(value);
        }
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Handle to a scope. Cloning is cheap and every clone refers to the same scope.
pub struct Scope<T: State> {
    inner: Arc<ScopeInner<T>>,
}

impl<T: State> Clone for Scope<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle to a scope, for actions that dispatch on their own scope.
pub struct WeakScope<T: State> {
    inner: Weak<ScopeInner<T>>,
}

impl<T: State> WeakScope<T> {
    pub fn upgrade(&self) -> Option<Scope<T>> {
        self.inner.upgrade().map(|inner| Scope { inner })
    }
}

impl<T: State> Clone for WeakScope<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: State> Scope<T> {
    /// Create a free-standing scope, not owned by any store.
    ///
    /// Immutability defaults to enabled and the devtool to a no-op unless the
    /// config supplies one.
    pub fn new(config: ScopeConfig<T>) -> Self {
        let ScopeConfig {
            name,
            initial_state,
            options,
            middleware,
            dev_tool,
        } = config;

        let scope = Self::build(ScopeParts {
            name: name.unwrap_or_else(|| IdGenerator::unique(SCOPE_PREFIX)),
            store: None,
            initial_state,
            is_immutability_enabled: options.is_immutability_enabled.unwrap_or(true),
            is_subscribed_macro_auto_create_enabled: options
                .is_subscribed_macro_auto_create_enabled,
            middleware,
            dev_tool: dev_tool.unwrap_or_default(),
        });
        scope.run_setup();
        scope.inner.dev_tool.create_scope(|| scope.created_payload());
        scope
    }

    pub(crate) fn build(parts: ScopeParts<T>) -> Self {
        let ScopeParts {
            name,
            store,
            initial_state,
            is_immutability_enabled,
            is_subscribed_macro_auto_create_enabled,
            middleware,
            dev_tool,
        } = parts;

        let state = freeze(initial_state);

        let (store_name, store) = match store {
            Some((store_name, store)) => (Some(store_name), Some(store)),
            None => (None, None),
        };

        debug!(scope = %name, store = ?store_name, "scope created");

        // Builtins reach back into the scope through a weak handle. `restore`
        // only stages the new initial snapshot; the root commit applies it.
        let inner = Arc::new_cyclic(|weak: &Weak<ScopeInner<T>>| {
            let scope = Weak::clone(weak);
            let reset = ActionEntry::typed::<(), _>(RESET_ACTION, move |current: &T, _: &()| {
                match scope.upgrade() {
                    Some(inner) => Ok(inner.effective_initial().thaw()),
                    None => Ok(current.clone()),
                }
            });
            let scope = Weak::clone(weak);
            let restore = ActionEntry::typed::<T, _>(RESTORE_ACTION, move |_: &T, restored: &T| {
                if let Some(inner) = scope.upgrade() {
                    inner.stage_initial(freeze(restored.clone()));
                }
                Ok(restored.clone())
            });

            let mut actions = HashMap::new();
            actions.insert(RESET_ACTION.to_string(), reset);
            actions.insert(RESTORE_ACTION.to_string(), restore);

            ScopeInner {
                name,
                store_name,
                store,
                is_immutability_enabled,
                is_subscribed_macro_auto_create_enabled,
                middleware,
                initial: RwLock::new(state.clone()),
                core: Mutex::new(ScopeCore {
                    state,
                    context: None,
                    actions,
                    action_order: vec![RESET_ACTION.to_string(), RESTORE_ACTION.to_string()],
                    macros: MacroTable::new(),
                    is_locked: false,
                    dispatch: None,
                }),
                listeners: Arc::new(ListenerSet::new()),
                dev_tool,
            }
        });

        Self { inner }
    }

    /// Run every middleware's setup hook against this scope.
    pub(crate) fn run_setup(&self) {
        for middleware in &self.inner.middleware {
            middleware.setup(self);
        }
    }

    pub(crate) fn created_payload(&self) -> Option<ScopeCreated> {
        match serde_json::to_value(&*self.state()) {
            Ok(state) => Some(ScopeCreated {
                store_name: self.inner.store_name.clone(),
                scope_name: self.inner.name.clone(),
                state,
                is_composition: false,
                is_immutability_enabled: self.inner.is_immutability_enabled,
                is_subscribed_macro_auto_create_enabled: self
                    .inner
                    .is_subscribed_macro_auto_create_enabled,
            }),
            Err(e) => {
                warn!(scope = %self.inner.name, error = %e, "initial state could not be serialized");
                None
            }
        }
    }

    fn core(&self) -> MutexGuard<'_, ScopeCore<T>> {
        self.inner.core()
    }

    fn change(&self, kind: ScopeChangeKind) {
        self.inner.dev_tool.change_scope(|| ScopeChange {
            store_name: self.inner.store_name.clone(),
            scope_name: self.inner.name.clone(),
            kind,
        });
    }

    /// Non-owning handle to this scope.
    pub fn downgrade(&self) -> WeakScope<T> {
        WeakScope {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// JSON-typed view of this scope.
    pub fn erased(&self) -> Arc<dyn ErasedScope> {
        Arc::new(self.clone())
    }

    /// Returns true if both handles refer to the same scope.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register an action and return its dispatcher.
    pub fn register_action<P, F>(&self, name: &str, action: F) -> Result<Dispatcher<T, P>, Error>
    where
        P: Any + Send + Sync,
        F: Fn(&T, &P) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.register_action_with_transformer(name, action, |state: Frozen<T>, _: &P| state)
    }

    /// Register an action whose dispatcher pipes the result and props
    /// through `transformer`.
    pub fn register_action_with_transformer<P, R, F, X>(
        &self,
        name: &str,
        action: F,
        transformer: X,
    ) -> Result<Dispatcher<T, P, R>, Error>
    where
        P: Any + Send + Sync,
        F: Fn(&T, &P) -> anyhow::Result<T> + Send + Sync + 'static,
        X: Fn(Frozen<T>, &P) -> R + Send + Sync + 'static,
    {
        let subscription_macro = self.insert_action(name, ActionEntry::typed::<P, F>(name, action))?;

        debug!(scope = %self.inner.name, action = %name, "action registered");
        self.change(ScopeChangeKind::RegisterAction {
            action_name: name.to_string(),
        });
        if let Some(macro_name) = subscription_macro {
            self.change(ScopeChangeKind::RegisterMacro {
                macro_name,
                kind: MacroKind::Function,
            });
        }

        Ok(Dispatcher {
            scope: self.clone(),
            action_name: name.into(),
            transform: Arc::new(transformer),
        })
    }

    /// Store the action. Returns the name of the subscription macro, if one
    /// was created.
    fn insert_action(&self, name: &str, entry: ActionEntry<T>) -> Result<Option<String>, Error> {
        let mut core = self.core();
        if core.is_locked {
            return Err(Error::ScopeLocked {
                scope: self.inner.name.clone(),
            });
        }
        if core.actions.contains_key(name) {
            return Err(Error::DuplicateName {
                kind: NameKind::Action,
                name: name.to_string(),
            });
        }

        let mut subscription_macro = None;
        if self.inner.is_subscribed_macro_auto_create_enabled {
            if is_reserved(name) || core.macros.contains(name) {
                return Err(Error::DuplicateName {
                    kind: NameKind::Action,
                    name: name.to_string(),
                });
            }
            let macro_name = subscription_macro_name(name);
            if is_reserved(&macro_name)
                || core.actions.contains_key(&macro_name)
                || core.macros.contains(&macro_name)
            {
                return Err(Error::DuplicateName {
                    kind: NameKind::Macro,
                    name: macro_name,
                });
            }
            core.macros.insert(
                &macro_name,
                MacroKind::Function,
                Self::subscription_macro(name),
            );
            subscription_macro = Some(macro_name);
        }

        core.actions.insert(name.to_string(), entry);
        core.action_order.push(name.to_string());
        Ok(subscription_macro)
    }

    /// `on<Action>`: subscribes a [`Listener`] to one action, returns the
    /// [`Subscription`].
    fn subscription_macro(action_name: &str) -> MacroFn<T> {
        let action_name = action_name.to_string();
        Arc::new(
            move |scope: &Scope<T>, arg: &dyn Any| -> anyhow::Result<Box<dyn Any + Send>> {
                let listener = arg.downcast_ref::<Listener<T>>().ok_or_else(|| {
                    Error::MacroTypeMismatch {
                        name: subscription_macro_name(&action_name),
                        expected: type_name::<Listener<T>>(),
                    }
                })?;
                let subscription = scope.add_listener(Arc::clone(listener), vec![action_name.clone()]);
                Ok(Box::new(subscription) as Box<dyn Any + Send>)
            },
        )
    }

    /// Register a macro.
    ///
    /// Function macros are called with [`Scope::call_macro`], getters read
    /// with [`Scope::get`] (argument `()`), setters written with
    /// [`Scope::set`] (result `()`).
    pub fn register_macro<A, R, F>(&self, name: &str, kind: MacroKind, f: F) -> Result<(), Error>
    where
        A: Any,
        R: Any + Send,
        F: Fn(&Scope<T>, &A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let macro_name = name.to_string();
        let erased: MacroFn<T> = Arc::new(
            move |scope: &Scope<T>, arg: &dyn Any| -> anyhow::Result<Box<dyn Any + Send>> {
                let arg = arg.downcast_ref::<A>().ok_or_else(|| Error::MacroTypeMismatch {
                    name: macro_name.clone(),
                    expected: type_name::<A>(),
                })?;
                Ok(Box::new(f(scope, arg)?) as Box<dyn Any + Send>)
            },
        );

        {
            let mut core = self.core();
            if core.is_locked {
                return Err(Error::ScopeLocked {
                    scope: self.inner.name.clone(),
                });
            }
            let collision = core
                .macros
                .collision(name, kind, |n| core.actions.contains_key(n));
            if let Some(existing) = collision {
                return Err(Error::ReservedName {
                    scope: self.inner.name.clone(),
                    name: name.to_string(),
                    existing,
                });
            }
            core.macros.insert(name, kind, erased);
        }

        debug!(scope = %self.inner.name, macro_name = %name, %kind, "macro registered");
        self.change(ScopeChangeKind::RegisterMacro {
            macro_name: name.to_string(),
            kind,
        });
        Ok(())
    }

    /// Call a function macro.
    pub fn call_macro<A: Any, R: Any>(&self, name: &str, args: A) -> Result<R, Error> {
        self.invoke_macro(name, MacroKind::Function, &args)
    }

    /// Read a getter macro.
    pub fn get<R: Any>(&self, name: &str) -> Result<R, Error> {
        self.invoke_macro(name, MacroKind::Getter, &())
    }

    /// Write a setter macro.
    pub fn set<A: Any>(&self, name: &str, value: A) -> Result<(), Error> {
        self.invoke_macro(name, MacroKind::Setter, &value)
    }

    /// Kinds registered under a macro name.
    pub fn macro_kinds(&self, name: &str) -> Vec<MacroKind> {
        self.core().macros.kinds(name)
    }

    fn invoke_macro<R: Any>(&self, name: &str, kind: MacroKind, arg: &dyn Any) -> Result<R, Error> {
        let f = self
            .core()
            .macros
            .get(name, kind)
            .ok_or_else(|| Error::UnknownMacro {
                scope: self.inner.name.clone(),
                name: name.to_string(),
                kind,
            })?;

        let out = f(self, arg).map_err(|e| match e.downcast::<Error>() {
            Ok(err) => err,
            Err(source) => Error::MacroFailed {
                scope: self.inner.name.clone(),
                name: name.to_string(),
                source,
            },
        })?;

        out.downcast::<R>()
            .map(|value| *value)
            .map_err(|_| Error::MacroTypeMismatch {
                name: name.to_string(),
                expected: type_name::<R>(),
            })
    }

    /// Typed dispatcher for a registered action, if its props type is `P`.
    pub fn get_action<P: Any + Send + Sync>(&self, name: &str) -> Option<Dispatcher<T, P>> {
        let core = self.core();
        let entry = core.actions.get(name)?;
        if entry.props_type != TypeId::of::<P>() {
            return None;
        }
        Some(Dispatcher {
            scope: self.clone(),
            action_name: name.into(),
            transform: Arc::new(|state: Frozen<T>, _: &P| state),
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch an action and publish its event.
    pub fn dispatch<P: Any + Send + Sync>(
        &self,
        action_name: &str,
        props: P,
    ) -> Result<Frozen<T>, DispatchError<T>> {
        self.dispatch_with(action_name, props, true)
    }

    /// Dispatch an action; publish its event only if `emit_event`.
    pub fn dispatch_with<P: Any + Send + Sync>(
        &self,
        action_name: &str,
        props: P,
        emit_event: bool,
    ) -> Result<Frozen<T>, DispatchError<T>> {
        self.dispatch_props(action_name, Arc::new(props), emit_event)
    }

    /// Dispatch with already-erased props.
    pub fn dispatch_props(
        &self,
        action_name: &str,
        props: Props,
        emit_event: bool,
    ) -> Result<Frozen<T>, DispatchError<T>> {
        let (action, old_state, role) = self.begin(action_name, &props)?;

        let ctx = ActionContext {
            scope_name: &self.inner.name,
            store_name: self.inner.store_name.as_deref(),
            action_name,
            is_nested: matches!(role, Role::Nested { .. }),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            Next::new(&ctx, &self.inner.middleware, &action).run(&old_state, &props)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    scope = %self.inner.name,
                    action = %action_name,
                    panic = %message,
                    "action panicked"
                );
                Err(anyhow::anyhow!("action {} panicked: {}", action_name, message))
            }
        };

        match result {
            Ok(new_state) => {
                let new_state = freeze(new_state);
                let (id, parent) = match role {
                    Role::Root { id } => (id, None),
                    Role::Nested { root_id, .. } => (EventId::new(), Some(root_id)),
                };
                let event = ScopeEvent {
                    id,
                    old_state,
                    new_state: new_state.clone(),
                    scope_name: self.inner.name.clone(),
                    store_name: self.inner.store_name.clone(),
                    action_name: action_name.to_string(),
                    props,
                    parent,
                    children: Vec::new(),
                    dispatched_at: Utc::now(),
                };
                self.complete(event, emit_event);
                Ok(new_state)
            }
            Err(reason) => Err(DispatchError::Action(self.fail(
                role,
                ScopeError {
                    reason: Arc::new(reason),
                    old_state,
                    scope_name: self.inner.name.clone(),
                    store_name: self.inner.store_name.clone(),
                    action_name: action_name.to_string(),
                    props,
                },
            ))),
        }
    }

    /// Resolve the action and claim the dispatch slot.
    fn begin(
        &self,
        action_name: &str,
        props: &Props,
    ) -> Result<(ActionFn<T>, Frozen<T>, Role<T>), Error> {
        let mut core = self.core();
        let entry = core
            .actions
            .get(action_name)
            .ok_or_else(|| Error::UnknownAction {
                scope: self.inner.name.clone(),
                action: action_name.to_string(),
            })?;
        if !(entry.accepts)(props) {
            return Err(Error::PropsTypeMismatch {
                action: action_name.to_string(),
                expected: entry.props_type_name,
            });
        }
        let action = Arc::clone(&entry.action);

        let current = thread::current().id();
        let frame = core
            .dispatch
            .as_ref()
            .map(|frame| (frame.owner, frame.root_id, frame.staged_initial.clone()));
        match frame {
            Some((owner, root_id, staged)) if owner == current => {
                let old_state = core.context.clone().unwrap_or_else(|| core.state.clone());
                Ok((action, old_state, Role::Nested { root_id, staged }))
            }
            Some(_) => Err(Error::DispatchUnavailable {
                scope: self.inner.name.clone(),
                action: action_name.to_string(),
            }),
            None => {
                let id = EventId::new();
                core.dispatch = Some(DispatchFrame {
                    owner: current,
                    root_id: id,
                    children: Vec::new(),
                    staged_initial: None,
                });
                Ok((action, core.state.clone(), Role::Root { id }))
            }
        }
    }

    fn complete(&self, mut event: ScopeEvent<T>, emit_event: bool) {
        if event.is_nested() {
            let mut core = self.core();
            core.context = Some(event.new_state.clone());
            if emit_event {
                if let Some(frame) = core.dispatch.as_mut() {
                    frame.children.push(event);
                }
            }
            return;
        }

        let children = {
            let mut core = self.core();
            core.state = event.new_state.clone();
            core.context = None;
            match core.dispatch.take() {
                Some(frame) => {
                    if let Some(initial) = frame.staged_initial {
                        write_initial(&self.inner.initial, initial);
                    }
                    frame.children
                }
                None => Vec::new(),
            }
        };

        debug!(
            scope = %self.inner.name,
            action = %event.action_name,
            children = children.len(),
            "dispatch committed"
        );

        if emit_event {
            for child in &children {
                self.publish(child);
            }
            event.children = children;
            self.publish(&event);
        }
    }

    fn fail(&self, role: Role<T>, err: ScopeError<T>) -> ScopeError<T> {
        match role {
            Role::Nested { staged, .. } => {
                // A failed nested restore must not rebase the root's reset target.
                if let Some(frame) = self.core().dispatch.as_mut() {
                    frame.staged_initial = staged;
                }
            }
            Role::Root { .. } => {
                {
                    let mut core = self.core();
                    core.context = None;
                    core.dispatch = None;
                }
                debug!(
                    scope = %self.inner.name,
                    action = %err.action_name,
                    error = %err.reason,
                    "action failed"
                );
                self.inner.dev_tool.action_error(&err);
            }
        }
        err
    }

    /// Devtool first, then listeners.
    fn publish(&self, event: &ScopeEvent<T>) {
        self.inner.dev_tool.action(event);
        self.inner.listeners.notify(event, |listener_id, reason| {
            warn!(
                scope = %event.scope_name,
                action = %event.action_name,
                listener = %listener_id,
                error = %reason,
                "listener failed"
            );
            let err = ScopeError {
                reason: Arc::new(reason),
                old_state: event.new_state.clone(),
                scope_name: event.scope_name.clone(),
                store_name: event.store_name.clone(),
                action_name: event.action_name.clone(),
                props: Arc::clone(&event.props),
            };
            self.inner.dev_tool.listener_error(&err);
        });
    }

    /// Dispatch the builtin `reset`.
    pub fn reset(&self) -> Result<Frozen<T>, DispatchError<T>> {
        self.reset_with(true)
    }

    pub fn reset_with(&self, emit_event: bool) -> Result<Frozen<T>, DispatchError<T>> {
        self.dispatch_with(RESET_ACTION, (), emit_event)
    }

    /// Dispatch the builtin `restore`, making `state` the new initial snapshot.
    pub fn restore(&self, state: T) -> Result<Frozen<T>, DispatchError<T>> {
        self.restore_with(state, true)
    }

    pub fn restore_with(&self, state: T, emit_event: bool) -> Result<Frozen<T>, DispatchError<T>> {
        self.dispatch_with(RESTORE_ACTION, state, emit_event)
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Subscribe to the named actions; an empty list receives every event.
    pub fn subscribe<F>(&self, listener: F, action_names: &[&str]) -> Result<Subscription, Error>
    where
        F: Fn(&ScopeEvent<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_listener(Arc::new(listener), action_names)
    }

    /// Subscribe to every event of this scope.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ScopeEvent<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(listener), Vec::new())
    }

    pub fn subscribe_listener(
        &self,
        listener: Listener<T>,
        action_names: &[&str],
    ) -> Result<Subscription, Error> {
        {
            let core = self.core();
            if let Some(unknown) = action_names.iter().find(|name| !core.actions.contains_key(**name)) {
                return Err(Error::UnknownAction {
                    scope: self.inner.name.clone(),
                    action: unknown.to_string(),
                });
            }
        }
        Ok(self.add_listener(
            listener,
            action_names.iter().map(|name| name.to_string()).collect(),
        ))
    }

    fn add_listener(&self, listener: Listener<T>, filter: Vec<String>) -> Subscription {
        let listener_id = self.inner.listeners.add(listener, filter);
        debug!(scope = %self.inner.name, listener = %listener_id, "listener subscribed");
        let owner: Weak<dyn Unsubscribe> = Arc::downgrade(&self.inner.listeners) as Weak<ListenerSet<T>>;
        Subscription::new(listener_id, owner)
    }

    /// Remove a listener. Returns whether it was subscribed.
    pub fn unsubscribe(&self, listener_id: &str) -> bool {
        self.inner.listeners.remove(listener_id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // =========================================================================
    // Lock and Read Surface
    // =========================================================================

    /// Refuse further actions and macros. Irreversible; repeated calls are no-ops.
    pub fn lock(&self) {
        let newly_locked = !std::mem::replace(&mut self.core().is_locked, true);
        if newly_locked {
            debug!(scope = %self.inner.name, "scope locked");
            self.change(ScopeChangeKind::Lock);
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current committed snapshot.
    pub fn state(&self) -> Frozen<T> {
        self.core().state.clone()
    }

    /// In-flight state of the running dispatch, if nested dispatches produced one.
    pub fn context(&self) -> Option<Frozen<T>> {
        self.core().context.clone()
    }

    /// The snapshot `reset` returns to.
    pub fn initial_state(&self) -> Frozen<T> {
        read_initial(&self.inner.initial)
    }

    /// The owning store, if this scope belongs to one that is still alive.
    pub fn store(&self) -> Option<Store> {
        self.inner.store.as_ref().and_then(WeakStore::upgrade)
    }

    pub fn store_name(&self) -> Option<&str> {
        self.inner.store_name.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.core().is_locked
    }

    /// True if a dispatch from the calling thread would be accepted now.
    pub fn is_action_dispatch_available(&self) -> bool {
        match &self.core().dispatch {
            None => true,
            Some(frame) => frame.owner == thread::current().id(),
        }
    }

    /// Reported to the devtool and to callers only. Snapshots are always
    /// [`Frozen`] whatever this returns.
    pub fn is_immutability_enabled(&self) -> bool {
        self.inner.is_immutability_enabled
    }

    pub fn is_subscribed_macro_auto_create_enabled(&self) -> bool {
        self.inner.is_subscribed_macro_auto_create_enabled
    }

    /// Registered action names, builtins first, then in registration order.
    pub fn support_actions(&self) -> Vec<String> {
        self.core().action_order.clone()
    }

    pub fn supports_action(&self, name: &str) -> bool {
        self.core().actions.contains_key(name)
    }

    pub(crate) fn dev_tool(&self) -> &Arc<DevTool> {
        &self.inner.dev_tool
    }
}

impl<T: State> fmt::Debug for Scope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("store_name", &self.inner.store_name)
            .field("state", &self.state())
            .field("is_locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatches one action of one scope. Returned by `register_action`.
pub struct Dispatcher<T: State, P, R = Frozen<T>> {
    scope: Scope<T>,
    action_name: Arc<str>,
    transform: Arc<dyn Fn(Frozen<T>, &P) -> R + Send + Sync>,
}

impl<T: State, P, R> Clone for Dispatcher<T, P, R> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            action_name: Arc::clone(&self.action_name),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T: State, P: Any + Send + Sync, R> Dispatcher<T, P, R> {
    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn scope(&self) -> &Scope<T> {
        &self.scope
    }

    pub fn dispatch(&self, props: P) -> Result<R, DispatchError<T>> {
        self.dispatch_with(props, true)
    }

    pub fn dispatch_with(&self, props: P, emit_event: bool) -> Result<R, DispatchError<T>> {
        let props = Arc::new(props);
        let erased: Props = props.clone();
        let state = self
            .scope
            .dispatch_props(&self.action_name, erased, emit_event)?;
        Ok((self.transform)(state, &props))
    }
}

impl<T: State, P, R> fmt::Debug for Dispatcher<T, P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("scope", &self.scope.name())
            .field("action_name", &self.action_name)
            .finish_non_exhaustive()
    }
}
