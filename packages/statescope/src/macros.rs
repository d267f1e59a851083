//! Macros - auxiliary callables, getters and setters over a scope.
//!
//! Macros are reached through the scope's capability map
//! ([`Scope::call_macro`], [`Scope::get`], [`Scope::set`]) rather than by
//! adding members to the scope itself. A name may hold one function macro, or
//! a getter and a setter side by side (a read/write computed property).
//!
//! # Collision Rules
//!
//! | Registering | Collides with                                                  |
//! |-------------|----------------------------------------------------------------|
//! | Function    | any reserved scope member, any action, any macro of that name  |
//! | Getter      | a reserved getter member (`state`, `name`, ...) or a getter    |
//! | Setter      | an existing setter                                             |

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scope::{Scope, State};

/// How a macro is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacroKind {
    /// Called with an argument, returns a value.
    #[default]
    Function,
    /// Computed read-only property.
    Getter,
    /// Computed write property.
    Setter,
}

impl fmt::Display for MacroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroKind::Function => write!(f, "function"),
            MacroKind::Getter => write!(f, "getter"),
            MacroKind::Setter => write!(f, "setter"),
        }
    }
}

/// The existing member a new name collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// One of the scope's own methods.
    ReservedFunction,
    /// One of the scope's own read-only properties.
    ReservedGetter,
    /// A registered action.
    Action,
    /// A registered macro.
    Macro(MacroKind),
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::ReservedFunction => write!(f, "reserved method"),
            MemberKind::ReservedGetter => write!(f, "reserved property"),
            MemberKind::Action => write!(f, "action"),
            MemberKind::Macro(kind) => write!(f, "{} macro", kind),
        }
    }
}

/// Scope methods no function macro may shadow.
pub const RESERVED_FUNCTIONS: &[&str] = &[
    "register_action",
    "register_action_with_transformer",
    "register_macro",
    "call_macro",
    "get",
    "set",
    "get_action",
    "dispatch",
    "dispatch_with",
    "subscribe",
    "subscribe_all",
    "unsubscribe",
    "lock",
    "reset",
    "restore",
];

/// Scope properties no function macro or getter may shadow.
pub const RESERVED_GETTERS: &[&str] = &[
    "name",
    "state",
    "context",
    "store",
    "store_name",
    "is_locked",
    "is_action_dispatch_available",
    "is_immutability_enabled",
    "is_subscribed_macro_auto_create_enabled",
    "support_actions",
];

/// Returns true if `name` is one of the scope's own members.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_FUNCTIONS.contains(&name) || RESERVED_GETTERS.contains(&name)
}

/// Name of the subscription macro derived for an action: `increment` -> `onIncrement`.
pub fn subscription_macro_name(action_name: &str) -> String {
    let mut chars = action_name.chars();
    match chars.next() {
        Some(first) => format!("on{}{}", first.to_uppercase(), chars.as_str()),
        None => "on".to_string(),
    }
}

/// Type-erased macro body. Receives the scope and the argument, returns the result.
pub type MacroFn<T> =
    Arc<dyn Fn(&Scope<T>, &dyn Any) -> anyhow::Result<Box<dyn Any + Send>> + Send + Sync>;

struct MacroSlot<T: State> {
    function: Option<MacroFn<T>>,
    getter: Option<MacroFn<T>>,
    setter: Option<MacroFn<T>>,
}

impl<T: State> Default for MacroSlot<T> {
    fn default() -> Self {
        Self {
            function: None,
            getter: None,
            setter: None,
        }
    }
}

impl<T: State> MacroSlot<T> {
    fn get(&self, kind: MacroKind) -> Option<&MacroFn<T>> {
        match kind {
            MacroKind::Function => self.function.as_ref(),
            MacroKind::Getter => self.getter.as_ref(),
            MacroKind::Setter => self.setter.as_ref(),
        }
    }

    fn first_kind(&self) -> Option<MacroKind> {
        [MacroKind::Function, MacroKind::Getter, MacroKind::Setter]
            .into_iter()
            .find(|kind| self.get(*kind).is_some())
    }
}

/// Registered macros of one scope.
pub(crate) struct MacroTable<T: State> {
    slots: HashMap<String, MacroSlot<T>>,
}

impl<T: State> MacroTable<T> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// The member `name` would collide with if registered as `kind`.
    pub fn collision(
        &self,
        name: &str,
        kind: MacroKind,
        is_action: impl FnOnce(&str) -> bool,
    ) -> Option<MemberKind> {
        let slot = self.slots.get(name);
        match kind {
            MacroKind::Function => {
                if RESERVED_FUNCTIONS.contains(&name) {
                    Some(MemberKind::ReservedFunction)
                } else if RESERVED_GETTERS.contains(&name) {
                    Some(MemberKind::ReservedGetter)
                } else if is_action(name) {
                    Some(MemberKind::Action)
                } else {
                    slot.and_then(MacroSlot::first_kind).map(MemberKind::Macro)
                }
            }
            MacroKind::Getter => {
                if RESERVED_GETTERS.contains(&name) {
                    Some(MemberKind::ReservedGetter)
                } else {
                    slot.and_then(|s| s.getter.as_ref())
                        .map(|_| MemberKind::Macro(MacroKind::Getter))
                }
            }
            MacroKind::Setter => slot
                .and_then(|s| s.setter.as_ref())
                .map(|_| MemberKind::Macro(MacroKind::Setter)),
        }
    }

    pub fn insert(&mut self, name: &str, kind: MacroKind, f: MacroFn<T>) {
        let slot = self.slots.entry(name.to_string()).or_default();
        match kind {
            MacroKind::Function => slot.function = Some(f),
            MacroKind::Getter => slot.getter = Some(f),
            MacroKind::Setter => slot.setter = Some(f),
        }
    }

    pub fn get(&self, name: &str, kind: MacroKind) -> Option<MacroFn<T>> {
        self.slots.get(name).and_then(|slot| slot.get(kind)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Every kind registered under `name`.
    pub fn kinds(&self, name: &str) -> Vec<MacroKind> {
        let Some(slot) = self.slots.get(name) else {
            return Vec::new();
        };
        [MacroKind::Function, MacroKind::Getter, MacroKind::Setter]
            .into_iter()
            .filter(|kind| slot.get(*kind).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MacroFn<i64> {
        Arc::new(|_, _| Ok(Box::new(())))
    }

    #[test]
    fn test_subscription_macro_name() {
        assert_eq!(subscription_macro_name("increment"), "onIncrement");
        assert_eq!(subscription_macro_name("setCounter"), "onSetCounter");
        assert_eq!(subscription_macro_name("über"), "onÜber");
    }

    #[test]
    fn test_function_collides_with_everything() {
        let mut table = MacroTable::<i64>::new();
        table.insert("total", MacroKind::Getter, noop());

        assert_eq!(
            table.collision("dispatch", MacroKind::Function, |_| false),
            Some(MemberKind::ReservedFunction)
        );
        assert_eq!(
            table.collision("state", MacroKind::Function, |_| false),
            Some(MemberKind::ReservedGetter)
        );
        assert_eq!(
            table.collision("increment", MacroKind::Function, |a| a == "increment"),
            Some(MemberKind::Action)
        );
        assert_eq!(
            table.collision("total", MacroKind::Function, |_| false),
            Some(MemberKind::Macro(MacroKind::Getter))
        );
        assert_eq!(table.collision("fresh", MacroKind::Function, |_| false), None);
    }

    #[test]
    fn test_getter_and_setter_only_collide_with_same_kind() {
        let mut table = MacroTable::<i64>::new();
        table.insert("value", MacroKind::Getter, noop());

        // A setter can sit next to a getter of the same name.
        assert_eq!(table.collision("value", MacroKind::Setter, |_| false), None);
        table.insert("value", MacroKind::Setter, noop());

        assert_eq!(
            table.collision("value", MacroKind::Getter, |_| false),
            Some(MemberKind::Macro(MacroKind::Getter))
        );
        assert_eq!(
            table.collision("value", MacroKind::Setter, |_| false),
            Some(MemberKind::Macro(MacroKind::Setter))
        );
        assert_eq!(table.kinds("value"), vec![MacroKind::Getter, MacroKind::Setter]);

        // Reserved getters are still off limits for getters, not for setters.
        assert_eq!(
            table.collision("state", MacroKind::Getter, |_| false),
            Some(MemberKind::ReservedGetter)
        );
        assert_eq!(table.collision("state", MacroKind::Setter, |_| false), None);
        // Actions only block function macros.
        assert_eq!(table.collision("increment", MacroKind::Getter, |_| true), None);
    }
}
