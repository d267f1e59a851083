//! Listeners - observe committed dispatches.
//!
//! A listener is called once per published [`ScopeEvent`] whose action passes
//! its filter. Listeners run after the dispatch committed, so nothing they do
//! can roll the transition back.
//!
//! Failures are isolated: an error return or a panic in one listener is
//! reported and never stops delivery to the listeners after it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use smallvec::SmallVec;

use crate::error::panic_message;
use crate::event::ScopeEvent;
use crate::id::{IdGenerator, LISTENER_PREFIX};

/// A subscribed callback.
pub type Listener<T> = Arc<dyn Fn(&ScopeEvent<T>) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<T, F>(f: F) -> Listener<T>
where
    F: Fn(&ScopeEvent<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Entry<T> {
    id: String,
    /// Empty means every action.
    filter: SmallVec<[String; 2]>,
    callback: Listener<T>,
}

impl<T> Entry<T> {
    fn accepts(&self, action_name: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|name| name == action_name)
    }
}

/// Ordered set of listeners owned by one scope.
pub(crate) struct ListenerSet<T> {
    ids: IdGenerator,
    entries: Mutex<Vec<Arc<Entry<T>>>>,
}

impl<T> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            ids: IdGenerator::new(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<Arc<Entry<T>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `callback` and return its id.
    pub fn add(&self, callback: Listener<T>, filter: impl IntoIterator<Item = String>) -> String {
        let id = self.ids.next(LISTENER_PREFIX);
        self.lock_entries().push(Arc::new(Entry {
            id: id.clone(),
            filter: filter.into_iter().collect(),
            callback,
        }));
        id
    }

    /// Remove a listener. Returns whether it was present.
    pub fn remove(&self, listener_id: &str) -> bool {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|entry| entry.id != listener_id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Deliver `event` to every matching listener, in subscription order.
    ///
    /// The set is snapshotted first: listeners added or removed during
    /// delivery take effect from the next event.
    pub fn notify(&self, event: &ScopeEvent<T>, mut on_failure: impl FnMut(&str, anyhow::Error)) {
        let snapshot: Vec<_> = self
            .lock_entries()
            .iter()
            .filter(|entry| entry.accepts(&event.action_name))
            .cloned()
            .collect();

        for entry in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => anyhow::anyhow!(
                    "listener panicked: {}",
                    panic_message(panic.as_ref())
                ),
            };
            on_failure(&entry.id, failure);
        }
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Something a listener can be removed from.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, listener_id: &str) -> bool;
}

impl<T: 'static> Unsubscribe for ListenerSet<T> {
    fn unsubscribe(&self, listener_id: &str) -> bool {
        self.remove(listener_id)
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle keeps the listener subscribed; call
/// [`Subscription::unsubscribe`] (or the owner's `unsubscribe(id)`) to remove it.
#[derive(Clone)]
pub struct Subscription {
    listener_id: String,
    owner: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(listener_id: String, owner: Weak<dyn Unsubscribe>) -> Self {
        Self { listener_id, owner }
    }

    /// Id accepted by the owner's `unsubscribe(id)`.
    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    /// Remove the listener. Returns whether it was still subscribed.
    pub fn unsubscribe(&self) -> bool {
        self.owner
            .upgrade()
            .map(|owner| owner.unsubscribe(&self.listener_id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("listener_id", &self.listener_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{props, EventId};
    use crate::frozen::freeze;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(action: &str) -> ScopeEvent<i64> {
        ScopeEvent {
            id: EventId::new(),
            old_state: freeze(0),
            new_state: freeze(1),
            scope_name: "counter".into(),
            store_name: None,
            action_name: action.into(),
            props: props(()),
            parent: None,
            children: Vec::new(),
            dispatched_at: Utc::now(),
        }
    }

    fn counting(count: &Arc<AtomicUsize>) -> Listener<i64> {
        let count = count.clone();
        listener(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_filter_limits_delivery() {
        let set = ListenerSet::new();
        let all = Arc::new(AtomicUsize::new(0));
        let only_a = Arc::new(AtomicUsize::new(0));
        set.add(counting(&all), Vec::new());
        set.add(counting(&only_a), vec!["A".to_string()]);

        set.notify(&event("A"), |_, _| panic!("no failures expected"));
        set.notify(&event("B"), |_, _| panic!("no failures expected"));

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(only_a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_do_not_stop_fan_out() {
        let set = ListenerSet::new();
        let reached = Arc::new(AtomicUsize::new(0));
        let failing = set.add(listener(|_| anyhow::bail!("nope")), Vec::new());
        let panicking = set.add(listener(|_| panic!("listener bug")), Vec::new());
        set.add(counting(&reached), Vec::new());

        let mut failed = Vec::new();
        set.notify(&event("A"), |id, reason| failed.push((id.to_string(), reason.to_string())));

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0], (failing, "nope".to_string()));
        assert_eq!(failed[1].0, panicking);
        assert!(failed[1].1.contains("listener bug"));
    }

    #[test]
    fn test_subscription_unsubscribes_once() {
        let set = Arc::new(ListenerSet::<i64>::new());
        let id = set.add(listener(|_| Ok(())), Vec::new());
        let owner: Weak<dyn Unsubscribe> = Arc::downgrade(&set) as Weak<ListenerSet<i64>>;
        let subscription = Subscription::new(id, owner);

        assert_eq!(subscription.listener_id(), "listener-1");
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_subscription_outliving_owner() {
        let set = Arc::new(ListenerSet::<i64>::new());
        let id = set.add(listener(|_| Ok(())), Vec::new());
        let owner: Weak<dyn Unsubscribe> = Arc::downgrade(&set) as Weak<ListenerSet<i64>>;
        let subscription = Subscription::new(id, owner);
        drop(set);
        assert!(!subscription.unsubscribe());
    }
}
