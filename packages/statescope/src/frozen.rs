//! Read-only state snapshots.
//!
//! A [`Frozen<T>`] is the only form in which scope state leaves the engine. It
//! hands out shared references to the whole value graph and offers no mutable
//! access, so a snapshot observed by one listener is exactly the snapshot every
//! other listener (and every later action) observes.
//!
//! Producing a modified copy goes through [`Frozen::thaw`], which clones the
//! value; the snapshot itself is never touched.
//!
//! State types should not rely on interior mutability (`Cell`, `Mutex`, ...):
//! anything reachable through a snapshot is treated as immutable.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Freeze `value` into a shared read-only snapshot.
pub fn freeze<T>(value: T) -> Frozen<T> {
    Frozen::new(value)
}

/// Shared, immutable snapshot of a value.
pub struct Frozen<T: ?Sized>(Arc<T>);

impl<T> Frozen<T> {
    /// Freeze a value.
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Clone the frozen value out into an owned, mutable copy.
    pub fn thaw(&self) -> T
    where
        T: Clone,
    {
        (*self.0).clone()
    }
}

impl<T: ?Sized> Frozen<T> {
    /// Returns true if both snapshots share the same allocation.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T: ?Sized> Clone for Frozen<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> Deref for Frozen<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> AsRef<T> for Frozen<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Frozen<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized + PartialEq> PartialEq for Frozen<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl<T: ?Sized + Eq> Eq for Frozen<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Frozen<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for Frozen<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl<T: ?Sized + Serialize> Serialize for Frozen<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (*self.0).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Frozen<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Frozen::new)
    }
}
