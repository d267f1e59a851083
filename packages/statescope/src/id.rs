//! Prefix-scoped unique identifiers.
//!
//! Listener handles, generated scope names and generated store names all come
//! from an [`IdGenerator`]. Ids from one generator never repeat: each prefix
//! keeps its own monotonically increasing counter.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use uuid::Uuid;

/// Prefix for listener ids (`listener-1`, `listener-2`, ...).
pub const LISTENER_PREFIX: &str = "listener";

/// Prefix for generated scope names.
pub const SCOPE_PREFIX: &str = "scope";

/// Prefix for generated composition scope names.
pub const COMPOSITION_PREFIX: &str = "composition";

/// Prefix for generated store names.
pub const STORE_PREFIX: &str = "store";

/// Generates collision-free string ids, one counter per prefix.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counters: DashMap<String, AtomicU64>,
}

impl IdGenerator {
    /// Create a generator with no issued ids.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Issue the next id for `prefix`, e.g. `scope-3`.
    pub fn next(&self, prefix: &str) -> String {
        let n = match self.counters.get(prefix) {
            Some(counter) => counter.fetch_add(1, Ordering::SeqCst),
            None => self
                .counters
                .entry(prefix.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::SeqCst),
        };
        format!("{}-{}", prefix, n + 1)
    }

    /// Issue a process-wide unique id for `prefix`.
    ///
    /// Used where no owning generator exists (free-standing scopes and stores).
    pub fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().simple())
    }
}
