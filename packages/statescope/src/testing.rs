//! Testing utilities.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! statescope = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording Devtool Calls
//!
//! ```ignore
//! use statescope::testing::RecordingDevTool;
//!
//! let recorder = RecordingDevTool::new();
//! let registry = Registry::with_dev_tool(recorder.dev_tool());
//!
//! // ... create stores and scopes, dispatch ...
//!
//! assert_eq!(recorder.action_names(), vec!["increment"]);
//! assert!(recorder.action_errors().is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::devtool::{
    DevTool, DevToolHandlers, ScopeChange, ScopeCreated, StoreChange, StoreCreated,
};
use crate::error::ScopeError;
use crate::event::ScopeEvent;

/// Maximum number of records retained by default.
const DEFAULT_CAPACITY: usize = 1000;

/// One devtool call.
#[derive(Debug, Clone)]
pub enum DevToolRecord {
    CreateStore(StoreCreated),
    ChangeStore(StoreChange),
    CreateScope(ScopeCreated),
    ChangeScope(ScopeChange),
    Action(ScopeEvent<Value>),
    ActionError(ScopeError<Value>),
    ListenerError(ScopeError<Value>),
}

/// Devtool that records every call it receives, in order.
///
/// Clones share the same record buffer. Only the most recent `capacity`
/// records are kept.
#[derive(Debug, Clone)]
pub struct RecordingDevTool {
    records: Arc<Mutex<VecDeque<DevToolRecord>>>,
    capacity: usize,
}

impl Default for RecordingDevTool {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevTool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)))),
            capacity: capacity.max(1),
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<DevToolRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, record: DevToolRecord) {
        let mut records = self.lock_records();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn collect<R>(&self, pick: impl Fn(&DevToolRecord) -> Option<R>) -> Vec<R> {
        self.lock_records().iter().filter_map(pick).collect()
    }

    /// Handlers that append to this recorder.
    pub fn handlers(&self) -> DevToolHandlers {
        let create_store = self.clone();
        let change_store = self.clone();
        let create_scope = self.clone();
        let change_scope = self.clone();
        let action = self.clone();
        let action_error = self.clone();
        let listener_error = self.clone();

        DevToolHandlers::new()
            .on_create_store(move |p| create_store.record(DevToolRecord::CreateStore(p.clone())))
            .on_change_store(move |p| change_store.record(DevToolRecord::ChangeStore(p.clone())))
            .on_create_scope(move |p| create_scope.record(DevToolRecord::CreateScope(p.clone())))
            .on_change_scope(move |p| change_scope.record(DevToolRecord::ChangeScope(p.clone())))
            .on_action(move |e| action.record(DevToolRecord::Action(e.clone())))
            .on_action_error(move |e| action_error.record(DevToolRecord::ActionError(e.clone())))
            .on_action_listener_error(move |e| {
                listener_error.record(DevToolRecord::ListenerError(e.clone()))
            })
    }

    /// Install the recording handlers into an existing devtool.
    pub fn install(&self, dev_tool: &DevTool) {
        dev_tool.set(self.handlers());
    }

    /// A fresh devtool with only the recording handlers installed.
    pub fn dev_tool(&self) -> Arc<DevTool> {
        DevTool::with_handlers(self.handlers())
    }

    pub fn records(&self) -> Vec<DevToolRecord> {
        self.lock_records().iter().cloned().collect()
    }

    pub fn actions(&self) -> Vec<ScopeEvent<Value>> {
        self.collect(|r| match r {
            DevToolRecord::Action(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Action names of published events, in publication order.
    pub fn action_names(&self) -> Vec<String> {
        self.collect(|r| match r {
            DevToolRecord::Action(e) => Some(e.action_name.clone()),
            _ => None,
        })
    }

    pub fn action_errors(&self) -> Vec<ScopeError<Value>> {
        self.collect(|r| match r {
            DevToolRecord::ActionError(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn listener_errors(&self) -> Vec<ScopeError<Value>> {
        self.collect(|r| match r {
            DevToolRecord::ListenerError(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn created_stores(&self) -> Vec<StoreCreated> {
        self.collect(|r| match r {
            DevToolRecord::CreateStore(p) => Some(p.clone()),
            _ => None,
        })
    }

    pub fn store_changes(&self) -> Vec<StoreChange> {
        self.collect(|r| match r {
            DevToolRecord::ChangeStore(p) => Some(p.clone()),
            _ => None,
        })
    }

    pub fn created_scopes(&self) -> Vec<ScopeCreated> {
        self.collect(|r| match r {
            DevToolRecord::CreateScope(p) => Some(p.clone()),
            _ => None,
        })
    }

    pub fn scope_changes(&self) -> Vec<ScopeChange> {
        self.collect(|r| match r {
            DevToolRecord::ChangeScope(p) => Some(p.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.lock_records().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devtool::StoreChangeKind;

    #[test]
    fn test_records_in_order() {
        let recorder = RecordingDevTool::new();
        let dev_tool = recorder.dev_tool();
        dev_tool.create_store(|| StoreCreated {
            store_name: "app".into(),
            is_frozen: true,
        });
        dev_tool.change_store(|| StoreChange {
            store_name: "app".into(),
            kind: StoreChangeKind::Lock,
        });

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], DevToolRecord::CreateStore(_)));
        assert!(matches!(records[1], DevToolRecord::ChangeStore(_)));
        assert_eq!(recorder.created_stores()[0].store_name, "app");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let recorder = RecordingDevTool::with_capacity(2);
        let dev_tool = recorder.dev_tool();
        for name in ["a", "b", "c"] {
            dev_tool.create_store(|| StoreCreated {
                store_name: name.into(),
                is_frozen: false,
            });
        }
        let names: Vec<_> = recorder
            .created_stores()
            .into_iter()
            .map(|s| s.store_name)
            .collect();
        assert_eq!(names, vec!["b", "c"]);

        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_clones_share_buffer() {
        let recorder = RecordingDevTool::new();
        let clone = recorder.clone();
        let dev_tool = DevTool::new();
        clone.install(&dev_tool);
        dev_tool.change_store(|| StoreChange {
            store_name: "app".into(),
            kind: StoreChangeKind::Reset,
        });
        assert_eq!(recorder.len(), 1);
    }
}
