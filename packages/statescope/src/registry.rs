//! Registry - named stores and the devtool they share.

use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::StoreConfig;
use crate::devtool::{DevTool, DevToolHandlers};
use crate::error::{Error, NameKind};
use crate::id::{IdGenerator, STORE_PREFIX};
use crate::store::Store;

/// Owns stores by name and hands its devtool to each of them.
///
/// Tests and embedders that need isolation construct their own registry;
/// [`Registry::global`] is a shared instance for everyone else.
#[derive(Default)]
pub struct Registry {
    stores: DashMap<String, Store>,
    ids: IdGenerator,
    dev_tool: Arc<DevTool>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose stores report to `dev_tool`.
    pub fn with_dev_tool(dev_tool: Arc<DevTool>) -> Self {
        Self {
            stores: DashMap::new(),
            ids: IdGenerator::new(),
            dev_tool,
        }
    }

    /// Process-wide registry, created on first use.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn is_store_exist(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Create a store. The name is generated when absent.
    pub fn create_store(&self, config: StoreConfig) -> Result<Store, Error> {
        let name = match config.name {
            Some(name) => name,
            None => loop {
                let name = self.ids.next(STORE_PREFIX);
                if !self.stores.contains_key(&name) {
                    break name;
                }
            },
        };

        let store = match self.stores.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateName {
                    kind: NameKind::Store,
                    name,
                })
            }
            Entry::Vacant(slot) => {
                let store = Store::build(name, config.is_frozen, Arc::clone(&self.dev_tool));
                slot.insert(store.clone());
                store
            }
        };

        self.dev_tool.create_store(|| store.created_payload());
        Ok(store)
    }

    pub fn get_store(&self, name: &str) -> Option<Store> {
        self.stores.get(name).map(|entry| entry.value().clone())
    }

    /// Store names, sorted.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// `{store: {scope: state}}` across every store.
    pub fn get_state(&self) -> Result<Value, Error> {
        let stores: Vec<Store> = self.stores.iter().map(|entry| entry.value().clone()).collect();
        let mut state = Map::new();
        for store in stores {
            state.insert(store.name().to_string(), Value::Object(store.state()?));
        }
        Ok(Value::Object(state))
    }

    /// Merge handlers into the devtool shared by every store of this registry.
    pub fn set_store_dev_tool(&self, handlers: DevToolHandlers) {
        debug!(installed = handlers.installed(), "devtool handlers updated");
        self.dev_tool.set(handlers);
    }

    pub fn dev_tool(&self) -> &Arc<DevTool> {
        &self.dev_tool
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stores", &self.store_names())
            .field("dev_tool", &self.dev_tool)
            .finish()
    }
}
