//! The collection registry (spec §4.9): a caller-owned, id-keyed lookup from
//! collection name to handle, grounded on the teacher's `TraceManager`
//! (`interactive/src/manager.rs`) — an explicit `HashMap<String, ...>` owned
//! by a value the embedder constructs and threads through, rather than a
//! global mutable singleton.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::collection::Collection;
use crate::key::Key;
use crate::query::CollectionSource;

/// Registers collections under a name so queries can reference them by
/// `collection` id instead of holding direct handles (spec §4.9: "named
/// collections are registered once and looked up by id wherever a query
/// references them").
#[derive(Clone, Default)]
pub struct Runtime {
    collections: Rc<RefCell<HashMap<String, Collection<serde_json::Value>>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime::default()
    }

    /// Registers `collection` under `name`, replacing any prior registrant
    /// (spec §4.9: re-registering an id is not an error, it supersedes).
    pub fn register(&self, name: impl Into<String>, collection: Collection<serde_json::Value>) {
        self.collections.borrow_mut().insert(name.into(), collection);
    }

    pub fn deregister(&self, name: &str) -> Option<Collection<serde_json::Value>> {
        self.collections.borrow_mut().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Collection<serde_json::Value>> {
        self.collections.borrow().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.borrow().keys().cloned().collect()
    }
}

impl CollectionSource for Runtime {
    fn visible_rows(&self, name: &str) -> Option<Vec<(Key, serde_json::Value)>> {
        self.get(name).map(|c| c.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionConfig, SyncHandle};
    use std::rc::Rc as StdRc;

    #[test]
    fn register_and_lookup_round_trips() {
        let runtime = Runtime::new();
        let config = CollectionConfig::new(
            "users",
            |v: &serde_json::Value| Key::Int(v["id"].as_i64().unwrap_or(0)),
            StdRc::new(|handle: SyncHandle<serde_json::Value>| {
                handle.begin();
                Box::new(|| {}) as Box<dyn FnOnce()>
            }),
        );
        let collection = Collection::new(config);
        runtime.register("users", collection.clone());
        assert!(runtime.get("users").is_some());
        assert!(runtime.deregister("users").is_some());
        assert!(runtime.get("users").is_none());
    }
}
