//! `NamespacedRow` — `{ [alias]: record }` (spec §3, Glossary).
//!
//! Joins merge namespaces; the final projection is stored under the
//! reserved key [`SELECT_RESULTS`] while the namespaced row itself survives
//! so `ORDER BY` can still reach into joined-but-unselected fields (spec
//! Glossary "`__select_results`").
//!
//! Query rows are represented with `serde_json::Value` records specifically
//! (not the crate-wide generic `R: Row`): a join merges fields from multiple
//! collections that may each use a different opaque record shape, and the
//! only record representation this engine ships with addressable fields for
//! is `serde_json::Value` (see [`crate::value::Row`] impl). Collections that
//! want to participate in a join or projection store JSON objects; a
//! collection of some other opaque `R` can still be mutated/subscribed to
//! directly (§4.3) without ever touching the query layer.

use std::collections::BTreeMap;

use crate::key::Key;
use crate::value::{json_to_dyn, DynValue};

/// Reserved slot holding the projected row while the namespaced row is kept
/// around for `ORDER BY` (spec Glossary).
pub const SELECT_RESULTS: &str = "__select_results";

/// `{ [alias]: record }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespacedRow(pub BTreeMap<String, serde_json::Value>);

impl NamespacedRow {
    pub fn single(alias: impl Into<String>, value: serde_json::Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert(alias.into(), value);
        NamespacedRow(map)
    }

    pub fn get(&self, alias: &str) -> Option<&serde_json::Value> {
        self.0.get(alias)
    }

    /// Merges `other` into `self`; `other`'s aliases win on collision (spec
    /// §4.7.1 step 4: "right side overwrites on collision — joined aliases
    /// are always disjoint by construction" — the overwrite rule is kept
    /// even though well-formed joins never actually collide).
    pub fn merged_with(&self, other: &NamespacedRow) -> NamespacedRow {
        let mut map = self.0.clone();
        for (k, v) in &other.0 {
            map.insert(k.clone(), v.clone());
        }
        NamespacedRow(map)
    }

    /// Resolves `Ref{ path }`: `path[0]` is the alias, the rest is a
    /// field-access path into that alias's record.
    pub fn resolve(&self, path: &[String]) -> DynValue {
        match path.split_first() {
            Some((alias, rest)) => match self.get(alias) {
                Some(value) => field_path(value, rest),
                None => DynValue::Null,
            },
            None => DynValue::Null,
        }
    }

    /// Stores the projected `__select_results` value, without losing the
    /// namespaced row underneath it.
    pub fn with_select_result(&self, value: serde_json::Value) -> NamespacedRow {
        let mut map = self.0.clone();
        map.insert(SELECT_RESULTS.to_string(), value);
        NamespacedRow(map)
    }

    pub fn select_result(&self) -> Option<&serde_json::Value> {
        self.0.get(SELECT_RESULTS)
    }
}

fn field_path(value: &serde_json::Value, path: &[String]) -> DynValue {
    let mut cur = value;
    for segment in path {
        match cur.get(segment) {
            Some(next) => cur = next,
            None => return DynValue::Null,
        }
    }
    json_to_dyn(cur)
}

/// A row paired with its collection key, threaded through the pipeline
/// stages (spec §4.2 "typed keyed streams").
#[derive(Debug, Clone)]
pub struct KeyedRow {
    pub key: Key,
    pub row: NamespacedRow,
    /// Set by the order-by operator (spec §4.7.1 step 9): "a synthetic
    /// `orderByIndex` used by consumers to sort".
    pub order_by_index: Option<usize>,
}

impl KeyedRow {
    pub fn new(key: Key, row: NamespacedRow) -> Self {
        KeyedRow { key, row, order_by_index: None }
    }
}
