//! Per-collection secondary indexes (spec §4.3.5).

use std::collections::{HashMap, HashSet};

use crate::key::Key;
use crate::ordered_map::OrderedMap;
use crate::value::{universal_cmp, DynValue, Row};

/// A comparison operator usable in an index range query (spec §4.3.4,
/// §4.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// An index over a single-row expression, evaluated with no namespacing
/// (spec §4.3.5: "compiles the expression against single-row access").
pub struct Index<R: Row> {
    name: String,
    expr: Box<dyn Fn(&R) -> DynValue>,
    value_map: HashMap<DynValue, HashSet<Key>>,
    ordered_entries: OrderedMap<DynValue, HashSet<Key>>,
    indexed_keys: HashSet<Key>,
}

impl<R: Row> Index<R> {
    pub fn new(name: impl Into<String>, expr: Box<dyn Fn(&R) -> DynValue>) -> Self {
        Index {
            name: name.into(),
            expr,
            value_map: HashMap::new(),
            ordered_entries: OrderedMap::new(universal_cmp),
            indexed_keys: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds the index from the full visible view (called once at
    /// `createIndex` time).
    pub fn build<'a>(&mut self, rows: impl Iterator<Item = (&'a Key, &'a R)>)
    where
        R: 'a,
    {
        for (key, value) in rows {
            self.on_insert(key, value);
        }
    }

    pub fn evaluate(&self, value: &R) -> DynValue {
        (self.expr)(value)
    }

    pub fn on_insert(&mut self, key: &Key, value: &R) {
        let indexed = self.evaluate(value);
        self.value_map
            .entry(indexed.clone())
            .or_default()
            .insert(key.clone());
        self.ordered_entries
            .get_mut(&indexed)
            .map(|set| set.insert(key.clone()))
            .unwrap_or_else(|| {
                let mut set = HashSet::new();
                set.insert(key.clone());
                self.ordered_entries.insert(indexed, set);
                false
            });
        self.indexed_keys.insert(key.clone());
    }

    pub fn on_update(&mut self, key: &Key, old_value: &R, new_value: &R) {
        self.on_delete(key, old_value);
        self.on_insert(key, new_value);
    }

    pub fn on_delete(&mut self, key: &Key, value: &R) {
        let indexed = self.evaluate(value);
        if let Some(set) = self.value_map.get_mut(&indexed) {
            set.remove(key);
            if set.is_empty() {
                self.value_map.remove(&indexed);
            }
        }
        if let Some(set) = self.ordered_entries.get_mut(&indexed) {
            set.remove(key);
            if set.is_empty() {
                self.ordered_entries.remove(&indexed);
            }
        }
        self.indexed_keys.remove(key);
    }

    /// Direct equality lookup via `valueMap` (spec §4.3.5 "eq: direct
    /// lookup").
    pub fn eq_lookup(&self, value: &DynValue) -> HashSet<Key> {
        self.value_map.get(value).cloned().unwrap_or_default()
    }

    /// Range query over `orderedEntries` (spec §4.3.5): for `gt/gte/lt/lte`,
    /// a linear scan of the sorted buckets collecting keys that satisfy the
    /// comparison. The spec explicitly allows this; a future revision may
    /// replace it with a binary-search traversal.
    pub fn range(&self, op: RangeOp, value: &DynValue) -> HashSet<Key> {
        if op == RangeOp::Eq {
            return self.eq_lookup(value);
        }
        let mut out = HashSet::new();
        for (indexed, keys) in self.ordered_entries.iter() {
            let ord = universal_cmp(indexed, value);
            let matches = match op {
                RangeOp::Lt => ord == std::cmp::Ordering::Less,
                RangeOp::Lte => ord != std::cmp::Ordering::Greater,
                RangeOp::Gt => ord == std::cmp::Ordering::Greater,
                RangeOp::Gte => ord != std::cmp::Ordering::Less,
                RangeOp::Eq => unreachable!(),
            };
            if matches {
                out.extend(keys.iter().cloned());
            }
        }
        out
    }

    /// All keys this index currently tracks — always equal to the
    /// collection's visible keys (spec invariant, §8 property 4).
    pub fn indexed_keys(&self) -> &HashSet<Key> {
        &self.indexed_keys
    }

    pub fn ordered_entries(&self) -> impl Iterator<Item = (&DynValue, &HashSet<Key>)> {
        self.ordered_entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn age_index(rows: &[(Key, serde_json::Value)]) -> Index<serde_json::Value> {
        let mut idx: Index<serde_json::Value> = Index::new(
            "age",
            Box::new(|v: &serde_json::Value| crate::value::json_to_dyn(&v["age"])),
        );
        idx.build(rows.iter().map(|(k, v)| (k, v)));
        idx
    }

    #[test]
    fn eq_and_range_lookup() {
        let rows = vec![
            (Key::from("a"), json!({"age": 30})),
            (Key::from("b"), json!({"age": 40})),
            (Key::from("c"), json!({"age": 20})),
        ];
        let idx = age_index(&rows);
        assert_eq!(idx.eq_lookup(&DynValue::Number(30.0)).len(), 1);
        let gte_30 = idx.range(RangeOp::Gte, &DynValue::Number(30.0));
        assert_eq!(gte_30.len(), 2);
        assert!(gte_30.contains(&Key::from("a")));
        assert!(gte_30.contains(&Key::from("b")));
    }

    #[test]
    fn update_moves_bucket() {
        let rows = vec![(Key::from("a"), json!({"age": 30}))];
        let mut idx = age_index(&rows);
        idx.on_update(&Key::from("a"), &json!({"age": 30}), &json!({"age": 99}));
        assert!(idx.eq_lookup(&DynValue::Number(30.0)).is_empty());
        assert_eq!(idx.eq_lookup(&DynValue::Number(99.0)).len(), 1);
    }

    #[test]
    fn delete_removes_empty_bucket() {
        let rows = vec![(Key::from("a"), json!({"age": 30}))];
        let mut idx = age_index(&rows);
        idx.on_delete(&Key::from("a"), &json!({"age": 30}));
        assert!(idx.indexed_keys().is_empty());
        assert_eq!(idx.ordered_entries().count(), 0);
    }
}
