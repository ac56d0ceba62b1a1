//! Dynamic values and the "universal comparator" (spec Glossary).
//!
//! Records are opaque per the spec; this engine represents every field value
//! (and the literals that appear in [`crate::query::ir::Expr::Value`]) with
//! [`DynValue`], and every queryable row with the [`Row`] trait. `Row` is
//! implemented for `serde_json::Value` so callers can build collections out
//! of plain JSON objects, which is the natural "opaque object with named
//! fields" shape for an embedded query engine with no schema of its own.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A dynamic value produced by expression evaluation.
///
/// This is intentionally a closed, total-order-comparable value space (no
/// `Date` variant — the glossary's "dates by time" rule applies to whatever
/// representation a caller chooses; a `DynValue::Str` holding an RFC3339
/// timestamp already sorts correctly under byte order).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<DynValue>),
    Object(BTreeMap<String, DynValue>),
}

impl DynValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DynValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Type rank used as the universal comparator's fallback for mixed-type
    /// comparisons (null first, then booleans, numbers, strings, arrays,
    /// objects).
    fn type_rank(&self) -> u8 {
        match self {
            DynValue::Null => 0,
            DynValue::Bool(_) => 1,
            DynValue::Number(_) => 2,
            DynValue::Str(_) => 3,
            DynValue::Array(_) => 4,
            DynValue::Object(_) => 5,
        }
    }
}

impl PartialEq for DynValue {
    fn eq(&self, other: &Self) -> bool {
        universal_cmp(self, other) == Ordering::Equal
    }
}
impl Eq for DynValue {}

impl std::hash::Hash for DynValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            DynValue::Null => 0u8.hash(state),
            DynValue::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            DynValue::Number(n) => {
                2u8.hash(state);
                n.to_bits().hash(state);
            }
            DynValue::Str(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            DynValue::Array(items) => {
                4u8.hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            DynValue::Object(fields) => {
                5u8.hash(state);
                for (k, v) in fields {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl PartialOrd for DynValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(universal_cmp(self, other))
    }
}
impl Ord for DynValue {
    fn cmp(&self, other: &Self) -> Ordering {
        universal_cmp(self, other)
    }
}

/// The universal comparator (spec Glossary): null/undefined sorts first,
/// same-type pairs compare by natural order, mixed types fall back to a
/// fixed type rank.
pub fn universal_cmp(a: &DynValue, b: &DynValue) -> Ordering {
    match (a, b) {
        (DynValue::Null, DynValue::Null) => Ordering::Equal,
        (DynValue::Null, _) => Ordering::Less,
        (_, DynValue::Null) => Ordering::Greater,
        (DynValue::Bool(x), DynValue::Bool(y)) => x.cmp(y),
        (DynValue::Number(x), DynValue::Number(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (DynValue::Str(x), DynValue::Str(y)) => x.as_bytes().cmp(y.as_bytes()),
        (DynValue::Array(x), DynValue::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = universal_cmp(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (DynValue::Object(x), DynValue::Object(y)) => format!("{x:?}").cmp(&format!("{y:?}")),
        _ => a.type_rank().cmp(&b.type_rank()),
    }
}

/// A queryable row: the engine's view of an "opaque object" record.
///
/// `path` is a field-access path (`Ref.path` minus the leading alias, which
/// is resolved against the [`crate::query::namespaced::NamespacedRow`]
/// before `field` is called).
pub trait Row: Clone + std::fmt::Debug + 'static {
    fn field(&self, path: &[String]) -> DynValue;

    /// Merges a sync-supplied partial update into `self` (spec §4.3.3
    /// `rowUpdateMode: "partial"`). Defaults to a full replace, since an
    /// opaque `Row` has no addressable fields in general; `serde_json::Value`
    /// overrides this with a real top-level object merge.
    fn merge_partial(&self, patch: &Self) -> Self {
        patch.clone()
    }
}

impl Row for serde_json::Value {
    fn field(&self, path: &[String]) -> DynValue {
        let mut cur = self;
        for segment in path {
            match cur.get(segment) {
                Some(next) => cur = next,
                None => return DynValue::Null,
            }
        }
        json_to_dyn(cur)
    }

    fn merge_partial(&self, patch: &Self) -> Self {
        match (self, patch) {
            (serde_json::Value::Object(base), serde_json::Value::Object(update)) => {
                let mut merged = base.clone();
                for (k, v) in update {
                    merged.insert(k.clone(), v.clone());
                }
                serde_json::Value::Object(merged)
            }
            _ => patch.clone(),
        }
    }
}

/// Converts a `serde_json::Value` into our closed [`DynValue`] space.
pub fn json_to_dyn(value: &serde_json::Value) -> DynValue {
    match value {
        serde_json::Value::Null => DynValue::Null,
        serde_json::Value::Bool(b) => DynValue::Bool(*b),
        serde_json::Value::Number(n) => DynValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => DynValue::Str(s.clone()),
        serde_json::Value::Array(a) => DynValue::Array(a.iter().map(json_to_dyn).collect()),
        serde_json::Value::Object(o) => DynValue::Object(
            o.iter()
                .map(|(k, v)| (k.clone(), json_to_dyn(v)))
                .collect(),
        ),
    }
}
