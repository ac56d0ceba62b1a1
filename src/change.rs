//! Change messages and multiplicity records (spec §3, §4.2).

use crate::key::Key;

/// System-wide multiplicity type, matching the teacher's own
/// `pub type Diff = isize;` (`interactive/src/lib.rs`).
pub type Diff = isize;

/// A tagged change, as delivered by a sync driver (spec §3) or emitted by a
/// collection's listeners.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeMessage<V> {
    Insert { key: Key, value: V },
    Update { key: Key, value: V, previous_value: V },
    Delete { key: Key, value: V },
}

impl<V> ChangeMessage<V> {
    pub fn key(&self) -> &Key {
        match self {
            ChangeMessage::Insert { key, .. } => key,
            ChangeMessage::Update { key, .. } => key,
            ChangeMessage::Delete { key, .. } => key,
        }
    }

    pub fn value(&self) -> &V {
        match self {
            ChangeMessage::Insert { value, .. } => value,
            ChangeMessage::Update { value, .. } => value,
            ChangeMessage::Delete { value, .. } => value,
        }
    }
}

/// A single write appended to a sync batch, before the key is known to the
/// collection store's caller (the store derives the key via `getKey`, spec
/// §4.3.2) — used by [`crate::collection::SyncHandle::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncWrite<V> {
    Insert { value: V },
    Update { value: V, previous_value: V },
    Delete { value: V },
}

/// A `(key, value, delta)` differential record (spec §3, Glossary).
///
/// Positive `delta` adds copies, negative removes; steady state per key is
/// `delta in {0,1}` (spec invariant, §8 property 8).
#[derive(Debug, Clone, PartialEq)]
pub struct Multiplicity<V> {
    pub key: Key,
    pub value: V,
    pub delta: Diff,
}

impl<V> Multiplicity<V> {
    pub fn new(key: Key, value: V, delta: Diff) -> Self {
        Multiplicity { key, value, delta }
    }
}

/// Consolidates a batch of multiplicity records so that each `(key, value)`
/// (by `PartialEq` on `V`) appears with its net delta exactly once (spec
/// §4.2 `consolidate()`).
pub fn consolidate<V: Clone + PartialEq>(records: Vec<Multiplicity<V>>) -> Vec<Multiplicity<V>> {
    let mut out: Vec<Multiplicity<V>> = Vec::new();
    for record in records {
        if let Some(existing) = out
            .iter_mut()
            .find(|r| r.key == record.key && r.value == record.value)
        {
            existing.delta += record.delta;
        } else {
            out.push(record);
        }
    }
    out.retain(|r| r.delta != 0);
    out
}
