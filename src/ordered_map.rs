//! A keyed container with a caller-supplied total order (spec §4.1).
//!
//! Used by the transaction registry (ordered by `createdAt`, spec §4.4.3,
//! §5 "transactions are ordered by creation time") and by [`crate::collection::index::Index`]'s
//! `orderedEntries`. A closure can't be threaded through `BTreeMap`'s `Ord`
//! bound directly (that bound is fixed by the key type), so each key is
//! wrapped in [`OrderedKey`], whose `Ord` impl defers to a shared
//! comparator. This keeps real `BTreeMap` tree operations — amortized
//! O(log n) insert/remove/lookup, as the spec requires — instead of a
//! linear-scan `Vec`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A total order over `K`, supplied once at construction.
pub type Comparator<K> = Rc<dyn Fn(&K, &K) -> Ordering>;

struct OrderedKey<K> {
    value: K,
    cmp: Comparator<K>,
}

impl<K> Clone for OrderedKey<K>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        OrderedKey {
            value: self.value.clone(),
            cmp: self.cmp.clone(),
        }
    }
}

impl<K> PartialEq for OrderedKey<K> {
    fn eq(&self, other: &Self) -> bool {
        (self.cmp)(&self.value, &other.value) == Ordering::Equal
    }
}
impl<K> Eq for OrderedKey<K> {}

impl<K> PartialOrd for OrderedKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some((self.cmp)(&self.value, &other.value))
    }
}
impl<K> Ord for OrderedKey<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.value, &other.value)
    }
}

/// A sorted key→value container under a caller-supplied comparator.
pub struct OrderedMap<K, V> {
    cmp: Comparator<K>,
    inner: BTreeMap<OrderedKey<K>, V>,
}

impl<K: Clone, V> OrderedMap<K, V> {
    pub fn new(cmp: impl Fn(&K, &K) -> Ordering + 'static) -> Self {
        OrderedMap {
            cmp: Rc::new(cmp),
            inner: BTreeMap::new(),
        }
    }

    fn wrap(&self, value: K) -> OrderedKey<K> {
        OrderedKey {
            value,
            cmp: self.cmp.clone(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(self.wrap(key), value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(&self.wrap(key.clone()))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(&self.wrap(key.clone()))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(&self.wrap(key.clone()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(&self.wrap(key.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// In-order iteration, O(n).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, v)| (&k.value, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys().map(|k| &k.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_custom_comparator() {
        // Order by absolute value, which is not `i64`'s natural order.
        let mut map: OrderedMap<i64, &'static str> =
            OrderedMap::new(|a, b| a.abs().cmp(&b.abs()));
        map.insert(-5, "minus-five");
        map.insert(2, "two");
        map.insert(-1, "minus-one");
        let ordered: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(ordered, vec![(-1, "minus-one"), (2, "two"), (-5, "minus-five")]);
    }

    #[test]
    fn insert_remove_roundtrip() {
        let mut map: OrderedMap<i64, i64> = OrderedMap::new(|a, b| a.cmp(b));
        map.insert(1, 10);
        map.insert(2, 20);
        assert_eq!(map.get(&1), Some(&10));
        assert_eq!(map.remove(&1), Some(10));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 1);
    }
}
