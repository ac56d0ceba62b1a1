//! Property tests for the testable properties in spec §8 that hold over
//! arbitrary inputs rather than one worked example.

use proptest::prelude::*;
use reactive_core::change::{consolidate, Multiplicity};
use reactive_core::value::{universal_cmp, DynValue};
use reactive_core::Key;

fn small_key() -> impl Strategy<Value = Key> {
    (0i64..4).prop_map(Key::Int)
}

fn small_value() -> impl Strategy<Value = i64> {
    0i64..4
}

fn small_delta() -> impl Strategy<Value = isize> {
    -3isize..4
}

fn multiplicity() -> impl Strategy<Value = Multiplicity<i64>> {
    (small_key(), small_value(), small_delta())
        .prop_map(|(key, value, delta)| Multiplicity::new(key, value, delta))
}

proptest! {
    /// Consolidating twice is the same as consolidating once (spec §4.2
    /// `consolidate()` is a projection onto net state, not a one-shot fold).
    #[test]
    fn consolidate_is_idempotent(records in proptest::collection::vec(multiplicity(), 0..20)) {
        let once = consolidate(records);
        let twice = consolidate(once.clone());
        prop_assert_eq!(once, twice);
    }

    /// Consolidating never changes the net delta held for any `(key, value)`
    /// pair, and never leaves a zero-delta entry behind (spec §8 property 8:
    /// steady-state multiplicity per key is in `{0, 1}`, which presumes
    /// zero-delta entries are pruned rather than retained as no-op records).
    #[test]
    fn consolidate_preserves_net_deltas_and_prunes_zeros(
        records in proptest::collection::vec(multiplicity(), 0..20)
    ) {
        let mut expected: std::collections::HashMap<(Key, i64), isize> = std::collections::HashMap::new();
        for r in &records {
            *expected.entry((r.key.clone(), r.value)).or_insert(0) += r.delta;
        }
        expected.retain(|_, delta| *delta != 0);

        let out = consolidate(records);
        prop_assert_eq!(out.len(), expected.len());
        for r in &out {
            prop_assert_ne!(r.delta, 0);
            prop_assert_eq!(expected.get(&(r.key.clone(), r.value)), Some(&r.delta));
        }
    }

    /// The universal comparator is reflexive and antisymmetric over the
    /// non-container value space (spec Glossary: "a total, deterministic
    /// ordering over every value").
    #[test]
    fn universal_cmp_is_reflexive_and_antisymmetric(
        a in leaf_dyn_value(),
        b in leaf_dyn_value(),
    ) {
        prop_assert_eq!(universal_cmp(&a, &a), std::cmp::Ordering::Equal);
        prop_assert_eq!(universal_cmp(&a, &b), universal_cmp(&b, &a).reverse());
    }
}

fn leaf_dyn_value() -> impl Strategy<Value = DynValue> {
    prop_oneof![
        Just(DynValue::Null),
        any::<bool>().prop_map(DynValue::Bool),
        (-100i64..100).prop_map(|n| DynValue::Number(n as f64)),
        "[a-z]{0,5}".prop_map(DynValue::Str),
    ]
}
