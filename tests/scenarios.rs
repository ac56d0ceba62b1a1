//! End-to-end scenarios S1-S6 (spec §8).

use std::cell::RefCell;
use std::rc::Rc;

use reactive_core::{
    Collection, CollectionConfig, CompiledQuery, Expr, JoinKind, Key, QueryIr, Row as _, Runtime,
    SyncHandle, SyncWrite,
};
use reactive_core::query::ir::Source;
use serde_json::json;

mod common;

fn accepting_mutation_fn() -> Rc<dyn Fn(&[reactive_core::transaction::PendingMutation<serde_json::Value>]) -> Result<(), String>> {
    Rc::new(|_muts| Ok(()))
}

fn rejecting_mutation_fn() -> Rc<dyn Fn(&[reactive_core::transaction::PendingMutation<serde_json::Value>]) -> Result<(), String>> {
    Rc::new(|_muts| Err("rejected".to_string()))
}

/// A `sync` driver that does nothing on its own; tests reach into the
/// `SyncHandle` stashed in `handle_slot` to drive `begin/write/commit`
/// themselves, simulating an external sync confirmation arriving later.
fn manual_driver(
    handle_slot: Rc<RefCell<Option<SyncHandle<serde_json::Value>>>>,
) -> Rc<dyn reactive_core::SyncDriver<serde_json::Value>> {
    Rc::new(move |handle: SyncHandle<serde_json::Value>| {
        *handle_slot.borrow_mut() = Some(handle);
        Box::new(|| {}) as Box<dyn FnOnce()>
    })
}

fn get_id(v: &serde_json::Value) -> Key {
    Key::Str(v["id"].as_str().unwrap_or_default().to_string())
}

#[test]
fn s1_optimistic_insert_then_sync_confirms_without_duplicate_event() {
    common::init_tracing();
    let handle_slot = Rc::new(RefCell::new(None));
    let mut config = CollectionConfig::new("todos", get_id, manual_driver(handle_slot.clone()));
    config.on_insert = Some(accepting_mutation_fn());
    let todos = Collection::new(config);
    todos.preload().unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    todos.subscribe_changes(
        Box::new(move |events| seen2.borrow_mut().extend(events.iter().cloned())),
        false,
        None,
    );

    let txn = todos.insert(json!({"id": "1", "text": "a"})).unwrap();
    assert!(txn.is_persisted().unwrap().is_ok());
    assert_eq!(seen.borrow().len(), 1);
    assert!(matches!(seen.borrow()[0], reactive_core::ChangeMessage::Insert { .. }));

    let handle = handle_slot.borrow().clone().unwrap();
    handle.begin();
    handle.write(SyncWrite::Insert { value: json!({"id": "1", "text": "a"}) });
    handle.commit().unwrap();

    // The sync commit restates exactly what the optimistic write already
    // announced; `recentlySyncedKeys` suppresses the duplicate event.
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(todos.size(), 1);
    assert_eq!(todos.get(&Key::from("1")).unwrap()["text"], "a");
}

#[test]
fn s2_optimistic_delete_then_sync_restores_as_update() {
    let handle_slot = Rc::new(RefCell::new(None));
    let mut config = CollectionConfig::new("todos", get_id, manual_driver(handle_slot.clone()));
    config.on_delete = Some(accepting_mutation_fn());
    let todos = Collection::new(config);
    todos.preload().unwrap();

    {
        let handle = handle_slot.borrow().clone().unwrap();
        handle.begin();
        handle.write(SyncWrite::Insert { value: json!({"id": "1", "text": "a"}) });
        handle.commit().unwrap();
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    todos.subscribe_changes(
        Box::new(move |events| seen2.borrow_mut().extend(events.iter().cloned())),
        false,
        None,
    );

    let txn = todos.delete(Key::from("1")).unwrap();
    assert!(txn.is_persisted().unwrap().is_ok());
    assert_eq!(todos.size(), 0);
    assert!(matches!(seen.borrow().last().unwrap(), reactive_core::ChangeMessage::Delete { .. }));

    let handle = handle_slot.borrow().clone().unwrap();
    handle.begin();
    handle.write(SyncWrite::Update {
        value: json!({"id": "1", "text": "a-prime"}),
        previous_value: json!({"id": "1", "text": "a"}),
    });
    handle.commit().unwrap();

    assert_eq!(todos.size(), 1);
    assert_eq!(todos.get(&Key::from("1")).unwrap()["text"], "a-prime");
    assert!(matches!(seen.borrow().last().unwrap(), reactive_core::ChangeMessage::Update { .. }));
}

#[test]
fn s3_join_with_where_pushdown() {
    let users = preloaded_collection(
        "users",
        vec![(Key::Int(1), json!({"id": 1, "dept": 10})), (Key::Int(2), json!({"id": 2, "dept": 20}))],
    );
    let depts = preloaded_collection(
        "depts",
        vec![(Key::Int(10), json!({"id": 10, "n": "E"})), (Key::Int(20), json!({"id": 20, "n": "P"}))],
    );

    let runtime = Runtime::new();
    runtime.register("users", users);
    runtime.register("depts", depts);

    let query = QueryIr::from(Source::collection("users", "u"))
        .join(JoinKind::Inner, Source::collection("depts", "d"), Expr::r#ref(["u", "dept"]), Expr::r#ref(["d", "id"]))
        .filter(Expr::func("eq", vec![Expr::r#ref(["u", "id"]), Expr::value(reactive_core::DynValue::Number(1.0))]))
        .select(vec![("id", Expr::r#ref(["u", "id"])), ("n", Expr::r#ref(["d", "n"]))]);

    let compiled = CompiledQuery::compile(&query);
    let results = compiled.evaluate(&runtime).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, json!({"id": 1.0, "n": "E"}));
}

#[test]
fn s4_aggregate_over_group_updates_on_insert() {
    let issues = preloaded_collection(
        "issues",
        vec![(Key::Int(1), json!({"id": 1})), (Key::Int(2), json!({"id": 2})), (Key::Int(3), json!({"id": 3}))],
    );
    let mut comments_config = CollectionConfig::new(
        "comments",
        |v: &serde_json::Value| Key::Int(v["id"].as_i64().unwrap_or(0)),
        Rc::new(|handle: SyncHandle<serde_json::Value>| {
            handle.begin();
            let _ = handle.commit();
            Box::new(|| {}) as Box<dyn FnOnce()>
        }),
    );
    comments_config.on_insert = Some(accepting_mutation_fn());
    let comments = Collection::new(comments_config);
    comments.preload().unwrap();
    for (id, issue_id) in [(1, 1), (2, 1), (3, 2)] {
        comments.insert(json!({"id": id, "issueId": issue_id})).unwrap();
    }

    let runtime = Runtime::new();
    runtime.register("issues", issues);
    runtime.register("comments", comments.clone());

    let query = QueryIr::from(Source::collection("issues", "i"))
        .join(JoinKind::Left, Source::collection("comments", "c"), Expr::r#ref(["i", "id"]), Expr::r#ref(["c", "issueId"]))
        .group_by(vec![Expr::r#ref(["i", "id"])])
        .select(vec![
            ("id", Expr::r#ref(["i", "id"])),
            ("count", Expr::agg(reactive_core::query::ir::AggOp::Count, Expr::r#ref(["c", "id"]))),
        ]);
    let compiled = CompiledQuery::compile(&query);

    let mut before = compiled.evaluate(&runtime).unwrap();
    before.sort_by_key(|(_, v)| v["id"].as_i64());
    let before_counts: Vec<i64> = before.iter().map(|(_, v)| v["count"].as_i64().unwrap()).collect();
    assert_eq!(before_counts, vec![2, 1, 0]);

    comments.insert(json!({"id": 99, "issueId": 1})).unwrap();

    let mut after = compiled.evaluate(&runtime).unwrap();
    after.sort_by_key(|(_, v)| v["id"].as_i64());
    let after_counts: Vec<i64> = after.iter().map(|(_, v)| v["count"].as_i64().unwrap()).collect();
    assert_eq!(after_counts, vec![3, 1, 0]);
}

#[test]
fn s5_index_accelerated_snapshot() {
    let config = CollectionConfig::new(
        "people",
        |v: &serde_json::Value| Key::Int(v["id"].as_i64().unwrap_or(0)),
        Rc::new(|handle: SyncHandle<serde_json::Value>| {
            handle.begin();
            handle.write(SyncWrite::Insert { value: json!({"id": 1, "age": 20}) });
            handle.write(SyncWrite::Insert { value: json!({"id": 2, "age": 30}) });
            handle.write(SyncWrite::Insert { value: json!({"id": 3, "age": 40}) });
            handle.write(SyncWrite::Insert { value: json!({"id": 4, "age": 15}) });
            handle.write(SyncWrite::Insert { value: json!({"id": 5, "age": 55}) });
            let _ = handle.commit();
            Box::new(|| {}) as Box<dyn FnOnce()>
        }),
    );
    let people = Collection::new(config);
    people.preload().unwrap();
    people.create_index(
        "age",
        Box::new(|v: &serde_json::Value| reactive_core::DynValue::Number(v["age"].as_f64().unwrap_or(0.0))),
    );

    let via_index = people
        .current_state_as_changes_via_index("age", reactive_core::collection::RangeOp::Gte, &reactive_core::DynValue::Number(30.0))
        .unwrap();
    let mut ids: Vec<i64> = via_index.iter().map(|c| c.value()["id"].as_i64().unwrap()).collect();
    ids.sort();
    assert_eq!(ids, vec![2, 3, 5]);
}

#[test]
fn s6_transaction_failure_rolls_back_overlay() {
    let config = CollectionConfig::new(
        "todos",
        get_id,
        Rc::new(|handle: SyncHandle<serde_json::Value>| {
            handle.begin();
            let _ = handle.commit();
            Box::new(|| {}) as Box<dyn FnOnce()>
        }),
    );
    let todos = Collection::new(config);
    todos.preload().unwrap();

    let size_before = todos.size();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    todos.subscribe_changes(
        Box::new(move |events| seen2.borrow_mut().extend(events.iter().cloned())),
        false,
        None,
    );

    let mut manager: reactive_core::TransactionManager<serde_json::Value> = reactive_core::TransactionManager::new();
    let txn = manager.create_transaction(Some(rejecting_mutation_fn()));
    todos.insert_in(&txn, json!({"id": "1", "text": "a"})).unwrap();
    assert_eq!(todos.size(), size_before + 1);
    assert!(matches!(seen.borrow().last().unwrap(), reactive_core::ChangeMessage::Insert { .. }));

    assert!(txn.commit().is_err());
    assert_eq!(todos.size(), size_before);
    assert!(matches!(seen.borrow().last().unwrap(), reactive_core::ChangeMessage::Delete { .. }));
}

fn preloaded_collection(name: &str, rows: Vec<(Key, serde_json::Value)>) -> Collection<serde_json::Value> {
    let config = CollectionConfig::new(
        name.to_string(),
        |v: &serde_json::Value| Key::Int(v["id"].as_i64().unwrap_or(0)),
        Rc::new(move |handle: SyncHandle<serde_json::Value>| {
            handle.begin();
            for (_, value) in rows.clone() {
                handle.write(SyncWrite::Insert { value });
            }
            let _ = handle.commit();
            Box::new(|| {}) as Box<dyn FnOnce()>
        }),
    );
    let collection = Collection::new(config);
    collection.preload().unwrap();
    collection
}
