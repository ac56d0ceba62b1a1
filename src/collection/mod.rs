//! The collection store (spec §4.3): authoritative + optimistic state,
//! subscriber notification, and ordered secondary indexes.

pub mod index;
pub mod schema;
pub mod status;
pub mod subscription;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::change::{ChangeMessage, SyncWrite};
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::ordered_map::OrderedMap;
use crate::query::functions::eval_row_predicate;
use crate::query::ir::Expr;
use crate::transaction::{MutationType, PendingMutation, TransactionHandle};
use crate::value::{DynValue, Row};

pub use index::{Index, RangeOp};
pub use schema::Schema;
pub use status::CollectionStatus;
pub use subscription::{Listener, SubscriptionId, WherePredicate, DEFAULT_GC_TIME};

pub use self::sync_support::{SyncDriverBox, SyncHandle};

/// `rowUpdateMode` for sync-applied updates (spec §4.3.3 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowUpdateMode {
    Partial,
    Full,
}

/// Construction-time configuration (spec §4.3.1).
pub struct CollectionConfig<R: Row> {
    pub id: String,
    pub get_key: Rc<dyn Fn(&R) -> Key>,
    pub schema: Option<Rc<dyn Schema<R>>>,
    pub on_insert: Option<crate::transaction::MutationFn<R>>,
    pub on_update: Option<crate::transaction::MutationFn<R>>,
    pub on_delete: Option<crate::transaction::MutationFn<R>>,
    pub sync: SyncDriverBox<R>,
    pub gc_time: Duration,
    pub row_update_mode: RowUpdateMode,
}

impl<R: Row> CollectionConfig<R> {
    pub fn new(id: impl Into<String>, get_key: impl Fn(&R) -> Key + 'static, sync: SyncDriverBox<R>) -> Self {
        CollectionConfig {
            id: id.into(),
            get_key: Rc::new(get_key),
            schema: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
            sync,
            gc_time: DEFAULT_GC_TIME,
            row_update_mode: RowUpdateMode::Full,
        }
    }
}

pub(crate) struct CollectionInner<R: Row> {
    id: String,
    get_key: Rc<dyn Fn(&R) -> Key>,
    schema: Option<Rc<dyn Schema<R>>>,
    on_insert: Option<crate::transaction::MutationFn<R>>,
    on_update: Option<crate::transaction::MutationFn<R>>,
    on_delete: Option<crate::transaction::MutationFn<R>>,
    gc_time: Duration,
    row_update_mode: RowUpdateMode,

    status: CollectionStatus,
    synced: HashMap<Key, R>,
    optimistic_upserts: HashMap<Key, R>,
    optimistic_deletes: HashSet<Key>,
    /// Per-transaction mutation contributions, ordered by the
    /// transaction's `createdAt` (spec §4.1, §5 ordering).
    pending_by_transaction: OrderedMap<u64, Vec<PendingMutation<R>>>,
    /// Ephemeral suppression set (spec §9 "recentlySyncedKeys"): the value
    /// an optimistic mutation most recently made visible for a key, so the
    /// next sync commit can avoid re-announcing it (spec §4.3.3 step 6).
    recently_synced: HashMap<Key, Option<R>>,

    indexes: Vec<Index<R>>,
    subscriptions: subscription::SubscriptionRegistry<R>,

    sync_driver: Option<SyncDriverBox<R>>,
    sync_handle: Option<SyncHandle<R>>,
    sync_cleanup: Option<Box<dyn FnOnce()>>,
}

/// A cloneable handle to a collection (spec: "opaque handle; internal
/// structures are implementation-owned").
pub struct Collection<R: Row>(Rc<RefCell<CollectionInner<R>>>);

impl<R: Row> Clone for Collection<R> {
    fn clone(&self) -> Self {
        Collection(self.0.clone())
    }
}

impl<R: Row> Collection<R> {
    pub fn new(config: CollectionConfig<R>) -> Self {
        Collection(Rc::new(RefCell::new(CollectionInner {
            id: config.id,
            get_key: config.get_key,
            schema: config.schema,
            on_insert: config.on_insert,
            on_update: config.on_update,
            on_delete: config.on_delete,
            gc_time: config.gc_time,
            row_update_mode: config.row_update_mode,
            status: CollectionStatus::Idle,
            synced: HashMap::new(),
            optimistic_upserts: HashMap::new(),
            optimistic_deletes: HashSet::new(),
            pending_by_transaction: OrderedMap::new(|a: &u64, b: &u64| a.cmp(b)),
            recently_synced: HashMap::new(),
            indexes: Vec::new(),
            subscriptions: subscription::SubscriptionRegistry::new(),
            sync_driver: Some(config.sync),
            sync_handle: None,
            sync_cleanup: None,
        })))
    }

    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    pub fn status(&self) -> CollectionStatus {
        self.0.borrow().status
    }

    // -- Lifecycle ---------------------------------------------------

    /// Drives `idle -> loading -> initialCommit -> ready`, starting the
    /// sync driver if it hasn't already been started (spec §3 lifecycle,
    /// §4.3.4).
    pub fn preload(&self) -> CoreResult<()> {
        let needs_start = {
            let inner = self.0.borrow();
            matches!(inner.status, CollectionStatus::Idle | CollectionStatus::CleanedUp)
        };
        if needs_start {
            self.start_sync()?;
        }
        Ok(())
    }

    fn start_sync(&self) -> CoreResult<()> {
        {
            let mut inner = self.0.borrow_mut();
            inner.status.transition(CollectionStatus::Loading)?;
        }

        let handle = self.make_sync_handle();
        let driver = {
            let mut inner = self.0.borrow_mut();
            inner.sync_handle = Some(handle.clone());
            inner.sync_driver.take()
        };
        let driver = driver.ok_or_else(|| CoreError::Config("sync driver missing".into()))?;
        let cleanup = driver.start(handle);
        {
            let mut inner = self.0.borrow_mut();
            inner.sync_driver = Some(driver);
            inner.sync_cleanup = Some(cleanup);
            inner.status.transition(CollectionStatus::InitialCommit)?;
            inner.status.transition(CollectionStatus::Ready)?;
        }
        Ok(())
    }

    fn make_sync_handle(&self) -> SyncHandle<R> {
        let weak = Rc::downgrade(&self.0);
        sync_support::make_handle(weak)
    }

    /// `stateWhenReady()`: ensures the collection has loaded, then returns
    /// the visible view.
    pub fn state_when_ready(&self) -> CoreResult<HashMap<Key, R>> {
        self.preload()?;
        Ok(self.visible_view())
    }

    pub fn to_array_when_ready(&self) -> CoreResult<Vec<R>> {
        Ok(self.state_when_ready()?.into_values().collect())
    }

    /// Tears down the sync driver, releasing caches (spec §3, §4.3.4).
    pub fn cleanup(&self) -> CoreResult<()> {
        let cleanup_fn = {
            let mut inner = self.0.borrow_mut();
            inner.status.transition(CollectionStatus::CleanedUp)?;
            inner.synced.clear();
            inner.optimistic_upserts.clear();
            inner.optimistic_deletes.clear();
            inner.indexes.clear();
            inner.sync_cleanup.take()
        };
        if let Some(cleanup_fn) = cleanup_fn {
            // Spec §4.3.6: a throwing cleanup is captured and re-raised
            // asynchronously so cleanup still completes; in this
            // synchronous port we simply run it and surface any panic as a
            // `SyncCleanup` error after state has already been reset above.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup_fn));
            if result.is_err() {
                tracing::error!(id = %self.id(), "sync cleanup panicked");
                return Err(CoreError::SyncCleanup("cleanup function panicked".into()));
            }
        }
        Ok(())
    }

    // -- Read path -----------------------------------------------------

    fn visible_keys(&self, inner: &CollectionInner<R>) -> HashSet<Key> {
        let mut keys: HashSet<Key> = inner
            .synced
            .keys()
            .filter(|k| !inner.optimistic_deletes.contains(*k))
            .cloned()
            .collect();
        keys.extend(inner.optimistic_upserts.keys().cloned());
        keys
    }

    pub fn get(&self, key: &Key) -> Option<R> {
        let inner = self.0.borrow();
        if let Some(v) = inner.optimistic_upserts.get(key) {
            return Some(v.clone());
        }
        if inner.optimistic_deletes.contains(key) {
            return None;
        }
        inner.synced.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn size(&self) -> usize {
        let inner = self.0.borrow();
        self.visible_keys(&inner).len()
    }

    pub fn visible_view(&self) -> HashMap<Key, R> {
        let inner = self.0.borrow();
        let keys = self.visible_keys(&inner);
        keys.into_iter()
            .map(|k| {
                let v = inner
                    .optimistic_upserts
                    .get(&k)
                    .or_else(|| inner.synced.get(&k))
                    .expect("visible key must resolve to a value")
                    .clone();
                (k, v)
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.visible_view().into_keys().collect()
    }

    pub fn values(&self) -> Vec<R> {
        self.visible_view().into_values().collect()
    }

    pub fn entries(&self) -> Vec<(Key, R)> {
        self.visible_view().into_iter().collect()
    }

    /// `currentStateAsChanges({ where })`: a snapshot as `insert` events,
    /// using an index range when `where` compiles to `field OP literal`
    /// against an existing matching index, falling back to a full scan
    /// evaluating the IR expression row-by-row otherwise (spec §4.3.4).
    pub fn current_state_as_changes(&self, filter: Option<&Expr>) -> Vec<ChangeMessage<R>> {
        if let Some(expr) = filter {
            if let Some((index_name, op, value)) = index_range_of(expr) {
                if let Some(via_index) = self.current_state_as_changes_via_index(&index_name, op, &value) {
                    return via_index;
                }
            }
        }
        self.visible_view()
            .into_iter()
            .filter(|(_, v)| filter.map(|e| eval_row_predicate(e, v).unwrap_or(false)).unwrap_or(true))
            .map(|(key, value)| ChangeMessage::Insert { key, value })
            .collect()
    }

    /// Index-accelerated variant of [`current_state_as_changes`] for a
    /// single-field range predicate (spec §4.3.4, §4.3.5, scenario S5).
    pub fn current_state_as_changes_via_index(
        &self,
        index_name: &str,
        op: RangeOp,
        value: &DynValue,
    ) -> Option<Vec<ChangeMessage<R>>> {
        let inner = self.0.borrow();
        let index = inner.indexes.iter().find(|i| i.name() == index_name)?;
        let keys = index.range(op, value);
        drop(inner);
        Some(
            keys.into_iter()
                .filter_map(|k| self.get(&k).map(|v| ChangeMessage::Insert { key: k, value: v }))
                .collect(),
        )
    }

    // -- Indexes ---------------------------------------------------------

    pub fn create_index(&self, name: impl Into<String>, expr: Box<dyn Fn(&R) -> crate::value::DynValue>) {
        let name = name.into();
        let mut index = Index::new(name, expr);
        let view = self.visible_view();
        index.build(view.iter());
        self.0.borrow_mut().indexes.push(index);
    }

    // -- Subscriptions -----------------------------------------------------

    pub fn subscribe_changes(
        &self,
        mut listener: Listener<R>,
        include_initial_state: bool,
        filter: Option<WherePredicate>,
    ) -> SubscriptionId {
        if include_initial_state {
            let initial = self.current_state_as_changes(filter.as_ref());
            if !initial.is_empty() {
                (listener)(&initial);
            }
        }
        let mut inner = self.0.borrow_mut();
        inner.subscriptions.reset_gc_timer();
        inner.subscriptions.subscribe(listener, filter)
    }

    pub fn subscribe_changes_key(&self, key: Key, mut listener: Listener<R>, include_initial_state: bool) -> SubscriptionId {
        if include_initial_state {
            if let Some(value) = self.get(&key) {
                (listener)(&[ChangeMessage::Insert { key: key.clone(), value }]);
            }
        }
        let key_clone = key.clone();
        self.subscribe_changes(
            Box::new(move |events| {
                let matching: Vec<_> = events.iter().filter(|e| *e.key() == key_clone).cloned().collect();
                if !matching.is_empty() {
                    listener(&matching);
                }
            }),
            false,
            None,
        )
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.0.borrow_mut();
        inner.subscriptions.unsubscribe(id);
        if inner.subscriptions.is_empty() {
            inner.subscriptions.mark_zero_if_empty(Instant::now());
        }
    }

    pub fn gc_due(&self, now: Instant) -> bool {
        let inner = self.0.borrow();
        inner.subscriptions.gc_due(now, inner.gc_time)
    }

    // -- Direct mutation path (spec §4.4.4) -------------------------------

    /// `insert(record, { optimistic })` with no ambient transaction: a
    /// transaction is auto-created from `onInsert` (fatal if neither an
    /// ambient transaction nor a handler exists — callers that want the
    /// ambient path use [`Self::insert_in`]).
    pub fn insert(&self, record: R) -> CoreResult<TransactionHandle<R>> {
        let handler = self.0.borrow().on_insert.clone();
        let handler = handler.ok_or_else(|| {
            CoreError::Usage("insert requires either an ambient transaction or onInsert".into())
        })?;
        self.auto_mutate(MutationType::Insert, record, handler)
    }

    pub fn update(&self, key: Key, updater: impl FnOnce(&R) -> R) -> CoreResult<TransactionHandle<R>> {
        let (original, handler) = {
            let inner = self.0.borrow();
            let original = self
                .get(&key)
                .ok_or_else(|| CoreError::MissingKey { key: key.clone() })?;
            (original, inner.on_update.clone())
        };
        let handler = handler
            .ok_or_else(|| CoreError::Usage("update requires either an ambient transaction or onUpdate".into()))?;
        let modified = updater(&original);
        self.validate_key_unchanged(&key, &modified)?;
        self.auto_mutate_update(key, original, modified, handler)
    }

    pub fn delete(&self, key: Key) -> CoreResult<TransactionHandle<R>> {
        let (original, handler) = {
            let inner = self.0.borrow();
            let original = self
                .get(&key)
                .ok_or_else(|| CoreError::MissingKey { key: key.clone() })?;
            (original, inner.on_delete.clone())
        };
        let handler = handler
            .ok_or_else(|| CoreError::Usage("delete requires either an ambient transaction or onDelete".into()))?;
        self.auto_mutate_delete(key, original, handler)
    }

    fn auto_mutate(&self, kind: MutationType, value: R, handler: crate::transaction::MutationFn<R>) -> CoreResult<TransactionHandle<R>> {
        let key = (self.0.borrow().get_key)(&value);
        if self.get(&key).is_some() {
            return Err(CoreError::DuplicateKey { key });
        }
        let validated = self.validate_schema(&value)?;
        let mut mgr = crate::transaction::TransactionManager::new();
        let txn = mgr.create_transaction(Some(handler));
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: kind,
            key: key.clone(),
            original: None,
            modified: Some(validated.clone()),
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(&txn, mutation);
        txn.commit()?;
        Ok(txn)
    }

    fn auto_mutate_update(&self, key: Key, original: R, modified: R, handler: crate::transaction::MutationFn<R>) -> CoreResult<TransactionHandle<R>> {
        let validated = self.validate_schema(&modified)?;
        let mut mgr = crate::transaction::TransactionManager::new();
        let txn = mgr.create_transaction(Some(handler));
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: MutationType::Update,
            key: key.clone(),
            original: Some(original),
            modified: Some(validated.clone()),
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(&txn, mutation);
        txn.commit()?;
        Ok(txn)
    }

    fn auto_mutate_delete(&self, key: Key, original: R, handler: crate::transaction::MutationFn<R>) -> CoreResult<TransactionHandle<R>> {
        let mut mgr = crate::transaction::TransactionManager::new();
        let txn = mgr.create_transaction(Some(handler));
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: MutationType::Delete,
            key: key.clone(),
            original: Some(original),
            modified: None,
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(&txn, mutation);
        txn.commit()?;
        Ok(txn)
    }

    // -- Ambient-transaction mutation path --------------------------------

    pub fn insert_in(&self, txn: &TransactionHandle<R>, record: R) -> CoreResult<()> {
        let key = (self.0.borrow().get_key)(&record);
        if self.get(&key).is_some() {
            return Err(CoreError::DuplicateKey { key });
        }
        let validated = self.validate_schema(&record)?;
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: MutationType::Insert,
            key,
            original: None,
            modified: Some(validated),
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(txn, mutation);
        Ok(())
    }

    pub fn update_in(&self, txn: &TransactionHandle<R>, key: Key, updater: impl FnOnce(&R) -> R) -> CoreResult<()> {
        let original = self.get(&key).ok_or_else(|| CoreError::MissingKey { key: key.clone() })?;
        let modified = updater(&original);
        self.validate_key_unchanged(&key, &modified)?;
        let validated = self.validate_schema(&modified)?;
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: MutationType::Update,
            key,
            original: Some(original),
            modified: Some(validated),
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(txn, mutation);
        Ok(())
    }

    pub fn delete_in(&self, txn: &TransactionHandle<R>, key: Key) -> CoreResult<()> {
        let original = self.get(&key).ok_or_else(|| CoreError::MissingKey { key: key.clone() })?;
        let mutation = PendingMutation {
            mutation_id: 0,
            mutation_type: MutationType::Delete,
            key,
            original: Some(original),
            modified: None,
            collection_id: self.id(),
            optimistic: true,
            metadata: None,
        };
        self.stage_and_apply(txn, mutation);
        Ok(())
    }

    fn validate_key_unchanged(&self, original: &Key, modified: &R) -> CoreResult<()> {
        let recomputed = (self.0.borrow().get_key)(modified);
        if recomputed != *original {
            return Err(CoreError::ImmutableKey {
                original: original.clone(),
                attempted: recomputed,
            });
        }
        Ok(())
    }

    fn validate_schema(&self, value: &R) -> CoreResult<R> {
        let schema = self.0.borrow().schema.clone();
        match schema {
            Some(s) => s.validate(value).map_err(|issues| CoreError::SchemaValidation { issues }),
            None => Ok(value.clone()),
        }
    }

    /// Stages `mutation` into the transaction and the collection's local
    /// per-transaction overlay bookkeeping, then recomputes the overlay and
    /// delivers the resulting diff to subscribers (spec §4.3.3 reasoning
    /// applied to a single optimistic write instead of a sync batch).
    fn stage_and_apply(&self, txn: &TransactionHandle<R>, mutation: PendingMutation<R>) {
        let key = mutation.key.clone();
        let before = self.get(&key);

        txn.stage(self, mutation.clone());
        {
            let mut inner = self.0.borrow_mut();
            let created_at = txn.created_at();
            inner
                .pending_by_transaction
                .get_mut(&created_at)
                .map(|v| v.push(mutation.clone()))
                .unwrap_or_else(|| {
                    inner.pending_by_transaction.insert(created_at, vec![mutation.clone()]);
                });
            apply_mutation_to_overlay(&mut inner, &mutation);
        }

        let after = self.get(&key);
        self.emit_delta(&key, before, after.clone());
        self.0.borrow_mut().recently_synced.insert(key, after);
    }

    /// Called by [`TransactionHandle::commit`] once the transaction has
    /// reached `completed`/`failed` (spec §4.4.2). A `completed` transaction's
    /// mutations stay in the optimistic overlay — they were already made
    /// visible when staged, and a *successful* mutation is not a rollback
    /// candidate — until a later sync commit reconciles their keys
    /// (`apply_sync_batch` retires them then). Only `failed` rolls the
    /// overlay contribution back here (spec §4.4.2, scenario S6).
    pub(crate) fn on_transaction_finished(&self, transaction_created_at_or_id: u64, success: bool) {
        if success {
            return;
        }
        // `created_at` doubles as the id in this implementation (see
        // `TransactionManager::create_transaction`).
        let touched_keys: Vec<Key> = {
            let inner = self.0.borrow();
            inner
                .pending_by_transaction
                .get(&transaction_created_at_or_id)
                .map(|muts| muts.iter().map(|m| m.key.clone()).collect())
                .unwrap_or_default()
        };
        if touched_keys.is_empty() {
            return;
        }
        let before: HashMap<Key, Option<R>> = touched_keys.iter().map(|k| (k.clone(), self.get(k))).collect();

        {
            let mut inner = self.0.borrow_mut();
            inner.pending_by_transaction.remove(&transaction_created_at_or_id);
            recompute_overlay(&mut inner);
        }

        for key in touched_keys {
            let after = self.get(&key);
            self.emit_delta(&key, before.get(&key).cloned().flatten(), after);
        }
    }

    fn emit_delta(&self, key: &Key, before: Option<R>, after: Option<R>) {
        let event = match (before, after) {
            (None, Some(value)) => Some(ChangeMessage::Insert { key: key.clone(), value }),
            (Some(previous_value), Some(value)) => {
                if values_equal(&previous_value, &value) {
                    None
                } else {
                    Some(ChangeMessage::Update { key: key.clone(), value, previous_value })
                }
            }
            (Some(value), None) => Some(ChangeMessage::Delete { key: key.clone(), value }),
            (None, None) => None,
        };
        if let Some(event) = event {
            self.update_indexes(std::slice::from_ref(&event));
            self.0.borrow_mut().subscriptions.dispatch(std::slice::from_ref(&event));
        }
    }

    fn update_indexes(&self, events: &[ChangeMessage<R>]) {
        let mut inner = self.0.borrow_mut();
        for event in events {
            for index in inner.indexes.iter_mut() {
                match event {
                    ChangeMessage::Insert { key, value } => index.on_insert(key, value),
                    ChangeMessage::Update { key, value, previous_value } => {
                        index.on_update(key, previous_value, value)
                    }
                    ChangeMessage::Delete { key, value } => index.on_delete(key, value),
                }
            }
        }
    }

    // -- Sync commit reconciliation (spec §4.3.3) -------------------------

    fn apply_sync_batch(&self, batch: Vec<SyncWrite<R>>) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let get_key = self.0.borrow().get_key.clone();
        let row_update_mode = self.0.borrow().row_update_mode;

        // Step 1: touched keys + pre-sync snapshot. Taken from the raw
        // synced store rather than the overlay-masked visible state: an
        // optimistic delete that sync is about to restore must diff as an
        // `update` against the record's last synced value, not as an
        // `insert` against the currently-masked `None` (spec §4.3.3 step 5
        // worked example: "the pending sync restores 1 before events are
        // flushed").
        let touched: Vec<Key> = batch.iter().map(|w| get_key(write_value(w))).collect();
        let pre_sync: HashMap<Key, Option<R>> = {
            let inner = self.0.borrow();
            touched.iter().map(|k| (k.clone(), inner.synced.get(k).cloned())).collect()
        };

        // Step 2: apply to synced data.
        {
            let mut inner = self.0.borrow_mut();
            for write in &batch {
                let key = get_key(write_value(write));
                match write {
                    SyncWrite::Insert { value } => {
                        if inner.synced.contains_key(&key) {
                            return Err(CoreError::DuplicateKey { key });
                        }
                        inner.synced.insert(key, value.clone());
                    }
                    SyncWrite::Update { value, .. } => {
                        let merged = match (row_update_mode, inner.synced.get(&key)) {
                            (RowUpdateMode::Partial, Some(existing)) => existing.merge_partial(value),
                            _ => value.clone(),
                        };
                        inner.synced.insert(key, merged);
                    }
                    SyncWrite::Delete { .. } => {
                        inner.synced.remove(&key);
                    }
                }
            }
        }

        // Steps 3 & 4: retire any optimistic mutation this sync batch has
        // now settled, then clear and recompute the overlay. A completed
        // transaction's mutation is kept in `pending_by_transaction` until
        // exactly this moment (see `on_transaction_finished`) rather than
        // rolled back on success; sync data for a touched key is
        // authoritative over any outstanding optimistic claim against it
        // (finished or not), so every `pending_by_transaction` entry
        // touching a key in this batch is dropped here before recomputing —
        // without this, a stale entry would keep masking the freshly
        // synced value forever, and pairing a masked `after` with the raw
        // `pre_sync` `before` above would misreport the diff for any key
        // that still carried an overlay entry going into this sync.
        {
            let mut inner = self.0.borrow_mut();
            let touched_set: HashSet<Key> = touched.iter().cloned().collect();
            let txn_ids: Vec<u64> = inner.pending_by_transaction.keys().cloned().collect();
            for id in txn_ids {
                if let Some(muts) = inner.pending_by_transaction.get_mut(&id) {
                    muts.retain(|m| !touched_set.contains(&m.key));
                }
            }
            let emptied: Vec<u64> = inner
                .pending_by_transaction
                .iter()
                .filter(|(_, muts)| muts.is_empty())
                .map(|(id, _)| *id)
                .collect();
            for id in emptied {
                inner.pending_by_transaction.remove(&id);
            }
            inner.optimistic_upserts.clear();
            inner.optimistic_deletes.clear();
            recompute_overlay(&mut inner);
        }

        // Steps 5 & 6: diff touched keys, suppressing already-announced values.
        let mut events = Vec::new();
        for key in &touched {
            let post = self.get(key);
            let suppress = {
                let inner = self.0.borrow();
                inner.recently_synced.get(key).map(|v| *v == post).unwrap_or(false)
            };
            if suppress {
                continue;
            }
            if let Some(event) = diff_event(key, pre_sync.get(key).cloned().flatten(), post) {
                events.push(event);
            }
        }
        {
            let mut inner = self.0.borrow_mut();
            for key in &touched {
                inner.recently_synced.remove(key);
            }
        }

        // Step 7: update indexes before notifying listeners.
        if !events.is_empty() {
            self.update_indexes(&events);
            self.0.borrow_mut().subscriptions.dispatch(&events);
        }
        Ok(())
    }
}

/// Recognizes a `field OP literal` predicate (spec §4.3.4: "if the predicate
/// matches `field OP literal` with an existing matching index... the
/// snapshot uses the index range") and resolves it to the index name a
/// single-field [`create_index`](Collection::create_index) call would have
/// used: the dotted join of the field's path, matching the convention the
/// store's own index creation follows (e.g. an index built over
/// `Expr::ref(["age"])` is named `"age"`).
fn index_range_of(expr: &Expr) -> Option<(String, RangeOp, DynValue)> {
    let (name, args) = match expr {
        Expr::Func { name, args } if args.len() == 2 => (name.as_str(), args),
        _ => return None,
    };
    let op = match name {
        "eq" => RangeOp::Eq,
        "lt" => RangeOp::Lt,
        "lte" => RangeOp::Lte,
        "gt" => RangeOp::Gt,
        "gte" => RangeOp::Gte,
        _ => return None,
    };
    match (&args[0], &args[1]) {
        (Expr::Ref { path }, Expr::Value { literal }) => Some((path.join("."), op, literal.clone())),
        _ => None,
    }
}

fn write_value<R>(write: &SyncWrite<R>) -> &R {
    match write {
        SyncWrite::Insert { value } => value,
        SyncWrite::Update { value, .. } => value,
        SyncWrite::Delete { value } => value,
    }
}

fn diff_event<R: Clone + PartialEq>(key: &Key, before: Option<R>, after: Option<R>) -> Option<ChangeMessage<R>> {
    match (before, after) {
        (None, Some(value)) => Some(ChangeMessage::Insert { key: key.clone(), value }),
        (Some(previous_value), Some(value)) => {
            if previous_value == value {
                None
            } else {
                Some(ChangeMessage::Update { key: key.clone(), value, previous_value })
            }
        }
        (Some(value), None) => Some(ChangeMessage::Delete { key: key.clone(), value }),
        (None, None) => None,
    }
}

fn values_equal<R: PartialEq>(a: &R, b: &R) -> bool {
    a == b
}

fn apply_mutation_to_overlay<R: Row>(inner: &mut CollectionInner<R>, mutation: &PendingMutation<R>) {
    match mutation.mutation_type {
        MutationType::Insert | MutationType::Update => {
            if let Some(value) = &mutation.modified {
                inner.optimistic_upserts.insert(mutation.key.clone(), value.clone());
                inner.optimistic_deletes.remove(&mutation.key);
            }
        }
        MutationType::Delete => {
            inner.optimistic_upserts.remove(&mutation.key);
            inner.optimistic_deletes.insert(mutation.key.clone());
        }
    }
}

/// Recomputes the entire optimistic overlay from every still-staged
/// transaction's mutations, in creation order (spec §4.3.3 step 4, §8
/// property 9).
fn recompute_overlay<R: Row>(inner: &mut CollectionInner<R>) {
    inner.optimistic_upserts.clear();
    inner.optimistic_deletes.clear();
    let ordered: Vec<(u64, Vec<PendingMutation<R>>)> = inner
        .pending_by_transaction
        .iter()
        .map(|(id, muts)| (*id, muts.clone()))
        .collect();
    for (_, mutations) in ordered {
        for mutation in &mutations {
            apply_mutation_to_overlay(inner, mutation);
        }
    }
}

mod sync_support {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    use crate::change::SyncWrite;
    use crate::error::CoreResult;
    use crate::value::Row;

    use super::CollectionInner;

    pub struct SyncHandle<R: Row> {
        pending: Rc<RefCell<Option<Vec<SyncWrite<R>>>>>,
        collection: Weak<RefCell<CollectionInner<R>>>,
    }

    impl<R: Row> Clone for SyncHandle<R> {
        fn clone(&self) -> Self {
            SyncHandle {
                pending: self.pending.clone(),
                collection: self.collection.clone(),
            }
        }
    }

    impl<R: Row> SyncHandle<R> {
        pub fn begin(&self) {
            let mut pending = self.pending.borrow_mut();
            if pending.is_none() {
                *pending = Some(Vec::new());
            }
        }

        pub fn write(&self, write: SyncWrite<R>) {
            self.pending.borrow_mut().get_or_insert_with(Vec::new).push(write);
        }

        pub fn commit(&self) -> CoreResult<()> {
            let batch = self.pending.borrow_mut().take().unwrap_or_default();
            match self.collection.upgrade() {
                Some(inner) => super::Collection(inner).apply_sync_batch(batch),
                None => Ok(()),
            }
        }
    }

    pub fn make_handle<R: Row>(collection: Weak<RefCell<CollectionInner<R>>>) -> SyncHandle<R> {
        SyncHandle {
            pending: Rc::new(RefCell::new(None)),
            collection,
        }
    }

    /// A sync driver: started once when the collection activates, returns a
    /// cleanup closure invoked exactly once on teardown (spec §4.3.2).
    pub trait SyncDriver<R: Row> {
        fn start(&self, handle: SyncHandle<R>) -> Box<dyn FnOnce()>;
    }

    pub type SyncDriverBox<R> = Rc<dyn SyncDriver<R>>;

    impl<R, F, C> SyncDriver<R> for F
    where
        R: Row,
        F: Fn(SyncHandle<R>) -> C,
        C: FnOnce() + 'static,
    {
        fn start(&self, handle: SyncHandle<R>) -> Box<dyn FnOnce()> {
            Box::new((self)(handle))
        }
    }
}

pub use sync_support::SyncDriver;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn preloaded(rows: Vec<serde_json::Value>) -> Collection<serde_json::Value> {
        let config = CollectionConfig::new(
            "people",
            |v: &serde_json::Value| Key::Int(v["id"].as_i64().unwrap_or(0)),
            Rc::new(move |handle: SyncHandle<serde_json::Value>| {
                handle.begin();
                for row in rows.clone() {
                    handle.write(SyncWrite::Insert { value: row });
                }
                let _ = handle.commit();
                Box::new(|| {}) as Box<dyn FnOnce()>
            }),
        );
        let collection = Collection::new(config);
        collection.preload().unwrap();
        collection
    }

    #[test]
    fn current_state_as_changes_routes_field_op_literal_through_a_matching_index() {
        let people = preloaded(vec![
            json!({"id": 1, "age": 20}),
            json!({"id": 2, "age": 30}),
            json!({"id": 3, "age": 40}),
        ]);
        people.create_index("age", Box::new(|v: &serde_json::Value| crate::value::json_to_dyn(&v["age"])));

        let filter = Expr::func("gte", vec![Expr::r#ref(["age"]), Expr::value(DynValue::Number(30.0))]);
        let mut ids: Vec<i64> = people
            .current_state_as_changes(Some(&filter))
            .iter()
            .map(|c| c.value()["id"].as_i64().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn current_state_as_changes_falls_back_to_a_full_scan_without_a_matching_index() {
        let people = preloaded(vec![json!({"id": 1, "age": 20}), json!({"id": 2, "age": 30})]);
        let filter = Expr::func("gte", vec![Expr::r#ref(["age"]), Expr::value(DynValue::Number(25.0))]);
        let changes = people.current_state_as_changes(Some(&filter));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].value()["id"], 2);
    }

    #[test]
    fn completed_transaction_stays_visible_until_sync_reconciles_it() {
        let handle_slot: Rc<RefCell<Option<SyncHandle<serde_json::Value>>>> = Rc::new(RefCell::new(None));
        let slot = handle_slot.clone();
        let mut config = CollectionConfig::new(
            "todos",
            |v: &serde_json::Value| Key::Str(v["id"].as_str().unwrap_or_default().to_string()),
            Rc::new(move |handle: SyncHandle<serde_json::Value>| {
                *slot.borrow_mut() = Some(handle);
                Box::new(|| {}) as Box<dyn FnOnce()>
            }),
        );
        config.on_insert = Some(Rc::new(|_muts| Ok(())));
        let todos = Collection::new(config);
        todos.preload().unwrap();

        let txn = todos.insert(json!({"id": "1", "text": "a"})).unwrap();
        assert!(txn.is_persisted().unwrap().is_ok());
        assert_eq!(todos.size(), 1, "a completed mutation must stay visible, not roll back like a failed one");
    }
}
