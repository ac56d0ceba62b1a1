//! The optimistic mutation lifecycle (spec §4.4).
//!
//! The teacher's `interactive` crate keeps a collection-id-keyed registry of
//! *arrangements* (`TraceManager`, `src/manager.rs`); this module applies
//! the same "look things up by id, never hold a raw pointer into another
//! subsystem" discipline to transactions, per the redesign note in spec §9
//! ("cyclic back-references... express as lookups by id").

pub mod state;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::collection::Collection;
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::ordered_map::OrderedMap;
use crate::value::Row;

pub use state::TransactionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

/// A single staged write (spec §3 "Transaction").
#[derive(Debug, Clone)]
pub struct PendingMutation<R> {
    pub mutation_id: u64,
    pub mutation_type: MutationType,
    pub key: Key,
    pub original: Option<R>,
    pub modified: Option<R>,
    pub collection_id: String,
    pub optimistic: bool,
    pub metadata: Option<serde_json::Value>,
}

/// The boxed, synchronous stand-in for the spec's awaited `mutationFn`
/// (SPEC_FULL §5 Rust mapping: no async runtime in the ambient stack).
pub type MutationFn<R> = Rc<dyn Fn(&[PendingMutation<R>]) -> Result<(), String>>;

struct TransactionInner<R: Row> {
    id: u64,
    created_at: u64,
    state: TransactionState,
    mutations: Vec<PendingMutation<R>>,
    mutation_fn: Option<MutationFn<R>>,
    /// Collections this transaction has staged mutations against, so
    /// `commit`/`fail` can tell each one to drop this transaction's overlay
    /// contribution (spec §4.4.2 "dropped from every participating
    /// collection's registry").
    participants: Vec<Collection<R>>,
    result: Option<Result<(), CoreError>>,
}

/// A handle to a staged, in-flight transaction.
pub struct TransactionHandle<R: Row>(Rc<RefCell<TransactionInner<R>>>);

impl<R: Row> Clone for TransactionHandle<R> {
    fn clone(&self) -> Self {
        TransactionHandle(self.0.clone())
    }
}

impl<R: Row> PartialEq for TransactionHandle<R> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<R: Row> TransactionHandle<R> {
    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn created_at(&self) -> u64 {
        self.0.borrow().created_at
    }

    pub fn state(&self) -> TransactionState {
        self.0.borrow().state
    }

    pub fn mutations(&self) -> std::cell::Ref<'_, [PendingMutation<R>]> {
        std::cell::Ref::map(self.0.borrow(), |inner| inner.mutations.as_slice())
    }

    /// Stages a mutation and registers `collection` as a participant if it
    /// hasn't already.
    pub(crate) fn stage(&self, collection: &Collection<R>, mutation: PendingMutation<R>) {
        let mut inner = self.0.borrow_mut();
        inner.mutations.push(mutation);
        if !inner.participants.iter().any(|c| c.id() == collection.id()) {
            inner.participants.push(collection.clone());
        }
    }

    /// Runs `f` synchronously. In the original this marks the transaction as
    /// "ambient" so nested collection operations enroll in it implicitly;
    /// this port makes that enrollment explicit (spec §9 redesign guidance
    /// against fragile implicit state) by handing `f` the handle it should
    /// pass to `Collection::insert_in`/`update_in`/`delete_in`.
    pub fn mutate<T>(&self, f: impl FnOnce(&TransactionHandle<R>) -> T) -> T {
        f(self)
    }

    /// `pending -> persisting`, runs `mutationFn`, then `persisting ->
    /// completed|failed`. Returns the same outcome `isPersisted` would
    /// resolve/reject with.
    pub fn commit(&self) -> CoreResult<()> {
        {
            let mut inner = self.0.borrow_mut();
            inner
                .state
                .can_transition_to(TransactionState::Persisting)
                .then_some(())
                .ok_or_else(|| CoreError::Usage("transaction already committed".into()))?;
            inner.state = TransactionState::Persisting;
        }

        let (mutation_fn, mutations) = {
            let inner = self.0.borrow();
            (inner.mutation_fn.clone(), inner.mutations.clone())
        };

        let outcome = match mutation_fn {
            Some(f) => (f)(&mutations).map_err(CoreError::MutationFn),
            None => Ok(()),
        };

        let next_state = if outcome.is_ok() {
            TransactionState::Completed
        } else {
            TransactionState::Failed
        };
        tracing::debug!(id = self.id(), state = ?next_state, "transaction finished");

        let participants = {
            let mut inner = self.0.borrow_mut();
            inner.state = next_state;
            inner.result = Some(outcome.clone());
            std::mem::take(&mut inner.participants)
        };
        for collection in &participants {
            collection.on_transaction_finished(self.id(), outcome.is_ok());
        }

        outcome
    }

    /// `isPersisted`: the stored outcome once the transaction has finished.
    pub fn is_persisted(&self) -> Option<CoreResult<()>> {
        self.0.borrow().result.clone()
    }
}

/// Global, monotonically increasing transaction id source (spec §4.1, §5:
/// "transactions are ordered by creation time"). Every [`TransactionManager`]
/// draws from the same counter so that ids stay unique and creation-ordered
/// across independent managers — in particular across the ad hoc manager a
/// collection spins up per direct-mutation call (spec §4.4.4) and any
/// longer-lived manager a caller keeps for explicit multi-collection
/// transactions. A per-instance counter would let two managers both mint id
/// 0 and collide inside a shared collection's `pending_by_transaction` map.
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(0);

fn next_transaction_id() -> u64 {
    NEXT_TXN_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Keeps an ordered registry of every transaction it has created, satisfying
/// the §4.1 requirement for an ordered-by-creation-time transaction registry
/// independent of any one collection's bookkeeping. Ids themselves come from
/// the process-wide [`next_transaction_id`] counter, not a per-manager one.
pub struct TransactionManager<R: Row> {
    registry: OrderedMap<u64, TransactionHandle<R>>,
}

impl<R: Row> Default for TransactionManager<R> {
    fn default() -> Self {
        TransactionManager {
            registry: OrderedMap::new(|a: &u64, b: &u64| a.cmp(b)),
        }
    }
}

impl<R: Row> TransactionManager<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `createTransaction({ mutationFn, autoCommit })` (spec §4.4.2).
    /// `autoCommit` is left to the caller: call `.commit()` immediately
    /// after `.mutate(...)` for auto-commit behavior.
    pub fn create_transaction(&mut self, mutation_fn: Option<MutationFn<R>>) -> TransactionHandle<R> {
        let id = next_transaction_id();
        let handle = TransactionHandle(Rc::new(RefCell::new(TransactionInner {
            id,
            created_at: id,
            state: TransactionState::Pending,
            mutations: Vec::new(),
            mutation_fn,
            participants: Vec::new(),
            result: None,
        })));
        self.registry.insert(id, handle.clone());
        handle
    }

    /// Transactions still `pending`/`persisting`, ordered by creation time.
    pub fn active(&self) -> impl Iterator<Item = &TransactionHandle<R>> {
        self.registry
            .values()
            .filter(|t| t.state().is_active())
    }

    /// Drops finished transactions from the registry (spec §3 lifecycle:
    /// "Transactions live only until `completed` or `failed`, then are
    /// dropped from the active list").
    pub fn prune_finished(&mut self) {
        let finished: Vec<u64> = self
            .registry
            .iter()
            .filter(|(_, t)| t.state().is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.registry.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions_on_success() {
        let mut mgr: TransactionManager<serde_json::Value> = TransactionManager::new();
        let txn = mgr.create_transaction(Some(Rc::new(|_muts| Ok(()))));
        assert_eq!(txn.state(), TransactionState::Pending);
        assert!(txn.commit().is_ok());
        assert_eq!(txn.state(), TransactionState::Completed);
        assert_eq!(txn.is_persisted(), Some(Ok(())));
    }

    #[test]
    fn state_machine_transitions_on_failure() {
        let mut mgr: TransactionManager<serde_json::Value> = TransactionManager::new();
        let txn = mgr.create_transaction(Some(Rc::new(|_muts| Err("nope".into()))));
        assert!(txn.commit().is_err());
        assert_eq!(txn.state(), TransactionState::Failed);
    }

    #[test]
    fn transactions_ordered_by_creation() {
        let mut mgr: TransactionManager<serde_json::Value> = TransactionManager::new();
        let t1 = mgr.create_transaction(None);
        let t2 = mgr.create_transaction(None);
        assert!(t1.created_at() < t2.created_at());
    }
}
