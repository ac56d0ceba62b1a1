//! Subscriber registry, filtered subscriptions, and GC timer (spec §4.3.4).

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::change::ChangeMessage;
use crate::query::functions::eval_row_predicate;
use crate::query::ir::Expr;
use crate::value::Row;

/// Default `gcTime`: 300 seconds (spec §3 lifecycle, §4.3.4).
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(300);

pub type Listener<R> = Box<dyn FnMut(&[ChangeMessage<R>])>;

/// `where(row) -> expr` (spec §4.3.4): a filter compiled to IR so the
/// store can introspect it (index-accelerated snapshots, range pushdown)
/// instead of an opaque closure.
pub type WherePredicate = Expr;

struct Subscription<R: Row> {
    listener: Listener<R>,
    filter: Option<WherePredicate>,
}

/// Handle returned by `subscribeChanges`; dropping or calling [`unsubscribe`]
/// on the owning registry detaches the listener.
pub type SubscriptionId = u64;

pub struct SubscriptionRegistry<R: Row> {
    next_id: SubscriptionId,
    subs: HashMap<SubscriptionId, Subscription<R>>,
    /// Set when the subscriber count drops to zero; cleared on the next
    /// `subscribe` (spec §4.3.4: "any new subscriber cancels the timer").
    zero_since: Option<Instant>,
}

impl<R: Row> Default for SubscriptionRegistry<R> {
    fn default() -> Self {
        SubscriptionRegistry {
            next_id: 0,
            subs: HashMap::new(),
            zero_since: None,
        }
    }
}

impl<R: Row> SubscriptionRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Listener<R>, filter: Option<WherePredicate>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subs.insert(id, Subscription { listener, filter });
        self.zero_since = None;
        id
    }

    /// Removes a subscriber. The caller is responsible for starting the GC
    /// timer (`mark_zero_if_empty`) — that's a collection-level decision,
    /// since it also needs to know whether `startSync` keeps the collection
    /// alive regardless of subscriber count.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subs.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn count(&self) -> usize {
        self.subs.len()
    }

    /// Starts the GC timer if there are no subscribers and it isn't already
    /// running.
    pub fn mark_zero_if_empty(&mut self, now: Instant) {
        if self.subs.is_empty() && self.zero_since.is_none() {
            self.zero_since = Some(now);
        }
    }

    /// Whether `gc_time` has elapsed since the subscriber count dropped to
    /// zero.
    pub fn gc_due(&self, now: Instant, gc_time: Duration) -> bool {
        match self.zero_since {
            Some(since) => self.subs.is_empty() && now.duration_since(since) >= gc_time,
            None => false,
        }
    }

    pub fn reset_gc_timer(&mut self) {
        self.zero_since = None;
    }

    /// Delivers a batch of events to every subscriber whose filter (if any)
    /// accepts the event's value (spec §4.3.4: "for deletes, the prior
    /// value is tested" — `ChangeMessage::Delete.value` already holds the
    /// last known value, so filtering on `msg.value()` is correct for every
    /// variant).
    pub fn dispatch(&mut self, events: &[ChangeMessage<R>]) {
        for sub in self.subs.values_mut() {
            let filtered: Vec<ChangeMessage<R>> = match &sub.filter {
                Some(expr) => events
                    .iter()
                    .filter(|e| eval_row_predicate(expr, e.value()).unwrap_or(false))
                    .cloned()
                    .collect(),
                None => events.to_vec(),
            };
            if !filtered.is_empty() {
                (sub.listener)(&filtered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use serde_json::json;
    use std::cell::RefCell;

    #[test]
    fn filtered_subscriber_only_sees_matching_events() {
        let mut reg: SubscriptionRegistry<serde_json::Value> = SubscriptionRegistry::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        reg.subscribe(
            Box::new(move |events| {
                for e in events {
                    seen2.borrow_mut().push(e.key().clone());
                }
            }),
            Some(Expr::func(
                "gte",
                vec![Expr::r#ref(["age"]), Expr::value(crate::value::DynValue::Number(30.0))],
            )),
        );
        reg.dispatch(&[
            ChangeMessage::Insert { key: Key::from("a"), value: json!({"age": 40}) },
            ChangeMessage::Insert { key: Key::from("b"), value: json!({"age": 10}) },
        ]);
        assert_eq!(*seen.borrow(), vec![Key::from("a")]);
    }

    #[test]
    fn gc_timer_lifecycle() {
        let mut reg: SubscriptionRegistry<serde_json::Value> = SubscriptionRegistry::new();
        let id = reg.subscribe(Box::new(|_| {}), None);
        let now = Instant::now();
        reg.mark_zero_if_empty(now);
        assert!(!reg.gc_due(now, Duration::from_secs(1)));
        reg.unsubscribe(id);
        reg.mark_zero_if_empty(now);
        assert!(reg.gc_due(now + Duration::from_secs(2), Duration::from_secs(1)));
        reg.subscribe(Box::new(|_| {}), None);
        reg.reset_gc_timer();
        assert!(!reg.gc_due(now + Duration::from_secs(2), Duration::from_secs(1)));
    }
}
