//! Signature-keyed subscription registry with reentrant mutation buffering.
//!
//! The registry stores consumer *tokens*, never consumer objects; turning a
//! token into a live consumer is the dispatcher's job.
//!
//! # Reentrancy
//!
//! While [`SubscriptionRegistry::dispatch`] walks the consumer set of
//! signature `S`, consumers may subscribe or unsubscribe, including for `S`
//! itself:
//!
//! ```text
//!   dispatch(S) ── lock ── snapshot set(S) ── mark S active ── unlock
//!        │
//!        ├─ deliver(c1) ─┐  subscribe(S, c9)   -> pending_add
//!        │               └─ unsubscribe(S, c2) -> pending_remove
//!        ├─ deliver(c2)    (still delivered: it was in the snapshot)
//!        │
//!        └─ lock ── merge pending into set(S) ── prune if empty ── clear marker
//! ```
//!
//! Mutations for any other signature apply immediately. Only one signature
//! may be active at a time; a nested `dispatch` is refused.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::signature::Signature;
use crate::trace::{trace, warn};
use crate::types::ConsumerId;

/// Reason a dispatch did not run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no consumers subscribed")]
    NoConsumers,
    #[error("dispatch of {active} already in progress")]
    Busy { active: String },
}

#[derive(Default)]
struct Table {
    consumers: BTreeMap<Signature, BTreeSet<ConsumerId>>,
    /// Signature currently being dispatched.
    processing: Option<Signature>,
    pending_add: BTreeSet<ConsumerId>,
    pending_remove: BTreeSet<ConsumerId>,
}

impl Table {
    fn is_processing(&self, signature: &Signature) -> bool {
        self.processing.as_ref() == Some(signature)
    }

    fn remove_now(&mut self, signature: &Signature, consumer: ConsumerId) -> bool {
        let Some(set) = self.consumers.get_mut(signature) else {
            return false;
        };
        let removed = set.remove(&consumer);
        if set.is_empty() {
            self.consumers.remove(signature);
        }
        removed
    }

    fn defer_add(&mut self, consumer: ConsumerId) {
        self.pending_remove.remove(&consumer);
        self.pending_add.insert(consumer);
    }

    fn defer_remove(&mut self, consumer: ConsumerId) {
        self.pending_add.remove(&consumer);
        self.pending_remove.insert(consumer);
    }

    fn finish(&mut self) {
        let Some(signature) = self.processing.take() else {
            return;
        };
        let add = std::mem::take(&mut self.pending_add);
        let remove = std::mem::take(&mut self.pending_remove);
        if !add.is_empty() {
            self.consumers.entry(signature.clone()).or_default().extend(add);
        }
        for consumer in remove {
            self.remove_now(&signature, consumer);
        }
    }
}

/// Maps signatures to the consumers subscribed to them.
#[derive(Default)]
pub struct SubscriptionRegistry {
    table: Mutex<Table>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, signature: Signature, consumer: ConsumerId) {
        let mut table = self.lock();
        if table.is_processing(&signature) {
            trace!(%signature, %consumer, "subscribe deferred until dispatch completes");
            table.defer_add(consumer);
            return;
        }
        table.consumers.entry(signature).or_default().insert(consumer);
    }

    pub fn unsubscribe(&self, signature: &Signature, consumer: ConsumerId) {
        let mut table = self.lock();
        if table.is_processing(signature) {
            trace!(%signature, %consumer, "unsubscribe deferred until dispatch completes");
            table.defer_remove(consumer);
            return;
        }
        table.remove_now(signature, consumer);
    }

    /// Removes `consumer` from every signature whose type tag is `type_tag`.
    pub fn unsubscribe_all(&self, type_tag: &str, consumer: ConsumerId) {
        let mut table = self.lock();
        let matching: Vec<Signature> = table
            .consumers
            .iter()
            .filter(|(sig, set)| sig.type_tag() == type_tag && set.contains(&consumer))
            .map(|(sig, _)| sig.clone())
            .collect();
        for signature in matching {
            if table.is_processing(&signature) {
                table.defer_remove(consumer);
            } else {
                table.remove_now(&signature, consumer);
            }
        }
    }

    /// Removes `consumer` from every signature.
    pub fn forget(&self, consumer: ConsumerId) {
        let mut table = self.lock();
        let matching: Vec<Signature> = table
            .consumers
            .iter()
            .filter(|(_, set)| set.contains(&consumer))
            .map(|(sig, _)| sig.clone())
            .collect();
        for signature in matching {
            if table.is_processing(&signature) {
                table.defer_remove(consumer);
            } else {
                table.remove_now(&signature, consumer);
            }
        }
        table.pending_add.remove(&consumer);
    }

    #[must_use]
    pub fn is_subscribed(&self, signature: &Signature) -> bool {
        self.lock().consumers.contains_key(signature)
    }

    #[must_use]
    pub fn contains(&self, signature: &Signature, consumer: ConsumerId) -> bool {
        self.lock()
            .consumers
            .get(signature)
            .is_some_and(|set| set.contains(&consumer))
    }

    /// Number of distinct signatures with at least one consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `deliver` once for each consumer subscribed to `signature`.
    ///
    /// The registry lock is not held while `deliver` runs, so consumers may
    /// mutate subscriptions from inside the callback.
    ///
    /// # Errors
    ///
    /// Fails if nobody is subscribed to `signature` or another dispatch is
    /// in progress on this registry.
    pub fn dispatch(
        &self,
        signature: &Signature,
        mut deliver: impl FnMut(ConsumerId),
    ) -> Result<usize, DispatchError> {
        let snapshot: Vec<ConsumerId> = {
            let mut table = self.lock();
            if let Some(active) = &table.processing {
                warn!(%signature, %active, "dispatch refused: registry busy");
                return Err(DispatchError::Busy {
                    active: active.to_string(),
                });
            }
            let Some(set) = table.consumers.get(signature) else {
                warn!(%signature, "dispatch refused: no consumers");
                return Err(DispatchError::NoConsumers);
            };
            let snapshot = set.iter().copied().collect();
            table.processing = Some(signature.clone());
            snapshot
        };

        // Merge pending mutations even if a consumer panics.
        let guard = FinishOnDrop(self);
        for consumer in &snapshot {
            deliver(*consumer);
        }
        drop(guard);
        Ok(snapshot.len())
    }
}

struct FinishOnDrop<'a>(&'a SubscriptionRegistry);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.lock().finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn ping() -> Signature {
        Signature::new("app", "ping")
    }

    fn pong() -> Signature {
        Signature::new("app", "pong")
    }

    #[test]
    fn dispatch_reaches_every_subscriber_once() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry.subscribe(ping(), ConsumerId(2));
        registry.subscribe(ping(), ConsumerId(2));

        let mut seen = Vec::new();
        let count = registry.dispatch(&ping(), |c| seen.push(c)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, [ConsumerId(1), ConsumerId(2)]);
    }

    #[test]
    fn empty_sets_are_pruned() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        assert!(registry.is_subscribed(&ping()));
        registry.unsubscribe(&ping(), ConsumerId(1));
        assert!(!registry.is_subscribed(&ping()));
        assert!(registry.is_empty());
    }

    #[test]
    fn dispatch_without_consumers_fails() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.dispatch(&ping(), |_| {}),
            Err(DispatchError::NoConsumers)
        );
    }

    #[test]
    fn nested_dispatch_is_refused() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry.subscribe(pong(), ConsumerId(1));
        let mut nested = None;
        registry
            .dispatch(&ping(), |_| {
                nested = Some(registry.dispatch(&pong(), |_| {}));
            })
            .unwrap();
        assert!(matches!(nested, Some(Err(DispatchError::Busy { .. }))));
    }

    #[test]
    fn mutation_of_active_signature_applies_after_pass() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry.subscribe(ping(), ConsumerId(2));

        let seen = RefCell::new(Vec::new());
        registry
            .dispatch(&ping(), |c| {
                seen.borrow_mut().push(c);
                if c == ConsumerId(1) {
                    registry.subscribe(ping(), ConsumerId(3));
                    registry.unsubscribe(&ping(), ConsumerId(2));
                    // Not yet visible.
                    assert!(registry.contains(&ping(), ConsumerId(2)));
                    assert!(!registry.contains(&ping(), ConsumerId(3)));
                }
            })
            .unwrap();
        assert_eq!(*seen.borrow(), [ConsumerId(1), ConsumerId(2)]);

        seen.borrow_mut().clear();
        registry.dispatch(&ping(), |c| seen.borrow_mut().push(c)).unwrap();
        assert_eq!(*seen.borrow(), [ConsumerId(1), ConsumerId(3)]);
    }

    #[test]
    fn self_unsubscribe_of_last_consumer_prunes_after_pass() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry
            .dispatch(&ping(), |c| registry.unsubscribe(&ping(), c))
            .unwrap();
        assert!(!registry.is_subscribed(&ping()));
    }

    #[test]
    fn later_call_wins_within_one_pass() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry
            .dispatch(&ping(), |c| {
                registry.unsubscribe(&ping(), c);
                registry.subscribe(ping(), c);
            })
            .unwrap();
        assert!(registry.contains(&ping(), ConsumerId(1)));
    }

    #[test]
    fn other_signatures_change_immediately() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry
            .dispatch(&ping(), |_| {
                registry.subscribe(pong(), ConsumerId(7));
                assert!(registry.is_subscribed(&pong()));
            })
            .unwrap();
    }

    #[test]
    fn unsubscribe_all_matches_type_tag_only() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(1));
        registry.subscribe(pong(), ConsumerId(1));
        registry.subscribe(Signature::new("other", "ping"), ConsumerId(1));
        registry.subscribe(pong(), ConsumerId(2));

        registry.unsubscribe_all("app", ConsumerId(1));
        assert!(!registry.is_subscribed(&ping()));
        assert!(registry.contains(&pong(), ConsumerId(2)));
        assert!(!registry.contains(&pong(), ConsumerId(1)));
        assert!(registry.is_subscribed(&Signature::new("other", "ping")));
    }

    #[test]
    fn forget_drops_consumer_everywhere() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(ping(), ConsumerId(4));
        registry.subscribe(pong(), ConsumerId(4));
        registry.forget(ConsumerId(4));
        assert!(registry.is_empty());
    }
}
