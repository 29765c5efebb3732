use super::transaction::ChangeSet;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type ChangeCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Handle returned by [`crate::Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Observer {
    id: SubscriptionId,
    collections: Option<BTreeSet<String>>,
    callback: ChangeCallback,
}

impl Observer {
    fn wants(&self, changes: &ChangeSet) -> bool {
        match &self.collections {
            None => true,
            Some(collections) => collections.iter().any(|c| changes.touches(c)),
        }
    }
}

/// Ordered delivery of committed change sets to observers.
///
/// Change sets are queued while the database lock is held, so the queue is
/// always in commit order. Delivery happens outside that lock; whichever
/// thread wins the `draining` flag delivers everything queued, including
/// change sets produced by writes made from inside a callback.
pub(crate) struct ChangeFeed {
    observers: Mutex<Vec<Observer>>,
    pending: Mutex<VecDeque<ChangeSet>>,
    draining: AtomicBool,
    next_id: AtomicU64,
}

impl ChangeFeed {
    pub fn new() -> Self {
        ChangeFeed {
            observers: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(
        &self,
        collections: Option<BTreeSet<String>>,
        callback: ChangeCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(Observer {
            id,
            collections,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn enqueue(&self, changes: ChangeSet) {
        if changes.is_empty() {
            return;
        }
        self.pending.lock().push_back(changes);
    }

    /// Deliver queued change sets unless another call is already delivering.
    ///
    /// A panicking observer is logged and skipped; the remaining observers
    /// and later change sets are still delivered.
    pub fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let guard = DrainGuard(&self.draining);

            loop {
                let next = self.pending.lock().pop_front();
                let Some(changes) = next else { break };
                let callbacks: Vec<ChangeCallback> = self
                    .observers
                    .lock()
                    .iter()
                    .filter(|o| o.wants(&changes))
                    .map(|o| o.callback.clone())
                    .collect();
                log::debug!(
                    "Publishing commit {} to {} observer(s)",
                    changes.commit,
                    callbacks.len()
                );
                for callback in callbacks {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&changes))).is_err() {
                        log::error!("Observer panicked on commit {}; skipping it", changes.commit);
                    }
                }
            }

            drop(guard);
            // A change set queued after the inner loop ended but before the
            // flag was cleared would otherwise sit until the next commit.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}

/// Clears the draining flag when dropped, including while unwinding.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CompositeKey;

    fn change(commit: u64, collection: &str) -> ChangeSet {
        let mut set = ChangeSet {
            commit,
            ..Default::default()
        };
        set.inserted.insert(CompositeKey::new(collection, "k"));
        set
    }

    #[test]
    fn test_filtered_observer_only_sees_its_collections() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        feed.subscribe(
            Some(BTreeSet::from(["cities".to_string()])),
            Arc::new(move |c: &ChangeSet| s.lock().push(c.commit)),
        );

        feed.enqueue(change(1, "states"));
        feed.enqueue(change(2, "cities"));
        feed.drain();

        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_empty_change_sets_are_dropped() {
        let feed = ChangeFeed::new();
        feed.enqueue(ChangeSet::default());
        assert!(feed.pending.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let id = feed.subscribe(None, Arc::new(move |_: &ChangeSet| *s.lock() += 1));

        feed.enqueue(change(1, "cities"));
        feed.drain();
        assert!(feed.unsubscribe(id));
        assert!(!feed.unsubscribe(id));
        feed.enqueue(change(2, "cities"));
        feed.drain();

        assert_eq!(*seen.lock(), 1);
        assert_eq!(feed.observer_count(), 0);
    }

    #[test]
    fn test_reentrant_enqueue_is_delivered_after_current() {
        let feed = Arc::new(ChangeFeed::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let weak = Arc::downgrade(&feed);
        feed.subscribe(
            None,
            Arc::new(move |c: &ChangeSet| {
                s.lock().push(c.commit);
                if c.commit == 1 {
                    if let Some(feed) = weak.upgrade() {
                        feed.enqueue(change(2, "cities"));
                        feed.drain();
                    }
                }
            }),
        );

        feed.enqueue(change(1, "cities"));
        feed.drain();

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_panicking_observer_does_not_stop_delivery() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        feed.subscribe(
            None,
            Arc::new(|c: &ChangeSet| {
                if c.commit == 1 {
                    panic!("observer failure");
                }
            }),
        );
        let s = seen.clone();
        feed.subscribe(None, Arc::new(move |c: &ChangeSet| s.lock().push(c.commit)));

        feed.enqueue(change(1, "cities"));
        feed.drain();
        feed.enqueue(change(2, "cities"));
        feed.drain();
        feed.enqueue(change(3, "cities"));
        feed.drain();

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(!feed.draining.load(Ordering::Acquire));
    }
}
