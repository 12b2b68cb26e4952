//! Idle-session queue
//!
//! A LIFO deque of ready entries paired with a fair counting semaphore whose
//! permit count tracks the deque length. The pairing gives two orderings at
//! once: the most recently released session is reused first (hot sessions
//! stay hot, the cold tail can be pruned), while blocked acquirers are
//! served oldest-first by the semaphore's FIFO wait queue.
//!
//! The semaphore is the sole rendezvous between producers (releasers,
//! growers) and consumers (waiters); the deque is never waited on directly.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::entry::PooledEntry;
use crate::error::{Error, Result};

/// Bounded wait used for opportunistic permit grabs: the burst probe at the
/// top of the acquire loop and the watcher's idle-prune attempt. Long enough
/// to not race fair wake-ups, short enough to not stall on a busy pool.
pub(crate) const PROBE_WAIT: Duration = Duration::from_millis(1);

/// Outcome of the watcher's attempt to remove the oldest idle entry.
pub(crate) enum Steal {
    /// The candidate was removed from the queue and its permit consumed.
    Stolen,
    /// No permit could be grabbed; a burst of traffic took every idle entry.
    Busy,
    /// The queue changed under the watcher; everything was put back.
    Raced(&'static str),
}

pub(crate) struct IdleQueue {
    slots: Mutex<VecDeque<Arc<PooledEntry>>>,
    permits: Semaphore,
}

impl IdleQueue {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
        }
    }

    /// Number of entries ready to be leased.
    pub(crate) fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Push a released entry to the front and wake one waiter.
    pub(crate) fn return_entry(&self, entry: Arc<PooledEntry>) {
        self.slots.lock().push_front(entry);
        self.permits.add_permits(1);
    }

    /// Wait up to `budget` for a permit, then pop the most recently
    /// released entry.
    ///
    /// Returns `Ok(None)` when the budget elapses (or is below the 1 ms
    /// granularity) and `Err(AcquireInterrupted)` when the pool shuts the
    /// queue down while the caller is parked.
    pub(crate) async fn take(&self, budget: Duration) -> Result<Option<Arc<PooledEntry>>> {
        if budget < PROBE_WAIT {
            return Ok(None);
        }
        match tokio::time::timeout(budget, self.permits.acquire()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(_closed)) => Err(Error::AcquireInterrupted),
            Ok(Ok(permit)) => {
                permit.forget();
                // Entries are pushed before their permit is released and
                // every popper holds a permit, so an empty deque here means
                // the queue was drained on a teardown path. Swallowing the
                // orphaned permit keeps the counts converging.
                Ok(self.slots.lock().pop_front())
            }
        }
    }

    /// Clone the entry that has been idle the longest, without removing it.
    pub(crate) fn peek_oldest(&self) -> Option<Arc<PooledEntry>> {
        self.slots.lock().back().cloned()
    }

    /// Atomically claim a permit and remove `candidate` from the tail.
    ///
    /// The entry peeked at may have been handed to a waiter in the meantime;
    /// every mismatch undoes the claim so a session already promised to a
    /// waiter is never removed.
    pub(crate) async fn steal_oldest(&self, candidate: &Arc<PooledEntry>) -> Steal {
        let permit = match tokio::time::timeout(PROBE_WAIT, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Steal::Busy,
        };
        permit.forget();
        if candidate.is_leased() {
            self.permits.add_permits(1);
            return Steal::Raced("idle session got leased after claiming its permit");
        }
        let mut slots = self.slots.lock();
        match slots.pop_back() {
            Some(tail) if Arc::ptr_eq(&tail, candidate) => Steal::Stolen,
            Some(tail) => {
                slots.push_back(tail);
                drop(slots);
                self.permits.add_permits(1);
                Steal::Raced("idle session no longer last in queue after claiming its permit")
            }
            None => {
                drop(slots);
                self.permits.add_permits(1);
                Steal::Raced("idle session no longer in queue after claiming its permit")
            }
        }
    }

    /// Wake every parked waiter with an interruption; used on pool close.
    pub(crate) fn shut_down(&self) {
        self.permits.close();
    }

    /// Remove and return all queued entries.
    pub(crate) fn drain(&self) -> Vec<Arc<PooledEntry>> {
        self.slots.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SessionId;
    use crate::session::Session;
    use std::any::Any;

    struct TestSession(&'static str);

    impl Session for TestSession {
        fn describe(&self) -> String {
            self.0.into()
        }

        fn as_any(&self) -> &(dyn Any + Send + Sync) {
            self
        }
    }

    fn entry(id: u64, name: &'static str) -> Arc<PooledEntry> {
        Arc::new(PooledEntry::new(
            SessionId::new(id),
            Arc::new(TestSession(name)),
        ))
    }

    #[tokio::test]
    async fn test_lifo_reuse() {
        let queue = IdleQueue::new();
        queue.return_entry(entry(1, "old"));
        queue.return_entry(entry(2, "hot"));
        assert_eq!(queue.available(), 2);

        let first = queue.take(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.session().describe(), "hot");
        let second = queue.take(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.session().describe(), "old");
    }

    #[tokio::test]
    async fn test_take_times_out_empty() {
        let queue = IdleQueue::new();
        let got = queue.take(Duration::from_millis(5)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_take_sub_millisecond_budget_returns_immediately() {
        let queue = IdleQueue::new();
        queue.return_entry(entry(1, "ready"));
        let got = queue.take(Duration::ZERO).await.unwrap();
        assert!(got.is_none());
        assert_eq!(queue.available(), 1);
    }

    #[tokio::test]
    async fn test_take_interrupted_on_shutdown() {
        let queue = Arc::new(IdleQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        let got = waiter.await.unwrap();
        assert!(matches!(got, Err(Error::AcquireInterrupted)));
    }

    #[tokio::test]
    async fn test_steal_oldest_takes_tail() {
        let queue = IdleQueue::new();
        let oldest = entry(1, "oldest");
        queue.return_entry(Arc::clone(&oldest));
        queue.return_entry(entry(2, "newer"));

        let peeked = queue.peek_oldest().unwrap();
        assert!(Arc::ptr_eq(&peeked, &oldest));
        assert!(matches!(queue.steal_oldest(&peeked).await, Steal::Stolen));
        assert_eq!(queue.available(), 1);
    }

    #[tokio::test]
    async fn test_steal_backs_off_when_empty_handed() {
        let queue = IdleQueue::new();
        let gone = entry(1, "gone");
        assert!(matches!(queue.steal_oldest(&gone).await, Steal::Busy));
    }

    #[tokio::test]
    async fn test_steal_undoes_claim_on_tail_change() {
        let queue = IdleQueue::new();
        let candidate = entry(1, "candidate");
        queue.return_entry(entry(2, "other"));

        match queue.steal_oldest(&candidate).await {
            Steal::Raced(_) => {}
            _ => panic!("expected raced outcome"),
        }
        // The permit and the other entry are both still available.
        assert_eq!(queue.available(), 1);
        assert!(queue.peek_oldest().is_some());
    }
}
