//! Request coalescing for concurrent loads of the same key.

use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::cache::CacheEntry;

/// How an in-flight load ended, as seen by the requests waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadOutcome {
    /// The content was published and indexed.
    Published,
    /// Nothing was cached. Waiters have to call their own loader.
    Failed,
}

/// A clonable completion signal of an in-flight load.
pub(crate) type Completion = Shared<oneshot::Receiver<LoadOutcome>>;

/// Waits for an in-flight load to finish.
///
/// A leader that went away without signalling counts as a failed load.
pub(crate) async fn wait(completion: Completion) -> LoadOutcome {
    completion.await.unwrap_or(LoadOutcome::Failed)
}

/// The bookkeeping side of a [`DiskCache`](crate::DiskCache), as seen by in-flight loads.
pub(crate) trait Ledger: Send + Sync {
    /// Ends the in-flight load of `key`, indexing `entry` if there is one.
    ///
    /// The in-flight record is removed and the entry is inserted in the same critical section,
    /// so a request always observes one of the two. Returns whether the entry was indexed.
    fn conclude(&self, key: &str, entry: Option<CacheEntry>) -> bool;

    /// Whether the cache still accepts new entries.
    fn is_open(&self) -> bool;
}

/// Ownership of the in-flight load of a key.
///
/// Exactly one request per key holds a guard at any time. The guard removes the in-flight record
/// and wakes up all waiters when it is concluded, or as a failure when it is dropped.
pub(crate) struct FlightGuard {
    key: String,
    ledger: Arc<dyn Ledger>,
    sender: Option<oneshot::Sender<LoadOutcome>>,
}

impl FlightGuard {
    /// Registers a new in-flight load, returning the guard and the completion to hand out to
    /// concurrent requests.
    ///
    /// Must be called under the bookkeeping lock, and the completion must be stored in the
    /// in-flight map in the same critical section.
    pub fn new(key: &str, ledger: Arc<dyn Ledger>) -> (Self, Completion) {
        let (sender, receiver) = oneshot::channel();
        let guard = Self {
            key: key.to_owned(),
            ledger,
            sender: Some(sender),
        };
        (guard, receiver.shared())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the cache this load belongs to is still open.
    pub fn is_cache_open(&self) -> bool {
        self.ledger.is_open()
    }

    /// Concludes the load, indexing `entry`.
    ///
    /// Returns whether the entry was indexed. Must not be called under the bookkeeping lock.
    pub fn publish(mut self, entry: CacheEntry) -> bool {
        self.conclude(Some(entry)) == LoadOutcome::Published
    }

    /// Concludes the load without caching anything.
    pub fn fail(mut self) {
        self.conclude(None);
    }

    fn conclude(&mut self, entry: Option<CacheEntry>) -> LoadOutcome {
        let Some(sender) = self.sender.take() else {
            return LoadOutcome::Failed;
        };
        let outcome = match self.ledger.conclude(&self.key, entry) {
            true => LoadOutcome::Published,
            false => LoadOutcome::Failed,
        };
        // nobody waiting is fine
        let _ = sender.send(outcome);
        outcome
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.conclude(None);
    }
}
