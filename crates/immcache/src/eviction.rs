//! Background shrinking of an over-budget cache.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::CacheEntry;
use crate::config::DiskCacheConfig;
use crate::store::ContentStore;

/// The index side of an eviction pass.
pub(crate) trait Evict: Send + Sync {
    /// Removes the least valuable entry from the index, if the cache is over `max_size`.
    ///
    /// The size of the removed entry stays accounted until it is [`release`](Self::release)d.
    fn pop_over_budget(&self, max_size: u64) -> Option<(String, CacheEntry)>;

    /// Subtracts the size of an evicted entry from the tracked size.
    fn release(&self, size: u64);
}

/// Decides whether a wake-up of the eviction task turns into an eviction pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvictionPolicy {
    pub max_size: u64,
    pub period_min: Duration,
    pub emergency_ratio: f64,
}

impl EvictionPolicy {
    pub fn from_config(config: &DiskCacheConfig) -> Self {
        Self {
            max_size: config.max_size,
            period_min: config.eviction_period_min,
            emergency_ratio: config.emergency_ratio(),
        }
    }

    /// Whether to run a pass `since_last` after the previous one, with the cache at `size`.
    pub fn should_run(&self, since_last: Duration, size: u64) -> bool {
        if self.max_size == 0 {
            return false;
        }
        since_last >= self.period_min || size as f64 / self.max_size as f64 >= self.emergency_ratio
    }
}

/// Handle to the background eviction task of an open cache.
///
/// Dropping the scheduler stops the task.
#[derive(Debug)]
pub(crate) struct EvictionScheduler {
    sender: mpsc::Sender<u64>,
    task: JoinHandle<()>,
}

impl EvictionScheduler {
    pub fn spawn(
        handle: &Handle,
        books: Weak<dyn Evict>,
        content: ContentStore,
        policy: EvictionPolicy,
    ) -> Self {
        // A single slot: one pending wake-up is as good as many.
        let (sender, receiver) = mpsc::channel(1);
        let task = handle.spawn(run(receiver, books, content, policy));
        Self { sender, task }
    }

    /// Signals that the cache grew to `size`, which is over budget.
    ///
    /// Never blocks. The signal is dropped if a previous one is still pending.
    pub fn notify(&self, size: u64) {
        if self.sender.try_send(size).is_err() {
            tracing::trace!("Eviction already pending");
        }
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut receiver: mpsc::Receiver<u64>,
    books: Weak<dyn Evict>,
    content: ContentStore,
    policy: EvictionPolicy,
) {
    let mut last_pass: Option<Instant> = None;

    while let Some(size) = receiver.recv().await {
        let since_last = last_pass.map_or(Duration::MAX, |at| at.elapsed());
        if !policy.should_run(since_last, size) {
            tracing::trace!(size, "Skipping rate limited eviction");
            continue;
        }

        let Some(books) = books.upgrade() else {
            break;
        };
        evict(&*books, &content, policy.max_size).await;
        last_pass = Some(Instant::now());
    }
}

/// Evicts entries until the cache is within `max_size`.
///
/// The pass stops at the first filesystem error other than an already absent file, leaving the
/// rest to the next pass.
pub(crate) async fn evict(books: &dyn Evict, content: &ContentStore, max_size: u64) -> usize {
    let mut evicted = 0;
    while let Some((key, entry)) = books.pop_over_budget(max_size) {
        let result = content.delete(&entry.digest).await;
        // the entry is gone from the index either way
        books.release(entry.size);

        if let Err(err) = result {
            let dynerr: &dyn std::error::Error = &err;
            tracing::error!(error = dynerr, key = %key, "Failed to evict cache entry");
            break;
        }
        tracing::debug!(key = %key, size = entry.size, "Evicted cache entry");
        evicted += 1;
    }
    evicted
}
