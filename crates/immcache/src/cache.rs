use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::fs;
use tokio::runtime::Handle;

use crate::config::DiskCacheConfig;
use crate::digest::{Digest, Hasher};
use crate::error::{CacheError, catch_not_found};
use crate::eviction::{Evict, EvictionPolicy, EvictionScheduler};
use crate::flight::{self, Completion, FlightGuard, Ledger, LoadOutcome};
use crate::index::{Lru, RecencyIndex};
use crate::loader::Loader;
use crate::store::ContentStore;
use crate::stream::{CacheStream, Tee};

/// An entry of the cache index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The digest of the content, which is also its address in the content store.
    pub digest: Digest,
    /// The size of the content in bytes.
    pub size: u64,
}

/// A disk-backed cache of immutable values.
///
/// The cache is a cheap handle to shared state and can be cloned freely. Nothing happens on
/// creation: the base directory and the integrity secret are set up lazily by the first
/// [`get_or_load`](Self::get_or_load).
///
/// `I` is the eviction policy, see [`RecencyIndex`].
pub struct DiskCache<I = Lru<String, CacheEntry>> {
    inner: Arc<Inner<I>>,
}

impl<I> Clone for DiskCache<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I> fmt::Debug for DiskCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct Inner<I> {
    config: DiskCacheConfig,
    books: Mutex<Books<I>>,
    /// Serializes the first requests while the cache is being initialized.
    initializing: tokio::sync::Mutex<()>,
}

/// Everything guarded by the bookkeeping lock.
struct Books<I> {
    state: State,
    /// Discarded on purge.
    index: Option<I>,
    /// The sum of the sizes of all indexed entries.
    size: u64,
    in_flight: HashMap<String, Completion>,
}

enum State {
    Uninitialized,
    Open(Open),
    Closed,
}

struct Open {
    storage: Storage,
    /// Dropping this stops the eviction task.
    eviction: Option<EvictionScheduler>,
}

/// What a request needs to read from or write to the content store.
#[derive(Clone)]
struct Storage {
    content: ContentStore,
    /// Keyed with the integrity secret, cloned for every stream.
    hasher: Hasher,
}

impl Storage {
    /// Opens the content of `entry` for verified reading.
    async fn open(&self, entry: &CacheEntry) -> io::Result<Option<CacheStream>> {
        let Some(file) = self.content.open(&entry.digest).await? else {
            return Ok(None);
        };
        Ok(Some(CacheStream::verified(
            file,
            self.content.path_for(&entry.digest),
            self.hasher.clone(),
            entry.digest,
            entry.size,
        )))
    }
}

/// The outcome of looking up a key under the bookkeeping lock.
enum Lookup {
    /// The cache is not available, call the loader directly.
    Bypass,
    Hit(Storage, CacheEntry),
    /// Another request is loading the key.
    Join(Completion),
    /// This request is loading the key.
    Lead(Storage, FlightGuard),
}

impl<I> Inner<I> {
    fn lock(&self) -> MutexGuard<'_, Books<I>> {
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I> Ledger for Inner<I>
where
    I: RecencyIndex<String, CacheEntry> + Send,
{
    fn conclude(&self, key: &str, entry: Option<CacheEntry>) -> bool {
        let mut guard = self.lock();
        let books = &mut *guard;
        books.in_flight.remove(key);

        let (Some(entry), State::Open(open), Some(index)) =
            (entry, &books.state, books.index.as_mut())
        else {
            return false;
        };

        let size = entry.size;
        if let Some(replaced) = index.set(key.to_owned(), entry) {
            books.size = books.size.saturating_sub(replaced.size);
        }
        books.size += size;

        let max_size = self.config.max_size;
        if max_size > 0 && books.size > max_size {
            if let Some(eviction) = &open.eviction {
                eviction.notify(books.size);
            }
        }
        true
    }

    fn is_open(&self) -> bool {
        matches!(self.lock().state, State::Open(_))
    }
}

impl<I> Evict for Inner<I>
where
    I: RecencyIndex<String, CacheEntry> + Send,
{
    fn pop_over_budget(&self, max_size: u64) -> Option<(String, CacheEntry)> {
        let mut books = self.lock();
        if books.size <= max_size {
            return None;
        }
        books.index.as_mut()?.remove_least_valuable()
    }

    fn release(&self, size: u64) {
        let mut books = self.lock();
        books.size = books.size.saturating_sub(size);
    }
}

impl DiskCache {
    /// Creates a cache with the default [`Lru`] eviction policy.
    pub fn new(config: DiskCacheConfig) -> Self {
        Self::with_index(Lru::new(), config)
    }
}

impl<I> DiskCache<I>
where
    I: RecencyIndex<String, CacheEntry> + Send + 'static,
{
    /// Creates a cache with a custom eviction policy.
    pub fn with_index(index: I, config: DiskCacheConfig) -> Self {
        let books = Books {
            state: State::Uninitialized,
            index: Some(index),
            size: 0,
            in_flight: HashMap::new(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                books: Mutex::new(books),
                initializing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Returns the value of `key`, either from disk or from `loader`.
    ///
    /// Concurrent requests for the same key share a single call to a loader. The returned stream
    /// must be read and then [closed](CacheStream::close). A loader error is returned as
    /// [`CacheError::Loader`]. Failures of the cache itself never surface here, the cache falls
    /// back to calling `loader` instead.
    pub async fn get_or_load<L>(&self, key: &str, loader: &L) -> Result<CacheStream, CacheError>
    where
        L: Loader + ?Sized,
    {
        self.ensure_initialized().await;

        let mut stale = false;
        let (storage, guard) = loop {
            match self.lookup(key, stale) {
                Lookup::Bypass => return load_direct(key, loader).await,
                Lookup::Hit(storage, entry) => match storage.open(&entry).await {
                    Ok(Some(stream)) => {
                        tracing::trace!(key, "Cache hit");
                        return Ok(stream);
                    }
                    Ok(None) => {
                        tracing::debug!(key, "Cached file is gone, reloading it");
                        stale = true;
                    }
                    Err(err) => {
                        log_open_error(&err, key);
                        return load_direct(key, loader).await;
                    }
                },
                Lookup::Join(completion) => {
                    tracing::trace!(key, "Waiting for in-flight load");
                    return match flight::wait(completion).await {
                        LoadOutcome::Published => self.after_join(key, loader).await,
                        LoadOutcome::Failed => load_direct(key, loader).await,
                    };
                }
                Lookup::Lead(storage, guard) => break (storage, guard),
            }
        };

        tracing::debug!(key, "Cache miss");
        self.lead(key, loader, storage, guard).await
    }

    /// Deletes all cached content and closes the cache for good.
    ///
    /// All later requests go straight to their loader. Calling this again does nothing.
    pub async fn purge_and_close(&self) -> io::Result<()> {
        let previous = {
            let mut books = self.inner.lock();
            books.index = None;
            books.size = 0;
            books.in_flight.clear();
            std::mem::replace(&mut books.state, State::Closed)
        };

        let State::Open(open) = previous else {
            return Ok(());
        };
        let base = open.storage.content.base().to_owned();
        drop(open);

        tracing::debug!(path = %base.display(), "Purging disk cache");
        catch_not_found(fs::remove_dir_all(&base).await)?;
        Ok(())
    }

    /// The base directory of an open cache.
    pub fn base_path(&self) -> Option<PathBuf> {
        match &self.inner.lock().state {
            State::Open(open) => Some(open.storage.content.base().to_owned()),
            _ => None,
        }
    }

    /// The total size of all indexed entries.
    pub fn tracked_size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Whether `key` is indexed. This counts as an access to the entry.
    pub fn contains(&self, key: &str) -> bool {
        let mut books = self.inner.lock();
        match books.index.as_mut() {
            Some(index) => index.get(&key.to_owned()).is_some(),
            None => false,
        }
    }

    fn lookup(&self, key: &str, skip_index: bool) -> Lookup {
        let mut guard = self.inner.lock();
        let books = &mut *guard;

        let State::Open(open) = &books.state else {
            return Lookup::Bypass;
        };
        let storage = open.storage.clone();

        if !skip_index {
            let indexed = books.index.as_mut().and_then(|index| index.get(&key.to_owned()));
            if let Some(entry) = indexed {
                return Lookup::Hit(storage, entry.clone());
            }
        }

        if let Some(completion) = books.in_flight.get(key) {
            return Lookup::Join(completion.clone());
        }

        let (guard, completion) = FlightGuard::new(key, self.inner.clone());
        books.in_flight.insert(key.to_owned(), completion);
        Lookup::Lead(storage, guard)
    }

    fn is_uninitialized(&self) -> bool {
        matches!(self.inner.lock().state, State::Uninitialized)
    }

    /// Provisions the base directory, the secret and the eviction task on first use.
    ///
    /// The filesystem work happens outside of the bookkeeping lock. Concurrent first requests
    /// wait for the one doing it.
    async fn ensure_initialized(&self) {
        if !self.is_uninitialized() {
            return;
        }
        let _initializing = self.inner.initializing.lock().await;
        if !self.is_uninitialized() {
            return;
        }

        let state = match self.open_storage().await {
            Ok(open) => State::Open(open),
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(
                    error = dynerr,
                    "Failed to initialize disk cache, caching is disabled"
                );
                State::Closed
            }
        };

        let discarded = {
            let mut guard = self.inner.lock();
            let books = &mut *guard;
            match books.state {
                State::Uninitialized => {
                    if let State::Closed = state {
                        books.index = None;
                    }
                    books.state = state;
                    None
                }
                // purged in the meantime
                _ => Some(state),
            }
        };

        if let Some(State::Open(open)) = discarded {
            let base = open.storage.content.base().to_owned();
            drop(open);
            if let Err(err) = catch_not_found(fs::remove_dir_all(&base).await) {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, "Failed to remove purged cache directory");
            }
        }
    }

    async fn open_storage(&self) -> io::Result<Open> {
        let config = &self.inner.config;

        let prepare = {
            let config = config.clone();
            move || -> io::Result<ContentStore> {
                let content = ContentStore::new(config.create_base_dir()?);
                match content.clear_tmp() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Removed stale temporary files"),
                    Err(err) => {
                        let dynerr: &dyn std::error::Error = &err;
                        tracing::warn!(error = dynerr, "Failed to remove stale temporary files");
                    }
                }
                Ok(content)
            }
        };
        let content = run_blocking(prepare).await?;

        let hasher = match &config.secret {
            Some(secret) => Hasher::new(secret)?,
            None => Hasher::new(&rand::random::<[u8; 32]>())?,
        };

        let eviction = match (config.max_size, Handle::try_current()) {
            (0, _) => None,
            (_, Ok(handle)) => {
                let books = Arc::downgrade(&self.inner) as Weak<dyn Evict>;
                let policy = EvictionPolicy::from_config(config);
                Some(EvictionScheduler::spawn(&handle, books, content.clone(), policy))
            }
            (_, Err(_)) => {
                tracing::warn!("Not running in a tokio runtime, eviction is disabled");
                None
            }
        };

        tracing::debug!(path = %content.base().display(), "Initialized disk cache");
        Ok(Open {
            storage: Storage { content, hasher },
            eviction,
        })
    }

    /// Serves `key` once the load this request waited for was published.
    async fn after_join<L>(&self, key: &str, loader: &L) -> Result<CacheStream, CacheError>
    where
        L: Loader + ?Sized,
    {
        let Some((storage, entry)) = self.indexed(key) else {
            return load_direct(key, loader).await;
        };
        match storage.open(&entry).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => load_direct(key, loader).await,
            Err(err) => {
                log_open_error(&err, key);
                load_direct(key, loader).await
            }
        }
    }

    /// Looks up `key` in the index only, without joining or starting a load.
    fn indexed(&self, key: &str) -> Option<(Storage, CacheEntry)> {
        let mut guard = self.inner.lock();
        let books = &mut *guard;
        let State::Open(open) = &books.state else {
            return None;
        };
        let entry = books.index.as_mut()?.get(&key.to_owned())?;
        Some((open.storage.clone(), entry.clone()))
    }

    /// Loads `key` as the single in-flight load, teeing the content into the store.
    async fn lead<L>(
        &self,
        key: &str,
        loader: &L,
        storage: Storage,
        guard: FlightGuard,
    ) -> Result<CacheStream, CacheError>
    where
        L: Loader + ?Sized,
    {
        let loaded = match loader.load(key).await {
            Ok(loaded) => loaded,
            Err(err) => {
                guard.fail();
                return Err(CacheError::Loader(err));
            }
        };

        let Some(size) = loaded.size else {
            tracing::trace!(key, "Unknown size, not caching");
            guard.fail();
            return Ok(CacheStream::from_loader(loaded.reader));
        };

        let max_size = self.inner.config.max_size;
        if max_size > 0 && size > max_size / 10 {
            tracing::debug!(key, size, max_size, "Too large for the cache, not caching");
            guard.fail();
            return Ok(CacheStream::from_loader(loaded.reader));
        }

        let content = storage.content.clone();
        let temp = match run_blocking(move || content.tempfile()).await {
            Ok(temp) => temp,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, key, "Failed to create temporary file");
                guard.fail();
                return Ok(CacheStream::from_loader(loaded.reader));
            }
        };
        let (file, temp) = temp.into_parts();

        let tee = Tee::new(
            loaded.reader,
            (fs::File::from_std(file), temp),
            storage.hasher,
            size,
            guard,
            storage.content,
        );
        Ok(CacheStream::tee(tee))
    }
}

/// Runs blocking filesystem work on the blocking pool of the current runtime, if there is one.
async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => handle.spawn_blocking(f).await.map_err(io::Error::other)?,
        Err(_) => f(),
    }
}

fn log_open_error(err: &io::Error, key: &str) {
    let dynerr: &dyn std::error::Error = err;
    tracing::warn!(error = dynerr, key, "Failed to open cached file");
}

async fn load_direct<L>(key: &str, loader: &L) -> Result<CacheStream, CacheError>
where
    L: Loader + ?Sized,
{
    let loaded = loader.load(key).await.map_err(CacheError::Loader)?;
    Ok(CacheStream::from_loader(loaded.reader))
}
