//! # immcache
//!
//! A content-verified, immutable, disk-backed key/value cache.
//!
//! Callers ask for a value by key and hand in a [`Loader`] that knows how to produce it. The
//! cache either serves a previously stored copy from disk, or invokes the loader, streams its
//! bytes back to the caller and persists them on the side. The intended use is caching immutable
//! and expensive resources, like versioned HTTP assets, bounded by a disk budget.
//!
//! ## Components
//!
//! - A [`RecencyIndex`] decides which entry is the least valuable one once the cache has to
//!   shrink. [`Lru`] is the default policy, but the engine only depends on the trait.
//! - The content store keeps one file per distinct content [`Digest`], sharded by the first two
//!   hex characters of the digest: `{base}/{ab}/{cdef…}`. Publishing is a claim on the final
//!   path followed by an atomic rename of a temporary file living directly in `{base}`.
//! - Request coalescing makes sure that there is at most one in-flight load per key. Concurrent
//!   requests for the same key wait for the first one instead of invoking their loader.
//! - On a miss, the loader stream is wrapped in a tee, which hands every byte to the caller while
//!   writing it to a temporary file and feeding it into a keyed digest. Closing the tee validates
//!   the byte count and publishes the file.
//! - On a hit, the file is wrapped in a verifier which recomputes the digest while the caller
//!   reads and compares it on close. Corrupted files are deleted and reported as
//!   [`CacheError::Corrupted`].
//! - A background eviction task shrinks the cache back under its budget. It is rate limited by
//!   [`DiskCacheConfig::eviction_period_min`], unless the cache is more than
//!   [`DiskCacheConfig::eviction_emergency_ratio`] times over budget.
//!
//! ## Closing streams
//!
//! Every [`CacheStream`] has to be closed with [`CacheStream::close`]. Closing is where the
//! integrity of cached content is checked and where freshly loaded content is published, so the
//! returned error is meaningful and must be checked.
//!
//! ## Degraded operation
//!
//! Caching is best effort. If the base directory cannot be created, or after
//! [`DiskCache::purge_and_close`], the cache hands out the loader stream directly without
//! persisting anything, and never fails because of its own state.
//!
//! ## Example
//!
//! ```no_run
//! use immcache::{DiskCache, DiskCacheConfig, FnLoader, Loaded};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn run() -> Result<(), immcache::CacheError> {
//! let cache = DiskCache::new(DiskCacheConfig::default());
//! let loader = FnLoader(|_key: String| async { Ok(Loaded::from_bytes("toto")) });
//!
//! let mut stream = cache.get_or_load("k", &loader).await?;
//! let mut content = Vec::new();
//! stream.read_to_end(&mut content).await?;
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod cache;
mod config;
mod digest;
mod error;
mod eviction;
mod flight;
mod index;
mod loader;
mod store;
mod stream;

pub use cache::{CacheEntry, DiskCache};
pub use config::DiskCacheConfig;
pub use digest::Digest;
pub use error::CacheError;
pub use index::{Lru, RecencyIndex};
pub use loader::{BoxReader, FnLoader, Loaded, Loader};
pub use stream::{CacheStream, StreamSource};
