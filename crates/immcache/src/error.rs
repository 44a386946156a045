use std::io;

use thiserror::Error;

/// An error returned by [`DiskCache::get_or_load`](crate::DiskCache::get_or_load) or when closing
/// a [`CacheStream`](crate::CacheStream).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The loader failed.
    ///
    /// The loader's error is passed through untouched.
    #[error(transparent)]
    Loader(anyhow::Error),
    /// The content read from disk does not match the digest it was stored under.
    ///
    /// The offending file has already been removed, so the next request for the same key goes
    /// through the loader again.
    #[error("corrupted cache entry")]
    Corrupted,
    /// The loader declared a different size than the number of bytes it produced.
    ///
    /// Nothing was persisted.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The size declared by the loader.
        expected: u64,
        /// The number of bytes actually streamed.
        actual: u64,
    },
    /// Reading, writing or publishing a cache file failed.
    #[error("cache i/o failed")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this error was produced by the loader rather than by the cache.
    pub fn is_loader_error(&self) -> bool {
        matches!(self, Self::Loader(_))
    }
}

/// Turns an [`io::ErrorKind::NotFound`] error into `Ok(None)`.
///
/// A missing file is a regular cache miss and not an error. Every other error is passed on.
pub(crate) fn catch_not_found<R>(result: io::Result<R>) -> io::Result<Option<R>> {
    match result {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
