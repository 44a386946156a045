use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tempfile::TempPath;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::cache::CacheEntry;
use crate::digest::{Digest, Hasher};
use crate::error::{CacheError, catch_not_found};
use crate::flight::FlightGuard;
use crate::loader::BoxReader;
use crate::store::{ContentStore, Publish};

/// Where the bytes of a [`CacheStream`] come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    /// Straight from the loader. Nothing is persisted.
    Loader,
    /// A cache hit, verified against its digest on close.
    Disk,
    /// A cache miss, persisted on close.
    Tee,
}

/// The value returned by [`DiskCache::get_or_load`](crate::DiskCache::get_or_load).
///
/// Read it with [`AsyncReadExt`](tokio::io::AsyncReadExt) and always finish with
/// [`close`](Self::close), which reports integrity and persistence errors.
pub struct CacheStream {
    reader: Reader,
}

enum Reader {
    Loader(BoxReader),
    Disk(VerifiedFile),
    Tee(Box<Tee>),
}

impl CacheStream {
    pub(crate) fn from_loader(reader: BoxReader) -> Self {
        Self {
            reader: Reader::Loader(reader),
        }
    }

    pub(crate) fn verified(
        file: fs::File,
        path: PathBuf,
        hasher: Hasher,
        expected: Digest,
        size: u64,
    ) -> Self {
        Self {
            reader: Reader::Disk(VerifiedFile {
                file,
                path,
                hasher,
                expected,
                size,
                hashed: 0,
                eof: false,
            }),
        }
    }

    pub(crate) fn tee(tee: Tee) -> Self {
        Self {
            reader: Reader::Tee(Box::new(tee)),
        }
    }

    /// Where the bytes of this stream come from.
    pub fn source(&self) -> StreamSource {
        match self.reader {
            Reader::Loader(_) => StreamSource::Loader,
            Reader::Disk(_) => StreamSource::Disk,
            Reader::Tee(_) => StreamSource::Tee,
        }
    }

    /// Closes the stream.
    ///
    /// For a cache hit that was read completely, this verifies the content and fails with
    /// [`CacheError::Corrupted`] if it does not match. For a cache miss that was read completely,
    /// this checks the size declared by the loader and publishes the content into the cache.
    ///
    /// A stream counts as read completely once it reached its end, or once as many bytes as the
    /// entry's size were read. Streams closed before that are discarded without any checks.
    pub async fn close(self) -> Result<(), CacheError> {
        match self.reader {
            Reader::Loader(_) => Ok(()),
            Reader::Disk(file) => file.close().await,
            Reader::Tee(tee) => (*tee).close().await,
        }
    }
}

impl fmt::Debug for CacheStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStream")
            .field("source", &self.source())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for CacheStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().reader {
            Reader::Loader(reader) => Pin::new(reader).poll_read(cx, buf),
            Reader::Disk(file) => Pin::new(file).poll_read(cx, buf),
            Reader::Tee(tee) => Pin::new(&mut **tee).poll_read(cx, buf),
        }
    }
}

/// Reads a cached file while recomputing its digest.
struct VerifiedFile {
    file: fs::File,
    path: PathBuf,
    hasher: Hasher,
    expected: Digest,
    /// The size of the indexed entry.
    size: u64,
    hashed: u64,
    eof: bool,
}

impl VerifiedFile {
    async fn close(self) -> Result<(), CacheError> {
        let Self {
            file,
            path,
            hasher,
            expected,
            size,
            hashed,
            eof,
        } = self;
        drop(file);

        if !eof && hashed < size {
            tracing::trace!(
                path = %path.display(),
                "Cached file closed early, skipping verification"
            );
            return Ok(());
        }
        if hasher.verify(&expected) {
            return Ok(());
        }

        tracing::warn!(path = %path.display(), "Corrupted cache file, removing it");
        if let Err(err) = catch_not_found(fs::remove_file(&path).await) {
            let dynerr: &dyn std::error::Error = &err;
            tracing::error!(error = dynerr, "Failed to remove corrupted cache file");
        }
        Err(CacheError::Corrupted)
    }
}

impl AsyncRead for VerifiedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let wants_bytes = buf.remaining() > 0;
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.file).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        if read.is_empty() {
            this.eof |= wants_bytes;
        } else {
            this.hasher.update(read);
            this.hashed += read.len() as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// The side of a [`Tee`] that persists the content.
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Forwards a loader stream to the caller while writing it to a temporary file.
///
/// Errors writing the temporary file never fail a read, they are reported on close instead.
/// Dropping the tee without closing it deletes the temporary file and releases the waiters of
/// the load.
pub(crate) struct Tee {
    source: BoxReader,
    file: BoxWriter,
    temp: TempPath,
    /// Bytes handed to the caller but not yet accepted by `file`.
    pending: Vec<u8>,
    write_error: Option<io::Error>,
    hasher: Hasher,
    declared: u64,
    observed: u64,
    eof: bool,
    guard: FlightGuard,
    content: ContentStore,
}

impl Tee {
    pub fn new<W>(
        source: BoxReader,
        (file, temp): (W, TempPath),
        hasher: Hasher,
        declared: u64,
        guard: FlightGuard,
        content: ContentStore,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            source,
            file: Box::new(file),
            temp,
            pending: Vec::new(),
            write_error: None,
            hasher,
            declared,
            observed: 0,
            eof: false,
            guard,
            content,
        }
    }

    /// Hands pending bytes to the temporary file until it has taken all of them.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while !self.pending.is_empty() && self.write_error.is_none() {
            match ready!(Pin::new(&mut self.file).poll_write(cx, &self.pending)) {
                Ok(0) => self.write_error = Some(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    self.pending.drain(..written);
                }
                Err(err) => self.write_error = Some(err),
            }
        }
        if self.write_error.is_some() {
            self.pending = Vec::new();
        }
        Poll::Ready(())
    }

    async fn close(self) -> Result<(), CacheError> {
        let Self {
            source,
            mut file,
            temp,
            pending,
            write_error,
            hasher,
            declared,
            observed,
            eof,
            guard,
            content,
        } = self;
        drop(source);

        if !eof && observed < declared {
            tracing::trace!(key = guard.key(), "Loader stream closed early, not caching it");
            return Ok(());
        }

        let written = match write_error {
            Some(err) => Err(err),
            None => async {
                file.write_all(&pending).await?;
                file.flush().await
            }
            .await,
        };
        drop(file);
        written?;

        if observed != declared {
            tracing::debug!(
                key = guard.key(),
                declared,
                observed,
                "Loader stream does not match its declared size"
            );
            return Err(CacheError::SizeMismatch {
                expected: declared,
                actual: observed,
            });
        }

        let entry = CacheEntry {
            digest: hasher.finalize(),
            size: observed,
        };
        match content.publish(temp, &entry.digest).await {
            Ok(outcome) => {
                if outcome == Publish::AlreadyPresent {
                    tracing::trace!(key = guard.key(), "Content already present in the store");
                }
                let key = guard.key().to_owned();
                if guard.publish(entry) {
                    tracing::debug!(key = %key, size = observed, "Cached loaded content");
                }
                Ok(())
            }
            // a purge deleted the base directory in the meantime
            Err(_) if !guard.is_cache_open() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl AsyncRead for Tee {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx));

        let wants_bytes = buf.remaining() > 0;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.source).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        if read.is_empty() {
            this.eof |= wants_bytes;
        } else {
            this.hasher.update(read);
            this.observed += read.len() as u64;
            if this.write_error.is_none() {
                this.pending.extend_from_slice(read);
            }
        }
        Poll::Ready(Ok(()))
    }
}
