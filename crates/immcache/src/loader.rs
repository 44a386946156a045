use std::fmt;
use std::future::Future;
use std::io::Cursor;

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// A boxed byte stream, as produced by a [`Loader`].
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// The outcome of a successful [`Loader::load`].
pub struct Loaded {
    /// The number of bytes `reader` is going to produce.
    ///
    /// When the size is unknown, the stream is handed to the caller but never cached.
    pub size: Option<u64>,
    /// The content.
    pub reader: BoxReader,
}

impl Loaded {
    /// Creates a loaded value from a stream and its declared size.
    pub fn new<R>(size: Option<u64>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            size,
            reader: Box::new(reader),
        }
    }

    /// Creates a loaded value from an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self::new(Some(bytes.len() as u64), Cursor::new(bytes))
    }
}

impl fmt::Debug for Loaded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loaded")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Produces the value for a key on a cache miss.
///
/// A given key is expected to always produce the same content. The cache tolerates loaders that
/// don't, but it will keep serving whatever it stored first.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the value for `key`.
    async fn load(&self, key: &str) -> anyhow::Result<Loaded>;
}

/// A [`Loader`] backed by an async closure receiving the key.
#[derive(Clone, Copy, Debug)]
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Loaded>> + Send,
{
    async fn load(&self, key: &str) -> anyhow::Result<Loaded> {
        (self.0)(key.to_owned()).await
    }
}
