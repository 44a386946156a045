use std::io;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use tokio::fs;

use crate::digest::Digest;
use crate::error::catch_not_found;

/// The prefix of temporary files in the base directory.
///
/// Shard directories are always two hex characters, so this can never collide with them.
const TMP_PREFIX: &str = ".tmp";

/// The outcome of [`ContentStore::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Publish {
    /// The temporary file was moved into place.
    Stored,
    /// The content was already stored, or is being stored concurrently.
    AlreadyPresent,
}

/// Content addressed file storage.
///
/// Every distinct digest maps to exactly one file: `{base}/{hex[..2]}/{hex[2..]}`. The two
/// character shard directories bound the number of entries per directory.
#[derive(Debug, Clone)]
pub(crate) struct ContentStore {
    base: PathBuf,
}

impl ContentStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The canonical path of the content with the given digest.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.base.join(&hex[..2]).join(&hex[2..])
    }

    /// Creates a new temporary file in the base directory.
    ///
    /// Keeping temporary files on the same filesystem as the canonical paths is what makes
    /// [`publish`](Self::publish) an atomic rename instead of a copy.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&self.base)
    }

    /// Removes temporary files left behind by a previous process.
    ///
    /// Returns the number of removed files.
    pub fn clear_tmp(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            let is_tmp = entry.file_name().to_string_lossy().starts_with(TMP_PREFIX);
            if is_tmp && entry.file_type()?.is_file() {
                catch_not_found(std::fs::remove_file(entry.path()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Moves the temporary file at `temp` to the canonical path of `digest`.
    ///
    /// The canonical path is claimed with an exclusive create first. Identical content loaded
    /// for different keys ends up with the same digest, and only one of the publishers may
    /// move its file into place. The loser's temporary file is deleted when `temp` is dropped.
    ///
    /// Shard directories are created non-recursively, so this never resurrects a base
    /// directory that was purged in the meantime.
    pub async fn publish(&self, temp: TempPath, digest: &Digest) -> io::Result<Publish> {
        let path = self.path_for(digest);
        let shard = self.base.join(&digest.to_hex()[..2]);

        match fs::create_dir(&shard).await {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e),
            _ => {}
        }

        let claim = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match claim {
            Ok(file) => drop(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::trace!("Content `{}` already present", digest);
                return Ok(Publish::AlreadyPresent);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = fs::rename(&temp, &path).await {
            // release the claim, otherwise the empty file would shadow the content forever
            catch_not_found(fs::remove_file(&path).await)?;
            return Err(e);
        }
        // the file was moved, there is nothing left to clean up
        let _ = temp.keep();

        Ok(Publish::Stored)
    }

    /// Opens the content with the given digest.
    ///
    /// A missing file is `Ok(None)`, which callers treat as a cache miss.
    pub async fn open(&self, digest: &Digest) -> io::Result<Option<fs::File>> {
        catch_not_found(fs::File::open(self.path_for(digest)).await)
    }

    /// Deletes the content with the given digest. Already absent content is not an error.
    pub async fn delete(&self, digest: &Digest) -> io::Result<()> {
        catch_not_found(fs::remove_file(self.path_for(digest)).await)?;
        Ok(())
    }
}
