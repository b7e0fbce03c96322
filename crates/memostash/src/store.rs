use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::serialize::Serializer;

/// Directory for in-flight temp files, a sibling of the shard tree.
///
/// Shard directories are exactly four hex digits, so this name can never
/// collide with one.
const TMP_DIR: &str = "tmp";

/// On-disk, sharded key → entry map.
///
/// The filesystem is the source of truth: no in-memory index is kept, and
/// concurrent access from any number of processes is tolerated. When
/// writing a new entry it is first written to a temporary file in a
/// sibling directory; once fully written it is atomically renamed to its
/// final location, so concurrent readers observe either nothing or a fully
/// valid entry, never a partial write.
///
/// Entries are never evicted. They persist until explicitly removed via
/// [`Store::remove`].
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Store { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the entry for `key` inside this store.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Whether a committed entry exists for `key`.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    /// Reads and deserializes the entry for `key`.
    ///
    /// Fails with [`Error::NotFound`] if no entry has been committed, and
    /// with [`Error::Corrupt`] if a committed entry cannot be
    /// deserialized. Corruption is surfaced rather than masked as a miss.
    pub fn get<T, S>(&self, key: &CacheKey, serializer: &S) -> Result<T>
    where
        T: DeserializeOwned,
        S: Serializer,
    {
        let path = self.entry_path(key);
        let bytes = catch_not_found(|| fs::read(&path))?.ok_or(Error::NotFound)?;
        serializer.deserialize(&bytes).map_err(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "committed cache entry failed to deserialize"
            );
            Error::Corrupt(format!("{}: {e}", path.display()))
        })
    }

    /// Serializes `value` and commits it as the entry for `key`.
    ///
    /// A concurrent `put` of the same key resolves last-writer-wins, which
    /// is sound for referentially transparent computations.
    pub fn put<T, S>(&self, key: &CacheKey, value: &T, serializer: &S) -> Result<()>
    where
        T: Serialize,
        S: Serializer,
    {
        let bytes = serializer.serialize(value)?;
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(&bytes)?;
        persist_tempfile(temp_file, &self.entry_path(key))?;
        tracing::trace!(key = %key, bytes = bytes.len(), "committed cache entry");
        Ok(())
    }

    /// Removes the entry for `key`, returning whether one existed.
    ///
    /// This is the only way entries leave the store.
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(catch_not_found(|| fs::remove_file(self.entry_path(key)))?.is_some())
    }

    /// Create a new temporary file to use in the store.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        tempfile::Builder::new().prefix("put").tempfile_in(tmp_dir)
    }
}

/// Moves a fully written temp file to its final entry path.
///
/// An external cleanup could remove the shard directories we are operating
/// in between creating them and persisting, so the fs operations are
/// retried a couple of times.
fn persist_tempfile(mut temp_file: NamedTempFile, entry_path: &Path) -> io::Result<()> {
    let parent = entry_path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist entry")
    })?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "failed to create shard directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(entry_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %entry_path.display(),
                    "failed to persist cache entry",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
