//! Path cache: absolute path → inode id, populated by walking the backend.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::meta::{InodeId, MetaError, MetadataFs};

/// Lazily caches full-path resolutions against the metadata backend.
///
/// One coarse mutex: a lookup checks the map and, on a miss, performs the
/// whole component walk while still holding it. Concurrent misses
/// serialize, which guarantees no partially resolved entry is ever
/// observed. Entries are never evicted or invalidated — the image cannot
/// change under a live mount — so the map only grows.
///
/// Only the complete path is cached, and only on success: intermediate
/// prefixes are not stored, and a failed walk stores nothing.
pub struct PathCache {
    entries: Mutex<HashMap<OsString, InodeId>>,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PathCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `path`, given relative to the filesystem root with no
    /// leading slash, to an inode id.
    ///
    /// The empty path is the root itself and resolves to the backend's
    /// well-known root inode without touching the cache or the backend.
    pub fn resolve<M: MetadataFs>(&self, meta: &M, path: &OsStr) -> Result<InodeId, MetaError> {
        if path.is_empty() {
            return Ok(M::ROOT);
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&ino) = entries.get(path) {
            return Ok(ino);
        }

        let mut ino = M::ROOT;
        for component in Path::new(path).components() {
            let name = match component {
                Component::Normal(name) => name,
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir => OsStr::new(".."),
                Component::Prefix(_) => return Err(MetaError::NotFound),
            };
            ino = meta.lookup(ino, name)?;
        }
        entries.insert(path.to_owned(), ino);
        debug!(?path, ino, "cached path resolution");
        Ok(ino)
    }
}
