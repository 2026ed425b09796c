//! Directory cache: inode id → ordered child names.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use crate::meta::{InodeId, MetaError, MetadataFs};

/// Lazily caches directory listings, names only.
///
/// Child inode ids and types are deliberately not retained: no caller
/// needs them here, and a names-only entry is immutable from the moment
/// it is created. Listings are `Arc`-shared so callers iterate without
/// holding the cache lock. One mutex, held across the miss enumeration;
/// entries are never evicted.
pub struct DirCache {
    entries: Mutex<HashMap<InodeId, Arc<[OsString]>>>,
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DirCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// List the children of `ino` in backend order, reading through on a
    /// miss.
    pub fn list<M: MetadataFs>(
        &self,
        meta: &M,
        ino: InodeId,
    ) -> Result<Arc<[OsString]>, MetaError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(names) = entries.get(&ino) {
            return Ok(Arc::clone(names));
        }
        let mut names = Vec::new();
        meta.read_dir(ino, &mut |name| names.push(name.to_os_string()))?;
        let names: Arc<[OsString]> = names.into();
        entries.insert(ino, Arc::clone(&names));
        Ok(names)
    }
}
