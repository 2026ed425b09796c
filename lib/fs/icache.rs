//! Inode cache: inode id → attribute snapshot.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::meta::{InodeAttr, InodeId, MetaError, MetadataFs};

/// Lazily caches inode attributes read from the metadata backend.
///
/// Same locking contract as [`PathCache`](super::pcache::PathCache): one
/// mutex, held across the miss fetch so each inode is read from the
/// backend at most once; a failed fetch stores nothing; entries are never
/// evicted.
pub struct InodeCache {
    entries: Mutex<HashMap<InodeId, InodeAttr>>,
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the attributes of `ino`, reading through on a miss.
    pub fn get<M: MetadataFs>(&self, meta: &M, ino: InodeId) -> Result<InodeAttr, MetaError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(attr) = entries.get(&ino) {
            return Ok(attr.clone());
        }
        let attr = meta.read_inode(ino)?;
        entries.insert(ino, attr.clone());
        Ok(attr)
    }
}
