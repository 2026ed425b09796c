//! Path-based read-only filesystem service over a compressed image.
/// Directory cache mapping inode ids to ordered child names.
pub mod dcache;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`GzFs`] calls.
pub mod fuser;
/// Generation-checked table of open file handles.
pub mod handles;
/// Inode attribute cache.
pub mod icache;
/// Path resolution cache.
pub mod pcache;

pub use handles::{Handle, HandleViolation};

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::meta::{FileContext, InodeAttr, InodeId, MetaError, MetadataFs};
use crate::store::{BlockStore, StoreError, StoreOptions, StoreStats};
use dcache::DirCache;
use handles::HandleTable;
use icache::InodeCache;
use pcache::PathCache;

/// Errors surfaced by the service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The path did not resolve, or was not absolute.
    #[error("no such file or directory")]
    NotFound,

    /// An operation addressed a handle that is not registered.
    #[error(transparent)]
    HandleViolation(#[from] HandleViolation),

    /// The operation is meaningless on a read-only filesystem.
    #[error("operation not supported")]
    Unsupported,

    /// The metadata backend failed.
    #[error(transparent)]
    Meta(MetaError),

    /// The block store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<MetaError> for ServiceError {
    fn from(err: MetaError) -> Self {
        // Backend not-found conditions collapse into the service's own
        // variant so callers see a single taxonomy.
        match err {
            MetaError::NotFound => Self::NotFound,
            other => Self::Meta(other),
        }
    }
}

/// Mount-time configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Block store tuning.
    pub store: StoreOptions,
    /// Byte offset of the filesystem within the image, for images embedded
    /// after a header.
    pub offset: Option<u64>,
}

/// A mounted image: the one long-lived object shared across host threads.
///
/// Owns the block store, the metadata backend opened over it, the three
/// metadata caches, and the open-handle table. Created by
/// [`mount`](Self::mount), used concurrently through `&self`, torn down by
/// [`unmount`](Self::unmount) once the host stops issuing operations.
pub struct GzFs<M: MetadataFs> {
    store: Arc<BlockStore>,
    meta: M,
    paths: PathCache,
    inodes: InodeCache,
    dirs: DirCache,
    handles: HandleTable<M::File>,
}

impl<M: MetadataFs> GzFs<M> {
    /// Open the image and bring the filesystem up.
    ///
    /// The block store comes up first; `open_meta` then builds the
    /// metadata backend on top of it, typically scanning the image once.
    /// Any failure is fatal: there is no partial mount.
    pub fn mount<F>(image: &Path, options: MountOptions, open_meta: F) -> Result<Self, ServiceError>
    where
        F: FnOnce(Arc<BlockStore>) -> Result<M, MetaError>,
    {
        if image.as_os_str().is_empty() {
            return Err(ServiceError::Store(StoreError::Open {
                path: image.to_owned(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty image path"),
            }));
        }
        let store = BlockStore::open(image, options.store)?;
        if let Some(offset) = options.offset {
            store.set_option("offset", &offset.to_string())?;
        }
        let store = Arc::new(store);
        let meta = open_meta(Arc::clone(&store))?;
        info!(image = %image.display(), "mounted");
        Ok(Self {
            store,
            meta,
            paths: PathCache::new(),
            inodes: InodeCache::new(),
            dirs: DirCache::new(),
            handles: HandleTable::new(),
        })
    }

    /// Look up the attributes of the object at `path`.
    pub fn getattr(&self, path: &Path) -> Result<InodeAttr, ServiceError> {
        let ino = self.resolve(path)?;
        Ok(self.inodes.get(&self.meta, ino)?)
    }

    /// Read the target of the symlink at `path`, truncated to `capacity`
    /// bytes.
    ///
    /// Short targets live inline in the inode; longer ones are stored as
    /// ordinary file content and read through a throwaway file context.
    pub fn readlink(&self, path: &Path, capacity: usize) -> Result<Vec<u8>, ServiceError> {
        let ino = self.resolve(path)?;
        let attr = self.inodes.get(&self.meta, ino)?;

        let mut target = match attr.inline_data {
            Some(inline) => inline.into_vec(),
            None => {
                let mut file = self.meta.open_file(ino)?;
                let want = usize::try_from(attr.size)
                    .unwrap_or(usize::MAX)
                    .min(capacity);
                let mut buf = vec![0_u8; want];
                let got = read_full(&mut file, &mut buf)?;
                buf.truncate(got);
                if let Err(err) = file.close() {
                    debug!(%err, ino, "closing readlink context failed");
                }
                buf
            }
        };
        target.truncate(capacity);
        Ok(target)
    }

    /// Open the file at `path`, returning the handle for later reads.
    pub fn open(&self, path: &Path) -> Result<Handle, ServiceError> {
        let ino = self.resolve(path)?;
        let file = self.meta.open_file(ino)?;
        Ok(self.handles.register(file))
    }

    /// Read from an open handle at the given byte offset.
    ///
    /// The seek and the read run under the handle's lock as one unit, so
    /// interleaved reads on a shared handle each see their own offset.
    /// The returned count is short only at end of file.
    pub fn read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> Result<usize, ServiceError> {
        let got = self.handles.with_handle(handle, "read", |file| {
            file.seek(offset)?;
            read_full(file, buf)
        })??;
        Ok(got)
    }

    /// Release an open handle, closing its file context.
    pub fn release(&self, handle: Handle) -> Result<(), ServiceError> {
        let file = self.handles.unregister(handle, "release")?;
        file.close()?;
        Ok(())
    }

    /// Nothing is ever dirty here; always succeeds.
    pub fn flush(&self, _handle: Handle) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Enumerate the children of the directory at `path` in backend order.
    ///
    /// `visit` runs once per name and returns whether to keep going, so a
    /// host filling a fixed-size reply buffer can stop early.
    pub fn readdir(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(&OsStr) -> bool,
    ) -> Result<(), ServiceError> {
        let ino = self.resolve(path)?;
        let names = self.dirs.list(&self.meta, ino)?;
        for name in names.iter() {
            if !visit(name) {
                break;
            }
        }
        Ok(())
    }

    /// Filesystem-level statistics are not provided.
    pub fn statfs(&self) -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported)
    }

    /// Block store counters for this mount.
    #[must_use]
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Tear the mount down: close the metadata backend and drop the rest.
    pub fn unmount(self) -> Result<(), ServiceError> {
        debug!(stats = ?self.store.stats(), "unmounting");
        self.meta.close()?;
        Ok(())
    }

    /// Resolve an absolute `path` to an inode id. Anything else is
    /// [`ServiceError::NotFound`].
    fn resolve(&self, path: &Path) -> Result<InodeId, ServiceError> {
        let rel = strip_root(path).ok_or(ServiceError::NotFound)?;
        Ok(self.paths.resolve(&self.meta, rel)?)
    }
}

/// Strip the leading root component, leaving the walkable remainder.
/// `None` for non-absolute paths, which the service does not accept.
fn strip_root(path: &Path) -> Option<&OsStr> {
    if !path.is_absolute() {
        return None;
    }
    path.strip_prefix("/").ok().map(Path::as_os_str)
}

/// Read until `buf` is full or the context reports end of file.
fn read_full<F: FileContext>(file: &mut F, buf: &mut [u8]) -> Result<usize, MetaError> {
    let mut filled = 0;
    while filled < buf.len() {
        let got = file.read(&mut buf[filled..])?;
        if got == 0 {
            break;
        }
        filled += got;
    }
    Ok(filled)
}
