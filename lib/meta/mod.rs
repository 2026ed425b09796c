//! The metadata-library contract: what a filesystem-format backend provides.
//!
//! The core of this crate never decodes an on-disk format itself. A backend
//! implements [`MetadataFs`] over a [`BlockDevice`](crate::store::BlockDevice)
//! and the caches and service surface drive it through this interface.

/// Archive-backed metadata filesystem.
pub mod tar;

use std::ffi::OsStr;
use std::io;
use std::time::SystemTime;

use thiserror::Error;

use crate::store::StoreError;

/// Identifier of one filesystem object within a mounted image.
pub type InodeId = u64;

/// What kind of object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Attribute snapshot of one inode.
#[derive(Debug, Clone)]
pub struct InodeAttr {
    /// The inode's own id.
    pub ino: InodeId,
    /// Object kind.
    pub kind: InodeKind,
    /// Permission bits (the low 12 bits of a Unix mode).
    pub mode: u16,
    /// Hard link count.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes; for symlinks, the length of the target.
    pub size: u64,
    /// 512-byte sectors occupied.
    pub blocks: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Data stored inline in the inode itself, if any. Symlinks with an
    /// inline target resolve from these bytes instead of file content.
    pub inline_data: Option<Box<[u8]>>,
}

/// Errors from a metadata backend.
#[derive(Debug, Error)]
pub enum MetaError {
    /// No entry with the requested name, or an inode id not present in the
    /// filesystem.
    #[error("not found")]
    NotFound,

    /// Metadata could not be read or decoded.
    #[error("metadata read failed: {0}")]
    Read(#[source] io::Error),

    /// The block device failed underneath the backend.
    #[error(transparent)]
    Device(#[from] StoreError),
}

/// An open file's read context.
///
/// The service surface serializes seek+read pairs per context through the
/// handle table, so implementations need no internal locking — but contexts
/// move between host worker threads and must be `Send`.
pub trait FileContext: Send {
    /// Position the context at `offset` bytes from the start of the file.
    fn seek(&mut self, offset: u64) -> Result<(), MetaError>;

    /// Read at the current position into `buf`; the count is short only at
    /// end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MetaError>;

    /// Close the context, surfacing any final error.
    fn close(self) -> Result<(), MetaError>;
}

/// A filesystem-format backend: the black box that decodes on-disk
/// metadata, reading through the block device it was opened against.
///
/// Backends are shared across host worker threads. The caches above
/// serialize their own misses, but distinct caches may call in
/// concurrently, so every method takes `&self`.
pub trait MetadataFs: Send + Sync {
    /// Read context for one open file.
    type File: FileContext;

    /// The well-known root inode id. Resolving the root path never calls
    /// into the backend.
    const ROOT: InodeId;

    /// Resolve one directory entry: `(parent, name) → child`.
    fn lookup(&self, parent: InodeId, name: &OsStr) -> Result<InodeId, MetaError>;

    /// Read one inode's attributes.
    fn read_inode(&self, ino: InodeId) -> Result<InodeAttr, MetaError>;

    /// Enumerate a directory, calling `visit` once per child name in the
    /// backend's own order.
    fn read_dir(&self, ino: InodeId, visit: &mut dyn FnMut(&OsStr)) -> Result<(), MetaError>;

    /// Open file content by inode id.
    fn open_file(&self, ino: InodeId) -> Result<Self::File, MetaError>;

    /// Close the filesystem. The default is a no-op for backends with no
    /// close-time work.
    fn close(self) -> Result<(), MetaError>
    where
        Self: Sized,
    {
        Ok(())
    }
}
