//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`GzFs`](super::GzFs) calls.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, instrument};

use super::{GzFs, ServiceError};
use crate::meta::{InodeAttr, InodeKind, MetaError, MetadataFs};
use crate::store::StoreError;

/// Pick the errno a raw I/O error should surface as.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    })
}

/// Convert a service error to the errno value for FUSE replies.
fn error_to_errno(err: &ServiceError) -> i32 {
    match err {
        ServiceError::NotFound | ServiceError::Meta(MetaError::NotFound) => libc::ENOENT,
        ServiceError::HandleViolation(_) => libc::EBADF,
        ServiceError::Unsupported => libc::ENOSYS,
        ServiceError::Meta(MetaError::Read(e)) => io_to_errno(e),
        ServiceError::Store(StoreError::UnknownOption(_) | StoreError::InvalidOption { .. }) => {
            libc::EINVAL
        }
        ServiceError::Store(StoreError::WriteUnsupported) => libc::EROFS,
        ServiceError::Meta(MetaError::Device(_)) | ServiceError::Store(_) => libc::EIO,
    }
}

/// The `.error(errno)` method every fuser reply type carries, lifted into a
/// trait so error handling can be written once.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

// ReplyEmpty, ReplyDirectory and ReplyStatfs are excluded: release, flush,
// readdir and statfs do not follow the fuse_reply pattern.
impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyOpen,
    fuser::ReplyData,
);

/// Extension on `Result<T, ServiceError>` that owns the log-and-reply-errno
/// failure path, leaving each callback body to state its success case.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, ServiceError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(error_to_errno(&e));
            }
        }
    }
}

/// Convert an [`InodeAttr`] to the fuser-specific `FileAttr`.
fn attr_to_fuser(attr: &InodeAttr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: kind_to_fuser(attr.kind),
        perm: attr.mode,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn kind_to_fuser(kind: InodeKind) -> fuser::FileType {
    match kind {
        InodeKind::File => fuser::FileType::RegularFile,
        InodeKind::Directory => fuser::FileType::Directory,
        InodeKind::Symlink => fuser::FileType::Symlink,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Capacity handed to readlink; the kernel never wants more than this.
const READLINK_CAPACITY: usize = libc::PATH_MAX as usize;

/// Bridges a [`GzFs`] to the [`fuser::Filesystem`] trait.
///
/// The service is addressed by path while FUSE speaks inode numbers, so
/// the adapter keeps the mapping: every inode the kernel has been told
/// about is remembered with the path it was first looked up under. The
/// image never changes beneath the mount, so entries stay valid for the
/// session's whole lifetime and are never dropped.
pub struct FuserAdapter<M: MetadataFs> {
    fs: GzFs<M>,
    paths: HashMap<u64, PathBuf>,
}

impl<M: MetadataFs> FuserAdapter<M> {
    /// TTL for attributes and entries handed to the kernel. The backing
    /// image is immutable, so the kernel may cache generously; this mostly
    /// spares us repeated lookup traffic.
    const ATTR_TTL: Duration = Duration::from_secs(3600);

    /// Wrap a mounted filesystem for serving over FUSE.
    pub fn new(fs: GzFs<M>) -> Self {
        let mut paths = HashMap::new();
        paths.insert(fuser::FUSE_ROOT_ID, PathBuf::from("/"));
        Self { fs, paths }
    }

    fn known_path(&self, ino: u64) -> Option<&PathBuf> {
        let path = self.paths.get(&ino);
        if path.is_none() {
            error!(ino, "inode not in the path table; this is a programming bug");
        }
        path
    }
}

impl<M: MetadataFs> fuser::Filesystem for FuserAdapter<M> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.known_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = parent_path.join(name);
        self.fs.getattr(&path).fuse_reply(reply, |attr, reply| {
            // Hard links alias several paths to one inode; the first
            // path seen keeps naming it.
            self.paths.entry(attr.ino).or_insert(path);
            let f_attr = attr_to_fuser(&attr);
            debug!(?f_attr, "replying...");
            reply.entry(&Self::ATTR_TTL, &f_attr, 0);
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.known_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.fs.getattr(path).fuse_reply(reply, |attr, reply| {
            let attr = attr_to_fuser(&attr);
            debug!(?attr, "replying...");
            reply.attr(&Self::ATTR_TTL, &attr);
        });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let Some(path) = self.known_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.fs
            .readlink(path, READLINK_CAPACITY)
            .fuse_reply(reply, |target, reply| {
                debug!(target_len = target.len(), "replying...");
                reply.data(&target);
            });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(path) = self.known_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = path.clone();

        // Dot entries first, at offsets 0 and 1; children follow from 2.
        // The inode values for the dot entries are advisory, the kernel
        // resolves both itself.
        if offset < 1 && reply.add(ino, 1, fuser::FileType::Directory, ".") {
            reply.ok();
            return;
        }
        if offset < 2 && reply.add(fuser::FUSE_ROOT_ID, 2, fuser::FileType::Directory, "..") {
            reply.ok();
            return;
        }

        let fs = &self.fs;
        let mut next: i64 = 2;
        let result = fs.readdir(&path, &mut |name| {
            let this = next;
            next += 1;
            if this < offset {
                return true;
            }
            let attr = match fs.getattr(&path.join(name)) {
                Ok(attr) => attr,
                Err(e) => {
                    debug!(?name, error = %e, "skipping unlistable entry");
                    return true;
                }
            };
            debug!(?name, ino = attr.ino, "adding entry to reply...");
            let full = reply.add(attr.ino, this + 1, kind_to_fuser(attr.kind), name);
            if full {
                debug!("buffer full for now, stopping readdir");
            }
            !full
        });

        match result {
            Ok(()) => {
                debug!("finalizing reply...");
                reply.ok();
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(error_to_errno(&e));
            }
        }
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, _flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let Some(path) = self.known_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.fs.open(path).fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let mut buf = vec![0_u8; size as usize];
        match self.fs.read(fh, offset.cast_unsigned(), &mut buf) {
            Ok(got) => {
                buf.truncate(got);
                debug!(read_bytes = got, "replying...");
                reply.data(&buf);
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(error_to_errno(&e));
            }
        }
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, fh, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(error_to_errno(&e));
            }
        }
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, fh, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => {
                debug!("replying ok");
                reply.ok();
            }
            Err(e @ ServiceError::HandleViolation(_)) => {
                debug!(error = %e, "file handle not open, replying error");
                reply.error(libc::EBADF);
            }
            Err(e) => {
                // The handle is gone from the table either way.
                debug!(error = %e, "close reported error");
                reply.ok();
            }
        }
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        match self.fs.statfs() {
            Ok(()) => reply.error(libc::ENOSYS),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(error_to_errno(&e));
            }
        }
    }
}

impl<M: MetadataFs> Drop for FuserAdapter<M> {
    fn drop(&mut self) {
        debug!(stats = ?self.fs.store_stats(), "session ended");
    }
}
