//! Tar-archive metadata backend.
//!
//! Scans the archive once at mount through the block store, building an
//! in-memory inode table. File data is never copied during the scan; each
//! file node remembers the byte extent of its content within the image,
//! and reads go back through the block store on demand.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Component;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::meta::{FileContext, InodeAttr, InodeId, InodeKind, MetaError, MetadataFs};
use crate::store::BlockDevice;

/// Permission bits carried over from tar headers.
const MODE_MASK: u32 = 0o7777;

struct Node {
    kind: InodeKind,
    mode: u16,
    uid: u32,
    gid: u32,
    mtime: SystemTime,
    size: u64,
    /// Byte offset of file content within the image. Zero for non-files.
    data_start: u64,
    /// Symlink target bytes.
    link: Option<Box<[u8]>>,
    /// Child name → inode id, sorted. Empty for non-directories.
    children: BTreeMap<OsString, InodeId>,
    nlink: u32,
}

impl Node {
    fn directory(mode: u16, uid: u32, gid: u32, mtime: SystemTime) -> Self {
        Self {
            kind: InodeKind::Directory,
            mode,
            uid,
            gid,
            mtime,
            size: 0,
            data_start: 0,
            link: None,
            children: BTreeMap::new(),
            nlink: 0,
        }
    }
}

/// Inode-style view of a tar archive stored in the block device.
///
/// Inode ids are assigned in discovery order starting from the root at 1.
/// Directories missing their own archive entry are synthesized from the
/// paths that imply them; a later entry for an already-seen path replaces
/// the earlier one, matching extraction semantics.
pub struct TarIndex {
    device: Arc<dyn BlockDevice>,
    nodes: Vec<Node>,
}

impl TarIndex {
    /// Scan the archive and build the index.
    ///
    /// Entry kinds other than files, directories, symlinks and hard links
    /// are skipped. A hard link becomes a second directory entry for its
    /// target's inode; targets must precede their links, as written by
    /// every mainstream tar.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self, MetaError> {
        let mut nodes = vec![Node::directory(
            0o755,
            0,
            0,
            SystemTime::UNIX_EPOCH,
        )];

        let reader = DeviceReader {
            device: Arc::clone(&device),
            pos: 0,
        };
        let mut archive = Archive::new(reader);
        for entry in archive.entries().map_err(MetaError::Read)? {
            let entry = entry.map_err(MetaError::Read)?;
            let kind = entry.header().entry_type();
            match kind {
                EntryType::Regular
                | EntryType::Continuous
                | EntryType::Directory
                | EntryType::Symlink
                | EntryType::Link => {}
                other => {
                    debug!(kind = ?other, "skipping archive entry");
                    continue;
                }
            }

            let path = entry.path().map_err(MetaError::Read)?;
            let Some(components) = normalize(&path) else {
                warn!(path = %path.display(), "skipping entry with unusable path");
                continue;
            };

            let header = entry.header();
            let mode = (header.mode().map_err(MetaError::Read)? & MODE_MASK) as u16;
            let uid = clamp_id(header.uid().map_err(MetaError::Read)?);
            let gid = clamp_id(header.gid().map_err(MetaError::Read)?);
            let mtime = SystemTime::UNIX_EPOCH
                + Duration::from_secs(header.mtime().map_err(MetaError::Read)?);

            if components.is_empty() {
                // The archive carries an entry for the root itself.
                if kind == EntryType::Directory {
                    let root = &mut nodes[0];
                    root.mode = mode;
                    root.uid = uid;
                    root.gid = gid;
                    root.mtime = mtime;
                }
                continue;
            }

            let (dirs, name) = components.split_at(components.len() - 1);
            let Some(parent) = ensure_dirs(&mut nodes, dirs) else {
                warn!(path = %path.display(), "path crosses a non-directory, skipping");
                continue;
            };
            let name = name[0].clone();

            match kind {
                EntryType::Directory => {
                    let ino = child_or_new(&mut nodes, parent, name, || {
                        Node::directory(mode, uid, gid, mtime)
                    });
                    let node = node_mut(&mut nodes, ino);
                    node.kind = InodeKind::Directory;
                    node.mode = mode;
                    node.uid = uid;
                    node.gid = gid;
                    node.mtime = mtime;
                    node.size = 0;
                    node.data_start = 0;
                    node.link = None;
                }
                EntryType::Regular | EntryType::Continuous => {
                    let size = entry.size();
                    let data_start = entry.raw_file_position();
                    let ino = child_or_new(&mut nodes, parent, name, || Node {
                        kind: InodeKind::File,
                        mode,
                        uid,
                        gid,
                        mtime,
                        size,
                        data_start,
                        link: None,
                        children: BTreeMap::new(),
                        nlink: 0,
                    });
                    let node = node_mut(&mut nodes, ino);
                    node.kind = InodeKind::File;
                    node.mode = mode;
                    node.uid = uid;
                    node.gid = gid;
                    node.mtime = mtime;
                    node.size = size;
                    node.data_start = data_start;
                    node.link = None;
                    node.children.clear();
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(MetaError::Read)?
                        .map(|t| Box::<[u8]>::from(t.as_os_str().as_bytes()))
                        .unwrap_or_default();
                    let size = target.len() as u64;
                    let ino = child_or_new(&mut nodes, parent, name, || Node {
                        kind: InodeKind::Symlink,
                        mode,
                        uid,
                        gid,
                        mtime,
                        size,
                        data_start: 0,
                        link: None,
                        children: BTreeMap::new(),
                        nlink: 0,
                    });
                    let node = node_mut(&mut nodes, ino);
                    node.kind = InodeKind::Symlink;
                    node.mode = mode;
                    node.uid = uid;
                    node.gid = gid;
                    node.mtime = mtime;
                    node.size = size;
                    node.data_start = 0;
                    node.link = Some(target);
                    node.children.clear();
                }
                EntryType::Link => {
                    let Some(target) = entry.link_name().map_err(MetaError::Read)? else {
                        warn!(path = %path.display(), "hard link without a target, skipping");
                        continue;
                    };
                    let Some(target_ino) = normalize(&target)
                        .and_then(|comps| walk(&nodes, &comps))
                    else {
                        warn!(
                            path = %path.display(),
                            target = %target.display(),
                            "hard link target not seen yet, skipping"
                        );
                        continue;
                    };
                    node_mut(&mut nodes, parent).children.insert(name, target_ino);
                }
                _ => {}
            }
        }

        finish_link_counts(&mut nodes);
        debug!(inodes = nodes.len(), "archive scan complete");
        Ok(Self { device, nodes })
    }

    fn node(&self, ino: InodeId) -> Result<&Node, MetaError> {
        let index = usize::try_from(ino)
            .ok()
            .and_then(|ino| ino.checked_sub(1))
            .ok_or(MetaError::NotFound)?;
        self.nodes.get(index).ok_or(MetaError::NotFound)
    }
}

impl MetadataFs for TarIndex {
    type File = TarFile;

    const ROOT: InodeId = 1;

    fn lookup(&self, parent: InodeId, name: &OsStr) -> Result<InodeId, MetaError> {
        let node = self.node(parent)?;
        if node.kind != InodeKind::Directory {
            return Err(MetaError::NotFound);
        }
        node.children.get(name).copied().ok_or(MetaError::NotFound)
    }

    fn read_inode(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        let node = self.node(ino)?;
        let blocks = match node.kind {
            InodeKind::File => node.size.div_ceil(512),
            InodeKind::Directory | InodeKind::Symlink => 0,
        };
        Ok(InodeAttr {
            ino,
            kind: node.kind,
            mode: node.mode,
            nlink: node.nlink,
            uid: node.uid,
            gid: node.gid,
            size: node.size,
            blocks,
            atime: node.mtime,
            mtime: node.mtime,
            ctime: node.mtime,
            inline_data: node.link.clone(),
        })
    }

    fn read_dir(&self, ino: InodeId, visit: &mut dyn FnMut(&OsStr)) -> Result<(), MetaError> {
        let node = self.node(ino)?;
        if node.kind != InodeKind::Directory {
            return Err(MetaError::NotFound);
        }
        for name in node.children.keys() {
            visit(name);
        }
        Ok(())
    }

    fn open_file(&self, ino: InodeId) -> Result<Self::File, MetaError> {
        let node = self.node(ino)?;
        if node.kind != InodeKind::File {
            return Err(MetaError::Read(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        Ok(TarFile {
            device: Arc::clone(&self.device),
            start: node.data_start,
            len: node.size,
            pos: 0,
        })
    }
}

/// One open file within the archive.
pub struct TarFile {
    device: Arc<dyn BlockDevice>,
    start: u64,
    len: u64,
    pos: u64,
}

impl FileContext for TarFile {
    fn seek(&mut self, offset: u64) -> Result<(), MetaError> {
        // Positions past the end are legal; reads there return nothing.
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MetaError> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let take = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());
        // The extent lies inside the decompressed image, so a shortfall
        // here means the image is truncated and the error says so.
        self.device.read_exact_at(self.start + self.pos, &mut buf[..take])?;
        self.pos += take as u64;
        Ok(take)
    }

    fn close(self) -> Result<(), MetaError> {
        Ok(())
    }
}

/// Sequential reader the archive scanner pulls the image through.
struct DeviceReader {
    device: Arc<dyn BlockDevice>,
    pos: u64,
}

impl io::Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let got = self.device.read_at(self.pos, buf).map_err(io::Error::other)?;
        self.pos += got as u64;
        Ok(got)
    }
}

/// Reduce an archive path to its plain name components.
///
/// Leading roots and `.` vanish; a path containing `..` is rejected.
/// The empty result names the root itself.
fn normalize(path: &std::path::Path) -> Option<Vec<OsString>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => components.push(name.to_os_string()),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(components)
}

/// Walk `dirs` from the root, creating implicit directories as needed.
/// `None` when an existing non-directory blocks the way.
fn ensure_dirs(nodes: &mut Vec<Node>, dirs: &[OsString]) -> Option<InodeId> {
    let mut current = TarIndex::ROOT;
    for name in dirs {
        let next = child_or_new(nodes, current, name.clone(), || {
            Node::directory(0o755, 0, 0, SystemTime::UNIX_EPOCH)
        });
        if node_mut(nodes, next).kind != InodeKind::Directory {
            return None;
        }
        current = next;
    }
    Some(current)
}

/// Resolve `components` against the tree built so far.
fn walk(nodes: &[Node], components: &[OsString]) -> Option<InodeId> {
    let mut current = TarIndex::ROOT;
    for name in components {
        let node = &nodes[(current - 1) as usize];
        current = *node.children.get(name)?;
    }
    Some(current)
}

/// Return the child inode under `parent` named `name`, appending a fresh
/// node built by `make` when absent.
fn child_or_new(
    nodes: &mut Vec<Node>,
    parent: InodeId,
    name: OsString,
    make: impl FnOnce() -> Node,
) -> InodeId {
    if let Some(&ino) = node_mut(nodes, parent).children.get(&name) {
        return ino;
    }
    nodes.push(make());
    let ino = nodes.len() as InodeId;
    node_mut(nodes, parent).children.insert(name, ino);
    ino
}

fn node_mut(nodes: &mut [Node], ino: InodeId) -> &mut Node {
    &mut nodes[(ino - 1) as usize]
}

/// Tar carries owner ids as u64; an id beyond the attribute's u32 range
/// pins to the maximum instead of wrapping into some other user's id.
fn clamp_id(id: u64) -> u32 {
    u32::try_from(id).unwrap_or(u32::MAX)
}

/// Fill in link counts: a file counts its directory entries, a directory
/// counts its dot entry, its parent's entry and one per child directory.
fn finish_link_counts(nodes: &mut [Node]) {
    let mut counts = vec![0_u32; nodes.len()];
    let mut child_dirs = vec![0_u32; nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for &child in node.children.values() {
            let child_index = (child - 1) as usize;
            counts[child_index] += 1;
            if nodes[child_index].kind == InodeKind::Directory {
                child_dirs[index] += 1;
            }
        }
    }
    for (index, node) in nodes.iter_mut().enumerate() {
        node.nlink = match node.kind {
            InodeKind::Directory => 2 + child_dirs[index],
            InodeKind::File | InodeKind::Symlink => counts[index].max(1),
        };
    }
}
