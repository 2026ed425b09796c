#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use flate2::Compression;
use flate2::write::GzEncoder;

use gz_fs::fs::{GzFs, MountOptions};
use gz_fs::meta::{FileContext, InodeAttr, InodeId, InodeKind, MetaError, MetadataFs};
use gz_fs::store::{BlockDevice, StoreError};

/// Per-operation call counters shared between a mock and its test.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub lookups: AtomicUsize,
    pub inode_reads: AtomicUsize,
    pub dir_reads: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

/// One object in the scripted filesystem tree.
pub struct MockNode {
    pub kind: InodeKind,
    /// Children in insertion order, directories only.
    pub children: Vec<(OsString, InodeId)>,
    pub content: Vec<u8>,
    /// Inline symlink target; `None` makes a symlink resolve through its
    /// content instead.
    pub link: Option<Vec<u8>>,
}

/// A scripted metadata backend that counts every backend call, so tests
/// can verify what the caching layers actually hit.
pub struct MockMeta {
    pub nodes: HashMap<InodeId, MockNode>,
    pub counters: Arc<MockCounters>,
    next: InodeId,
}

impl MockMeta {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            1,
            MockNode {
                kind: InodeKind::Directory,
                children: Vec::new(),
                content: Vec::new(),
                link: None,
            },
        );
        Self {
            nodes,
            counters: Arc::new(MockCounters::default()),
            next: 2,
        }
    }

    fn add(&mut self, parent: InodeId, name: &str, node: MockNode) -> InodeId {
        let ino = self.next;
        self.next += 1;
        self.nodes.insert(ino, node);
        self.nodes
            .get_mut(&parent)
            .unwrap()
            .children
            .push((OsString::from(name), ino));
        ino
    }

    pub fn add_dir(&mut self, parent: InodeId, name: &str) -> InodeId {
        self.add(
            parent,
            name,
            MockNode {
                kind: InodeKind::Directory,
                children: Vec::new(),
                content: Vec::new(),
                link: None,
            },
        )
    }

    pub fn add_file(&mut self, parent: InodeId, name: &str, content: &[u8]) -> InodeId {
        self.add(
            parent,
            name,
            MockNode {
                kind: InodeKind::File,
                children: Vec::new(),
                content: content.to_vec(),
                link: None,
            },
        )
    }

    /// A symlink whose target sits inline in the inode.
    pub fn add_symlink(&mut self, parent: InodeId, name: &str, target: &[u8]) -> InodeId {
        self.add(
            parent,
            name,
            MockNode {
                kind: InodeKind::Symlink,
                children: Vec::new(),
                content: Vec::new(),
                link: Some(target.to_vec()),
            },
        )
    }

    /// A symlink whose target is stored as file content, the way backends
    /// hold targets too long for the inode.
    pub fn add_content_symlink(&mut self, parent: InodeId, name: &str, target: &[u8]) -> InodeId {
        self.add(
            parent,
            name,
            MockNode {
                kind: InodeKind::Symlink,
                children: Vec::new(),
                content: target.to_vec(),
                link: None,
            },
        )
    }

    fn node(&self, ino: InodeId) -> Result<&MockNode, MetaError> {
        self.nodes.get(&ino).ok_or(MetaError::NotFound)
    }
}

impl MetadataFs for MockMeta {
    type File = MockFile;

    const ROOT: InodeId = 1;

    fn lookup(&self, parent: InodeId, name: &OsStr) -> Result<InodeId, MetaError> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let node = self.node(parent)?;
        node.children
            .iter()
            .find(|(child, _)| child.as_os_str() == name)
            .map(|&(_, ino)| ino)
            .ok_or(MetaError::NotFound)
    }

    fn read_inode(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        self.counters.inode_reads.fetch_add(1, Ordering::Relaxed);
        let node = self.node(ino)?;
        let (mode, size) = match node.kind {
            InodeKind::Directory => (0o755, 0),
            InodeKind::File => (0o644, node.content.len() as u64),
            InodeKind::Symlink => (
                0o777,
                node.link
                    .as_ref()
                    .map_or(node.content.len(), Vec::len) as u64,
            ),
        };
        Ok(InodeAttr {
            ino,
            kind: node.kind,
            mode,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size,
            blocks: size.div_ceil(512),
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            inline_data: node.link.as_ref().map(|l| l.clone().into_boxed_slice()),
        })
    }

    fn read_dir(&self, ino: InodeId, visit: &mut dyn FnMut(&OsStr)) -> Result<(), MetaError> {
        self.counters.dir_reads.fetch_add(1, Ordering::Relaxed);
        let node = self.node(ino)?;
        if node.kind != InodeKind::Directory {
            return Err(MetaError::NotFound);
        }
        for (name, _) in &node.children {
            visit(name);
        }
        Ok(())
    }

    fn open_file(&self, ino: InodeId) -> Result<MockFile, MetaError> {
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
        let node = self.node(ino)?;
        Ok(MockFile {
            data: node.content.clone(),
            pos: 0,
            counters: Arc::clone(&self.counters),
        })
    }
}

/// File context over a mock node's scripted content.
pub struct MockFile {
    pub data: Vec<u8>,
    pub pos: u64,
    counters: Arc<MockCounters>,
}

impl FileContext for MockFile {
    fn seek(&mut self, offset: u64) -> Result<(), MetaError> {
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MetaError> {
        let start = usize::try_from(self.pos).unwrap().min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn close(self) -> Result<(), MetaError> {
        self.counters.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// An in-memory block device for driving backends without a real image.
pub struct SliceDevice(pub Vec<u8>);

impl BlockDevice for SliceDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.0.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }
}

/// Gzip-compress `data` the way images on disk are compressed.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Write `bytes` out as a temporary image file.
pub fn temp_image(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Deterministic pseudo-random bytes: incompressible enough to exercise
/// multi-block images, reproducible for content assertions.
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 56) as u8
        })
        .collect()
}

/// Mount a [`GzFs`] over a scripted backend. The throwaway image file is
/// only there to satisfy the store; the mock never reads it.
pub fn mount_mock(meta: MockMeta) -> (GzFs<MockMeta>, Arc<MockCounters>) {
    let counters = Arc::clone(&meta.counters);
    let image = temp_image(b"backed by nothing");
    let fs = GzFs::mount(image.path(), MountOptions::default(), move |_| Ok(meta)).unwrap();
    (fs, counters)
}
