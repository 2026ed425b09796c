#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{SliceDevice, gzip, pattern, temp_image};
use gz_fs::fs::{GzFs, MountOptions};
use gz_fs::meta::tar::TarIndex;
use gz_fs::meta::{FileContext, InodeKind, MetaError, MetadataFs};
use gz_fs::store::StoreOptions;

fn file_header(mode: u32, mtime: u64, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_size(size);
    header
}

/// A small archive exercising every entry kind the backend understands:
/// an explicit directory, files, an implicit directory, a symlink and a
/// hard link.
fn sample_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_ustar();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o750);
    dir.set_uid(1000);
    dir.set_gid(100);
    dir.set_mtime(1_700_000_000);
    dir.set_size(0);
    builder.append_data(&mut dir, "etc", std::io::empty()).unwrap();

    let hosts = b"127.0.0.1 localhost\n";
    let mut header = file_header(0o644, 1_700_000_001, hosts.len() as u64);
    builder.append_data(&mut header, "etc/hosts", &hosts[..]).unwrap();

    // No entry for "deep" itself; only its child implies it.
    let payload = pattern(3000);
    let mut header = file_header(0o600, 1_700_000_002, payload.len() as u64);
    builder
        .append_data(&mut header, "deep/blob.bin", &payload[..])
        .unwrap();

    let mut link = tar::Header::new_ustar();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_mode(0o777);
    link.set_uid(0);
    link.set_gid(0);
    link.set_mtime(1_700_000_003);
    link.set_size(0);
    builder
        .append_link(&mut link, "hosts-link", "etc/hosts")
        .unwrap();

    let mut hard = tar::Header::new_ustar();
    hard.set_entry_type(tar::EntryType::Link);
    hard.set_mode(0o644);
    hard.set_uid(0);
    hard.set_gid(0);
    hard.set_mtime(1_700_000_004);
    hard.set_size(0);
    builder
        .append_link(&mut hard, "etc/hosts.alias", "etc/hosts")
        .unwrap();

    builder.into_inner().unwrap()
}

fn sample_index() -> TarIndex {
    TarIndex::open(Arc::new(SliceDevice(sample_tar()))).unwrap()
}

#[test]
fn scans_entries_with_their_attributes() {
    let index = sample_index();

    let etc = index.lookup(TarIndex::ROOT, OsStr::new("etc")).unwrap();
    let attr = index.read_inode(etc).unwrap();
    assert_eq!(attr.kind, InodeKind::Directory);
    assert_eq!(attr.mode, 0o750);
    assert_eq!(attr.uid, 1000);
    assert_eq!(attr.gid, 100);
    assert_eq!(
        attr.mtime,
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );

    let hosts = index.lookup(etc, OsStr::new("hosts")).unwrap();
    let attr = index.read_inode(hosts).unwrap();
    assert_eq!(attr.kind, InodeKind::File);
    assert_eq!(attr.size, 20);
    assert_eq!(attr.mode, 0o644);
    assert_eq!(attr.blocks, 1);
}

#[test]
fn implicit_directories_are_synthesized() {
    let index = sample_index();
    let deep = index.lookup(TarIndex::ROOT, OsStr::new("deep")).unwrap();
    let attr = index.read_inode(deep).unwrap();
    assert_eq!(attr.kind, InodeKind::Directory);
    assert_eq!(attr.mode, 0o755);
    assert_eq!(attr.uid, 0);

    assert!(index.lookup(deep, OsStr::new("blob.bin")).is_ok());
}

#[test]
fn file_content_reads_back_through_the_device() {
    let index = sample_index();
    let payload = pattern(3000);
    let deep = index.lookup(TarIndex::ROOT, OsStr::new("deep")).unwrap();
    let blob = index.lookup(deep, OsStr::new("blob.bin")).unwrap();

    let mut file = index.open_file(blob).unwrap();
    let mut buf = vec![0u8; 3000];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).unwrap();
        if n == 0 {
            break;
        }
        filled += n;
    }
    assert_eq!(filled, 3000);
    assert_eq!(buf, payload);

    // Positioned re-read from the middle.
    file.seek(1000).unwrap();
    let mut mid = vec![0u8; 100];
    assert_eq!(file.read(&mut mid).unwrap(), 100);
    assert_eq!(&mid[..], &payload[1000..1100]);

    // Reads are clamped to the entry, never the neighbors.
    file.seek(2990).unwrap();
    let mut tail = vec![0u8; 100];
    assert_eq!(file.read(&mut tail).unwrap(), 10);
    assert_eq!(&tail[..10], &payload[2990..]);
    assert_eq!(file.read(&mut tail).unwrap(), 0);

    file.close().unwrap();
}

#[test]
fn symlinks_carry_inline_targets() {
    let index = sample_index();
    let link = index
        .lookup(TarIndex::ROOT, OsStr::new("hosts-link"))
        .unwrap();
    let attr = index.read_inode(link).unwrap();
    assert_eq!(attr.kind, InodeKind::Symlink);
    assert_eq!(attr.size, 9);
    assert_eq!(attr.inline_data.as_deref(), Some(&b"etc/hosts"[..]));
}

#[test]
fn hard_links_share_the_inode() {
    let index = sample_index();
    let etc = index.lookup(TarIndex::ROOT, OsStr::new("etc")).unwrap();
    let hosts = index.lookup(etc, OsStr::new("hosts")).unwrap();
    let alias = index.lookup(etc, OsStr::new("hosts.alias")).unwrap();
    assert_eq!(alias, hosts, "a hard link is a second name, not a copy");
    assert_eq!(index.read_inode(hosts).unwrap().nlink, 2);
}

#[test]
fn link_counts_follow_the_tree_shape() {
    let index = sample_index();
    let root = index.read_inode(TarIndex::ROOT).unwrap();
    // Dot entry, parent entry, and one per child directory (etc, deep).
    assert_eq!(root.nlink, 4);

    let deep = index.lookup(TarIndex::ROOT, OsStr::new("deep")).unwrap();
    assert_eq!(index.read_inode(deep).unwrap().nlink, 2);
}

#[test]
fn directories_list_children_sorted() {
    let index = sample_index();
    let mut names = Vec::new();
    index
        .read_dir(TarIndex::ROOT, &mut |n| names.push(n.to_os_string()))
        .unwrap();
    assert_eq!(names, ["deep", "etc", "hosts-link"].map(OsStr::new));

    let etc = index.lookup(TarIndex::ROOT, OsStr::new("etc")).unwrap();
    names.clear();
    index
        .read_dir(etc, &mut |n| names.push(n.to_os_string()))
        .unwrap();
    assert_eq!(names, ["hosts", "hosts.alias"].map(OsStr::new));
}

#[test]
fn unknown_names_and_inodes_are_not_found() {
    let index = sample_index();
    assert!(matches!(
        index.lookup(TarIndex::ROOT, OsStr::new("nope")),
        Err(MetaError::NotFound)
    ));
    assert!(matches!(index.read_inode(999), Err(MetaError::NotFound)));
    assert!(matches!(index.read_inode(0), Err(MetaError::NotFound)));
}

#[test]
fn only_regular_files_open() {
    let index = sample_index();
    let etc = index.lookup(TarIndex::ROOT, OsStr::new("etc")).unwrap();
    assert!(matches!(index.open_file(etc), Err(MetaError::Read(_))));

    let link = index
        .lookup(TarIndex::ROOT, OsStr::new("hosts-link"))
        .unwrap();
    assert!(index.open_file(link).is_err());
}

#[test]
fn later_entries_replace_earlier_ones() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = file_header(0o644, 1, 3);
    builder.append_data(&mut header, "dup.txt", &b"one"[..]).unwrap();
    let mut header = file_header(0o600, 2, 7);
    builder
        .append_data(&mut header, "dup.txt", &b"two-two"[..])
        .unwrap();
    let archive = builder.into_inner().unwrap();

    let index = TarIndex::open(Arc::new(SliceDevice(archive))).unwrap();
    let dup = index.lookup(TarIndex::ROOT, OsStr::new("dup.txt")).unwrap();
    let attr = index.read_inode(dup).unwrap();
    assert_eq!(attr.size, 7);
    assert_eq!(attr.mode, 0o600);

    let mut file = index.open_file(dup).unwrap();
    let mut buf = vec![0u8; 7];
    assert_eq!(file.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..], b"two-two");

    // One name, one inode: the replacement reused the id.
    let mut count = 0;
    index.read_dir(TarIndex::ROOT, &mut |_| count += 1).unwrap();
    assert_eq!(count, 1);
}

#[test]
fn oversized_owner_ids_clamp_instead_of_wrapping() {
    // GNU headers store ids that overflow the octal field in base-256, so
    // a value past u32 round-trips through the archive intact.
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(u64::from(u32::MAX) + 7);
    header.set_gid(5_000_000_000);
    header.set_mtime(1);
    header.set_size(0);
    builder
        .append_data(&mut header, "owned", std::io::empty())
        .unwrap();
    let archive = builder.into_inner().unwrap();

    let index = TarIndex::open(Arc::new(SliceDevice(archive))).unwrap();
    let ino = index.lookup(TarIndex::ROOT, OsStr::new("owned")).unwrap();
    let attr = index.read_inode(ino).unwrap();
    // Truncation would alias uid 6; the clamp pins both to the ceiling.
    assert_eq!(attr.uid, u32::MAX);
    assert_eq!(attr.gid, u32::MAX);
}

#[test]
fn mounts_end_to_end_over_a_compressed_image() {
    let image = temp_image(&gzip(&sample_tar()));
    let options = MountOptions {
        store: StoreOptions {
            block_size: 512,
            cache_blocks: 8,
        },
        offset: None,
    };
    let fs = GzFs::mount(image.path(), options, |device| TarIndex::open(device)).unwrap();

    let attr = fs.getattr(Path::new("/etc/hosts")).unwrap();
    assert_eq!(attr.size, 20);

    let h = fs.open(Path::new("/etc/hosts")).unwrap();
    let mut buf = vec![0u8; 20];
    assert_eq!(fs.read(h, 0, &mut buf).unwrap(), 20);
    assert_eq!(&buf[..], b"127.0.0.1 localhost\n");
    fs.release(h).unwrap();

    assert_eq!(
        fs.readlink(Path::new("/hosts-link"), 4096).unwrap(),
        b"etc/hosts"
    );

    // The payload sits several blocks in; read it back through the cache.
    let payload = pattern(3000);
    let h = fs.open(Path::new("/deep/blob.bin")).unwrap();
    let mut blob = vec![0u8; 3000];
    assert_eq!(fs.read(h, 0, &mut blob).unwrap(), 3000);
    assert_eq!(blob, payload);
    fs.release(h).unwrap();

    let stats = fs.store_stats();
    assert!(stats.misses > 0, "the archive scan itself reads blocks");
    fs.unmount().unwrap();
}
