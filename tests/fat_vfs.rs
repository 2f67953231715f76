//! End-to-end filesystem behavior: FAT volumes mounted through the
//! VFS, file handles over the page cache, and the on-disk format.

mod common;

use std::sync::Arc;

use coal_kernel::bio::Bcache;
use coal_kernel::device::DeviceId;
use coal_kernel::error::KernelError;
use coal_kernel::file::{FileTable, RcFile, SEEK_END, SEEK_SET};
use coal_kernel::fs::fat::layout::lfn_checksum;
use coal_kernel::fs::fat::{dir, layout, table::FatTable, FatDriver, Geometry};
use coal_kernel::fs::{OpenFlags, Path, Vfs, VnodeKind};

use common::MemDisk;

fn p(s: &str) -> &Path {
    Path::new(s.as_bytes())
}

struct Harness {
    vfs: Arc<Vfs>,
    bcache: Arc<Bcache>,
    ftable: FileTable,
    disk: Arc<MemDisk>,
    dev: DeviceId,
}

impl Harness {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<RcFile, KernelError> {
        self.ftable.open_path(&self.vfs, p(path), flags)
    }

    fn create(&self, path: &str) -> RcFile {
        self.open(path, OpenFlags::O_CREAT | OpenFlags::O_RDWR)
            .expect("create")
    }
}

fn mount(disk: Arc<MemDisk>, dev: DeviceId) -> Harness {
    let vfs = Vfs::new();
    let bcache = Arc::new(Bcache::new());
    vfs.register_driver(Arc::new(FatDriver::new(bcache.clone())))
        .unwrap();
    vfs.mount_root("/", "fat", dev).unwrap();
    Harness {
        vfs,
        bcache,
        ftable: FileTable::new(),
        disk,
        dev,
    }
}

fn mount_fat32(name: &'static str) -> Harness {
    let (disk, dev) = common::fat32_disk(name);
    mount(disk, dev)
}

fn mount_fat16(name: &'static str) -> Harness {
    let (disk, dev) = common::fat16_disk(name);
    mount(disk, dev)
}

#[test]
fn s1_mkdir_create_write_seek_read_on_fat32() {
    let h = mount_fat32("s1");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/a")).unwrap();
    root.mkdir(p("/a/b")).unwrap();

    let f = h.create("/a/b/c.txt");
    assert_eq!(f.write(&h.vfs, b"hi").unwrap(), 2);
    assert_eq!(f.lseek(0, SEEK_SET).unwrap(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(f.read(&h.vfs, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"hi");
}

#[test]
fn s2_open_error_paths() {
    let h = mount_fat32("s2");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/a")).unwrap();

    assert_eq!(
        h.open("/nope", OpenFlags::empty()).err(),
        Some(KernelError::NotFound)
    );
    assert_eq!(
        h.open("/a", OpenFlags::O_WRONLY).err(),
        Some(KernelError::IsADirectory)
    );
    drop(h.create("/a/c.txt"));
    assert_eq!(
        h.open(
            "/a/c.txt",
            OpenFlags::O_CREAT | OpenFlags::O_EXCL | OpenFlags::O_RDWR
        )
        .err(),
        Some(KernelError::AlreadyExists)
    );
}

#[test]
fn create_write_reopen_read_unlink_round_trip() {
    let h = mount_fat32("roundtrip");
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    {
        let f = h.create("/data.bin");
        assert_eq!(f.write(&h.vfs, &payload).unwrap(), payload.len());
    }
    {
        let f = h.open("/data.bin", OpenFlags::empty()).unwrap();
        let mut back = vec![0u8; payload.len() + 16];
        assert_eq!(f.read(&h.vfs, &mut back).unwrap(), payload.len());
        assert_eq!(&back[..payload.len()], &payload[..]);
        assert_eq!(f.lseek(0, SEEK_END).unwrap(), payload.len() as u64);
    }
    h.ftable.unlink_path(&h.vfs, p("/data.bin")).unwrap();
    assert_eq!(
        h.open("/data.bin", OpenFlags::empty()).err(),
        Some(KernelError::NotFound)
    );
}

#[test]
fn truncate_discards_old_contents() {
    let h = mount_fat32("trunc");
    {
        let f = h.create("/t.txt");
        assert_eq!(f.write(&h.vfs, &[0xAB; 100]).unwrap(), 100);
    }
    {
        let f = h
            .open("/t.txt", OpenFlags::O_WRONLY | OpenFlags::O_TRUNC)
            .unwrap();
        assert_eq!(f.write(&h.vfs, b"new").unwrap(), 3);
    }
    let f = h.open("/t.txt", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(f.read(&h.vfs, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"new");
}

#[test]
fn append_writes_land_at_the_end() {
    let h = mount_fat32("append");
    {
        let f = h.create("/log.txt");
        f.write(&h.vfs, b"one|").unwrap();
    }
    {
        let f = h
            .open("/log.txt", OpenFlags::O_WRONLY | OpenFlags::O_APPEND)
            .unwrap();
        f.write(&h.vfs, b"two").unwrap();
    }
    let f = h.open("/log.txt", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(f.read(&h.vfs, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"one|two");
}

#[test]
fn two_handles_share_the_inode_with_independent_offsets() {
    // The filesystem half of scenario S3.
    let h = mount_fat32("shared");
    let writer = h.create("/shared.txt");
    writer.write(&h.vfs, b"0123456789").unwrap();

    let reader_a = h.open("/shared.txt", OpenFlags::empty()).unwrap();
    let reader_b = h.open("/shared.txt", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(reader_a.read(&h.vfs, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    // B's offset is untouched by A's reads.
    assert_eq!(reader_b.read(&h.vfs, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");

    // A write through the first handle is visible through the shared
    // inode.
    writer.lseek(0, SEEK_SET).unwrap();
    writer.write(&h.vfs, b"XXXX").unwrap();
    assert_eq!(reader_b.read(&h.vfs, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"4567");
    reader_b.lseek(0, SEEK_SET).unwrap();
    assert_eq!(reader_b.read(&h.vfs, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"XXXX");
}

#[test]
fn mkdir_walks_the_real_parent_chain_and_rmdir_requires_empty() {
    let h = mount_fat32("rmdir");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/d")).unwrap();
    root.mkdir(p("/d/e")).unwrap();
    drop(h.create("/d/e/f.txt"));

    assert_eq!(root.rmdir(p("/d/e")).err(), Some(KernelError::NotEmpty));
    h.ftable.unlink_path(&h.vfs, p("/d/e/f.txt")).unwrap();
    root.rmdir(p("/d/e")).unwrap();
    assert_eq!(
        root.lookup(p("/d/e")).err(),
        Some(KernelError::NotFound)
    );
    assert_eq!(root.rmdir(p("/d/e")).err(), Some(KernelError::NotFound));
    root.rmdir(p("/d")).unwrap();
}

#[test]
fn dotdot_is_rejected_by_the_resolver() {
    let h = mount_fat32("dotdot");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/a")).unwrap();
    assert_eq!(
        root.lookup(p("/a/../a")).err(),
        Some(KernelError::InvalidArgument)
    );
    // "." is silently skipped.
    assert!(root.lookup(p("/a/.")).is_ok());
}

#[test]
fn readdir_reports_entries_with_kinds() {
    let h = mount_fat32("readdir");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/sub")).unwrap();
    drop(h.create("/a.txt"));
    drop(h.create("/b.txt"));

    let dirv = root.lookup(p("/")).unwrap();
    let mut names = Vec::new();
    let mut pos = 0;
    while let Some((entry, next)) = root.readdir(&dirv, pos).unwrap() {
        names.push((
            String::from_utf8(entry.name.to_vec()).unwrap(),
            entry.kind,
        ));
        pos = next;
    }
    assert!(names.contains(&("SUB".into(), VnodeKind::Dir)));
    assert!(names.contains(&("A.TXT".into(), VnodeKind::File)));
    assert!(names.contains(&("B.TXT".into(), VnodeKind::File)));
}

#[test]
fn lfn_lookup_accepts_only_matching_checksums() {
    let h = mount_fat16("lfn");
    // "Long File Name.txt" = 18 chars: slot 2 carries the tail, slot 1
    // the first 13 units, stored last-first before the 8.3 entry.
    let short = *b"LONGFI~1TXT";
    let sum = lfn_checksum(&short);
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        0,
        &common::raw_lfn(0x40 | 2, sum, b"e.txt"),
    );
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        1,
        &common::raw_lfn(1, sum, b"Long File Nam"),
    );
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        2,
        &common::raw_entry(&short, 0x20, 0, 0),
    );

    // A second run whose checksum does not match its 8.3 entry.
    let short2 = *b"OTHERL~1TXT";
    let bad = lfn_checksum(&short2).wrapping_add(1);
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        3,
        &common::raw_lfn(0x40 | 2, bad, b"me.txt"),
    );
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        4,
        &common::raw_lfn(1, bad, b"Other Long Na"),
    );
    common::plant_dirent(
        &h.disk,
        common::FAT16_ROOT_LBA,
        5,
        &common::raw_entry(&short2, 0x20, 0, 0),
    );

    let root = h.vfs.root_mount().unwrap();
    // Reconstructed long name, case-insensitive.
    assert!(root.lookup(p("/Long File Name.txt")).is_ok());
    assert!(root.lookup(p("/long file name.TXT")).is_ok());
    // The broken run never yields a long name; the 8.3 form still
    // resolves.
    assert_eq!(
        root.lookup(p("/Other Long Name.txt")).err(),
        Some(KernelError::NotFound)
    );
    assert!(root.lookup(p("/otherl~1.txt")).is_ok());
}

#[test]
fn directory_allocator_reuses_freed_runs() {
    let h = mount_fat16("diralloc");
    let geo = Geometry {
        kind: layout::FatType::Fat16,
        sector_size: common::SECTOR,
        sectors_per_cluster: 4,
        reserved_sectors: common::FAT16_RESERVED,
        num_fats: 2,
        fat_sectors: common::FAT16_FAT_SECTORS,
        fat_start_lba: common::FAT16_RESERVED,
        root_entries: 512,
        root_dir_lba: common::FAT16_ROOT_LBA,
        root_dir_sectors: common::FAT16_ROOT_SECTORS,
        root_cluster: 0,
        data_start_lba: common::FAT16_ROOT_LBA + common::FAT16_ROOT_SECTORS,
        nclusters: (common::FAT16_TOTAL
            - common::FAT16_ROOT_LBA
            - common::FAT16_ROOT_SECTORS)
            / 4
            + 2,
        total_sectors: common::FAT16_TOTAL,
    };
    let mut table = FatTable::load(
        &h.bcache,
        h.dev,
        layout::FatType::Fat16,
        geo.fat_start_lba,
        geo.fat_sectors,
        geo.num_fats,
        geo.sector_size,
        geo.nclusters,
    )
    .unwrap();
    let root = dir::DirLoc::Fixed {
        first_lba: geo.root_dir_lba,
        nsectors: geo.root_dir_sectors,
    };

    let first = dir::alloc_slots(&geo, &mut table, &h.bcache, h.dev, &root, 3).unwrap();
    // Occupy the run, then delete it.
    for (i, &loc) in first.iter().enumerate() {
        let mut raw = layout::DirEntryRaw::default();
        raw.name = *b"SLOT       ";
        raw.name[4] = b'0' + i as u8;
        raw.attr = 0x20;
        dir::write_entry(&h.bcache, h.dev, loc, &raw).unwrap();
    }
    for &loc in first.iter() {
        dir::mark_deleted(&h.bcache, h.dev, loc).unwrap();
    }

    let second = dir::alloc_slots(&geo, &mut table, &h.bcache, h.dev, &root, 3).unwrap();
    assert_eq!(first.as_slice(), second.as_slice());
}

#[test]
fn fat12_fixed_root_supports_basic_files() {
    let (disk, dev) = common::fat12_disk("fat12");
    let h = mount(disk, dev);
    let f = h.create("/boot.bin");
    f.write(&h.vfs, b"floppy payload").unwrap();
    f.lseek(0, SEEK_SET).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(f.read(&h.vfs, &mut buf).unwrap(), 14);
    assert_eq!(&buf[..14], b"floppy payload");
}

#[test]
fn sync_persists_across_a_remount() {
    let (disk, dev) = common::fat32_disk("persist");
    let payload = b"survives the remount";
    {
        let h = mount(disk.clone(), dev);
        let root = h.vfs.root_mount().unwrap();
        root.mkdir(p("/keep")).unwrap();
        let f = h.create("/keep/data.txt");
        f.write(&h.vfs, payload).unwrap();
        h.vfs.sync_all().unwrap();
    }
    // A brand-new cache stack over the same image.
    let h2 = mount(disk, dev);
    let f = h2.open("/keep/data.txt", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(f.read(&h2.vfs, &mut buf).unwrap(), payload.len());
    assert_eq!(&buf[..payload.len()], payload);
}

#[test]
fn lookup_succeeds_iff_the_walk_visits_a_matching_entry() {
    let h = mount_fat32("walk");
    let root = h.vfs.root_mount().unwrap();
    root.mkdir(p("/x")).unwrap();
    drop(h.create("/x/y.txt"));

    assert!(root.lookup(p("/x/y.txt")).is_ok());
    assert!(root.lookup(p("/X/Y.TXT")).is_ok());
    assert_eq!(root.lookup(p("/x/z.txt")).err(), Some(KernelError::NotFound));
    assert_eq!(
        root.lookup(p("/x/y.txt/deeper")).err(),
        Some(KernelError::NotADirectory)
    );
}
