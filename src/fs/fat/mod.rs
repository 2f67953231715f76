//! FAT12/16/32 driver.
//!
//! One `FatFs` per mount holds the geometry decoded from the BIOS
//! parameter block, the in-memory FAT table, and the table of live
//! nodes. FAT has no inode numbers, so the driver fabricates them:
//! every directory entry location gets a monotonically assigned number
//! the first time it is seen, and that number keys the page cache and
//! the vnode for as long as the volume stays mounted.
//!
//! The filesystem lock is a sleep lock: it is held across directory and
//! FAT I/O through the buffer cache. Read-only operations take it too,
//! because they share the directory-scan state and the node table.

pub mod dir;
pub mod layout;
pub mod table;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use zerocopy::FromBytes;

use crate::bio::Bcache;
use crate::device::{self, DeviceId};
use crate::error::{KernelError, Result};
use crate::fs::{
    DirEntry, FileName, FileSystemDriver, MountedFs, OpenFlags, Path, Vnode, VnodeKind,
};
use crate::lock::SleepLock;

use dir::{DirCtx, DirLoc, EntryLoc, Scanned};
use layout::{
    format_short, short_name_for, Attributes, BiosParamBlock, DirEntryRaw, FatType, DIRENT_SIZE,
};
use table::FatTable;

/// Fabricated inode number of the root directory.
pub const ROOT_INO: u32 = 1;

/// Decoded volume geometry, fixed at mount.
pub struct Geometry {
    pub kind: FatType,
    pub sector_size: usize,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_sectors: u32,
    pub fat_start_lba: u32,
    pub root_entries: u32,
    /// FAT12/16 fixed root region.
    pub root_dir_lba: u32,
    pub root_dir_sectors: u32,
    /// FAT32 root chain.
    pub root_cluster: u32,
    pub data_start_lba: u32,
    /// Valid cluster numbers are `2..nclusters`.
    pub nclusters: u32,
    pub total_sectors: u32,
}

impl Geometry {
    pub fn from_bpb(bpb: &BiosParamBlock, sector_size: usize) -> Result<Self> {
        let bps = bpb.bytes_per_sector as usize;
        let spc = bpb.sectors_per_cluster as u32;
        if bps != sector_size || !bps.is_power_of_two() || spc == 0 || !spc.is_power_of_two() {
            return Err(KernelError::InvalidArgument);
        }
        let reserved = bpb.reserved_sectors as u32;
        let num_fats = bpb.num_fats as u32;
        if reserved == 0 || num_fats == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let root_entries = bpb.root_entries as u32;
        let root_dir_sectors =
            (root_entries * DIRENT_SIZE as u32 + bps as u32 - 1) / bps as u32;
        let fat_sectors = if bpb.fat_size16 != 0 {
            bpb.fat_size16 as u32
        } else {
            bpb.fat_size32
        };
        let total_sectors = if bpb.total_sectors16 != 0 {
            bpb.total_sectors16 as u32
        } else {
            bpb.total_sectors32
        };
        if fat_sectors == 0 || total_sectors == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let fat_start_lba = reserved;
        let root_dir_lba = reserved + num_fats * fat_sectors;
        let data_start_lba = root_dir_lba + root_dir_sectors;
        if data_start_lba >= total_sectors {
            return Err(KernelError::InvalidArgument);
        }
        let cluster_count = (total_sectors - data_start_lba) / spc;
        let kind = FatType::from_cluster_count(cluster_count);
        Ok(Self {
            kind,
            sector_size,
            sectors_per_cluster: spc,
            reserved_sectors: reserved,
            num_fats,
            fat_sectors,
            fat_start_lba,
            root_entries,
            root_dir_lba,
            root_dir_sectors,
            root_cluster: bpb.root_cluster,
            data_start_lba,
            nclusters: cluster_count + 2,
            total_sectors,
        })
    }

    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.data_start_lba + (cluster - 2) * self.sectors_per_cluster
    }

    pub fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * self.sector_size
    }

    pub fn entries_per_sector(&self) -> usize {
        self.sector_size / DIRENT_SIZE
    }
}

/// In-memory record of one known filesystem object.
struct Node {
    /// Directory-entry slot; None for the root.
    loc: Option<EntryLoc>,
    first_cluster: u32,
    size: u32,
    is_dir: bool,
    vnode: Weak<Vnode>,
}

struct FatState {
    table: FatTable,
    nodes: BTreeMap<u32, Node>,
    by_loc: BTreeMap<(u32, u16), u32>,
    next_ino: u32,
}

pub struct FatFs {
    dev: DeviceId,
    bcache: Arc<Bcache>,
    geo: Geometry,
    state: SleepLock<FatState>,
}

/// The registered driver: mounts `FatFs` contexts over block devices.
pub struct FatDriver {
    bcache: Arc<Bcache>,
}

impl FatDriver {
    pub fn new(bcache: Arc<Bcache>) -> Self {
        Self { bcache }
    }
}

impl FileSystemDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn mount(&self, dev: DeviceId) -> Result<Arc<dyn MountedFs>> {
        Ok(FatFs::mount(self.bcache.clone(), dev)?)
    }
}

impl FatFs {
    pub fn mount(bcache: Arc<Bcache>, dev: DeviceId) -> Result<Arc<Self>> {
        let sector_size = device::by_id(dev)?.sector_size();
        let geo = {
            let boot = bcache.get(dev, 0)?;
            let bpb =
                BiosParamBlock::read_from_prefix(boot.data()).ok_or(KernelError::InvalidArgument)?;
            Geometry::from_bpb(&bpb, sector_size)?
        };
        let table = FatTable::load(
            &bcache,
            dev,
            geo.kind,
            geo.fat_start_lba,
            geo.fat_sectors,
            geo.num_fats,
            geo.sector_size,
            geo.nclusters,
        )?;

        let mut nodes = BTreeMap::new();
        let root_cluster = match geo.kind {
            FatType::Fat32 => geo.root_cluster,
            _ => 0,
        };
        let _ = nodes.insert(
            ROOT_INO,
            Node {
                loc: None,
                first_cluster: root_cluster,
                size: 0,
                is_dir: true,
                vnode: Weak::new(),
            },
        );

        Ok(Arc::new(Self {
            dev,
            bcache,
            geo,
            state: SleepLock::new(
                "fat fs",
                FatState {
                    table,
                    nodes,
                    by_loc: BTreeMap::new(),
                    next_ino: ROOT_INO + 1,
                },
            ),
        }))
    }

    pub fn fat_type(&self) -> FatType {
        self.geo.kind
    }

    fn ctx<'a>(&'a self, table: &'a FatTable) -> DirCtx<'a> {
        DirCtx {
            geo: &self.geo,
            table,
            bcache: &self.bcache,
            dev: self.dev,
        }
    }

    fn node(st: &FatState, ino: u32) -> Result<&Node> {
        st.nodes.get(&ino).ok_or(KernelError::NotFound)
    }

    fn node_mut(st: &mut FatState, ino: u32) -> Result<&mut Node> {
        st.nodes.get_mut(&ino).ok_or(KernelError::NotFound)
    }

    /// The slot region of a directory node.
    fn dir_loc(&self, node: &Node) -> DirLoc {
        if node.loc.is_none() && self.geo.kind != FatType::Fat32 {
            DirLoc::Fixed {
                first_lba: self.geo.root_dir_lba,
                nsectors: self.geo.root_dir_sectors,
            }
        } else {
            DirLoc::Chain {
                first_cluster: node.first_cluster,
            }
        }
    }

    /// Returns the fabricated inode number for a scanned entry,
    /// assigning one on first sight.
    fn intern(&self, st: &mut FatState, found: &Scanned) -> u32 {
        let key = (found.loc.lba, found.loc.index);
        if let Some(&ino) = st.by_loc.get(&key) {
            return ino;
        }
        let ino = st.next_ino;
        st.next_ino += 1;
        let _ = st.by_loc.insert(key, ino);
        let _ = st.nodes.insert(
            ino,
            Node {
                loc: Some(found.loc),
                first_cluster: found.raw.first_cluster(self.geo.kind),
                size: found.raw.file_size,
                is_dir: found.raw.is_directory(),
                vnode: Weak::new(),
            },
        );
        ino
    }

    /// The shared vnode for `ino`, creating it when none is live.
    fn vnode_of(&self, st: &mut FatState, ino: u32) -> Result<Arc<Vnode>> {
        let node = Self::node_mut(st, ino)?;
        if let Some(vnode) = node.vnode.upgrade() {
            return Ok(vnode);
        }
        let kind = if node.is_dir {
            VnodeKind::Dir
        } else {
            VnodeKind::File
        };
        let vnode = Arc::new(Vnode::new(self.dev, ino, kind, node.size as u64));
        node.vnode = Arc::downgrade(&vnode);
        Ok(vnode)
    }

    /// Walks `path` one component at a time from the root. `.` is
    /// skipped; `..` is rejected (callers canonicalize); a missing
    /// component is not-found; a file mid-path is not-a-directory.
    fn resolve(&self, st: &mut FatState, path: &Path) -> Result<u32> {
        let mut ino = ROOT_INO;
        let mut rest = path;
        while let Some((next, name)) = rest.skipelem() {
            rest = next;
            if name.is_dot() {
                continue;
            }
            if name.is_dotdot() {
                return Err(KernelError::InvalidArgument);
            }
            let node = Self::node(st, ino)?;
            if !node.is_dir {
                return Err(KernelError::NotADirectory);
            }
            let loc = self.dir_loc(node);
            let found = {
                let ctx = self.ctx(&st.table);
                dir::search(&ctx, &loc, name)?
            };
            match found {
                Some(found) => ino = self.intern(st, &found),
                None => return Err(KernelError::NotFound),
            }
        }
        Ok(ino)
    }

    /// Resolves the parent directory of `path`'s final component.
    fn resolve_parent<'p>(
        &self,
        st: &mut FatState,
        path: &'p Path,
    ) -> Result<(u32, &'p FileName)> {
        let (parent, name) = path.split_parent().ok_or(KernelError::InvalidArgument)?;
        if name.is_dot() || name.is_dotdot() {
            return Err(KernelError::InvalidArgument);
        }
        let parent_ino = self.resolve(st, parent)?;
        if !Self::node(st, parent_ino)?.is_dir {
            return Err(KernelError::NotADirectory);
        }
        Ok((parent_ino, name))
    }

    /// Searches `name` within the directory node `dir_ino`.
    fn search_in(
        &self,
        st: &FatState,
        dir_ino: u32,
        name: &FileName,
    ) -> Result<Option<Scanned>> {
        let node = Self::node(st, dir_ino)?;
        let loc = self.dir_loc(node);
        let ctx = self.ctx(&st.table);
        dir::search(&ctx, &loc, name)
    }

    /// Creates an empty file entry in `parent`.
    fn create_file(&self, st: &mut FatState, parent: u32, name: &FileName) -> Result<u32> {
        let short = short_name_for(name).ok_or(KernelError::NameTooLong)?;
        let parent_loc = {
            let node = Self::node(st, parent)?;
            self.dir_loc(node)
        };
        let slots = dir::alloc_slots(
            &self.geo,
            &mut st.table,
            &self.bcache,
            self.dev,
            &parent_loc,
            1,
        )?;
        let loc = slots[0];
        let mut raw = DirEntryRaw::default();
        raw.name = short;
        raw.attr = Attributes::ARCHIVE.bits();
        raw.set_first_cluster(0, self.geo.kind);
        raw.file_size = 0;
        dir::write_entry(&self.bcache, self.dev, loc, &raw)?;

        let found = Scanned {
            raw,
            loc,
            pos: 0,
            lfn: None,
            lfn_run: arrayvec::ArrayVec::new(),
        };
        Ok(self.intern(st, &found))
    }

    /// Rewrites the on-disk entry of `ino` from its node.
    fn flush_entry(&self, st: &mut FatState, ino: u32) -> Result<()> {
        let (loc, first_cluster, size) = {
            let node = Self::node(st, ino)?;
            match node.loc {
                Some(loc) => (loc, node.first_cluster, node.size),
                // The root has no entry to update.
                None => return Ok(()),
            }
        };
        let mut raw = dir::read_entry(&self.bcache, self.dev, loc)?;
        raw.set_first_cluster(first_cluster, self.geo.kind);
        raw.file_size = size;
        dir::write_entry(&self.bcache, self.dev, loc, &raw)
    }

    /// Frees a file's cluster chain and zeroes its entry fields.
    fn truncate_node(&self, st: &mut FatState, ino: u32) -> Result<()> {
        let first = {
            let node = Self::node_mut(st, ino)?;
            let first = node.first_cluster;
            node.first_cluster = 0;
            node.size = 0;
            if let Some(vnode) = node.vnode.upgrade() {
                vnode.set_size(0);
            }
            first
        };
        if first >= 2 {
            st.table.free_chain(&self.bcache, self.dev, first)?;
        }
        self.flush_entry(st, ino)
    }

    /// Byte I/O against a node's sectors; shared by reads and writes.
    fn node_io(
        &self,
        st: &mut FatState,
        ino: u32,
        off: u64,
        len: usize,
        mut buf_read: Option<&mut [u8]>,
        buf_write: Option<&[u8]>,
    ) -> Result<usize> {
        let (loc, limit) = {
            let node = Self::node(st, ino)?;
            let limit = if node.is_dir {
                u64::MAX
            } else {
                node.size as u64
            };
            (self.dir_loc(node), limit)
        };
        if off >= limit {
            return Ok(0);
        }
        let n = len.min((limit - off) as usize);
        let ss = self.geo.sector_size as u64;

        let mut done = 0usize;
        while done < n {
            let pos = off + done as u64;
            let sector_idx = (pos / ss) as u32;
            let in_sector = (pos % ss) as usize;
            let chunk = (ss as usize - in_sector).min(n - done);

            let lba = {
                let ctx = self.ctx(&st.table);
                ctx_sector(&ctx, &loc, sector_idx)?
            };
            let mut buf = self.bcache.get(self.dev, lba)?;
            match (&mut buf_read, buf_write) {
                (Some(dst), None) => {
                    dst[done..done + chunk]
                        .copy_from_slice(&buf.data()[in_sector..in_sector + chunk]);
                }
                (None, Some(src)) => {
                    buf.data_mut()[in_sector..in_sector + chunk]
                        .copy_from_slice(&src[done..done + chunk]);
                    buf.mark_dirty();
                }
                _ => unreachable!(),
            }
            done += chunk;
        }
        Ok(done)
    }
}

/// Sector lookup that treats a missing sector as a broken chain; file
/// I/O is always within the allocated range by the time it gets here.
fn ctx_sector(ctx: &DirCtx<'_>, loc: &DirLoc, sector_idx: u32) -> Result<u32> {
    match *loc {
        DirLoc::Fixed { first_lba, nsectors } => {
            if sector_idx < nsectors {
                Ok(first_lba + sector_idx)
            } else {
                Err(KernelError::Io)
            }
        }
        DirLoc::Chain { first_cluster } => {
            let spc = ctx.geo.sectors_per_cluster;
            match ctx.table.cluster_at(first_cluster, sector_idx / spc)? {
                Some(cluster) => Ok(ctx.geo.cluster_lba(cluster) + sector_idx % spc),
                None => Err(KernelError::Io),
            }
        }
    }
}

impl MountedFs for FatFs {
    fn device(&self) -> DeviceId {
        self.dev
    }

    fn root(&self) -> Result<Arc<Vnode>> {
        let mut st = self.state.lock();
        self.vnode_of(&mut st, ROOT_INO)
    }

    fn lookup(&self, path: &Path) -> Result<Arc<Vnode>> {
        let mut st = self.state.lock();
        let ino = self.resolve(&mut st, path)?;
        self.vnode_of(&mut st, ino)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Arc<Vnode>> {
        let mut st = self.state.lock();
        match self.resolve(&mut st, path) {
            Ok(ino) => {
                if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
                    return Err(KernelError::AlreadyExists);
                }
                let is_dir = Self::node(&st, ino)?.is_dir;
                if is_dir && flags.writable() {
                    return Err(KernelError::IsADirectory);
                }
                if flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
                    self.truncate_node(&mut st, ino)?;
                }
                self.vnode_of(&mut st, ino)
            }
            Err(KernelError::NotFound) if flags.contains(OpenFlags::O_CREAT) => {
                let (parent, name) = self.resolve_parent(&mut st, path)?;
                let ino = self.create_file(&mut st, parent, name)?;
                self.vnode_of(&mut st, ino)
            }
            Err(e) => Err(e),
        }
    }

    fn read_inode(&self, inum: u32, off: u64, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let len = buf.len();
        self.node_io(&mut st, inum, off, len, Some(buf), None)
    }

    fn write_inode(&self, inum: u32, off: u64, buf: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();
        self.node_io(&mut st, inum, off, buf.len(), None, Some(buf))
    }

    fn stat_inode(&self, inum: u32) -> Result<u64> {
        let st = self.state.lock();
        Ok(Self::node(&st, inum)?.size as u64)
    }

    fn prepare_write(&self, vnode: &Vnode, off: u64, len: usize) -> Result<()> {
        if vnode.is_dir() {
            return Err(KernelError::IsADirectory);
        }
        let end = off
            .checked_add(len as u64)
            .filter(|&e| e <= u32::MAX as u64)
            .ok_or(KernelError::NoSpace)?;
        let mut st = self.state.lock();
        let ino = vnode.inum;
        let cluster_bytes = self.geo.cluster_bytes() as u64;
        let needed = ((end + cluster_bytes - 1) / cluster_bytes) as u32;

        let mut first = Self::node(&st, ino)?.first_cluster;
        if first < 2 && needed > 0 {
            first = st.table.alloc(&self.bcache, self.dev, None)?;
            Self::node_mut(&mut st, ino)?.first_cluster = first;
        }
        if needed > 0 {
            let mut have = st.table.chain_len(first)?;
            let mut tail = st
                .table
                .cluster_at(first, have.saturating_sub(1))?
                .ok_or(KernelError::Io)?;
            while have < needed {
                tail = st.table.alloc(&self.bcache, self.dev, Some(tail))?;
                have += 1;
            }
        }

        let node = Self::node_mut(&mut st, ino)?;
        if end > node.size as u64 {
            node.size = end as u32;
            if let Some(v) = node.vnode.upgrade() {
                v.set_size(end);
            }
        }
        vnode.set_size(vnode.size().max(end));
        self.flush_entry(&mut st, ino)
    }

    fn readdir(&self, vnode: &Vnode, pos: u32) -> Result<Option<(DirEntry, u32)>> {
        let mut st = self.state.lock();
        let node = Self::node(&st, vnode.inum)?;
        if !node.is_dir {
            return Err(KernelError::NotADirectory);
        }
        let loc = self.dir_loc(node);
        let found = {
            let ctx = self.ctx(&st.table);
            dir::scan(&ctx, &loc, |e| {
                if e.pos >= pos {
                    Some(Scanned {
                        raw: e.raw,
                        loc: e.loc,
                        pos: e.pos,
                        lfn: e.lfn.clone(),
                        lfn_run: e.lfn_run.clone(),
                    })
                } else {
                    None
                }
            })?
        };
        let found = match found {
            Some(f) => f,
            None => return Ok(None),
        };

        let mut name = arrayvec::ArrayVec::new();
        match &found.lfn {
            Some(lfn) => {
                let _ = name.try_extend_from_slice(lfn);
            }
            None => {
                let mut short = [0u8; 12];
                let n = format_short(&found.raw.name, &mut short);
                let _ = name.try_extend_from_slice(&short[..n]);
            }
        }
        let kind = if found.raw.is_directory() {
            VnodeKind::Dir
        } else {
            VnodeKind::File
        };
        let size = found.raw.file_size;
        let next = found.pos + 1;
        let ino = self.intern(&mut st, &found);
        Ok(Some((
            DirEntry {
                name,
                kind,
                inum: ino,
                size,
            },
            next,
        )))
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        let (parent, name) = self.resolve_parent(&mut st, path)?;
        let found = self
            .search_in(&st, parent, name)?
            .ok_or(KernelError::NotFound)?;
        if found.raw.is_directory() {
            return Err(KernelError::IsADirectory);
        }

        for &slot in found.lfn_run.iter() {
            dir::mark_deleted(&self.bcache, self.dev, slot)?;
        }
        dir::mark_deleted(&self.bcache, self.dev, found.loc)?;

        let first = found.raw.first_cluster(self.geo.kind);
        if first >= 2 {
            st.table.free_chain(&self.bcache, self.dev, first)?;
        }

        if let Some(ino) = st.by_loc.remove(&(found.loc.lba, found.loc.index)) {
            let _ = st.nodes.remove(&ino);
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        let (parent, name) = self.resolve_parent(&mut st, path)?;
        if self.search_in(&st, parent, name)?.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let short = short_name_for(name).ok_or(KernelError::NameTooLong)?;
        let parent_cluster = Self::node(&st, parent)?.first_cluster;

        // Body first: one zeroed cluster carrying "." and "..".
        let cluster = st.table.alloc(&self.bcache, self.dev, None)?;
        let base_lba = self.geo.cluster_lba(cluster);
        for s in 0..self.geo.sectors_per_cluster {
            let mut buf = self.bcache.get_clear(self.dev, base_lba + s)?;
            buf.mark_dirty();
        }

        let mut dot = DirEntryRaw::default();
        dot.name = *b".          ";
        dot.attr = Attributes::DIRECTORY.bits();
        dot.set_first_cluster(cluster, self.geo.kind);
        dir::write_entry(
            &self.bcache,
            self.dev,
            EntryLoc {
                lba: base_lba,
                index: 0,
            },
            &dot,
        )?;

        let mut dotdot = DirEntryRaw::default();
        dotdot.name = *b"..         ";
        dotdot.attr = Attributes::DIRECTORY.bits();
        // The root is recorded as cluster 0 in "..", per the format.
        dotdot.set_first_cluster(
            if parent == ROOT_INO { 0 } else { parent_cluster },
            self.geo.kind,
        );
        dir::write_entry(
            &self.bcache,
            self.dev,
            EntryLoc {
                lba: base_lba,
                index: 1,
            },
            &dotdot,
        )?;

        // Then the entry in the parent, walking the real parent chain.
        let parent_loc = {
            let node = Self::node(&st, parent)?;
            self.dir_loc(node)
        };
        let slots = dir::alloc_slots(
            &self.geo,
            &mut st.table,
            &self.bcache,
            self.dev,
            &parent_loc,
            1,
        )?;
        let mut raw = DirEntryRaw::default();
        raw.name = short;
        raw.attr = Attributes::DIRECTORY.bits();
        raw.set_first_cluster(cluster, self.geo.kind);
        dir::write_entry(&self.bcache, self.dev, slots[0], &raw)
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        let (parent, name) = self.resolve_parent(&mut st, path)?;
        let found = self
            .search_in(&st, parent, name)?
            .ok_or(KernelError::NotFound)?;
        if !found.raw.is_directory() {
            return Err(KernelError::NotADirectory);
        }

        // Only "." and ".." may remain.
        let first = found.raw.first_cluster(self.geo.kind);
        let loc = DirLoc::Chain {
            first_cluster: first,
        };
        let occupied = {
            let ctx = self.ctx(&st.table);
            dir::scan(&ctx, &loc, |e| {
                if e.raw.name[0] != b'.' {
                    Some(())
                } else {
                    None
                }
            })?
        };
        if occupied.is_some() {
            return Err(KernelError::NotEmpty);
        }

        for &slot in found.lfn_run.iter() {
            dir::mark_deleted(&self.bcache, self.dev, slot)?;
        }
        dir::mark_deleted(&self.bcache, self.dev, found.loc)?;
        if first >= 2 {
            st.table.free_chain(&self.bcache, self.dev, first)?;
        }
        if let Some(ino) = st.by_loc.remove(&(found.loc.lba, found.loc.index)) {
            let _ = st.nodes.remove(&ino);
        }
        Ok(())
    }

    fn close(&self, _vnode: &Vnode) {
        // Nodes are kept for the mount's lifetime: fabricated inode
        // numbers must stay stable for the page cache.
    }

    fn sync(&self) -> Result<()> {
        let _ = self.bcache.sync(Some(self.dev))?;
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        self.sync()
    }
}
