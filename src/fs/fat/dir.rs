//! Directory scanning, long-filename reconstruction, and slot
//! allocation.
//!
//! Directories are read sector by sector through the buffer cache; the
//! sectors of a chain-backed directory come from walking the FAT, and
//! the FAT12/16 root from its fixed region. A long-filename run is
//! accumulated while walking and accepted only if its ordinals count
//! down cleanly and its checksum matches the 8.3 entry that closes it;
//! anything out of order resets the accumulator.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::device::DeviceId;
use crate::error::{KernelError, Result};
use crate::fs::FileName;
use crate::param::MAXNAME;

use super::layout::{
    lfn_checksum, matches_short, DirEntryRaw, LfnEntryRaw, DIRENT_SIZE, ENTRY_DELETED, LFN_CHARS,
    LFN_LAST, LFN_ORD_MASK,
};
use super::table::FatTable;
use super::Geometry;

/// Longest LFN run: ceil(255 / 13) slots.
pub const MAX_LFN_SLOTS: usize = 20;

/// Where a directory's slots live.
#[derive(Clone, Copy, Debug)]
pub enum DirLoc {
    /// The fixed FAT12/16 root region.
    Fixed { first_lba: u32, nsectors: u32 },
    /// A cluster chain (FAT32 root and every subdirectory).
    Chain { first_cluster: u32 },
}

/// Identity of one 32-byte directory slot on disk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct EntryLoc {
    pub lba: u32,
    pub index: u16,
}

/// Borrowed context for read-only directory walks.
pub struct DirCtx<'a> {
    pub geo: &'a Geometry,
    pub table: &'a FatTable,
    pub bcache: &'a Arc<Bcache>,
    pub dev: DeviceId,
}

impl DirCtx<'_> {
    /// LBA of the `idx`-th sector of the directory; None past the end.
    fn sector_lba(&self, dir: &DirLoc, idx: u32) -> Result<Option<u32>> {
        match *dir {
            DirLoc::Fixed { first_lba, nsectors } => {
                if idx < nsectors {
                    Ok(Some(first_lba + idx))
                } else {
                    Ok(None)
                }
            }
            DirLoc::Chain { first_cluster } => {
                let spc = self.geo.sectors_per_cluster;
                match self.table.cluster_at(first_cluster, idx / spc)? {
                    Some(cluster) => Ok(Some(self.geo.cluster_lba(cluster) + idx % spc)),
                    None => Ok(None),
                }
            }
        }
    }
}

/// One 8.3 entry produced by a scan, with its validated long name when
/// the preceding run survived the checks.
pub struct Scanned {
    pub raw: DirEntryRaw,
    pub loc: EntryLoc,
    /// Absolute slot position of the 8.3 entry within the directory.
    pub pos: u32,
    pub lfn: Option<ArrayVec<u8, MAXNAME>>,
    /// Slots of the accepted run, for deletion alongside the entry.
    pub lfn_run: ArrayVec<EntryLoc, MAX_LFN_SLOTS>,
}

impl Scanned {
    /// Whether this entry answers to `name`, by reconstructed long name
    /// or case-folded 8.3 form.
    pub fn matches(&self, name: &FileName) -> bool {
        if let Some(lfn) = &self.lfn {
            if lfn.len() == name.len()
                && lfn
                    .iter()
                    .zip(name.as_bytes())
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
            {
                return true;
            }
        }
        matches_short(&self.raw.name, name)
    }
}

/// Accumulator for one long-filename run.
struct LfnRun {
    /// Next ordinal expected, counting down; 0 = inactive.
    expect: u8,
    checksum: u8,
    total: u8,
    tail_len: usize,
    buf: [u8; MAX_LFN_SLOTS * LFN_CHARS],
    locs: ArrayVec<EntryLoc, MAX_LFN_SLOTS>,
}

impl LfnRun {
    fn new() -> Self {
        Self {
            expect: 0,
            checksum: 0,
            total: 0,
            tail_len: 0,
            buf: [0; MAX_LFN_SLOTS * LFN_CHARS],
            locs: ArrayVec::new(),
        }
    }

    fn reset(&mut self) {
        self.expect = 0;
        self.total = 0;
        self.locs.clear();
    }

    fn feed(&mut self, lfn: &LfnEntryRaw, loc: EntryLoc) {
        let ord = lfn.ordinal & LFN_ORD_MASK;
        if lfn.ordinal & LFN_LAST != 0 {
            // Start of a run (highest ordinal comes first on disk).
            self.reset();
            if ord == 0 || ord as usize > MAX_LFN_SLOTS {
                return;
            }
            self.total = ord;
            self.checksum = lfn.checksum;
            let mut span = [0u8; LFN_CHARS];
            self.tail_len = lfn.decode_into(&mut span);
            self.buf[(ord as usize - 1) * LFN_CHARS..][..self.tail_len]
                .copy_from_slice(&span[..self.tail_len]);
            self.expect = ord - 1;
            let _ = self.locs.try_push(loc);
            return;
        }
        // Continuation: ordinal and checksum must line up.
        if self.expect == 0 || ord != self.expect || lfn.checksum != self.checksum {
            self.reset();
            return;
        }
        let mut span = [0u8; LFN_CHARS];
        let n = lfn.decode_into(&mut span);
        if n != LFN_CHARS {
            // Interior slots are always full.
            self.reset();
            return;
        }
        self.buf[(ord as usize - 1) * LFN_CHARS..][..LFN_CHARS].copy_from_slice(&span);
        self.expect = ord - 1;
        let _ = self.locs.try_push(loc);
    }

    /// Closes the run against the 8.3 entry that follows it.
    fn take(
        &mut self,
        short: &[u8; 11],
    ) -> (Option<ArrayVec<u8, MAXNAME>>, ArrayVec<EntryLoc, MAX_LFN_SLOTS>) {
        if self.total == 0 || self.expect != 0 || lfn_checksum(short) != self.checksum {
            self.reset();
            return (None, ArrayVec::new());
        }
        let len = (self.total as usize - 1) * LFN_CHARS + self.tail_len;
        let mut name = ArrayVec::new();
        let n = len.min(MAXNAME);
        let _ = name.try_extend_from_slice(&self.buf[..n]);
        let locs = core::mem::take(&mut self.locs);
        self.reset();
        (Some(name), locs)
    }
}

/// Walks the directory, invoking `f` for every live 8.3 entry. The walk
/// ends at the 0x00 terminator, when the sectors run out, or when `f`
/// returns `Some`; that value is passed through.
pub fn scan<R, F>(ctx: &DirCtx<'_>, dir: &DirLoc, mut f: F) -> Result<Option<R>>
where
    F: FnMut(&Scanned) -> Option<R>,
{
    let eps = ctx.geo.entries_per_sector() as u32;
    let mut run = LfnRun::new();
    let mut sector_idx = 0;
    loop {
        let lba = match ctx.sector_lba(dir, sector_idx)? {
            Some(lba) => lba,
            None => return Ok(None),
        };
        let buf = ctx.bcache.get(ctx.dev, lba)?;
        for index in 0..eps {
            let base = index as usize * DIRENT_SIZE;
            let bytes = &buf.data()[base..base + DIRENT_SIZE];
            let loc = EntryLoc {
                lba,
                index: index as u16,
            };
            let raw = DirEntryRaw::read_from(bytes).expect("slot size");
            if raw.is_end() {
                return Ok(None);
            }
            if raw.is_deleted() {
                run.reset();
                continue;
            }
            if raw.is_lfn() {
                let lfn = LfnEntryRaw::read_from(bytes).expect("slot size");
                run.feed(&lfn, loc);
                continue;
            }
            if raw.is_volume_label() {
                run.reset();
                continue;
            }
            let (lfn, lfn_run) = run.take(&raw.name);
            let scanned = Scanned {
                raw,
                loc,
                pos: sector_idx * eps + index,
                lfn,
                lfn_run,
            };
            if let Some(r) = f(&scanned) {
                return Ok(Some(r));
            }
        }
        sector_idx += 1;
    }
}

/// Finds the entry answering to `name`.
pub fn search(ctx: &DirCtx<'_>, dir: &DirLoc, name: &FileName) -> Result<Option<Scanned>> {
    scan(ctx, dir, |e| {
        if e.matches(name) {
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
    })
}

/// Reads one slot.
pub fn read_entry(bcache: &Arc<Bcache>, dev: DeviceId, loc: EntryLoc) -> Result<DirEntryRaw> {
    let buf = bcache.get(dev, loc.lba)?;
    let base = loc.index as usize * DIRENT_SIZE;
    Ok(DirEntryRaw::read_from(&buf.data()[base..base + DIRENT_SIZE]).expect("slot size"))
}

/// Writes one slot and marks the sector dirty.
pub fn write_entry(
    bcache: &Arc<Bcache>,
    dev: DeviceId,
    loc: EntryLoc,
    entry: &DirEntryRaw,
) -> Result<()> {
    let mut buf = bcache.get(dev, loc.lba)?;
    let base = loc.index as usize * DIRENT_SIZE;
    buf.data_mut()[base..base + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
    buf.mark_dirty();
    Ok(())
}

/// Freezes one slot with the deleted marker.
pub fn mark_deleted(bcache: &Arc<Bcache>, dev: DeviceId, loc: EntryLoc) -> Result<()> {
    let mut buf = bcache.get(dev, loc.lba)?;
    let base = loc.index as usize * DIRENT_SIZE;
    buf.data_mut()[base] = ENTRY_DELETED;
    buf.mark_dirty();
    Ok(())
}

/// Finds `want` consecutive free or deleted slots, extending a
/// chain-backed directory by one zeroed cluster when no run exists. The
/// fixed FAT12/16 root cannot grow, so exhaustion there is no-space.
/// Returns the slot locations in order.
pub fn alloc_slots(
    geo: &Geometry,
    table: &mut FatTable,
    bcache: &Arc<Bcache>,
    dev: DeviceId,
    dir: &DirLoc,
    want: usize,
) -> Result<ArrayVec<EntryLoc, MAX_LFN_SLOTS>> {
    assert!(want >= 1 && want <= MAX_LFN_SLOTS);
    let eps = geo.entries_per_sector();
    let mut found: ArrayVec<EntryLoc, MAX_LFN_SLOTS> = ArrayVec::new();
    let mut sector_idx = 0;

    loop {
        let lba = {
            let ctx = DirCtx {
                geo,
                table,
                bcache,
                dev,
            };
            ctx.sector_lba(dir, sector_idx)?
        };
        let lba = match lba {
            Some(lba) => lba,
            None => break,
        };

        let buf = bcache.get(dev, lba)?;
        for index in 0..eps {
            let first = buf.data()[index * DIRENT_SIZE];
            if first == ENTRY_DELETED || first == super::layout::ENTRY_END {
                let _ = found.try_push(EntryLoc {
                    lba,
                    index: index as u16,
                });
                if found.len() == want {
                    return Ok(found);
                }
            } else {
                found.clear();
            }
        }
        sector_idx += 1;
    }

    // No run: extend chain directories by one zeroed cluster.
    let first_cluster = match *dir {
        DirLoc::Fixed { .. } => return Err(KernelError::NoSpace),
        DirLoc::Chain { first_cluster } => first_cluster,
    };
    let tail = {
        let len = table.chain_len(first_cluster)?;
        table
            .cluster_at(first_cluster, len.saturating_sub(1))?
            .ok_or(KernelError::Io)?
    };
    let fresh = table.alloc(bcache, dev, Some(tail))?;
    let base_lba = geo.cluster_lba(fresh);
    for s in 0..geo.sectors_per_cluster {
        let mut buf = bcache.get_clear(dev, base_lba + s)?;
        buf.mark_dirty();
    }

    // The previous partial run may continue into the new cluster.
    let mut lba = base_lba;
    let mut index = 0u16;
    while found.len() < want {
        let _ = found.try_push(EntryLoc { lba, index });
        index += 1;
        if index as usize == eps {
            index = 0;
            lba += 1;
        }
    }
    Ok(found)
}
