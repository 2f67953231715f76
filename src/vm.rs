//! User address spaces.
//!
//! An `AddressSpace` records the memory regions a process may touch and
//! owns the frames backing them; installing translations is delegated to
//! the memory core collaborator through `PageDir`. Teardown order
//! matters: frames are unmapped and released before the page directory,
//! because the directory is live until the task is unscheduled.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{KernelError, Result};
use crate::kalloc::PhysPages;
use crate::param::{KERNBASE, PGSIZE, USTACKPAGES, USTACKTOP};

bitflags! {
    /// Access allowed on a memory region.
    pub struct RegionPerm: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Page table entry bits handed to the paging collaborator.
    pub struct PteFlags: u32 {
        const PRESENT = 0x1;
        const WRITABLE = 0x2;
        const USER = 0x4;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    Code,
    Data,
    Heap,
    Stack,
}

/// One contiguous user mapping.
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    pub start: usize,
    pub len: usize,
    pub perm: RegionPerm,
    pub kind: RegionKind,
}

impl MemRegion {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, va: usize) -> bool {
        va >= self.start && va < self.end()
    }
}

#[cfg(all(not(test), target_arch = "x86"))]
extern "C" {
    fn paging_new_directory() -> usize;
    fn paging_free_directory(pd: usize);
    fn paging_map(pd: usize, va: usize, pa: usize, flags: u32) -> i32;
    fn paging_unmap(pd: usize, va: usize);
}

/// Handle to one hardware page directory, owned by the address space.
/// Off the i686 kernel build there is no hardware to program and the
/// handle is inert.
pub struct PageDir {
    #[cfg(all(not(test), target_arch = "x86"))]
    pd: usize,
    #[cfg(any(test, not(target_arch = "x86")))]
    _priv: (),
}

impl PageDir {
    pub fn new() -> Result<Self> {
        #[cfg(any(test, not(target_arch = "x86")))]
        {
            Ok(Self { _priv: () })
        }
        #[cfg(all(not(test), target_arch = "x86"))]
        {
            // SAFETY: the collaborator returns 0 or a directory we own.
            let pd = unsafe { paging_new_directory() };
            if pd == 0 {
                return Err(KernelError::OutOfMemory);
            }
            Ok(Self { pd })
        }
    }

    /// Physical address loaded into CR3 when the owning task runs.
    pub fn phys(&self) -> usize {
        #[cfg(any(test, not(target_arch = "x86")))]
        {
            0
        }
        #[cfg(all(not(test), target_arch = "x86"))]
        {
            self.pd
        }
    }

    fn map(&self, va: usize, pa: usize, flags: PteFlags) -> Result<()> {
        #[cfg(any(test, not(target_arch = "x86")))]
        {
            let _ = (va, pa, flags);
            Ok(())
        }
        #[cfg(all(not(test), target_arch = "x86"))]
        {
            // SAFETY: we own the directory; the collaborator validates va.
            if unsafe { paging_map(self.pd, va, pa, flags.bits()) } != 0 {
                return Err(KernelError::OutOfMemory);
            }
            Ok(())
        }
    }

    fn unmap(&self, va: usize) {
        #[cfg(any(test, not(target_arch = "x86")))]
        {
            let _ = va;
        }
        #[cfg(all(not(test), target_arch = "x86"))]
        {
            // SAFETY: we own the directory.
            unsafe { paging_unmap(self.pd, va) };
        }
    }
}

#[cfg(all(not(test), target_arch = "x86"))]
impl Drop for PageDir {
    fn drop(&mut self) {
        // SAFETY: the directory was handed out by `paging_new_directory`
        // and every user mapping has been removed by `AddressSpace::drop`.
        unsafe { paging_free_directory(self.pd) };
    }
}

/// A process's view of memory.
///
/// Field order is the teardown order: frames (with their translations)
/// go before the directory.
pub struct AddressSpace {
    /// Backing frames keyed by user page address.
    frames: BTreeMap<usize, PhysPages>,
    regions: Vec<MemRegion>,
    page_dir: PageDir,
}

impl AddressSpace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            frames: BTreeMap::new(),
            regions: Vec::new(),
            page_dir: PageDir::new()?,
        })
    }

    pub fn page_dir_phys(&self) -> usize {
        self.page_dir.phys()
    }

    pub fn regions(&self) -> &[MemRegion] {
        &self.regions
    }

    /// Declares a region without mapping any of it. `start` must be page
    /// aligned and the whole range strictly below the kernel split.
    pub fn add_region(
        &mut self,
        start: usize,
        len: usize,
        perm: RegionPerm,
        kind: RegionKind,
    ) -> Result<()> {
        if start % PGSIZE != 0 || len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = start.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if end > KERNBASE {
            return Err(KernelError::InvalidArgument);
        }
        if self
            .regions
            .iter()
            .any(|r| start < r.end() && r.start < end)
        {
            return Err(KernelError::InvalidArgument);
        }
        self.regions.push(MemRegion {
            start,
            len,
            perm,
            kind,
        });
        Ok(())
    }

    /// Maps one anonymous zero frame at `va_page`.
    pub fn map_page(&mut self, va_page: usize) -> Result<()> {
        assert_eq!(va_page % PGSIZE, 0);
        if self.frames.contains_key(&va_page) {
            return Ok(());
        }
        let perm = self
            .region_containing(va_page)
            .ok_or(KernelError::BadAddress)?
            .perm;
        let frame = PhysPages::alloc_one()?;
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if perm.contains(RegionPerm::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        self.page_dir.map(va_page, frame.pa(), flags)?;
        let _ = self.frames.insert(va_page, frame);
        Ok(())
    }

    /// Adds a region and eagerly maps it, seeding it with `data` when
    /// given. Used by exec to lay out the image.
    pub fn populate(
        &mut self,
        start: usize,
        len: usize,
        perm: RegionPerm,
        kind: RegionKind,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let len = (len + PGSIZE - 1) / PGSIZE * PGSIZE;
        self.add_region(start, len, perm, kind)?;
        let mut va = start;
        while va < start + len {
            self.map_page(va)?;
            va += PGSIZE;
        }
        if let Some(data) = data {
            self.write_bytes(start, data)?;
        }
        Ok(())
    }

    /// Reserves the user stack just below the kernel split and maps its
    /// top page. The rest of the reservation fills in on demand.
    pub fn setup_stack(&mut self) -> Result<usize> {
        let base = USTACKTOP - USTACKPAGES * PGSIZE;
        self.add_region(
            base,
            USTACKPAGES * PGSIZE,
            RegionPerm::READ | RegionPerm::WRITE,
            RegionKind::Stack,
        )?;
        self.map_page(USTACKTOP - PGSIZE)?;
        Ok(USTACKTOP)
    }

    pub fn region_containing(&self, va: usize) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(va))
    }

    /// Whether `[ptr, ptr + n)` lies strictly below the kernel split and
    /// inside declared regions with the requested access.
    pub fn check_range(&self, ptr: usize, n: usize, write: bool) -> bool {
        if n == 0 {
            return ptr < KERNBASE;
        }
        let end = match ptr.checked_add(n) {
            Some(e) if e <= KERNBASE => e,
            _ => return false,
        };
        let mut va = ptr;
        while va < end {
            match self.region_containing(va) {
                Some(r) if !write || r.perm.contains(RegionPerm::WRITE) => {
                    va = r.end();
                }
                _ => return false,
            }
        }
        true
    }

    /// The frame backing `va`, if mapped, with the offset inside it.
    pub fn frame_of(&self, va: usize) -> Option<(&PhysPages, usize)> {
        let page = va / PGSIZE * PGSIZE;
        self.frames.get(&page).map(|f| (f, va - page))
    }

    pub fn frame_of_mut(&mut self, va: usize) -> Option<(&mut PhysPages, usize)> {
        let page = va / PGSIZE * PGSIZE;
        self.frames.get_mut(&page).map(|f| (f, va - page))
    }

    /// Copies bytes out of the address space. Fails with `BadAddress` on
    /// an unmapped page; the caller decides whether that is a fault.
    pub fn read_bytes(&self, mut va: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (frame, off) = self.frame_of(va).ok_or(KernelError::BadAddress)?;
            let n = (PGSIZE - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&frame.as_slice()[off..off + n]);
            done += n;
            va += n;
        }
        Ok(())
    }

    /// Copies bytes into the address space.
    pub fn write_bytes(&mut self, mut va: usize, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (frame, off) = self.frame_of_mut(va).ok_or(KernelError::BadAddress)?;
            let n = (PGSIZE - off).min(buf.len() - done);
            frame.as_mut_slice()[off..off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            va += n;
        }
        Ok(())
    }

    /// Handles a fault at `va` by mapping a page, but only inside the
    /// stack reservation.
    pub fn grow_stack(&mut self, va: usize) -> Result<()> {
        match self.region_containing(va) {
            Some(r) if r.kind == RegionKind::Stack => self.map_page(va / PGSIZE * PGSIZE),
            _ => Err(KernelError::BadAddress),
        }
    }

    /// Duplicates the regions and every mapped frame for fork.
    pub fn clone_for_fork(&self) -> Result<Self> {
        let mut child = Self::new()?;
        child.regions = self.regions.clone();
        for (&va, frame) in &self.frames {
            let perm = child
                .region_containing(va)
                .map(|r| r.perm)
                .unwrap_or(RegionPerm::READ | RegionPerm::WRITE);
            let mut copy = PhysPages::alloc_one()?;
            copy.as_mut_slice().copy_from_slice(frame.as_slice());
            let mut flags = PteFlags::PRESENT | PteFlags::USER;
            if perm.contains(RegionPerm::WRITE) {
                flags |= PteFlags::WRITABLE;
            }
            child.page_dir.map(va, copy.pa(), flags)?;
            let _ = child.frames.insert(va, copy);
        }
        Ok(child)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Remove every translation while the directory is still valid;
        // the field order then frees frames before the directory itself.
        for &va in self.frames.keys() {
            self.page_dir.unmap(va);
        }
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with_data() -> AddressSpace {
        let mut aspace = AddressSpace::new().unwrap();
        aspace
            .populate(
                0x40_0000,
                2 * PGSIZE,
                RegionPerm::READ | RegionPerm::WRITE,
                RegionKind::Data,
                None,
            )
            .unwrap();
        aspace
    }

    #[test]
    fn ranges_crossing_the_kernel_split_are_rejected() {
        let mut aspace = space_with_data();
        aspace.setup_stack().unwrap();
        assert!(!aspace.check_range(KERNBASE - 8, 64, false));
        assert!(!aspace.check_range(KERNBASE, 4, false));
        assert!(aspace.check_range(USTACKTOP - 64, 64, true));
    }

    #[test]
    fn check_range_follows_region_permissions() {
        let aspace = space_with_data();
        assert!(aspace.check_range(0x40_0000, 2 * PGSIZE, true));
        assert!(!aspace.check_range(0x40_0000, 2 * PGSIZE + 1, false));
        assert!(!aspace.check_range(0x10_0000, 16, false));
    }

    #[test]
    fn bytes_round_trip_across_page_boundaries() {
        let mut aspace = space_with_data();
        let va = 0x40_0000 + PGSIZE - 3;
        aspace.write_bytes(va, b"abcdef").unwrap();
        let mut out = [0u8; 6];
        aspace.read_bytes(va, &mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn stack_grows_only_inside_its_reservation() {
        let mut aspace = AddressSpace::new().unwrap();
        let top = aspace.setup_stack().unwrap();
        let in_reserve = top - USTACKPAGES * PGSIZE;
        assert!(aspace.frame_of(in_reserve).is_none());
        aspace.grow_stack(in_reserve + 5).unwrap();
        assert!(aspace.frame_of(in_reserve).is_some());
        assert_eq!(
            aspace.grow_stack(in_reserve - PGSIZE),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn fork_copies_frames_not_aliases() {
        let mut parent = space_with_data();
        parent.write_bytes(0x40_0000, b"parent").unwrap();
        let mut child = parent.clone_for_fork().unwrap();
        child.write_bytes(0x40_0000, b"child!").unwrap();
        let mut out = [0u8; 6];
        parent.read_bytes(0x40_0000, &mut out).unwrap();
        assert_eq!(&out, b"parent");
    }
}
