//! Virtual-memory manager: the shared address space and its mmap-shaped
//! region allocator.
//!
//! There is exactly one address space, rooted at the boot-installed PML4.
//! `mmap` hands out fresh anonymous (optionally file-filled) user memory
//! from a watermark starting at 1 GiB and records each region in a fixed
//! table for diagnostics. Nothing is ever unmapped.

use spin::{Mutex, Once};

use super::{
    align_up,
    paging::{EntryFlags, MapError, Mapper, PageTable, TableFrames},
    pmm, PAGE_SIZE,
};
use crate::error::KernelError;

/// Base of the watermark used when `mmap` is asked to pick an address.
pub const MMAP_BASE: u64 = 0x4000_0000;

/// Capacity of the region bookkeeping table.
pub const MAX_REGIONS: usize = 64;

/// Bookkeeping record for one mmap'd region. Diagnostics only; no munmap
/// exists to consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub len: u64,
    pub flags: u64,
    pub fd: i32,
    pub offset: u64,
}

/// The single shared address space.
pub struct AddressSpace {
    root: u64,
    next_mmap: u64,
    regions: [Option<Region>; MAX_REGIONS],
}

impl AddressSpace {
    pub const fn new(root: u64) -> Self {
        Self {
            root,
            next_mmap: MMAP_BASE,
            regions: [None; MAX_REGIONS],
        }
    }

    /// Choose the base for an mmap request: an explicit address wins,
    /// otherwise the watermark advances by the page-rounded length.
    pub fn pick_base(&mut self, addr: u64, len: u64) -> u64 {
        if addr != 0 {
            return addr;
        }
        let base = self.next_mmap;
        self.next_mmap += align_up(len, PAGE_SIZE as u64);
        base
    }

    /// Append to the first empty slot; overflow drops the record silently
    /// (the mapping itself still exists).
    pub fn record(&mut self, region: Region) {
        if let Some(slot) = self.regions.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(region);
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().flatten()
    }
}

static VMM: Once<Mutex<AddressSpace>> = Once::new();

/// Adopt the boot page hierarchy rooted at `root` as the kernel's single
/// address space.
pub fn init(root: u64) {
    VMM.call_once(|| Mutex::new(AddressSpace::new(root)));
}

fn with_vmm<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> R {
    let vmm = VMM.get().expect("vmm used before init");
    f(&mut vmm.lock())
}

/// Table source for real hardware: frames come from the PMM (pre-zeroed)
/// and tables are reachable through the identity map.
struct IdentityFrames;

impl TableFrames for IdentityFrames {
    fn alloc_table(&mut self) -> Option<u64> {
        pmm::allocate_frame()
    }

    fn table_mut(&mut self, phys: u64) -> *mut PageTable {
        phys as *mut PageTable
    }
}

/// Install a single 4 KiB mapping in the shared address space.
pub fn map(virt: u64, phys: u64, flags: EntryFlags) -> Result<(), KernelError> {
    let root = with_vmm(|vmm| vmm.root);
    let mut frames = IdentityFrames;
    Mapper::new(root, &mut frames)
        .map(virt, phys, flags)
        .map_err(|MapError::OutOfFrames| KernelError::MapFailed { virt })
}

/// Resolve a virtual address against the shared address space.
pub fn translate(virt: u64) -> Option<(u64, EntryFlags)> {
    let root = with_vmm(|vmm| vmm.root);
    let mut frames = IdentityFrames;
    Mapper::new(root, &mut frames).translate(virt)
}

/// File contents to copy into a fresh mapping.
#[derive(Debug, Clone, Copy)]
pub struct FileFill {
    pub fd: i32,
    pub offset: u64,
}

/// mmap-shaped allocation: map `len` bytes at `addr` (or at the watermark
/// when `addr` is 0) as present | writable | user, optionally filling the
/// region from an open file.
///
/// Returns the chosen base. A frame-allocation failure part-way leaves the
/// partial mapping in place -- acceptable for this kernel's one-shot
/// lifecycle, and the caller treats the error as fatal anyway.
pub fn mmap(
    addr: u64,
    len: u64,
    flags: EntryFlags,
    fill: Option<FileFill>,
) -> Result<u64, KernelError> {
    if len == 0 {
        return Err(KernelError::InvalidArgument { name: "len" });
    }

    let base = with_vmm(|vmm| {
        let base = vmm.pick_base(addr, len);
        vmm.record(Region {
            base,
            len,
            flags: flags.bits(),
            fd: fill.map_or(-1, |f| f.fd),
            offset: fill.map_or(0, |f| f.offset),
        });
        base
    });

    let pages = align_up(len, PAGE_SIZE as u64) / PAGE_SIZE as u64;
    let leaf_flags = flags | EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
    for i in 0..pages {
        let frame = pmm::allocate_frame().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        map(base + i * PAGE_SIZE as u64, frame, leaf_flags)?;
    }

    if let Some(fill) = fill {
        // SAFETY: the whole of [base, base+len) was just mapped writable in
        // the one shared address space, so the region is dereferenceable
        // from kernel mode.
        let dst = unsafe { core::slice::from_raw_parts_mut(base as *mut u8, len as usize) };
        crate::fs::read_at(fill.fd, fill.offset, dst).map_err(|_| KernelError::MapFailed {
            virt: base,
        })?;
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_base_watermark() {
        let mut space = AddressSpace::new(0);
        let a = space.pick_base(0, 0x1000);
        let b = space.pick_base(0, 0x800);
        let c = space.pick_base(0, 0x1800);
        assert_eq!(a, MMAP_BASE);
        assert_eq!(b, MMAP_BASE + 0x1000);
        assert_eq!(c, MMAP_BASE + 0x2000);
    }

    #[test]
    fn test_pick_base_honors_fixed_addr() {
        let mut space = AddressSpace::new(0);
        assert_eq!(space.pick_base(0x2000_0000, 0x1000), 0x2000_0000);
        // The watermark did not advance.
        assert_eq!(space.pick_base(0, 0x1000), MMAP_BASE);
    }

    #[test]
    fn test_region_table_overflow_drops_silently() {
        let mut space = AddressSpace::new(0);
        for i in 0..(MAX_REGIONS + 8) as u64 {
            space.record(Region {
                base: i * 0x1000,
                len: 0x1000,
                flags: 7,
                fd: -1,
                offset: 0,
            });
        }
        assert_eq!(space.regions().count(), MAX_REGIONS);
        assert_eq!(space.regions().next().unwrap().base, 0);
    }
}
