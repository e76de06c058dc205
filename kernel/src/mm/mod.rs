//! Memory management: physical frames, page tables, the mmap-style region
//! allocator, and the kernel heap.
//!
//! The kernel adopts the boot-installed page hierarchy as its sole address
//! space; user and kernel mappings share it, distinguished only by the USER
//! flag. Low physical memory is identity-mapped by the boot trampoline,
//! which is what lets the page-table code mutate tables through their
//! physical addresses.

pub mod heap;
pub mod paging;
pub mod pmm;
pub mod vmm;

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Initialize memory management: adopt the boot page tables, then carve the
/// kernel heap out of the PMM.
pub fn init() {
    vmm::init(current_root());
    heap::init();
    log::info!(
        "mm: pmm [{:#x}, {:#x}), mmap base {:#x}",
        pmm::RAM_BASE,
        pmm::RAM_END,
        vmm::MMAP_BASE
    );
}

/// Physical address of the active PML4.
fn current_root() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::registers::control::Cr3;
        Cr3::read().0.start_address().as_u64()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
