//! Kernel heap.
//!
//! A fixed-size linked-list heap carved out of the PMM at boot. The heap
//! only stages transient data -- file contents pulled off the block device
//! for the loader, format buffers -- so 8 MiB is generous.

use super::pmm;

/// Heap size in bytes.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Carve the heap out of the PMM and hand it to the global allocator.
/// Failure is a boot-time invariant violation: report and park.
pub fn init() {
    let frames = HEAP_SIZE / pmm::FRAME_SIZE;
    let base = match pmm::allocate_frames(frames) {
        Some(base) => base,
        None => {
            println!("FATAL: cannot reserve {} bytes for the kernel heap", HEAP_SIZE);
            crate::arch::halt();
        }
    };

    #[cfg(target_os = "none")]
    // SAFETY: [base, base + HEAP_SIZE) was just reserved from the PMM,
    // is identity-mapped, and is handed to the allocator exactly once.
    unsafe {
        crate::allocator().lock().init(base as *mut u8, HEAP_SIZE);
    }
    #[cfg(not(target_os = "none"))]
    let _ = base;

    log::debug!("heap: {} KiB at {:#x}", HEAP_SIZE / 1024, base);
}
