//! Split virtqueue.
//!
//! One contiguous physical allocation holds the three ring components --
//! descriptor table, available ring, used ring -- with each component
//! individually 4 KiB-aligned. The block driver drives a single queue
//! synchronously and reuses a fixed three-descriptor chain, so there is no
//! free-list management here: just the ring discipline and its fences.

use core::sync::atomic::{fence, Ordering};

use crate::{
    error::KernelError,
    mm::{align_up, pmm},
};

/// Largest queue size this driver will program. The device may report
/// more; the virtio spec lets the driver shrink the queue to the ring it
/// actually allocates.
pub const MAX_QUEUE_SIZE: u16 = 128;

/// Descriptor flag: chain continues via `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor flag: buffer is device-writable.
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// Byte layout of one queue allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Descriptor table offset (always 0).
    pub desc_offset: usize,
    pub avail_offset: usize,
    pub used_offset: usize,
    pub total_size: usize,
    pub frames: usize,
}

/// Compute the layout for a queue of `size` entries: descriptors at the
/// base, available ring and used ring each rounded up to a page boundary.
pub fn layout(size: u16) -> QueueLayout {
    let desc_size = 16 * size as usize;
    let avail_size = 6 + 2 * size as usize;
    let used_size = 6 + 8 * size as usize;

    let avail_offset = align_up(desc_size as u64, 4096) as usize;
    let used_offset = align_up((avail_offset + avail_size) as u64, 4096) as usize;
    let total_size = used_offset + used_size;
    QueueLayout {
        desc_offset: 0,
        avail_offset,
        used_offset,
        total_size,
        frames: total_size.div_ceil(pmm::FRAME_SIZE),
    }
}

/// A split virtqueue in identity-mapped physical memory.
pub struct VirtQueue {
    size: u16,
    phys_base: u64,
    layout: QueueLayout,
    desc: *mut VirtqDesc,
    /// Available ring: u16 flags, u16 idx, then `size` u16 ring slots.
    avail: *mut u16,
    /// Used ring: u16 flags, u16 idx, then `size` (u32 id, u32 len) pairs.
    used: *mut u16,
    last_used_idx: u16,
}

// SAFETY: the ring memory is owned exclusively by this queue for the
// kernel's lifetime; access is serialized by the Mutex around the owning
// block device.
unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Allocate and zero the ring memory for a queue of `size` entries.
    pub fn new(size: u16) -> Result<Self, KernelError> {
        let layout = layout(size);
        let phys_base = pmm::allocate_frames(layout.frames).ok_or(KernelError::OutOfMemory {
            requested: layout.total_size,
        })?;

        Ok(Self {
            size,
            phys_base,
            layout,
            desc: phys_base as *mut VirtqDesc,
            avail: (phys_base + layout.avail_offset as u64) as *mut u16,
            used: (phys_base + layout.used_offset as u64) as *mut u16,
            last_used_idx: 0,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn phys_desc(&self) -> u64 {
        self.phys_base
    }

    pub fn phys_avail(&self) -> u64 {
        self.phys_base + self.layout.avail_offset as u64
    }

    pub fn phys_used(&self) -> u64 {
        self.phys_base + self.layout.used_offset as u64
    }

    /// Fill descriptor `index`.
    ///
    /// # Safety
    /// `index < size`, and `addr..addr+len` must stay valid physical memory
    /// until the device returns the chain through the used ring.
    pub unsafe fn write_desc(&mut self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        debug_assert!(index < self.size);
        // SAFETY: index is in bounds (asserted); the table belongs to this
        // queue.
        unsafe {
            self.desc.add(index as usize).write_volatile(VirtqDesc {
                addr,
                len,
                flags,
                next,
            });
        }
    }

    /// Publish a chain head in the available ring and advance `avail.idx`.
    /// A release fence orders the descriptor writes before the index bump;
    /// the caller rings the doorbell afterwards.
    pub fn push_avail(&mut self, head: u16) {
        // SAFETY: the available ring belongs to this queue; slot index is
        // reduced mod size.
        unsafe {
            let idx = self.avail.add(1).read_volatile();
            let slot = 2 + (idx % self.size) as usize;
            self.avail.add(slot).write_volatile(head);
            fence(Ordering::Release);
            self.avail.add(1).write_volatile(idx.wrapping_add(1));
        }
    }

    /// Poll the used ring once. Returns the completed chain head if the
    /// device has advanced `used.idx` past what we have consumed.
    pub fn poll_used(&mut self) -> Option<u16> {
        fence(Ordering::Acquire);
        // SAFETY: the used ring belongs to this queue; the element index is
        // reduced mod size.
        unsafe {
            let device_idx = self.used.add(1).read_volatile();
            if device_idx == self.last_used_idx {
                return None;
            }
            let slot = (self.last_used_idx % self.size) as usize;
            let elem = (self.used.add(2) as *const u32).add(slot * 2).read_volatile();
            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            Some(elem as u16)
        }
    }

    /// Used-ring index we have consumed up to (diagnostics).
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_components_page_aligned() {
        for size in [8u16, 64, 128] {
            let l = layout(size);
            assert_eq!(l.desc_offset, 0);
            assert_eq!(l.avail_offset % 4096, 0);
            assert_eq!(l.used_offset % 4096, 0);
            assert!(l.avail_offset >= 16 * size as usize);
            assert!(l.used_offset >= l.avail_offset + 6 + 2 * size as usize);
            assert_eq!(l.frames, l.total_size.div_ceil(4096));
        }
    }

    #[test]
    fn test_layout_queue_64() {
        // 64 descriptors = 1024 bytes, so the three components land on the
        // first three pages.
        let l = layout(64);
        assert_eq!(l.avail_offset, 4096);
        assert_eq!(l.used_offset, 8192);
        assert_eq!(l.total_size, 8192 + 6 + 8 * 64);
        assert_eq!(l.frames, 3);
    }

    #[test]
    fn test_desc_entry_is_16_bytes() {
        assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);
    }
}
