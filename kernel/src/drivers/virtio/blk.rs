//! Virtio-blk device driver.
//!
//! Synchronous, polled, strictly one request in flight. Every read is the
//! canonical three-descriptor chain at fixed indices 0/1/2:
//!
//! 1. header (device-readable): request type + sector
//! 2. data (device-writable): `count * 512` bytes into the caller's buffer
//! 3. status (device-writable): one byte, 0 = OK
//!
//! The caller's buffer must be identity-mapped (kernel stack, heap, or PMM
//! memory) because its address goes to the device as a physical address.
//!
//! # QEMU usage
//!
//! ```text
//! -drive file=disk.img,if=none,id=vd0,format=raw -device virtio-blk-pci,drive=vd0
//! ```

use core::sync::atomic::{fence, Ordering};

use spin::{Mutex, Once};

use super::{
    device_status, features,
    queue::{VirtQueue, MAX_QUEUE_SIZE, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE},
    VirtioPciTransport,
};
use crate::{error::KernelError, mm::pmm};

/// Sector size: virtio-blk always addresses 512-byte units.
pub const SECTOR_SIZE: usize = 512;

/// Read request type (virtio spec 5.2.6).
const VIRTIO_BLK_T_IN: u32 = 0;

/// Completion-poll bound. At QEMU speeds a sector read completes in well
/// under a millionth of this.
const POLL_LIMIT: u32 = 10_000_000;

/// Request header, the first descriptor of every chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtioBlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// Offset of the status byte inside the DMA frame (header occupies 0..16).
const STATUS_OFFSET: u64 = 16;

/// The block device: transport, its single queue, and one DMA frame that
/// holds the request header and the status byte for the in-flight request.
pub struct VirtioBlk {
    #[allow(dead_code)] // Handshake state lives here; kept for reset paths
    transport: VirtioPciTransport,
    queue: VirtQueue,
    notify: *mut u16,
    dma: u64,
}

// SAFETY: `notify` points at device MMIO and `dma` at an owned PMM frame,
// both valid for the kernel's lifetime; the global wraps the device in a
// Mutex.
unsafe impl Send for VirtioBlk {}

static BLOCK: Once<Mutex<VirtioBlk>> = Once::new();

impl VirtioBlk {
    /// Run the virtio initialization handshake and set up queue 0.
    ///
    /// Status bits go in in strict order: reset, ACKNOWLEDGE, DRIVER,
    /// (feature negotiation), FEATURES_OK, queue programming, DRIVER_OK.
    fn new(transport: VirtioPciTransport) -> Result<Self, KernelError> {
        transport.reset();
        transport.add_status(device_status::ACKNOWLEDGE);
        transport.add_status(device_status::DRIVER);

        let device_features = transport.read_device_features();
        if device_features & features::VIRTIO_F_VERSION_1 == 0 {
            transport.add_status(device_status::FAILED);
            return Err(KernelError::DeviceError {
                device: "virtio-blk",
                code: 0,
            });
        }
        transport.write_driver_features(features::VIRTIO_F_VERSION_1);
        transport.add_status(device_status::FEATURES_OK);
        if transport.read_status() & device_status::FEATURES_OK == 0 {
            transport.add_status(device_status::FAILED);
            return Err(KernelError::DeviceError {
                device: "virtio-blk",
                code: transport.read_status(),
            });
        }

        transport.select_queue(0);
        let size = transport.queue_size().min(MAX_QUEUE_SIZE);
        if size == 0 {
            return Err(KernelError::DeviceError {
                device: "virtio-blk",
                code: 0,
            });
        }
        let queue = VirtQueue::new(size)?;
        transport.set_queue_size(size);
        transport.set_queue_rings(queue.phys_desc(), queue.phys_avail(), queue.phys_used());
        transport.enable_queue();
        let notify = transport.notify_ptr();

        transport.add_status(device_status::DRIVER_OK);

        let dma = pmm::allocate_frame().ok_or(KernelError::OutOfMemory {
            requested: pmm::FRAME_SIZE,
        })?;

        log::info!("virtio-blk: queue size {}", size);
        Ok(Self {
            transport,
            queue,
            notify,
            dma,
        })
    }

    /// Read `count` sectors starting at `sector` into `buf` and block until
    /// the device completes (bounded spin).
    pub fn read(&mut self, sector: u64, count: u16, buf: &mut [u8]) -> Result<(), KernelError> {
        let bytes = count as usize * SECTOR_SIZE;
        if count == 0 || buf.len() < bytes {
            return Err(KernelError::InvalidArgument { name: "count" });
        }

        let header = VirtioBlkReqHeader {
            type_: VIRTIO_BLK_T_IN,
            reserved: 0,
            sector,
        };
        // SAFETY: `dma` is an identity-mapped frame owned by this device;
        // the header fits in its first 16 bytes and the status byte sits at
        // STATUS_OFFSET. 0xFF lets us observe the device writing 0.
        unsafe {
            (self.dma as *mut VirtioBlkReqHeader).write_volatile(header);
            ((self.dma + STATUS_OFFSET) as *mut u8).write_volatile(0xFF);
        }

        // SAFETY: descriptors 0..2 exist in any queue we negotiate (size is
        // at least QEMU's minimum of 64 after clamping); the header/status
        // live in the DMA frame and `buf` is identity-mapped per this
        // driver's contract, all staying valid until completion below.
        unsafe {
            self.queue.write_desc(
                0,
                self.dma,
                core::mem::size_of::<VirtioBlkReqHeader>() as u32,
                VIRTQ_DESC_F_NEXT,
                1,
            );
            self.queue.write_desc(
                1,
                buf.as_mut_ptr() as u64,
                bytes as u32,
                VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
                2,
            );
            self.queue
                .write_desc(2, self.dma + STATUS_OFFSET, 1, VIRTQ_DESC_F_WRITE, 0);
        }

        self.queue.push_avail(0);
        // The index bump must be visible before the doorbell; the MMIO
        // write itself is ordered against it by the fence.
        fence(Ordering::SeqCst);
        // SAFETY: `notify` is the queue's doorbell in the notify window;
        // the value is the queue index.
        unsafe { self.notify.write_volatile(0) };

        let mut completed = false;
        for _ in 0..POLL_LIMIT {
            if self.queue.poll_used().is_some() {
                completed = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !completed {
            return Err(KernelError::DeviceTimeout {
                device: "virtio-blk",
            });
        }

        // SAFETY: the device has returned the chain, so the status byte is
        // final.
        let status = unsafe { ((self.dma + STATUS_OFFSET) as *const u8).read_volatile() };
        if status != 0 {
            return Err(KernelError::DeviceError {
                device: "virtio-blk",
                code: status,
            });
        }
        Ok(())
    }
}

/// Probe and initialize the block device. `Err` simply means no disk is
/// attached; the kernel then runs from the ramdisk alone.
pub fn init() -> Result<(), KernelError> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let transport = super::probe().ok_or(KernelError::DeviceNotFound {
            device: "virtio-blk",
        })?;
        let device = VirtioBlk::new(transport)?;
        BLOCK.call_once(|| Mutex::new(device));
        Ok(())
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        Err(KernelError::DeviceNotFound {
            device: "virtio-blk",
        })
    }
}

/// Whether a block device was successfully initialized.
pub fn is_available() -> bool {
    BLOCK.get().is_some()
}

/// Read sectors through the global device.
pub fn read_sectors(sector: u64, count: u16, buf: &mut [u8]) -> Result<(), KernelError> {
    let device = BLOCK.get().ok_or(KernelError::DeviceNotFound {
        device: "virtio-blk",
    })?;
    device.lock().read(sector, count, buf)
}
