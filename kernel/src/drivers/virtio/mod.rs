//! Virtio subsystem: modern PCI transport and the block driver.
//!
//! The device this kernel targets is QEMU's transitional virtio-blk-pci
//! function (vendor 0x1AF4, device 0x1001) driven through the modern
//! capability-based interface: the PCI capability chain names four config
//! windows (common, notify, ISR, device-specific) as `(bar, offset)` pairs,
//! and the driver talks to them as MMIO.
//!
//! ```text
//!   pci::collect_virtio_caps  ->  VirtioPciTransport  ->  VirtQueue
//!                                        |
//!                                        +-- blk::VirtioBlk (one queue,
//!                                            synchronous, polled)
//! ```

pub mod blk;
pub mod queue;

/// Virtio vendor ID (Red Hat, Inc.)
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Transitional virtio-blk PCI device ID.
pub const VIRTIO_BLK_DEVICE_ID: u16 = 0x1001;

/// Device status bits (virtio spec 2.1), set in strict handshake order:
/// ACKNOWLEDGE, DRIVER, FEATURES_OK, then DRIVER_OK after queue setup.
pub mod device_status {
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    pub const FAILED: u8 = 128;
}

/// Feature bits the driver negotiates. VERSION_1 is mandatory when driving
/// a transitional device through the modern interface.
pub mod features {
    pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
}

/// Common configuration window layout (virtio spec 4.1.4.3).
#[repr(C)]
pub struct VirtioCommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_driver: u64,
    pub queue_device: u64,
}

/// Modern PCI transport: pointers into the MMIO windows described by the
/// capability chain.
pub struct VirtioPciTransport {
    common: *mut VirtioCommonCfg,
    notify_base: u64,
    notify_off_multiplier: u32,
    #[allow(dead_code)] // Read clears interrupt state; kept for completeness
    isr: *mut u8,
}

// SAFETY: the raw pointers reference device MMIO windows that exist for
// the kernel's lifetime; access is serialized by the Mutex around the
// owning VirtioBlk.
unsafe impl Send for VirtioPciTransport {}

macro_rules! common_field {
    ($self:ident, $field:ident) => {
        // SAFETY: `common` points at the device's common config window,
        // mapped uncacheable at probe time; volatile access is required
        // for MMIO.
        unsafe { core::ptr::addr_of_mut!((*$self.common).$field) }
    };
}

impl VirtioPciTransport {
    /// Reset the device (status = 0).
    pub fn reset(&self) {
        // SAFETY: see common_field; writing 0 is the architected reset.
        unsafe { common_field!(self, device_status).write_volatile(0) };
    }

    pub fn read_status(&self) -> u8 {
        // SAFETY: see common_field.
        unsafe { common_field!(self, device_status).read_volatile() }
    }

    /// OR another bit into device_status, preserving the handshake order.
    pub fn add_status(&self, bit: u8) {
        let status = self.read_status();
        // SAFETY: see common_field.
        unsafe { common_field!(self, device_status).write_volatile(status | bit) };
    }

    pub fn read_device_features(&self) -> u64 {
        // SAFETY: see common_field; select chooses which 32-bit half the
        // feature window shows.
        unsafe {
            common_field!(self, device_feature_select).write_volatile(0);
            let low = common_field!(self, device_feature).read_volatile() as u64;
            common_field!(self, device_feature_select).write_volatile(1);
            let high = common_field!(self, device_feature).read_volatile() as u64;
            low | (high << 32)
        }
    }

    pub fn write_driver_features(&self, features: u64) {
        // SAFETY: see common_field.
        unsafe {
            common_field!(self, driver_feature_select).write_volatile(0);
            common_field!(self, driver_feature).write_volatile(features as u32);
            common_field!(self, driver_feature_select).write_volatile(1);
            common_field!(self, driver_feature).write_volatile((features >> 32) as u32);
        }
    }

    pub fn select_queue(&self, index: u16) {
        // SAFETY: see common_field.
        unsafe { common_field!(self, queue_select).write_volatile(index) };
    }

    /// Size of the currently selected queue.
    pub fn queue_size(&self) -> u16 {
        // SAFETY: see common_field.
        unsafe { common_field!(self, queue_size).read_volatile() }
    }

    /// Shrink the selected queue to the ring size the driver allocated.
    pub fn set_queue_size(&self, size: u16) {
        // SAFETY: see common_field.
        unsafe { common_field!(self, queue_size).write_volatile(size) };
    }

    /// Program the ring addresses of the selected queue.
    pub fn set_queue_rings(&self, desc: u64, driver: u64, device: u64) {
        // SAFETY: see common_field; the addresses are physical bases of
        // rings the caller owns for the device's lifetime.
        unsafe {
            common_field!(self, queue_desc).write_volatile(desc);
            common_field!(self, queue_driver).write_volatile(driver);
            common_field!(self, queue_device).write_volatile(device);
        }
    }

    pub fn enable_queue(&self) {
        // SAFETY: see common_field.
        unsafe { common_field!(self, queue_enable).write_volatile(1) };
    }

    /// Doorbell address for the selected queue:
    /// `notify_base + queue_notify_off * notify_off_multiplier`.
    pub fn notify_ptr(&self) -> *mut u16 {
        // SAFETY: see common_field.
        let off = unsafe { common_field!(self, queue_notify_off).read_volatile() };
        (self.notify_base + off as u64 * self.notify_off_multiplier as u64) as *mut u16
    }
}

/// Discover the virtio-blk function, enable it, and materialize its config
/// windows. Returns `None` when no device is present.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn probe() -> Option<VirtioPciTransport> {
    use crate::{drivers::pci, mm::paging::EntryFlags};

    let addr = pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_BLK_DEVICE_ID)?;
    pci::enable_device(addr);

    let caps = pci::collect_virtio_caps(|off| {
        (pci::config_read32(addr, off & 0xFC) >> ((off & 3) * 8)) as u8
    });
    let common = caps.common?;
    let notify = caps.notify?;

    let mut window = |cap: crate::drivers::pci::VirtioCap| -> u64 {
        let bar = pci::read_bar(addr, cap.bar);
        let base = bar + cap.offset as u64;
        // Identity-map the MMIO window; BARs live above the boot identity
        // map. Uncacheable, kernel-only.
        let first = base & !0xFFF;
        let last = (base + cap.length.max(4) as u64 - 1) & !0xFFF;
        let mut page = first;
        while page <= last {
            let _ = crate::mm::vmm::map(
                page,
                page,
                EntryFlags::WRITABLE | EntryFlags::NO_CACHE,
            );
            page += 4096;
        }
        base
    };

    let common_base = window(common);
    let notify_base = window(notify);
    let isr_base = caps.isr.map(&mut window).unwrap_or(0);

    log::info!(
        "virtio-blk at {:02x}:{:02x}.0, common={:#x} notify={:#x} (x{})",
        addr.bus,
        addr.slot,
        common_base,
        notify_base,
        caps.notify_off_multiplier
    );

    Some(VirtioPciTransport {
        common: common_base as *mut VirtioCommonCfg,
        notify_base,
        notify_off_multiplier: caps.notify_off_multiplier,
        isr: isr_base as *mut u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_cfg_layout() {
        // The device decodes these offsets; the struct must match the
        // virtio spec exactly.
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, device_status), 20);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_select), 22);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_size), 24);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_enable), 28);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_notify_off), 30);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_desc), 32);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_driver), 40);
        assert_eq!(core::mem::offset_of!(VirtioCommonCfg, queue_device), 48);
        assert_eq!(core::mem::size_of::<VirtioCommonCfg>(), 56);
    }
}
