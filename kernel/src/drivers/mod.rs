//! Device drivers: PCI discovery and the virtio block device.

pub mod pci;
pub mod virtio;

/// Probe the buses and bring up every device this kernel knows about --
/// which is exactly one: virtio-blk. Its absence is not an error; the
/// kernel can run entirely from the ramdisk.
pub fn init() {
    match virtio::blk::init() {
        Ok(()) => {
            crate::fs::mount_block_device();
        }
        Err(err) => log::info!("virtio-blk: not available ({})", err),
    }
}
