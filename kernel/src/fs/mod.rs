//! Virtual filesystem: CPIO-backed, read-only, flat.
//!
//! Two mounts feed one vnode table: the Multiboot ramdisk (file data stays
//! resident in RAM) and, when a virtio disk is attached, a CPIO archive
//! read straight off its sectors (file data stays on disk and is pulled
//! 512 bytes at a time). Synthetic `dev/random` / `dev/urandom` nodes are
//! injected at init.
//!
//! File descriptors are small integers >= 3 into a fixed table pairing a
//! vnode index with a byte offset; 0/1/2 are stdin/stdout/stderr, the
//! latter two backed by the serial console in the syscall layer.

pub mod cpio;
pub mod vnode;

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::KernelError;
pub use vnode::{Backing, VNodeKind};
use vnode::{normalize, VnodeTable};

/// Size of the fd table.
pub const MAX_FDS: usize = 32;

/// First descriptor handed to userspace opens.
pub const FIRST_USER_FD: i32 = 3;

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    vnode: usize,
    offset: u64,
}

static VFS: Mutex<VnodeTable> = Mutex::new(VnodeTable::new());
static FDS: Mutex<[Option<OpenFile>; MAX_FDS]> = Mutex::new([None; MAX_FDS]);

/// Inject the synthetic device nodes. Called once before any mount.
pub fn init() {
    let mut vfs = VFS.lock();
    for name in ["dev/random", "dev/urandom"] {
        if vfs.push(VNodeKind::Random, name, 0, Backing::Random).is_none() {
            log::warn!("vfs: dropped {}", name);
        }
    }
}

/// Mount the RAM-resident CPIO archive the bootloader loaded as a module.
/// Every regular-file record becomes a vnode whose data stays in place.
pub fn mount_ramdisk(addr: u64, len: usize) {
    // SAFETY: the module range comes from the Multiboot info; it is
    // identity-mapped RAM that nothing reuses for the kernel's lifetime.
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };

    let mut vfs = VFS.lock();
    let mut published = 0;
    for record in cpio::records(bytes) {
        if !record.header.is_regular() {
            continue;
        }
        let data_addr = addr + record.data_offset as u64;
        if vfs
            .push(
                VNodeKind::File,
                record.name,
                record.header.filesize as u64,
                Backing::Ram { addr: data_addr },
            )
            .is_none()
        {
            log::warn!("vfs: dropped {} (table full)", record.name);
        } else {
            published += 1;
        }
    }
    log::info!("vfs: ramdisk at {:#x}, {} files", addr, published);
}

/// Upper bound on record names when scanning the block device.
const BLOCK_NAME_MAX: usize = 1024;

/// Safety valve on the number of on-disk records scanned.
const BLOCK_MAX_RECORDS: usize = 512;

/// Mount the CPIO archive laid out from sector 0 of the block device.
/// Headers are read incrementally through the driver; file data stays on
/// disk, recorded as byte offsets.
pub fn mount_block_device() {
    use crate::drivers::virtio::blk;

    if !blk::is_available() {
        return;
    }

    // Header (110) + name (<= 1024) can straddle sectors; four sectors of
    // lookahead always covers a header starting anywhere in the first.
    let mut buf = [0u8; 4 * 512];
    let mut offset: u64 = 0;
    let mut published = 0;

    let mut vfs = VFS.lock();
    for _ in 0..BLOCK_MAX_RECORDS {
        let sector = offset / 512;
        let within = (offset % 512) as usize;
        if blk::read_sectors(sector, 4, &mut buf).is_err() {
            log::warn!("vfs: disk scan aborted at byte {}", offset);
            break;
        }
        let window = &buf[within..];

        let Some(header) = cpio::parse_header(window) else {
            break;
        };
        if header.namesize > BLOCK_NAME_MAX {
            log::warn!("vfs: oversized name at byte {}", offset);
            break;
        }
        let Some(name) = cpio::parse_name(window, &header) else {
            break;
        };
        if name == cpio::TRAILER {
            break;
        }

        let data_offset = offset + cpio::pad4(cpio::HEADER_LEN + header.namesize) as u64;
        if header.is_regular() {
            if vfs
                .push(
                    VNodeKind::File,
                    name,
                    header.filesize as u64,
                    Backing::Block {
                        byte_offset: data_offset,
                    },
                )
                .is_none()
            {
                log::warn!("vfs: dropped {} (table full)", name);
            } else {
                published += 1;
            }
        }
        offset = data_offset + cpio::pad4(header.filesize) as u64;
    }
    log::info!("vfs: block device, {} files", published);
}

/// Copy a path into the name pool, yielding a `'static` str. Used for the
/// `init=` path, which must outlive its command-line buffer.
pub fn intern_path(path: &str) -> &'static str {
    let mut vfs = VFS.lock();
    let base = vfs.pool_base();
    match vfs.intern_str(path) {
        Some((off, len)) => {
            // SAFETY: the pool is a static array that never moves or
            // shrinks, and the interned range holds the UTF-8 bytes of
            // `path` for the kernel's lifetime.
            unsafe {
                core::str::from_utf8_unchecked(core::slice::from_raw_parts(
                    base.add(off as usize),
                    len as usize,
                ))
            }
        }
        None => "",
    }
}

/// Read from a vnode at an absolute offset, clamped to the file size.
fn read_vnode(node_index: usize, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
    let (backing, size) = {
        let vfs = VFS.lock();
        let node = vfs.get(node_index).ok_or(KernelError::InvalidArgument {
            name: "vnode",
        })?;
        (node.backing, node.size)
    };

    match backing {
        Backing::Random => {
            crate::entropy::fill_bytes(buf);
            Ok(buf.len())
        }
        _ if offset >= size => Ok(0),
        Backing::Ram { addr } => {
            let n = buf.len().min((size - offset) as usize);
            // SAFETY: [addr, addr+size) is the record's data inside the
            // resident ramdisk; `offset + n <= size` by the clamp above.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (addr + offset) as *const u8,
                    buf.as_mut_ptr(),
                    n,
                );
            }
            Ok(n)
        }
        Backing::Block { byte_offset } => {
            let n = buf.len().min((size - offset) as usize);
            let mut bounce = [0u8; 512];
            let mut done = 0;
            while done < n {
                let abs = byte_offset + offset + done as u64;
                let sector = abs / 512;
                let within = (abs % 512) as usize;
                let take = (512 - within).min(n - done);
                crate::drivers::virtio::blk::read_sectors(sector, 1, &mut bounce)?;
                buf[done..done + take].copy_from_slice(&bounce[within..within + take]);
                done += take;
            }
            Ok(n)
        }
    }
}

/// Look a path up in the flat table.
pub fn lookup(path: &str) -> Option<usize> {
    VFS.lock().lookup(normalize(path))
}

/// st_mode and st_size for a path.
pub fn stat_path(path: &str) -> Option<(u16, u64)> {
    let vfs = VFS.lock();
    let node = vfs.get(vfs.lookup(normalize(path))?)?;
    Some((node.mode(), node.size))
}

/// st_mode and st_size for an open descriptor. Descriptors 0-2 present as
/// character devices.
pub fn stat_fd(fd: i32) -> Option<(u16, u64)> {
    if (0..FIRST_USER_FD).contains(&fd) {
        return Some((0o020666, 0));
    }
    let vnode = {
        let fds = FDS.lock();
        fds.get(fd as usize).copied().flatten()?.vnode
    };
    let vfs = VFS.lock();
    let node = vfs.get(vnode)?;
    Some((node.mode(), node.size))
}

/// Open a path, allocating the lowest free descriptor >= 3.
pub fn open(path: &str) -> Result<i32, KernelError> {
    let vnode = lookup(path).ok_or(KernelError::FileNotFound { path: "open" })?;
    let mut fds = FDS.lock();
    for fd in FIRST_USER_FD as usize..MAX_FDS {
        if fds[fd].is_none() {
            fds[fd] = Some(OpenFile { vnode, offset: 0 });
            return Ok(fd as i32);
        }
    }
    Err(KernelError::TableFull { table: "fd" })
}

/// Close a descriptor. Closing an unopened fd is a no-op success, which is
/// what dyld expects of its probing.
pub fn close(fd: i32) -> bool {
    if fd < FIRST_USER_FD || fd as usize >= MAX_FDS {
        return false;
    }
    FDS.lock()[fd as usize].take().is_some()
}

fn with_open_file<R>(fd: i32, f: impl FnOnce(&mut OpenFile) -> R) -> Result<R, KernelError> {
    if !(FIRST_USER_FD..MAX_FDS as i32).contains(&fd) {
        return Err(KernelError::InvalidArgument { name: "fd" });
    }
    let mut fds = FDS.lock();
    match fds[fd as usize].as_mut() {
        Some(file) => Ok(f(file)),
        None => Err(KernelError::InvalidArgument { name: "fd" }),
    }
}

/// Sequential read advancing the descriptor offset.
pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize, KernelError> {
    let (vnode, offset) = with_open_file(fd, |file| (file.vnode, file.offset))?;
    let n = read_vnode(vnode, offset, buf)?;
    with_open_file(fd, |file| file.offset += n as u64)?;
    Ok(n)
}

/// Positional read; the descriptor offset is untouched (`pread`, mmap
/// fills).
pub fn read_at(fd: i32, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
    let vnode = with_open_file(fd, |file| file.vnode)?;
    read_vnode(vnode, offset, buf)
}

/// lseek. `whence`: 0 = SET, 1 = CUR, 2 = END.
pub fn seek(fd: i32, offset: i64, whence: u32) -> Result<u64, KernelError> {
    let vnode = with_open_file(fd, |file| file.vnode)?;
    let size = {
        let vfs = VFS.lock();
        vfs.get(vnode).map(|n| n.size).unwrap_or(0)
    };
    with_open_file(fd, |file| {
        let base = match whence {
            0 => 0,
            1 => file.offset as i64,
            2 => size as i64,
            _ => return Err(KernelError::InvalidArgument { name: "whence" }),
        };
        let target = base.checked_add(offset).filter(|&t| t >= 0).ok_or(
            KernelError::InvalidArgument { name: "offset" },
        )?;
        file.offset = target as u64;
        Ok(file.offset)
    })?
}

/// A staged file: RAM-backed files are zero-copy slices into the ramdisk,
/// block-backed files are pulled into a heap buffer.
pub enum FileData {
    Ram(&'static [u8]),
    Heap(Vec<u8>),
}

impl FileData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FileData::Ram(slice) => slice,
            FileData::Heap(vec) => vec,
        }
    }
}

/// Stage a whole file for the loader.
pub fn read_file(path: &str) -> Option<FileData> {
    let index = lookup(path)?;
    let (backing, size) = {
        let vfs = VFS.lock();
        let node = vfs.get(index)?;
        if node.kind != VNodeKind::File {
            return None;
        }
        (node.backing, node.size)
    };
    match backing {
        Backing::Ram { addr } => {
            // SAFETY: the record's data sits at [addr, addr+size) inside
            // the resident ramdisk, untouched for the kernel's lifetime.
            Some(FileData::Ram(unsafe {
                core::slice::from_raw_parts(addr as *const u8, size as usize)
            }))
        }
        Backing::Block { .. } => {
            let mut data = alloc::vec![0u8; size as usize];
            read_vnode(index, 0, &mut data).ok()?;
            Some(FileData::Heap(data))
        }
        Backing::Random => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global VFS/fd tables are process-wide; these tests exercise the
    // pure pieces through them against the synthetic dev nodes that init()
    // publishes. Mount paths that dereference physical memory are covered
    // by the cpio/vnode unit tests instead.

    #[test]
    fn test_open_read_close_random() {
        init();
        let fd = open("/dev/random").unwrap();
        assert!(fd >= FIRST_USER_FD);
        let mut buf = [0u8; 16];
        let n = read(fd, &mut buf).unwrap();
        assert_eq!(n, 16);
        assert!(close(fd));
        assert!(!close(fd));
    }

    #[test]
    fn test_open_missing() {
        init();
        assert!(open("no/such/file").is_err());
    }

    #[test]
    fn test_stat_fd_stdio() {
        assert_eq!(stat_fd(1), Some((0o020666, 0)));
        assert_eq!(stat_fd(2), Some((0o020666, 0)));
    }

    #[test]
    fn test_intern_path_is_stable() {
        let a = intern_path("bin/zsh");
        assert_eq!(a, "bin/zsh");
    }
}
