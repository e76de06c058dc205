//! Multiboot boot-information parsing.
//!
//! The boot trampoline hands `kmain` the magic value the bootloader left in
//! EAX and the physical address of the information structure. Both
//! Multiboot 1 (QEMU `-kernel`) and Multiboot 2 (GRUB) are accepted; the
//! kernel needs exactly two things from either: the ramdisk module range
//! and the command line.
//!
//! Parsing is done over byte slices with explicit bounds so the layout
//! logic is host-testable; only [`read`] touches raw physical memory.

use crate::error::KernelError;

/// Magic left in EAX by a Multiboot 1 loader.
pub const MULTIBOOT1_MAGIC: u32 = 0x2BAD_B002;
/// Magic left in EAX by a Multiboot 2 loader.
pub const MULTIBOOT2_MAGIC: u32 = 0x36D7_6289;

/// Multiboot 2 tag types this kernel consumes.
const MB2_TAG_END: u32 = 0;
const MB2_TAG_CMDLINE: u32 = 1;
const MB2_TAG_MODULE: u32 = 3;

const MAX_MODULES: usize = 4;

/// A boot module (the ramdisk) as physical `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootModule {
    pub start: u64,
    pub end: u64,
}

impl BootModule {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Everything the kernel keeps from the bootloader handoff.
#[derive(Debug, Default)]
pub struct BootInfo<'a> {
    modules: [Option<BootModule>; MAX_MODULES],
    module_count: usize,
    cmdline: Option<&'a str>,
}

impl<'a> BootInfo<'a> {
    fn push_module(&mut self, module: BootModule) {
        if self.module_count < MAX_MODULES {
            self.modules[self.module_count] = Some(module);
            self.module_count += 1;
        }
    }

    pub fn first_module(&self) -> Option<&BootModule> {
        self.modules[0].as_ref()
    }

    pub fn module_count(&self) -> usize {
        self.module_count
    }

    pub fn cmdline(&self) -> Option<&'a str> {
        self.cmdline
    }
}

fn read_u32(bytes: &[u8], off: usize) -> Option<u32> {
    let end = off.checked_add(4)?;
    let field = bytes.get(off..end)?;
    Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

/// Fields of the fixed Multiboot 1 information structure this kernel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mb1Info {
    pub flags: u32,
    /// Physical address of the NUL-terminated command line (flags bit 2).
    pub cmdline_addr: Option<u32>,
    /// Module count and physical address of the module records (flags bit 3).
    pub mods: Option<(u32, u32)>,
}

/// Parse the fixed part of a Multiboot 1 info structure.
pub fn parse_mb1_info(bytes: &[u8]) -> Result<Mb1Info, KernelError> {
    let malformed = KernelError::Malformed {
        what: "multiboot1 info",
        reason: "truncated",
    };
    let flags = read_u32(bytes, 0).ok_or(malformed)?;
    let cmdline_addr = if flags & (1 << 2) != 0 {
        Some(read_u32(bytes, 16).ok_or(malformed)?)
    } else {
        None
    };
    let mods = if flags & (1 << 3) != 0 {
        let count = read_u32(bytes, 20).ok_or(malformed)?;
        let addr = read_u32(bytes, 24).ok_or(malformed)?;
        Some((count, addr))
    } else {
        None
    };
    Ok(Mb1Info {
        flags,
        cmdline_addr,
        mods,
    })
}

/// Parse one 16-byte Multiboot 1 module record.
pub fn parse_mb1_module(bytes: &[u8]) -> Option<BootModule> {
    let start = read_u32(bytes, 0)?;
    let end = read_u32(bytes, 4)?;
    Some(BootModule {
        start: start as u64,
        end: end as u64,
    })
}

/// Parse a complete Multiboot 2 information structure (`total_size` header
/// followed by 8-byte-aligned tags).
pub fn parse_mb2(bytes: &[u8]) -> Result<BootInfo<'_>, KernelError> {
    let malformed = |reason| KernelError::Malformed {
        what: "multiboot2 info",
        reason,
    };
    let total_size = read_u32(bytes, 0).ok_or(malformed("truncated"))? as usize;
    if total_size > bytes.len() || total_size < 8 {
        return Err(malformed("bad total_size"));
    }

    let mut info = BootInfo::default();
    let mut off = 8;
    while off + 8 <= total_size {
        let tag_type = read_u32(bytes, off).ok_or(malformed("truncated tag"))?;
        let tag_size = read_u32(bytes, off + 4).ok_or(malformed("truncated tag"))? as usize;
        if tag_size < 8 || off + tag_size > total_size {
            return Err(malformed("bad tag size"));
        }
        match tag_type {
            MB2_TAG_END => break,
            MB2_TAG_CMDLINE => {
                let raw = &bytes[off + 8..off + tag_size];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                info.cmdline = core::str::from_utf8(&raw[..end]).ok();
            }
            MB2_TAG_MODULE => {
                let start = read_u32(bytes, off + 8).ok_or(malformed("truncated module"))?;
                let end = read_u32(bytes, off + 12).ok_or(malformed("truncated module"))?;
                info.push_module(BootModule {
                    start: start as u64,
                    end: end as u64,
                });
            }
            _ => {}
        }
        // Tags are padded to 8-byte alignment.
        off += (tag_size + 7) & !7;
    }
    Ok(info)
}

/// Read a bounded NUL-terminated string from physical memory.
///
/// # Safety
///
/// `addr` must point at readable, identity-mapped memory that stays valid
/// for the kernel's lifetime.
unsafe fn cstr_at(addr: u64, max: usize) -> Option<&'static str> {
    if addr == 0 {
        return None;
    }
    let base = addr as *const u8;
    let mut len = 0;
    // SAFETY: the caller guarantees `addr` is readable; we stop at the
    // first NUL or after `max` bytes.
    while len < max && unsafe { base.add(len).read() } != 0 {
        len += 1;
    }
    // SAFETY: `base..base+len` was just probed readable and the memory is
    // never modified after boot.
    let bytes = unsafe { core::slice::from_raw_parts(base, len) };
    core::str::from_utf8(bytes).ok()
}

/// Read the boot information from physical memory.
///
/// Rejects unknown magic values; this is a boot-time invariant violation
/// and the caller halts.
pub fn read(magic: u32, info_addr: u64) -> Result<BootInfo<'static>, KernelError> {
    match magic {
        MULTIBOOT1_MAGIC => {
            // SAFETY: the bootloader hands us the physical address of its
            // info structure inside the identity-mapped low memory; the
            // fixed part is 88 bytes.
            let bytes = unsafe { core::slice::from_raw_parts(info_addr as *const u8, 88) };
            let header = parse_mb1_info(bytes)?;
            let mut info = BootInfo::default();
            if let Some(addr) = header.cmdline_addr {
                // SAFETY: `addr` comes from the loader's info structure and
                // points into identity-mapped boot memory.
                info.cmdline = unsafe { cstr_at(addr as u64, 255) };
            }
            if let Some((count, addr)) = header.mods {
                let count = count.min(MAX_MODULES as u32) as usize;
                // SAFETY: the module records live at `mods_addr` in
                // identity-mapped boot memory, 16 bytes each.
                let records =
                    unsafe { core::slice::from_raw_parts(addr as u64 as *const u8, count * 16) };
                for i in 0..count {
                    if let Some(module) = parse_mb1_module(&records[i * 16..]) {
                        info.push_module(module);
                    }
                }
            }
            Ok(info)
        }
        MULTIBOOT2_MAGIC => {
            // SAFETY: the first word of a Multiboot 2 info structure is its
            // total size; the structure is contiguous in identity-mapped
            // boot memory.
            let total = unsafe { (info_addr as *const u32).read() } as usize;
            // SAFETY: as above; `total` covers the whole structure.
            let bytes = unsafe { core::slice::from_raw_parts(info_addr as *const u8, total) };
            parse_mb2(bytes)
        }
        other => {
            log::error!("unrecognized boot magic {:#x}", other);
            Err(KernelError::Malformed {
                what: "boot magic",
                reason: "not multiboot 1 or 2",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(buf: &mut [u8], off: usize, val: u32) {
        buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    #[test]
    fn test_mb1_info_flags_gate_fields() {
        let mut buf = [0u8; 88];
        put_u32(&mut buf, 0, 1 << 3);
        put_u32(&mut buf, 20, 2);
        put_u32(&mut buf, 24, 0x9000);
        let info = parse_mb1_info(&buf).unwrap();
        assert_eq!(info.cmdline_addr, None);
        assert_eq!(info.mods, Some((2, 0x9000)));
    }

    #[test]
    fn test_mb1_module_record() {
        let mut buf = [0u8; 16];
        put_u32(&mut buf, 0, 0x0010_0000);
        put_u32(&mut buf, 4, 0x0018_0000);
        let module = parse_mb1_module(&buf).unwrap();
        assert_eq!(module.start, 0x0010_0000);
        assert_eq!(module.end, 0x0018_0000);
        assert_eq!(module.len(), 0x8_0000);
    }

    #[test]
    fn test_mb1_truncated() {
        assert!(parse_mb1_info(&[0u8; 3]).is_err());
    }

    fn mb2_with_tags(tags: &[u8]) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 8];
        buf.extend_from_slice(tags);
        // End tag
        buf.extend_from_slice(&MB2_TAG_END.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());
        let total = buf.len() as u32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());
        buf
    }

    #[test]
    fn test_mb2_module_and_cmdline() {
        let mut tags = alloc::vec::Vec::new();
        // Module tag: type 3, size 8 + 8 + string
        let name = b"initrd\0";
        let size = (16 + name.len()) as u32;
        tags.extend_from_slice(&MB2_TAG_MODULE.to_le_bytes());
        tags.extend_from_slice(&size.to_le_bytes());
        tags.extend_from_slice(&0x0020_0000u32.to_le_bytes());
        tags.extend_from_slice(&0x0030_0000u32.to_le_bytes());
        tags.extend_from_slice(name);
        while tags.len() % 8 != 0 {
            tags.push(0);
        }
        // Cmdline tag: type 1
        let cmd = b"init=bin/zsh loglevel=debug\0";
        let size = (8 + cmd.len()) as u32;
        tags.extend_from_slice(&MB2_TAG_CMDLINE.to_le_bytes());
        tags.extend_from_slice(&size.to_le_bytes());
        tags.extend_from_slice(cmd);
        while tags.len() % 8 != 0 {
            tags.push(0);
        }

        let buf = mb2_with_tags(&tags);
        let info = parse_mb2(&buf).unwrap();
        assert_eq!(info.module_count(), 1);
        let module = info.first_module().unwrap();
        assert_eq!(module.start, 0x0020_0000);
        assert_eq!(module.len(), 0x0010_0000);
        assert_eq!(info.cmdline(), Some("init=bin/zsh loglevel=debug"));
    }

    #[test]
    fn test_mb2_rejects_bad_total_size() {
        let mut buf = [0u8; 16];
        put_u32(&mut buf, 0, 4096);
        assert!(parse_mb2(&buf).is_err());
    }
}
