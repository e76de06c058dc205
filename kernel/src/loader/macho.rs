//! Mach-O 64 loader with FAT-binary slice selection.
//!
//! The input is untrusted bytes plus a slide (virtual offset added to every
//! segment). Parsing uses length-checked reads throughout -- a truncated
//! image yields an error, never a wild read. Loading maps each
//! `LC_SEGMENT_64` through the VMM at `vmaddr + slide`, copies the file
//! range in, records the `__TEXT` base, and resolves the entry point from
//! `LC_MAIN` or `LC_UNIXTHREAD`.
//!
//! All address arithmetic is wrapping: slides are arbitrary 64-bit offsets
//! and real dyld slides deliberately wrap the space.

use alloc::vec::Vec;

use crate::{error::KernelError, mm::paging::EntryFlags, mm::vmm};

/// FAT (multi-architecture) container magic, stored big-endian on disk.
pub const FAT_MAGIC: u32 = 0xCAFE_BABE;
/// 64-bit Mach-O magic, little-endian on disk for x86-64 images.
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
/// CPU_TYPE_X86_64: CPU_ARCH_ABI64 | CPU_TYPE_X86.
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;

const LC_UNIXTHREAD: u32 = 0x05;
const LC_LOAD_DYLINKER: u32 = 0x0E;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x8000_0028;

/// Size of `mach_header_64`; load commands start here.
const MACH_HEADER_SIZE: usize = 32;

/// x86_THREAD_STATE64 flavor for LC_UNIXTHREAD.
const X86_THREAD_STATE64: u32 = 4;

/// Index of RIP within the x86_THREAD_STATE64 register file.
const THREAD_STATE_RIP_INDEX: usize = 16;

/// Upper bound on FAT slices examined.
const MAX_FAT_ARCHS: u32 = 32;

fn malformed(reason: &'static str) -> KernelError {
    KernelError::Malformed {
        what: "mach-o",
        reason,
    }
}

fn read_u32(bytes: &[u8], off: usize) -> Option<u32> {
    let field = bytes.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

fn read_u64(bytes: &[u8], off: usize) -> Option<u64> {
    let field = bytes.get(off..off.checked_add(8)?)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(field);
    Some(u64::from_le_bytes(raw))
}

/// One `LC_SEGMENT_64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub name: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
}

impl Segment {
    /// Segment name with trailing NULs trimmed.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// How the image names its entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySpec {
    /// `LC_MAIN`: offset relative to the image's `__TEXT` base.
    Main { entryoff: u64 },
    /// `LC_UNIXTHREAD`: absolute unslid RIP.
    UnixThread { rip: u64 },
}

/// The parse result: segments, entry specification, and the dynamic-linker
/// path (diagnostics only; this kernel always runs dyld itself).
#[derive(Debug)]
pub struct ParsedImage<'a> {
    pub segments: Vec<Segment>,
    pub entry: Option<EntrySpec>,
    pub dylinker: Option<&'a str>,
}

/// Result of mapping an image: its resolved entry and the loaded (slid)
/// `__TEXT` address, which is also the `mach_header` address dyld receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry_point: u64,
    pub text_base: u64,
}

/// If `bytes` is a FAT container, return the x86-64 slice; otherwise
/// return `bytes` unchanged. FAT headers are big-endian; the byte-swapped
/// magic (a container written little-endian) is handled as well.
pub fn select_slice(bytes: &[u8]) -> Result<&[u8], KernelError> {
    let magic_field = bytes.get(..4).ok_or(malformed("shorter than a magic"))?;
    let be = u32::from_be_bytes([magic_field[0], magic_field[1], magic_field[2], magic_field[3]]);
    let le = u32::from_le_bytes([magic_field[0], magic_field[1], magic_field[2], magic_field[3]]);
    if be != FAT_MAGIC && le != FAT_MAGIC {
        return Ok(bytes);
    }
    let big_endian = be == FAT_MAGIC;
    let read = |off: usize| -> Option<u32> {
        let field = bytes.get(off..off.checked_add(4)?)?;
        let raw = [field[0], field[1], field[2], field[3]];
        Some(if big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    };

    let nfat_arch = read(4).ok_or(malformed("truncated fat header"))?;
    for i in 0..nfat_arch.min(MAX_FAT_ARCHS) {
        // fat_arch: cputype, cpusubtype, offset, size, align (5 x u32).
        let rec = 8 + i as usize * 20;
        let cputype = read(rec).ok_or(malformed("truncated fat arch"))?;
        if cputype != CPU_TYPE_X86_64 {
            continue;
        }
        let offset = read(rec + 8).ok_or(malformed("truncated fat arch"))? as usize;
        let size = read(rec + 12).ok_or(malformed("truncated fat arch"))? as usize;
        return bytes
            .get(offset..offset.checked_add(size).ok_or(malformed("fat slice overflow"))?)
            .ok_or(malformed("fat slice out of bounds"));
    }
    Err(malformed("no x86-64 slice"))
}

/// Parse the Mach-O header and walk its load commands.
pub fn parse(bytes: &[u8]) -> Result<ParsedImage<'_>, KernelError> {
    if read_u32(bytes, 0) != Some(MH_MAGIC_64) {
        return Err(malformed("bad magic"));
    }
    let ncmds = read_u32(bytes, 16).ok_or(malformed("truncated header"))?;

    let mut image = ParsedImage {
        segments: Vec::new(),
        entry: None,
        dylinker: None,
    };

    let mut off = MACH_HEADER_SIZE;
    for _ in 0..ncmds {
        let cmd = read_u32(bytes, off).ok_or(malformed("truncated command"))?;
        let cmdsize = read_u32(bytes, off + 4).ok_or(malformed("truncated command"))? as usize;
        if cmdsize < 8 || off.checked_add(cmdsize).map_or(true, |end| end > bytes.len()) {
            return Err(malformed("bad command size"));
        }

        match cmd {
            LC_SEGMENT_64 => {
                if cmdsize < 72 {
                    return Err(malformed("short segment command"));
                }
                let mut name = [0u8; 16];
                name.copy_from_slice(&bytes[off + 8..off + 24]);
                image.segments.push(Segment {
                    name,
                    vmaddr: read_u64(bytes, off + 24).ok_or(malformed("truncated segment"))?,
                    vmsize: read_u64(bytes, off + 32).ok_or(malformed("truncated segment"))?,
                    fileoff: read_u64(bytes, off + 40).ok_or(malformed("truncated segment"))?,
                    filesize: read_u64(bytes, off + 48).ok_or(malformed("truncated segment"))?,
                });
            }
            LC_MAIN => {
                let entryoff = read_u64(bytes, off + 8).ok_or(malformed("truncated LC_MAIN"))?;
                image.entry = Some(EntrySpec::Main { entryoff });
            }
            LC_UNIXTHREAD => {
                let flavor = read_u32(bytes, off + 8).ok_or(malformed("truncated thread"))?;
                if flavor == X86_THREAD_STATE64 {
                    // Register file follows the 16-byte command header.
                    let rip_off = off + 16 + THREAD_STATE_RIP_INDEX * 8;
                    let rip = read_u64(bytes, rip_off).ok_or(malformed("truncated thread state"))?;
                    // LC_MAIN wins if both appear; keep the first entry seen.
                    image.entry.get_or_insert(EntrySpec::UnixThread { rip });
                }
            }
            LC_LOAD_DYLINKER => {
                let name_off = read_u32(bytes, off + 8).ok_or(malformed("truncated dylinker"))?
                    as usize;
                if let Some(raw) = bytes.get(off + name_off..off + cmdsize) {
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    image.dylinker = core::str::from_utf8(&raw[..end]).ok();
                }
            }
            _ => {}
        }
        off += cmdsize;
    }
    Ok(image)
}

/// Slid `__TEXT` base of a parsed image.
pub fn text_base(parsed: &ParsedImage<'_>, slide: u64) -> Option<u64> {
    parsed
        .segments
        .iter()
        .find(|seg| seg.name_str() == "__TEXT")
        .map(|seg| seg.vmaddr.wrapping_add(slide))
}

/// Resolve the entry point. `LC_MAIN`'s entryoff is relative to the image
/// base, so it lands at `text_base + entryoff` (the slide is already inside
/// `text_base`); `LC_UNIXTHREAD` carries an absolute unslid RIP.
pub fn resolve_entry(parsed: &ParsedImage<'_>, text: u64, slide: u64) -> Option<u64> {
    match parsed.entry? {
        EntrySpec::Main { entryoff } => Some(text.wrapping_add(entryoff)),
        EntrySpec::UnixThread { rip } => Some(rip.wrapping_add(slide)),
    }
}

/// Map a Mach-O (or FAT-wrapped) image into the shared address space at
/// `slide` and resolve its entry point.
///
/// VMM mappings installed before a failure are not rolled back; the caller
/// halts on error anyway.
pub fn load(bytes: &[u8], slide: u64) -> Result<LoadedImage, KernelError> {
    let slice = select_slice(bytes)?;
    let parsed = parse(slice)?;
    let text = text_base(&parsed, slide).ok_or(malformed("no __TEXT segment"))?;

    if let Some(dylinker) = parsed.dylinker {
        log::debug!("image requests dynamic linker {}", dylinker);
    }

    for seg in &parsed.segments {
        if seg.name_str() == "__PAGEZERO" || seg.vmsize == 0 {
            continue;
        }
        let base = seg.vmaddr.wrapping_add(slide);
        // Fresh PMM frames come back zeroed, which covers the
        // vmsize > filesize tail (bss).
        vmm::mmap(
            base,
            seg.vmsize,
            EntryFlags::WRITABLE | EntryFlags::USER,
            None,
        )?;

        if seg.filesize > 0 {
            let fileoff = seg.fileoff as usize;
            let copy_len = seg.filesize.min(seg.vmsize) as usize;
            let src = slice
                .get(fileoff..fileoff + copy_len)
                .ok_or(malformed("segment outside file"))?;
            // SAFETY: [base, base+copy_len) was just mapped writable in the
            // shared address space.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), base as *mut u8, copy_len);
            }
        }
        log::debug!(
            "mapped {} at {:#x} ({} bytes)",
            seg.name_str(),
            base,
            seg.vmsize
        );
    }

    let entry_point = resolve_entry(&parsed, text, slide).ok_or(malformed("no entry point"))?;
    Ok(LoadedImage {
        entry_point,
        text_base: text,
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    // --- Helpers: build synthetic images ---

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn mach_header(ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, MH_MAGIC_64);
        push_u32(&mut buf, CPU_TYPE_X86_64);
        push_u32(&mut buf, 3); // cpusubtype
        push_u32(&mut buf, 2); // filetype MH_EXECUTE
        push_u32(&mut buf, ncmds);
        push_u32(&mut buf, sizeofcmds);
        push_u32(&mut buf, 0); // flags
        push_u32(&mut buf, 0); // reserved
        buf
    }

    fn segment_cmd(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, LC_SEGMENT_64);
        push_u32(&mut buf, 72); // cmdsize, no sections
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&segname);
        push_u64(&mut buf, vmaddr);
        push_u64(&mut buf, vmsize);
        push_u64(&mut buf, fileoff);
        push_u64(&mut buf, filesize);
        push_u32(&mut buf, 7); // maxprot
        push_u32(&mut buf, 5); // initprot
        push_u32(&mut buf, 0); // nsects
        push_u32(&mut buf, 0); // flags
        buf
    }

    fn main_cmd(entryoff: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, LC_MAIN);
        push_u32(&mut buf, 24);
        push_u64(&mut buf, entryoff);
        push_u64(&mut buf, 0); // stacksize
        buf
    }

    fn unixthread_cmd(rip: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, LC_UNIXTHREAD);
        push_u32(&mut buf, (16 + 21 * 8) as u32);
        push_u32(&mut buf, X86_THREAD_STATE64);
        push_u32(&mut buf, 42); // state word count
        for i in 0..21u64 {
            push_u64(&mut buf, if i as usize == THREAD_STATE_RIP_INDEX { rip } else { 0 });
        }
        buf
    }

    fn image(cmds: &[Vec<u8>]) -> Vec<u8> {
        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        let mut buf = mach_header(cmds.len() as u32, sizeofcmds as u32);
        for cmd in cmds {
            buf.extend_from_slice(cmd);
        }
        buf
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut img = image(&[]);
        img[0] = 0;
        assert!(parse(&img).is_err());
    }

    #[test]
    fn test_lc_main_entry_resolution() {
        // __TEXT at 0x100000000, entryoff 0x3F80, loaded at a wrapping
        // slide: text_base wraps to 0x0200_0000 and the entry lands at
        // text_base + entryoff.
        let img = image(&[
            segment_cmd("__PAGEZERO", 0, 0x1_0000_0000, 0, 0),
            segment_cmd("__TEXT", 0x1_0000_0000, 0x4000, 0, 0x4000),
            main_cmd(0x3F80),
        ]);
        let parsed = parse(&img).unwrap();
        let slide = 0xFFFF_FFFF_0200_0000u64;

        let text = text_base(&parsed, slide).unwrap();
        assert_eq!(text, 0x0200_0000);
        let entry = resolve_entry(&parsed, text, slide).unwrap();
        assert_eq!(entry, 0x0200_3F80);
    }

    #[test]
    fn test_unixthread_entry_resolution() {
        let img = image(&[
            segment_cmd("__TEXT", 0x1000, 0x1000, 0, 0x1000),
            unixthread_cmd(0x1234),
        ]);
        let parsed = parse(&img).unwrap();
        assert_eq!(parsed.entry, Some(EntrySpec::UnixThread { rip: 0x1234 }));
        let entry = resolve_entry(&parsed, text_base(&parsed, 0x10_0000).unwrap(), 0x10_0000);
        assert_eq!(entry, Some(0x11_1234));
    }

    #[test]
    fn test_segments_parsed() {
        let img = image(&[
            segment_cmd("__TEXT", 0x1000, 0x2000, 0, 0x1800),
            segment_cmd("__DATA", 0x3000, 0x1000, 0x1800, 0x200),
        ]);
        let parsed = parse(&img).unwrap();
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[1].name_str(), "__DATA");
        assert_eq!(parsed.segments[1].fileoff, 0x1800);
    }

    #[test]
    fn test_truncated_command_rejected() {
        let mut img = image(&[segment_cmd("__TEXT", 0, 0x1000, 0, 0)]);
        img.truncate(40);
        assert!(parse(&img).is_err());
    }

    #[test]
    fn test_fat_selects_x86_64_slice() {
        let inner = image(&[segment_cmd("__TEXT", 0x1000, 0x1000, 0, 0), main_cmd(0x100)]);
        let slice_offset = 64usize;

        let mut fat = Vec::new();
        fat.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        fat.extend_from_slice(&2u32.to_be_bytes()); // nfat_arch
        // arm64 slice record (ignored)
        for v in [0x0100_000Cu32, 0, 0x10_0000, 0x1000, 14] {
            fat.extend_from_slice(&v.to_be_bytes());
        }
        // x86_64 slice record
        for v in [
            CPU_TYPE_X86_64,
            3,
            slice_offset as u32,
            inner.len() as u32,
            12,
        ] {
            fat.extend_from_slice(&v.to_be_bytes());
        }
        while fat.len() < slice_offset {
            fat.push(0);
        }
        fat.extend_from_slice(&inner);

        let selected = select_slice(&fat).unwrap();
        assert_eq!(selected, &inner[..]);
        assert!(parse(selected).is_ok());
    }

    #[test]
    fn test_fat_without_x86_64_fails() {
        let mut fat = Vec::new();
        fat.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        fat.extend_from_slice(&1u32.to_be_bytes());
        for v in [0x0100_000Cu32, 0, 0x40, 0x10, 14] {
            fat.extend_from_slice(&v.to_be_bytes());
        }
        assert!(select_slice(&fat).is_err());
    }

    #[test]
    fn test_thin_image_passes_through() {
        let img = image(&[]);
        assert_eq!(select_slice(&img).unwrap(), &img[..]);
    }

    #[test]
    fn test_dylinker_recorded() {
        let mut cmd = Vec::new();
        push_u32(&mut cmd, LC_LOAD_DYLINKER);
        let path = b"/usr/lib/dyld\0\0\0";
        push_u32(&mut cmd, (12 + path.len()) as u32);
        push_u32(&mut cmd, 12); // name offset
        cmd.extend_from_slice(path);

        let img = image(&[segment_cmd("__TEXT", 0, 0x1000, 0, 0), cmd]);
        let parsed = parse(&img).unwrap();
        assert_eq!(parsed.dylinker, Some("/usr/lib/dyld"));
    }
}
