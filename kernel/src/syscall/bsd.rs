//! BSD (Unix-class) syscalls.
//!
//! The minimum surface dyld and a just-started shell touch: file I/O
//! through the VFS, write/writev onto the serial console, mmap into the
//! VMM, identity stubs, a tiny sysctl table of synthetic machine facts,
//! and stat64 shells. Errors return as negative Darwin errnos; numbers
//! this kernel has no opinion about are logged and answered with 0.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    entropy,
    error::errno,
    fs,
    mm::{align_up, paging::EntryFlags, vmm},
    serial,
    syscall::userptr,
};

/// Darwin syscall numbers (XNU syscalls.master).
mod nr {
    pub const EXIT: u64 = 1;
    pub const READ: u64 = 3;
    pub const WRITE: u64 = 4;
    pub const OPEN: u64 = 5;
    pub const CLOSE: u64 = 6;
    pub const BRK: u64 = 17;
    pub const GETPID: u64 = 20;
    pub const GETUID: u64 = 24;
    pub const GETEUID: u64 = 25;
    pub const ACCESS: u64 = 33;
    pub const GETEGID: u64 = 43;
    pub const SIGACTION: u64 = 46;
    pub const GETGID: u64 = 47;
    pub const SIGPROCMASK: u64 = 48;
    pub const IOCTL: u64 = 54;
    pub const MUNMAP: u64 = 73;
    pub const MPROTECT: u64 = 74;
    pub const GETDTABLESIZE: u64 = 89;
    pub const FCNTL: u64 = 92;
    pub const WRITEV: u64 = 121;
    pub const PREAD: u64 = 153;
    pub const CSOPS: u64 = 169;
    pub const GETRLIMIT: u64 = 194;
    pub const SETRLIMIT: u64 = 195;
    pub const MMAP: u64 = 197;
    pub const LSEEK: u64 = 199;
    pub const SYSCTL: u64 = 202;
    pub const SHARED_REGION_CHECK_NP: u64 = 294;
    pub const ISSETUGID: u64 = 327;
    pub const STAT64: u64 = 338;
    pub const FSTAT64: u64 = 339;
    pub const LSTAT64: u64 = 340;
    pub const THREAD_SELFID: u64 = 372;
    pub const GETENTROPY: u64 = 500;
}

/// MAP_ANON on Darwin.
const MAP_ANON: u64 = 0x1000;

/// Longest path accepted from userspace.
const PATH_MAX: usize = 1024;

/// Iovec count bound for writev.
const IOV_MAX: usize = 64;

/// getentropy's documented request ceiling.
const ENTROPY_MAX: usize = 256;

/// RLIMIT_STACK-style answer: 8 MiB for both cur and max.
const RLIMIT_VALUE: u64 = 8 * 1024 * 1024;

/// sizeof(struct stat64) on Darwin x86_64.
pub const STAT64_SIZE: usize = 144;

/// Process-wide signal mask. Tracked, never delivered against.
static SIG_MASK: AtomicU64 = AtomicU64::new(0);

/// Heap break watermark for the legacy brk path: (break, mapped end). The
/// mapped end only ever grows, so re-extending the break never remaps (and
/// never wipes) a live page.
static BRK: Mutex<(u64, u64)> = Mutex::new((USER_BRK_BASE, USER_BRK_BASE));

/// Where the legacy break starts; comfortably clear of the user stack and
/// below the mmap watermark.
const USER_BRK_BASE: u64 = 0x3000_0000;

pub fn dispatch(number: u64, args: &[u64; 6]) -> i64 {
    match number {
        nr::EXIT => {
            log::info!("userspace exit({})", args[0]);
            crate::arch::halt()
        }
        nr::READ => sys_read(args[0] as i64, args[1], args[2]),
        nr::WRITE => sys_write(args[0] as i64, args[1], args[2]),
        nr::OPEN => sys_open(args[0]),
        nr::CLOSE => {
            fs::close(args[0] as i32);
            0
        }
        nr::BRK => sys_brk(args[0]),
        nr::GETPID => 1,
        nr::GETUID | nr::GETEUID | nr::GETGID | nr::GETEGID => 0,
        nr::ACCESS => sys_access(args[0]),
        nr::SIGACTION => 0,
        nr::SIGPROCMASK => sys_sigprocmask(args[0], args[1], args[2]),
        nr::IOCTL | nr::FCNTL => 0,
        nr::MUNMAP | nr::MPROTECT => 0,
        nr::GETDTABLESIZE => fs::MAX_FDS as i64,
        nr::WRITEV => sys_writev(args[0] as i64, args[1], args[2]),
        nr::PREAD => sys_pread(args[0] as i64, args[1], args[2], args[3]),
        nr::CSOPS | nr::ISSETUGID => 0,
        nr::GETRLIMIT => sys_getrlimit(args[1]),
        nr::SETRLIMIT => 0,
        nr::MMAP => sys_mmap(args),
        nr::LSEEK => sys_lseek(args[0] as i64, args[1] as i64, args[2] as u32),
        nr::SYSCTL => sys_sysctl(args[0], args[1], args[2], args[3]),
        nr::SHARED_REGION_CHECK_NP => {
            // No shared region exists; dyld falls back to mapping its own
            // libraries when the reported address is 0.
            // SAFETY: args[0] is the caller's out-pointer.
            unsafe { userptr::write_u64(args[0], 0) };
            0
        }
        nr::STAT64 | nr::LSTAT64 => sys_stat64(args[0], args[1]),
        nr::FSTAT64 => sys_fstat64(args[0] as i64, args[1]),
        nr::THREAD_SELFID => 1,
        nr::GETENTROPY => sys_getentropy(args[0], args[1]),
        _ => {
            log::warn!("bsd syscall {} unimplemented, returning 0", number);
            0
        }
    }
}

fn sys_read(fd: i64, buf: u64, len: u64) -> i64 {
    // SAFETY: buf is the caller's buffer of len bytes.
    let Some(dst) = (unsafe { userptr::slice_mut(buf, len as usize) }) else {
        return -errno::EFAULT;
    };
    match fs::read(fd as i32, dst) {
        Ok(n) => n as i64,
        // Unknown descriptors behave like /dev/random: dyld's entropy
        // probing reads from fds it never opened through us.
        Err(_) => {
            entropy::fill_bytes(dst);
            dst.len() as i64
        }
    }
}

fn sys_write(fd: i64, buf: u64, len: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return -errno::EBADF;
    }
    // SAFETY: buf is the caller's buffer of len bytes.
    let Some(src) = (unsafe { userptr::slice(buf, len as usize) }) else {
        return -errno::EFAULT;
    };
    serial::write_bytes(src);
    len as i64
}

fn sys_writev(fd: i64, iov: u64, iovcnt: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return -errno::EBADF;
    }
    let count = (iovcnt as usize).min(IOV_MAX);
    let mut written = 0i64;
    for i in 0..count {
        let entry = iov + (i as u64) * 16;
        // SAFETY: entry points at the caller's {iov_base, iov_len} pair.
        let (base, len) = unsafe {
            match (userptr::read_u64(entry), userptr::read_u64(entry + 8)) {
                (Some(base), Some(len)) => (base, len),
                _ => return -errno::EFAULT,
            }
        };
        if len == 0 {
            continue;
        }
        // SAFETY: base/len describe one caller iovec.
        let Some(src) = (unsafe { userptr::slice(base, len as usize) }) else {
            return -errno::EFAULT;
        };
        serial::write_bytes(src);
        written += len as i64;
    }
    written
}

fn sys_open(path_ptr: u64) -> i64 {
    // SAFETY: path_ptr is the caller's NUL-terminated path.
    let Some(path) = (unsafe { userptr::cstr(path_ptr, PATH_MAX) }) else {
        return -errno::EFAULT;
    };
    match fs::open(path) {
        Ok(fd) => fd as i64,
        Err(_) => -errno::ENOENT,
    }
}

fn sys_access(path_ptr: u64) -> i64 {
    // SAFETY: path_ptr is the caller's NUL-terminated path.
    let Some(path) = (unsafe { userptr::cstr(path_ptr, PATH_MAX) }) else {
        return -errno::EFAULT;
    };
    if fs::lookup(path).is_some() {
        0
    } else {
        -errno::ENOENT
    }
}

fn sys_pread(fd: i64, buf: u64, len: u64, offset: u64) -> i64 {
    // SAFETY: buf is the caller's buffer of len bytes.
    let Some(dst) = (unsafe { userptr::slice_mut(buf, len as usize) }) else {
        return -errno::EFAULT;
    };
    match fs::read_at(fd as i32, offset, dst) {
        Ok(n) => n as i64,
        Err(_) => -errno::EBADF,
    }
}

fn sys_lseek(fd: i64, offset: i64, whence: u32) -> i64 {
    match fs::seek(fd as i32, offset, whence) {
        Ok(pos) => pos as i64,
        Err(_) => -errno::EBADF,
    }
}

fn sys_brk(addr: u64) -> i64 {
    let mut brk = BRK.lock();
    let (ref mut current, ref mut mapped_end) = *brk;
    if addr <= *current {
        return 0;
    }
    let new_end = align_up(addr, 4096);
    if new_end > *mapped_end {
        if vmm::mmap(
            *mapped_end,
            new_end - *mapped_end,
            EntryFlags::WRITABLE | EntryFlags::USER,
            None,
        )
        .is_err()
        {
            return -1;
        }
        *mapped_end = new_end;
    }
    *current = addr;
    0
}

/// SIG_BLOCK / SIG_UNBLOCK / SIG_SETMASK.
fn sys_sigprocmask(how: u64, set: u64, oset: u64) -> i64 {
    if oset != 0 {
        // The previous mask is deliberately not reported; nothing is ever
        // delivered against it.
        // SAFETY: oset is the caller's out-pointer.
        unsafe { userptr::write_u64(oset, 0) };
    }
    if set != 0 {
        // SAFETY: set is the caller's mask pointer.
        let Some(mask) = (unsafe { userptr::read_u64(set) }) else {
            return -errno::EFAULT;
        };
        match how {
            1 => {
                SIG_MASK.fetch_or(mask, Ordering::Relaxed);
            }
            2 => {
                SIG_MASK.fetch_and(!mask, Ordering::Relaxed);
            }
            3 => {
                SIG_MASK.store(mask, Ordering::Relaxed);
            }
            _ => return -errno::EINVAL,
        }
    }
    0
}

fn sys_getrlimit(rlp: u64) -> i64 {
    // struct rlimit { rlim_cur, rlim_max }
    // SAFETY: rlp is the caller's rlimit out-structure.
    let ok = unsafe {
        userptr::write_u64(rlp, RLIMIT_VALUE) && userptr::write_u64(rlp + 8, RLIMIT_VALUE)
    };
    if ok {
        0
    } else {
        -errno::EFAULT
    }
}

fn sys_mmap(args: &[u64; 6]) -> i64 {
    let (addr, len, _prot, flags, fd, offset) =
        (args[0], args[1], args[2], args[3], args[4] as i64 as i32, args[5]);
    let fill = if flags & MAP_ANON == 0 && fd >= 0 {
        Some(vmm::FileFill { fd, offset })
    } else {
        None
    };
    match vmm::mmap(addr, len, EntryFlags::WRITABLE | EntryFlags::USER, fill) {
        Ok(base) => base as i64,
        Err(_) => -1,
    }
}

fn sys_getentropy(buf: u64, len: u64) -> i64 {
    if len as usize > ENTROPY_MAX {
        return -errno::EINVAL;
    }
    // SAFETY: buf is the caller's buffer of len bytes.
    let Some(dst) = (unsafe { userptr::slice_mut(buf, len as usize) }) else {
        return -errno::EFAULT;
    };
    entropy::fill_bytes(dst);
    0
}

// --- sysctl -------------------------------------------------------------

/// Synthetic machine facts, selected by the first two MIB words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysctlValue {
    Str(&'static str),
    U32(u32),
    U64(u64),
}

/// CTL_KERN / CTL_HW names this kernel answers.
pub fn sysctl_lookup(mib0: u32, mib1: u32) -> Option<SysctlValue> {
    const CTL_KERN: u32 = 1;
    const CTL_HW: u32 = 6;
    const KERN_OSTYPE: u32 = 1;
    const KERN_OSRELEASE: u32 = 2;
    const HW_NCPU: u32 = 3;
    const HW_PAGESIZE: u32 = 7;
    const HW_MEMSIZE: u32 = 24;

    match (mib0, mib1) {
        (CTL_KERN, KERN_OSTYPE) => Some(SysctlValue::Str("Darwin")),
        (CTL_KERN, KERN_OSRELEASE) => Some(SysctlValue::Str("23.0.0")),
        (CTL_HW, HW_NCPU) => Some(SysctlValue::U32(1)),
        (CTL_HW, HW_PAGESIZE) => Some(SysctlValue::U32(4096)),
        (CTL_HW, HW_MEMSIZE) => Some(SysctlValue::U64(1 << 30)),
        _ => None,
    }
}

fn sys_sysctl(name: u64, namelen: u64, oldp: u64, oldlenp: u64) -> i64 {
    if namelen < 2 {
        return -errno::EINVAL;
    }
    // SAFETY: name points at the caller's MIB array of namelen u32s.
    let (mib0, mib1) = unsafe {
        match (userptr::read_u32(name), userptr::read_u32(name + 4)) {
            (Some(a), Some(b)) => (a, b),
            _ => return -errno::EFAULT,
        }
    };
    let Some(value) = sysctl_lookup(mib0, mib1) else {
        log::debug!("sysctl {{{},{}}} unanswered", mib0, mib1);
        return -errno::EINVAL;
    };

    // SAFETY: oldlenp is the caller's in/out length pointer.
    let capacity = unsafe { userptr::read_u64(oldlenp) }.unwrap_or(0) as usize;
    let written = match value {
        SysctlValue::Str(s) => {
            let bytes = s.as_bytes();
            if capacity > 0 {
                let n = bytes.len().min(capacity - 1);
                // SAFETY: oldp is the caller's buffer of `capacity` bytes.
                if let Some(dst) = unsafe { userptr::slice_mut(oldp, n + 1) } {
                    dst[..n].copy_from_slice(&bytes[..n]);
                    dst[n] = 0;
                }
            }
            bytes.len() + 1
        }
        SysctlValue::U32(v) => {
            if capacity >= 4 {
                // SAFETY: as above.
                unsafe { userptr::write_u32(oldp, v) };
            }
            4
        }
        SysctlValue::U64(v) => {
            if capacity >= 8 {
                // SAFETY: as above.
                unsafe { userptr::write_u64(oldp, v) };
            }
            8
        }
    };
    // SAFETY: as above.
    unsafe { userptr::write_u64(oldlenp, written as u64) };
    0
}

// --- stat64 -------------------------------------------------------------

/// Fill a Darwin `struct stat64`: st_mode (16-bit) at +4 and st_size
/// (64-bit) at +96, everything else zero.
pub fn fill_stat64(buf: &mut [u8], mode: u16, size: u64) {
    for b in buf.iter_mut().take(STAT64_SIZE) {
        *b = 0;
    }
    buf[4..6].copy_from_slice(&mode.to_le_bytes());
    buf[96..104].copy_from_slice(&size.to_le_bytes());
}

fn sys_stat64(path_ptr: u64, statbuf: u64) -> i64 {
    // SAFETY: path_ptr is the caller's NUL-terminated path.
    let Some(path) = (unsafe { userptr::cstr(path_ptr, PATH_MAX) }) else {
        return -errno::EFAULT;
    };
    let Some((mode, size)) = fs::stat_path(path) else {
        return -errno::ENOENT;
    };
    // SAFETY: statbuf is the caller's stat64 out-structure.
    let Some(dst) = (unsafe { userptr::slice_mut(statbuf, STAT64_SIZE) }) else {
        return -errno::EFAULT;
    };
    fill_stat64(dst, mode, size);
    0
}

fn sys_fstat64(fd: i64, statbuf: u64) -> i64 {
    let Some((mode, size)) = fs::stat_fd(fd as i32) else {
        return -errno::EBADF;
    };
    // SAFETY: statbuf is the caller's stat64 out-structure.
    let Some(dst) = (unsafe { userptr::slice_mut(statbuf, STAT64_SIZE) }) else {
        return -errno::EFAULT;
    };
    fill_stat64(dst, mode, size);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_table() {
        assert_eq!(sysctl_lookup(1, 1), Some(SysctlValue::Str("Darwin")));
        assert_eq!(sysctl_lookup(1, 2), Some(SysctlValue::Str("23.0.0")));
        assert_eq!(sysctl_lookup(6, 3), Some(SysctlValue::U32(1)));
        assert_eq!(sysctl_lookup(6, 7), Some(SysctlValue::U32(4096)));
        assert_eq!(sysctl_lookup(6, 24), Some(SysctlValue::U64(1 << 30)));
        assert_eq!(sysctl_lookup(1, 99), None);
    }

    #[test]
    fn test_fill_stat64_offsets() {
        let mut buf = [0xAAu8; STAT64_SIZE];
        fill_stat64(&mut buf, 0o100755, 0x1234_5678_9ABC);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 0o100755);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[96..104]);
        assert_eq!(u64::from_le_bytes(size), 0x1234_5678_9ABC);
        // Everything else is zeroed.
        assert!(buf[6..96].iter().all(|&b| b == 0));
        assert!(buf[104..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_identity_stubs() {
        assert_eq!(dispatch(nr::GETPID, &[0; 6]), 1);
        assert_eq!(dispatch(nr::GETUID, &[0; 6]), 0);
        assert_eq!(dispatch(nr::GETEGID, &[0; 6]), 0);
        assert_eq!(dispatch(nr::THREAD_SELFID, &[0; 6]), 1);
        assert_eq!(dispatch(nr::ISSETUGID, &[0; 6]), 0);
        assert_eq!(dispatch(nr::GETDTABLESIZE, &[0; 6]), fs::MAX_FDS as i64);
    }

    #[test]
    fn test_write_rejects_unknown_fd() {
        let data = *b"hi";
        let args = [7, data.as_ptr() as u64, 2, 0, 0, 0];
        assert_eq!(dispatch(nr::WRITE, &args), -errno::EBADF);
    }

    #[test]
    fn test_write_serial_returns_count() {
        let data = *b"hi";
        let args = [1, data.as_ptr() as u64, 2, 0, 0, 0];
        assert_eq!(dispatch(nr::WRITE, &args), 2);
    }

    #[test]
    fn test_getentropy_fills() {
        let mut buf = [0u8; 32];
        let args = [buf.as_mut_ptr() as u64, 32, 0, 0, 0, 0];
        assert_eq!(dispatch(nr::GETENTROPY, &args), 0);
        assert!(buf.iter().any(|&b| b != 0));
        assert_eq!(dispatch(nr::GETENTROPY, &[0, 4096, 0, 0, 0, 0]), -errno::EINVAL);
    }

    #[test]
    fn test_getrlimit_reports_8mib() {
        let mut rl = [0u64; 2];
        let args = [0, rl.as_mut_ptr() as u64, 0, 0, 0, 0];
        assert_eq!(dispatch(nr::GETRLIMIT, &args), 0);
        assert_eq!(rl, [8 * 1024 * 1024, 8 * 1024 * 1024]);
    }

    #[test]
    fn test_sigprocmask_tracks_and_clears_oset() {
        let set: u64 = 0b1010;
        let mut oset: u64 = 0xDEAD;
        let args = [
            3,
            &set as *const u64 as u64,
            &mut oset as *mut u64 as u64,
            0,
            0,
            0,
        ];
        assert_eq!(dispatch(nr::SIGPROCMASK, &args), 0);
        assert_eq!(oset, 0);
        assert_eq!(SIG_MASK.load(Ordering::Relaxed) & 0b1010, 0b1010);
    }

    #[test]
    fn test_unknown_number_returns_zero() {
        assert_eq!(dispatch(400, &[0; 6]), 0);
    }

    #[test]
    fn test_sysctl_string_roundtrip() {
        let mib: [u32; 2] = [1, 1];
        let mut out = [0u8; 16];
        let mut outlen: u64 = out.len() as u64;
        let args = [
            mib.as_ptr() as u64,
            2,
            out.as_mut_ptr() as u64,
            &mut outlen as *mut u64 as u64,
            0,
            0,
        ];
        assert_eq!(dispatch(nr::SYSCTL, &args), 0);
        assert_eq!(&out[..7], b"Darwin\0");
        assert_eq!(outlen, 7);
    }
}
