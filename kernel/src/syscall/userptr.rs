//! User-pointer access helpers.
//!
//! Userspace and the kernel share the one address space, so a user pointer
//! is directly dereferenceable once it is non-null; a wild pointer faults
//! into the exception dispatcher, which is this kernel's documented
//! failure mode. These helpers centralize the null checks and the
//! slice/string construction so the syscall handlers stay readable.

/// Write a u64 through a user pointer. Returns false on a null pointer.
///
/// # Safety
/// `addr`, when non-null, must point at 8 writable bytes in the shared
/// address space.
pub unsafe fn write_u64(addr: u64, value: u64) -> bool {
    if addr == 0 {
        return false;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    unsafe { (addr as *mut u64).write_volatile(value) };
    true
}

/// Write a u32 through a user pointer.
///
/// # Safety
/// As [`write_u64`], with 4 writable bytes.
pub unsafe fn write_u32(addr: u64, value: u32) -> bool {
    if addr == 0 {
        return false;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    unsafe { (addr as *mut u32).write_volatile(value) };
    true
}

/// Read a u32 through a user pointer.
///
/// # Safety
/// `addr`, when non-null, must point at 4 readable bytes.
pub unsafe fn read_u32(addr: u64) -> Option<u32> {
    if addr == 0 {
        return None;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    Some(unsafe { (addr as *const u32).read_volatile() })
}

/// Read a u64 through a user pointer.
///
/// # Safety
/// `addr`, when non-null, must point at 8 readable bytes.
pub unsafe fn read_u64(addr: u64) -> Option<u64> {
    if addr == 0 {
        return None;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    Some(unsafe { (addr as *const u64).read_volatile() })
}

/// Borrow `len` user bytes read-only.
///
/// # Safety
/// `addr`, when non-null, must point at `len` readable bytes that stay
/// untouched for the borrow's (short, handler-local) lifetime.
pub unsafe fn slice<'a>(addr: u64, len: usize) -> Option<&'a [u8]> {
    if addr == 0 {
        return None;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

/// Borrow `len` user bytes writable.
///
/// # Safety
/// As [`slice`], but the bytes must be writable and unaliased for the
/// borrow's lifetime.
pub unsafe fn slice_mut<'a>(addr: u64, len: usize) -> Option<&'a mut [u8]> {
    if addr == 0 {
        return None;
    }
    // SAFETY: non-null per the check; validity is the caller's contract.
    Some(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Borrow a NUL-terminated user string, bounded by `max` bytes.
///
/// # Safety
/// `addr`, when non-null, must point at readable memory up to the NUL (or
/// `max`).
pub unsafe fn cstr<'a>(addr: u64, max: usize) -> Option<&'a str> {
    if addr == 0 {
        return None;
    }
    let base = addr as *const u8;
    let mut len = 0;
    // SAFETY: non-null per the check; we probe byte by byte up to `max`.
    while len < max && unsafe { base.add(len).read() } != 0 {
        len += 1;
    }
    // SAFETY: the range was just probed readable.
    let bytes = unsafe { core::slice::from_raw_parts(base, len) };
    core::str::from_utf8(bytes).ok()
}
