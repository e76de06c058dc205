//! The dyld KernelArgs stack frame.
//!
//! dyld4 expects RSP at entry to point at a `KernelArgs` block:
//!
//! | Offset | Value                                          |
//! |--------|------------------------------------------------|
//! | 0      | mach_header address of the main executable     |
//! | +8     | argc = 1                                       |
//! | +16    | argv[0] -> executable path string              |
//! | +24    | 0 (argv terminator)                            |
//! | +32    | 0 (envp terminator)                            |
//! | +40    | apple[0] -> "executable_path=<path>" string    |
//! | +48    | 0 (apple terminator)                           |
//!
//! The strings are carved out of the top of the stack, the aligned SP is
//! `(stack_top - 0x200) & !0xF`, and the block sits 56 bytes below it; the
//! block's address is what userspace gets as RSP.
//!
//! The layout math is pure over a byte buffer so it is host-testable;
//! [`map_user_stack`] maps the real region and runs it there.

use crate::error::KernelError;

/// Top of the user stack.
pub const USER_STACK_TOP: u64 = 0x2000_0000;

/// Mapped stack size. dyld needs a few KiB before the main image takes
/// over; 64 KiB is comfortable.
pub const USER_STACK_SIZE: u64 = 0x1_0000;

/// Gap reserved above the aligned SP for the string area.
const STRING_AREA: u64 = 0x200;

/// Number of KernelArgs words.
const KERNEL_ARGS_WORDS: usize = 7;

const APPLE_PREFIX: &str = "executable_path=";

fn put_u64(buf: &mut [u8], index: usize, value: u64) {
    buf[index..index + 8].copy_from_slice(&value.to_le_bytes());
}

/// Write the KernelArgs frame into `buf`, which backs the virtual range
/// `[stack_top - buf.len(), stack_top)`. Returns the user SP.
pub fn build_kernel_args(
    buf: &mut [u8],
    stack_top: u64,
    text_base: u64,
    exec_path: &str,
) -> Result<u64, KernelError> {
    let strings_len = (exec_path.len() + 1) + (APPLE_PREFIX.len() + exec_path.len() + 1);
    if strings_len as u64 + KERNEL_ARGS_WORDS as u64 * 8 + 16 > STRING_AREA {
        return Err(KernelError::InvalidArgument { name: "exec_path" });
    }
    if (buf.len() as u64) < STRING_AREA + 0x100 {
        return Err(KernelError::InvalidArgument { name: "stack" });
    }
    let stack_base = stack_top - buf.len() as u64;

    // Path string, NUL-terminated, at the very top.
    let path_addr = stack_top - (exec_path.len() as u64 + 1);
    let path_index = (path_addr - stack_base) as usize;
    buf[path_index..path_index + exec_path.len()].copy_from_slice(exec_path.as_bytes());
    buf[path_index + exec_path.len()] = 0;

    // apple[0] below it.
    let apple_len = APPLE_PREFIX.len() + exec_path.len() + 1;
    let apple_addr = path_addr - apple_len as u64;
    let apple_index = (apple_addr - stack_base) as usize;
    buf[apple_index..apple_index + APPLE_PREFIX.len()].copy_from_slice(APPLE_PREFIX.as_bytes());
    buf[apple_index + APPLE_PREFIX.len()..apple_index + APPLE_PREFIX.len() + exec_path.len()]
        .copy_from_slice(exec_path.as_bytes());
    buf[apple_index + apple_len - 1] = 0;

    // The frame itself.
    let aligned_sp = (stack_top - STRING_AREA) & !0xF;
    let sp = aligned_sp - KERNEL_ARGS_WORDS as u64 * 8;
    let frame = (sp - stack_base) as usize;
    put_u64(buf, frame, text_base);
    put_u64(buf, frame + 8, 1); // argc
    put_u64(buf, frame + 16, path_addr); // argv[0]
    put_u64(buf, frame + 24, 0); // argv terminator
    put_u64(buf, frame + 32, 0); // envp terminator
    put_u64(buf, frame + 40, apple_addr); // apple[0]
    put_u64(buf, frame + 48, 0); // apple terminator

    Ok(sp)
}

/// Map the user stack and build the KernelArgs frame in it. Returns the
/// initial user SP.
pub fn map_user_stack(text_base: u64, exec_path: &str) -> Result<u64, KernelError> {
    use crate::mm::{paging::EntryFlags, vmm};

    let base = USER_STACK_TOP - USER_STACK_SIZE;
    // The stack sits inside the boot identity map's 2 MiB pages, so this
    // mmap is also what exercises the huge-page split.
    vmm::mmap(
        base,
        USER_STACK_SIZE,
        EntryFlags::WRITABLE | EntryFlags::USER,
        None,
    )?;

    // SAFETY: [base, USER_STACK_TOP) was just mapped writable in the
    // shared address space and is exclusively the user stack.
    let buf =
        unsafe { core::slice::from_raw_parts_mut(base as *mut u8, USER_STACK_SIZE as usize) };
    build_kernel_args(buf, USER_STACK_TOP, text_base, exec_path)
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn read_u64(buf: &[u8], index: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[index..index + 8]);
        u64::from_le_bytes(raw)
    }

    #[test]
    fn test_frame_layout() {
        let mut buf = vec![0u8; USER_STACK_SIZE as usize];
        let text_base = 0x0200_0000u64;
        let sp = build_kernel_args(&mut buf, USER_STACK_TOP, text_base, "bin/zsh").unwrap();

        // The seven words sit at SP, 56 bytes below the 16-byte-aligned
        // string boundary.
        assert_eq!((sp + 56) % 16, 0);
        assert_eq!(sp + 56, (USER_STACK_TOP - 0x200) & !0xF);

        let base = USER_STACK_TOP - buf.len() as u64;
        let frame = (sp - base) as usize;
        assert_eq!(read_u64(&buf, frame), text_base);
        assert_eq!(read_u64(&buf, frame + 8), 1);
        assert_eq!(read_u64(&buf, frame + 24), 0);
        assert_eq!(read_u64(&buf, frame + 32), 0);
        assert_eq!(read_u64(&buf, frame + 48), 0);
    }

    #[test]
    fn test_strings_resolve() {
        let mut buf = vec![0u8; USER_STACK_SIZE as usize];
        let sp = build_kernel_args(&mut buf, USER_STACK_TOP, 0x1000, "init").unwrap();
        let base = USER_STACK_TOP - buf.len() as u64;
        let frame = (sp - base) as usize;

        let argv0 = read_u64(&buf, frame + 16);
        let apple0 = read_u64(&buf, frame + 40);
        assert!(argv0 > sp && argv0 < USER_STACK_TOP);
        assert!(apple0 > sp && apple0 < argv0);

        let argv0_index = (argv0 - base) as usize;
        assert_eq!(&buf[argv0_index..argv0_index + 5], b"init\0");
        let apple_index = (apple0 - base) as usize;
        assert_eq!(
            &buf[apple_index..apple_index + 21],
            b"executable_path=init\0"
        );
    }

    #[test]
    fn test_sp_inside_mapped_range() {
        let mut buf = vec![0u8; USER_STACK_SIZE as usize];
        let sp = build_kernel_args(&mut buf, USER_STACK_TOP, 0, "bin/zsh").unwrap();
        assert!(sp >= USER_STACK_TOP - USER_STACK_SIZE);
        assert!(sp < USER_STACK_TOP);
        assert_eq!(sp % 8, 0);
    }

    #[test]
    fn test_oversized_path_rejected() {
        let mut buf = vec![0u8; USER_STACK_SIZE as usize];
        let long = alloc::string::String::from_utf8(vec![b'a'; 400]).unwrap();
        assert!(build_kernel_args(&mut buf, USER_STACK_TOP, 0, &long).is_err());
    }
}
