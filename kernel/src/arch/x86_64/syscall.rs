//! x86_64 SYSCALL entry point and MSR configuration.
//!
//! Userspace enters through the `SYSCALL` instruction with the Darwin ABI:
//! class-encoded number in RAX, arguments in RDI/RSI/RDX/R10/R8/R9. The
//! naked stub swaps to the kernel GS block, switches stacks, spills the
//! machine state into a [`SyscallFrame`], and calls the class dispatcher;
//! the numeric result rides back to ring 3 in RAX via `sysretq`.

#![allow(function_casts_as_integer)]

use x86_64::VirtAddr;

use super::gdt;

/// Per-CPU block reached via SWAPGS. Offsets are baked into the entry stub:
/// `gs:[0]` = kernel stack top, `gs:[8]` = saved user RSP.
#[repr(C)]
pub struct KernelGs {
    pub kernel_rsp: u64,
    pub user_rsp: u64,
}

static mut KERNEL_GS: KernelGs = KernelGs {
    kernel_rsp: 0,
    user_rsp: 0,
};

/// Register state captured by the entry stub, in push order (last push at
/// offset 0). `rax` carries the syscall number in and the return value out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    pub r9: u64,
    pub r8: u64,
    pub r10: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rax: u64,
    pub user_rsp: u64,
    /// User RFLAGS, restored by SYSRET from R11.
    pub rflags: u64,
    /// User RIP, restored by SYSRET from RCX.
    pub rip: u64,
}

/// SYSCALL instruction entry point.
///
/// # Safety
/// Must only be entered by the CPU's SYSCALL instruction after `init()` has
/// programmed LSTAR and the kernel GS block; it assumes the SYSCALL register
/// contract (return RIP in RCX, RFLAGS in R11).
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Switch to the kernel GS block and stack.
        "swapgs",
        "mov gs:[8], rsp",           // Save user RSP
        "mov rsp, gs:[0]",           // Load kernel RSP
        // Build the SyscallFrame (see struct layout above).
        "push rcx",                  // User RIP
        "push r11",                  // User RFLAGS
        "push qword ptr gs:[8]",     // User RSP
        "push rax",                  // Syscall number
        "push rdi",
        "push rsi",
        "push rdx",
        "push r10",
        "push r8",
        "push r9",
        // 10 pushes keep RSP 16-byte aligned; the call below gives the
        // handler the ABI-required RSP mod 16 == 8.
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r9",
        "pop r8",
        "pop r10",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop rax",                   // Return value written by the dispatcher
        "add rsp, 8",                // Drop the saved user RSP copy
        "pop r11",                   // User RFLAGS
        "pop rcx",                   // User RIP
        "mov rsp, gs:[8]",           // Restore user RSP
        "swapgs",
        "sysretq",
        dispatch = sym crate::syscall::syscall_dispatch,
    );
}

/// Program the SYSCALL/SYSRET machinery and the GS base pair.
pub fn init() {
    use x86_64::registers::{
        control::{Cr4, Cr4Flags},
        model_specific::{Efer, EferFlags, GsBase, KernelGsBase, LStar, SFMask, Star},
        rflags::RFlags,
    };

    let selectors = gdt::selectors();

    // SAFETY: LSTAR points at the entry stub above; STAR is derived from the
    // GDT layout installed by gdt::init() (SYSRET lands on the user
    // descriptors, SYSCALL on the kernel pair); SFMASK = 0 leaves RFLAGS
    // untouched on entry per the external syscall contract; FSGSBASE lets
    // dyld read its TLS base with RDGSBASE.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(
            selectors.user_code_selector,
            selectors.user_data_selector,
            selectors.code_selector,
            selectors.data_selector,
        )
        .expect("GDT layout incompatible with SYSRET");
        SFMask::write(RFlags::empty());
        Cr4::update(|flags| {
            flags.insert(Cr4Flags::FSGSBASE);
        });
    }

    // Publish the kernel GS block. GS_BASE starts as the (empty) user TLS
    // base; the first SWAPGS in the entry stub brings the kernel block in.
    // SAFETY: KERNEL_GS is only ever touched from this single-threaded
    // kernel; the block lives for the kernel's lifetime.
    unsafe {
        let block = &raw mut KERNEL_GS;
        (*block).kernel_rsp = gdt::kernel_stack_top();
        KernelGsBase::write(VirtAddr::new(block as u64));
        GsBase::write(VirtAddr::new(0));
    }
    log::debug!(
        "SYSCALL configured: lstar={:#x}",
        syscall_entry as usize as u64
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout_matches_entry_stub() {
        // The entry stub's push sequence fixes these offsets; the dispatcher
        // relies on them through the #[repr(C)] layout.
        assert_eq!(core::mem::offset_of!(SyscallFrame, r9), 0);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rax), 48);
        assert_eq!(core::mem::offset_of!(SyscallFrame, user_rsp), 56);
        assert_eq!(core::mem::offset_of!(SyscallFrame, rip), 72);
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 80);
    }
}
