//! User-mode entry point for x86_64.
//!
//! Provides `enter_usermode()`, which pushes the iretq frame and drops the
//! CPU from Ring 0 to Ring 3 for the first (and only) time. There is no
//! way back except the SYSCALL entry and the fault vectors.

use core::arch::asm;

/// User code selector: GDT slot 0x20 with RPL 3.
pub const USER_CS: u64 = 0x20 | 3;
/// User data/stack selector: GDT slot 0x18 with RPL 3.
pub const USER_SS: u64 = 0x18 | 3;

/// Initial user RFLAGS: reserved bit 1 plus IF. Interrupts are nominally
/// enabled in ring 3 even though every PIC line is masked.
const USER_RFLAGS: u64 = 0x202;

/// Enter user mode via iretq.
///
/// The iretq instruction pops RIP, CS, RFLAGS, RSP, SS from the stack and
/// transitions the CPU to the privilege level in the CS selector's RPL
/// field.
///
/// # Safety
/// - `entry_point` must be a mapped, user-executable address (dyld's entry)
/// - `user_stack` must point into the mapped user stack (the KernelArgs SP)
/// - The GDT user descriptors, TSS.RSP0, syscall MSRs, and the kernel GS
///   block must all be installed first, otherwise the first syscall or
///   fault after the descent is unrecoverable
pub unsafe fn enter_usermode(entry_point: u64, user_stack: u64) -> ! {
    // SAFETY: We build the iretq frame on the current kernel stack.
    // iretq expects (from top of stack): RIP, CS, RFLAGS, RSP, SS.
    // DS/ES/FS/GS are loaded with the user data selector; the GS *base*
    // pair was staged by syscall::init() so the first SWAPGS lands on the
    // kernel block. The caller guarantees the frame values point at valid
    // user mappings.
    unsafe {
        asm!(
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            "mov fs, {ss:r}",
            "mov gs, {ss:r}",
            "push {ss}",       // SS
            "push {rsp}",      // RSP (user stack)
            "push {rflags}",   // RFLAGS
            "push {cs}",       // CS
            "push {rip}",      // RIP (entry point)
            "iretq",
            ss = in(reg) USER_SS,
            rsp = in(reg) user_stack,
            rflags = in(reg) USER_RFLAGS,
            cs = in(reg) USER_CS,
            rip = in(reg) entry_point,
            options(noreturn)
        );
    }
}
