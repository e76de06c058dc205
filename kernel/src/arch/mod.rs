//! Architecture support. Quartz targets x86-64 only.

pub mod x86_64;

/// Park the CPU. Used for fatal errors and the `exit` syscall; there is no
/// scheduler to return to.
pub fn halt() -> ! {
    #[cfg(target_arch = "x86_64")]
    loop {
        ::x86_64::instructions::hlt();
    }
    #[cfg(not(target_arch = "x86_64"))]
    loop {}
}
