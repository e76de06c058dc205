//! Quartz kernel binary
//!
//! The real entry point is the `_start` trampoline emitted by
//! `arch::x86_64::boot`; this file only ties the library into a bootable
//! image and provides the panic handler. Host builds get a stub `main` so
//! the unit-test library links against std.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use quartz_kernel as kernel;
#[cfg(not(target_os = "none"))]
use quartz_kernel as _;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel::println!("[KERNEL PANIC] {}", info);
    kernel::arch::halt();
}

#[cfg(not(target_os = "none"))]
fn main() {}
