//! Darwin personality pieces that are not syscalls: the dyld KernelArgs
//! stack frame, the commpage, and Mach port names.

pub mod commpage;
pub mod ports;
pub mod stack;
