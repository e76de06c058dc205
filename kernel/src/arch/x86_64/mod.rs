//! x86-64 CPU bring-up.
//!
//! `init()` installs the descriptor tables, programs the SYSCALL MSRs, and
//! masks the legacy PICs. Interrupt-driven I/O is a non-goal: after this
//! the only asynchronous entries into the kernel are exceptions and the
//! SYSCALL instruction.

#[cfg(target_os = "none")]
pub mod boot;
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
pub mod msr;
pub mod syscall;
pub mod usermode;

use pic8259::ChainedPics;
use spin::Mutex;

/// Vector bases the 8259 pair is remapped to before being masked, so any
/// spurious IRQ that slips through lands on a distinguishable vector
/// instead of an exception slot.
const PIC_1_OFFSET: u8 = 32;
const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

// SAFETY: 32/40 are outside the CPU-exception vector range.
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Bring the CPU into its steady state.
pub fn init() {
    gdt::init();
    #[cfg(target_os = "none")]
    idt::init();
    syscall::init();

    let mut pics = PICS.lock();
    // SAFETY: the standard 8259 I/O ports are present on every PC-compatible
    // machine QEMU emulates; we remap and then mask every line, which is the
    // whole interrupt policy of this kernel.
    unsafe {
        pics.initialize();
        pics.disable();
    }
    log::debug!("PICs remapped and masked");
}
