//! Machine-dependent traps.
//!
//! One matters: `thread_fast_set_cthread_self` (number 3) stores the
//! thread-local-storage pointer in IA32_KERNEL_GS_BASE, so the SWAPGS on
//! the way back to ring 3 makes it the user GS base. dyld calls this
//! before touching any `%gs:`-relative state.

use crate::arch::x86_64::msr;

/// thread_fast_set_cthread_self.
const SET_CTHREAD_SELF: u64 = 3;

pub fn dispatch(number: u64, args: &[u64; 6]) -> i64 {
    match number {
        SET_CTHREAD_SELF => {
            msr::wrmsr(msr::IA32_KERNEL_GS_BASE, args[0]);
            log::debug!("cthread_self = {:#x}", args[0]);
            0
        }
        _ => {
            log::warn!("mdep trap {} unimplemented, returning 0", number);
            0
        }
    }
}
