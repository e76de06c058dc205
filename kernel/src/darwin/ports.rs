//! Mach port names.
//!
//! Ports here are opaque 32-bit names and nothing more: there are no
//! message queues and no reference counts behind them. dyld only needs the
//! well-known self names to be stable and freshly allocated names to be
//! distinct; deallocation is a no-op.

use core::sync::atomic::{AtomicU32, Ordering};

/// Well-known name returned by the `task_self` trap.
pub const TASK_SELF: u32 = 0x103;
/// Well-known name returned by the `thread_self` trap.
pub const THREAD_SELF: u32 = 0x203;
/// Well-known name returned by the `host_self` trap.
pub const HOST_SELF: u32 = 0x303;

/// Start of the dynamically allocated name range, clear of the well-known
/// constants.
const DYNAMIC_BASE: u32 = 0x1000;

static NEXT_NAME: AtomicU32 = AtomicU32::new(DYNAMIC_BASE);

/// Mint a fresh port name.
pub fn allocate_name() -> u32 {
    NEXT_NAME.fetch_add(4, Ordering::Relaxed)
}

/// Release a port name. No-op: names are never reused.
pub fn deallocate_name(_name: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_distinct() {
        let a = allocate_name();
        let b = allocate_name();
        assert_ne!(a, b);
        assert!(a >= DYNAMIC_BASE);
        assert!(b >= DYNAMIC_BASE);
    }

    #[test]
    fn test_well_known_names_are_reserved() {
        for _ in 0..64 {
            let name = allocate_name();
            assert_ne!(name, TASK_SELF);
            assert_ne!(name, THREAD_SELF);
            assert_ne!(name, HOST_SELF);
        }
    }
}
