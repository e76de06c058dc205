//! Mach traps.
//!
//! The subset dyld exercises while bringing itself up: vm_allocate for its
//! heaps, the port-name traps for self ports and reply ports, mach_msg
//! stubs, and no-op semaphores. Argument positions follow the XNU trap
//! signatures (first argument is the target task, which this kernel
//! ignores -- there is only one task).

use crate::{
    darwin::ports,
    mm::{paging::EntryFlags, vmm},
    syscall::userptr,
};

/// KERN_SUCCESS.
const KERN_SUCCESS: i64 = 0;
/// KERN_NO_SPACE: address space exhausted.
const KERN_NO_SPACE: i64 = 3;
/// KERN_INVALID_ARGUMENT.
const KERN_INVALID_ARGUMENT: i64 = 4;

/// mach_msg option bits.
const MACH_SEND_MSG: u64 = 1;
const MACH_RCV_MSG: u64 = 2;

/// Returned for any receive: nothing ever sends to us.
pub const MACH_RCV_TIMED_OUT: i64 = 0x1000_4003;

/// Trap numbers (XNU syscall_sw.c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachTrap {
    VmAllocate = 10,
    VmDeallocate = 12,
    VmProtect = 14,
    VmMap = 15,
    PortAllocate = 16,
    PortDeallocate = 18,
    PortModRefs = 19,
    PortInsertRight = 21,
    PortConstruct = 24,
    ReplyPort = 26,
    ThreadSelf = 27,
    TaskSelf = 28,
    HostSelf = 29,
    MachMsg = 31,
    MachMsgOverwrite = 32,
    SemaphoreSignal = 33,
    SemaphoreWait = 36,
}

impl TryFrom<u64> for MachTrap {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        match value {
            10 => Ok(Self::VmAllocate),
            12 => Ok(Self::VmDeallocate),
            14 => Ok(Self::VmProtect),
            15 => Ok(Self::VmMap),
            16 => Ok(Self::PortAllocate),
            18 => Ok(Self::PortDeallocate),
            19 => Ok(Self::PortModRefs),
            21 => Ok(Self::PortInsertRight),
            24 => Ok(Self::PortConstruct),
            26 => Ok(Self::ReplyPort),
            27 => Ok(Self::ThreadSelf),
            28 => Ok(Self::TaskSelf),
            29 => Ok(Self::HostSelf),
            31 => Ok(Self::MachMsg),
            32 => Ok(Self::MachMsgOverwrite),
            33 => Ok(Self::SemaphoreSignal),
            36 => Ok(Self::SemaphoreWait),
            _ => Err(()),
        }
    }
}

pub fn dispatch(number: u64, args: &[u64; 6]) -> i64 {
    let Ok(trap) = MachTrap::try_from(number) else {
        log::warn!("mach trap {} unimplemented, returning 0", number);
        return 0;
    };

    match trap {
        // mach_vm_allocate(task, *address, size, flags)
        MachTrap::VmAllocate => {
            let size = args[2];
            match vmm::mmap(0, size, EntryFlags::WRITABLE | EntryFlags::USER, None) {
                Ok(base) => {
                    // SAFETY: args[1] is the caller's out-pointer for the
                    // chosen address.
                    if unsafe { userptr::write_u64(args[1], base) } {
                        KERN_SUCCESS
                    } else {
                        KERN_INVALID_ARGUMENT
                    }
                }
                Err(_) => KERN_NO_SPACE,
            }
        }
        // One shared address space, no protections to maintain, no
        // refcounts: success is the correct answer.
        MachTrap::VmDeallocate
        | MachTrap::VmProtect
        | MachTrap::VmMap
        | MachTrap::PortDeallocate
        | MachTrap::PortModRefs
        | MachTrap::PortInsertRight
        | MachTrap::SemaphoreSignal
        | MachTrap::SemaphoreWait => KERN_SUCCESS,
        // mach_port_allocate(task, right, *name)
        MachTrap::PortAllocate => {
            let name = ports::allocate_name();
            // SAFETY: args[2] is the caller's out-pointer for the name.
            if unsafe { userptr::write_u32(args[2], name) } {
                KERN_SUCCESS
            } else {
                KERN_INVALID_ARGUMENT
            }
        }
        // mach_port_construct(task, options, context, *name)
        MachTrap::PortConstruct => {
            let name = ports::allocate_name();
            // SAFETY: args[3] is the caller's out-pointer for the name.
            if unsafe { userptr::write_u32(args[3], name) } {
                KERN_SUCCESS
            } else {
                KERN_INVALID_ARGUMENT
            }
        }
        MachTrap::ReplyPort => ports::allocate_name() as i64,
        MachTrap::ThreadSelf => ports::THREAD_SELF as i64,
        MachTrap::TaskSelf => ports::TASK_SELF as i64,
        MachTrap::HostSelf => ports::HOST_SELF as i64,
        MachTrap::MachMsg | MachTrap::MachMsgOverwrite => mach_msg(args),
    }
}

/// mach_msg(msg, options, send_size, rcv_size, rcv_name, timeout, notify).
/// Sends are acknowledged after a diagnostic peek at the header; receives
/// time out immediately -- there is nobody to hear from.
fn mach_msg(args: &[u64; 6]) -> i64 {
    let options = args[1];
    if options & MACH_SEND_MSG != 0 && args[0] != 0 {
        // mach_msg_header_t: bits, size, remote_port, local_port,
        // voucher_port, id.
        // SAFETY: args[0] is the caller's message buffer; the header is 24
        // bytes.
        let id = unsafe { userptr::read_u32(args[0] + 20) }.unwrap_or(0);
        log::debug!("mach_msg send, msgh_id={}", id);
    }
    if options & MACH_RCV_MSG != 0 {
        return MACH_RCV_TIMED_OUT;
    }
    KERN_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_traps_return_well_known_names() {
        assert_eq!(dispatch(27, &[0; 6]), ports::THREAD_SELF as i64);
        assert_eq!(dispatch(28, &[0; 6]), ports::TASK_SELF as i64);
        assert_eq!(dispatch(29, &[0; 6]), ports::HOST_SELF as i64);
    }

    #[test]
    fn test_noop_traps_succeed() {
        for number in [12, 14, 15, 18, 19, 21, 33, 36] {
            assert_eq!(dispatch(number, &[0; 6]), 0);
        }
    }

    #[test]
    fn test_reply_ports_are_fresh() {
        let a = dispatch(26, &[0; 6]);
        let b = dispatch(26, &[0; 6]);
        assert_ne!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_port_allocate_writes_name() {
        let mut name: u32 = 0;
        let args = [0, 0, &mut name as *mut u32 as u64, 0, 0, 0];
        assert_eq!(dispatch(16, &args), 0);
        assert!(name >= 0x1000);
    }

    #[test]
    fn test_port_allocate_null_pointer() {
        assert_eq!(dispatch(16, &[0; 6]), KERN_INVALID_ARGUMENT);
    }

    #[test]
    fn test_rcv_times_out() {
        assert_eq!(dispatch(31, &[0, MACH_RCV_MSG, 0, 0, 0, 0]), 0x1000_4003);
    }

    #[test]
    fn test_unknown_trap_returns_zero() {
        assert_eq!(dispatch(99, &[0; 6]), 0);
    }
}
