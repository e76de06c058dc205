// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// Index into the TSS interrupt stack table used by the double-fault gate
/// (hardware IST1).
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 16;

#[repr(align(16))]
#[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
struct AlignedStack([u8; STACK_SIZE]);

/// Ring-transition stack, installed as TSS.RSP0 and reached through the
/// kernel GS block by the syscall entry stub. Userspace runs on its own
/// stack; every ring-0 entry lands here.
static mut KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

/// Dedicated stack for the double-fault handler, so a stack-overflow-induced
/// #DF can still run to the point of diagnosis.
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = {
            let stack_ptr = &raw const KERNEL_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_ptr = &raw const DOUBLE_FAULT_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());     // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());     // 0x10
        let user_data_selector = gdt.append(Descriptor::user_data_segment());  // 0x18 (+ RPL 3 = 0x1B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment());  // 0x20 (+ RPL 3 = 0x23)
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));          // 0x28 (2 entries)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_data_selector,
                user_code_selector,
                tss_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: User data segment (Ring 3, selector 0x1B with RPL)
/// - 0x20: User code segment (Ring 3, selector 0x23 with RPL)
/// - 0x28: TSS (occupies 2 entries, 0x28-0x30)
///
/// User data precedes user code so that SYSRET's fixed arithmetic
/// (SS = STAR[63:48]+8, CS = STAR[63:48]+16) lands on them with RPL=3.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors come from GDT.1, which was computed from the
    // GDT we just loaded, so every register ends up referencing a valid
    // descriptor. CS/DS/ES/SS reloads and LTR are required after LGDT.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    log::debug!(
        "GDT loaded: kernel cs={:#x} user cs={:#x} ss={:#x}",
        GDT.1.code_selector.0,
        GDT.1.user_code_selector.0,
        GDT.1.user_data_selector.0
    );
}

/// Returns a reference to the GDT selectors (kernel and user mode).
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Top of the ring-transition kernel stack (TSS.RSP0). The syscall entry
/// stub loads the same value through the kernel GS block.
pub fn kernel_stack_top() -> u64 {
    let stack_ptr = &raw const KERNEL_STACK;
    stack_ptr as u64 + STACK_SIZE as u64
}
