// Interrupt Descriptor Table and exception reporting.
//
// Every exception vector 0-20 gets a handler that dumps a uniform picture
// of the fault (vector, error code, saved frame, CR2, both GS base MSRs)
// to the serial console and halts. There is no recovery: a fault while
// dyld runs is a diagnosis problem, not a scheduling problem. Vector 8
// (double fault) runs on the dedicated IST1 stack so even a kernel stack
// overflow produces a report.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

macro_rules! fault_handler {
    ($name:ident, $vector:expr, $label:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            report(stack_frame, $vector, $label, None);
        }
    };
}

macro_rules! fault_handler_with_code {
    ($name:ident, $vector:expr, $label:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, error_code: u64) {
            report(stack_frame, $vector, $label, Some(error_code));
        }
    };
}

fault_handler!(divide_error_handler, 0, "DIVIDE ERROR");
fault_handler!(debug_handler, 1, "DEBUG");
fault_handler!(nmi_handler, 2, "NON-MASKABLE INTERRUPT");
fault_handler!(breakpoint_handler, 3, "BREAKPOINT");
fault_handler!(overflow_handler, 4, "OVERFLOW");
fault_handler!(bound_range_handler, 5, "BOUND RANGE EXCEEDED");
fault_handler!(invalid_opcode_handler, 6, "INVALID OPCODE");
fault_handler!(device_not_available_handler, 7, "DEVICE NOT AVAILABLE");
fault_handler_with_code!(invalid_tss_handler, 10, "INVALID TSS");
fault_handler_with_code!(segment_not_present_handler, 11, "SEGMENT NOT PRESENT");
fault_handler_with_code!(stack_segment_handler, 12, "STACK SEGMENT FAULT");
fault_handler_with_code!(general_protection_fault_handler, 13, "GENERAL PROTECTION FAULT");
fault_handler!(x87_floating_point_handler, 16, "x87 FLOATING POINT");
fault_handler_with_code!(alignment_check_handler, 17, "ALIGNMENT CHECK");
fault_handler!(simd_floating_point_handler, 19, "SIMD FLOATING POINT");
fault_handler!(virtualization_handler, 20, "VIRTUALIZATION");
fault_handler!(generic_handler, 0xFF, "UNEXPECTED INTERRUPT");

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        // SAFETY: DOUBLE_FAULT_IST_INDEX names an interrupt_stack_table slot
        // that gdt::init() points at a real, dedicated stack.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        // Anything above the exception range shares one reporting stub; the
        // PICs are masked, so these should never fire.
        for vector in 32..=255u8 {
            idt[vector].set_handler_fn(generic_handler);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Render the uniform trap picture and park the CPU.
fn report(stack_frame: InterruptStackFrame, vector: u16, label: &str, error_code: Option<u64>) -> ! {
    use x86_64::registers::{
        control::Cr2,
        model_specific::{GsBase, KernelGsBase},
    };

    println!("EXCEPTION: {} (vector {})", label, vector);
    if let Some(code) = error_code {
        println!("Error Code: {:#x}", code);
    }
    println!("{:#?}", stack_frame);
    println!("CR2: {:?}", Cr2::read());
    println!(
        "GS_BASE: {:#x}  KERNEL_GS_BASE: {:#x}",
        GsBase::read().as_u64(),
        KernelGsBase::read().as_u64()
    );
    crate::arch::halt();
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, error_code: u64) -> ! {
    report(stack_frame, 8, "DOUBLE FAULT", Some(error_code));
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    report(stack_frame, 18, "MACHINE CHECK", None);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    report(stack_frame, 14, "PAGE FAULT", Some(error_code.bits()));
}
