// Boot trampoline: Multiboot headers and the 32-bit -> long-mode bridge.
//
// This file is the "external collaborator" assembly: everything before
// kmain() runs. A Multiboot loader drops us at `_start` in 32-bit
// protected mode with the magic in EAX and the info pointer in EBX. The
// trampoline identity-maps the first GiB with 2 MiB pages (the VMM later
// splits these on demand), enables long mode, and calls kmain(magic, info)
// on the boot stack whose top is exported as `stack_top`.

use core::arch::global_asm;

global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

// Multiboot 2 header (GRUB)
mb2_header_start:
    .long 0xe85250d6                // magic number
    .long 0                         // architecture (0 = i386)
    .long mb2_header_end - mb2_header_start
    .long -(0xe85250d6 + 0 + (mb2_header_end - mb2_header_start))
    // End tag
    .word 0
    .word 0
    .long 8
mb2_header_end:

// Multiboot 1 header (QEMU -kernel)
.align 4
    .long 0x1BADB002                // magic number
    .long 0x00000003                // flags: page-align modules + memory info
    .long -(0x1BADB002 + 0x00000003)

.section .bss
.align 4096
boot_pml4:
    .skip 4096
boot_pdpt:
    .skip 4096
boot_pd:
    .skip 4096
.align 16
stack_bottom:
    .skip 65536
.global stack_top
stack_top:

.section .rodata
.align 8
boot_gdt:
    .quad 0
    .quad 0x00209A0000000000        // 64-bit code, ring 0
    .quad 0x0000920000000000        // data, ring 0
boot_gdt_descriptor:
    .word boot_gdt_descriptor - boot_gdt - 1
    .long boot_gdt

.section .text
.code32
.global _start
_start:
    cli
    lea esp, [stack_top]
    mov edi, eax                    // multiboot magic
    mov esi, ebx                    // multiboot info address

    // PML4[0] -> PDPT, PDPT[0] -> PD, both present | writable.
    lea eax, [boot_pdpt]
    or eax, 3
    mov [boot_pml4], eax
    mov dword ptr [boot_pml4 + 4], 0
    lea eax, [boot_pd]
    or eax, 3
    mov [boot_pdpt], eax
    mov dword ptr [boot_pdpt + 4], 0

    // 512 x 2 MiB entries: identity map [0, 1 GiB) with PS set.
    xor ecx, ecx
2:
    mov eax, ecx
    shl eax, 21
    or eax, 0x83                    // present | writable | page-size
    mov [boot_pd + ecx*8], eax
    mov dword ptr [boot_pd + ecx*8 + 4], 0
    inc ecx
    cmp ecx, 512
    jne 2b

    // CR4.PAE
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax

    lea eax, [boot_pml4]
    mov cr3, eax

    // EFER.LME
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr

    // CR0.PG | CR0.PE
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    lgdt [boot_gdt_descriptor]

    // Far return into the 64-bit code segment.
    push 0x08
    lea eax, [long_mode_start]
    push eax
    retf

.code64
long_mode_start:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov fs, ax
    mov gs, ax
    lea rsp, [rip + stack_top]

    // kmain(magic: u32 in edi, info_addr: u64 in rsi); the 32-bit saves
    // above already zero-extended both.
    mov edi, edi
    mov esi, esi
    call kmain

    // kmain never returns; park just in case.
3:
    hlt
    jmp 3b
"#
);
