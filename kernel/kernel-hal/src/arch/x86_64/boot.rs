//! # Boot Stage
//!
//! The bootloader drops us in 32-bit protected mode with the hand-off
//! magic in `EAX` and the boot-descriptor address in `EBX`. Everything
//! here runs before any Rust code can: stack, zeroed `.bss`, an identity
//! map built from statically reserved table frames (one level-4 table and
//! one level-3 table of 1 GiB blocks covering the low 4 GiB - the minimum
//! depth the architecture allows for the largest convenient block size),
//! PAE, long mode, paging, and a far return through a temporary GDT to
//! reload the code segment as 64-bit before the first 64-bit instruction.
//!
//! Nothing can fail gracefully this early; a machine that cannot complete
//! this sequence simply never reaches `kernel_entry`.

#[cfg(target_os = "none")]
core::arch::global_asm!(
    // ── Multiboot2-style header ────────────────────────────────────
    ".section .boot.header, \"a\"",
    ".align 8",
    "2:",
    ".long 0xE85250D6",     // hand-off protocol magic
    ".long 0",              // architecture: i386 protected mode
    ".long 3f - 2b",        // header length
    ".long -(0xE85250D6 + 0 + (3f - 2b))", // checksum
    ".word 0",              // end tag
    ".word 0",
    ".long 8",
    "3:",
    // ── 32-bit entry ───────────────────────────────────────────────
    ".section .boot.text, \"ax\"",
    ".code32",
    ".global _start",
    "_start:",
    "cli",
    "lea esp, [boot_stack_top]",
    // Park the hand-off registers where the boot code never touches
    // them: magic in EBP, descriptor address in ESI.
    "mov ebp, eax",
    "mov esi, ebx",
    // Zero every statically-allocated-but-uninitialized byte before any
    // Rust code can observe it. The boot page tables live outside .bss
    // so this cannot wipe them later.
    "lea edi, [__bss_start]",
    "lea ecx, [__bss_end]",
    "sub ecx, edi",
    "xor eax, eax",
    "rep stosb",
    // Identity map: L4[0] -> L3, L3[0..4] = 1 GiB blocks over 0..4 GiB.
    // 0x83 = present | writable | block.
    "lea eax, [boot_pdpt]",
    "or eax, 0x3",
    "mov [boot_pml4], eax",
    "mov dword ptr [boot_pdpt + 0], 0x00000083",
    "mov dword ptr [boot_pdpt + 8], 0x40000083",
    "mov dword ptr [boot_pdpt + 16], 0x80000083",
    "mov dword ptr [boot_pdpt + 24], 0xC0000083",
    // Physical-address extensions on, root table loaded.
    "mov eax, cr4",
    "or eax, 1 << 5",
    "mov cr4, eax",
    "lea eax, [boot_pml4]",
    "mov cr3, eax",
    // Long-mode enable bit in the extended feature register.
    "mov ecx, 0xC0000080",
    "rdmsr",
    "or eax, 1 << 8",
    "wrmsr",
    // Paging + write protection on: the CPU is now in compatibility
    // mode, one far jump away from 64-bit code.
    "mov eax, cr0",
    "or eax, 0x80010001",
    "mov cr0, eax",
    "lgdt [boot_gdt_ptr]",
    // Far return into the 64-bit code segment.
    "push 0x08",
    "lea eax, [long_mode_entry]",
    "push eax",
    "retf",
    // ── 64-bit entry ───────────────────────────────────────────────
    ".code64",
    "long_mode_entry:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "xor eax, eax",
    "mov fs, ax",
    "mov gs, ax",
    "lea rsp, [rip + boot_stack_top]",
    // Hand-off arguments per the C ABI; 32-bit writes zero-extend, which
    // also scrubs whatever the mode switch left in the upper halves.
    "mov edi, ebp",
    "mov esi, esi",
    "xor ebp, ebp",
    "call kernel_entry",
    // kernel_entry never returns; if it somehow does, park the core.
    "4:",
    "hlt",
    "jmp 4b",
    // ── Temporary descriptor table ─────────────────────────────────
    ".section .boot.rodata, \"a\"",
    ".align 8",
    "boot_gdt:",
    ".quad 0",
    ".quad 0x00209A0000000000", // 64-bit code, ring 0
    ".quad 0x0000920000000000", // data, ring 0
    "boot_gdt_ptr:",
    ".word 23",
    ".long boot_gdt",
    // ── Statically reserved boot frames ────────────────────────────
    // Kept out of .bss: the 32-bit code writes them after the zeroing
    // pass, and they must survive until the kernel builds its own tables.
    ".section .boot.pages, \"aw\", @nobits",
    ".align 4096",
    "boot_pml4:",
    ".skip 4096",
    "boot_pdpt:",
    ".skip 4096",
    ".align 16",
    "boot_stack:",
    ".skip 65536",
    "boot_stack_top:",
);
