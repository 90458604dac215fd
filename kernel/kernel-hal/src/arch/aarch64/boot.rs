//! # Boot Stage
//!
//! QEMU's firmware enters the image at EL2 with nothing set up. The entry
//! stub descends to EL1 with a privileged return, establishes a stack,
//! zeroes `.bss`, and calls [`boot_mmu_init`] to build the identity map
//! before normal memory is touched - on this architecture plain RAM
//! accessed with the MMU off is treated like device memory, so paging
//! must be live before any cacheable or unaligned access.
//!
//! The map is two levels deep, the minimum for the block sizes used: one
//! level-1 block covers the device GiB, a level-2 table of 2 MiB blocks
//! covers the RAM GiB. Control then transfers to `kernel_entry` with the
//! hand-off magic and a zero descriptor address - this architecture
//! synthesizes no boot descriptor.

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".section .boot.text, \"ax\"",
    ".global _start",
    "_start:",
    // Which exception level did the loader leave us at?
    "mrs x0, CurrentEL",
    "lsr x0, x0, #2",
    "cmp x0, #2",
    "b.ne 1f",
    // EL2: run EL1 as aarch64, mask everything, and perform a privileged
    // return straight into the EL1 entry below.
    "mov x0, xzr",
    "orr x0, x0, #(1 << 31)", // HCR_EL2.RW: EL1 executes aarch64
    "msr hcr_el2, x0",
    "mov x0, #0x3C5",         // EL1h, DAIF masked
    "msr spsr_el2, x0",
    "adr x0, 1f",
    "msr elr_el2, x0",
    "eret",
    "1:",
    "msr daifset, #0xF",
    "ldr x0, =boot_stack_top",
    "mov sp, x0",
    // Zero .bss before any Rust code runs.
    "ldr x0, =__bss_start",
    "ldr x1, =__bss_end",
    "2:",
    "cmp x0, x1",
    "b.hs 3f",
    "str xzr, [x0], #8",
    "b 2b",
    "3:",
    // Identity map + MMU on, then into the portable kernel.
    "bl boot_mmu_init",
    "ldr x0, =0x36d76289",
    "mov x1, xzr",
    "bl kernel_entry",
    "4:",
    "wfe",
    "b 4b",
    ".section .boot.pages, \"aw\", @nobits",
    ".align 12",
    "boot_stack:",
    ".skip 65536",
    "boot_stack_top:",
);

#[cfg(target_os = "none")]
mod mmu {
    //! Static translation tables and the register sequence that turns the
    //! MMU on. Called exactly once from the entry stub, before any
    //! cacheable access.

    use core::arch::asm;

    const ENTRIES: usize = 512;

    /// Descriptor bits.
    const VALID: u64 = 1 << 0;
    const TABLE: u64 = 1 << 1;
    const ACCESS: u64 = 1 << 10;
    const INNER_SHARE: u64 = 3 << 8;

    /// MAIR indices set up below.
    const ATTR_DEVICE: u64 = 0 << 2;
    const ATTR_NORMAL: u64 = 1 << 2;

    #[repr(C, align(4096))]
    struct Table {
        entries: [u64; ENTRIES],
    }

    static mut BOOT_L1: Table = Table {
        entries: [0; ENTRIES],
    };
    static mut BOOT_L2: Table = Table {
        entries: [0; ENTRIES],
    };

    /// Build the identity map and enable translation.
    ///
    /// # Safety
    /// Must run exactly once, at EL1, with the MMU off, from the boot
    /// stub.
    #[unsafe(no_mangle)]
    unsafe extern "C" fn boot_mmu_init() {
        // Attribute 0: device nGnRnE (0x00). Attribute 1: normal
        // write-back (0xFF).
        let mair: u64 = 0xFF << 8;
        unsafe { asm!("msr mair_el1, {}", in(reg) mair) };

        let l1 = &raw mut BOOT_L1;
        let l2 = &raw mut BOOT_L2;
        unsafe {
            // GiB 0: the peripheral window (UART, GIC) as one device
            // block.
            (*l1).entries[0] = VALID | ATTR_DEVICE | ACCESS;
            // GiB 1: RAM, mapped through 2 MiB normal-memory blocks.
            (*l1).entries[1] = (l2 as u64) | VALID | TABLE;
            for (i, entry) in (*l2).entries.iter_mut().enumerate() {
                let pa = 0x4000_0000 + (i as u64) * 0x20_0000;
                *entry = pa | VALID | ATTR_NORMAL | ACCESS | INNER_SHARE;
            }
        }

        // 39-bit VA, 4 KiB granule, inner-shareable write-back walks,
        // 40-bit PA space; TTBR1 walks disabled (nothing maps the high
        // half).
        let tcr: u64 = 25 | (3 << 12) | (1 << 10) | (1 << 8) | (1 << 23) | (2 << 32);
        unsafe {
            asm!("msr tcr_el1, {}", in(reg) tcr);
            asm!("tlbi vmalle1", "dsb sy", "isb");
            asm!("msr ttbr0_el1, {}", in(reg) l1 as u64);
            asm!("isb");
            // M (MMU), C (data cache), I (instruction cache).
            let mut sctlr: u64;
            asm!("mrs {}, sctlr_el1", out(reg) sctlr);
            sctlr |= 1 | (1 << 2) | (1 << 12);
            asm!("msr sctlr_el1, {}", in(reg) sctlr);
            asm!("isb");
        }
    }
}
