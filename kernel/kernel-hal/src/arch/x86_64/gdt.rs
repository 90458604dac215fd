//! # Global Descriptor Table
//!
//! Long mode ignores segmentation for addressing, but the descriptors
//! still carry the privilege machinery: the selector pair loaded on
//! `iretq` decides the ring, and the TSS tells the CPU which kernel stack
//! to switch to when a trap arrives from ring 3.
//!
//! Fixed layout, matching the selector constants below:
//!
//! | index | selector | descriptor        |
//! |------:|---------:|-------------------|
//! | 0     | 0x00     | null              |
//! | 1     | 0x08     | kernel code       |
//! | 2     | 0x10     | kernel data       |
//! | 3     | 0x18     | user data         |
//! | 4     | 0x20     | user code         |
//! | 5–6   | 0x28     | TSS (16 bytes)    |

/// Kernel code selector (ring 0).
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data/stack selector (ring 0).
pub const KERNEL_DS: u16 = 0x10;
/// User data/stack selector, RPL 3 included.
pub const USER_DS: u16 = 0x18 | 3;
/// User code selector, RPL 3 included.
pub const USER_CS: u16 = 0x20 | 3;
/// Task-state-segment selector.
pub const TSS_SEL: u16 = 0x28;

// Descriptor bit assembly: P (bit 47), DPL (45:44), S (44 is part of the
// type nibble group: bit 44), type (43:40), L (53). Base/limit are
// ignored for code/data in long mode.
const PRESENT: u64 = 1 << 47;
const NON_SYSTEM: u64 = 1 << 44;
const LONG_CODE: u64 = 1 << 53;
const DPL3: u64 = 3 << 45;
const TYPE_CODE_RX: u64 = 0xA << 40;
const TYPE_DATA_RW: u64 = 0x2 << 40;

const KERNEL_CODE_DESC: u64 = PRESENT | NON_SYSTEM | TYPE_CODE_RX | LONG_CODE;
const KERNEL_DATA_DESC: u64 = PRESENT | NON_SYSTEM | TYPE_DATA_RW;
const USER_CODE_DESC: u64 = KERNEL_CODE_DESC | DPL3;
const USER_DATA_DESC: u64 = KERNEL_DATA_DESC | DPL3;

/// 64-bit task-state segment. Only `rsp0` matters here: the stack the CPU
/// switches to when a trap arrives from user mode.
#[repr(C, packed(4))]
pub struct Tss {
    _reserved0: u32,
    /// Stack pointer loaded on a ring3 → ring0 transition.
    pub rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    /// Offset of the I/O permission bitmap; pointing it at the segment
    /// limit means "no bitmap, all port access denied to ring 3".
    iopb_offset: u16,
}

const _: () = assert!(size_of::<Tss>() == 104);

impl Default for Tss {
    fn default() -> Self {
        Self::new()
    }
}

impl Tss {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

/// The descriptor table itself: five fixed entries plus the two-slot TSS
/// descriptor filled in from the TSS's runtime address.
#[repr(C, align(16))]
pub struct Gdt {
    table: [u64; 7],
}

impl Gdt {
    #[must_use]
    pub fn new(tss: &'static Tss) -> Self {
        let base = core::ptr::from_ref(tss) as u64;
        let limit = (size_of::<Tss>() - 1) as u64;
        // 16-byte system descriptor: type 0x9 = available 64-bit TSS.
        let tss_low = (limit & 0xFFFF)
            | (base & 0xFF_FFFF) << 16
            | 0x9 << 40
            | PRESENT
            | ((limit >> 16) & 0xF) << 48
            | ((base >> 24) & 0xFF) << 56;
        let tss_high = base >> 32;

        Self {
            table: [
                0,
                KERNEL_CODE_DESC,
                KERNEL_DATA_DESC,
                USER_DATA_DESC,
                USER_CODE_DESC,
                tss_low,
                tss_high,
            ],
        }
    }

    /// Load the table, reload every segment register, and load the task
    /// register.
    ///
    /// # Safety
    /// Must run at CPL0; the table must stay at its address forever
    /// (enforced by the `'static` receiver).
    #[cfg(target_os = "none")]
    pub unsafe fn load(&'static self) {
        #[repr(C, packed)]
        struct Gdtr {
            limit: u16,
            base: u64,
        }
        let gdtr = Gdtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            core::arch::asm!(
                "lgdt [{gdtr}]",
                // Reload CS with a far return: push the new selector and
                // the continuation address, then `retfq` pops both.
                "lea {tmp}, [rip + 2f]",
                "push {cs}",
                "push {tmp}",
                "retfq",
                "2:",
                "mov ds, {ds:x}",
                "mov es, {ds:x}",
                "mov ss, {ds:x}",
                "xor {tmp:e}, {tmp:e}",
                "mov fs, {tmp:x}",
                "mov gs, {tmp:x}",
                "ltr {tss:x}",
                gdtr = in(reg) &raw const gdtr,
                cs = const KERNEL_CS as u64,
                ds = in(reg) u64::from(KERNEL_DS),
                tss = in(reg) u64::from(TSS_SEL),
                tmp = out(reg) _,
            );
        }
    }
}
