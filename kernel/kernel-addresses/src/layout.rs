//! # Memory Layout
//!
//! Compile-time constants describing the address-space split and the boot
//! identity map. These are the single source of truth; the kernel's
//! `build.rs` feeds them to the linker script.

/// End of the user-accessible canonical lower half. Everything at or above
/// this address is kernel territory shared across address spaces.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// How much of low physical memory the boot identity map covers. Chosen to
/// include all of RAM QEMU hands the guest plus the legacy device windows.
pub const IDENTITY_MAP_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Physical load address of the kernel image.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// The size of the boot kernel stack.
pub const BOOT_STACK_SIZE: usize = 64 * 1024;

const _: () = {
    assert!(BOOT_STACK_SIZE % 4096 == 0);
    assert!(PHYS_LOAD % 4096 == 0);
    assert!(IDENTITY_MAP_BYTES % (1024 * 1024 * 1024) == 0);
    assert!(USERSPACE_END % (1024 * 1024 * 1024) == 0);
};
