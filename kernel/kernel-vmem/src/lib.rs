//! # Virtual Memory
//!
//! Page tables and address spaces for the kernel's virtual memory manager.
//!
//! ## What you get
//! - An [`AddressSpace`] describing a root translation table and the
//!   map/unmap/release/search operations the rest of the kernel uses.
//! - A 4 KiB-aligned [`PageTable`] of 512 [`PageTableEntry`] rows.
//! - The caller-facing [`MemoryPageFlags`] vocabulary every architecture
//!   must accept (bits that mean nothing on a given CPU are simply
//!   ignored there).
//! - The two seams that make the walk code portable and testable:
//!   [`FrameAlloc`] (where table frames come from) and [`PhysMapper`]
//!   (how a physical table address becomes a usable pointer).
//!
//! ## Virtual address → physical address walk
//!
//! A canonical 48-bit virtual address is cut into four 9-bit table
//! indices plus a 12-bit byte offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! Each level holds 512 entries of 8 bytes. A **leaf** entry carries the
//! physical base plus permission bits; L3 and L2 entries with the huge bit
//! set are early-terminating leaves (1 GiB / 2 MiB blocks), L1 entries are
//! always 4 KiB leaves. A **non-leaf** entry points at the next table.
//!
//! Entries whose present bit is clear terminate the walk: their address
//! bits are unspecified garbage and must never be dereferenced.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod page_table;

pub use address_space::{AddressSpace, MapError, MapOptions, MappingKind};
pub use page_table::{PageTable, PageTableEntry, TABLE_ENTRIES};

use kernel_addresses::{PhysicalAddress, VirtualAddress};

bitflags::bitflags! {
    /// Page mapping flags exposed to callers.
    ///
    /// This is the fixed vocabulary of the virtual memory contract; each
    /// bit lines up with the primary architecture's hardware encoding so
    /// leaf entries are `base | flags` with no translation step.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MemoryPageFlags: u64 {
        /// Mapping is valid. Cleared entries fault on access.
        const PRESENT       = 1 << 0;
        /// Writes allowed through this mapping.
        const WRITABLE      = 1 << 1;
        /// User-mode code may access the page.
        const USER          = 1 << 2;
        /// Write-through caching; writes go straight to memory.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled; required for device registers.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on first access.
        const ACCESSED      = 1 << 5;
        /// Set by hardware on first write.
        const DIRTY         = 1 << 6;
        /// Entry is a block leaf (2 MiB at L2, 1 GiB at L3).
        const HUGE          = 1 << 7;
        /// Translation survives an address-space switch.
        const GLOBAL        = 1 << 8;
        /// Instruction fetch through this mapping faults.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Source of 4 KiB physical frames for page tables and anonymous mappings.
///
/// The implementation decides where frames come from (the boot frame pool,
/// the bitmap allocator, a test fixture). Returned frames **must** be
/// 4 KiB-aligned; `None` means out of memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB physical frame.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame previously handed out by `alloc_4k`.
    fn free_4k(&mut self, frame: PhysicalAddress);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space.
///
/// The mapping strategy differs between boot (identity map), kernel
/// runtime and unit tests, which is exactly why this is a trait: the walk
/// code validates and converts through it instead of casting blindly.
///
/// # Safety
/// - `pa` must be mapped (and writable, for `&mut T`) in the current
///   address space for the lifetime `'a`.
/// - The bytes at `pa` must be a valid `T`.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Borrow the page table stored at physical address `phys`.
///
/// # Safety
/// - `phys` must point at a valid, mapped 4 KiB page-table frame.
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// Invalidate the cached translation for one page on this core.
///
/// Must be called after any change to a live mapping, before the changed
/// address can be touched again.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        // VAE1 takes VA bits 55:12.
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) va.as_u64() >> 12,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = va;
}
