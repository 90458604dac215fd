//! The translation-table entry and the 512-entry table it composes into.

use crate::MemoryPageFlags;
use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalAddress, VirtualAddress};

/// Entries per table at every level.
pub const TABLE_ENTRIES: usize = 512;

/// One row of a translation table.
///
/// The flag bits live in the low byte plus bit 8 and bit 63; bits 51:12
/// hold the 4 KiB-aligned physical base of either the next-level table
/// (non-leaf) or the mapped frame (leaf). The OS-available bit ranges are
/// kept but unused.
#[bitfield(u64)]
pub struct PageTableEntry {
    /// Valid entry if set; everything else is ignored by hardware when
    /// clear.
    pub present: bool,

    /// Write permission.
    pub writable: bool,

    /// User-mode access permission. Must also be set on every non-leaf
    /// entry along a user mapping's walk.
    pub user: bool,

    /// Write-through caching policy.
    pub write_through: bool,

    /// Caching disabled.
    pub cache_disable: bool,

    /// Set by hardware on first access through this entry.
    pub accessed: bool,

    /// Set by hardware on first write through this entry (leaves only).
    pub dirty: bool,

    /// Block-leaf marker: terminates the walk at L3 (1 GiB) or L2 (2 MiB).
    /// Must be clear on non-leaf entries and on L1 leaves.
    pub huge: bool,

    /// Translation is not flushed on an address-space switch.
    pub global: bool,

    /// Ignored by hardware; available to the OS.
    #[bits(3)]
    __os_low: u8,

    /// Physical base, bits 51:12. Always 4 KiB-aligned by construction.
    #[bits(40)]
    frame_51_12: u64,

    /// Ignored by hardware; available to the OS.
    #[bits(7)]
    __os_high: u8,

    /// Protection-key / OS-available range.
    #[bits(4)]
    __pk: u8,

    /// Instruction fetch through this entry faults.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Build an entry from a page-aligned physical base and the caller
    /// flag vocabulary.
    #[must_use]
    pub fn from_parts(base: PhysicalAddress, flags: MemoryPageFlags) -> Self {
        debug_assert!(
            kernel_addresses::is_page_aligned(base.as_u64()),
            "entry base must be page-aligned"
        );
        Self::from_bits(base.as_u64() | flags.bits())
    }

    /// The physical base stored in this entry.
    ///
    /// Only meaningful while [`present`](Self::present) is set; a
    /// non-present entry's address bits are unspecified garbage.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_51_12() << 12)
    }

    /// The flag bits of this entry in the caller vocabulary.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> MemoryPageFlags {
        MemoryPageFlags::from_bits_truncate(self.into_bits())
    }
}

/// A 4 KiB-aligned translation table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// Clear every entry (all non-present).
    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::new(); TABLE_ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }
}

/// Index into the level-4 (root) table: VA bits 47:39.
#[inline]
#[must_use]
pub(crate) const fn l4_index(va: VirtualAddress) -> usize {
    ((va.as_u64() >> 39) & 0x1ff) as usize
}

/// Index into a level-3 table: VA bits 38:30.
#[inline]
#[must_use]
pub(crate) const fn l3_index(va: VirtualAddress) -> usize {
    ((va.as_u64() >> 30) & 0x1ff) as usize
}

/// Index into a level-2 table: VA bits 29:21.
#[inline]
#[must_use]
pub(crate) const fn l2_index(va: VirtualAddress) -> usize {
    ((va.as_u64() >> 21) & 0x1ff) as usize
}

/// Index into a level-1 table: VA bits 20:12.
#[inline]
#[must_use]
pub(crate) const fn l1_index(va: VirtualAddress) -> usize {
    ((va.as_u64() >> 12) & 0x1ff) as usize
}
