//! # Boot Information
//!
//! The hand-off contract between the bootloader and the kernel, and the
//! normalizer that turns the raw boot descriptor into the structures the
//! rest of the kernel consumes.
//!
//! ## Hand-off ABI
//!
//! The kernel entry point receives two machine words: a magic constant
//! ([`BOOT_MAGIC`]) identifying the boot protocol, and the physical address
//! of the boot descriptor (or 0 on architectures that synthesize none).
//! The entry point must refuse to boot on a magic mismatch - nothing about
//! the machine state can be trusted at that point.
//!
//! ## Descriptor format
//!
//! The descriptor is a buffer of self-describing records ("tags"):
//!
//! ```text
//! +-----------------+
//! | total_size: u32 |  whole buffer, header included
//! | reserved:   u32 |
//! +-----------------+
//! | type: u32       |  ─┐
//! | size: u32       |   │ one tag; `size` includes this 8-byte header,
//! | payload ...     |   │ the cursor advances by `size` rounded up to 8
//! +-----------------+  ─┘
//! | ... more tags   |
//! +-----------------+
//! | type=0, size=8  |  end sentinel
//! +-----------------+
//! ```
//!
//! Unknown tag types are skipped using the generic `size` field and never
//! interpreted. A tag whose `size` would not advance the cursor marks a
//! corrupt buffer; the walker reports it instead of spinning forever.

#![cfg_attr(not(test), no_std)]

mod regions;
mod tags;

pub use regions::{MemoryRegion, RegionTable, normalize_regions};
pub use tags::{
    FramebufferInfo, MemoryMapEntries, MemoryMapTag, RawMemoryEntry, Tag, TagWalkError, TagWalker,
};

use kernel_addresses::PhysicalAddress;

/// Magic value the bootloader leaves in the first hand-off register.
pub const BOOT_MAGIC: u64 = 0x36d7_6289;

/// Upper bound on a descriptor buffer we are willing to walk. Anything
/// larger is treated as corrupt rather than mapped and parsed.
pub const MAX_DESCRIPTOR_BYTES: u32 = 1024 * 1024;

/// A validated view of the bootloader's descriptor buffer.
pub struct BootDescriptor<'a> {
    buf: &'a [u8],
}

impl<'a> BootDescriptor<'a> {
    /// Wrap a descriptor already in (or copied into) accessible memory.
    ///
    /// Returns `None` when the buffer is too small to hold the fixed header
    /// or the header's `total_size` disagrees with the slice.
    #[must_use]
    pub fn from_bytes(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < 8 {
            return None;
        }
        let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if total < 8 || total as usize > buf.len() || total > MAX_DESCRIPTOR_BYTES {
            return None;
        }
        Some(Self {
            buf: &buf[..total as usize],
        })
    }

    /// Read the descriptor that the bootloader left at `addr`.
    ///
    /// The fixed header is read first and its `total_size` bounds the slice
    /// that is actually constructed, so a bogus address never produces an
    /// unbounded read.
    ///
    /// # Safety
    /// `addr` must point at a readable, identity-mapped buffer that stays
    /// valid and untouched for `'a`.
    #[must_use]
    pub unsafe fn from_addr(addr: PhysicalAddress) -> Option<Self> {
        let base = addr.as_u64() as *const u8;
        let total = unsafe { core::ptr::read_unaligned(base.cast::<u32>()) };
        if total < 8 || total > MAX_DESCRIPTOR_BYTES {
            return None;
        }
        let buf = unsafe { core::slice::from_raw_parts(base, total as usize) };
        Some(Self { buf })
    }

    /// Iterate over the descriptor's tags.
    #[must_use]
    pub fn tags(&self) -> TagWalker<'a> {
        TagWalker::new(&self.buf[8..])
    }

    /// The memory-map tag, if the bootloader provided one.
    #[must_use]
    pub fn memory_map(&self) -> Option<MemoryMapTag<'a>> {
        self.tags()
            .filter_map(Result::ok)
            .find_map(|t| MemoryMapTag::from_tag(&t))
    }

    /// The framebuffer-geometry tag, if the bootloader provided one.
    #[must_use]
    pub fn framebuffer(&self) -> Option<FramebufferInfo> {
        self.tags()
            .filter_map(Result::ok)
            .find_map(|t| FramebufferInfo::from_tag(&t))
    }
}
