//! # Physical Memory Manager
//!
//! A bitmap frame allocator over the normalized boot memory map: one bit
//! per 4 KiB frame, bit set = frame used. The bitmap itself is carved out
//! of the first usable region large enough to hold it, so the allocator
//! needs no memory before the memory it manages.
//!
//! Allocation is first-fit behind a rotating cursor; freeing a frame below
//! the cursor pulls the cursor back so the frame is found again.
//! Contiguous multi-frame requests scan for a run of adjacent free frames
//! and fail explicitly when none exists - callers never receive a partial
//! or scattered range.
//!
//! Misusing `free_page` (unaligned, out of range, not currently allocated)
//! is a programming error and panics; continuing with a corrupt frame
//! ledger risks handing the same frame to two owners.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

use kernel_addresses::{PAGE_SIZE, PhysicalAddress, is_page_aligned};
use kernel_bootinfo::MemoryRegion;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::info;

/// Why the allocator could not be built from the boot memory map.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PmmInitError {
    /// The map contains no usable RAM at all.
    #[error("memory map contains no usable memory")]
    NoUsableMemory,
    /// No single usable region can hold the frame bitmap.
    #[error("no usable region large enough for the frame bitmap")]
    BitmapDoesNotFit,
}

/// Bitmap-backed physical frame allocator.
///
/// Created exactly once at boot, before any other component asks for
/// memory, and threaded through every consumer as an explicit handle.
pub struct FrameBitmap<'m> {
    /// One bit per frame; set = used. Lives in a usable region reached
    /// through the `PhysMapper` given at construction.
    bitmap: &'m mut [u8],
    /// Number of frames tracked (index range of the bitmap).
    total_frames: usize,
    /// Frames currently free.
    free_frames: usize,
    /// Byte index where the last allocation succeeded.
    cursor: usize,
}

impl<'m> FrameBitmap<'m> {
    /// Build the allocator from the normalized region table.
    ///
    /// Every frame starts as used; frames inside usable regions are then
    /// freed, and the bitmap's own frames plus frame 0 (null-page guard)
    /// are re-reserved.
    pub fn new<M: PhysMapper>(
        mapper: &M,
        regions: &[MemoryRegion],
    ) -> Result<Self, PmmInitError> {
        let highest_usable = regions
            .iter()
            .filter(|r| r.usable)
            .map(MemoryRegion::end)
            .max()
            .ok_or(PmmInitError::NoUsableMemory)?;

        let total_frames = (highest_usable / PAGE_SIZE) as usize;
        let bitmap_bytes = total_frames.div_ceil(8);
        let bitmap_frames = bitmap_bytes.div_ceil(PAGE_SIZE as usize);

        // First usable region that can hold the bitmap, skipping frame 0.
        let mut bitmap_base = None;
        for region in regions.iter().filter(|r| r.usable) {
            let base = if region.base.as_u64() == 0 {
                PAGE_SIZE
            } else {
                region.base.as_u64()
            };
            if base + (bitmap_frames as u64) * PAGE_SIZE <= region.end() {
                bitmap_base = Some(PhysicalAddress::new(base));
                break;
            }
        }
        let bitmap_base = bitmap_base.ok_or(PmmInitError::BitmapDoesNotFit)?;

        // SAFETY: the region is usable RAM, mapped by the caller's mapper,
        // and ownership of these frames transfers to the bitmap here.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(
                core::ptr::from_mut(mapper.phys_to_mut::<u8>(bitmap_base)),
                bitmap_bytes,
            )
        };
        bitmap.fill(0xff);

        let mut this = Self {
            bitmap,
            total_frames,
            free_frames: 0,
            cursor: 0,
        };

        for region in regions.iter().filter(|r| r.usable) {
            let first = (region.base.as_u64() / PAGE_SIZE) as usize;
            let count = (region.length / PAGE_SIZE) as usize;
            for frame in first..first + count {
                if frame < total_frames && this.is_used(frame) {
                    this.clear(frame);
                    this.free_frames += 1;
                }
            }
        }

        // The bitmap's own frames are in use from this moment on.
        let first_bitmap_frame = (bitmap_base.as_u64() / PAGE_SIZE) as usize;
        for frame in first_bitmap_frame..first_bitmap_frame + bitmap_frames {
            this.reserve(frame);
        }
        // Frame 0 stays permanently used so a null physical address is
        // never handed out.
        this.reserve(0);

        info!(
            "pmm: {} frames tracked, {} free ({} MiB), bitmap at {} ({} frames)",
            this.total_frames,
            this.free_frames,
            (this.free_frames as u64 * PAGE_SIZE) / (1024 * 1024),
            bitmap_base,
            bitmap_frames,
        );
        Ok(this)
    }

    /// Allocate one 4 KiB frame. `None` means physical memory is
    /// exhausted - callers propagate this as an allocation failure.
    pub fn alloc_page(&mut self) -> Option<PhysicalAddress> {
        let bytes = self.bitmap.len();
        for i in 0..bytes {
            let byte_idx = (self.cursor + i) % bytes;
            let byte = self.bitmap[byte_idx];
            if byte == 0xff {
                continue;
            }
            let bit = byte.trailing_ones() as usize;
            let frame = byte_idx * 8 + bit;
            if frame >= self.total_frames {
                continue;
            }
            self.bitmap[byte_idx] |= 1 << bit;
            self.free_frames -= 1;
            self.cursor = byte_idx;
            return Some(frame_address(frame));
        }
        None
    }

    /// Allocate `count` physically adjacent frames and return the first.
    ///
    /// Scans the whole bitmap for a run of `count` free frames; if no such
    /// run exists the request fails as a whole - never partially.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc_page();
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..self.total_frames {
            if self.is_used(frame) {
                run_start = frame + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set(f);
                }
                self.free_frames -= count;
                self.cursor = (run_start + count) / 8;
                return Some(frame_address(run_start));
            }
        }
        None
    }

    /// Return a frame to the free pool.
    ///
    /// # Panics
    /// Panics when `addr` is not page-aligned, lies outside the tracked
    /// range, or refers to a frame that is not currently allocated
    /// (double free). All three are programming errors; the frame ledger
    /// cannot be trusted after any of them.
    pub fn free_page(&mut self, addr: PhysicalAddress) {
        assert!(
            is_page_aligned(addr.as_u64()),
            "free_page: {addr} is not page-aligned"
        );
        let frame = (addr.as_u64() / PAGE_SIZE) as usize;
        assert!(
            frame < self.total_frames,
            "free_page: {addr} is outside the tracked range"
        );
        assert!(
            self.is_used(frame),
            "free_page: double free of frame at {addr}"
        );
        self.clear(frame);
        self.free_frames += 1;
        // Pull the cursor back so the freed frame is found again.
        self.cursor = self.cursor.min(frame / 8);
    }

    /// Take a physical range out of circulation (kernel image, firmware
    /// carve-outs). Frames already used stay used; the operation is
    /// idempotent. The range is widened outward to frame boundaries - a
    /// partially covered frame must not be handed out either.
    pub fn reserve_range(&mut self, base: PhysicalAddress, length: u64) {
        let first = (base.as_u64() / PAGE_SIZE) as usize;
        let last = kernel_addresses::align_up(base.as_u64() + length, PAGE_SIZE) / PAGE_SIZE;
        for frame in first..last as usize {
            self.reserve(frame);
        }
    }

    /// Frames currently free.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frames tracked in total (used and free).
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    /// Mark `frame` used during init, adjusting the free count when it was
    /// free before.
    fn reserve(&mut self, frame: usize) {
        if frame < self.total_frames && !self.is_used(frame) {
            self.set(frame);
            self.free_frames -= 1;
        }
    }
}

impl FrameAlloc for FrameBitmap<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.alloc_page()
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        self.free_page(frame);
    }
}

#[inline]
fn frame_address(frame: usize) -> PhysicalAddress {
    PhysicalAddress::new(frame as u64 * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addresses::VirtualAddress;
    use kernel_vmem::{AddressSpace, MapOptions, MappingKind, MemoryPageFlags};
    use std::collections::HashSet;

    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Fake physical memory: frame `n` lives at physical `n * 4096`.
    struct TestPhys {
        frames: Vec<Box<Aligned4K>>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Box::new(Aligned4K([0u8; 4096])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            let ptr = core::ptr::from_ref(self.frames[idx].as_ref()).cast_mut();
            unsafe { &mut *ptr.cast::<u8>().add(off).cast::<T>() }
        }
    }

    fn usable(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base: PhysicalAddress::new(base),
            length,
            usable: true,
        }
    }

    fn reserved(base: u64, length: u64) -> MemoryRegion {
        MemoryRegion {
            base: PhysicalAddress::new(base),
            length,
            usable: false,
        }
    }

    const FRAMES: usize = 64;

    fn pmm_over<'m>(phys: &TestPhys, regions: &[MemoryRegion]) -> FrameBitmap<'m> {
        FrameBitmap::new(phys, regions).expect("pmm init")
    }

    #[test]
    fn init_reserves_bitmap_null_frame_and_holes() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [
            usable(0, 16 * 4096),
            reserved(16 * 4096, 8 * 4096),
            usable(24 * 4096, 40 * 4096),
        ];
        let mut pmm = pmm_over(&phys, &regions);

        // 56 usable frames minus frame 0 minus one bitmap frame.
        assert_eq!(pmm.total_frames(), FRAMES);
        assert_eq!(pmm.free_frames(), 54);

        // Nothing ever allocates frame 0, the bitmap frame (frame 1, the
        // first usable non-null frame), or the reserved hole.
        let mut seen = HashSet::new();
        while let Some(pa) = pmm.alloc_page() {
            assert!(pa.as_u64() != 0, "null frame handed out");
            assert!(pa.as_u64() != 4096, "bitmap frame handed out");
            let frame = pa.as_u64() / 4096;
            assert!(!(16..24).contains(&frame), "reserved frame handed out");
            seen.insert(pa.as_u64());
        }
        assert_eq!(seen.len(), 54);
    }

    #[test]
    fn no_frame_is_handed_out_twice_while_live() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        let mut live = HashSet::new();
        while let Some(pa) = pmm.alloc_page() {
            assert!(live.insert(pa.as_u64()), "frame {pa} returned twice");
        }
        assert_eq!(pmm.free_frames(), 0);
        assert!(pmm.alloc_page().is_none(), "exhaustion must be explicit");
    }

    #[test]
    fn freed_frame_is_allocatable_again() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        // Drain the pool, free one frame in the middle, and expect exactly
        // that frame back.
        let mut all = Vec::new();
        while let Some(pa) = pmm.alloc_page() {
            all.push(pa);
        }
        let victim = all[all.len() / 2];
        pmm.free_page(victim);
        assert_eq!(pmm.alloc_page(), Some(victim));
        assert!(pmm.alloc_page().is_none());
    }

    #[test]
    fn contiguous_allocation_is_adjacent_or_nothing() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        // Frames 0 (null guard) and 1 (bitmap) are reserved, so the run
        // lands at frame 2 and the largest remaining run is 54 frames.
        let run = pmm.alloc_pages(8).expect("8 adjacent frames");
        assert_eq!(run.as_u64(), 2 * 4096);
        assert!(pmm.alloc_pages(55).is_none(), "no 55-frame run exists");

        for i in 0..8u64 {
            // Every frame of the run is genuinely allocated: freeing it
            // must succeed exactly once.
            pmm.free_page(run + i * 4096);
        }
        // With the run returned, 62 adjacent frames are free again.
        assert!(pmm.alloc_pages(55).is_some());
    }

    #[test]
    fn contiguous_failure_allocates_nothing() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        let before = pmm.free_frames();
        assert!(pmm.alloc_pages(FRAMES + 1).is_none());
        assert_eq!(pmm.free_frames(), before, "failed request must not leak frames");
    }

    #[test]
    fn reserved_ranges_are_never_allocated_and_reserve_is_idempotent() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        // An unaligned range widens outward to whole frames.
        pmm.reserve_range(PhysicalAddress::new(8 * 4096 + 0x10), 2 * 4096);
        let before = pmm.free_frames();
        pmm.reserve_range(PhysicalAddress::new(8 * 4096 + 0x10), 2 * 4096);
        assert_eq!(pmm.free_frames(), before, "second reserve must change nothing");

        while let Some(pa) = pmm.alloc_page() {
            let frame = pa.as_u64() / 4096;
            assert!(!(8..=10).contains(&frame), "reserved frame {frame} handed out");
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);
        let pa = pmm.alloc_page().unwrap();
        pmm.free_page(pa);
        pmm.free_page(pa);
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn unaligned_free_panics() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);
        pmm.free_page(PhysicalAddress::new(0x1001));
    }

    #[test]
    fn empty_map_is_rejected() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [reserved(0, 0x10_0000)];
        assert_eq!(
            FrameBitmap::new(&phys, &regions).err(),
            Some(PmmInitError::NoUsableMemory)
        );
    }

    /// The §map/unmap contract exercised end to end against the real
    /// allocator: unmapping without freeing leaves the frame owned;
    /// unmapping with freeing makes it allocatable again.
    #[test]
    fn vmem_round_trip_through_the_allocator() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        let aspace = AddressSpace::create(&phys, &mut pmm).expect("root");
        let rw = MemoryPageFlags::PRESENT | MemoryPageFlags::WRITABLE;

        let va = VirtualAddress::new(0x40_0000);
        let pa = pmm.alloc_page().expect("backing frame");
        aspace
            .map_page(&mut pmm, va, pa, rw, MapOptions::empty())
            .expect("map");

        // unmap(free=false): mapping gone, frame still owned by us - the
        // allocator must NOT hand it out to the next caller.
        aspace.unmap_page(&mut pmm, va, false).expect("unmap");
        assert_eq!(aspace.query(va), None);
        let other = pmm.alloc_page().expect("another frame");
        assert_ne!(other, pa);
        pmm.free_page(other);

        // Map again, unmap(free=true): the frame returns to the pool and a
        // subsequent allocation can receive it.
        aspace
            .map_page(&mut pmm, va, pa, rw, MapOptions::empty())
            .expect("remap");
        aspace.unmap_page(&mut pmm, va, true).expect("unmap+free");
        let mut recycled = false;
        let mut held = Vec::new();
        while let Some(p) = pmm.alloc_page() {
            if p == pa {
                recycled = true;
                break;
            }
            held.push(p);
        }
        assert!(recycled, "freed frame never came back from the allocator");
        for p in held {
            pmm.free_page(p);
        }
    }

    /// Task-teardown shape: an owned range released through the real
    /// allocator gives every frame back; releasing again changes nothing.
    #[test]
    fn release_area_returns_frames_to_the_pool() {
        let phys = TestPhys::with_frames(FRAMES);
        let regions = [usable(0, (FRAMES as u64) * 4096)];
        let mut pmm = pmm_over(&phys, &regions);

        let aspace = AddressSpace::create(&phys, &mut pmm).expect("root");
        let rw = MemoryPageFlags::PRESENT | MemoryPageFlags::WRITABLE | MemoryPageFlags::USER;

        let start = VirtualAddress::new(0x40_0000);
        for i in 0..4u64 {
            let frame = pmm.alloc_page().expect("frame");
            aspace
                .map_page(&mut pmm, start + i * 4096, frame, rw, MapOptions::empty())
                .expect("map");
        }

        let before = pmm.free_frames();
        let end = start + 4 * 4096;
        aspace.release_area(&mut pmm, start, end, MappingKind::Owned);
        assert_eq!(pmm.free_frames(), before + 4);

        aspace.release_area(&mut pmm, start, end, MappingKind::Owned);
        assert_eq!(pmm.free_frames(), before + 4, "second release must be a no-op");
    }
}
