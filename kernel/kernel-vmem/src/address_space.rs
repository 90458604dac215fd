//! # Virtual Address Spaces
//!
//! An [`AddressSpace`] is a root translation table plus the operations
//! that edit it. One exists for the kernel; each task derives its own,
//! sharing the kernel half of the root so kernel code stays resident no
//! matter which task is active.

use crate::page_table::{l1_index, l2_index, l3_index, l4_index};
use crate::{
    FrameAlloc, MemoryPageFlags, PageTableEntry, PhysMapper, get_table, invalidate_page,
};
use kernel_addresses::{PAGE_SIZE, PageSize, PhysicalAddress, VirtualAddress, layout};

/// First kernel-half index of the root table. Entries at and above this
/// index are shared by reference across every address space.
const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// Map/unmap failure.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The frame allocator ran dry while creating an intermediate table.
    #[error("out of physical frames for page tables")]
    OutOfMemory,
    /// The leaf is already present and remapping was not requested.
    #[error("virtual address is already mapped")]
    AlreadyMapped,
    /// No present leaf exists at the address.
    #[error("virtual address is not mapped")]
    NotMapped,
    /// The address resolves through a block leaf, which this operation
    /// does not edit.
    #[error("virtual address is covered by a block mapping")]
    BlockMapping,
    /// An address argument was not page-aligned.
    #[error("address is not page-aligned")]
    Unaligned,
}

bitflags::bitflags! {
    /// Options modifying [`AddressSpace::map_page`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapOptions: u8 {
        /// Permit replacing an already-present leaf. Without this, mapping
        /// over a live entry is a double-map programming error.
        const ALLOW_REMAP = 1 << 0;
    }
}

/// Who owns the physical frames behind a mapped range.
///
/// This distinction is the one genuine correctness hazard of the layer:
/// releasing a `Shared` range must never free the frames, because another
/// address space may still map them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MappingKind {
    /// Anonymous memory owned by this address space; releasing the range
    /// returns the frames to the allocator.
    Owned,
    /// Frames referenced by (or visible to) other address spaces; released
    /// mappings disappear but the frames stay allocated.
    Shared,
}

/// A root translation table bound to the [`PhysMapper`] used to reach its
/// table frames.
pub struct AddressSpace<'m, M: PhysMapper> {
    root_phys: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Bind an existing root table.
    #[inline]
    #[must_use]
    pub const fn new(mapper: &'m M, root_phys: PhysicalAddress) -> Self {
        Self { root_phys, mapper }
    }

    /// Allocate and zero a fresh root table.
    pub fn create<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root_phys = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        unsafe { get_table(mapper, root_phys).zero() };
        Ok(Self { root_phys, mapper })
    }

    /// Physical address of the root table (what the translation-base
    /// register is loaded with).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root_phys
    }

    /// Derive a task address space: empty user half, kernel half aliased
    /// from this space's root.
    ///
    /// Sharing is at the top level only - the copied entries point at the
    /// same lower-level tables, so every kernel mapping made through the
    /// kernel root is visible here without further bookkeeping.
    pub fn derive_user<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, MapError> {
        let derived = Self::create(self.mapper, alloc)?;
        let src = unsafe { get_table(self.mapper, self.root_phys) };
        let dst = unsafe { get_table(self.mapper, derived.root_phys) };
        for i in KERNEL_HALF_FIRST_INDEX..crate::TABLE_ENTRIES {
            dst.set_entry(i, src.entry(i));
        }
        Ok(derived)
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// Walks the hierarchy from the root, allocating and zeroing any
    /// missing intermediate table. Mapping over a present leaf is a
    /// double-map error unless [`MapOptions::ALLOW_REMAP`] is given.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MemoryPageFlags,
        options: MapOptions,
    ) -> Result<(), MapError> {
        if !kernel_addresses::is_page_aligned(va.as_u64())
            || !kernel_addresses::is_page_aligned(pa.as_u64())
        {
            return Err(MapError::Unaligned);
        }

        // Non-leaf entries need USER set for user mappings to traverse.
        let mut chain_flags = MemoryPageFlags::PRESENT | MemoryPageFlags::WRITABLE;
        if flags.contains(MemoryPageFlags::USER) {
            chain_flags |= MemoryPageFlags::USER;
        }

        let l3_phys = self.ensure_table(alloc, self.root_phys, l4_index(va), chain_flags)?;
        let l2_phys = self.ensure_table(alloc, l3_phys, l3_index(va), chain_flags)?;
        let l1_phys = self.ensure_table(alloc, l2_phys, l2_index(va), chain_flags)?;

        let l1 = unsafe { get_table(self.mapper, l1_phys) };
        let index = l1_index(va);
        if l1.entry(index).present() && !options.contains(MapOptions::ALLOW_REMAP) {
            return Err(MapError::AlreadyMapped);
        }
        l1.set_entry(
            index,
            PageTableEntry::from_parts(pa, flags | MemoryPageFlags::PRESENT),
        );
        invalidate_page(va);
        Ok(())
    }

    /// Remove the 4 KiB mapping at `va` and return the frame it covered.
    ///
    /// With `free_physical`, the backing frame is handed back to the
    /// allocator; otherwise it is left untouched (the caller, or another
    /// address space, still owns it). The cached translation for `va` is
    /// invalidated on this core before returning.
    pub fn unmap_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalAddress, MapError> {
        if !kernel_addresses::is_page_aligned(va.as_u64()) {
            return Err(MapError::Unaligned);
        }
        let l1_phys = self.walk_to_l1(va)?;
        let l1 = unsafe { get_table(self.mapper, l1_phys) };
        let index = l1_index(va);
        let entry = l1.entry(index);
        if !entry.present() {
            return Err(MapError::NotMapped);
        }
        let frame = entry.base();
        l1.set_entry(index, PageTableEntry::new());
        invalidate_page(va);
        if free_physical {
            alloc.free_4k(frame);
        }
        Ok(frame)
    }

    /// Unmap every page in `[start, end)`, honoring frame ownership.
    ///
    /// Holes in the range are skipped, which makes the operation
    /// idempotent: releasing an already-released range is a no-op.
    pub fn release_area<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
        kind: MappingKind,
    ) {
        let free_physical = matches!(kind, MappingKind::Owned);
        let mut va = start.page_base();
        while va < end {
            if self.query_4k(va).is_some() {
                // The leaf exists; unmap cannot fail past this point.
                let _ = self.unmap_page(alloc, va, free_physical);
            }
            va += PAGE_SIZE;
        }
    }

    /// Find `num_pages` consecutive unmapped pages within `[lower, upper)`.
    ///
    /// With `user` set the search is confined to the user-accessible
    /// canonical half. Returns `None` when no such run exists.
    #[must_use]
    pub fn find_free_space(
        &self,
        num_pages: usize,
        lower: VirtualAddress,
        upper: VirtualAddress,
        user: bool,
    ) -> Option<VirtualAddress> {
        if num_pages == 0 {
            return None;
        }
        let upper = if user {
            VirtualAddress::new(upper.as_u64().min(layout::USERSPACE_END))
        } else {
            upper
        };

        let mut run_start = VirtualAddress::new(kernel_addresses::align_up(
            lower.as_u64(),
            PAGE_SIZE,
        ));
        let mut run_len = 0usize;
        let mut va = run_start;
        while va.as_u64() + PAGE_SIZE <= upper.as_u64() {
            if self.query(va).is_some() {
                run_len = 0;
                run_start = va + PAGE_SIZE;
            } else {
                run_len += 1;
                if run_len == num_pages {
                    return Some(run_start);
                }
            }
            va += PAGE_SIZE;
        }
        None
    }

    /// Translate `va` to the physical address it maps to, through any leaf
    /// size. `None` means unmapped - an expected outcome, not an error.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let root = unsafe { get_table(self.mapper, self.root_phys) };
        let l4e = root.entry(l4_index(va));
        if !l4e.present() {
            return None;
        }

        let l3 = unsafe { get_table(self.mapper, l4e.base()) };
        let l3e = l3.entry(l3_index(va));
        if !l3e.present() {
            return None;
        }
        if l3e.huge() {
            let offset = va.as_u64() & (PageSize::Size1G.bytes() - 1);
            return Some(l3e.base() + offset);
        }

        let l2 = unsafe { get_table(self.mapper, l3e.base()) };
        let l2e = l2.entry(l2_index(va));
        if !l2e.present() {
            return None;
        }
        if l2e.huge() {
            let offset = va.as_u64() & (PageSize::Size2M.bytes() - 1);
            return Some(l2e.base() + offset);
        }

        let l1 = unsafe { get_table(self.mapper, l2e.base()) };
        let l1e = l1.entry(l1_index(va));
        if !l1e.present() {
            return None;
        }
        let offset = va.as_u64() & (PAGE_SIZE - 1);
        Some(l1e.base() + offset)
    }

    /// Like [`query`](Self::query) but only for 4 KiB leaves; block
    /// mappings report `None` so release loops never free through them.
    fn query_4k(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let l1_phys = self.walk_to_l1(va).ok()?;
        let l1 = unsafe { get_table(self.mapper, l1_phys) };
        let e = l1.entry(l1_index(va));
        e.present().then(|| e.base())
    }

    /// Make this address space active on the current core.
    ///
    /// # Safety
    /// The root must map (at least) all kernel code, data and stacks that
    /// are live at the moment of the switch; everything else faults.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn activate(&self) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root_phys.as_u64(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Make this address space active on the current core.
    ///
    /// # Safety
    /// See the x86_64 variant; additionally the caller must not rely on
    /// stale translations, which this function flushes.
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    pub unsafe fn activate(&self) {
        unsafe {
            core::arch::asm!(
                "msr ttbr0_el1, {}",
                "tlbi vmalle1",
                "dsb ish",
                "isb",
                in(reg) self.root_phys.as_u64(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Walk to the L1 table covering `va`, without creating anything.
    fn walk_to_l1(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let root = unsafe { get_table(self.mapper, self.root_phys) };
        let l4e = root.entry(l4_index(va));
        if !l4e.present() {
            return Err(MapError::NotMapped);
        }
        let l3 = unsafe { get_table(self.mapper, l4e.base()) };
        let l3e = l3.entry(l3_index(va));
        if !l3e.present() {
            return Err(MapError::NotMapped);
        }
        if l3e.huge() {
            return Err(MapError::BlockMapping);
        }
        let l2 = unsafe { get_table(self.mapper, l3e.base()) };
        let l2e = l2.entry(l2_index(va));
        if !l2e.present() {
            return Err(MapError::NotMapped);
        }
        if l2e.huge() {
            return Err(MapError::BlockMapping);
        }
        Ok(l2e.base())
    }

    /// Return the table the entry at `table_phys[index]` points to,
    /// allocating and zeroing it first if the entry is empty.
    fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table_phys: PhysicalAddress,
        index: usize,
        chain_flags: MemoryPageFlags,
    ) -> Result<PhysicalAddress, MapError> {
        let table = unsafe { get_table(self.mapper, table_phys) };
        let entry = table.entry(index);
        if entry.present() {
            // A block leaf is not a table; descending through it would
            // corrupt mapped memory.
            if entry.huge() {
                return Err(MapError::BlockMapping);
            }
            // Widen the traversal permissions if this walk needs USER and
            // an earlier kernel-only mapping created the chain.
            if chain_flags.contains(MemoryPageFlags::USER) && !entry.user() {
                table.set_entry(index, entry.with_user(true));
            }
            return Ok(entry.base());
        }
        let fresh = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        unsafe { get_table(self.mapper, fresh).zero() };
        table.set_entry(index, PageTableEntry::from_parts(fresh, chain_flags));
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameAlloc;

    /// A trivial bump allocator over the test's fake physical memory,
    /// recording every freed frame so tests can assert ownership policy.
    struct BumpAlloc {
        next: u64,
        end: u64,
        freed: Vec<PhysicalAddress>,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalAddress::new(p))
        }

        fn free_4k(&mut self, frame: PhysicalAddress) {
            self.freed.push(frame);
        }
    }

    /// A 4 KiB-aligned frame used as fake physical RAM.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// In-memory "physical memory": physical addresses are byte offsets
    /// from 0, frame `n` lives in `frames[n]`.
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
            // Page tables are whole frames; anything else is test misuse.
            debug_assert_eq!(off, 0);
            let ptr = core::ptr::from_ref(self.frames[idx].as_ref()).cast_mut();
            unsafe { &mut *ptr.cast::<u8>().add(off).cast::<T>() }
        }
    }

    const FRAMES: usize = 64;

    fn space(phys: &TestPhys) -> (AddressSpace<'_, TestPhys>, BumpAlloc) {
        let mut alloc = BumpAlloc::new(0, (FRAMES as u64) << 12);
        let aspace = AddressSpace::create(phys, &mut alloc).expect("root table");
        (aspace, alloc)
    }

    const RW: MemoryPageFlags = MemoryPageFlags::PRESENT.union(MemoryPageFlags::WRITABLE);

    #[test]
    fn map_creates_chain_and_leaf() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x0030_0000);
        aspace
            .map_page(&mut alloc, va, pa, RW | MemoryPageFlags::GLOBAL, MapOptions::empty())
            .expect("map");

        assert_eq!(aspace.query(va), Some(pa));
        assert_eq!(aspace.query(va + 0x123), Some(pa + 0x123));
        assert_eq!(aspace.query(va + PAGE_SIZE), None);
    }

    #[test]
    fn double_map_is_rejected_without_the_flag() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va = VirtualAddress::new(0x40_0000);
        let pa1 = PhysicalAddress::new(0x1_0000_0000);
        let pa2 = PhysicalAddress::new(0x2_0000_0000);
        aspace.map_page(&mut alloc, va, pa1, RW, MapOptions::empty()).unwrap();

        assert_eq!(
            aspace.map_page(&mut alloc, va, pa2, RW, MapOptions::empty()),
            Err(MapError::AlreadyMapped)
        );
        // Explicit permission replaces the mapping.
        aspace
            .map_page(&mut alloc, va, pa2, RW, MapOptions::ALLOW_REMAP)
            .unwrap();
        assert_eq!(aspace.query(va), Some(pa2));
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);
        let r = aspace.map_page(
            &mut alloc,
            VirtualAddress::new(0x1001),
            PhysicalAddress::new(0x2000),
            RW,
            MapOptions::empty(),
        );
        assert_eq!(r, Err(MapError::Unaligned));
    }

    #[test]
    fn unmap_round_trip_without_freeing() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va = VirtualAddress::new(0x7f00_0000);
        let pa = PhysicalAddress::new(0x0040_0000);
        aspace.map_page(&mut alloc, va, pa, RW, MapOptions::empty()).unwrap();

        let frame = aspace.unmap_page(&mut alloc, va, false).expect("unmap");
        assert_eq!(frame, pa);
        assert_eq!(aspace.query(va), None);
        assert!(alloc.freed.is_empty(), "free=false must not touch the allocator");
    }

    #[test]
    fn unmap_with_free_returns_the_frame() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va = VirtualAddress::new(0x7f00_0000);
        let pa = PhysicalAddress::new(0x0040_0000);
        aspace.map_page(&mut alloc, va, pa, RW, MapOptions::empty()).unwrap();
        aspace.unmap_page(&mut alloc, va, true).unwrap();
        assert_eq!(alloc.freed, [pa]);
    }

    #[test]
    fn unmap_of_unmapped_address_is_an_error() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);
        assert_eq!(
            aspace.unmap_page(&mut alloc, VirtualAddress::new(0x5000), false),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn release_owned_frees_every_frame_and_is_idempotent() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let start = VirtualAddress::new(0x10_0000);
        let mut mapped = Vec::new();
        for i in 0..4u64 {
            let pa = PhysicalAddress::new(0x1_0000_0000 + i * PAGE_SIZE);
            aspace
                .map_page(&mut alloc, start + i * PAGE_SIZE, pa, RW, MapOptions::empty())
                .unwrap();
            mapped.push(pa);
        }
        // A hole in the middle: released ranges skip it.
        aspace.unmap_page(&mut alloc, start + PAGE_SIZE, false).unwrap();
        mapped.remove(1);

        let end = start + 4 * PAGE_SIZE;
        aspace.release_area(&mut alloc, start, end, MappingKind::Owned);
        assert_eq!(alloc.freed, mapped);
        for i in 0..4u64 {
            assert_eq!(aspace.query(start + i * PAGE_SIZE), None);
        }

        // Second release of the same range: nothing further is freed.
        aspace.release_area(&mut alloc, start, end, MappingKind::Owned);
        assert_eq!(alloc.freed, mapped);
    }

    #[test]
    fn release_shared_never_frees() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va = VirtualAddress::new(0x20_0000);
        aspace
            .map_page(&mut alloc, va, PhysicalAddress::new(0x3_0000_0000), RW, MapOptions::empty())
            .unwrap();
        aspace.release_area(&mut alloc, va, va + PAGE_SIZE, MappingKind::Shared);
        assert_eq!(aspace.query(va), None);
        assert!(alloc.freed.is_empty());
    }

    #[test]
    fn find_free_space_locates_a_gap() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let lower = VirtualAddress::new(0x10_0000);
        let upper = VirtualAddress::new(0x10_0000 + 8 * PAGE_SIZE);
        // Occupy pages 0, 1 and 4 of the window.
        for off in [0u64, 1, 4] {
            aspace
                .map_page(
                    &mut alloc,
                    lower + off * PAGE_SIZE,
                    PhysicalAddress::new(0x1_0000_0000 + off * PAGE_SIZE),
                    RW,
                    MapOptions::empty(),
                )
                .unwrap();
        }

        // A two-page run fits at pages 2..4.
        assert_eq!(
            aspace.find_free_space(2, lower, upper, false),
            Some(lower + 2 * PAGE_SIZE)
        );
        // A three-page run only fits after page 4.
        assert_eq!(
            aspace.find_free_space(3, lower, upper, false),
            Some(lower + 5 * PAGE_SIZE)
        );
        // Four pages nowhere fit in the window.
        assert_eq!(aspace.find_free_space(4, lower, upper, false), None);
    }

    #[test]
    fn find_free_space_clamps_user_searches() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, _alloc) = space(&phys);

        // A window entirely above the user half yields nothing for user
        // requests but succeeds for kernel ones.
        let lower = VirtualAddress::new(layout::USERSPACE_END);
        let upper = lower + 16 * PAGE_SIZE;
        assert_eq!(aspace.find_free_space(1, lower, upper, true), None);
        assert_eq!(aspace.find_free_space(1, lower, upper, false), Some(lower));
    }

    #[test]
    fn query_resolves_block_leaves() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        // Hand-install a 2 MiB block leaf at L2.
        let va = VirtualAddress::new(0x4000_0000);
        let block_pa = PhysicalAddress::new(0x0800_0000);
        let l3_phys = aspace
            .ensure_table(&mut alloc, aspace.root(), l4_index(va), RW)
            .unwrap();
        let l2_phys = aspace.ensure_table(&mut alloc, l3_phys, l3_index(va), RW).unwrap();
        let l2 = unsafe { get_table(&phys, l2_phys) };
        l2.set_entry(
            l2_index(va),
            PageTableEntry::from_parts(block_pa, RW | MemoryPageFlags::HUGE),
        );

        assert_eq!(aspace.query(va + 0x1234), Some(block_pa + 0x1234));
        // 4 KiB unmap refuses to edit through the block.
        assert_eq!(
            aspace.unmap_page(&mut alloc, va, false),
            Err(MapError::BlockMapping)
        );
        // So does mapping beneath it: descending through a block leaf
        // would treat mapped memory as a table.
        assert_eq!(
            aspace.map_page(
                &mut alloc,
                va,
                PhysicalAddress::new(0x0900_0000),
                RW,
                MapOptions::empty()
            ),
            Err(MapError::BlockMapping)
        );
    }

    #[test]
    fn derived_space_shares_the_kernel_half_only() {
        let phys = TestPhys::with_frames(FRAMES);
        let (kernel, mut alloc) = space(&phys);

        let kva = VirtualAddress::new(0xffff_8000_0000_0000);
        let uva = VirtualAddress::new(0x40_0000);
        kernel
            .map_page(&mut alloc, kva, PhysicalAddress::new(0x0030_0000), RW, MapOptions::empty())
            .unwrap();
        kernel
            .map_page(&mut alloc, uva, PhysicalAddress::new(0x0050_0000), RW, MapOptions::empty())
            .unwrap();

        let task = kernel.derive_user(&mut alloc).expect("derive");
        // Kernel half is visible through the shared top-level entries.
        assert_eq!(task.query(kva), Some(PhysicalAddress::new(0x0030_0000)));
        // User half starts empty.
        assert_eq!(task.query(uva), None);

        // A kernel mapping added later in a shared L3 shows up in the task
        // space without touching it.
        let kva2 = kva + PAGE_SIZE;
        kernel
            .map_page(&mut alloc, kva2, PhysicalAddress::new(0x0060_0000), RW, MapOptions::empty())
            .unwrap();
        assert_eq!(task.query(kva2), Some(PhysicalAddress::new(0x0060_0000)));
    }

    #[test]
    fn user_mapping_widens_existing_chain_permissions() {
        let phys = TestPhys::with_frames(FRAMES);
        let (aspace, mut alloc) = space(&phys);

        let va1 = VirtualAddress::new(0x40_0000);
        let va2 = va1 + PAGE_SIZE;
        aspace
            .map_page(&mut alloc, va1, PhysicalAddress::new(0x1_0000_0000), RW, MapOptions::empty())
            .unwrap();
        aspace
            .map_page(
                &mut alloc,
                va2,
                PhysicalAddress::new(0x1_0000_1000),
                RW | MemoryPageFlags::USER,
                MapOptions::empty(),
            )
            .unwrap();

        let root = unsafe { get_table(&phys, aspace.root()) };
        assert!(root.entry(l4_index(va2)).user());
    }
}
