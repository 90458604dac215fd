//! # Kernel Entry & Bring-up
//!
//! The portable side of boot: the architecture stubs land in
//! [`kernel_entry`] with the hand-off magic and descriptor address, and
//! everything from magic validation to the idle loop happens here in one
//! fixed order - normalize the boot descriptor, bring up the physical
//! memory manager, bind the kernel address space, install the vector
//! table, start the timer, enable interrupts.
//!
//! On hosted targets this crate builds as an empty binary so the
//! workspace compiles and tests on a development machine.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![allow(unsafe_code)]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(target_os = "none")]
use kernel_addresses::PhysicalAddress;
#[cfg(target_os = "none")]
use kernel_bootinfo::BOOT_MAGIC;
#[cfg(target_os = "none")]
use kernel_hal::context::Cpu;
#[cfg(target_os = "none")]
use kernel_hal::halt_forever;
#[cfg(target_os = "none")]
use kernel_hal::trap::{self, VectorTable, vector};
#[cfg(target_os = "none")]
use kernel_pmm::FrameBitmap;
#[cfg(target_os = "none")]
use kernel_vmem::PhysMapper;
#[cfg(target_os = "none")]
use log::{error, info};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Prints only once the console logger exists; before that the halt is
    // silent, which is all this layer can offer.
    error!("kernel panic: {info}");
    halt_forever();
}

/// Physical memory is identity-mapped by the boot stage, so a physical
/// address *is* a pointer here. Bounds against the identity-mapped window
/// are asserted rather than trusted.
#[cfg(target_os = "none")]
struct IdentityMapper;

#[cfg(target_os = "none")]
impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u64() < kernel_addresses::layout::IDENTITY_MAP_BYTES);
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// The boot stubs land here: `magic` and the boot-descriptor address are
/// the entire hand-off ABI.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(magic: u64, boot_info: u64) -> ! {
    if magic != BOOT_MAGIC {
        // Wrong loader, wrong protocol, or corrupted hand-off: nothing
        // about the machine state can be trusted, and no console exists
        // to complain on.
        halt_forever();
    }
    kmain(boot_info)
}

#[cfg(target_os = "none")]
static TICKS: AtomicU64 = AtomicU64::new(0);

#[cfg(target_os = "none")]
fn kmain(boot_info: u64) -> ! {
    platform::early_init();
    info!("boot magic validated, descriptor at {boot_info:#x}");

    let mapper = IdentityMapper;
    let regions = platform::memory_regions(boot_info);
    let mut pmm = match FrameBitmap::new(&mapper, regions.as_slice()) {
        Ok(pmm) => pmm,
        Err(e) => {
            error!("cannot build the frame allocator: {e}");
            halt_forever();
        }
    };
    let (image_start, image_len) = platform::kernel_image_extent();
    pmm.reserve_range(image_start, image_len);
    info!(
        "pmm ready: {} of {} frames free",
        pmm.free_frames(),
        pmm.total_frames()
    );

    let root = platform::current_root();
    // The dynamic page-table editor matches the primary architecture's
    // 4-level hardware walk; the second architecture runs on its static
    // boot map and exercises the editor only in hosted tests.
    #[cfg(target_arch = "x86_64")]
    {
        let kernel_space = kernel_vmem::AddressSpace::new(&mapper, root);
        vmm_self_check(&kernel_space, &mut pmm);
    }

    let mut vectors = VectorTable::new();
    vectors.register(vector::BREAKPOINT, on_breakpoint);
    vectors.register(vector::PAGE_FAULT, on_page_fault);
    vectors.register(vector::TIMER, on_timer);
    vectors.register(vector::SYSCALL, on_syscall);
    vectors.set_irq_ack(platform::irq_ack);
    // SAFETY: single core, interrupts still masked.
    unsafe { trap::install(vectors) };

    platform::timer_init();

    // The switching state the scheduler will drive; the boot address
    // space is what is live when it takes over.
    let _cpu = Cpu::new(root);

    // SAFETY: vector table and timer are live; handlers may fire now.
    unsafe { kernel_sync::irq::enable_interrupts() };
    info!("init complete, entering idle loop");
    loop {
        platform::wait_for_interrupt();
    }
}

/// Exercise the mapping path against real hardware tables once at boot:
/// find a free window, map it, write through it, release it. A kernel
/// that cannot do this will not survive its first task.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn vmm_self_check(
    space: &kernel_vmem::AddressSpace<'_, IdentityMapper>,
    pmm: &mut FrameBitmap<'_>,
) {
    use kernel_addresses::{PAGE_SIZE, VirtualAddress};
    use kernel_vmem::{MapOptions, MappingKind, MemoryPageFlags};

    // Search above the identity-mapped window so the scan cannot collide
    // with the boot block mappings.
    let lower = VirtualAddress::new(kernel_addresses::layout::IDENTITY_MAP_BYTES);
    let upper = VirtualAddress::new(kernel_addresses::layout::USERSPACE_END);
    let Some(base) = space.find_free_space(4, lower, upper, false) else {
        error!("vmm self-check: no free virtual window");
        halt_forever();
    };

    let free_before = pmm.free_frames();
    let flags = MemoryPageFlags::PRESENT | MemoryPageFlags::WRITABLE;
    for i in 0..4u64 {
        let Some(frame) = pmm.alloc_page() else {
            error!("vmm self-check: out of frames");
            halt_forever();
        };
        if let Err(e) = space.map_page(pmm, base + i * PAGE_SIZE, frame, flags, MapOptions::empty())
        {
            error!("vmm self-check: map failed: {e}");
            halt_forever();
        }
    }
    // Touch the fresh mapping; a bad table walk faults right here.
    let probe = base.as_u64() as *mut u64;
    unsafe {
        probe.write_volatile(0x74_65_70_68_72_61);
        assert_eq!(probe.read_volatile(), 0x74_65_70_68_72_61);
    }
    space.release_area(pmm, base, base + 4 * PAGE_SIZE, MappingKind::Owned);
    // The leaf frames come back; the two intermediate tables created for
    // the fresh window stay in place for future mappings there.
    assert_eq!(
        pmm.free_frames(),
        free_before - 2,
        "self-check leaked frames"
    );
    info!("vmm self-check passed at {base}");
}

#[cfg(target_os = "none")]
fn on_breakpoint(frame: &mut kernel_hal::arch::TrapFrame) {
    info!("breakpoint at {}", frame.instruction_pointer());
}

#[cfg(target_os = "none")]
fn on_page_fault(frame: &mut kernel_hal::arch::TrapFrame) {
    // No demand paging at this layer: a fault is fatal to the faulting
    // context. Print the snapshot, then halt.
    error!(
        "page fault at {} (faulting address {:#x}, from {})",
        frame.instruction_pointer(),
        platform::fault_address(),
        if frame.from_user() { "user" } else { "kernel" },
    );
    error!("{frame:#x?}");
    halt_forever();
}

#[cfg(target_os = "none")]
fn on_timer(_frame: &mut kernel_hal::arch::TrapFrame) {
    // This is where the scheduler preempts: it picks the next task and
    // lets `Cpu::switch_to` overwrite the live frame with the one to
    // resume. Without a run queue there is nothing to swap yet.
    let ticks = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % 100 == 0 {
        info!("timer: {ticks} ticks");
    }
    platform::timer_rearm();
}

#[cfg(target_os = "none")]
fn on_syscall(frame: &mut kernel_hal::arch::TrapFrame) {
    // The HAL only delivers the trap; the handler body belongs to the
    // portable syscall layer. Answer with "no such syscall" until one
    // exists.
    info!("syscall trap from {}", frame.instruction_pointer());
    platform::set_syscall_return(frame, u64::MAX);
}

// ── x86_64 platform glue ───────────────────────────────────────────────

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod platform {
    use kernel_addresses::PhysicalAddress;
    use kernel_bootinfo::{BootDescriptor, RegionTable, normalize_regions};
    use kernel_console::{ConsoleLogger, SerialConsole};
    use kernel_hal::arch::gdt::{Gdt, Tss};
    use kernel_hal::arch::idt::Idt;
    use kernel_hal::arch::pic::Pic8259;
    use kernel_hal::arch::{NativePorts, TrapFrame, pit, trap_entry};
    use kernel_hal::halt_forever;
    use kernel_sync::SpinMutex;
    use log::{LevelFilter, error, info};

    static TSS: Tss = Tss::new();
    static mut GDT: Option<Gdt> = None;
    static mut IDT: Idt = Idt::new();
    // SAFETY: the kernel owns the port space at CPL0.
    static LOGGER: ConsoleLogger<NativePorts> = ConsoleLogger::new(
        SerialConsole::new(unsafe { NativePorts::new() }),
        LevelFilter::Info,
    );
    static PIC: SpinMutex<Option<Pic8259<NativePorts>>> = SpinMutex::new(None);

    pub fn early_init() {
        // SAFETY: boot core, interrupts masked, statics written once.
        unsafe {
            let gdt = (*(&raw mut GDT)).insert(Gdt::new(&TSS));
            gdt.load();
            trap_entry::wire_idt(&mut *(&raw mut IDT));
            (*(&raw const IDT)).load();
        }
        let _ = LOGGER.init();
    }

    /// Parse and normalize the loader's descriptor. Without a memory map
    /// there is nothing to manage - that is unrecoverable.
    pub fn memory_regions(boot_info: u64) -> RegionTable {
        // SAFETY: the descriptor lies in identity-mapped low memory and
        // `from_addr` bounds the view by the header's own size field.
        let Some(desc) = (unsafe { BootDescriptor::from_addr(PhysicalAddress::new(boot_info)) })
        else {
            halt_forever();
        };
        if let Some(fb) = desc.framebuffer() {
            info!(
                "framebuffer: {}x{} @{}bpp, pitch {}, base {}",
                fb.width, fb.height, fb.bpp, fb.pitch, fb.addr
            );
        }
        let Some(map) = desc.memory_map() else {
            error!("boot descriptor carries no memory map");
            halt_forever();
        };
        normalize_regions(&map)
    }

    pub fn kernel_image_extent() -> (PhysicalAddress, u64) {
        unsafe extern "C" {
            static __kernel_start: u8;
            static __kernel_end: u8;
        }
        let start = &raw const __kernel_start as u64;
        let end = &raw const __kernel_end as u64;
        (PhysicalAddress::new(start), end - start)
    }

    #[must_use]
    pub fn current_root() -> PhysicalAddress {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new(cr3 & !0xFFF)
    }

    pub fn timer_init() {
        // SAFETY: CPL0; the PIC and PIT own their ports from here on.
        let mut pic = Pic8259::init(unsafe { NativePorts::new() });
        pic.enable_irq(0);
        pit::start_periodic(&mut unsafe { NativePorts::new() }, 100);
        *PIC.lock() = Some(pic);
    }

    pub fn timer_rearm() {
        // The PIT reloads itself in rate-generator mode.
    }

    pub fn irq_ack(vector: u8) {
        if let Some(pic) = PIC.lock().as_mut() {
            pic.end_of_interrupt(vector);
        }
    }

    #[must_use]
    pub fn fault_address() -> u64 {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        cr2
    }

    pub fn set_syscall_return(frame: &mut TrapFrame, value: u64) {
        frame.rax = value;
    }

    pub fn wait_for_interrupt() {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}

// ── aarch64 platform glue ──────────────────────────────────────────────

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod platform {
    use kernel_addresses::PhysicalAddress;
    use kernel_bootinfo::MemoryRegion;
    use kernel_console::{ConsoleLogger, SerialConsole};
    use kernel_hal::arch::gic::{GICC_BASE, GICD_BASE, Gic, TIMER_PPI};
    use kernel_hal::arch::uart::{Pl011, UART0_BASE};
    use kernel_hal::arch::{TrapFrame, timer, vectors};
    use kernel_hal::io::CompatPorts;
    use log::LevelFilter;

    // SAFETY: the UART register block is device-mapped by boot and owned
    // by the console from init on.
    static LOGGER: ConsoleLogger<CompatPorts<Pl011>> = ConsoleLogger::new(
        SerialConsole::new(CompatPorts::new(unsafe { Pl011::new(UART0_BASE) })),
        LevelFilter::Info,
    );

    /// No boot descriptor is synthesized on this machine; the memory
    /// layout of the QEMU `virt` board is fixed.
    static REGIONS: [MemoryRegion; 2] = [
        MemoryRegion {
            base: PhysicalAddress::new(0),
            length: 0x4000_0000,
            usable: false,
        },
        MemoryRegion {
            base: PhysicalAddress::new(0x4000_0000),
            length: 0x4000_0000,
            usable: true,
        },
    ];

    /// Adapter so both platform modules hand `kmain` the same shape.
    pub struct RegionTable;

    impl RegionTable {
        #[must_use]
        pub fn as_slice(&self) -> &'static [MemoryRegion] {
            &REGIONS
        }
    }

    pub fn early_init() {
        // Program the transceiver before the shim-wrapped console takes
        // over; the handle is dropped before the logger runs.
        // SAFETY: same device-mapped register block the logger owns.
        unsafe { Pl011::new(UART0_BASE) }.init();
        let _ = LOGGER.init();
        // SAFETY: boot core, interrupts masked.
        unsafe { vectors::install_vector_table() };
    }

    pub fn memory_regions(_boot_info: u64) -> RegionTable {
        RegionTable
    }

    pub fn kernel_image_extent() -> (PhysicalAddress, u64) {
        unsafe extern "C" {
            static __kernel_start: u8;
            static __kernel_end: u8;
        }
        let start = &raw const __kernel_start as u64;
        let end = &raw const __kernel_end as u64;
        (PhysicalAddress::new(start), end - start)
    }

    #[must_use]
    pub fn current_root() -> PhysicalAddress {
        let ttbr0: u64;
        unsafe {
            core::arch::asm!("mrs {}, ttbr0_el1", out(reg) ttbr0, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new(ttbr0 & !0xFFF)
    }

    pub fn timer_init() {
        // SAFETY: the GIC register blocks are device-mapped by boot.
        let gic = unsafe { Gic::new(GICD_BASE, GICC_BASE) };
        gic.init();
        gic.enable(TIMER_PPI);
        timer::start_periodic(100);
    }

    pub fn timer_rearm() {
        timer::rearm();
    }

    pub fn irq_ack(_vector: u8) {
        // End-of-interrupt is signalled with the acknowledged interrupt
        // id in the vector glue, which is the only place that id exists.
    }

    #[must_use]
    pub fn fault_address() -> u64 {
        let far: u64;
        unsafe {
            core::arch::asm!("mrs {}, far_el1", out(reg) far, options(nomem, nostack, preserves_flags));
        }
        far
    }

    pub fn set_syscall_return(frame: &mut TrapFrame, value: u64) {
        frame.x[0] = value;
    }

    pub fn wait_for_interrupt() {
        unsafe { core::arch::asm!("wfi", options(nomem, nostack, preserves_flags)) };
    }
}
