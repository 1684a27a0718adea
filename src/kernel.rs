//! The kernel singleton and the boot sequence.

use core::fmt;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    arch,
    bio::{Bcache, Buf},
    console,
    cpu::Cpus,
    kalloc::Kmem,
    lock::{Sleepablelock, Spinlock},
    memlayout::PHYSTOP,
    plic,
    proc::Procs,
    trap,
    uart::Uart,
    virtio::{self, VirtioDisk},
    vm::KernelMemory,
};

/// The kernel.
static mut KERNEL: KernelBuilder = KernelBuilder::zero();

/// After initialization, the kernel is safe to access immutably from every
/// hart.
#[inline]
pub fn kernel_builder() -> &'static KernelBuilder {
    // SAFETY: mutable access happens only on hart 0 before the other harts
    // are released, through kernel_builder_mut.
    unsafe { &*core::ptr::addr_of!(KERNEL) }
}

/// Mutable access to the kernel, for single-hart boot initialization.
///
/// # Safety
///
/// Only hart 0 may call this, before it publishes STARTED; each returned
/// reference must be dropped before the next call.
#[inline]
unsafe fn kernel_builder_mut() -> &'static mut KernelBuilder {
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) }
}

pub struct KernelBuilder {
    panicked: AtomicBool,

    pub uart: Uart,

    pub printer: Spinlock<Printer>,

    /// The physical page allocator.
    pub kmem: Kmem,

    /// The kernel's own (global) page table.
    memory: MaybeUninit<KernelMemory>,

    /// The clock, advanced by CPU 0 on timer interrupts. Sleepable so
    /// sys_sleep can wait for it.
    pub ticks: Sleepablelock<u32>,

    /// The process table and scheduler.
    pub procs: Procs,

    pub cpus: Cpus,

    /// The disk block cache.
    pub bcache: Bcache,

    /// The virtio disk driver.
    pub disk: Sleepablelock<VirtioDisk>,
}

impl KernelBuilder {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            uart: Uart::new(),
            printer: Spinlock::new("PRINTLN", Printer::new()),
            kmem: Kmem::new(),
            memory: MaybeUninit::uninit(),
            ticks: Sleepablelock::new("time", 0),
            procs: Procs::new(),
            cpus: Cpus::new(),
            bcache: Bcache::new(),
            disk: Sleepablelock::new("virtio", VirtioDisk::new()),
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// The global kernel page table.
    ///
    /// # Safety
    ///
    /// Only after hart 0 created it in kernel_main.
    pub unsafe fn kernel_memory(&self) -> &KernelMemory {
        unsafe { self.memory.assume_init_ref() }
    }

    /// Prints the given formatted string with the Printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // The panicking hart owns the console; skip the lock.
            // SAFETY: other printers stop at the panicked flag.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut printer = self.printer.lock();
            printer.write_fmt(args)
        }
    }

    /// Returns a locked buffer with the contents of the indicated block,
    /// reading it from the disk if the cache does not hold it yet.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bcache.get(dev, blockno);
        if !b.valid {
            virtio::disk_rw(&self.disk, &mut b, false);
            b.valid = true;
        }
        b
    }

    /// Writes the held buffer's contents to the disk.
    pub fn bwrite(&self, b: &mut Buf<'_>) {
        virtio::disk_rw(&self.disk, b, true);
    }

    /// Services a virtio disk completion interrupt.
    pub fn disk_intr(&self) {
        virtio::disk_intr(&self.disk);
    }
}

pub struct Printer;

impl Printer {
    const fn new() -> Self {
        Self
    }
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            console::putc(c);
        }
        Ok(())
    }
}

use core::fmt::Write as _;

/// print! prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::kernel_builder().printer_write_fmt(format_args!($($arg)*)).unwrap();
    };
}

/// println! prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic by freezing this hart after reporting.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    // Make the other harts and printers stand down.
    kernel_builder().panic();
    println!("{}", info);

    loop {
        spin_loop();
    }
}

/// start() jumps here in supervisor mode on all CPUs.
pub unsafe fn kernel_main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if arch::cpu_id() == 0 {
        // Console.
        Uart::init();

        println!();
        println!("sv6 kernel is booting");
        println!();

        // Physical page allocator: every page between the kernel image and
        // PHYSTOP, all initially on this hart's freelist.
        // SAFETY: hart 0, before STARTED; the range is unused RAM.
        unsafe {
            kernel_builder_mut()
                .kmem
                .init(arch::kernel_end(), PHYSTOP)
        };

        // Create the kernel page table, and turn on paging.
        let memory = KernelMemory::new(&kernel_builder().kmem);
        // SAFETY: hart 0, before STARTED; the map covers the kernel image.
        unsafe { kernel_builder_mut().memory.write(memory).init_hart() };

        // The process table needs no setup: procs are built lazily.

        // Install the kernel trap vector.
        unsafe { trap::trap_init_hart() };

        // Set up the interrupt controller, and ask it for device
        // interrupts on this hart.
        unsafe { plic::init() };
        unsafe { plic::init_hart() };

        // Buffer cache.
        kernel_builder().bcache.init();

        // Emulated hard disk.
        // SAFETY: hart 0, before STARTED.
        unsafe { kernel_builder_mut().disk.get_mut().init() };

        // First user process.
        kernel_builder().procs.user_init(&kernel_builder().kmem);

        // Publish everything initialized above to the waiting harts.
        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            spin_loop();
        }

        println!("hart {} starting", arch::cpu_id());

        // Turn on paging.
        // SAFETY: hart 0 built the kernel memory before STARTED.
        unsafe { kernel_builder().kernel_memory().init_hart() };

        // Install the kernel trap vector.
        unsafe { trap::trap_init_hart() };

        // Ask the PLIC for device interrupts.
        unsafe { plic::init_hart() };
    }

    // SAFETY: this hart is fully set up to run processes.
    unsafe { kernel_builder().procs.scheduler() }
}
