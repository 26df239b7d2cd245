//! A small monolithic kernel for a single-hart 64-bit RISC-V machine with
//! a VirtIO-MMIO disk and a 16550 UART: Sv39 virtual memory with
//! copy-on-write fork, a round-robin scheduler, a POSIX-shaped system-call
//! interface, and a journaled inode file system.
//!
//! The crate doubles as a host-testable library: everything above the
//! hardware (frame allocator, page tables, buffer cache, log, inodes, file
//! table, syscall validation) builds and runs on any target, while CSRs,
//! MMIO and the assembly stubs are riscv64-only.

#![cfg_attr(not(test), no_std)]

mod asm;
pub mod bio;
pub mod buf;
pub mod console;
pub mod elf;
pub mod exec;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod klog;
pub mod log;
pub mod memlayout;
pub mod param;
pub mod printf;
pub mod proc;
pub mod riscv;
pub mod semaphore;
pub mod sleeplock;
pub mod spinlock;
pub mod start;
pub mod syscall;
pub mod trap;
pub mod uart;
pub mod virtio;
pub mod vm;

use crate::file::FileTable;
use crate::fs::Fs;
use crate::kalloc::Kmem;
use crate::klog::Klog;
use crate::virtio::VirtioDisk;

/// The boot disk's file system type.
pub type KernelFs = Fs<VirtioDisk>;

/// Process-wide singleton state: the frame allocator, the file system over
/// the boot disk, the open-file table, and the kernel log ring. Subsystems
/// receive it through `kernel()`.
pub struct Kernel {
    pub kmem: Kmem,
    pub fs: KernelFs,
    pub ftable: FileTable,
    pub klog: Klog,
}

static KERNEL: Kernel = Kernel {
    kmem: Kmem::new(),
    fs: Fs::new(VirtioDisk::new()),
    ftable: FileTable::new(),
    klog: Klog::new(),
};

pub fn kernel() -> &'static Kernel {
    &KERNEL
}

/// start() jumps here in supervisor mode on the boot hart with paging off.
#[cfg(target_arch = "riscv64")]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    extern "C" {
        static end: u8; // first address after kernel data, from kernel.ld
    }

    uart::init();
    crate::printf!("\nrvos kernel is booting...\n\n");

    // physical frame allocator over [kernel end, PHYSTOP)
    let first_free = unsafe { &end as *const u8 as usize };
    unsafe {
        KERNEL
            .kmem
            .init(memlayout::KERNBASE, first_free, memlayout::PHYSTOP)
    };

    vm::kvminit(&KERNEL.kmem); // kernel page table
    vm::kvminithart(); // turn on paging
    trap::trapinit(); // trap vector, interrupt enables, first tick

    KERNEL.fs.cache.device().init(&KERNEL.kmem); // virtio disk

    KERNEL.klog.init(); // the `log` facade records into the ring
    ::log::info!("klog ready");

    KERNEL.fs.init(param::ROOTDEV); // superblock + log recovery
    console::console_init(); // register the console device
    proc::procinit(); // process table
    proc::userinit(); // first user process

    crate::printf!("system boot successful\n");

    proc::scheduler()
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // bypass the printf lock: the panicking path may already hold it.
    printf::_print_unlocked(format_args!("kernel panic: {}\n", info));
    loop {
        riscv::wfi();
    }
}
