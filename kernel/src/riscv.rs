//! RISC-V CSR access and Sv39 page-table definitions.
//!
//! CSR accessors are real instructions only on riscv64; elsewhere they
//! compile to inert stubs so the hardware-independent core can be built and
//! tested on the host.

use bitflags::bitflags;

macro_rules! csr_read {
    ($(#[$doc:meta])* $name:ident, $csr:literal, $ty:ty) => {
        $(#[$doc])*
        #[inline]
        pub fn $name() -> $ty {
            #[cfg(target_arch = "riscv64")]
            unsafe {
                let x: $ty;
                core::arch::asm!(concat!("csrr {}, ", $csr), out(reg) x);
                x
            }
            #[cfg(not(target_arch = "riscv64"))]
            {
                0
            }
        }
    };
}

macro_rules! csr_write {
    ($(#[$doc:meta])* $name:ident, $csr:literal, $ty:ty) => {
        $(#[$doc])*
        #[inline]
        pub fn $name(x: $ty) {
            #[cfg(target_arch = "riscv64")]
            unsafe {
                core::arch::asm!(concat!("csrw ", $csr, ", {}"), in(reg) x);
            }
            #[cfg(not(target_arch = "riscv64"))]
            {
                let _ = x;
            }
        }
    };
}

// Machine Status Register, mstatus
pub const MSTATUS_MPP_MASK: u64 = 3 << 11; // previous mode.
pub const MSTATUS_MPP_S: u64 = 1 << 11;

csr_read!(r_mhartid, "mhartid", u64);
csr_read!(r_mstatus, "mstatus", u64);
csr_write!(w_mstatus, "mstatus", u64);

// machine exception program counter, holds the
// instruction address to which a return from
// exception will go.
csr_write!(w_mepc, "mepc", usize);

// Supervisor Status Register, sstatus
pub const SSTATUS_SPP: u64 = 1 << 8; // Previous mode, 1=Supervisor, 0=User
pub const SSTATUS_SPIE: u64 = 1 << 5; // Supervisor Previous Interrupt Enable
pub const SSTATUS_SIE: u64 = 1 << 1; // Supervisor Interrupt Enable

csr_read!(r_sstatus, "sstatus", u64);
csr_write!(w_sstatus, "sstatus", u64);

// Supervisor Interrupt Enable
pub const SIE_SEIE: u64 = 1 << 9; // external
pub const SIE_STIE: u64 = 1 << 5; // timer
pub const SIE_SSIE: u64 = 1 << 1; // software
csr_read!(r_sie, "sie", u64);
csr_write!(w_sie, "sie", u64);

// supervisor exception program counter, holds the
// instruction address to which a return from
// exception will go.
csr_read!(r_sepc, "sepc", usize);
csr_write!(w_sepc, "sepc", usize);

// Machine Exception Delegation
csr_write!(w_medeleg, "medeleg", u64);
// Machine Interrupt Delegation
csr_write!(w_mideleg, "mideleg", u64);

// Supervisor Trap-Vector Base Address
csr_write!(w_stvec, "stvec", usize);

// Machine Environment Configuration (csr 0x30a);
// bit 63 (STCE) turns on the sstc extension.
csr_read!(r_menvcfg, "0x30a", u64);
csr_write!(w_menvcfg, "0x30a", u64);

// Supervisor Timer Comparison (sstc, csr 0x14d).
csr_write!(w_stimecmp, "0x14d", u64);

// Physical Memory Protection
csr_write!(w_pmpcfg0, "pmpcfg0", u64);
csr_write!(w_pmpaddr0, "pmpaddr0", u64);

// Machine-mode Counter-Enable
csr_write!(w_mcounteren, "mcounteren", u64);

// Supervisor Counter-Enable: expose cycle/time/instret to user mode.
pub const SCOUNTEREN_CY: u64 = 1 << 0;
pub const SCOUNTEREN_TM: u64 = 1 << 1;
pub const SCOUNTEREN_IR: u64 = 1 << 2;
csr_write!(w_scounteren, "scounteren", u64);

// machine-mode cycle counter
csr_read!(r_time, "time", u64);

// Supervisor Trap Cause
csr_read!(r_scause, "scause", u64);

// Supervisor Trap Value
csr_read!(r_stval, "stval", usize);

// supervisor address translation and protection;
// holds the address of the page table.
csr_read!(r_satp, "satp", usize);
csr_write!(w_satp, "satp", usize);

// enable device interrupts
#[inline]
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

// disable device interrupts
#[inline]
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

// are device interrupts enabled?
#[inline]
pub fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

// read and write tp, the thread pointer, which holds
// this core's hartid (core number).
#[inline]
pub fn r_tp() -> usize {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        let x: usize;
        core::arch::asm!("mv {}, tp", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

#[inline]
pub fn w_tp(x: usize) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("mv tp, {}", in(reg) x);
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
    }
}

// flush the TLB.
#[inline]
pub fn sfence_vma() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        // the zero, zero means flush all TLB entries.
        core::arch::asm!("sfence.vma zero, zero");
    }
}

// wait for an interrupt; lets qemu idle instead of spinning.
#[inline]
pub fn wfi() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("wfi");
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

#[inline]
pub const fn pg_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

#[inline]
pub const fn pg_round_down(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Leaf/intermediate PTE permission and state bits. Bit 8 is the first
    /// RSW (software) bit; it marks a copy-on-write mapping and is never set
    /// together with W.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const V = 1 << 0; // valid
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4; // user can access
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        const COW = 1 << 8; // shared copy-on-write page
    }
}

/// One Sv39 page-table entry: PPN in bits 53..10, flags in bits 9..0.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub usize);

impl Pte {
    pub const INVALID: Pte = Pte(0);

    #[inline]
    pub const fn new(pa: usize, flags: PteFlags) -> Pte {
        Pte(((pa >> 12) << 10) | flags.bits())
    }

    #[inline]
    pub const fn pa(self) -> usize {
        (self.0 >> 10) << 12
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3ff)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid PTE with none of R/W/X points at the next-level table.
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid()
            && self
                .flags()
                .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

/// A page-table page: 512 64-bit PTEs.
#[repr(C, align(4096))]
pub struct PageTable(pub [Pte; 512]);

impl PageTable {
    pub const fn empty() -> PageTable {
        PageTable([Pte::INVALID; 512])
    }
}

// extract the three 9-bit page table indices from a virtual address.
const PXMASK: usize = 0x1ff; // 9 bits

#[inline]
pub const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + 9 * level)) & PXMASK
}

// one beyond the highest possible virtual address.
// MAXVA is actually one bit less than the max allowed by
// Sv39, to avoid having to sign-extend virtual addresses
// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

// use riscv's sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

#[inline]
pub const fn make_satp(pagetable_pa: usize) -> usize {
    SATP_SV39 | (pagetable_pa >> 12)
}
