//! Machine-mode one-shot: entry.S lands here on the boot hart; we set
//! things up so that an mret drops into supervisor-mode kmain() with
//! paging off, all traps delegated, and the sstc timer armed.

#![cfg(target_arch = "riscv64")]

use crate::riscv::{
    r_menvcfg, r_mhartid, r_mstatus, r_time, w_medeleg, w_mepc, w_menvcfg, w_mcounteren,
    w_mideleg, w_mstatus, w_pmpaddr0, w_pmpcfg0, w_satp, w_sie, w_stimecmp, w_tp,
    MSTATUS_MPP_MASK, MSTATUS_MPP_S, SIE_SEIE, SIE_SSIE, SIE_STIE,
};
use crate::trap::TIMER_INTERVAL;

pub const NCPU: usize = 1;
const STACK_SIZE: usize = 4096;

// entry.S needs one stack per CPU.
#[repr(C, align(16))]
pub struct Stack0([u8; STACK_SIZE * NCPU]);

// written through sp by entry.S, so it must not land in read-only data.
#[no_mangle]
#[allow(non_upper_case_globals)] // entry.S wants the symbol spelled this way
pub static mut stack0: Stack0 = Stack0([0; STACK_SIZE * NCPU]);

/// entry.S jumps here in machine mode on stack0.
#[no_mangle]
pub extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    let mut x = r_mstatus();
    x &= !MSTATUS_MPP_MASK;
    x |= MSTATUS_MPP_S;
    w_mstatus(x);

    // set M Exception Program Counter to kmain, for mret.
    w_mepc(crate::kmain as usize);

    // disable paging for now.
    w_satp(0);

    // delegate all interrupts and exceptions to supervisor mode.
    w_medeleg(0xffff);
    w_mideleg(0xffff);
    w_sie(crate::riscv::r_sie() | SIE_SEIE | SIE_STIE | SIE_SSIE);

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    w_pmpaddr0(0x3f_ffff_ffff_ffff);
    w_pmpcfg0(0xf);

    timerinit();

    // keep each CPU's hartid in its tp register, for cpuid().
    w_tp(r_mhartid() as usize);

    // switch to supervisor mode and jump to kmain().
    unsafe { core::arch::asm!("mret", options(noreturn)) }
}

/// Ask for clock interrupts via the sstc extension, so the supervisor can
/// rearm stimecmp itself with no machine-mode bouncing.
fn timerinit() {
    // enable supervisor-mode timer interrupts.
    w_menvcfg(r_menvcfg() | (1u64 << 63)); // STCE
    // allow supervisor to read time.
    w_mcounteren(0xf);
    w_stimecmp(r_time() + TIMER_INTERVAL);
}
