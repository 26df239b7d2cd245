//! Trap plumbing: the timer, kernel- and user-mode trap handlers, and the
//! return path to user space through the trampoline.

use crate::proc::{myproc, wakeup, ProcState};
use crate::riscv::{
    r_scause, r_sepc, r_sstatus, r_time, w_sepc, w_sstatus, w_stimecmp, SSTATUS_SPP,
};
use crate::spinlock::SpinLock;

// about a tenth of a second on qemu's 10MHz clock.
pub const TIMER_INTERVAL: u64 = 1_000_000;

pub static TICKS: SpinLock<u64> = SpinLock::new("time", 0);

pub fn ticks_now() -> u64 {
    *TICKS.lock()
}

/// The channel sys_sleep waits on; the clock interrupt wakes it each tick.
pub fn ticks_chan() -> usize {
    &TICKS as *const _ as usize
}

fn clockintr() {
    let mut t = TICKS.lock();
    *t += 1;
    drop(t);
    wakeup(ticks_chan());

    // ask for the next timer interrupt.
    w_stimecmp(r_time() + TIMER_INTERVAL);
}

#[derive(PartialEq)]
enum Intr {
    Timer,
    NotRecognized,
}

// If this trap is a device interrupt, handle it. Only the sstc timer
// exists on this machine: the disk is polled and the UART has no
// interrupt line wired up here.
fn devintr(scause: u64) -> Intr {
    if scause & (1 << 63) != 0 && scause & 0xff == 5 {
        // supervisor timer interrupt.
        clockintr();
        Intr::Timer
    } else {
        Intr::NotRecognized
    }
}

/// Interrupts and exceptions while in supervisor mode come here via
/// kernelvec, on the current kernel stack.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if sstatus & SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if crate::riscv::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    if scause & (1 << 63) != 0 {
        if devintr(scause) == Intr::Timer {
            // give up the CPU when a timer interrupt lands on a running
            // process.
            if let Some(p) = myproc() {
                if p.inner.lock().state == ProcState::Running {
                    crate::proc::yield_cpu();
                }
            }
        } else {
            panic!("kerneltrap: unexpected interrupt scause={:#x}", scause);
        }
    } else {
        panic!(
            "kerneltrap: exception scause={:#x} sepc={:#x} stval={:#x}",
            scause,
            sepc,
            crate::riscv::r_stval()
        );
    }

    // restore trap registers for use by kernelvec.S's sepc instruction,
    // since yield() may have caused other traps.
    w_sepc(sepc);
    w_sstatus(sstatus);
}

#[cfg(target_arch = "riscv64")]
mod user {
    use super::*;
    use crate::kernel;
    use crate::memlayout::TRAMPOLINE;
    use crate::proc::exit;
    use crate::riscv::{
        intr_off, intr_on, make_satp, r_satp, r_stval, w_sie, w_stvec, PGSIZE, SCOUNTEREN_CY,
        SCOUNTEREN_IR, SCOUNTEREN_TM, SIE_SEIE, SIE_SSIE, SIE_STIE,
    };
    use crate::vm;

    extern "C" {
        fn kernelvec();
        static trampoline: u8;
        static uservec: u8;
        static userret: u8;
    }

    pub fn trapinit() {
        // take exceptions and traps in the kernel vector,
        w_stvec(kernelvec as usize);
        // accept software, timer and external interrupts,
        w_sie(crate::riscv::r_sie() | SIE_SSIE | SIE_STIE | SIE_SEIE);
        // let user mode read cycle/time/instret,
        crate::riscv::w_scounteren(SCOUNTEREN_CY | SCOUNTEREN_TM | SCOUNTEREN_IR);
        // and arm the first tick.
        w_stimecmp(r_time() + TIMER_INTERVAL);
    }

    /// Handle an interrupt, exception, or system call from user space.
    /// Called from the trampoline.
    #[no_mangle]
    pub extern "C" fn usertrap() {
        if r_sstatus() & SSTATUS_SPP != 0 {
            panic!("usertrap: not from user mode");
        }

        // we're in the kernel now: traps go to kernelvec.
        w_stvec(kernelvec as usize);

        let p = myproc().expect("usertrap: no process");
        let pd = unsafe { p.data() };
        let tf = unsafe { &mut *pd.trapframe };

        // save user program counter.
        tf.epc = r_sepc() as u64;

        let scause = r_scause();
        let mut which_dev = Intr::NotRecognized;

        if scause == 8 {
            // system call
            if crate::proc::killed(p) {
                exit(-1);
            }

            // sepc points to the ecall; return to the next instruction.
            tf.epc += 4;

            // an interrupt will change sepc, scause, and sstatus, so
            // enable only now that we're done with those registers.
            intr_on();
            crate::syscall::syscall();
        } else if scause & (1 << 63) != 0 {
            which_dev = devintr(scause);
            if which_dev == Intr::NotRecognized {
                log::warn!("usertrap: unexpected interrupt scause={:#x}", scause);
            }
        } else if scause == 13 || scause == 15 {
            // load/store page fault: a write to a COW page resolves to a
            // private copy; anything else kills the process.
            let va = r_stval();
            let pt = unsafe { pd.pagetable.unwrap().as_mut() };
            if vm::cow_resolve(&kernel().kmem, pt, va).is_err() {
                log::info!(
                    "usertrap: page fault pid={} sepc={:#x} stval={:#x}",
                    p.pid(),
                    tf.epc,
                    va
                );
                crate::proc::setkilled(p);
            }
        } else {
            // instruction page fault, illegal instruction, ...: the
            // process dies, the kernel keeps running.
            log::info!(
                "usertrap: unexpected scause={:#x} pid={} sepc={:#x} stval={:#x}",
                scause,
                p.pid(),
                tf.epc,
                r_stval()
            );
            crate::proc::setkilled(p);
        }

        if crate::proc::killed(p) {
            exit(-1);
        }

        // give up the CPU if this was a timer interrupt.
        if which_dev == Intr::Timer {
            crate::proc::yield_cpu();
        }

        usertrapret();
    }

    /// Return to user space through the trampoline.
    pub fn usertrapret() {
        let p = myproc().expect("usertrapret: no process");
        let pd = unsafe { p.data() };

        // we're about to switch the destination of traps from
        // kerneltrap() to usertrap(); turn off interrupts until back in
        // user space where usertrap() is correct.
        intr_off();

        // send syscalls, interrupts, and exceptions to uservec.
        let tramp = unsafe { &trampoline as *const u8 as usize };
        let uvec = unsafe { &uservec as *const u8 as usize };
        w_stvec(TRAMPOLINE + (uvec - tramp));

        // trapframe fields uservec will need when the process traps back
        // into the kernel.
        let tf = unsafe { &mut *pd.trapframe };
        tf.kernel_satp = r_satp() as u64; // kernel page table
        tf.kernel_sp = (pd.kstack + PGSIZE) as u64; // process's kernel stack
        tf.kernel_trap = usertrap as usize as u64;

        // set up the registers that the trampoline's sret will use.
        let mut x = r_sstatus();
        x &= !SSTATUS_SPP; // user mode
        x |= crate::riscv::SSTATUS_SPIE; // interrupts on in user mode
        w_sstatus(x);

        w_sepc(tf.epc as usize);

        let satp = make_satp(pd.pagetable.unwrap().as_ptr() as usize);

        // jump to userret in the trampoline, which switches to the user
        // page table, restores user registers, and srets. The trapframe
        // lives at the fixed TRAPFRAME address in every user page table.
        let uret = unsafe { &userret as *const u8 as usize };
        let f = TRAMPOLINE + (uret - tramp);
        unsafe {
            let f: extern "C" fn(usize) = core::mem::transmute(f);
            f(satp);
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use user::{trapinit, usertrapret};
