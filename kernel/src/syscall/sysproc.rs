//! Process- and kernel-state system calls.

use log::LevelFilter;

use crate::kernel;
use crate::proc::{self, myproc};
use crate::riscv::r_time;
use crate::syscall::{argaddr, argint, check_user_writable};
use crate::trap::{ticks_chan, TICKS};

const ERR: u64 = u64::MAX;

pub fn sys_getpid() -> u64 {
    myproc().expect("sys_getpid").pid() as u64
}

pub fn sys_fork() -> u64 {
    proc::fork() as u64
}

pub fn sys_exit() -> u64 {
    let status = argint(0);
    proc::exit(status); // never returns
}

pub fn sys_wait() -> u64 {
    let Ok(addr) = argaddr(0) else {
        return ERR;
    };
    if addr != 0 && !check_user_writable(addr, core::mem::size_of::<i32>() as i64) {
        return ERR;
    }
    proc::wait(addr) as u64
}

pub fn sys_kill() -> u64 {
    proc::kill(argint(0)) as u64
}

pub fn sys_sbrk() -> u64 {
    let n = argint(0);
    match proc::grow(n) {
        Ok(oldsz) => oldsz as u64,
        Err(()) => ERR,
    }
}

pub fn sys_time() -> u64 {
    r_time()
}

pub fn sys_ticks() -> u64 {
    *TICKS.lock()
}

/// Sleep for n clock ticks, bailing out early if killed.
pub fn sys_sleep() -> u64 {
    let n = argint(0);
    if n <= 0 {
        return 0;
    }
    let p = myproc().expect("sys_sleep");

    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < n as u64 {
        if proc::killed(p) {
            return ERR;
        }
        ticks = proc::sleep(ticks_chan(), ticks);
    }
    0
}

pub fn sys_getpriority() -> u64 {
    let p = myproc().expect("sys_getpriority");
    unsafe { p.data() }.priority as u64
}

// Test hooks for the crash-recovery scenarios.

pub fn sys_set_crash_stage() -> u64 {
    let stage = argint(0);
    if !(0..=2).contains(&stage) {
        return ERR;
    }
    kernel().fs.log.set_crash_stage(stage);
    0
}

pub fn sys_recover_log() -> u64 {
    let fs = &kernel().fs;
    fs.log.recover(&fs.cache);
    0
}

pub fn sys_clear_cache() -> u64 {
    kernel().fs.cache.clear_cache();
    0
}

// Kernel log ring controls.

pub fn sys_klog_dump() -> u64 {
    kernel().klog.dump();
    0
}

fn level_filter(v: i32) -> Option<LevelFilter> {
    match v {
        1 => Some(LevelFilter::Error),
        2 => Some(LevelFilter::Warn),
        3 => Some(LevelFilter::Info),
        4 => Some(LevelFilter::Debug),
        5 => Some(LevelFilter::Trace),
        _ => None,
    }
}

pub fn sys_klog_set_threshold() -> u64 {
    let (Some(record), Some(console)) = (level_filter(argint(0)), level_filter(argint(1))) else {
        return ERR;
    };
    kernel().klog.set_thresholds(record, console);
    0
}
