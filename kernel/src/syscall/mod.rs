//! System call numbering and dispatch.

mod syscall;
pub mod sysfile;
pub mod sysproc;

pub use syscall::{
    argaddr, argint, argstr, check_user_range, check_user_writable, fetchaddr, fetchstr, syscall,
};

// System call numbers: the user-facing ABI.
pub const SYS_EXIT: usize = 0;
pub const SYS_GETPID: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 4;
pub const SYS_WRITE: usize = 5;
pub const SYS_READ: usize = 6;
pub const SYS_OPEN: usize = 7;
pub const SYS_CLOSE: usize = 8;
pub const SYS_UNLINK: usize = 9;
pub const SYS_SBRK: usize = 10;
pub const SYS_TIME: usize = 11;
pub const SYS_SYMLINK: usize = 12;
pub const SYS_SET_CRASH_STAGE: usize = 13;
pub const SYS_RECOVER_LOG: usize = 14;
pub const SYS_CLEAR_CACHE: usize = 15;
pub const SYS_EXEC: usize = 16;
pub const SYS_DUP: usize = 17;
pub const SYS_MKNOD: usize = 18;
pub const SYS_CHDIR: usize = 19;
pub const SYS_TICKS: usize = 20;
pub const SYS_GETPRIORITY: usize = 21;
pub const SYS_KLOG_DUMP: usize = 22;
pub const SYS_KLOG_SET_THRESHOLD: usize = 23;
pub const SYS_SLEEP: usize = 24;

pub const NSYSCALL: usize = 25;

/// One dispatch-table entry: the handler plus metadata for diagnostics.
pub struct SyscallDesc {
    pub func: fn() -> u64,
    pub name: &'static str,
    pub nargs: usize,
}

macro_rules! desc {
    ($func:path, $name:literal, $nargs:literal) => {
        Some(SyscallDesc {
            func: $func,
            name: $name,
            nargs: $nargs,
        })
    };
}

/// Dense table indexed by syscall number from a7.
pub static SYSCALLS: [Option<SyscallDesc>; NSYSCALL] = [
    /* 0 exit */ desc!(sysproc::sys_exit, "exit", 1),
    /* 1 getpid */ desc!(sysproc::sys_getpid, "getpid", 0),
    /* 2 fork */ desc!(sysproc::sys_fork, "fork", 0),
    /* 3 wait */ desc!(sysproc::sys_wait, "wait", 1),
    /* 4 kill */ desc!(sysproc::sys_kill, "kill", 1),
    /* 5 write */ desc!(sysfile::sys_write, "write", 3),
    /* 6 read */ desc!(sysfile::sys_read, "read", 3),
    /* 7 open */ desc!(sysfile::sys_open, "open", 2),
    /* 8 close */ desc!(sysfile::sys_close, "close", 1),
    /* 9 unlink */ desc!(sysfile::sys_unlink, "unlink", 1),
    /* 10 sbrk */ desc!(sysproc::sys_sbrk, "sbrk", 1),
    /* 11 time */ desc!(sysproc::sys_time, "time", 0),
    /* 12 symlink */ desc!(sysfile::sys_symlink, "symlink", 2),
    /* 13 set_crash_stage */ desc!(sysproc::sys_set_crash_stage, "set_crash_stage", 1),
    /* 14 recover_log */ desc!(sysproc::sys_recover_log, "recover_log", 0),
    /* 15 clear_cache */ desc!(sysproc::sys_clear_cache, "clear_cache", 0),
    /* 16 exec */ desc!(sysfile::sys_exec, "exec", 2),
    /* 17 dup */ desc!(sysfile::sys_dup, "dup", 1),
    /* 18 mknod */ desc!(sysfile::sys_mknod, "mknod", 4),
    /* 19 chdir */ desc!(sysfile::sys_chdir, "chdir", 1),
    /* 20 ticks */ desc!(sysproc::sys_ticks, "ticks", 0),
    /* 21 getpriority */ desc!(sysproc::sys_getpriority, "getpriority", 0),
    /* 22 klog_dump */ desc!(sysproc::sys_klog_dump, "klog_dump", 0),
    /* 23 klog_set_threshold */ desc!(sysproc::sys_klog_set_threshold, "klog_set_threshold", 2),
    /* 24 sleep */ desc!(sysproc::sys_sleep, "sleep", 1),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_the_abi() {
        // the numbering is the user ABI; a reshuffle would break every
        // binary, so nail it down.
        let expect: [(usize, &str, usize); 25] = [
            (SYS_EXIT, "exit", 1),
            (SYS_GETPID, "getpid", 0),
            (SYS_FORK, "fork", 0),
            (SYS_WAIT, "wait", 1),
            (SYS_KILL, "kill", 1),
            (SYS_WRITE, "write", 3),
            (SYS_READ, "read", 3),
            (SYS_OPEN, "open", 2),
            (SYS_CLOSE, "close", 1),
            (SYS_UNLINK, "unlink", 1),
            (SYS_SBRK, "sbrk", 1),
            (SYS_TIME, "time", 0),
            (SYS_SYMLINK, "symlink", 2),
            (SYS_SET_CRASH_STAGE, "set_crash_stage", 1),
            (SYS_RECOVER_LOG, "recover_log", 0),
            (SYS_CLEAR_CACHE, "clear_cache", 0),
            (SYS_EXEC, "exec", 2),
            (SYS_DUP, "dup", 1),
            (SYS_MKNOD, "mknod", 4),
            (SYS_CHDIR, "chdir", 1),
            (SYS_TICKS, "ticks", 0),
            (SYS_GETPRIORITY, "getpriority", 0),
            (SYS_KLOG_DUMP, "klog_dump", 0),
            (SYS_KLOG_SET_THRESHOLD, "klog_set_threshold", 2),
            (SYS_SLEEP, "sleep", 1),
        ];
        for (num, name, nargs) in expect {
            let d = SYSCALLS[num].as_ref().unwrap();
            assert_eq!(d.name, name, "syscall {}", num);
            assert_eq!(d.nargs, nargs, "syscall {}", num);
        }
    }
}
