//! Argument fetch and validation for system calls, plus the numeric
//! dispatcher. Arguments 0..5 arrive in the trap frame's a0..a5; any
//! fetch failure makes the call return -1 without touching kernel state.

use crate::printf;
use crate::proc::myproc;
use crate::riscv::{pg_round_down, PageTable, PteFlags, MAXVA, PGSIZE};
use crate::syscall::SYSCALLS;
use crate::vm;

fn argraw(n: usize) -> u64 {
    let p = myproc().expect("argraw: no process");
    let tf = unsafe { &*p.data().trapframe };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the nth system call argument, narrowed to an int.
pub fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// Fetch the nth argument as a user pointer: NULL passes through, anything
/// else must point into the caller's mapped, user-accessible space.
pub fn argaddr(n: usize) -> Result<usize, ()> {
    let addr = argraw(n) as usize;
    if addr != 0 && !user_range_ok(addr, 1, false) {
        return Err(());
    }
    Ok(addr)
}

/// Fetch the nth argument as a NUL-terminated string copied into buf.
/// Fails if the string doesn't fit (including its NUL). Returns the
/// length.
pub fn argstr(n: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let addr = argaddr(n)?;
    fetchstr(addr, buf)
}

/// Fetch the usize at user address addr.
pub fn fetchaddr(addr: usize) -> Result<usize, ()> {
    let p = myproc().ok_or(())?;
    let pd = unsafe { p.data() };
    // both tests needed, in case of overflow.
    if addr >= pd.sz || addr + core::mem::size_of::<usize>() > pd.sz {
        return Err(());
    }
    let pt = unsafe { pd.pagetable.ok_or(())?.as_ref() };
    let mut bytes = [0u8; core::mem::size_of::<usize>()];
    vm::copyin(pt, &mut bytes, addr)?;
    Ok(usize::from_le_bytes(bytes))
}

/// Fetch the NUL-terminated string at user address addr.
pub fn fetchstr(addr: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let p = myproc().ok_or(())?;
    let pd = unsafe { p.data() };
    let pt = unsafe { pd.pagetable.ok_or(())?.as_ref() };
    vm::copyinstr(pt, buf, addr)
}

/// Validate that [addr, addr+size) lies in user-mapped memory: below
/// MAXVA, no overflow, every page V+U, and W as well when the kernel is
/// going to write through it. Zero-length ranges always pass.
pub fn check_user_range(pt: &PageTable, addr: usize, size: i64, write: bool) -> bool {
    if size < 0 {
        return false;
    }
    if size == 0 {
        return true;
    }
    let size = size as usize;

    if addr >= MAXVA {
        return false;
    }
    let Some(end) = addr.checked_add(size) else {
        return false;
    };
    if end > MAXVA {
        return false;
    }

    let mut va = pg_round_down(addr);
    while va < end {
        let Some(pte) = vm::walk_lookup(pt, va) else {
            return false;
        };
        let flags = pte.flags();
        if !flags.contains(PteFlags::V | PteFlags::U) {
            return false;
        }
        if write && !flags.contains(PteFlags::W) {
            return false;
        }
        va += PGSIZE;
    }
    true
}

fn user_range_ok(addr: usize, size: i64, write: bool) -> bool {
    let Some(p) = myproc() else {
        return false;
    };
    let pd = unsafe { p.data() };
    let Some(pt) = pd.pagetable else {
        return false;
    };
    check_user_range(unsafe { pt.as_ref() }, addr, size, write)
}

/// Check a user pointer the current process handed us for an upcoming
/// kernel write of `size` bytes.
pub fn check_user_writable(addr: usize, size: i64) -> bool {
    user_range_ok(addr, size, true)
}

/// Dispatch the system call number in a7, leaving the return value in a0.
pub fn syscall() {
    let p = myproc().expect("syscall: no process");
    let (num, name) = {
        let pd = unsafe { p.data() };
        (unsafe { (*pd.trapframe).a7 } as usize, pd.name)
    };

    match SYSCALLS.get(num).and_then(|d| d.as_ref()) {
        Some(desc) => {
            let ret = (desc.func)();
            let pd = unsafe { p.data() };
            unsafe { (*pd.trapframe).a0 = ret };
        }
        None => {
            printf!(
                "{} {}: unknown sys call {}\n",
                p.pid(),
                core::str::from_utf8(&name).unwrap_or("?"),
                num
            );
            let pd = unsafe { p.data() };
            unsafe { (*pd.trapframe).a0 = u64::MAX };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_kmem;

    #[test]
    fn user_range_checks() {
        let (km, _) = test_kmem(64);
        let root = vm::create_pagetable(km).unwrap();
        let pt = unsafe { &mut *root.as_ptr() };

        // two user pages, the second read-only
        vm::uvmalloc(km, pt, 0, 2 * PGSIZE).unwrap();
        {
            let pte = vm::walk_lookup_mut(pt, PGSIZE).unwrap();
            *pte = crate::riscv::Pte::new(pte.pa(), pte.flags() - PteFlags::W);
        }
        // and one kernel-only page above them
        let frame = km.alloc_page().unwrap().as_ptr() as usize;
        vm::map_page(km, pt, 2 * PGSIZE, frame, PteFlags::R | PteFlags::W).unwrap();

        let pt = &*pt;
        // zero-length always succeeds, even at hostile addresses
        assert!(check_user_range(pt, 0, 0, false));
        assert!(check_user_range(pt, usize::MAX, 0, true));

        assert!(check_user_range(pt, 0, PGSIZE as i64, false));
        assert!(check_user_range(pt, 100, 200, true));
        // spanning into the read-only page is fine to read, not to write
        assert!(check_user_range(pt, 0, 2 * PGSIZE as i64, false));
        assert!(!check_user_range(pt, 0, 2 * PGSIZE as i64, true));
        // the kernel-ish page has no PTE_U
        assert!(!check_user_range(pt, 2 * PGSIZE, 8, false));
        // unmapped, negative, overflowing and out-of-range cases
        assert!(!check_user_range(pt, 3 * PGSIZE, 1, false));
        assert!(!check_user_range(pt, 0, -1, false));
        assert!(!check_user_range(pt, usize::MAX - 4, 8, false));
        assert!(!check_user_range(pt, MAXVA, 1, false));
    }
}
