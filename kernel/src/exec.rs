//! exec(): replace the calling process's address space with a new program
//! image loaded from an ELF64 file, leaving the caller untouched on any
//! failure.

use core::mem;
use core::ptr::NonNull;

use crate::elf::{
    ElfHeader, ProgramHeader, ELF_CLASS64, ELF_MAGIC, ELF_PROG_FLAG_EXEC, ELF_PROG_FLAG_WRITE,
    ELF_PROG_LOAD,
};
use crate::fs::InodeGuard;
use crate::kernel;
use crate::param::MAXARG;
use crate::proc::{myproc, proc_freepagetable, proc_pagetable};
use crate::riscv::{pg_round_up, PageTable, PteFlags, MAXVA, PGSIZE};
use crate::syscall::{fetchaddr, fetchstr};
use crate::vm;

fn flags2perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm |= PteFlags::X;
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm |= PteFlags::W;
    }
    perm | PteFlags::R
}

/// Load and start the program at `path` with the NULL-terminated user
/// argv array at `uargv`. Returns argc, which lands in a0 and becomes the
/// first argument to main(argc, argv).
pub fn exec(path: &[u8], uargv: usize) -> Result<usize, ()> {
    let p = myproc().ok_or(())?;
    let pd = unsafe { p.data() };
    let fs = &kernel().fs;
    let kmem = &kernel().kmem;

    fs.begin_transaction();

    let Some(ip) = fs.namei(path) else {
        fs.end_transaction();
        return Err(());
    };
    let mut g = fs.ilock(ip);

    // Check ELF header.
    let mut elf = ElfHeader::zeroed();
    let ehsz = mem::size_of::<ElfHeader>() as u32;
    if fs.readi(&mut g, false, &mut elf as *mut ElfHeader as usize, 0, ehsz) != Ok(ehsz)
        || elf.magic != ELF_MAGIC
        || elf.ident[0] != ELF_CLASS64
    {
        fs.iunlockput(g, ip);
        fs.end_transaction();
        return Err(());
    }

    let Some(root) = proc_pagetable(kmem, pd.trapframe) else {
        fs.iunlockput(g, ip);
        fs.end_transaction();
        return Err(());
    };
    let pt = unsafe { &mut *root.as_ptr() };

    // Load each program segment.
    let mut sz = 0usize;
    let phsz = mem::size_of::<ProgramHeader>() as u32;
    for i in 0..elf.phnum {
        let off = elf.phoff as u32 + i as u32 * phsz;
        let mut ph = ProgramHeader::zeroed();
        if fs.readi(&mut g, false, &mut ph as *mut ProgramHeader as usize, off, phsz) != Ok(phsz) {
            return bad(root, sz, Some((g, ip)));
        }
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || (ph.vaddr + ph.memsz) as usize >= MAXVA
            || ph.vaddr as usize % PGSIZE != 0
        {
            return bad(root, sz, Some((g, ip)));
        }

        let Some(sz1) = vm::uvmalloc_perm(
            kmem,
            pt,
            sz,
            (ph.vaddr + ph.memsz) as usize,
            flags2perm(ph.flags),
        ) else {
            return bad(root, sz, Some((g, ip)));
        };
        sz = sz1;

        if loadseg(pt, ph.vaddr as usize, &mut g, ph.off as u32, ph.filesz as u32).is_err() {
            return bad(root, sz, Some((g, ip)));
        }
    }
    fs.iunlockput(g, ip);
    fs.end_transaction();

    let oldsz = pd.sz;

    // Allocate two pages at the next page boundary: an inaccessible stack
    // guard below one page of user stack.
    sz = pg_round_up(sz);
    let Some(sz1) = vm::uvmalloc_perm(kmem, pt, sz, sz + 2 * PGSIZE, PteFlags::R | PteFlags::W)
    else {
        return bad(root, sz, None);
    };
    sz = sz1;
    vm::uvmclear(pt, sz - 2 * PGSIZE);

    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    // Push argument strings, then the argv[] pointer array, all 16-byte
    // aligned.
    let mut ustack = [0u64; MAXARG + 1];
    let mut argc = 0usize;
    loop {
        let Ok(uarg) = fetchaddr(uargv + argc * mem::size_of::<usize>()) else {
            return bad(root, sz, None);
        };
        if uarg == 0 {
            break;
        }
        if argc >= MAXARG {
            return bad(root, sz, None);
        }

        let mut buf = [0u8; 128];
        let Ok(len) = fetchstr(uarg, &mut buf) else {
            return bad(root, sz, None);
        };

        sp -= len + 1;
        sp -= sp % 16; // riscv sp must be 16-byte aligned
        if sp < stackbase {
            return bad(root, sz, None);
        }
        if vm::copyout(kmem, pt, sp, &buf[..len + 1]).is_err() {
            return bad(root, sz, None);
        }
        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    // the argv pointer vector, NULL-terminated.
    let vec_bytes = (argc + 1) * mem::size_of::<u64>();
    sp -= vec_bytes;
    sp -= sp % 16;
    if sp < stackbase {
        return bad(root, sz, None);
    }
    let vec = unsafe { core::slice::from_raw_parts(ustack.as_ptr() as *const u8, vec_bytes) };
    if vm::copyout(kmem, pt, sp, vec).is_err() {
        return bad(root, sz, None);
    }

    let tf = unsafe { &mut *pd.trapframe };
    // argc goes to main via the syscall return value in a0; argv via a1.
    tf.a1 = sp as u64;

    // Save program name for debugging.
    let base = path
        .iter()
        .rposition(|&c| c == b'/')
        .map(|i| i + 1)
        .unwrap_or(0);
    pd.name = [0; 16];
    let n = (path.len() - base).min(15);
    pd.name[..n].copy_from_slice(&path[base..base + n]);

    // Commit to the user image.
    let old = pd.pagetable.replace(root);
    pd.sz = sz;
    tf.epc = elf.entry; // initial program counter = main
    tf.sp = sp as u64; // initial stack pointer
    if let Some(old) = old {
        proc_freepagetable(kmem, old);
    }

    Ok(argc)
}

// Failure path: undo the half-built image; the caller's address space is
// untouched.
fn bad(
    root: NonNull<PageTable>,
    _sz: usize,
    locked: Option<(InodeGuard<'static>, crate::fs::Iref)>,
) -> Result<usize, ()> {
    let fs = &kernel().fs;
    proc_freepagetable(&kernel().kmem, root);
    if let Some((g, ip)) = locked {
        fs.iunlockput(g, ip);
        fs.end_transaction();
    }
    Err(())
}

/// Load an ELF segment at virtual address va in pagetable; va must be
/// page-aligned and the pages from va to va+sz already mapped.
fn loadseg(
    pt: &mut PageTable,
    va: usize,
    g: &mut InodeGuard<'_>,
    offset: u32,
    sz: u32,
) -> Result<(), ()> {
    let fs = &kernel().fs;

    let mut i = 0u32;
    while i < sz {
        let pa = walkaddr(pt, va + i as usize).expect("loadseg: address should exist");
        let n = (sz - i).min(PGSIZE as u32);
        if fs.readi(g, false, pa, offset + i, n) != Ok(n) {
            return Err(());
        }
        i += n;
    }
    Ok(())
}

/// Physical address behind a user virtual address, for kernel-side writes
/// during segment loading.
fn walkaddr(pt: &PageTable, va: usize) -> Option<usize> {
    let pte = vm::walk_lookup(pt, crate::riscv::pg_round_down(va))?;
    let flags = pte.flags();
    if !flags.contains(PteFlags::V | PteFlags::U) {
        return None;
    }
    Some(pte.pa() + va % PGSIZE)
}
