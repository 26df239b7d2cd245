//! Sv39 page tables: walking, mapping, user address-space construction,
//! copy-on-write sharing, and user<->kernel copies.
//!
//! The risc-v Sv39 scheme has three levels of page-table pages. A page-table
//! page contains 512 64-bit PTEs. A 64-bit virtual address is split into
//! five fields:
//!   39..63 -- must be zero.
//!   30..38 -- 9 bits of level-2 index.
//!   21..29 -- 9 bits of level-1 index.
//!   12..20 -- 9 bits of level-0 index.
//!    0..11 -- 12 bits of byte offset within the page.

use core::ptr::{self, NonNull};

use crate::kalloc::Kmem;
use crate::printf;
use crate::riscv::{
    pg_round_down, pg_round_up, px, sfence_vma, PageTable, Pte, PteFlags, MAXVA, PGSIZE,
};

/// Return the leaf PTE in `pt` corresponding to virtual address va, without
/// creating anything.
pub fn walk_lookup(pt: &PageTable, va: usize) -> Option<&Pte> {
    if va >= MAXVA {
        panic!("walk_lookup");
    }

    let mut pt = pt;
    for level in (1..3).rev() {
        let pte = &pt.0[px(level, va)];
        if !pte.is_valid() {
            return None;
        }
        pt = unsafe { &*(pte.pa() as *const PageTable) };
    }
    Some(&pt.0[px(0, va)])
}

pub fn walk_lookup_mut(pt: &mut PageTable, va: usize) -> Option<&mut Pte> {
    if va >= MAXVA {
        panic!("walk_lookup");
    }

    let mut pt = pt;
    for level in (1..3).rev() {
        let pte = &mut pt.0[px(level, va)];
        if !pte.is_valid() {
            return None;
        }
        pt = unsafe { &mut *(pte.pa() as *mut PageTable) };
    }
    Some(&mut pt.0[px(0, va)])
}

/// Like `walk_lookup`, but allocates intermediate page-table pages as
/// needed. Returns None if an allocation fails.
fn walk_create<'a>(kmem: &Kmem, pt: &'a mut PageTable, va: usize) -> Option<&'a mut Pte> {
    if va >= MAXVA {
        panic!("walk_create");
    }

    let mut pt = pt;
    for level in (1..3).rev() {
        let pte = &mut pt.0[px(level, va)];
        if pte.is_valid() {
            pt = unsafe { &mut *(pte.pa() as *mut PageTable) };
        } else {
            let page = kmem.alloc_page()?; // comes back zeroed
            *pte = Pte::new(page.as_ptr() as usize, PteFlags::V);
            pt = unsafe { &mut *(page.as_ptr() as *mut PageTable) };
        }
    }
    Some(&mut pt.0[px(0, va)])
}

/// An empty top-level page table, or None if out of memory.
pub fn create_pagetable(kmem: &Kmem) -> Option<NonNull<PageTable>> {
    kmem.alloc_page().map(NonNull::cast)
}

/// Install a single va -> pa mapping. Both addresses must be page-aligned.
/// Remapping an existing valid PTE is a structural bug and panics.
pub fn map_page(
    kmem: &Kmem,
    pt: &mut PageTable,
    va: usize,
    pa: usize,
    perm: PteFlags,
) -> Result<(), ()> {
    if va % PGSIZE != 0 || pa % PGSIZE != 0 {
        return Err(());
    }

    let pte = walk_create(kmem, pt, va).ok_or(())?;
    if pte.is_valid() {
        panic!("map_page: remap");
    }
    *pte = Pte::new(pa, perm | PteFlags::V);
    Ok(())
}

/// Map a page-aligned range of `size` bytes starting at va to pa.
/// Strict about alignment; only Err on allocation failure.
pub fn map_region(
    kmem: &Kmem,
    pt: &mut PageTable,
    va: usize,
    pa: usize,
    size: usize,
    perm: PteFlags,
) -> Result<(), ()> {
    if va % PGSIZE != 0 {
        panic!("map_region: va not aligned");
    }
    if size == 0 {
        panic!("map_region: size");
    }

    let last = pg_round_down(va + size - 1);
    let mut a = va;
    let mut pa = pa;
    loop {
        let pte = walk_create(kmem, pt, a).ok_or(())?;
        if pte.is_valid() {
            panic!("map_region: remap");
        }
        *pte = Pte::new(pa, perm | PteFlags::V);
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Remove npages of mappings starting from va (which must be page-aligned);
/// missing pages are skipped. With `do_free` the frame's refcount is
/// dropped, which frees it once the last sharer unmaps (COW).
pub fn uvmunmap(kmem: &Kmem, pt: &mut PageTable, va: usize, npages: usize, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    for i in 0..npages {
        let a = va + i * PGSIZE;
        let Some(pte) = walk_lookup_mut(pt, a) else {
            continue;
        };
        if !pte.is_valid() {
            continue;
        }
        if do_free {
            kmem.free_page(pte.pa());
        }
        *pte = Pte::INVALID;
    }
}

/// Copy the parent's address space into a child page table for fork.
///
/// Pages are shared, not copied: each mapped frame's refcount is bumped and,
/// when the parent mapping was writable+user, both sides are downgraded to
/// read-only with the COW bit set. Read-only pages propagate unchanged.
/// On failure everything is rolled back, including the parent's COW marks
/// on frames whose refcount has returned to 1.
pub fn uvmcopy(kmem: &Kmem, old: &mut PageTable, new: &mut PageTable, sz: usize) -> Result<(), ()> {
    let npages = pg_round_up(sz) / PGSIZE;
    let mut mapped = 0;
    let mut failed = false;

    for i in 0..npages {
        let va = i * PGSIZE;
        let Some(pte) = walk_lookup_mut(old, va) else {
            failed = true;
            break;
        };
        if !pte.is_valid() {
            failed = true;
            break;
        }

        let pa = pte.pa();
        let flags = pte.flags();
        let cow_candidate = flags.contains(PteFlags::W | PteFlags::U);

        kmem.page_incref(pa);

        let new_flags = if cow_candidate {
            (flags - PteFlags::W) | PteFlags::COW
        } else {
            flags
        };

        let child_perm =
            new_flags & (PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U | PteFlags::COW);
        if map_page(kmem, new, va, pa, child_perm).is_err() {
            kmem.free_page(pa);
            failed = true;
            break;
        }

        if cow_candidate {
            // the parent loses write access too: next write faults and
            // resolves through cow_resolve.
            *walk_lookup_mut(old, va).unwrap() = Pte::new(pa, new_flags | PteFlags::V);
        }

        mapped += 1;
    }

    if !failed {
        sfence_vma();
        return Ok(());
    }

    // Roll back the child mappings made so far, then restore write access on
    // parent pages whose sharing we just undid.
    uvmunmap(kmem, new, 0, mapped, true);
    for i in 0..mapped {
        let va = i * PGSIZE;
        let Some(pte) = walk_lookup_mut(old, va) else {
            continue;
        };
        let flags = pte.flags();
        if !flags.contains(PteFlags::COW) {
            continue;
        }
        let pa = pte.pa();
        if kmem.page_refcount(pa) == 1 {
            *pte = Pte::new(pa, (flags - PteFlags::COW) | PteFlags::W);
        }
    }
    sfence_vma();
    Err(())
}

/// A write hit a COW page: give the faulting page table a private writable
/// copy. With the frame down to one reference the mapping just flips back
/// to exclusive ownership without copying.
pub fn cow_resolve(kmem: &Kmem, pt: &mut PageTable, faultva: usize) -> Result<(), ()> {
    let va0 = pg_round_down(faultva);
    let pte = walk_lookup_mut(pt, va0).ok_or(())?;
    let flags = pte.flags();
    if !flags.contains(PteFlags::V | PteFlags::U | PteFlags::COW) {
        return Err(());
    }

    let pa = pte.pa();
    let new_flags = (flags - PteFlags::COW) | PteFlags::W;

    if kmem.page_refcount(pa) == 1 {
        // sole owner; no copy needed.
        *pte = Pte::new(pa, new_flags);
        sfence_vma();
        return Ok(());
    }

    let mem = kmem.alloc_page().ok_or(())?;
    unsafe { ptr::copy_nonoverlapping(pa as *const u8, mem.as_ptr(), PGSIZE) };
    *pte = Pte::new(mem.as_ptr() as usize, new_flags);
    sfence_vma();
    kmem.free_page(pa);
    Ok(())
}

/// Grow a process's memory from oldsz to newsz with zeroed pages mapped
/// `perm` (PTE_U is implied). Returns the new size, or None on failure with
/// everything rolled back.
pub fn uvmalloc_perm(
    kmem: &Kmem,
    pt: &mut PageTable,
    oldsz: usize,
    newsz: usize,
    perm: PteFlags,
) -> Option<usize> {
    if newsz < oldsz {
        return Some(oldsz);
    }

    let start = pg_round_up(oldsz);
    let end = pg_round_up(newsz);
    let perm = perm | PteFlags::U;

    let mut a = start;
    while a < end {
        let Some(mem) = kmem.alloc_page() else {
            uvmdealloc(kmem, pt, a, oldsz);
            return None;
        };
        if map_page(kmem, pt, a, mem.as_ptr() as usize, perm).is_err() {
            kmem.free_page(mem.as_ptr() as usize);
            uvmdealloc(kmem, pt, a, oldsz);
            return None;
        }
        a += PGSIZE;
    }
    Some(newsz)
}

pub fn uvmalloc(kmem: &Kmem, pt: &mut PageTable, oldsz: usize, newsz: usize) -> Option<usize> {
    uvmalloc_perm(kmem, pt, oldsz, newsz, PteFlags::R | PteFlags::W | PteFlags::U)
}

/// Shrink a process's memory to newsz, freeing the pages past it.
pub fn uvmdealloc(kmem: &Kmem, pt: &mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let start = pg_round_up(newsz);
    let end = pg_round_up(oldsz);
    if end > start {
        uvmunmap(kmem, pt, start, (end - start) / PGSIZE, true);
    }
    newsz
}

/// Load the initial process image at address 0 for the very first process.
pub fn uvmfirst(kmem: &Kmem, pt: &mut PageTable, src: &[u8]) {
    if src.is_empty() {
        panic!("uvmfirst: empty init code");
    }

    let alloc_sz = pg_round_up(src.len());
    let mut off = 0;
    while off < alloc_sz {
        let mem = kmem.alloc_page().expect("uvmfirst: alloc_page");
        let pa = mem.as_ptr();
        if map_page(
            kmem,
            pt,
            off,
            pa as usize,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
        )
        .is_err()
        {
            panic!("uvmfirst: map_page");
        }
        let chunk = usize::min(src.len() - off, PGSIZE);
        unsafe { ptr::copy_nonoverlapping(src.as_ptr().add(off), pa, chunk) };
        off += PGSIZE;
    }
}

/// Mark a PTE invalid for user access; used for the stack guard page.
pub fn uvmclear(pt: &mut PageTable, va: usize) {
    let pte = walk_lookup_mut(pt, va).expect("uvmclear");
    *pte = Pte(pte.0 & !PteFlags::U.bits());
}

/// Copy from user to kernel: fill `dst` from virtual address srcva in pt.
/// Every touched page must be valid and user-accessible.
pub fn copyin(pt: &PageTable, dst: &mut [u8], srcva: usize) -> Result<(), ()> {
    let mut copied = 0;
    let mut srcva = srcva;
    while copied < dst.len() {
        let va0 = pg_round_down(srcva);
        let pte = walk_lookup(pt, va0).ok_or(())?;
        let flags = pte.flags();
        if !flags.contains(PteFlags::V | PteFlags::U) {
            return Err(());
        }

        let pa0 = pte.pa();
        let offset = srcva - va0;
        let n = usize::min(PGSIZE - offset, dst.len() - copied);
        unsafe {
            ptr::copy_nonoverlapping((pa0 + offset) as *const u8, dst.as_mut_ptr().add(copied), n)
        };
        copied += n;
        srcva += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user space into `dst`, at most
/// dst.len() bytes including the NUL. Returns the string length.
pub fn copyinstr(pt: &PageTable, dst: &mut [u8], mut srcva: usize) -> Result<usize, ()> {
    let max = dst.len();
    let mut copied = 0;
    while copied < max {
        let va0 = pg_round_down(srcva);
        let pte = walk_lookup(pt, va0).ok_or(())?;
        let flags = pte.flags();
        if !flags.contains(PteFlags::V | PteFlags::U) {
            return Err(());
        }

        let pa0 = pte.pa();
        let offset = srcva - va0;
        let n = usize::min(PGSIZE - offset, max - copied);
        for i in 0..n {
            let c = unsafe { *((pa0 + offset + i) as *const u8) };
            dst[copied + i] = c;
            if c == 0 {
                return Ok(copied + i);
            }
        }
        copied += n;
        srcva += n;
    }
    Err(()) // no NUL within max bytes
}

/// Copy from kernel to user: write `src` at virtual address dstva in pt.
/// Copy-on-write pages are resolved to private writable frames first, then
/// the write permission is re-checked.
pub fn copyout(kmem: &Kmem, pt: &mut PageTable, dstva: usize, src: &[u8]) -> Result<(), ()> {
    let mut copied = 0;
    let mut dstva = dstva;
    while copied < src.len() {
        let va0 = pg_round_down(dstva);
        {
            let pte = walk_lookup(pt, va0).ok_or(())?;
            let flags = pte.flags();
            if !flags.contains(PteFlags::V | PteFlags::U) {
                return Err(());
            }
            if flags.contains(PteFlags::COW) {
                cow_resolve(kmem, pt, va0)?;
            }
        }

        let pte = walk_lookup(pt, va0).ok_or(())?;
        let flags = pte.flags();
        if !flags.contains(PteFlags::V | PteFlags::U | PteFlags::W) {
            return Err(());
        }

        let pa0 = pte.pa();
        let offset = dstva - va0;
        let n = usize::min(PGSIZE - offset, src.len() - copied);
        unsafe { ptr::copy_nonoverlapping(src.as_ptr().add(copied), (pa0 + offset) as *mut u8, n) };
        copied += n;
        dstva += n;
    }
    Ok(())
}

/// Tear down an entire page table: drop every leaf frame's refcount, then
/// recursively free the page-table pages themselves.
pub fn destroy_pagetable(kmem: &Kmem, pt: NonNull<PageTable>) {
    unsafe {
        free_leaves(kmem, pt.as_ptr(), 2);
        freewalk(kmem, pt.as_ptr());
    }
}

unsafe fn free_leaves(kmem: &Kmem, pt: *mut PageTable, level: usize) {
    for pte in (*pt).0.iter_mut() {
        if pte.is_leaf() {
            kmem.free_page(pte.pa());
            *pte = Pte::INVALID;
        } else if pte.is_valid() && level > 0 {
            free_leaves(kmem, pte.pa() as *mut PageTable, level - 1);
        }
    }
}

// Recursively free page-table pages.
// All leaf mappings must already have been removed.
unsafe fn freewalk(kmem: &Kmem, pt: *mut PageTable) {
    for pte in (*pt).0.iter_mut() {
        if pte.is_valid() && !pte.is_leaf() {
            freewalk(kmem, pte.pa() as *mut PageTable);
            *pte = Pte::INVALID;
        } else if pte.is_valid() {
            panic!("freewalk: leaf");
        }
    }
    kmem.free_page(pt as usize);
}

/// Print the page-table tree for diagnostics.
pub fn dump_pagetable(pt: &PageTable) {
    printf!("page table at {:p}\n", pt as *const PageTable);
    dump_level(pt, 2, 0);
}

fn dump_level(pt: &PageTable, level: usize, va_base: usize) {
    for (i, pte) in pt.0.iter().enumerate() {
        if !pte.is_valid() {
            continue;
        }
        let va = va_base + (i << (12 + 9 * level));
        for _ in level..2 {
            printf!("  ");
        }
        if pte.is_leaf() {
            printf!("[{:3}] va {:#x} -> pa {:#x} {:?}\n", i, va, pte.pa(), pte.flags());
        } else {
            printf!("[{:3}] table at {:#x}\n", i, pte.pa());
            if level > 0 {
                dump_level(unsafe { &*(pte.pa() as *const PageTable) }, level - 1, va);
            }
        }
    }
}

// The kernel's own page table: a direct map of RAM and the MMIO devices,
// plus the trampoline and per-process kernel stacks near the top of the
// address space. Only meaningful on bare metal.
#[cfg(target_arch = "riscv64")]
mod kvm {
    use super::*;
    use crate::memlayout::{KERNBASE, PHYSTOP, TRAMPOLINE, UART0, VIRTIO0};
    use crate::riscv::{make_satp, w_satp};
    use core::sync::atomic::{AtomicUsize, Ordering};

    extern "C" {
        static etext: u8; // kernel.ld sets this to end of kernel code.
        static trampoline: u8; // trampoline.S
    }

    static KERNEL_PAGETABLE: AtomicUsize = AtomicUsize::new(0);

    // add a mapping to the kernel page table.
    // only used when booting; does not flush TLB or enable paging.
    fn kvmmap(kmem: &Kmem, pt: &mut PageTable, va: usize, pa: usize, sz: usize, perm: PteFlags) {
        if map_region(kmem, pt, va, pa, sz, perm).is_err() {
            panic!("kvmmap");
        }
    }

    // Make a direct-map page table for the kernel.
    pub fn kvminit(kmem: &Kmem) {
        let root = create_pagetable(kmem).expect("kvminit: no memory for root page table");
        let pt = unsafe { &mut *root.as_ptr() };

        // uart registers
        kvmmap(kmem, pt, UART0, UART0, PGSIZE, PteFlags::R | PteFlags::W);

        // virtio mmio disk interface
        kvmmap(kmem, pt, VIRTIO0, VIRTIO0, PGSIZE, PteFlags::R | PteFlags::W);

        let etext_addr = unsafe { &etext as *const u8 as usize };

        // map kernel text executable and read-only.
        kvmmap(
            kmem,
            pt,
            KERNBASE,
            KERNBASE,
            etext_addr - KERNBASE,
            PteFlags::R | PteFlags::X,
        );

        // map kernel data and the physical RAM we'll make use of.
        kvmmap(
            kmem,
            pt,
            etext_addr,
            etext_addr,
            PHYSTOP - etext_addr,
            PteFlags::R | PteFlags::W,
        );

        // map the trampoline for trap entry/exit to
        // the highest virtual address in the kernel.
        let tramp = unsafe { &trampoline as *const u8 as usize };
        kvmmap(kmem, pt, TRAMPOLINE, tramp, PGSIZE, PteFlags::R | PteFlags::X);

        // allocate and map a kernel stack for each process.
        crate::proc::proc_mapstacks(kmem, pt);

        KERNEL_PAGETABLE.store(root.as_ptr() as usize, Ordering::Release);
    }

    // Switch the hardware page table register to the kernel's page table,
    // and enable paging.
    pub fn kvminithart() {
        // wait for any previous writes to the page table memory to finish.
        sfence_vma();
        w_satp(make_satp(KERNEL_PAGETABLE.load(Ordering::Acquire)));
        // flush stale entries from the TLB.
        sfence_vma();
    }
}

#[cfg(target_arch = "riscv64")]
pub use kvm::{kvminit, kvminithart};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_kmem;

    fn user_pt(kmem: &Kmem) -> NonNull<PageTable> {
        create_pagetable(kmem).unwrap()
    }

    #[test]
    fn map_and_lookup() {
        let (km, _) = test_kmem(64);
        let mut pt = user_pt(km);
        let pt = unsafe { pt.as_mut() };

        let frame = km.alloc_page().unwrap().as_ptr() as usize;
        map_page(km, pt, 0x4000, frame, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

        let pte = walk_lookup(pt, 0x4000).unwrap();
        assert_eq!(pte.pa(), frame);
        assert!(pte.flags().contains(PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U));
        assert!(walk_lookup(pt, 0x5000).is_none());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let (km, _) = test_kmem(64);
        let mut pt = user_pt(km);
        let pt = unsafe { pt.as_mut() };
        let frame = km.alloc_page().unwrap().as_ptr() as usize;
        map_page(km, pt, 0, frame, PteFlags::R | PteFlags::U).unwrap();
        map_page(km, pt, 0, frame, PteFlags::R | PteFlags::U).unwrap();
    }

    #[test]
    fn alloc_copy_roundtrip() {
        let (km, _) = test_kmem(64);
        let mut pt = user_pt(km);
        let pt = unsafe { pt.as_mut() };

        let sz = uvmalloc(km, pt, 0, 3 * PGSIZE).unwrap();
        assert_eq!(sz, 3 * PGSIZE);

        let msg = b"hello, address space";
        copyout(km, pt, PGSIZE + 100, msg).unwrap();
        let mut back = [0u8; 20];
        copyin(pt, &mut back, PGSIZE + 100).unwrap();
        assert_eq!(&back, msg);

        // shrink: the last page goes away
        let sz = uvmdealloc(km, pt, sz, 2 * PGSIZE);
        assert_eq!(sz, 2 * PGSIZE);
        assert!(copyin(pt, &mut back, 2 * PGSIZE).is_err());
    }

    #[test]
    fn copyinstr_stops_at_nul() {
        let (km, _) = test_kmem(64);
        let mut pt = user_pt(km);
        let pt = unsafe { pt.as_mut() };
        uvmalloc(km, pt, 0, PGSIZE).unwrap();

        copyout(km, pt, 0, b"ab\0junk").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(copyinstr(pt, &mut buf, 0), Ok(2));
        assert_eq!(&buf[..3], b"ab\0");

        // unterminated string longer than the buffer fails
        copyout(km, pt, 0, &[b'x'; 32]).unwrap();
        let mut small = [0u8; 8];
        assert!(copyinstr(pt, &mut small, 0).is_err());
    }

    #[test]
    fn cow_fork_shares_then_copies() {
        let (km, _) = test_kmem(128);
        let mut parent = user_pt(km);
        let parent = unsafe { parent.as_mut() };
        let mut child = user_pt(km);
        let child = unsafe { child.as_mut() };

        let sz = 4 * PGSIZE;
        uvmalloc(km, parent, 0, sz).unwrap();
        let fill = [b'A'; 4 * PGSIZE];
        copyout(km, parent, 0, &fill).unwrap();

        uvmcopy(km, parent, child, sz).unwrap();

        // both sides read the original contents; both PTEs are COW, not W.
        for pt in [&*parent, &*child] {
            let mut b = [0u8; 1];
            copyin(pt, &mut b, 2 * PGSIZE + 7).unwrap();
            assert_eq!(b[0], b'A');
            let f = walk_lookup(pt, 0).unwrap().flags();
            assert!(f.contains(PteFlags::COW));
            assert!(!f.contains(PteFlags::W));
        }
        let shared_pa = walk_lookup(parent, 0).unwrap().pa();
        assert_eq!(walk_lookup(child, 0).unwrap().pa(), shared_pa);
        assert_eq!(km.page_refcount(shared_pa), 2);

        // child writes each page; parent must still see 'A' everywhere.
        for page in 0..4 {
            copyout(km, child, page * PGSIZE, &[b'0' + page as u8]).unwrap();
        }
        let mut b = [0u8; 1];
        for page in 0..4 {
            copyin(parent, &mut b, page * PGSIZE).unwrap();
            assert_eq!(b[0], b'A');
            copyin(child, &mut b, page * PGSIZE).unwrap();
            assert_eq!(b[0], b'0' + page as u8);
        }

        // child now owns private frames
        assert_ne!(walk_lookup(child, 0).unwrap().pa(), shared_pa);
        assert_eq!(km.page_refcount(shared_pa), 1);

        // parent write flips its sole-owner page back to writable in place.
        copyout(km, parent, 0, &[b'P']).unwrap();
        assert_eq!(walk_lookup(parent, 0).unwrap().pa(), shared_pa);
        assert!(walk_lookup(parent, 0)
            .unwrap()
            .flags()
            .contains(PteFlags::W));
    }

    #[test]
    fn shared_page_freed_exactly_once() {
        let (km, _) = test_kmem(64);
        let before = km.stats().free;

        let mut parent = user_pt(km);
        let parent = unsafe { parent.as_mut() };
        let mut child = user_pt(km);
        let child = unsafe { child.as_mut() };

        uvmalloc(km, parent, 0, 2 * PGSIZE).unwrap();
        uvmcopy(km, parent, child, 2 * PGSIZE).unwrap();

        uvmunmap(km, child, 0, 2, true);
        uvmunmap(km, parent, 0, 2, true);

        destroy_pagetable(km, NonNull::from(&mut *parent));
        destroy_pagetable(km, NonNull::from(&mut *child));
        assert_eq!(km.stats().free, before);
    }

    #[test]
    fn destroy_reclaims_everything() {
        let (km, _) = test_kmem(64);
        let before = km.stats().free;

        let mut pt = user_pt(km);
        uvmalloc(km, unsafe { pt.as_mut() }, 0, 5 * PGSIZE).unwrap();
        destroy_pagetable(km, pt);

        assert_eq!(km.stats().free, before);
    }

    #[test]
    fn uvmclear_drops_user_bit() {
        let (km, _) = test_kmem(64);
        let mut pt = user_pt(km);
        let pt = unsafe { pt.as_mut() };
        uvmalloc(km, pt, 0, 2 * PGSIZE).unwrap();
        uvmclear(pt, 0);
        assert!(!walk_lookup(pt, 0).unwrap().flags().contains(PteFlags::U));
        // copyin through the guard page must now fail
        let mut b = [0u8; 1];
        assert!(copyin(pt, &mut b, 0).is_err());
    }
}
