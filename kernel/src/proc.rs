//! Processes: the process table, context switching, scheduling,
//! sleep/wakeup, and the fork/exit/wait lifecycle.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::file::{FileKind, FileRef};
use crate::fs::Iref;
use crate::kalloc::Kmem;
use crate::kernel;
use crate::memlayout::{kstack, TRAPFRAME};
use crate::param::{NOFILE, NPROC};
use crate::riscv::{intr_get, r_tp, PageTable, PteFlags, PGSIZE};
use crate::spinlock::{pop_off, push_off, SpinLock, SpinLockGuard};
use crate::vm;

/// Saved registers for kernel context switches.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    s0: usize,
    s1: usize,
    s2: usize,
    s3: usize,
    s4: usize,
    s5: usize,
    s6: usize,
    s7: usize,
    s8: usize,
    s9: usize,
    s10: usize,
    s11: usize,
}

impl Context {
    pub const fn zero() -> Context {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Save the current callee-saved registers in old and load them from new;
// switching stacks switches threads of control. In switch.S.
#[cfg(target_arch = "riscv64")]
extern "C" {
    fn swtch(old: *mut Context, new: *const Context);
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(clippy::missing_safety_doc)]
unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unreachable!("swtch without a hart");
}

/// Per-process data for the trap handling code in trampoline.S.
///
/// Sits in a page by itself just under the trampoline page in the user page
/// table; mapped at the same physical page in kernel space. uservec saves
/// user registers here, then initializes sp and satp from the kernel_*
/// fields and jumps to the kernel_trap entry; usertrapret()/userret do the
/// reverse. The callee-saved user registers are included because the
/// return-to-user path does not go back through the kernel call stack.
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub ra: u64,
    /*  40 */ pub sp: u64,
    /*  48 */ pub gp: u64,
    /*  56 */ pub tp: u64,
    /*  64 */ pub t0: u64,
    /*  72 */ pub t1: u64,
    /*  80 */ pub t2: u64,
    /*  88 */ pub s0: u64,
    /*  96 */ pub s1: u64,
    /* 104 */ pub a0: u64,
    /* 112 */ pub a1: u64,
    /* 120 */ pub a2: u64,
    /* 128 */ pub a3: u64,
    /* 136 */ pub a4: u64,
    /* 144 */ pub a5: u64,
    /* 152 */ pub a6: u64,
    /* 160 */ pub a7: u64,
    /* 168 */ pub s2: u64,
    /* 176 */ pub s3: u64,
    /* 184 */ pub s4: u64,
    /* 192 */ pub s5: u64,
    /* 200 */ pub s6: u64,
    /* 208 */ pub s7: u64,
    /* 216 */ pub s8: u64,
    /* 224 */ pub s9: u64,
    /* 232 */ pub s10: u64,
    /* 240 */ pub s11: u64,
    /* 248 */ pub t3: u64,
    /* 256 */ pub t4: u64,
    /* 264 */ pub t5: u64,
    /* 272 */ pub t6: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Process-table fields guarded by the per-process spin lock.
pub struct ProcInner {
    pub state: ProcState,
    pub chan: usize, // if non-zero, sleeping on chan
    pub killed: bool,
    pub xstate: i32, // exit status for the parent's wait
    pub pid: i32,
}

/// Fields private to the process (or protected by wait_lock, for parent),
/// so the process lock need not be held to use them.
pub struct ProcData {
    pub kstack: usize, // bottom of the kernel stack
    pub sz: usize,     // size of user memory (bytes)
    pub pagetable: Option<NonNull<PageTable>>,
    pub trapframe: *mut Trapframe,
    pub context: Context,
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<Iref>,
    pub parent: Option<usize>, // slot index; wait_lock guards this
    pub priority: i32,
    pub name: [u8; 16],
}

pub struct Proc {
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const INIT: Proc = Proc {
        inner: SpinLock::new(
            "proc",
            ProcInner {
                state: ProcState::Unused,
                chan: 0,
                killed: false,
                xstate: 0,
                pid: 0,
            },
        ),
        data: UnsafeCell::new(ProcData {
            kstack: 0,
            sz: 0,
            pagetable: None,
            trapframe: core::ptr::null_mut(),
            context: Context::zero(),
            ofile: [None; NOFILE],
            cwd: None,
            parent: None,
            priority: 0,
            name: [0; 16],
        }),
    };

    /// The single-hart discipline makes this sound: only the process
    /// itself (or its parent under wait_lock) touches ProcData.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    pub fn pid(&self) -> i32 {
        self.inner.lock().pid
    }
}

/// Per-CPU state. Single hart, so there is exactly one.
pub struct Cpu {
    proc_idx: AtomicUsize, // slot index + 1 of the running process, 0 = none
    pub noff: AtomicI32,   // depth of push_off() nesting
    pub intena: AtomicBool, // were interrupts enabled before push_off()?
    context: UnsafeCell<Context>, // swtch() here to enter scheduler()
}

unsafe impl Sync for Cpu {}

static CPU0: Cpu = Cpu {
    proc_idx: AtomicUsize::new(0),
    noff: AtomicI32::new(0),
    intena: AtomicBool::new(false),
    context: UnsafeCell::new(Context::zero()),
};

// Must be called with interrupts disabled to prevent races with a process
// being moved to another CPU (moot on one hart, kept for discipline).
pub fn cpuid() -> usize {
    r_tp()
}

pub fn mycpu() -> &'static Cpu {
    &CPU0
}

static PROC: [Proc; NPROC] = [Proc::INIT; NPROC];

// Helps ensure that wakeups of wait()ing parents are not lost; guards
// parent pointers. Must be acquired before any process lock.
static WAIT_LOCK: SpinLock<()> = SpinLock::new("wait_lock", ());

static NEXT_PID: SpinLock<i32> = SpinLock::new("nextpid", 1);

// Where the scheduler resumes its scan; advancing it gives round-robin
// fairness.
static NEXT_SCHED: AtomicUsize = AtomicUsize::new(0);

static INIT_PROC: AtomicUsize = AtomicUsize::new(0); // slot + 1

/// The currently running process on this CPU, if any.
pub fn myproc() -> Option<&'static Proc> {
    push_off();
    let i = mycpu().proc_idx.load(Ordering::Relaxed);
    pop_off();
    if i == 0 {
        None
    } else {
        Some(&PROC[i - 1])
    }
}

pub fn mypid() -> Option<i32> {
    myproc().map(|p| p.inner.lock().pid)
}

pub fn current_cwd() -> Option<Iref> {
    myproc().and_then(|p| unsafe { p.data().cwd })
}

fn proc_index(p: &Proc) -> usize {
    (p as *const Proc as usize - PROC.as_ptr() as usize) / core::mem::size_of::<Proc>()
}

/// PIDs grow monotonically and wrap; a candidate already carried by a live
/// slot is skipped.
fn allocpid() -> i32 {
    loop {
        let pid = {
            let mut next = NEXT_PID.lock();
            let pid = *next;
            *next = if pid == i32::MAX { 1 } else { pid + 1 };
            pid
        };
        let in_use = PROC.iter().any(|p| {
            let inner = p.inner.lock();
            inner.state != ProcState::Unused && inner.pid == pid
        });
        if !in_use {
            return pid;
        }
    }
}

/// initialize the proc table: record each slot's kernel stack address.
pub fn procinit() {
    for (i, p) in PROC.iter().enumerate() {
        unsafe { p.data().kstack = kstack(i) };
    }
}

/// Allocate a page for each process's kernel stack and map it high in
/// kernel memory, leaving an unmapped guard page below each.
#[cfg(target_arch = "riscv64")]
pub fn proc_mapstacks(kmem: &Kmem, kpgtbl: &mut PageTable) {
    for i in 0..NPROC {
        let pa = kmem.alloc_page().expect("proc_mapstacks: kalloc");
        vm::map_page(
            kmem,
            kpgtbl,
            kstack(i),
            pa.as_ptr() as usize,
            PteFlags::R | PteFlags::W,
        )
        .expect("proc_mapstacks: map");
    }
}

/// Create a user page table for the given process, with no user memory but
/// with the trampoline and trapframe pages at the top.
pub fn proc_pagetable(kmem: &Kmem, trapframe: *mut Trapframe) -> Option<NonNull<PageTable>> {
    let root = vm::create_pagetable(kmem)?;
    let pt = unsafe { &mut *root.as_ptr() };

    // the trampoline is for supervisor-mode trap entry/exit on the way
    // to/from user space, so not PTE_U.
    #[cfg(target_arch = "riscv64")]
    {
        extern "C" {
            static trampoline: u8;
        }
        let tramp = unsafe { &trampoline as *const u8 as usize };
        if vm::map_page(
            kmem,
            pt,
            crate::memlayout::TRAMPOLINE,
            tramp,
            PteFlags::R | PteFlags::X,
        )
        .is_err()
        {
            vm::destroy_pagetable(kmem, root);
            return None;
        }
    }

    // the trapframe page, just below the trampoline.
    if vm::map_page(kmem, pt, TRAPFRAME, trapframe as usize, PteFlags::R | PteFlags::W).is_err() {
        vm::destroy_pagetable(kmem, root);
        return None;
    }

    Some(root)
}

/// Free a process's page table and the user memory it maps. The
/// trampoline and trapframe mappings are removed first (without freeing:
/// the trampoline is shared and the trapframe page is freed separately).
pub fn proc_freepagetable(kmem: &Kmem, pt: NonNull<PageTable>) {
    let r = unsafe { &mut *pt.as_ptr() };
    #[cfg(target_arch = "riscv64")]
    vm::uvmunmap(kmem, r, crate::memlayout::TRAMPOLINE, 1, false);
    vm::uvmunmap(kmem, r, TRAPFRAME, 1, false);
    vm::destroy_pagetable(kmem, pt);
}

/// Find an UNUSED slot and initialize it to run in the kernel: pid,
/// trapframe page, empty user page table, and a context that returns to
/// forkret on first switch. None if out of slots or memory.
fn allocproc() -> Option<usize> {
    let kmem = &kernel().kmem;

    let mut idx = None;
    for (i, p) in PROC.iter().enumerate() {
        let mut inner = p.inner.lock();
        if inner.state == ProcState::Unused {
            inner.state = ProcState::Used;
            inner.pid = 0;
            idx = Some(i);
            break;
        }
    }
    let i = idx?;
    let p = &PROC[i];
    let pd = unsafe { p.data() };

    let pid = allocpid();
    p.inner.lock().pid = pid;

    // Trapframe page.
    let Some(tf) = kmem.alloc_page() else {
        freeproc(i);
        return None;
    };
    pd.trapframe = tf.as_ptr() as *mut Trapframe;

    // An empty user page table.
    let Some(pt) = proc_pagetable(kmem, pd.trapframe) else {
        freeproc(i);
        return None;
    };
    pd.pagetable = Some(pt);

    // Start executing at forkret, which returns to user space.
    pd.context = Context::zero();
    pd.context.ra = forkret as usize;
    pd.context.sp = pd.kstack + PGSIZE;

    Some(i)
}

/// Release a slot and everything hanging off it. Open files and cwd are
/// normally gone already (exit closed them); this also covers the
/// allocation-failure paths.
fn freeproc(i: usize) {
    let kmem = &kernel().kmem;
    let p = &PROC[i];
    let pd = unsafe { p.data() };

    for fd in 0..NOFILE {
        if let Some(f) = pd.ofile[fd].take() {
            kernel().ftable.close(f, &kernel().fs);
        }
    }
    if let Some(cwd) = pd.cwd.take() {
        kernel().fs.begin_transaction();
        kernel().fs.iput(cwd);
        kernel().fs.end_transaction();
    }

    if !pd.trapframe.is_null() {
        kmem.free_page(pd.trapframe as usize);
        pd.trapframe = core::ptr::null_mut();
    }
    if let Some(pt) = pd.pagetable.take() {
        proc_freepagetable(kmem, pt);
    }

    pd.sz = 0;
    pd.parent = None;
    pd.name = [0; 16];
    pd.priority = 0;

    let mut inner = p.inner.lock();
    inner.pid = 0;
    inner.chan = 0;
    inner.killed = false;
    inner.xstate = 0;
    inner.state = ProcState::Unused;
}

// A user program that calls exec("/init"); od -t xC initcode
// (the xv6 initcode with this kernel's syscall numbers: exec=16, exit=0).
static INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, // auipc/addi a0, init
    0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02, // auipc/addi a1, argv
    0x93, 0x08, 0x00, 0x01, 0x73, 0x00, 0x00, 0x00, // li a7, 16; ecall
    0x93, 0x08, 0x00, 0x00, 0x73, 0x00, 0x00, 0x00, // li a7, 0; ecall
    0xef, 0xf0, 0x9f, 0xff, // jal loop
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, // "/init\0", pad
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv
];

/// Set up the first user process: one page of initcode and the three
/// console file descriptors.
pub fn userinit() {
    use crate::file::CONSOLE;

    let i = allocproc().expect("userinit: allocproc");
    INIT_PROC.store(i + 1, Ordering::Relaxed);
    let p = &PROC[i];
    let pd = unsafe { p.data() };

    // one user page holding initcode's instructions and data.
    let kmem = &kernel().kmem;
    vm::uvmfirst(kmem, unsafe { pd.pagetable.unwrap().as_mut() }, &INITCODE);
    pd.sz = PGSIZE;

    // the very first "return" from kernel to user.
    let tf = unsafe { &mut *pd.trapframe };
    tf.epc = 0; // user program counter
    tf.sp = PGSIZE as u64; // user stack pointer

    // stdin read-only, stdout/stderr write-only, all on the console.
    let ft = &kernel().ftable;
    let cons = FileKind::Device {
        major: CONSOLE as i16,
        ip: None,
    };
    pd.ofile[0] = Some(ft.alloc(cons, true, false).expect("userinit: filealloc"));
    pd.ofile[1] = Some(ft.alloc(cons, false, true).expect("userinit: filealloc"));
    pd.ofile[2] = Some(ft.alloc(cons, false, true).expect("userinit: filealloc"));

    pd.cwd = Some(kernel().fs.iget(kernel().fs.dev(), crate::fs::ROOTINO));
    pd.name[..8].copy_from_slice(b"initcode");

    p.inner.lock().state = ProcState::Runnable;
}

/// Grow or shrink user memory by n bytes (sbrk). Returns the old size.
pub fn grow(n: i32) -> Result<usize, ()> {
    let p = myproc().ok_or(())?;
    let pd = unsafe { p.data() };
    let kmem = &kernel().kmem;
    let pt = unsafe { pd.pagetable.ok_or(())?.as_mut() };

    let oldsz = pd.sz;
    if n > 0 {
        let newsz = oldsz.checked_add(n as usize).ok_or(())?;
        pd.sz = vm::uvmalloc(kmem, pt, oldsz, newsz).ok_or(())?;
    } else if n < 0 {
        let target = oldsz.saturating_sub((-(n as i64)) as usize);
        pd.sz = vm::uvmdealloc(kmem, pt, oldsz, target);
    }
    Ok(oldsz)
}

/// Create a new process copying the caller's address space with
/// copy-on-write sharing. Returns the child's pid, or -1.
pub fn fork() -> i32 {
    let Some(p) = myproc() else {
        return -1;
    };
    let pd = unsafe { p.data() };

    let Some(ci) = allocproc() else {
        return -1;
    };
    let np = &PROC[ci];
    let nd = unsafe { np.data() };

    // Share the parent's memory, write-protected on both sides.
    let kmem = &kernel().kmem;
    let old_pt = unsafe { pd.pagetable.unwrap().as_mut() };
    let new_pt = unsafe { nd.pagetable.unwrap().as_mut() };
    if vm::uvmcopy(kmem, old_pt, new_pt, pd.sz).is_err() {
        freeproc(ci);
        return -1;
    }
    nd.sz = pd.sz;

    // the child resumes exactly where the parent trapped, but sees 0.
    unsafe {
        core::ptr::copy_nonoverlapping(pd.trapframe, nd.trapframe, 1);
        (*nd.trapframe).a0 = 0;
    }

    for fd in 0..NOFILE {
        nd.ofile[fd] = pd.ofile[fd].map(|f| kernel().ftable.dup(f));
    }
    nd.cwd = pd.cwd.map(|ip| kernel().fs.idup(ip));
    nd.name = pd.name;
    nd.priority = pd.priority;

    let pid = np.inner.lock().pid;

    {
        let _w = WAIT_LOCK.lock();
        nd.parent = Some(proc_index(p));
    }

    np.inner.lock().state = ProcState::Runnable;

    pid
}

/// Pass abandoned children to init.
fn reparent(parent_idx: usize) {
    let init = INIT_PROC.load(Ordering::Relaxed);
    for pp in PROC.iter() {
        let pd = unsafe { pp.data() };
        if pd.parent == Some(parent_idx) {
            pd.parent = if init == 0 { None } else { Some(init - 1) };
            if init != 0 {
                wakeup(&PROC[init - 1] as *const Proc as usize);
            }
        }
    }
}

/// Exit the current process with the given status; does not return. The
/// process stays a zombie until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let p = myproc().expect("exit: no process");
    if INIT_PROC.load(Ordering::Relaxed) == proc_index(p) + 1 {
        panic!("init exiting");
    }
    let pd = unsafe { p.data() };

    for fd in 0..NOFILE {
        if let Some(f) = pd.ofile[fd].take() {
            kernel().ftable.close(f, &kernel().fs);
        }
    }

    if let Some(cwd) = pd.cwd.take() {
        kernel().fs.begin_transaction();
        kernel().fs.iput(cwd);
        kernel().fs.end_transaction();
    }

    let w = WAIT_LOCK.lock();
    reparent(proc_index(p));
    if let Some(parent) = pd.parent {
        wakeup(&PROC[parent] as *const Proc as usize);
    }
    {
        let mut inner = p.inner.lock();
        inner.xstate = status;
        inner.state = ProcState::Zombie;
    }
    drop(w);

    // jump into the scheduler, never to return.
    push_off();
    sched();
    panic!("zombie exit");
}

/// Wait for a child to exit; returns its pid and stores the exit status at
/// user address `addr` when non-zero. -1 when there are no children or
/// the caller is killed.
pub fn wait(addr: usize) -> i32 {
    let p = myproc().expect("wait: no process");
    let me = proc_index(p);

    let mut w = WAIT_LOCK.lock();
    loop {
        let mut havekids = false;
        for (i, pp) in PROC.iter().enumerate() {
            if unsafe { pp.data().parent } != Some(me) {
                continue;
            }
            havekids = true;

            let inner = pp.inner.lock();
            if inner.state == ProcState::Zombie {
                let pid = inner.pid;
                let xstate = inner.xstate;
                drop(inner);

                if addr != 0 {
                    let bytes = xstate.to_le_bytes();
                    let pd = unsafe { p.data() };
                    let pt = unsafe { pd.pagetable.unwrap().as_mut() };
                    if vm::copyout(&kernel().kmem, pt, addr, &bytes).is_err() {
                        return -1;
                    }
                }
                drop(w);
                freeproc(i);
                return pid;
            }
        }

        if !havekids || p.inner.lock().killed {
            return -1;
        }

        // wait for a child to exit; exit() wakes our slot address.
        w = sleep(p as *const Proc as usize, w);
    }
}

/// Per-CPU scheduler loop. Never returns: picks the next RUNNABLE process
/// round-robin from a rotating start index and switches to it; idles in
/// wfi when nothing is runnable.
pub fn scheduler() -> ! {
    let c = mycpu();
    loop {
        // interrupts stay off while we hold process state; opening this
        // window avoids deadlock when every process is waiting.
        crate::riscv::intr_on();
        crate::riscv::intr_off();

        let start = NEXT_SCHED.load(Ordering::Relaxed);
        let mut found = false;
        for k in 0..NPROC {
            let i = (start + k) % NPROC;
            let p = &PROC[i];
            let mut inner = p.inner.lock();
            if inner.state != ProcState::Runnable {
                continue;
            }

            // Switch to the chosen process. It is the process's job to
            // give the CPU back before coming around again.
            inner.state = ProcState::Running;
            drop(inner);
            c.proc_idx.store(i + 1, Ordering::Relaxed);
            NEXT_SCHED.store((i + 1) % NPROC, Ordering::Relaxed);

            unsafe {
                let pd = p.data();
                swtch(c.context.get(), &pd.context);
            }

            // the process is done for now.
            c.proc_idx.store(0, Ordering::Relaxed);
            found = true;
            break;
        }

        if !found {
            crate::riscv::intr_on();
            crate::riscv::wfi();
        }
    }
}

/// Switch back to the scheduler context. The caller must have set the
/// process state away from Running and disabled interrupts (push_off).
pub fn sched() {
    let p = myproc().expect("sched: no process");
    if intr_get() {
        panic!("sched interruptible");
    }
    if p.inner.lock().state == ProcState::Running {
        panic!("sched running");
    }

    let c = mycpu();
    let intena = c.intena.load(Ordering::Relaxed);
    unsafe { swtch(&mut p.data().context, c.context.get()) };
    mycpu().intena.store(intena, Ordering::Relaxed);
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    let Some(p) = myproc() else {
        return;
    };
    push_off();
    p.inner.lock().state = ProcState::Runnable;
    sched();
    pop_off();
}

/// A fork child's very first scheduling by scheduler() switches here.
extern "C" fn forkret() {
    // file-system initialization already ran in main (the disk driver is
    // polled, so it needs no process context).
    #[cfg(target_arch = "riscv64")]
    crate::trap::usertrapret();
}

/// Atomically release `guard` and sleep on chan; reacquires the lock on
/// wakeup. Without a process context (boot, host tests) this degrades to
/// release-spin-retry.
pub fn sleep<'a, T>(chan: usize, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let lk = guard.spinlock();

    let Some(p) = myproc() else {
        drop(guard);
        core::hint::spin_loop();
        return lk.lock();
    };

    // Record the wait channel before giving up the condition lock, so a
    // wakeup between the release and the context switch just makes us
    // RUNNABLE again instead of getting lost.
    {
        let mut inner = p.inner.lock();
        inner.chan = chan;
        inner.state = ProcState::Sleeping;
    }
    drop(guard);

    push_off();
    sched();
    pop_off();

    // Reacquire the condition lock before clearing the channel.
    let g = lk.lock();
    p.inner.lock().chan = 0;
    g
}

/// Wake up all processes sleeping on chan.
pub fn wakeup(chan: usize) {
    for p in PROC.iter() {
        if let Some(me) = myproc() {
            if core::ptr::eq(me, p) {
                continue;
            }
        }
        let mut inner = p.inner.lock();
        if inner.state == ProcState::Sleeping && inner.chan == chan {
            inner.state = ProcState::Runnable;
        }
    }
}

/// Flag the process with the given pid as killed; a sleeping victim is
/// made runnable so it can notice on the way out of the kernel.
pub fn kill(pid: i32) -> i32 {
    for p in PROC.iter() {
        let mut inner = p.inner.lock();
        if inner.state != ProcState::Unused && inner.pid == pid {
            inner.killed = true;
            if inner.state == ProcState::Sleeping {
                inner.state = ProcState::Runnable;
            }
            return 0;
        }
    }
    -1
}

pub fn killed(p: &Proc) -> bool {
    p.inner.lock().killed
}

pub fn setkilled(p: &Proc) {
    p.inner.lock().killed = true;
}

// Copy to either a user address or a kernel address, depending on
// user_dst; the file system uses this to serve both syscall buffers and
// in-kernel structures.
pub fn either_copyout(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), ()> {
    if user_dst {
        let p = myproc().ok_or(())?;
        let pd = unsafe { p.data() };
        let pt = unsafe { pd.pagetable.ok_or(())?.as_mut() };
        vm::copyout(&kernel().kmem, pt, dst, src)
    } else {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }
}

pub fn either_copyin(dst: &mut [u8], user_src: bool, src: usize) -> Result<(), ()> {
    if user_src {
        let p = myproc().ok_or(())?;
        let pd = unsafe { p.data() };
        let pt = unsafe { pd.pagetable.ok_or(())?.as_ref() };
        vm::copyin(pt, dst, src)
    } else {
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_without_process_releases_and_retries() {
        // With no current process, sleep must not deadlock: it releases
        // the lock, spins, and reacquires.
        let lk = SpinLock::new("cond", 0u32);
        let g = lk.lock();
        let g = sleep(0x1000, g);
        drop(g);
        assert_eq!(*lk.lock(), 0);
    }

    #[test]
    fn wakeup_with_no_sleepers_is_noop() {
        wakeup(0xdead);
    }

    #[test]
    fn kill_unknown_pid_fails() {
        assert_eq!(kill(987654), -1);
    }

    #[test]
    fn trapframe_layout_matches_trampoline_offsets() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(Trapframe, kernel_satp), 0);
        assert_eq!(offset_of!(Trapframe, kernel_sp), 8);
        assert_eq!(offset_of!(Trapframe, kernel_trap), 16);
        assert_eq!(offset_of!(Trapframe, epc), 24);
        assert_eq!(offset_of!(Trapframe, ra), 32);
        assert_eq!(offset_of!(Trapframe, a0), 104);
        assert_eq!(offset_of!(Trapframe, t6), 272);
        assert_eq!(core::mem::size_of::<Trapframe>(), 35 * 8);
    }
}
