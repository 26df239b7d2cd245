//! File-system system calls: open/close/read/write/unlink and friends.
//! These are thin wrappers that fetch and validate arguments, bracket the
//! mutating paths in log transactions, and call into the fs and file
//! layers.

use crate::file::{device, FileKind, FileRef, CONSOLE};
use crate::fs::{InodeGuard, InodeType, Iref, DIRSIZ};
use crate::kernel;
use crate::param::{MAXPATH, NOFILE};
use crate::proc::myproc;
use crate::syscall::{argaddr, argint, argstr};
use crate::KernelFs;

// open flags, shared with the user C library.
pub const O_RDONLY: i32 = 0x000;
pub const O_WRONLY: i32 = 0x001;
pub const O_RDWR: i32 = 0x002;
pub const O_CREATE: i32 = 0x200;

const ERR: u64 = u64::MAX;

fn kfs() -> &'static KernelFs {
    &kernel().fs
}

/// Fetch the nth argument as a file descriptor; returns (fd, file).
fn argfd(n: usize) -> Result<(usize, FileRef), ()> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    let p = myproc().ok_or(())?;
    let f = unsafe { p.data() }.ofile[fd as usize].ok_or(())?;
    Ok((fd as usize, f))
}

/// Bind an open file to the lowest free slot in the caller's fd table.
fn fdalloc(f: FileRef) -> Result<usize, ()> {
    let p = myproc().ok_or(())?;
    let pd = unsafe { p.data() };
    for fd in 0..NOFILE {
        if pd.ofile[fd].is_none() {
            pd.ofile[fd] = Some(f);
            return Ok(fd);
        }
    }
    Err(())
}

/// Common path for open(O_CREATE), mknod and symlink: make a new inode at
/// path, or reuse an existing regular file. Returns the locked inode.
/// Caller is inside a transaction.
fn create(
    path: &[u8],
    typ: InodeType,
    major: i16,
    minor: i16,
) -> Option<(Iref, InodeGuard<'static>)> {
    let fs = kfs();

    let mut name = [0u8; DIRSIZ];
    let dp = fs.nameiparent(path, &mut name)?;
    let nlen = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);

    let mut dg = fs.ilock(dp);

    if let Some(ip) = fs.dirlookup(&mut dg, &name[..nlen], None) {
        fs.iunlockput(dg, dp);
        let g = fs.ilock(ip);
        if typ == InodeType::File && (g.typ == InodeType::File || g.typ == InodeType::Dev) {
            return Some((ip, g));
        }
        fs.iunlockput(g, ip);
        return None;
    }

    let Some(ip) = fs.ialloc(dp.dev, typ) else {
        fs.iunlockput(dg, dp);
        return None;
    };

    let mut g = fs.ilock(ip);
    g.major = major;
    g.minor = minor;
    g.nlink = 1;
    fs.iupdate(&g);

    if typ == InodeType::Dir {
        // "." and ".." first; the parent gains a link from "..".
        dg.nlink += 1;
        fs.iupdate(&dg);
        if fs.dirlink(&mut g, b".", ip.inum).is_err()
            || fs.dirlink(&mut g, b"..", dp.inum).is_err()
        {
            panic!("create: dots");
        }
    }

    if fs.dirlink(&mut dg, &name[..nlen], ip.inum).is_err() {
        panic!("create: parent link");
    }

    fs.iunlockput(dg, dp);
    Some((ip, g))
}

pub fn sys_open() -> u64 {
    let mut path = [0u8; MAXPATH];
    let Ok(len) = argstr(0, &mut path) else {
        return ERR;
    };
    let omode = argint(1);
    let path = &path[..len];

    let readable = omode & O_WRONLY == 0;
    let writable = omode & O_WRONLY != 0 || omode & O_RDWR != 0;

    // the console pseudo-paths bypass the inode layer entirely.
    if path == b"console" || path == b"/dev/console" {
        let kind = FileKind::Device {
            major: CONSOLE as i16,
            ip: None,
        };
        let Some(f) = kernel().ftable.alloc(kind, readable, writable) else {
            return ERR;
        };
        let Ok(fd) = fdalloc(f) else {
            kernel().ftable.close(f, kfs());
            return ERR;
        };
        return fd as u64;
    }

    let fs = kfs();
    fs.begin_transaction();

    let (ip, g) = if omode & O_CREATE != 0 {
        match create(path, InodeType::File, 0, 0) {
            Some(pair) => pair,
            None => {
                fs.end_transaction();
                return ERR;
            }
        }
    } else {
        let Some(ip) = fs.namei(path) else {
            fs.end_transaction();
            return ERR;
        };
        let g = fs.ilock(ip);
        if g.typ == InodeType::Dir && writable {
            fs.iunlockput(g, ip);
            fs.end_transaction();
            return ERR;
        }
        (ip, g)
    };

    let kind = if g.typ == InodeType::Dev {
        // a registered driver must exist for the major number.
        let major = g.major;
        if device(major).is_none() {
            fs.iunlockput(g, ip);
            fs.end_transaction();
            return ERR;
        }
        FileKind::Device {
            major,
            ip: Some(ip),
        }
    } else {
        FileKind::Inode(ip)
    };

    let Some(f) = kernel().ftable.alloc(kind, readable, writable) else {
        fs.iunlockput(g, ip);
        fs.end_transaction();
        return ERR;
    };
    let Ok(fd) = fdalloc(f) else {
        drop(g);
        kernel().ftable.close(f, fs); // drops the inode reference too
        fs.end_transaction();
        return ERR;
    };

    drop(g);
    fs.end_transaction();
    fd as u64
}

pub fn sys_close() -> u64 {
    let Ok((fd, f)) = argfd(0) else {
        return ERR;
    };
    let p = myproc().expect("sys_close");
    unsafe { p.data() }.ofile[fd] = None;
    kernel().ftable.close(f, kfs());
    0
}

pub fn sys_read() -> u64 {
    let Ok((_, f)) = argfd(0) else {
        return ERR;
    };
    let Ok(addr) = argaddr(1) else {
        return ERR;
    };
    let n = argint(2);
    if n < 0 {
        return ERR;
    }
    match kernel().ftable.read(f, kfs(), true, addr, n as u32) {
        Ok(r) => r as u64,
        Err(()) => ERR,
    }
}

pub fn sys_write() -> u64 {
    let Ok((_, f)) = argfd(0) else {
        return ERR;
    };
    let Ok(addr) = argaddr(1) else {
        return ERR;
    };
    let n = argint(2);
    if n < 0 {
        return ERR;
    }
    match kernel().ftable.write(f, kfs(), true, addr, n as u32) {
        Ok(r) => r as u64,
        Err(()) => ERR,
    }
}

pub fn sys_dup() -> u64 {
    let Ok((_, f)) = argfd(0) else {
        return ERR;
    };
    let f = kernel().ftable.dup(f);
    match fdalloc(f) {
        Ok(fd) => fd as u64,
        Err(()) => {
            kernel().ftable.close(f, kfs());
            ERR
        }
    }
}

fn is_special_dirname(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

pub fn sys_unlink() -> u64 {
    let fs = kfs();

    let mut path = [0u8; MAXPATH];
    let Ok(len) = argstr(0, &mut path) else {
        return ERR;
    };
    let path = &path[..len];

    fs.begin_transaction();

    let mut name = [0u8; DIRSIZ];
    let Some(dp) = fs.nameiparent(path, &mut name) else {
        fs.end_transaction();
        return ERR;
    };
    let nlen = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
    let name = &name[..nlen];

    let mut dg = fs.ilock(dp);

    if is_special_dirname(name) {
        fs.iunlockput(dg, dp);
        fs.end_transaction();
        return ERR;
    }

    let mut off = 0u32;
    let Some(ip) = fs.dirlookup(&mut dg, name, Some(&mut off)) else {
        fs.iunlockput(dg, dp);
        fs.end_transaction();
        return ERR;
    };

    let mut g = fs.ilock(ip);
    if g.nlink < 1 {
        panic!("unlink: nlink < 1");
    }
    if g.typ == InodeType::Dir && !fs.dir_is_empty(&mut g) {
        fs.iunlockput(g, ip);
        fs.iunlockput(dg, dp);
        fs.end_transaction();
        return ERR;
    }

    // clear the directory entry in place.
    let de = crate::fs::Dirent::empty();
    let desz = core::mem::size_of::<crate::fs::Dirent>() as u32;
    if fs.writei(&mut dg, false, &de as *const crate::fs::Dirent as usize, off, desz) != Ok(desz) {
        panic!("unlink: writei");
    }

    if g.typ == InodeType::Dir {
        dg.nlink -= 1; // the removed directory's ".."
        fs.iupdate(&dg);
    }
    fs.iunlockput(dg, dp);

    g.nlink -= 1;
    fs.iupdate(&g);
    fs.iunlockput(g, ip);

    fs.end_transaction();
    0
}

pub fn sys_mknod() -> u64 {
    let fs = kfs();

    let mut path = [0u8; MAXPATH];
    let Ok(len) = argstr(0, &mut path) else {
        return ERR;
    };
    let major = argint(1);
    let minor = argint(2);
    let typ = match InodeType::from_raw(argint(3) as i16) {
        InodeType::Free => return ERR,
        t => t,
    };

    fs.begin_transaction();
    let Some((ip, g)) = create(&path[..len], typ, major as i16, minor as i16) else {
        fs.end_transaction();
        return ERR;
    };
    fs.iunlockput(g, ip);
    fs.end_transaction();
    0
}

pub fn sys_chdir() -> u64 {
    let fs = kfs();

    let mut path = [0u8; MAXPATH];
    let Ok(len) = argstr(0, &mut path) else {
        return ERR;
    };
    let p = myproc().expect("sys_chdir");

    fs.begin_transaction();
    let Some(ip) = fs.namei(&path[..len]) else {
        fs.end_transaction();
        return ERR;
    };
    let g = fs.ilock(ip);
    if g.typ != InodeType::Dir {
        fs.iunlockput(g, ip);
        fs.end_transaction();
        return ERR;
    }
    drop(g);

    let pd = unsafe { p.data() };
    if let Some(old) = pd.cwd.replace(ip) {
        fs.iput(old);
    }
    fs.end_transaction();
    0
}

/// symlink(target, linkpath): the link body is the NUL-terminated target
/// path.
pub fn sys_symlink() -> u64 {
    let fs = kfs();

    let mut target = [0u8; MAXPATH];
    let mut path = [0u8; MAXPATH];
    let Ok(tlen) = argstr(0, &mut target) else {
        return ERR;
    };
    let Ok(plen) = argstr(1, &mut path) else {
        return ERR;
    };
    if tlen == 0 {
        return ERR;
    }

    fs.begin_transaction();
    let Some((ip, mut g)) = create(&path[..plen], InodeType::Symlink, 0, 0) else {
        fs.end_transaction();
        return ERR;
    };

    // store target plus its terminator.
    let n = tlen as u32 + 1;
    if fs.writei(&mut g, false, target.as_ptr() as usize, 0, n) != Ok(n) {
        fs.iunlockput(g, ip);
        fs.end_transaction();
        return ERR;
    }

    fs.iunlockput(g, ip);
    fs.end_transaction();
    0
}

pub fn sys_exec() -> u64 {
    let mut path = [0u8; MAXPATH];
    let Ok(len) = argstr(0, &mut path) else {
        return ERR;
    };
    let Ok(uargv) = argaddr(1) else {
        return ERR;
    };

    match crate::exec::exec(&path[..len], uargv) {
        Ok(argc) => argc as u64,
        Err(()) => ERR,
    }
}
