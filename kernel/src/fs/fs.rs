//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links referring
//! to it, and the list of blocks holding the file's content.
//!
//! The inodes are laid out sequentially on disk at sb.inodestart. Each
//! inode has a number, indicating its position on the disk.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. The
//! in-memory bookkeeping (refcnt, valid) is not stored on disk.
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   ialloc() allocates, and iput() frees if the reference and link counts
//!   have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if its
//!   refcnt is zero. Otherwise it tracks the number of in-memory
//!   references to the entry (open files and current directories). iget()
//!   finds or creates a table entry and increments its refcnt; iput()
//!   decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only
//!   correct when valid is set. ilock() reads the inode from the disk and
//!   sets valid, while iput() clears valid if refcnt has fallen to zero.
//!
//! * Locked: file system code may only examine and modify the information
//!   in an inode and its content if it has first locked the inode; an
//!   `InodeGuard` is proof of that.
//!
//! Thus a typical sequence is:
//!   let ip = fs.iget(dev, inum);
//!   let mut g = fs.ilock(ip);
//!   ... examine and modify through g ...
//!   drop(g);
//!   fs.iput(ip);
//!
//! ilock() is separate from iget() so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g., in read()). The separation also helps avoid
//! deadlock and races during pathname lookup.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::bio::{BlockDevice, BufCache};
use crate::buf::BufData;
use crate::fs::{
    bblock, iblock, Dinode, Dirent, InodeType, SuperBlock, BSIZE, DIRSIZ, FSMAGIC, IPB, MAXFILE,
    NDIRECT, NINDIRECT, ROOTINO,
};
use crate::log::Log;
use crate::param::{MAXPATH, MAXSYMLINK, NINODE};
use crate::proc::{either_copyin, either_copyout};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// A counted reference to an in-memory inode slot, the moral equivalent of
/// xv6's `struct inode *`. Copying the value does not add a reference:
/// every Iref handed out by iget/idup/ialloc must be retired by exactly one
/// iput.
#[derive(Debug, Clone, Copy)]
pub struct Iref {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

#[derive(Clone, Copy)]
struct IEnt {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// The sleep-locked portion of an in-memory inode: a copy of the disk
/// inode, loaded lazily by ilock.
pub struct InodeData {
    pub valid: bool,
    pub typ: InodeType,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 2],
}

impl InodeData {
    const INIT: SleepLock<InodeData> = SleepLock::new(
        "inode",
        InodeData {
            valid: false,
            typ: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
        },
    );
}

/// A locked inode. Deref gives the inode body; dropping unlocks.
pub struct InodeGuard<'a> {
    pub dev: u32,
    pub inum: u32,
    data: SleepLockGuard<'a, InodeData>,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeData;
    fn deref(&self) -> &InodeData {
        &self.data
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeData {
        &mut self.data
    }
}

fn as_u32s(b: &BufData) -> &[u32; NINDIRECT] {
    unsafe { &*(b.bytes.as_ptr() as *const [u32; NINDIRECT]) }
}

fn as_u32s_mut(b: &mut BufData) -> &mut [u32; NINDIRECT] {
    unsafe { &mut *(b.bytes.as_mut_ptr() as *mut [u32; NINDIRECT]) }
}

/// The file system: block cache, write-ahead log, superblock and the
/// in-memory inode table, over one block device.
pub struct Fs<D> {
    pub cache: BufCache<D>,
    pub log: Log,
    dev: AtomicU32,
    sb: SpinLock<SuperBlock>,
    ient: SpinLock<[IEnt; NINODE]>,
    inodes: [SleepLock<InodeData>; NINODE],
}

impl<D: BlockDevice> Fs<D> {
    pub const fn new(device: D) -> Fs<D> {
        Fs {
            cache: BufCache::new(device),
            log: Log::new(),
            dev: AtomicU32::new(0),
            sb: SpinLock::new("sb", SuperBlock {
                magic: 0,
                size: 0,
                nblocks: 0,
                ninodes: 0,
                nlog: 0,
                logstart: 0,
                inodestart: 0,
                bmapstart: 0,
            }),
            ient: SpinLock::new(
                "itable",
                [IEnt {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; NINODE],
            ),
            inodes: [InodeData::INIT; NINODE],
        }
    }

    /// Read the superblock from block 1, validate it, and replay the log.
    pub fn init(&self, dev: u32) {
        let sb = {
            let buf = self.cache.bread(dev, 1);
            let mut sb = SuperBlock::default();
            let raw = unsafe {
                core::slice::from_raw_parts_mut(
                    &mut sb as *mut SuperBlock as *mut u8,
                    mem::size_of::<SuperBlock>(),
                )
            };
            raw.copy_from_slice(&buf.bytes[..mem::size_of::<SuperBlock>()]);
            sb
        };
        if sb.magic != FSMAGIC {
            panic!("invalid file system");
        }

        self.dev.store(dev, Ordering::Release);
        *self.sb.lock() = sb;
        self.log.init(&self.cache, dev, &sb);

        log::info!(
            "fs: superblock total={} data={} ninodes={}",
            sb.size,
            sb.nblocks,
            sb.ninodes
        );
        log::info!(
            "fs: layout super=1 log[{}~{}) inode[{}~{}) bmap={}",
            sb.logstart,
            sb.logstart + sb.nlog,
            sb.inodestart,
            sb.bmapstart,
            sb.bmapstart
        );
    }

    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Acquire)
    }

    pub fn sb(&self) -> SuperBlock {
        *self.sb.lock()
    }

    pub fn begin_transaction(&self) {
        self.log.begin_transaction();
    }

    pub fn end_transaction(&self) {
        self.log.end_transaction(&self.cache);
    }

    // Blocks.

    // Zero a block through the log.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut bp = self.cache.bread(dev, bno);
        bp.bytes.fill(0);
        self.log.write(&self.cache, &bp);
    }

    // Allocate a zeroed data block. None if out of disk space.
    fn balloc(&self, dev: u32) -> Option<u32> {
        let sb = self.sb();
        let data_start = sb.bmapstart + 1;
        for b in 0..sb.nblocks {
            let bno = data_start + b;
            let mut bp = self.cache.bread(dev, bblock(bno, &sb));
            let bi = bno as usize % crate::fs::BPB;
            let m = 1u8 << (bi % 8);
            if bp.bytes[bi / 8] & m == 0 {
                bp.bytes[bi / 8] |= m; // mark block in use.
                self.log.write(&self.cache, &bp);
                drop(bp);
                self.bzero(dev, bno);
                return Some(bno);
            }
        }
        log::warn!("balloc: out of blocks");
        None
    }

    // Free a disk block.
    fn bfree(&self, dev: u32, b: u32) {
        let sb = self.sb();
        let mut bp = self.cache.bread(dev, bblock(b, &sb));
        let bi = b as usize % crate::fs::BPB;
        let m = 1u8 << (bi % 8);
        if bp.bytes[bi / 8] & m == 0 {
            panic!("freeing free block");
        }
        bp.bytes[bi / 8] &= !m;
        self.log.write(&self.cache, &bp);
    }

    // Inodes.

    /// Allocate an inode on device dev, marking it in use with the given
    /// type. Returns an unlocked but referenced inode, or None if every
    /// on-disk inode is taken.
    pub fn ialloc(&self, dev: u32, typ: InodeType) -> Option<Iref> {
        let sb = self.sb();
        for inum in 1..sb.ninodes {
            let mut bp = self.cache.bread(dev, iblock(inum, &sb));
            let off = (inum as usize % IPB) * mem::size_of::<Dinode>();
            let dip = unsafe { &mut *(bp.bytes.as_mut_ptr().add(off) as *mut Dinode) };
            if dip.typ == InodeType::Free as i16 {
                *dip = Dinode {
                    typ: typ as i16,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 2],
                };
                self.log.write(&self.cache, &bp);
                drop(bp);
                return Some(self.iget(dev, inum));
            }
        }
        log::warn!("ialloc: no inodes");
        None
    }

    /// Find the inode with number inum on device dev and return its
    /// in-memory entry. Does not lock it or read it from disk.
    pub fn iget(&self, dev: u32, inum: u32) -> Iref {
        let mut tab = self.ient.lock();

        let mut empty = None;
        for (i, e) in tab.iter_mut().enumerate() {
            if e.refcnt > 0 && e.dev == dev && e.inum == inum {
                e.refcnt += 1;
                return Iref { idx: i, dev, inum };
            }
            if empty.is_none() && e.refcnt == 0 {
                empty = Some(i);
            }
        }

        let Some(idx) = empty else {
            panic!("iget: no inodes");
        };
        tab[idx] = IEnt {
            dev,
            inum,
            refcnt: 1,
        };
        // nobody holds the slot's sleep lock (refcnt was 0), so the body
        // can be marked stale directly.
        unsafe { self.inodes[idx].get_unchecked().valid = false };
        Iref { idx, dev, inum }
    }

    /// Take another reference; enables the `let ip2 = fs.idup(ip)` idiom.
    pub fn idup(&self, ip: Iref) -> Iref {
        let mut tab = self.ient.lock();
        tab[ip.idx].refcnt += 1;
        ip
    }

    /// Lock the inode, reading its body from disk if necessary.
    pub fn ilock(&self, ip: Iref) -> InodeGuard<'_> {
        {
            let tab = self.ient.lock();
            if tab[ip.idx].refcnt < 1 {
                panic!("ilock");
            }
        }

        let mut data = self.inodes[ip.idx].lock();
        if !data.valid {
            let sb = self.sb();
            let bp = self.cache.bread(ip.dev, iblock(ip.inum, &sb));
            let off = (ip.inum as usize % IPB) * mem::size_of::<Dinode>();
            let dip = unsafe { &*(bp.bytes.as_ptr().add(off) as *const Dinode) };
            data.typ = InodeType::from_raw(dip.typ);
            data.major = dip.major;
            data.minor = dip.minor;
            data.nlink = dip.nlink;
            data.size = dip.size;
            data.addrs = dip.addrs;
            drop(bp);
            data.valid = true;
            if data.typ == InodeType::Free {
                panic!("ilock: no type");
            }
        }

        InodeGuard {
            dev: ip.dev,
            inum: ip.inum,
            data,
        }
    }

    /// Copy a modified in-memory inode to disk. Must be called after every
    /// change to a field that lives on disk. Caller holds the guard.
    pub fn iupdate(&self, g: &InodeGuard<'_>) {
        let sb = self.sb();
        let mut bp = self.cache.bread(g.dev, iblock(g.inum, &sb));
        let off = (g.inum as usize % IPB) * mem::size_of::<Dinode>();
        let dip = unsafe { &mut *(bp.bytes.as_mut_ptr().add(off) as *mut Dinode) };
        dip.typ = g.typ as i16;
        dip.major = g.major;
        dip.minor = g.minor;
        dip.nlink = g.nlink;
        dip.size = g.size;
        dip.addrs = g.addrs;
        self.log.write(&self.cache, &bp);
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference and the inode has no links, free it (and its content) on
    /// disk. All calls to iput() must be inside a transaction in case the
    /// free happens.
    pub fn iput(&self, ip: Iref) {
        let mut tab = self.ient.lock();

        if tab[ip.idx].refcnt == 1 {
            // refcnt 1 means no other process can have the inode locked,
            // so this lock() won't block (or deadlock).
            drop(tab);
            let data = self.inodes[ip.idx].lock();
            if data.valid && data.nlink == 0 {
                // no links and no other references: truncate and free.
                let mut g = InodeGuard {
                    dev: ip.dev,
                    inum: ip.inum,
                    data,
                };
                self.itrunc(&mut g);
                g.typ = InodeType::Free;
                self.iupdate(&g);
                g.valid = false;
            }
            tab = self.ient.lock();
        }

        tab[ip.idx].refcnt -= 1;
    }

    /// Common idiom: unlock, then put.
    pub fn iunlockput(&self, g: InodeGuard<'_>, ip: Iref) {
        drop(g);
        self.iput(ip);
    }

    // Inode content.
    //
    // The content (data) associated with each inode is stored in blocks on
    // the disk. The first NDIRECT block numbers are listed directly in
    // addrs[]; the next NINDIRECT blocks in the block addrs[NDIRECT]; and
    // NINDIRECT * NINDIRECT more via the double-indirect block at
    // addrs[NDIRECT+1].

    /// Return the disk block address of the bn'th logical block of the
    /// inode, allocating pointer blocks lazily. None if out of disk space.
    fn bmap(&self, g: &mut InodeGuard<'_>, bn: u32) -> Option<u32> {
        let dev = g.dev;
        let mut bn = bn as usize;

        if bn < NDIRECT {
            if g.addrs[bn] == 0 {
                g.addrs[bn] = self.balloc(dev)?;
            }
            return Some(g.addrs[bn]);
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load indirect block, allocating if necessary.
            if g.addrs[NDIRECT] == 0 {
                g.addrs[NDIRECT] = self.balloc(dev)?;
            }
            let mut bp = self.cache.bread(dev, g.addrs[NDIRECT]);
            let mut addr = as_u32s(&bp)[bn];
            if addr == 0 {
                addr = self.balloc(dev)?;
                as_u32s_mut(&mut bp)[bn] = addr;
                // only log the pointer block when it actually changed.
                self.log.write(&self.cache, &bp);
            }
            return Some(addr);
        }
        bn -= NINDIRECT;

        if bn >= crate::fs::NDOUBLE {
            panic!("bmap: out of range");
        }

        if g.addrs[NDIRECT + 1] == 0 {
            g.addrs[NDIRECT + 1] = self.balloc(dev)?;
        }
        let first = bn / NINDIRECT;
        let second = bn % NINDIRECT;

        let mut dbp = self.cache.bread(dev, g.addrs[NDIRECT + 1]);
        let mut mid = as_u32s(&dbp)[first];
        if mid == 0 {
            mid = self.balloc(dev)?;
            as_u32s_mut(&mut dbp)[first] = mid;
            self.log.write(&self.cache, &dbp);
        }
        drop(dbp);

        let mut sbp = self.cache.bread(dev, mid);
        let mut addr = as_u32s(&sbp)[second];
        if addr == 0 {
            addr = self.balloc(dev)?;
            as_u32s_mut(&mut sbp)[second] = addr;
            self.log.write(&self.cache, &sbp);
        }
        Some(addr)
    }

    /// Discard the inode's contents: direct blocks, then the single-
    /// indirect tree, then the double-indirect tree.
    pub fn itrunc(&self, g: &mut InodeGuard<'_>) {
        let dev = g.dev;

        for i in 0..NDIRECT {
            if g.addrs[i] != 0 {
                self.bfree(dev, g.addrs[i]);
                g.addrs[i] = 0;
            }
        }

        // the pointer blocks are walked in place: the kernel stack has no
        // room for 4 KiB copies.
        if g.addrs[NDIRECT] != 0 {
            {
                let bp = self.cache.bread(dev, g.addrs[NDIRECT]);
                for j in 0..NINDIRECT {
                    let addr = as_u32s(&bp)[j];
                    if addr != 0 {
                        self.bfree(dev, addr);
                    }
                }
            }
            self.bfree(dev, g.addrs[NDIRECT]);
            g.addrs[NDIRECT] = 0;
        }

        if g.addrs[NDIRECT + 1] != 0 {
            {
                let dbp = self.cache.bread(dev, g.addrs[NDIRECT + 1]);
                for i in 0..NINDIRECT {
                    let mid = as_u32s(&dbp)[i];
                    if mid == 0 {
                        continue;
                    }
                    {
                        let sbp = self.cache.bread(dev, mid);
                        for j in 0..NINDIRECT {
                            let addr = as_u32s(&sbp)[j];
                            if addr != 0 {
                                self.bfree(dev, addr);
                            }
                        }
                    }
                    self.bfree(dev, mid);
                }
            }
            self.bfree(dev, g.addrs[NDIRECT + 1]);
            g.addrs[NDIRECT + 1] = 0;
        }

        g.size = 0;
        self.iupdate(g);
    }

    /// Read data from the inode into a user or kernel destination.
    /// Returns the number of bytes read.
    pub fn readi(
        &self,
        g: &mut InodeGuard<'_>,
        user_dst: bool,
        dst: usize,
        off: u32,
        n: u32,
    ) -> Result<u32, ()> {
        if off > g.size || off.checked_add(n).is_none() {
            return Err(());
        }
        let n = n.min(g.size - off);

        let mut tot = 0;
        while tot < n {
            let cur = off + tot;
            let Some(addr) = self.bmap(g, cur / BSIZE as u32) else {
                break;
            };
            let bp = self.cache.bread(g.dev, addr);
            let boff = cur as usize % BSIZE;
            let m = (n - tot).min((BSIZE - boff) as u32);
            if either_copyout(user_dst, dst + tot as usize, &bp.bytes[boff..boff + m as usize])
                .is_err()
            {
                return Err(());
            }
            tot += m;
        }
        Ok(tot)
    }

    /// Write data to the inode from a user or kernel source, growing the
    /// file if needed. A short return means some allocation or copy
    /// failed.
    pub fn writei(
        &self,
        g: &mut InodeGuard<'_>,
        user_src: bool,
        src: usize,
        off: u32,
        n: u32,
    ) -> Result<u32, ()> {
        if off > g.size || off.checked_add(n).is_none() {
            return Err(());
        }
        if off + n > (MAXFILE * BSIZE) as u32 {
            return Err(());
        }

        let mut tot = 0;
        while tot < n {
            let cur = off + tot;
            let Some(addr) = self.bmap(g, cur / BSIZE as u32) else {
                break;
            };
            let mut bp = self.cache.bread(g.dev, addr);
            let boff = cur as usize % BSIZE;
            let m = (n - tot).min((BSIZE - boff) as u32);
            if either_copyin(&mut bp.bytes[boff..boff + m as usize], user_src, src + tot as usize)
                .is_err()
            {
                break;
            }
            self.log.write(&self.cache, &bp);
            tot += m;
        }

        if off + tot > g.size {
            g.size = off + tot;
        }
        // write the i-node back even if the size didn't change, because
        // bmap() may have added a new block to addrs[].
        self.iupdate(g);
        Ok(tot)
    }

    // Directories.

    /// Look for a file name in a directory; on a hit, return the entry's
    /// inode and optionally the byte offset of the entry itself.
    pub fn dirlookup(
        &self,
        g: &mut InodeGuard<'_>,
        name: &[u8],
        poff: Option<&mut u32>,
    ) -> Option<Iref> {
        if g.typ != InodeType::Dir {
            panic!("dirlookup not DIR");
        }

        let sz = mem::size_of::<Dirent>() as u32;
        let mut de = Dirent::empty();
        let mut off = 0;
        while off < g.size {
            if self.readi(g, false, &mut de as *mut Dirent as usize, off, sz) != Ok(sz) {
                panic!("dirlookup read");
            }
            if de.inum != 0 && de.name_is(name) {
                if let Some(p) = poff {
                    *p = off;
                }
                return Some(self.iget(g.dev, de.inum as u32));
            }
            off += sz;
        }
        None
    }

    /// Write a new directory entry (name, inum) into the directory,
    /// reusing an empty slot when one exists. Fails if name is already
    /// present.
    pub fn dirlink(&self, g: &mut InodeGuard<'_>, name: &[u8], inum: u32) -> Result<(), ()> {
        // Check that name is not present.
        if let Some(ip) = self.dirlookup(g, name, None) {
            self.iput(ip);
            return Err(());
        }

        // Look for an empty dirent.
        let sz = mem::size_of::<Dirent>() as u32;
        let mut de = Dirent::empty();
        let mut off = 0;
        while off < g.size {
            if self.readi(g, false, &mut de as *mut Dirent as usize, off, sz) != Ok(sz) {
                panic!("dirlink read");
            }
            if de.inum == 0 {
                break;
            }
            off += sz;
        }

        de.set_name(name);
        de.inum = inum as u16;
        if self.writei(g, false, &de as *const Dirent as usize, off, sz) != Ok(sz) {
            return Err(());
        }
        Ok(())
    }

    /// A directory is considered empty when only "." and ".." remain.
    pub fn dir_is_empty(&self, g: &mut InodeGuard<'_>) -> bool {
        let sz = mem::size_of::<Dirent>() as u32;
        let mut de = Dirent::empty();
        let mut off = 2 * sz;
        while off < g.size {
            if self.readi(g, false, &mut de as *mut Dirent as usize, off, sz) != Ok(sz) {
                panic!("dir_is_empty: read");
            }
            if de.inum != 0 {
                return false;
            }
            off += sz;
        }
        true
    }

    // Paths.

    /// Look up and return the inode for a path name.
    /// Must be called inside a transaction since it calls iput().
    pub fn namei(&self, path: &[u8]) -> Option<Iref> {
        let mut name = [0u8; DIRSIZ];
        self.namex(path, false, &mut name)
    }

    /// Return the parent directory's inode and copy the final path element
    /// into name.
    pub fn nameiparent(&self, path: &[u8], name: &mut [u8; DIRSIZ]) -> Option<Iref> {
        self.namex(path, true, name)
    }

    fn namex(&self, path: &[u8], parent: bool, name: &mut [u8; DIRSIZ]) -> Option<Iref> {
        if path.is_empty() {
            return None;
        }

        let start = if path[0] == b'/' {
            self.iget(self.dev(), ROOTINO)
        } else {
            match crate::proc::current_cwd() {
                Some(cwd) => self.idup(cwd),
                None => self.iget(self.dev(), ROOTINO),
            }
        };

        self.namex_from(start, path, parent, name, 0)
    }

    /// Resolve `path` starting from `start` (whose reference is consumed),
    /// expanding symlinks up to the depth bound. Absolute link targets
    /// restart from the root, relative ones from the link's directory.
    fn namex_from(
        &self,
        start: Iref,
        path: &[u8],
        parent: bool,
        name: &mut [u8; DIRSIZ],
        depth: usize,
    ) -> Option<Iref> {
        let mut ip = start;
        let mut path = path;

        while let Some((elem, rest)) = skipelem(path) {
            let mut g = self.ilock(ip);

            if g.typ != InodeType::Dir {
                self.iunlockput(g, ip);
                return None;
            }

            if parent && rest.is_empty() {
                // Stop one level early.
                name.fill(0);
                let n = elem.len().min(DIRSIZ);
                name[..n].copy_from_slice(&elem[..n]);
                drop(g);
                return Some(ip);
            }

            let dir = ip;
            let Some(next) = self.dirlookup(&mut g, elem, None) else {
                self.iunlockput(g, ip);
                return None;
            };
            drop(g);
            ip = next;

            // A symlink anywhere but the final nameiparent component is
            // expanded in place.
            let mut tg = self.ilock(ip);
            if tg.typ == InodeType::Symlink {
                if depth >= MAXSYMLINK {
                    self.iunlockput(tg, ip);
                    self.iput(dir);
                    return None;
                }

                let stored = tg.size;
                if stored == 0 || stored > MAXPATH as u32 {
                    self.iunlockput(tg, ip);
                    self.iput(dir);
                    return None;
                }
                let mut target = [0u8; MAXPATH];
                if self.readi(&mut tg, false, target.as_mut_ptr() as usize, 0, stored)
                    != Ok(stored)
                {
                    self.iunlockput(tg, ip);
                    self.iput(dir);
                    return None;
                }
                self.iunlockput(tg, ip);

                // body is NUL-terminated on disk.
                let tlen = target.iter().position(|&c| c == 0).unwrap_or(MAXPATH);

                let mut combined = [0u8; MAXPATH];
                let Some(clen) = join_paths(&mut combined, &target[..tlen], rest) else {
                    self.iput(dir);
                    return None;
                };

                return if target[0] == b'/' {
                    let root = self.iget(self.dev(), ROOTINO);
                    self.iput(dir);
                    self.namex_from(root, &combined[..clen], parent, name, depth + 1)
                } else {
                    self.namex_from(dir, &combined[..clen], parent, name, depth + 1)
                };
            }
            drop(tg);

            self.iput(dir);
            path = rest;
        }

        if parent {
            self.iput(ip);
            return None;
        }
        Some(ip)
    }
}

/// Split the next path element off `path`.
/// Returns (element, remainder) with no leading slashes on either, or None
/// if the path is exhausted. Examples:
///   skipelem(b"a/bb/c") = (b"a", b"bb/c")
///   skipelem(b"///a//bb") = (b"a", b"bb")
///   skipelem(b"a") = (b"a", b"")
///   skipelem(b"") = skipelem(b"////") = None
fn skipelem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() || path[i] == 0 {
        return None;
    }

    let start = i;
    while i < path.len() && path[i] != b'/' && path[i] != 0 {
        i += 1;
    }
    let mut elem = &path[start..i];
    if elem.len() > DIRSIZ {
        elem = &elem[..DIRSIZ];
    }

    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    Some((elem, &path[i..]))
}

/// combined = target [+ "/" + rest]; None if it would not fit in MAXPATH.
fn join_paths(dst: &mut [u8; MAXPATH], target: &[u8], rest: &[u8]) -> Option<usize> {
    if target.len() >= MAXPATH {
        return None;
    }
    dst[..target.len()].copy_from_slice(target);
    let mut len = target.len();
    if !rest.is_empty() {
        if len + 1 + rest.len() >= MAXPATH {
            return None;
        }
        dst[len] = b'/';
        len += 1;
        dst[len..len + rest.len()].copy_from_slice(rest);
        len += rest.len();
    }
    Some(len)
}

#[cfg(test)]
pub(crate) mod fs_tests {
    use super::*;
    use crate::bio::testdev::MemDisk;

    pub(crate) const TESTDEV: u32 = 1;

    /// Format a MemDisk with the standard layout: block 1 superblock,
    /// 2..31 log, 32..44 inodes, 45 bitmap, data from 46. Root directory
    /// gets inode 1 with "." and "..".
    pub(crate) fn mkfs(disk: &MemDisk) {
        const SIZE: u32 = 2000;
        const LOGSTART: u32 = 2;
        const INODESTART: u32 = 32;
        const BMAPSTART: u32 = 45;
        const DATASTART: u32 = 46;

        let sb = SuperBlock {
            magic: FSMAGIC,
            size: SIZE,
            nblocks: SIZE - DATASTART,
            ninodes: (13 * IPB) as u32,
            nlog: crate::param::LOGSIZE as u32,
            logstart: LOGSTART,
            inodestart: INODESTART,
            bmapstart: BMAPSTART,
        };

        // superblock
        let mut blk = [0u8; BSIZE];
        let raw = unsafe {
            core::slice::from_raw_parts(
                &sb as *const SuperBlock as *const u8,
                mem::size_of::<SuperBlock>(),
            )
        };
        blk[..raw.len()].copy_from_slice(raw);
        disk.raw_write(1, &blk);

        // root inode
        let mut blk = [0u8; BSIZE];
        let root = Dinode {
            typ: InodeType::Dir as i16,
            major: 0,
            minor: 0,
            nlink: 1,
            size: 2 * mem::size_of::<Dirent>() as u32,
            addrs: {
                let mut a = [0u32; NDIRECT + 2];
                a[0] = DATASTART;
                a
            },
        };
        let off = (ROOTINO as usize % IPB) * mem::size_of::<Dinode>();
        unsafe {
            *(blk.as_mut_ptr().add(off) as *mut Dinode) = root;
        }
        disk.raw_write(iblock(ROOTINO, &sb), &blk);

        // root directory data: "." and ".."
        let mut blk = [0u8; BSIZE];
        let mut dot = Dirent::empty();
        dot.set_name(b".");
        dot.inum = ROOTINO as u16;
        let mut dotdot = Dirent::empty();
        dotdot.set_name(b"..");
        dotdot.inum = ROOTINO as u16;
        unsafe {
            *(blk.as_mut_ptr() as *mut Dirent) = dot;
            *(blk.as_mut_ptr().add(mem::size_of::<Dirent>()) as *mut Dirent) = dotdot;
        }
        disk.raw_write(DATASTART, &blk);

        // bitmap: everything up to and including the root data block is
        // taken.
        let mut blk = [0u8; BSIZE];
        for b in 0..=DATASTART {
            blk[b as usize / 8] |= 1 << (b % 8);
        }
        disk.raw_write(BMAPSTART, &blk);
    }

    pub(crate) fn test_fs() -> Box<Fs<MemDisk>> {
        let disk = MemDisk::new(2000);
        mkfs(&disk);
        let fs = Box::new(Fs::new(disk));
        fs.init(TESTDEV);
        fs
    }

    /// Create a file in the root directory; transaction managed by caller.
    fn create_file(fs: &Fs<MemDisk>, name: &[u8], typ: InodeType) -> Iref {
        let root = fs.iget(TESTDEV, ROOTINO);
        let mut rg = fs.ilock(root);
        let ip = fs.ialloc(TESTDEV, typ).unwrap();
        {
            let mut g = fs.ilock(ip);
            g.nlink = 1;
            fs.iupdate(&g);
        }
        fs.dirlink(&mut rg, name, ip.inum).unwrap();
        fs.iunlockput(rg, root);
        ip
    }

    #[test]
    fn write_then_read_roundtrip() {
        let fs = test_fs();
        let msg = b"Hello, filesystem!";

        fs.begin_transaction();
        let ip = create_file(&fs, b"foo", InodeType::File);
        let mut g = fs.ilock(ip);
        assert_eq!(
            fs.writei(&mut g, false, msg.as_ptr() as usize, 0, msg.len() as u32),
            Ok(msg.len() as u32)
        );
        fs.iunlockput(g, ip);
        fs.end_transaction();

        fs.begin_transaction();
        let ip = fs.namei(b"/foo").unwrap();
        let mut g = fs.ilock(ip);
        assert_eq!(g.size, msg.len() as u32);
        let mut back = [0u8; 18];
        assert_eq!(
            fs.readi(&mut g, false, back.as_mut_ptr() as usize, 0, 18),
            Ok(18)
        );
        assert_eq!(&back, msg);
        fs.iunlockput(g, ip);
        fs.end_transaction();
    }

    #[test]
    fn large_file_uses_indirect_blocks() {
        let fs = test_fs();
        // past the direct blocks: 12 * 4096 = 48 KiB; write 64 KiB.
        let chunk = [0xabu8; BSIZE];

        fs.begin_transaction();
        let ip = create_file(&fs, b"big", InodeType::File);
        fs.end_transaction();

        for i in 0..16u32 {
            fs.begin_transaction();
            let mut g = fs.ilock(ip);
            assert_eq!(
                fs.writei(&mut g, false, chunk.as_ptr() as usize, i * BSIZE as u32, BSIZE as u32),
                Ok(BSIZE as u32)
            );
            drop(g);
            fs.end_transaction();
        }

        fs.begin_transaction();
        let mut g = fs.ilock(ip);
        assert!(g.addrs[NDIRECT] != 0); // indirect tree in use
        let mut back = [0u8; 64];
        assert_eq!(
            fs.readi(&mut g, false, back.as_mut_ptr() as usize, 15 * BSIZE as u32, 64),
            Ok(64)
        );
        assert!(back.iter().all(|&b| b == 0xab));
        fs.iunlockput(g, ip);
        fs.end_transaction();
    }

    #[test]
    fn itrunc_frees_blocks() {
        let fs = test_fs();
        let chunk = [1u8; BSIZE];

        fs.begin_transaction();
        let ip = create_file(&fs, b"t", InodeType::File);
        fs.end_transaction();

        for i in 0..14u32 {
            fs.begin_transaction();
            let mut g = fs.ilock(ip);
            fs.writei(&mut g, false, chunk.as_ptr() as usize, i * BSIZE as u32, BSIZE as u32)
                .unwrap();
            drop(g);
            fs.end_transaction();
        }

        fs.begin_transaction();
        let mut g = fs.ilock(ip);
        fs.itrunc(&mut g);
        assert_eq!(g.size, 0);
        assert!(g.addrs.iter().all(|&a| a == 0));
        fs.iunlockput(g, ip);
        fs.end_transaction();
    }

    #[test]
    fn dirlink_refuses_duplicates() {
        let fs = test_fs();
        fs.begin_transaction();
        let ip = create_file(&fs, b"dup", InodeType::File);

        let root = fs.iget(TESTDEV, ROOTINO);
        let mut rg = fs.ilock(root);
        assert!(fs.dirlink(&mut rg, b"dup", ip.inum).is_err());
        fs.iunlockput(rg, root);
        fs.end_transaction();
    }

    #[test]
    fn namei_normalizes_dot_and_dotdot() {
        let fs = test_fs();

        fs.begin_transaction();
        // mkdir /a with . and ..
        let dir = fs.ialloc(TESTDEV, InodeType::Dir).unwrap();
        {
            let mut dg = fs.ilock(dir);
            dg.nlink = 1;
            fs.iupdate(&dg);
            fs.dirlink(&mut dg, b".", dir.inum).unwrap();
            fs.dirlink(&mut dg, b"..", ROOTINO).unwrap();
            drop(dg);
        }
        let root = fs.iget(TESTDEV, ROOTINO);
        let mut rg = fs.ilock(root);
        fs.dirlink(&mut rg, b"a", dir.inum).unwrap();
        fs.iunlockput(rg, root);

        let c = create_file(&fs, b"c", InodeType::File);
        fs.end_transaction();

        fs.begin_transaction();
        let via_dots = fs.namei(b"/a/../c").unwrap();
        let direct = fs.namei(b"/c").unwrap();
        assert_eq!(via_dots.inum, direct.inum);
        assert_eq!(via_dots.inum, c.inum);
        fs.iput(via_dots);
        fs.iput(direct);
        fs.end_transaction();
    }

    #[test]
    fn symlink_resolution_and_depth_bound() {
        let fs = test_fs();

        fs.begin_transaction();
        let file = create_file(&fs, b"real", InodeType::File);
        let _ = file;

        // link0 -> /real
        let l0 = create_file(&fs, b"link0", InodeType::Symlink);
        let mut g = fs.ilock(l0);
        fs.writei(&mut g, false, b"/real\0".as_ptr() as usize, 0, 6).unwrap();
        fs.iunlockput(g, l0);
        fs.end_transaction();

        fs.begin_transaction();
        let ip = fs.namei(b"/link0").unwrap();
        let mut g = fs.ilock(ip);
        assert_eq!(g.typ, InodeType::File);
        drop(g);
        fs.iput(ip);
        fs.end_transaction();

        // a cycle: c0 -> /c1, c1 -> /c0; resolution must fail cleanly.
        fs.begin_transaction();
        for (name, target) in [(b"c0", b"/c1\0"), (b"c1", b"/c0\0")] {
            let l = create_file(&fs, name, InodeType::Symlink);
            let mut g = fs.ilock(l);
            fs.writei(&mut g, false, target.as_ptr() as usize, 0, 4).unwrap();
            fs.iunlockput(g, l);
        }
        fs.end_transaction();

        fs.begin_transaction();
        assert!(fs.namei(b"/c0").is_none());
        fs.end_transaction();
    }

    #[test]
    fn iget_refcounts_share_entries() {
        let fs = test_fs();
        let a = fs.iget(TESTDEV, ROOTINO);
        let b = fs.iget(TESTDEV, ROOTINO);
        assert_eq!(a.idx, b.idx);
        fs.begin_transaction();
        fs.iput(a);
        fs.iput(b);
        fs.end_transaction();
    }
}
