//! The global table of open files. Each entry represents one open(2) of an
//! inode or device and is shared between processes by fork/dup through a
//! reference count; the per-process fd table holds `FileRef` indices into
//! this table.

use crate::bio::BlockDevice;
use crate::file::{device, FileKind};
use crate::fs::{Fs, BSIZE};
use crate::param::{MAXOPBLOCKS, NFILE};
use crate::spinlock::SpinLock;

#[derive(Clone, Copy)]
struct FileSlot {
    refcnt: u32, // 0 means free
    readable: bool,
    writable: bool,
    off: u32, // read/write offset, Inode files only
    kind: FileKind,
}

const FREE_SLOT: FileSlot = FileSlot {
    refcnt: 0,
    readable: false,
    writable: false,
    off: 0,
    kind: FileKind::None,
};

/// Index of an entry in the open-file table. Copying the index does not
/// add a reference; use dup for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef(usize);

pub struct FileTable {
    slots: SpinLock<[FileSlot; NFILE]>,
}

impl FileTable {
    pub const fn new() -> FileTable {
        FileTable {
            slots: SpinLock::new("ftable", [FREE_SLOT; NFILE]),
        }
    }

    /// Claim a free slot with one reference.
    pub fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> Option<FileRef> {
        let mut slots = self.slots.lock();
        for (i, s) in slots.iter_mut().enumerate() {
            if s.refcnt == 0 {
                *s = FileSlot {
                    refcnt: 1,
                    readable,
                    writable,
                    off: 0,
                    kind,
                };
                return Some(FileRef(i));
            }
        }
        None
    }

    /// Increment the reference count (fork, dup).
    pub fn dup(&self, f: FileRef) -> FileRef {
        let mut slots = self.slots.lock();
        if slots[f.0].refcnt < 1 {
            panic!("filedup");
        }
        slots[f.0].refcnt += 1;
        f
    }

    /// Drop a reference; the last one releases whatever the file refers
    /// to. Inode references are put inside a transaction.
    pub fn close<D: BlockDevice>(&self, f: FileRef, fs: &Fs<D>) {
        let kind;
        {
            let mut slots = self.slots.lock();
            if slots[f.0].refcnt < 1 {
                panic!("fileclose");
            }
            slots[f.0].refcnt -= 1;
            if slots[f.0].refcnt > 0 {
                return;
            }
            kind = slots[f.0].kind;
            slots[f.0] = FREE_SLOT;
        }

        match kind {
            FileKind::Inode(ip) | FileKind::Device { ip: Some(ip), .. } => {
                fs.begin_transaction();
                fs.iput(ip);
                fs.end_transaction();
            }
            _ => {}
        }
    }

    pub fn refcount(&self, f: FileRef) -> u32 {
        self.slots.lock()[f.0].refcnt
    }

    /// Read from the file at its current offset, advancing it on success.
    pub fn read<D: BlockDevice>(
        &self,
        f: FileRef,
        fs: &Fs<D>,
        user: bool,
        addr: usize,
        n: u32,
    ) -> Result<u32, ()> {
        let (readable, kind, off) = {
            let slots = self.slots.lock();
            (slots[f.0].readable, slots[f.0].kind, slots[f.0].off)
        };
        if !readable {
            return Err(());
        }

        match kind {
            FileKind::None => Err(()),
            FileKind::Device { major, .. } => {
                let dev = device(major).ok_or(())?;
                let r = (dev.read)(user, addr, n as usize);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as u32)
                }
            }
            FileKind::Inode(ip) => {
                let mut g = fs.ilock(ip);
                let r = fs.readi(&mut g, user, addr, off, n)?;
                if r > 0 {
                    // the offset moves only under the inode lock.
                    self.slots.lock()[f.0].off += r;
                }
                drop(g);
                Ok(r)
            }
        }
    }

    /// Write to the file. Inode writes are split into chunks so each
    /// chunk's worst case (data blocks plus inode, indirect and bitmap
    /// updates) fits in a single log transaction.
    pub fn write<D: BlockDevice>(
        &self,
        f: FileRef,
        fs: &Fs<D>,
        user: bool,
        addr: usize,
        n: u32,
    ) -> Result<u32, ()> {
        let (writable, kind) = {
            let slots = self.slots.lock();
            (slots[f.0].writable, slots[f.0].kind)
        };
        if !writable {
            return Err(());
        }

        match kind {
            FileKind::None => Err(()),
            FileKind::Device { major, .. } => {
                let dev = device(major).ok_or(())?;
                let r = (dev.write)(user, addr, n as usize);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as u32)
                }
            }
            FileKind::Inode(ip) => {
                let max = (((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE) as u32;
                let mut written = 0;
                while written < n {
                    let chunk = (n - written).min(max);

                    fs.begin_transaction();
                    let mut g = fs.ilock(ip);
                    let off = self.slots.lock()[f.0].off;
                    let r = fs.writei(&mut g, user, addr + written as usize, off, chunk);
                    if let Ok(r) = r {
                        if r > 0 {
                            self.slots.lock()[f.0].off += r;
                        }
                    }
                    drop(g);
                    fs.end_transaction();

                    match r {
                        Ok(r) if r == chunk => written += r,
                        _ => return Err(()), // short write: out of space or bad address
                    }
                }
                Ok(written)
            }
        }
    }
}

impl Default for FileTable {
    fn default() -> FileTable {
        FileTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fs_tests::{test_fs, TESTDEV};
    use crate::fs::{InodeType, ROOTINO};

    #[test]
    fn dup_close_balance_refcounts() {
        let fs = test_fs();
        let ft = FileTable::new();

        fs.begin_transaction();
        let ip = fs.ialloc(TESTDEV, InodeType::File).unwrap();
        {
            // keep the inode alive on disk so close doesn't truncate
            let mut g = fs.ilock(ip);
            g.nlink = 1;
            fs.iupdate(&g);
        }
        fs.end_transaction();

        let f = ft.alloc(FileKind::Inode(ip), true, true).unwrap();
        assert_eq!(ft.refcount(f), 1);
        let f2 = ft.dup(f);
        assert_eq!(ft.refcount(f), 2);
        ft.close(f2, &fs);
        assert_eq!(ft.refcount(f), 1);
        ft.close(f, &fs);
        assert_eq!(ft.refcount(f), 0);

        // the slot is reusable afterwards
        let g = ft.alloc(FileKind::None, false, false).unwrap();
        assert_eq!(g, f);
    }

    #[test]
    fn offset_advances_across_reads() {
        let fs = test_fs();
        let ft = FileTable::new();

        fs.begin_transaction();
        let root = fs.iget(TESTDEV, ROOTINO);
        let mut rg = fs.ilock(root);
        let ip = fs.ialloc(TESTDEV, InodeType::File).unwrap();
        {
            let mut g = fs.ilock(ip);
            g.nlink = 1;
            fs.iupdate(&g);
            fs.writei(&mut g, false, b"abcdefgh".as_ptr() as usize, 0, 8)
                .unwrap();
        }
        fs.dirlink(&mut rg, b"seq", ip.inum).unwrap();
        fs.iunlockput(rg, root);
        fs.end_transaction();

        let f = ft.alloc(FileKind::Inode(ip), true, false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ft.read(f, &fs, false, buf.as_mut_ptr() as usize, 4), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(ft.read(f, &fs, false, buf.as_mut_ptr() as usize, 4), Ok(4));
        assert_eq!(&buf, b"efgh");
        // EOF
        assert_eq!(ft.read(f, &fs, false, buf.as_mut_ptr() as usize, 4), Ok(0));

        // not writable
        assert!(ft.write(f, &fs, false, buf.as_ptr() as usize, 4).is_err());
        ft.close(f, &fs);
    }
}
