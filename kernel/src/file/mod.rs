//! Open files and the device switch.

use crate::fs::Iref;
use crate::param::NDEV;
use crate::spinlock::SpinLock;

pub mod file;

pub use file::{FileRef, FileTable};

/// What an open file refers to. Pipes are deliberately absent: this kernel
/// does not implement them, so the sum type has no stub arm.
#[derive(Debug, Clone, Copy)]
pub enum FileKind {
    None,
    Inode(Iref),
    /// A device node; `ip` is the backing inode when the file was opened
    /// through the file system (None for the console pseudo-paths).
    Device { major: i16, ip: Option<Iref> },
}

/// Map major device number to device read/write functions.
/// The `user` flag says whether addr is a user or kernel address.
#[derive(Clone, Copy)]
pub struct Devsw {
    pub read: fn(user: bool, addr: usize, n: usize) -> i32,
    pub write: fn(user: bool, addr: usize, n: usize) -> i32,
}

pub const CONSOLE: usize = 1;

static DEVSW: SpinLock<[Option<Devsw>; NDEV]> = SpinLock::new("devsw", [None; NDEV]);

/// Drivers register here at boot.
pub fn register_device(major: usize, dev: Devsw) {
    if major >= NDEV {
        panic!("register_device");
    }
    DEVSW.lock()[major] = Some(dev);
}

pub fn device(major: i16) -> Option<Devsw> {
    if major < 0 || major as usize >= NDEV {
        return None;
    }
    DEVSW.lock()[major as usize]
}
