pub const NPROC: usize = 64; // maximum number of processes
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 100; // open files per system
pub const NINODE: usize = 50; // maximum number of active i-nodes
pub const NDEV: usize = 10; // maximum major device number
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const MAXARG: usize = 16; // max exec arguments
pub const MAXPATH: usize = 128; // maximum file path name
pub const LOGSIZE: usize = 30; // max data blocks in on-disk log
pub const MAXOPBLOCKS: usize = 10; // max # of blocks any FS op writes
pub const NBUF: usize = 32; // size of disk block cache
pub const NBUCKET: usize = 37; // buffer-cache hash buckets, prime >= NBUF
pub const MAXSYMLINK: usize = 8; // symlink expansion depth bound

pub const KLOG_CAP: usize = 64; // kernel log ring capacity
pub const KLOG_LINE_MAX: usize = 120; // max formatted bytes per klog entry
