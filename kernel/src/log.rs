//! Write-ahead redo log providing atomic multi-block transactions.
//!
//! A log transaction contains the updates of multiple FS system calls; the
//! log only commits when no FS system call is active (group commit). A
//! system call brackets its disk mutations with begin_transaction() /
//! end_transaction(); begin blocks while a commit is in progress or while
//! the log might not fit this writer's worst case.
//!
//! The on-disk log is a header block (count + block numbers, the commit
//! record) followed by LOG_SIZE body blocks. Commit order is: copy the
//! logged blocks into the log body, write the header (the commit point),
//! install the body blocks into their home locations, then write an empty
//! header. Recovery replays whatever the header names, so a crash at any
//! point either redoes the whole transaction or none of it.
//!
//! crash_stage is a test-only injection point: 1 returns from commit right
//! after the header write, 2 right before it.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::bio::{BlockDevice, Buf, BufCache};
use crate::fs::SuperBlock;
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{sleep, wakeup};
use crate::spinlock::SpinLock;

struct LogState {
    start: u32,
    size: u32,
    dev: u32,
    outstanding: u32, // how many FS sys calls are executing
    committing: bool, // in commit(), please wait
    n: u32,
    block: [u32; LOGSIZE],
}

pub struct Log {
    inner: SpinLock<LogState>,
    crash_stage: AtomicI32,
}

impl Log {
    pub const fn new() -> Log {
        Log {
            inner: SpinLock::new(
                "log",
                LogState {
                    start: 0,
                    size: 0,
                    dev: 0,
                    outstanding: 0,
                    committing: false,
                    n: 0,
                    block: [0; LOGSIZE],
                },
            ),
            crash_stage: AtomicI32::new(0),
        }
    }

    fn chan(&self) -> usize {
        &self.inner as *const _ as usize
    }

    pub fn init<D: BlockDevice>(&self, cache: &BufCache<D>, dev: u32, sb: &SuperBlock) {
        assert!(4 * (LOGSIZE + 1) < crate::fs::BSIZE, "initlog: too big logheader");
        {
            let mut l = self.inner.lock();
            l.start = sb.logstart;
            l.size = sb.nlog;
            l.dev = dev;
        }
        self.recover(cache);
    }

    /// Called at the start of each FS system call.
    pub fn begin_transaction(&self) {
        let mut l = self.inner.lock();
        loop {
            if l.committing {
                l = sleep(self.chan(), l);
            } else if l.n as usize + (l.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
                // this op might exhaust log space; wait for commit.
                l = sleep(self.chan(), l);
            } else {
                l.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call; commits if this was the
    /// last outstanding writer.
    pub fn end_transaction<D: BlockDevice>(&self, cache: &BufCache<D>) {
        let mut do_commit = false;
        {
            let mut l = self.inner.lock();
            if l.outstanding < 1 {
                panic!("end_transaction");
            }
            l.outstanding -= 1;
            if l.committing {
                panic!("log committing");
            }
            if l.outstanding == 0 {
                do_commit = true;
                l.committing = true;
            } else {
                // begin_transaction() may be waiting for log space, and
                // decrementing outstanding has decreased the reserved
                // amount.
                wakeup(self.chan());
            }
        }

        if do_commit {
            // commit without holding locks, since sleeping is allowed.
            self.commit(cache);
            let mut l = self.inner.lock();
            l.committing = false;
            drop(l);
            wakeup(self.chan());
        }
    }

    /// Record a modified buffer in the current transaction; replaces
    /// bwrite. A typical use is:
    ///   let mut b = cache.bread(...);
    ///   // modify b
    ///   log.write(&cache, &b);
    /// Writing the same block twice in one transaction takes one slot
    /// (absorption). The buffer stays pinned in the cache until install.
    pub fn write<D: BlockDevice>(&self, cache: &BufCache<D>, b: &Buf<'_, D>) {
        let mut l = self.inner.lock();
        if l.n as usize >= LOGSIZE || l.n >= l.size - 1 {
            panic!("too big a transaction");
        }
        if l.outstanding < 1 {
            panic!("log write outside of transaction");
        }

        let mut absorbed = false;
        for i in 0..l.n as usize {
            if l.block[i] == b.blockno {
                absorbed = true; // already in this transaction
                break;
            }
        }
        if !absorbed {
            let n = l.n as usize;
            l.block[n] = b.blockno;
            l.n += 1;
            cache.bpin(b);
        }
        cache.mark_dirty(b.idx);
    }

    fn snapshot(&self) -> (u32, u32, u32, [u32; LOGSIZE]) {
        let l = self.inner.lock();
        (l.dev, l.start, l.n, l.block)
    }

    fn commit<D: BlockDevice>(&self, cache: &BufCache<D>) {
        let (dev, start, n, block) = self.snapshot();
        if n == 0 {
            return;
        }

        self.write_log(cache, dev, start, n, &block); // stage blocks into the log body
        if self.crash_stage.load(Ordering::Relaxed) == 2 {
            return; // body on disk, but no commit record: transaction aborts
        }

        self.write_head(cache, dev, start, n, &block); // the real commit point
        if self.crash_stage.load(Ordering::Relaxed) == 1 {
            return; // committed; recovery must redo it
        }

        self.install_trans(cache, dev, start, n, &block, false);
        self.inner.lock().n = 0;
        self.write_head(cache, dev, start, 0, &block); // erase the transaction
    }

    // Copy modified blocks from cache to the log body.
    fn write_log<D: BlockDevice>(
        &self,
        cache: &BufCache<D>,
        dev: u32,
        start: u32,
        n: u32,
        block: &[u32; LOGSIZE],
    ) {
        for tail in 0..n as usize {
            let from = cache.bread(dev, block[tail]); // cache block
            let mut to = cache.bread(dev, start + tail as u32 + 1); // log slot
            to.bytes.copy_from_slice(&from.bytes);
            cache.bwrite(&to);
        }
    }

    // Write the in-memory log header to disk. This is the true point at
    // which the current transaction commits.
    fn write_head<D: BlockDevice>(
        &self,
        cache: &BufCache<D>,
        dev: u32,
        start: u32,
        n: u32,
        block: &[u32; LOGSIZE],
    ) {
        let mut buf = cache.bread(dev, start);
        buf.bytes[0..4].copy_from_slice(&n.to_le_bytes());
        for i in 0..LOGSIZE {
            let off = 4 + 4 * i;
            buf.bytes[off..off + 4].copy_from_slice(&block[i].to_le_bytes());
        }
        cache.bwrite(&buf);
    }

    fn read_head<D: BlockDevice>(&self, cache: &BufCache<D>, dev: u32, start: u32) -> (u32, [u32; LOGSIZE]) {
        let buf = cache.bread(dev, start);
        let mut four = [0u8; 4];
        four.copy_from_slice(&buf.bytes[0..4]);
        let n = u32::from_le_bytes(four).min(LOGSIZE as u32);
        let mut block = [0u32; LOGSIZE];
        for i in 0..LOGSIZE {
            let off = 4 + 4 * i;
            four.copy_from_slice(&buf.bytes[off..off + 4]);
            block[i] = u32::from_le_bytes(four);
        }
        (n, block)
    }

    // Copy committed blocks from the log body to their home locations.
    fn install_trans<D: BlockDevice>(
        &self,
        cache: &BufCache<D>,
        dev: u32,
        start: u32,
        n: u32,
        block: &[u32; LOGSIZE],
        recovering: bool,
    ) {
        for tail in 0..n as usize {
            let lbuf = cache.bread(dev, start + tail as u32 + 1); // log slot
            let mut dbuf = cache.bread(dev, block[tail]); // home block
            dbuf.bytes.copy_from_slice(&lbuf.bytes);
            cache.bwrite(&dbuf);
            if !recovering {
                cache.bunpin(&dbuf);
            }
        }
    }

    /// Replay the on-disk log. Called at boot, and by the recover_log test
    /// syscall after an injected crash. Afterwards the disk reflects
    /// exactly the committed transactions.
    pub fn recover<D: BlockDevice>(&self, cache: &BufCache<D>) {
        let (dev, start) = {
            let l = self.inner.lock();
            (l.dev, l.start)
        };
        let (n, block) = self.read_head(cache, dev, start);
        if n > 0 {
            log::info!("log: recovering {} blocks", n);
        }
        self.install_trans(cache, dev, start, n, &block, true);
        self.inner.lock().n = 0;
        self.write_head(cache, dev, start, 0, &block); // clear the log
    }

    pub fn set_crash_stage(&self, stage: i32) {
        self.crash_stage.store(stage, Ordering::Relaxed);
    }

    pub fn crash_stage(&self) -> i32 {
        self.crash_stage.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn logged_blocks(&self) -> u32 {
        self.inner.lock().n
    }
}

impl Default for Log {
    fn default() -> Log {
        Log::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::testdev::MemDisk;
    use crate::fs::BSIZE;

    const DEV: u32 = 1;
    const LOGSTART: u32 = 2;
    const DATA: u32 = 40;

    fn setup() -> (Box<BufCache<MemDisk>>, Log) {
        let cache = Box::new(BufCache::new(MemDisk::new(64)));
        let log = Log::new();
        let sb = SuperBlock {
            logstart: LOGSTART,
            nlog: LOGSIZE as u32,
            ..Default::default()
        };
        log.init(&cache, DEV, &sb);
        (cache, log)
    }

    fn put(cache: &BufCache<MemDisk>, log: &Log, blockno: u32, fill: u8) {
        let mut b = cache.bread(DEV, blockno);
        b.bytes.fill(fill);
        log.write(cache, &b);
    }

    fn on_disk_byte(cache: &BufCache<MemDisk>, blockno: u32) -> u8 {
        let mut raw = [0u8; BSIZE];
        cache.device().raw_read(blockno, &mut raw);
        raw[0]
    }

    #[test]
    fn commit_installs_home_blocks() {
        let (cache, log) = setup();
        log.begin_transaction();
        put(&cache, &log, DATA, 0x11);
        put(&cache, &log, DATA + 1, 0x22);
        // nothing reaches the home blocks before commit
        assert_eq!(on_disk_byte(&cache, DATA), 0);
        log.end_transaction(&*cache);

        assert_eq!(on_disk_byte(&cache, DATA), 0x11);
        assert_eq!(on_disk_byte(&cache, DATA + 1), 0x22);
        // log header is empty again
        assert_eq!(on_disk_byte(&cache, LOGSTART), 0);
        // and nothing stays pinned
        assert_eq!(cache.buffers_in_use(), 0);
    }

    #[test]
    fn absorption_takes_one_slot() {
        let (cache, log) = setup();
        log.begin_transaction();
        for i in 0..5 {
            put(&cache, &log, DATA, 0x30 + i);
        }
        assert_eq!(log.logged_blocks(), 1);
        log.end_transaction(&*cache);
        assert_eq!(on_disk_byte(&cache, DATA), 0x34); // last write wins
    }

    #[test]
    fn group_commit_waits_for_last_writer() {
        let (cache, log) = setup();
        log.begin_transaction();
        log.begin_transaction(); // two concurrent FS ops
        put(&cache, &log, DATA, 0x55);
        log.end_transaction(&*cache);
        // first end: still one writer outstanding, so no commit yet
        assert_eq!(on_disk_byte(&cache, DATA), 0);
        log.end_transaction(&*cache);
        assert_eq!(on_disk_byte(&cache, DATA), 0x55);
    }

    #[test]
    fn crash_before_commit_point_aborts() {
        let (cache, log) = setup();
        log.set_crash_stage(2);
        log.begin_transaction();
        put(&cache, &log, DATA, 0x66);
        log.end_transaction(&*cache);
        log.set_crash_stage(0);

        cache.clear_cache();
        log.recover(&*cache);
        // the header never went out; the write must not survive
        assert_eq!(on_disk_byte(&cache, DATA), 0);
    }

    #[test]
    fn crash_after_commit_point_redoes() {
        let (cache, log) = setup();
        log.set_crash_stage(1);
        log.begin_transaction();
        put(&cache, &log, DATA, 0x77);
        log.end_transaction(&*cache);
        log.set_crash_stage(0);
        // home block untouched so far; the commit record is on disk
        assert_eq!(on_disk_byte(&cache, DATA), 0);

        cache.clear_cache();
        log.recover(&*cache);
        assert_eq!(on_disk_byte(&cache, DATA), 0x77);
        assert_eq!(on_disk_byte(&cache, LOGSTART), 0);
    }

    #[test]
    #[should_panic(expected = "outside of transaction")]
    fn write_outside_transaction_panics() {
        let (cache, log) = setup();
        put(&cache, &log, DATA, 0x01);
    }
}
