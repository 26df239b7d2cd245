//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also provides
//! a synchronization point for disk blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call bread.
//! * After changing buffer data, call bwrite to write it to disk.
//! * Dropping the buffer releases it (brelse); do not hold buffers longer
//!   than necessary, only one process at a time can use one.
//!
//! Lookups go through a hash table keyed on (dev, blockno); replacement
//! takes the least-recently-released buffer with refcnt 0. When every
//! buffer is in use, bget waits for one to be released instead of giving
//! up. Both structures are arena-index lists over the fixed buffer array,
//! guarded by one spin lock; the block data itself is guarded by a
//! per-buffer sleep lock.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::buf::BufData;
use crate::param::{NBUF, NBUCKET};
use crate::proc::sleep;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// The device below the cache: 4096-byte blocks, addressed by block number.
pub trait BlockDevice: Sync {
    fn read_block(&self, blockno: u32, data: &mut BufData);
    fn write_block(&self, blockno: u32, data: &BufData);
}

const NIL: u16 = u16::MAX;
const HEAD: usize = NBUF; // LRU list sentinel slot

struct CacheCtrl {
    dev: [u32; NBUF],
    blockno: [u32; NBUF],
    refcnt: [u32; NBUF],
    // LRU ring over slot indices with a sentinel at HEAD:
    // head.next is most recently released, head.prev least.
    prev: [u16; NBUF + 1],
    next: [u16; NBUF + 1],
    // hash buckets, chained through hash_next
    hash: [u16; NBUCKET],
    hash_next: [u16; NBUF],
}

impl CacheCtrl {
    const fn new() -> CacheCtrl {
        let mut c = CacheCtrl {
            dev: [0; NBUF],
            blockno: [0; NBUF],
            refcnt: [0; NBUF],
            prev: [0; NBUF + 1],
            next: [0; NBUF + 1],
            hash: [NIL; NBUCKET],
            hash_next: [NIL; NBUF],
        };
        c.prev[HEAD] = HEAD as u16;
        c.next[HEAD] = HEAD as u16;
        let mut i = 0;
        while i < NBUF {
            // splice each buffer in just after the sentinel
            c.next[i] = c.next[HEAD];
            c.prev[i] = HEAD as u16;
            c.prev[c.next[i] as usize] = i as u16;
            c.next[HEAD] = i as u16;
            i += 1;
        }
        c
    }

    fn bucket(dev: u32, blockno: u32) -> usize {
        ((dev ^ blockno) as usize) % NBUCKET
    }

    fn hash_insert(&mut self, i: usize) {
        let b = Self::bucket(self.dev[i], self.blockno[i]);
        self.hash_next[i] = self.hash[b];
        self.hash[b] = i as u16;
    }

    fn hash_remove(&mut self, i: usize) {
        let b = Self::bucket(self.dev[i], self.blockno[i]);
        let mut p = self.hash[b];
        if p == i as u16 {
            self.hash[b] = self.hash_next[i];
            self.hash_next[i] = NIL;
            return;
        }
        while p != NIL {
            if self.hash_next[p as usize] == i as u16 {
                self.hash_next[p as usize] = self.hash_next[i];
                self.hash_next[i] = NIL;
                return;
            }
            p = self.hash_next[p as usize];
        }
    }

    fn lru_unlink(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p as usize] = n;
        self.prev[n as usize] = p;
    }

    fn lru_push_front(&mut self, i: usize) {
        self.next[i] = self.next[HEAD];
        self.prev[i] = HEAD as u16;
        self.prev[self.next[i] as usize] = i as u16;
        self.next[HEAD] = i as u16;
    }
}

struct BufSlot {
    valid: AtomicBool, // has data been read from disk?
    dirty: AtomicBool, // modified since last written?
    data: SleepLock<BufData>,
}

impl BufSlot {
    const INIT: BufSlot = BufSlot {
        valid: AtomicBool::new(false),
        dirty: AtomicBool::new(false),
        data: SleepLock::new("buffer", BufData::zeroed()),
    };
}

pub struct BufCache<D> {
    device: D,
    ctrl: SpinLock<CacheCtrl>,
    slots: [BufSlot; NBUF],
}

/// A locked, referenced cache buffer; releasing (brelse) happens on drop.
pub struct Buf<'a, D: BlockDevice> {
    cache: &'a BufCache<D>,
    pub(crate) idx: usize,
    pub dev: u32,
    pub blockno: u32,
    guard: Option<SleepLockGuard<'a, BufData>>,
}

impl<D: BlockDevice> BufCache<D> {
    pub const fn new(device: D) -> BufCache<D> {
        BufCache {
            device,
            ctrl: SpinLock::new("bcache", CacheCtrl::new()),
            slots: [BufSlot::INIT; NBUF],
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn chan(&self) -> usize {
        &self.ctrl as *const _ as usize
    }

    // Look through the buffer cache for block blockno on device dev.
    // If not found, recycle the least recently used free buffer.
    // In either case, return a locked buffer.
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut ctrl = self.ctrl.lock();
        loop {
            // Is the block already cached?
            let mut i = ctrl.hash[CacheCtrl::bucket(dev, blockno)];
            while i != NIL {
                let s = i as usize;
                if ctrl.dev[s] == dev && ctrl.blockno[s] == blockno {
                    ctrl.refcnt[s] += 1;
                    drop(ctrl);
                    let guard = self.slots[s].data.lock();
                    return Buf {
                        cache: self,
                        idx: s,
                        dev,
                        blockno,
                        guard: Some(guard),
                    };
                }
                i = ctrl.hash_next[s];
            }

            // Not cached. Recycle the least recently used unreferenced
            // buffer, scanning the LRU ring from the tail.
            let mut i = ctrl.prev[HEAD];
            while i != HEAD as u16 {
                let s = i as usize;
                if ctrl.refcnt[s] == 0 {
                    ctrl.hash_remove(s);
                    ctrl.dev[s] = dev;
                    ctrl.blockno[s] = blockno;
                    ctrl.refcnt[s] = 1;
                    ctrl.hash_insert(s);
                    self.slots[s].valid.store(false, Ordering::Relaxed);
                    self.slots[s].dirty.store(false, Ordering::Relaxed);
                    drop(ctrl);
                    let guard = self.slots[s].data.lock();
                    return Buf {
                        cache: self,
                        idx: s,
                        dev,
                        blockno,
                        guard: Some(guard),
                    };
                }
                i = ctrl.prev[s];
            }

            // Every buffer is referenced. Wait for a release; the working
            // set is expected to fit, so this is rare.
            ctrl = sleep(self.chan(), ctrl);
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        if !self.slots[b.idx].valid.load(Ordering::Acquire) {
            self.device.read_block(blockno, &mut b);
            self.slots[b.idx].valid.store(true, Ordering::Release);
        }
        b
    }

    /// Write a buffer's contents through to the device.
    pub fn bwrite(&self, b: &Buf<'_, D>) {
        self.device.write_block(b.blockno, b);
        self.slots[b.idx].dirty.store(false, Ordering::Relaxed);
    }

    /// Pin a buffer against recycling for the log.
    pub fn bpin(&self, b: &Buf<'_, D>) {
        let mut ctrl = self.ctrl.lock();
        ctrl.refcnt[b.idx] += 1;
    }

    pub fn bunpin(&self, b: &Buf<'_, D>) {
        let mut ctrl = self.ctrl.lock();
        if ctrl.refcnt[b.idx] == 0 {
            panic!("bunpin");
        }
        ctrl.refcnt[b.idx] -= 1;
    }

    /// Forget everything cached without writing it back. Test hook for the
    /// crash-recovery scenarios; real data loss by design.
    pub fn clear_cache(&self) {
        let mut ctrl = self.ctrl.lock();
        for s in 0..NBUF {
            ctrl.refcnt[s] = 0;
            self.slots[s].valid.store(false, Ordering::Relaxed);
            self.slots[s].dirty.store(false, Ordering::Relaxed);
        }
        drop(ctrl);
        crate::proc::wakeup(self.chan());
    }

    pub(crate) fn mark_dirty(&self, idx: usize) {
        self.slots[idx].dirty.store(true, Ordering::Relaxed);
    }

    /// How many buffers currently carry a reference. Diagnostics/tests.
    pub fn buffers_in_use(&self) -> usize {
        let ctrl = self.ctrl.lock();
        (0..NBUF).filter(|&i| ctrl.refcnt[i] > 0).count()
    }

    fn brelse(&self, idx: usize) {
        let mut ctrl = self.ctrl.lock();
        if ctrl.refcnt[idx] == 0 {
            panic!("brelse");
        }
        ctrl.refcnt[idx] -= 1;
        if ctrl.refcnt[idx] == 0 {
            // no one is waiting for it; most-recently-released position.
            ctrl.lru_unlink(idx);
            ctrl.lru_push_front(idx);
            drop(ctrl);
            crate::proc::wakeup(self.chan());
        }
    }
}

impl<D: BlockDevice> Deref for Buf<'_, D> {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.guard.as_ref().unwrap()
    }
}

impl<D: BlockDevice> DerefMut for Buf<'_, D> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.guard.as_mut().unwrap()
    }
}

impl<D: BlockDevice> Drop for Buf<'_, D> {
    fn drop(&mut self) {
        // release the sleep lock before giving up the reference.
        self.guard.take();
        self.cache.brelse(self.idx);
    }
}

/// An in-memory block device for the test suites.
#[cfg(test)]
pub(crate) mod testdev {
    use super::*;
    use crate::fs::BSIZE;
    use std::sync::Mutex;

    pub(crate) struct MemDisk {
        blocks: Mutex<Vec<u8>>,
    }

    impl MemDisk {
        pub(crate) fn new(nblocks: usize) -> MemDisk {
            MemDisk {
                blocks: Mutex::new(vec![0; nblocks * BSIZE]),
            }
        }

        pub(crate) fn raw_read(&self, blockno: u32, out: &mut [u8; BSIZE]) {
            let b = self.blocks.lock().unwrap();
            let off = blockno as usize * BSIZE;
            out.copy_from_slice(&b[off..off + BSIZE]);
        }

        pub(crate) fn raw_write(&self, blockno: u32, data: &[u8; BSIZE]) {
            let mut b = self.blocks.lock().unwrap();
            let off = blockno as usize * BSIZE;
            b[off..off + BSIZE].copy_from_slice(data);
        }
    }

    impl BlockDevice for MemDisk {
        fn read_block(&self, blockno: u32, data: &mut BufData) {
            self.raw_read(blockno, &mut data.bytes);
        }

        fn write_block(&self, blockno: u32, data: &BufData) {
            self.raw_write(blockno, &data.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testdev::MemDisk;
    use super::*;

    fn cache(nblocks: usize) -> Box<BufCache<MemDisk>> {
        Box::new(BufCache::new(MemDisk::new(nblocks)))
    }

    #[test]
    fn read_miss_hits_device_once() {
        let c = cache(8);
        c.device().raw_write(3, &{
            let mut b = [0u8; crate::fs::BSIZE];
            b[0] = 0x5a;
            b
        });

        let b = c.bread(1, 3);
        assert_eq!(b.bytes[0], 0x5a);
        drop(b);

        // second read is served from the cache even after the device block
        // changes underneath.
        c.device().raw_write(3, &[0u8; crate::fs::BSIZE]);
        let b = c.bread(1, 3);
        assert_eq!(b.bytes[0], 0x5a);
    }

    #[test]
    fn bwrite_reaches_device() {
        let c = cache(8);
        {
            let mut b = c.bread(1, 2);
            b.bytes[7] = 0x77;
            c.bwrite(&b);
        }
        let mut out = [0u8; crate::fs::BSIZE];
        c.device().raw_read(2, &mut out);
        assert_eq!(out[7], 0x77);
    }

    #[test]
    fn single_mapping_per_block() {
        // Re-reading the same (dev, blockno) uses the same slot; different
        // blocks use different slots.
        let c = cache(8);
        let a = c.bread(1, 4);
        let ia = a.idx;
        drop(a);
        let b = c.bread(1, 4);
        assert_eq!(b.idx, ia);
        let other = c.bread(1, 5);
        assert_ne!(other.idx, ia);
    }

    #[test]
    fn recycling_prefers_lru() {
        let c = cache(2 * NBUF);
        // touch more blocks than there are buffers; all must be readable
        for bn in 0..(NBUF as u32 + 8) {
            let mut b = c.bread(1, bn);
            b.bytes[0] = bn as u8;
            c.bwrite(&b);
        }
        for bn in 0..(NBUF as u32 + 8) {
            let b = c.bread(1, bn);
            assert_eq!(b.bytes[0], bn as u8);
        }
    }

    #[test]
    fn clear_cache_drops_contents() {
        let c = cache(8);
        {
            let mut b = c.bread(1, 6);
            b.bytes[0] = 9; // modified but never written through
        }
        c.clear_cache();
        let b = c.bread(1, 6);
        assert_eq!(b.bytes[0], 0); // re-read from device
    }
}
