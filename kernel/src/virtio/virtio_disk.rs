//! Driver for qemu's virtio disk device, polled.
//!
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0
//!
//! Each request is a chain of three descriptors: the request header, the
//! 4096-byte data buffer, and a one-byte status the device fills in.
//! Completion is awaited by busy-polling the used ring, which is fine on
//! qemu where the virtual disk completes immediately.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::bio::BlockDevice;
use crate::buf::BufData;
use crate::fs::BSIZE;
use crate::kalloc::Kmem;
use crate::memlayout::VIRTIO0;
use crate::riscv::PGSIZE;
use crate::spinlock::SpinLock;
use crate::virtio::*;

fn read_reg(r: usize) -> u32 {
    unsafe { ((VIRTIO0 + r) as *const u32).read_volatile() }
}

fn write_reg(r: usize, v: u32) {
    unsafe { ((VIRTIO0 + r) as *mut u32).write_volatile(v) }
}

struct DiskInner {
    // a page of DMA descriptors, with which the driver tells the device
    // where to read and write individual disk operations; most commands
    // are a chain of a few of these.
    desc: *mut VirtqDesc,
    // a ring in which the driver writes descriptor numbers that it would
    // like the device to process (only chain heads).
    avail: *mut VirtqAvail,
    // a ring where the device writes descriptor numbers that it has
    // finished processing.
    used: *mut VirtqUsed,

    // our own book-keeping.
    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // we've looked this far in used->ring

    // the status byte the device writes for the in-flight request,
    // indexed by head descriptor.
    status: [u8; NUM],

    // request headers, one-for-one with descriptors.
    ops: [VirtioBlkReq; NUM],
}

unsafe impl Send for DiskInner {}

pub struct VirtioDisk {
    inner: SpinLock<DiskInner>,
}

impl VirtioDisk {
    pub const fn new() -> VirtioDisk {
        VirtioDisk {
            inner: SpinLock::new(
                "virtio_disk",
                DiskInner {
                    desc: ptr::null_mut(),
                    avail: ptr::null_mut(),
                    used: ptr::null_mut(),
                    free: [true; NUM],
                    used_idx: 0,
                    status: [0; NUM],
                    ops: [VirtioBlkReq {
                        typ: 0,
                        reserved: 0,
                        sector: 0,
                    }; NUM],
                },
            ),
        }
    }

    /// Probe and reset the device, negotiate features, and hand it the
    /// three queue pages.
    pub fn init(&self, kmem: &Kmem) {
        if read_reg(VIRTIO_MMIO_MAGIC_VALUE) != 0x7472_6976
            || !(1..=2).contains(&read_reg(VIRTIO_MMIO_VERSION))
            || read_reg(VIRTIO_MMIO_DEVICE_ID) != 2
            || read_reg(VIRTIO_MMIO_VENDOR_ID) != 0x554d_4551
        {
            panic!("could not find virtio disk");
        }

        let mut status: u32 = 0;

        // reset device
        write_reg(VIRTIO_MMIO_STATUS, status);

        status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
        write_reg(VIRTIO_MMIO_STATUS, status);

        status |= VIRTIO_CONFIG_S_DRIVER;
        write_reg(VIRTIO_MMIO_STATUS, status);

        // negotiate features
        let mut features = read_reg(VIRTIO_MMIO_DEVICE_FEATURES);
        features &= !(1 << VIRTIO_BLK_F_RO);
        features &= !(1 << VIRTIO_BLK_F_SCSI);
        features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
        features &= !(1 << VIRTIO_BLK_F_MQ);
        features &= !(1 << VIRTIO_F_ANY_LAYOUT);
        features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
        features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
        write_reg(VIRTIO_MMIO_DRIVER_FEATURES, features);

        // tell device that feature negotiation is complete.
        status |= VIRTIO_CONFIG_S_FEATURES_OK;
        write_reg(VIRTIO_MMIO_STATUS, status);

        // re-read status to ensure FEATURES_OK is set.
        if read_reg(VIRTIO_MMIO_STATUS) & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
            panic!("virtio disk FEATURES_OK unset");
        }

        // initialize queue 0.
        write_reg(VIRTIO_MMIO_QUEUE_SEL, 0);
        if read_reg(VIRTIO_MMIO_QUEUE_READY) != 0 {
            panic!("virtio disk should not be ready");
        }

        let max = read_reg(VIRTIO_MMIO_QUEUE_NUM_MAX);
        if max == 0 {
            panic!("virtio disk has no queue 0");
        }
        if (max as usize) < NUM {
            panic!("virtio disk max queue too short");
        }

        // allocate and zero the queue memory: three separate pages.
        let mut inner = self.inner.lock();
        inner.desc = kmem.alloc_page().expect("virtio: kalloc").as_ptr() as *mut VirtqDesc;
        inner.avail = kmem.alloc_page().expect("virtio: kalloc").as_ptr() as *mut VirtqAvail;
        inner.used = kmem.alloc_page().expect("virtio: kalloc").as_ptr() as *mut VirtqUsed;

        write_reg(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

        // write physical addresses.
        let desc = inner.desc as usize as u64;
        let avail = inner.avail as usize as u64;
        let used = inner.used as usize as u64;
        write_reg(VIRTIO_MMIO_QUEUE_DESC_LOW, desc as u32);
        write_reg(VIRTIO_MMIO_QUEUE_DESC_HIGH, (desc >> 32) as u32);
        write_reg(VIRTIO_MMIO_DRIVER_DESC_LOW, avail as u32);
        write_reg(VIRTIO_MMIO_DRIVER_DESC_HIGH, (avail >> 32) as u32);
        write_reg(VIRTIO_MMIO_DEVICE_DESC_LOW, used as u32);
        write_reg(VIRTIO_MMIO_DEVICE_DESC_HIGH, (used >> 32) as u32);

        // queue is ready.
        write_reg(VIRTIO_MMIO_QUEUE_READY, 1);

        // tell device we're completely ready.
        status |= VIRTIO_CONFIG_S_DRIVER_OK;
        write_reg(VIRTIO_MMIO_STATUS, status);

        assert!(PGSIZE >= core::mem::size_of::<VirtqDesc>() * NUM);
    }

    fn rw(&self, blockno: u32, data: *mut u8, write: bool) {
        let mut inner = self.inner.lock();

        let sector = blockno as u64 * (BSIZE / 512) as u64;

        // the spec's block-device section says: allocate the three
        // descriptors, fill the header, chain them head -> data -> status.
        let idx = loop {
            match alloc3_desc(&mut inner) {
                Some(idx) => break idx,
                // single outstanding request at a time means this only
                // spins while another CPU path holds descriptors.
                None => core::hint::spin_loop(),
            }
        };

        let buf0 = &mut inner.ops[idx[0]] as *mut VirtioBlkReq;
        inner.ops[idx[0]] = VirtioBlkReq {
            typ: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        };

        unsafe {
            let desc = inner.desc;

            (*desc.add(idx[0])) = VirtqDesc {
                addr: buf0 as usize as u64,
                len: core::mem::size_of::<VirtioBlkReq>() as u32,
                flags: VRING_DESC_F_NEXT,
                next: idx[1] as u16,
            };

            (*desc.add(idx[1])) = VirtqDesc {
                addr: data as usize as u64,
                len: BSIZE as u32,
                // device writes the buffer on a read, reads it on a write.
                flags: if write { 0 } else { VRING_DESC_F_WRITE } | VRING_DESC_F_NEXT,
                next: idx[2] as u16,
            };

            inner.status[idx[0]] = 0xff; // device writes 0 on success
            let status_ptr = &mut inner.status[idx[0]] as *mut u8;
            (*desc.add(idx[2])) = VirtqDesc {
                addr: status_ptr as usize as u64,
                len: 1,
                flags: VRING_DESC_F_WRITE,
                next: 0,
            };

            // publish the chain head in the avail ring.
            let avail = inner.avail;
            let i = (*avail).idx as usize % NUM;
            (*avail).ring[i] = idx[0] as u16;
            fence(Ordering::SeqCst);
            (*avail).idx = (*avail).idx.wrapping_add(1);
            fence(Ordering::SeqCst);

            write_reg(VIRTIO_MMIO_QUEUE_NOTIFY, 0); // value is queue number

            // busy-wait for the device to finish.
            let used = inner.used;
            while inner.used_idx == ptr::addr_of!((*used).idx).read_volatile() {
                core::hint::spin_loop();
            }
            fence(Ordering::SeqCst);

            let id = (*used).ring[inner.used_idx as usize % NUM].id as usize;
            if id != idx[0] {
                panic!("virtio_disk_rw: unexpected completion");
            }
            if inner.status[id] != 0 {
                panic!("virtio_disk_rw: status");
            }
            inner.used_idx = inner.used_idx.wrapping_add(1);
        }

        free_chain(&mut inner, idx[0]);
    }
}

// find a free descriptor, mark it non-free.
fn alloc_desc(inner: &mut DiskInner) -> Option<usize> {
    for i in 0..NUM {
        if inner.free[i] {
            inner.free[i] = false;
            return Some(i);
        }
    }
    None
}

fn free_desc(inner: &mut DiskInner, i: usize) {
    if i >= NUM {
        panic!("free_desc: index");
    }
    if inner.free[i] {
        panic!("free_desc: double free");
    }
    unsafe {
        *inner.desc.add(i) = VirtqDesc {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        };
    }
    inner.free[i] = true;
}

// free a chain of descriptors.
fn free_chain(inner: &mut DiskInner, mut i: usize) {
    loop {
        let (flags, next) = unsafe {
            let d = &*inner.desc.add(i);
            (d.flags, d.next)
        };
        free_desc(inner, i);
        if flags & VRING_DESC_F_NEXT != 0 {
            i = next as usize;
        } else {
            break;
        }
    }
}

// allocate three descriptors (they need not be contiguous); disk requests
// always use three.
fn alloc3_desc(inner: &mut DiskInner) -> Option<[usize; 3]> {
    let mut idx = [0usize; 3];
    for k in 0..3 {
        match alloc_desc(inner) {
            Some(i) => idx[k] = i,
            None => {
                for j in &idx[..k] {
                    free_desc(inner, *j);
                }
                return None;
            }
        }
    }
    Some(idx)
}

impl BlockDevice for VirtioDisk {
    fn read_block(&self, blockno: u32, data: &mut BufData) {
        self.rw(blockno, data.bytes.as_mut_ptr(), false);
    }

    fn write_block(&self, blockno: u32, data: &BufData) {
        self.rw(blockno, data.bytes.as_ptr() as *mut u8, true);
    }
}

impl Default for VirtioDisk {
    fn default() -> VirtioDisk {
        VirtioDisk::new()
    }
}
