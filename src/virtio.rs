//! Driver for qemu's virtio disk device.
//! Uses qemu's mmio interface to virtio; qemu presents a "legacy" virtio
//! interface.
//!
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0

use core::mem;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    addr::{PGSHIFT, PGSIZE},
    bio::{Buf, BufInner},
    lock::Sleepablelock,
    memlayout::VIRTIO0,
    param::BSIZE,
    proc::WaitChannel,
};

/// This many virtio descriptors. Must be a power of two.
const NUM: usize = 8;

/// Memory mapped IO registers, starting at VIRTIO0.
/// From qemu's virtio_mmio.h.
#[repr(usize)]
enum MmioRegs {
    /// 0x74726976
    MagicValue = 0x000,
    /// version; 1 is legacy
    Version = 0x004,
    /// device type; 1 is net, 2 is disk
    DeviceId = 0x008,
    /// 0x554d4551
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// page size for PFN, write-only
    GuestPageSize = 0x028,
    /// select queue, write-only
    QueueSel = 0x030,
    /// max size of current queue, read-only
    QueueNumMax = 0x034,
    /// size of current queue, write-only
    QueueNum = 0x038,
    /// physical page number for queue, read/write
    QueuePfn = 0x040,
    /// write-only
    QueueNotify = 0x050,
    /// read-only
    InterruptStatus = 0x060,
    /// write-only
    InterruptAck = 0x064,
    /// read/write
    Status = 0x070,
}

impl MmioRegs {
    fn read(self) -> u32 {
        // SAFETY: the register is mapped at a fixed offset from VIRTIO0,
        // four-byte aligned, and volatile concurrent access is intended.
        unsafe { ptr::read_volatile((VIRTIO0 as *mut u8).add(self as usize) as _) }
    }

    /// # Safety
    ///
    /// Writing memory-mapped registers causes hardware side effects: after
    /// a write to `QueueNotify`, the device reads and writes the addresses
    /// placed in the queue's descriptors.
    unsafe fn write(self, v: u32) {
        unsafe { ptr::write_volatile((VIRTIO0 as *mut u8).add(self as usize) as _, v) }
    }
}

bitflags! {
    struct VirtioStatus: u32 {
        const ACKNOWLEDGE = 0b0001;
        const DRIVER = 0b0010;
        const DRIVER_OK = 0b0100;
        const FEATURES_OK = 0b1000;
    }
}

bitflags! {
    /// Device feature bits.
    struct VirtioFeatures: u32 {
        /// Disk is read-only.
        const BLK_F_RO = 1 << 5;

        /// Supports scsi command passthru.
        const BLK_F_SCSI = 1 << 7;

        /// Writeback mode available in config.
        const BLK_F_CONFIG_WCE = 1 << 11;

        /// Support more than one vq.
        const BLK_F_MQ = 1 << 12;

        const F_ANY_LAYOUT = 1 << 27;
        const RING_F_INDIRECT_DESC = 1 << 28;
        const RING_F_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    struct VirtqDescFlags: u16 {
        const FREED = 0b00;

        /// chained with another descriptor
        const NEXT = 0b01;

        /// device writes (vs read)
        const WRITE = 0b10;
    }
}

/// A single descriptor, from the virtio spec.
// repr(C) because the device reads it.
#[repr(C)]
#[derive(Copy, Clone)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: VirtqDescFlags,
    next: u16,
}

impl VirtqDesc {
    const fn zero() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: VirtqDescFlags::FREED,
            next: 0,
        }
    }
}

/// The (entire) avail ring, from the virtio spec: the driver writes the
/// descriptor numbers it wants the device to process here.
#[repr(C)]
struct VirtqAvail {
    /// always zero
    flags: u16,

    /// driver will write ring[idx] next
    idx: u16,

    /// descriptor numbers of chain heads
    ring: [u16; NUM],

    unused: u16,
}

impl VirtqAvail {
    const fn zero() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [0; NUM],
            unused: 0,
        }
    }
}

/// An entry of the used ring, from the virtio spec.
#[repr(C)]
#[derive(Copy, Clone)]
struct VirtqUsedElem {
    /// index of start of completed descriptor chain
    id: u32,

    len: u32,
}

/// The used ring: the device writes the chain heads it has finished here.
/// The legacy interface wants it on a page of its own.
#[repr(C, align(4096))]
struct VirtqUsed {
    /// always zero
    flags: u16,

    /// device increments when it adds a ring[] entry
    idx: u16,

    ring: [VirtqUsedElem; NUM],
}

impl VirtqUsed {
    const fn zero() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [VirtqUsedElem { id: 0, len: 0 }; NUM],
        }
    }
}

/// The format of the first descriptor in a disk request. Followed by one
/// descriptor for the block data, and one for a one-byte status result.
// repr(C) because the device reads it.
#[repr(C)]
#[derive(Copy, Clone)]
struct BlockRequestHeader {
    typ: u32,
    reserved: u32,
    sector: u64,
}

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

impl BlockRequestHeader {
    const fn zero() -> Self {
        Self {
            typ: 0,
            reserved: 0,
            sector: 0,
        }
    }

    fn new(write: bool, sector: u64) -> Self {
        Self {
            typ: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        }
    }
}

/// An in-flight request, for the completion interrupt. Indexed by the
/// first descriptor of the chain.
///
/// # Safety
///
/// While `inner` is non-null, it refers to the locked `BufInner` of a
/// requester sleeping on `wait`, and may be written under the disk lock.
#[derive(Copy, Clone)]
struct Inflight {
    inner: *mut BufInner,
    wait: *const WaitChannel,

    /// The device writes 0 here on success.
    status: u8,
}

impl Inflight {
    const fn zero() -> Self {
        Self {
            inner: ptr::null_mut(),
            wait: ptr::null(),
            status: 0,
        }
    }
}

/// The virtio disk: the queue memory the device walks, and the driver's
/// bookkeeping. The queue region must be page-aligned and physically
/// contiguous, which a static inside the kernel image is.
#[repr(C, align(4096))]
pub struct VirtioDisk {
    /// A set (not a ring) of DMA descriptors, with which the driver tells
    /// the device where to read and write individual disk operations.
    /// Most commands consist of a chain of a few of these.
    desc: [VirtqDesc; NUM],

    /// The driver writes the head descriptor of each chain it wants the
    /// device to process here.
    avail: VirtqAvail,

    /// The device writes the chains it has finished here.
    used: VirtqUsed,

    // Driver bookkeeping, carried behind the same lock.
    /// is a descriptor free?
    free: [bool; NUM],

    /// we've looked this far in used.ring.
    used_idx: u16,

    inflight: [Inflight; NUM],

    /// Disk command headers, one-for-one with descriptors.
    ops: [BlockRequestHeader; NUM],
}

// SAFETY: the raw pointers in `inflight` are only dereferenced under the
// disk lock, per the Inflight invariant.
unsafe impl Send for VirtioDisk {}

impl VirtioDisk {
    pub const fn new() -> Self {
        Self {
            desc: [VirtqDesc::zero(); NUM],
            avail: VirtqAvail::zero(),
            used: VirtqUsed::zero(),
            free: [true; NUM],
            used_idx: 0,
            inflight: [Inflight::zero(); NUM],
            ops: [BlockRequestHeader::zero(); NUM],
        }
    }

    /// Brings the device up and hands it queue 0.
    pub fn init(&mut self) {
        assert!(
            MmioRegs::MagicValue.read() == 0x74726976
                && MmioRegs::Version.read() == 1
                && MmioRegs::DeviceId.read() == 2
                && MmioRegs::VendorId.read() == 0x554d4551,
            "could not find virtio disk"
        );

        let mut status = VirtioStatus::ACKNOWLEDGE;
        // SAFETY: setting status bits does not trigger device DMA.
        unsafe { MmioRegs::Status.write(status.bits()) };
        status.insert(VirtioStatus::DRIVER);
        unsafe { MmioRegs::Status.write(status.bits()) };

        // Negotiate features.
        let features = VirtioFeatures::from_bits_truncate(MmioRegs::DeviceFeatures.read())
            - (VirtioFeatures::BLK_F_RO
                | VirtioFeatures::BLK_F_SCSI
                | VirtioFeatures::BLK_F_CONFIG_WCE
                | VirtioFeatures::BLK_F_MQ
                | VirtioFeatures::F_ANY_LAYOUT
                | VirtioFeatures::RING_F_EVENT_IDX
                | VirtioFeatures::RING_F_INDIRECT_DESC);
        unsafe { MmioRegs::DriverFeatures.write(features.bits()) };

        // Tell the device that feature negotiation is complete, and that
        // we're completely ready.
        status.insert(VirtioStatus::FEATURES_OK);
        unsafe { MmioRegs::Status.write(status.bits()) };
        status.insert(VirtioStatus::DRIVER_OK);
        unsafe { MmioRegs::Status.write(status.bits()) };

        unsafe { MmioRegs::GuestPageSize.write(PGSIZE as u32) };

        // Initialize queue 0.
        unsafe { MmioRegs::QueueSel.write(0) };
        let max = MmioRegs::QueueNumMax.read();
        assert!(max != 0, "virtio disk has no queue 0");
        assert!(max as usize >= NUM, "virtio disk max queue too short");
        unsafe { MmioRegs::QueueNum.write(NUM as u32) };
        // SAFETY: desc/avail/used are page-aligned and sized per the
        // legacy layout; handing their frame to the device is the point.
        unsafe { MmioRegs::QueuePfn.write((self.desc.as_ptr() as usize >> PGSHIFT) as u32) };

        // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
    }

    /// Finds a free descriptor, marks it non-free, returns its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        let idx = self.free.iter().position(|&f| f)?;
        self.free[idx] = false;
        Some(idx)
    }

    /// Allocates three descriptors (they need not be contiguous).
    /// Disk transfers always use three.
    fn alloc_three_descriptors(&mut self) -> Option<[usize; 3]> {
        let mut descs = ArrayVec::<usize, 3>::new();
        for _ in 0..3 {
            match self.alloc_desc() {
                Some(idx) => descs.push(idx),
                None => {
                    for idx in descs {
                        self.free_desc(idx);
                    }
                    return None;
                }
            }
        }
        descs.into_inner().ok()
    }

    fn free_desc(&mut self, idx: usize) {
        assert!(!self.free[idx], "free_desc");
        self.desc[idx] = VirtqDesc::zero();
        self.free[idx] = true;
    }
}

/// Reads or writes buffer `b`'s block. Sleeps until the device reports
/// completion. The caller holds the buffer's sleep lock, as witnessed by
/// `&mut Buf`.
pub fn disk_rw(disk: &Sleepablelock<VirtioDisk>, b: &mut Buf<'_>, write: bool) {
    let sector = b.blockno() as u64 * (BSIZE / 512) as u64;

    let mut guard = disk.lock();

    // The spec's Section 5.2 says that legacy block operations use three
    // descriptors: one for type/reserved/sector, one for the data, one for
    // a 1-byte status result.
    let desc = loop {
        match guard.alloc_three_descriptors() {
            Some(desc) => break desc,
            // Freeing descriptors wakes this channel up.
            None => guard.sleep(),
        }
    };

    // Format the three descriptors; qemu's virtio-blk.c reads them.
    let this = &mut *guard;

    this.ops[desc[0]] = BlockRequestHeader::new(write, sector);
    this.desc[desc[0]] = VirtqDesc {
        addr: &this.ops[desc[0]] as *const _ as u64,
        len: mem::size_of::<BlockRequestHeader>() as u32,
        flags: VirtqDescFlags::NEXT,
        next: desc[1] as u16,
    };

    // The device reads or writes the block data in place.
    this.desc[desc[1]] = VirtqDesc {
        addr: b.data.as_ptr() as u64,
        len: BSIZE as u32,
        flags: if write {
            VirtqDescFlags::NEXT
        } else {
            VirtqDescFlags::NEXT | VirtqDescFlags::WRITE
        },
        next: desc[2] as u16,
    };

    // The device writes 0 into the status byte on success.
    this.inflight[desc[0]].status = 0xff;
    this.desc[desc[2]] = VirtqDesc {
        addr: &this.inflight[desc[0]].status as *const _ as u64,
        len: 1,
        flags: VirtqDescFlags::WRITE,
        next: 0,
    };

    // Record the buffer for the completion interrupt.
    b.disk = true;
    this.inflight[desc[0]].inner = b.inner_raw();
    this.inflight[desc[0]].wait = b.wait_channel();

    // Tell the device the first index in our chain of descriptors.
    let ring_idx = this.avail.idx as usize % NUM;
    this.avail.ring[ring_idx] = desc[0] as u16;

    fence(Ordering::SeqCst);

    // Tell the device another avail ring entry is available.
    this.avail.idx = this.avail.idx.wrapping_add(1);

    fence(Ordering::SeqCst);

    // SAFETY: all three descriptors are fully formatted.
    unsafe { MmioRegs::QueueNotify.write(0) };

    // Wait for the interrupt handler to say the request has finished.
    // The handler writes `disk` through the recorded pointer; reads and
    // writes of it are serialized by the disk lock, which sleep releases
    // and reacquires.
    while b.disk {
        b.wait_channel().sleep(&mut guard);
    }

    guard.inflight[desc[0]].inner = ptr::null_mut();
    guard.inflight[desc[0]].wait = ptr::null();
    for idx in desc {
        guard.free_desc(idx);
    }
    // A requester may be waiting for free descriptors.
    guard.wakeup();
}

/// The disk interrupt handler: retires every finished request on the used
/// ring and wakes its requester.
pub fn disk_intr(disk: &Sleepablelock<VirtioDisk>) {
    let mut guard = disk.lock();

    // The device won't raise another interrupt until we tell it we've seen
    // this one. This may race with the device writing new entries to the
    // used ring; then we process those new completions here and have
    // nothing to do for the next interrupt, which is harmless.
    // SAFETY: acknowledging does not trigger DMA.
    unsafe { MmioRegs::InterruptAck.write(MmioRegs::InterruptStatus.read() & 0x3) };

    fence(Ordering::SeqCst);

    // The device increments used.idx when it adds an entry to the used
    // ring.
    while guard.used_idx != guard.used.idx {
        fence(Ordering::SeqCst);
        let id = guard.used.ring[guard.used_idx as usize % NUM].id as usize;

        assert_eq!(guard.inflight[id].status, 0, "disk_intr status");

        let inner = guard.inflight[id].inner;
        let wait = guard.inflight[id].wait;
        assert!(!inner.is_null(), "disk_intr");
        // SAFETY: per the Inflight invariant, the requester holds the
        // buffer's sleep lock and is sleeping; writes to `disk` are
        // serialized by the disk lock we hold.
        unsafe { (*inner).disk = false };
        // SAFETY: the requester sleeps on this channel; the channel lives
        // in the static buffer cache.
        unsafe { (*wait).wakeup() };

        guard.used_idx = guard.used_idx.wrapping_add(1);
    }
}
