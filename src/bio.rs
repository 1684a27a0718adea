//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also provides
//! a synchronization point for disk blocks used by multiple processes.
//!
//! The cache is partitioned into buckets hashed by block number, each with
//! its own lock, so that harts working on unrelated blocks do not contend.
//! A bucket that runs out of reusable buffers steals one from a peer, the
//! same way an empty CPU steals pages from a peer's freelist.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `get` (or
//!   `Kernel::bread` to get it with valid contents).
//! * After changing buffer data, call `Kernel::bwrite` to write it to disk.
//! * Dropping the `Buf` releases it.
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.

use core::cell::UnsafeCell;
use core::mem::{self, ManuallyDrop};
use core::ops::{Deref, DerefMut};

use array_macro::array;
use arrayvec::ArrayVec;

use crate::{
    lock::{Sleeplock, SleeplockGuard, Spinlock, SpinlockGuard},
    param::{BSIZE, NBUCKET, NBUF},
    proc::WaitChannel,
};

/// Identity and reference count of a buffer.
///
/// # Safety
///
/// Accessed only while holding the lock of the bucket whose list currently
/// contains this buffer (both locks, while a steal moves it).
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
        }
    }
}

// The data is assumed to be u32-aligned by the file system layer above.
#[repr(align(4))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// The part of a buffer protected by its sleep lock: the block contents and
/// the flags describing them.
pub struct BufInner {
    /// Has data been read from disk?
    pub valid: bool,

    /// Does the disk "own" the buffer for an in-flight request?
    pub disk: bool,

    pub data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            disk: false,
            data: BufData { inner: [0; BSIZE] },
        }
    }
}

struct BufEntry {
    meta: UnsafeCell<BufMeta>,

    /// WaitChannel saying the virtio request for this buffer is done.
    pub vdisk_request_waitchannel: WaitChannel,

    inner: Sleeplock<BufInner>,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            meta: UnsafeCell::new(BufMeta::new()),
            vdisk_request_waitchannel: WaitChannel::new(),
            inner: Sleeplock::new("buffer", BufInner::new()),
        }
    }
}

/// Each bucket is the list of the buffer indices it currently owns, most
/// recently used first. Reuse scans run from the tail, so the least
/// recently released buffer is evicted first.
type Bucket = ArrayVec<usize, NBUF>;

pub struct Bcache {
    buckets: [Spinlock<Bucket>; NBUCKET],
    bufs: [BufEntry; NBUF],
}

// SAFETY: every BufMeta is guarded by the lock of the bucket listing it,
// and every BufInner by its sleep lock.
unsafe impl Sync for Bcache {}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            buckets: array![_ => Spinlock::new("bcache", ArrayVec::new_const()); NBUCKET],
            bufs: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Places every buffer on bucket 0's list; the other buckets start
    /// empty and steal as needed.
    pub fn init(&self) {
        let mut bucket = self.buckets[0].lock();
        for i in 0..NBUF {
            bucket.push(i);
        }
    }

    const fn bucket_of(blockno: u32) -> usize {
        blockno as usize % NBUCKET
    }

    /// # Safety
    ///
    /// The lock of the bucket currently listing buffer `i` must be held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta(&self, i: usize) -> &mut BufMeta {
        unsafe { &mut *self.bufs[i].meta.get() }
    }

    /// Looks through the cache for block `blockno` on device `dev`. If not
    /// found, recycles a buffer, stealing one from another bucket when the
    /// home bucket has none free. In either case, returns the buffer with
    /// its sleep lock held.
    pub fn get(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let home = Self::bucket_of(blockno);

        {
            let bucket = self.buckets[home].lock();

            // Is the block already cached?
            if let Some(i) = self.scan(&bucket, dev, blockno) {
                // SAFETY: holding the home bucket's lock.
                unsafe { self.meta(i).refcnt += 1 };
                drop(bucket);
                return self.lock_buf(i, dev, blockno);
            }

            // Not cached. Recycle the least recently used unused buffer of
            // the home bucket.
            let free = bucket
                .iter()
                .copied()
                .rev()
                // SAFETY: holding the home bucket's lock.
                .find(|&i| unsafe { self.meta(i).refcnt == 0 });
            if let Some(i) = free {
                // SAFETY: holding the home bucket's lock.
                unsafe { self.reassign(i, dev, blockno) };
                drop(bucket);
                return self.lock_buf(i, dev, blockno);
            }

            // The home bucket is exhausted. The lock must go before any
            // peer bucket's lock is taken; holding it while searching is
            // the classic two-bucket deadlock.
        }

        // Steal the least recently used free buffer of some other bucket.
        for source in 0..NBUCKET {
            if source == home {
                continue;
            }
            let mut source_bucket = self.buckets[source].lock();
            let pos = source_bucket
                .iter()
                // SAFETY: holding the source bucket's lock.
                .rposition(|&i| unsafe { self.meta(i).refcnt == 0 });
            let pos = match pos {
                Some(pos) => pos,
                None => continue,
            };
            let stolen = source_bucket.remove(pos);

            // Destination nested inside source; the home lock was released
            // above, so no cycle through this hart.
            let mut home_bucket = self.buckets[home].lock();

            // Between releasing the home bucket and locking it again,
            // another hart may have inserted this very block. Re-scan, and
            // on a hit return the stolen buffer to its source as free.
            if let Some(i) = self.scan(&home_bucket, dev, blockno) {
                // SAFETY: holding the home bucket's lock.
                unsafe { self.meta(i).refcnt += 1 };
                // The tail is where reuse scans look first.
                source_bucket.push(stolen);
                drop(home_bucket);
                drop(source_bucket);
                return self.lock_buf(i, dev, blockno);
            }

            // SAFETY: holding both bucket locks; the buffer is on neither
            // list at this moment, and transfers to the home bucket below.
            unsafe { self.reassign(stolen, dev, blockno) };
            home_bucket.insert(0, stolen);
            drop(home_bucket);
            drop(source_bucket);
            return self.lock_buf(stolen, dev, blockno);
        }

        panic!("bget: no buffers");
    }

    /// Scans a locked bucket for a live or recycled copy of the block.
    fn scan(&self, bucket: &SpinlockGuard<'_, Bucket>, dev: u32, blockno: u32) -> Option<usize> {
        bucket.iter().copied().find(|&i| {
            // SAFETY: the caller holds this bucket's lock.
            let meta = unsafe { self.meta(i) };
            meta.dev == dev && meta.blockno == blockno
        })
    }

    /// Hands buffer `i` to a new (dev, blockno) owner.
    ///
    /// # Safety
    ///
    /// The lock of the bucket listing `i` must be held, and `refcnt` must
    /// be zero.
    unsafe fn reassign(&self, i: usize, dev: u32, blockno: u32) {
        let meta = unsafe { self.meta(i) };
        debug_assert_eq!(meta.refcnt, 0);
        meta.dev = dev;
        meta.blockno = blockno;
        meta.refcnt = 1;
        // SAFETY: refcnt was 0, so no one holds or can acquire the sleep
        // lock's data until we return the buffer.
        unsafe { (*self.bufs[i].inner.get_mut_raw()).valid = false };
    }

    /// Acquires the sleep lock of buffer `i`. No bucket lock may be held.
    fn lock_buf(&self, i: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            bcache: self,
            idx: i,
            dev,
            blockno,
            inner: ManuallyDrop::new(self.bufs[i].inner.lock()),
        }
    }

    /// Drops one reference to buffer `i`. The last reference moves the
    /// buffer to the head of its bucket: it becomes the most recently used
    /// candidate, found last by eviction scans.
    fn release_ref(&self, i: usize, blockno: u32) {
        let mut bucket = self.buckets[Self::bucket_of(blockno)].lock();
        // SAFETY: holding the bucket's lock; a buffer with refcnt > 0 never
        // changes bucket, so `blockno` still names the right one.
        let refcnt = unsafe {
            let meta = self.meta(i);
            meta.refcnt -= 1;
            meta.refcnt
        };
        if refcnt == 0 {
            let pos = bucket.iter().position(|&j| j == i).expect("release_ref");
            bucket.remove(pos);
            bucket.insert(0, i);
        }
    }

    /// The wait channel the disk driver signals when a request for buffer
    /// `i` completes.
    pub(crate) fn wait_channel_of(&self, i: usize) -> &WaitChannel {
        &self.bufs[i].vdisk_request_waitchannel
    }

    #[cfg(test)]
    fn cached_copies(&self, dev: u32, blockno: u32) -> usize {
        // Lock every bucket so the metadata snapshot is consistent.
        let guards: ArrayVec<SpinlockGuard<'_, Bucket>, NBUCKET> =
            self.buckets.iter().map(|b| b.lock()).collect();
        let count = (0..NBUF)
            .filter(|&i| {
                // SAFETY: all bucket locks are held.
                let meta = unsafe { self.meta(i) };
                meta.refcnt > 0 && meta.dev == dev && meta.blockno == blockno
            })
            .count();
        drop(guards);
        count
    }
}

/// A locked buffer: holding one implies the buffer's sleep lock is held and
/// its reference count is at least one. Dropping it releases both, moving
/// the buffer to its bucket's most-recently-used position when the count
/// hits zero.
pub struct Buf<'s> {
    bcache: &'s Bcache,
    idx: usize,
    dev: u32,
    blockno: u32,
    inner: ManuallyDrop<SleeplockGuard<'s, BufInner>>,
}

impl<'s> Buf<'s> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub(crate) fn index(&self) -> usize {
        self.idx
    }

    /// The channel the disk driver signals for this buffer.
    pub(crate) fn wait_channel(&self) -> &'s WaitChannel {
        self.bcache.wait_channel_of(self.idx)
    }

    /// A raw pointer to the locked contents, for the disk driver's
    /// completion handler. The holder sleeps while the disk owns the
    /// buffer, so the aliasing is coordinated by `disk` and the driver
    /// lock.
    pub(crate) fn inner_raw(&self) -> *mut BufInner {
        self.bcache.bufs[self.idx].inner.get_mut_raw()
    }

    /// Keeps the buffer's reference while releasing its sleep lock, so the
    /// block stays cached until `unpin`. Used by the logging layer above.
    pub fn pin(mut self) -> PinnedBuf<'s> {
        // SAFETY: self is forgotten below; the guard is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        let pinned = PinnedBuf {
            bcache: self.bcache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
        };
        mem::forget(self);
        pinned
    }
}

impl Deref for Buf<'_> {
    type Target = BufInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the sleep lock first; the bucket spin lock is never held
        // around a sleep lock operation.
        // SAFETY: self is being dropped; the guard is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        self.bcache.release_ref(self.idx, self.blockno);
    }
}

/// A pinned buffer: a reference without the sleep lock. The block cannot be
/// evicted until `unpin`.
pub struct PinnedBuf<'s> {
    bcache: &'s Bcache,
    idx: usize,
    dev: u32,
    blockno: u32,
}

impl<'s> PinnedBuf<'s> {
    /// Reacquires the sleep lock, turning the pin back into a usable
    /// buffer.
    pub fn lock(self) -> Buf<'s> {
        let buf = self
            .bcache
            .lock_buf(self.idx, self.dev, self.blockno);
        mem::forget(self);
        buf
    }

    /// Drops the pinned reference.
    pub fn unpin(self) {
        self.bcache.release_ref(self.idx, self.blockno);
        mem::forget(self);
    }
}

impl Drop for PinnedBuf<'_> {
    fn drop(&mut self) {
        // A silently dropped pin would leak the reference count. In host
        // tests a panicking drop would double-panic while unwinding.
        #[cfg(not(test))]
        panic!("PinnedBuf must be unpinned");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::vec::Vec;

    use super::*;

    fn bcache() -> Arc<Bcache> {
        let cache = Arc::new(Bcache::new());
        cache.init();
        cache
    }

    #[test]
    fn same_block_returns_the_same_buffer() {
        let cache = bcache();
        let first = cache.get(1, 7);
        let idx = first.index();
        drop(first);
        let second = cache.get(1, 7);
        assert_eq!(second.index(), idx);
        assert_eq!(second.blockno(), 7);
        drop(second);
    }

    #[test]
    fn released_buffer_moves_to_bucket_head() {
        let cache = bcache();
        let buf = cache.get(0, 1);
        let idx = buf.index();
        drop(buf);
        let bucket = cache.buckets[1].lock();
        assert_eq!(bucket[0], idx);
    }

    #[test]
    fn reassignment_clears_valid() {
        let cache = bcache();
        {
            let mut buf = cache.get(0, 1);
            buf.valid = true;
            buf.data[0] = 0xaa;
        }
        // 30 distinct blocks of bucket 1's chain evict block 1's buffer.
        let spam: Vec<Buf<'_>> = (0..NBUF as u32).map(|k| cache.get(0, 2 + k * 13)).collect();
        drop(spam);
        let buf = cache.get(0, 1);
        assert!(!buf.valid, "a recycled buffer must not present stale data");
        drop(buf);
    }

    #[test]
    fn exhausted_bucket_steals_from_peers() {
        let cache = bcache();

        // Drain bucket 0: 27 gets on other buckets pull every free buffer
        // out of bucket 0 (they all start there), leaving 3.
        let mut movers = Vec::new();
        for blockno in (1..=29u32).filter(|b| b % 13 != 0) {
            assert_ne!(Bcache::bucket_of(blockno), 0);
            movers.push(cache.get(0, blockno));
        }
        assert_eq!(movers.len(), 27);
        drop(movers);

        // The three leftovers back the first three bucket-0 blocks.
        let a = cache.get(0, 0);
        let b = cache.get(0, 13);
        let c = cache.get(0, 26);

        // Bucket 0 is now exhausted, so these two must steal from peers.
        let d = cache.get(0, 39);
        let e = cache.get(0, 52);

        let mut indices = [a.index(), b.index(), c.index(), d.index(), e.index()];
        indices.sort_unstable();
        indices.windows(2).for_each(|w| assert_ne!(w[0], w[1]));

        // The stolen buffers now live on bucket 0's list.
        for buf in [&d, &e] {
            let bucket = cache.buckets[0].lock();
            assert!(bucket.contains(&buf.index()));
        }

        drop((a, b, c, d, e));
    }

    #[test]
    fn every_buffer_live_panics_cleanly() {
        let cache = bcache();
        let all: Vec<Buf<'_>> = (0..NBUF as u32).map(|k| cache.get(0, k)).collect();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = cache.get(0, NBUF as u32);
        }));
        assert!(result.is_err(), "bget must panic with no buffers");
        drop(all);
    }

    #[test]
    fn concurrent_get_yields_one_resident_copy() {
        let cache = bcache();
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    let mut buf = cache.get(5, 7);
                    assert_eq!(cache.cached_copies(5, 7), 1);
                    buf.data[0] = buf.data[0].wrapping_add(1);
                    drop(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Both harts' increments survived: the sleep lock serialized them.
        let buf = cache.get(5, 7);
        assert_eq!(buf.data[0], (2 * 200 % 256) as u8);
        drop(buf);
    }

    #[test]
    fn pin_keeps_the_block_resident() {
        let cache = bcache();
        let buf = cache.get(3, 3);
        let idx = buf.index();
        let pin = buf.pin();

        // Churn through every other buffer; the pinned one must survive.
        let spam: Vec<Buf<'_>> = (0..(NBUF - 1) as u32)
            .map(|k| cache.get(9, 100 + k))
            .collect();
        drop(spam);

        let again = cache.get(3, 3);
        assert_eq!(again.index(), idx);
        drop(again);
        pin.unpin();
    }
}
