//! Single-producer/single-consumer rings with the kernel AF_XDP layout.
//!
//! Each ring is a power-of-two array of entries plus a producer index, a consumer index and a
//! flags word. The producer side only ever advances the producer index and the consumer side
//! only ever advances the consumer index, so no lock is needed. Indices are free running `u32`
//! values that wrap; an entry lives at `index & mask`.
//!
//! A ring is either mapped from an AF_XDP socket (the kernel holds the other end) or allocated
//! on the heap with [`ring_pair`], in which case both ends live in this process. The ring
//! memory is kept alive by whichever ends still exist.
use std::cell::UnsafeCell;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use errno::errno;
use libc::{
    c_void, mmap, munmap, off_t, MAP_FAILED, MAP_POPULATE, MAP_SHARED, PROT_READ, PROT_WRITE,
};
use thiserror::Error;
use tracing::warn;

use crate::util::is_pow_of_two;
use crate::xdp::{XdpDesc, XdpRingOffset, XDP_RING_NEED_WAKEUP};

mod private {
    pub trait Sealed {}
    impl Sealed for u64 {}
    impl Sealed for crate::xdp::XdpDesc {}
}

/// Types that can be stored in a ring: bare frame offsets (fill and completion rings) and
/// descriptors (receive and transmit rings).
pub trait RingEntry: Copy + Default + Send + private::Sealed {}
impl RingEntry for u64 {}
impl RingEntry for XdpDesc {}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring size {0} is not a power of two")]
    NotPowerOfTwo(u32),

    #[error("ring mmap failed: {0}")]
    Mmap(io::Error),
}

struct HeapRing<E> {
    producer: AtomicU32,
    consumer: AtomicU32,
    flags: AtomicU32,
    entries: Box<[UnsafeCell<E>]>,
}

enum Backing<E> {
    Mmap { addr: NonNull<c_void>, len: usize },
    Heap(Box<HeapRing<E>>),
}

struct RingMem<E> {
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    entries: NonNull<E>,
    size: u32,
    backing: Backing<E>,
}

// Shared state is only touched through the atomics. Entry slots are handed back and forth by
// the index protocol, never accessed by both ends at once.
unsafe impl<E: Send> Send for RingMem<E> {}
unsafe impl<E: Send> Sync for RingMem<E> {}

impl<E: RingEntry> RingMem<E> {
    fn heap(size: u32) -> Result<RingMem<E>, RingError> {
        if !is_pow_of_two(size) {
            return Err(RingError::NotPowerOfTwo(size));
        }

        let entries: Vec<UnsafeCell<E>> =
            (0..size).map(|_| UnsafeCell::new(E::default())).collect();
        let heap = Box::new(HeapRing {
            producer: AtomicU32::new(0),
            consumer: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            entries: entries.into_boxed_slice(),
        });

        // UnsafeCell<E> has the same layout as E
        let entries = heap.entries.as_ptr() as *mut E;

        Ok(RingMem {
            producer: NonNull::from(&heap.producer),
            consumer: NonNull::from(&heap.consumer),
            flags: NonNull::from(&heap.flags),
            entries: unsafe { NonNull::new_unchecked(entries) },
            size,
            backing: Backing::Heap(heap),
        })
    }

    /// Map one of the socket's rings.
    ///
    /// # Safety
    ///
    /// `fd` must be an AF_XDP socket on which the ring behind `pgoff` has been configured with
    /// `size` entries, and `off` must be the matching entry of its `XDP_MMAP_OFFSETS`.
    unsafe fn mmap(
        fd: RawFd,
        pgoff: off_t,
        off: &XdpRingOffset,
        size: u32,
    ) -> Result<RingMem<E>, RingError> {
        if !is_pow_of_two(size) {
            return Err(RingError::NotPowerOfTwo(size));
        }

        let len = off.desc as usize + size as usize * size_of::<E>();
        let addr = mmap(
            std::ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_SHARED | MAP_POPULATE,
            fd,
            pgoff,
        );
        if addr == MAP_FAILED {
            return Err(RingError::Mmap(io::Error::last_os_error()));
        }

        let base = addr as *mut u8;
        Ok(RingMem {
            producer: NonNull::new_unchecked(base.add(off.producer as usize) as *mut AtomicU32),
            consumer: NonNull::new_unchecked(base.add(off.consumer as usize) as *mut AtomicU32),
            flags: NonNull::new_unchecked(base.add(off.flags as usize) as *mut AtomicU32),
            entries: NonNull::new_unchecked(base.add(off.desc as usize) as *mut E),
            size,
            backing: Backing::Mmap {
                addr: NonNull::new_unchecked(addr),
                len,
            },
        })
    }

    fn producer(&self) -> &AtomicU32 {
        unsafe { self.producer.as_ref() }
    }

    fn consumer(&self) -> &AtomicU32 {
        unsafe { self.consumer.as_ref() }
    }

    fn flags(&self) -> &AtomicU32 {
        unsafe { self.flags.as_ref() }
    }

    fn slot(&self, idx: u32) -> *mut E {
        unsafe { self.entries.as_ptr().add((idx & (self.size - 1)) as usize) }
    }

    fn needs_wakeup(&self) -> bool {
        self.flags().load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }

    fn set_needs_wakeup(&self, needed: bool) {
        if needed {
            self.flags().fetch_or(XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
        } else {
            self.flags().fetch_and(!XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
        }
    }
}

impl<E> Drop for RingMem<E> {
    fn drop(&mut self) {
        if let Backing::Mmap { addr, len } = self.backing {
            let r = unsafe { munmap(addr.as_ptr(), len) };
            if r != 0 {
                warn!("ring munmap failed errno: {}", errno().0);
            }
        }
    }
}

/// The producing end of a ring.
pub struct RingProd<E: RingEntry> {
    mem: Arc<RingMem<E>>,
    cached_prod: u32,
    cached_cons: u32,
}

/// The consuming end of a ring.
pub struct RingCons<E: RingEntry> {
    mem: Arc<RingMem<E>>,
    cached_prod: u32,
    cached_cons: u32,
}

impl<E: RingEntry> std::fmt::Debug for RingProd<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingProd")
            .field("size", &self.mem.size)
            .field("cached_prod", &self.cached_prod)
            .field("cached_cons", &self.cached_cons)
            .finish()
    }
}

impl<E: RingEntry> std::fmt::Debug for RingCons<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingCons")
            .field("size", &self.mem.size)
            .field("cached_prod", &self.cached_prod)
            .field("cached_cons", &self.cached_cons)
            .finish()
    }
}

/// Allocate a ring of `size` entries on the heap and return both of its ends.
pub fn ring_pair<E: RingEntry>(size: u32) -> Result<(RingProd<E>, RingCons<E>), RingError> {
    let mem = Arc::new(RingMem::heap(size)?);

    let prod = RingProd {
        mem: mem.clone(),
        cached_prod: 0,
        cached_cons: 0,
    };
    let cons = RingCons {
        mem,
        cached_prod: 0,
        cached_cons: 0,
    };

    Ok((prod, cons))
}

impl<E: RingEntry> RingProd<E> {
    /// Map the producing end of a kernel ring (fill or transmit).
    ///
    /// # Safety
    ///
    /// See [`RingMem::mmap`].
    pub(crate) unsafe fn from_socket(
        fd: RawFd,
        pgoff: off_t,
        off: &XdpRingOffset,
        size: u32,
    ) -> Result<RingProd<E>, RingError> {
        let mem = RingMem::mmap(fd, pgoff, off, size)?;
        let cached_prod = mem.producer().load(Ordering::Relaxed);
        let cached_cons = mem.consumer().load(Ordering::Acquire);

        Ok(RingProd {
            mem: Arc::new(mem),
            cached_prod,
            cached_cons,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.mem.size
    }

    /// Number of free slots, at least `wanted` if that many are free. The consumer index is only
    /// re-read when the cached view has fewer than `wanted` free slots.
    #[inline]
    pub fn free(&mut self, wanted: u32) -> u32 {
        let free = self.mem.size - self.cached_prod.wrapping_sub(self.cached_cons);
        if free >= wanted {
            return free;
        }

        self.cached_cons = self.mem.consumer().load(Ordering::Acquire);
        self.mem.size - self.cached_prod.wrapping_sub(self.cached_cons)
    }

    /// Claim `n` slots. Returns `n` and sets `idx` to the first slot, or returns 0 without
    /// claiming anything if fewer than `n` slots are free.
    #[inline]
    pub fn reserve(&mut self, n: u32, idx: &mut u32) -> u32 {
        if self.free(n) < n {
            return 0;
        }

        *idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(n);

        n
    }

    /// Write a reserved slot.
    ///
    /// Panics if `idx` was not reserved or has already been submitted.
    #[inline]
    pub fn set(&mut self, idx: u32, entry: E) {
        let published = self.mem.producer().load(Ordering::Relaxed);
        assert!(
            idx.wrapping_sub(published) < self.cached_prod.wrapping_sub(published),
            "ring slot {} is not reserved",
            idx
        );

        unsafe { self.mem.slot(idx).write(entry) }
    }

    /// Publish the next `n` reserved slots to the consumer.
    #[inline]
    pub fn submit(&mut self, n: u32) {
        let published = self.mem.producer().load(Ordering::Relaxed);
        assert!(
            n <= self.cached_prod.wrapping_sub(published),
            "submitting {} slots but only {} are reserved",
            n,
            self.cached_prod.wrapping_sub(published)
        );

        self.mem
            .producer()
            .store(published.wrapping_add(n), Ordering::Release);
    }

    /// Entries submitted but not yet released by the consumer.
    pub fn pending(&self) -> u32 {
        let published = self.mem.producer().load(Ordering::Relaxed);
        published.wrapping_sub(self.mem.consumer().load(Ordering::Acquire))
    }

    #[inline]
    pub fn needs_wakeup(&self) -> bool {
        self.mem.needs_wakeup()
    }

    pub(crate) fn set_needs_wakeup(&self, needed: bool) {
        self.mem.set_needs_wakeup(needed)
    }
}

impl<E: RingEntry> RingCons<E> {
    /// Map the consuming end of a kernel ring (completion or receive).
    ///
    /// # Safety
    ///
    /// See [`RingMem::mmap`].
    pub(crate) unsafe fn from_socket(
        fd: RawFd,
        pgoff: off_t,
        off: &XdpRingOffset,
        size: u32,
    ) -> Result<RingCons<E>, RingError> {
        let mem = RingMem::mmap(fd, pgoff, off, size)?;
        let cached_prod = mem.producer().load(Ordering::Acquire);
        let cached_cons = mem.consumer().load(Ordering::Relaxed);

        Ok(RingCons {
            mem: Arc::new(mem),
            cached_prod,
            cached_cons,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.mem.size
    }

    /// Number of entries ready to be peeked, at most `max`.
    #[inline]
    pub fn available(&mut self, max: u32) -> u32 {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries < max {
            self.cached_prod = self.mem.producer().load(Ordering::Acquire);
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }

        entries.min(max)
    }

    /// Take up to `max` ready entries. Sets `idx` to the first one and returns the count. The
    /// slots stay unavailable to the producer until [`RingCons::release`].
    #[inline]
    pub fn peek(&mut self, max: u32, idx: &mut u32) -> u32 {
        let entries = self.available(max);
        if entries > 0 {
            *idx = self.cached_cons;
            self.cached_cons = self.cached_cons.wrapping_add(entries);
        }

        entries
    }

    /// Read a peeked slot.
    ///
    /// Panics if `idx` was not peeked or has already been released.
    #[inline]
    pub fn get(&self, idx: u32) -> E {
        let released = self.mem.consumer().load(Ordering::Relaxed);
        assert!(
            idx.wrapping_sub(released) < self.cached_cons.wrapping_sub(released),
            "ring slot {} has not been peeked",
            idx
        );

        unsafe { self.mem.slot(idx).read() }
    }

    /// Hand the next `n` peeked slots back to the producer.
    #[inline]
    pub fn release(&mut self, n: u32) {
        let released = self.mem.consumer().load(Ordering::Relaxed);
        assert!(
            n <= self.cached_cons.wrapping_sub(released),
            "releasing {} slots but only {} are peeked",
            n,
            self.cached_cons.wrapping_sub(released)
        );

        self.mem
            .consumer()
            .store(released.wrapping_add(n), Ordering::Release);
    }

    #[inline]
    pub fn needs_wakeup(&self) -> bool {
        self.mem.needs_wakeup()
    }

    pub(crate) fn set_needs_wakeup(&self, needed: bool) {
        self.mem.set_needs_wakeup(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        match ring_pair::<u64>(12) {
            Err(RingError::NotPowerOfTwo(12)) => {}
            other => panic!("{:?}", other.map(|_| ())),
        }
        assert!(ring_pair::<u64>(0).is_err());
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let (mut prod, mut cons) = ring_pair::<u64>(8).unwrap();
        let mut idx = 0;

        assert_eq!(prod.reserve(6, &mut idx), 6);
        for i in 0..6 {
            prod.set(idx + i, i as u64);
        }
        prod.submit(6);

        // Only 2 slots left
        assert_eq!(prod.reserve(3, &mut idx), 0);
        assert_eq!(prod.free(3), 2);

        let mut cidx = 0;
        assert_eq!(cons.peek(4, &mut cidx), 4);
        cons.release(4);

        assert_eq!(prod.reserve(3, &mut idx), 3);
        assert_eq!(prod.free(0), 3);
    }

    #[test]
    fn wraps_around() {
        let (mut prod, mut cons) = ring_pair::<XdpDesc>(4).unwrap();
        let mut next = 0u64;
        let mut expect = 0u64;

        for _ in 0..100 {
            let mut idx = 0;
            let n = prod.reserve(3, &mut idx);
            assert_eq!(n, 3);
            for i in 0..n {
                prod.set(idx.wrapping_add(i), XdpDesc::new(next, next as u32));
                next += 1;
            }
            prod.submit(n);

            let mut cidx = 0;
            let n = cons.peek(8, &mut cidx);
            assert_eq!(n, 3);
            for i in 0..n {
                let desc = cons.get(cidx.wrapping_add(i));
                assert_eq!(desc.addr, expect);
                assert_eq!(desc.len, expect as u32);
                expect += 1;
            }
            cons.release(n);
        }
    }

    #[test]
    fn indices_wrap_u32() {
        let (mut prod, mut cons) = ring_pair::<u64>(4).unwrap();
        let start = u32::MAX - 2;
        prod.mem.producer().store(start, Ordering::Relaxed);
        prod.mem.consumer().store(start, Ordering::Relaxed);
        prod.cached_prod = start;
        prod.cached_cons = start;
        cons.cached_prod = start;
        cons.cached_cons = start;

        for round in 0..4u64 {
            let mut idx = 0;
            assert_eq!(prod.reserve(4, &mut idx), 4);
            for i in 0..4 {
                prod.set(idx.wrapping_add(i), round * 10 + i as u64);
            }
            prod.submit(4);

            let mut cidx = 0;
            assert_eq!(cons.peek(4, &mut cidx), 4);
            for i in 0..4 {
                assert_eq!(cons.get(cidx.wrapping_add(i)), round * 10 + i as u64);
            }
            cons.release(4);
        }
    }

    #[test]
    fn peek_does_not_return_entries_twice() {
        let (mut prod, mut cons) = ring_pair::<u64>(8).unwrap();
        let mut idx = 0;
        prod.reserve(4, &mut idx);
        for i in 0..4 {
            prod.set(idx + i, 100 + i as u64);
        }
        prod.submit(4);

        let mut a = 0;
        let mut b = 0;
        assert_eq!(cons.peek(2, &mut a), 2);
        assert_eq!(cons.peek(8, &mut b), 2);
        assert_eq!(cons.get(a), 100);
        assert_eq!(cons.get(b), 102);
        cons.release(4);

        assert_eq!(cons.peek(8, &mut a), 0);
        assert_eq!(prod.pending(), 0);
    }

    #[test]
    fn partial_submit_keeps_rest_reserved() {
        let (mut prod, mut cons) = ring_pair::<u64>(8).unwrap();
        let mut idx = 0;
        assert_eq!(prod.reserve(4, &mut idx), 4);
        for i in 0..4 {
            prod.set(idx + i, i as u64);
        }
        prod.submit(2);
        assert_eq!(cons.available(8), 2);
        prod.submit(2);
        assert_eq!(cons.available(8), 4);
    }

    #[test]
    fn peek_sees_entries_published_after_a_partial_peek() {
        let (mut prod, mut cons) = ring_pair::<u64>(8).unwrap();
        let mut idx = 0;
        assert_eq!(prod.reserve(2, &mut idx), 2);
        prod.set(idx, 10);
        prod.set(idx + 1, 11);
        prod.submit(2);

        let mut first = 0;
        assert_eq!(cons.peek(1, &mut first), 1);

        assert_eq!(prod.reserve(3, &mut idx), 3);
        for i in 0..3 {
            prod.set(idx + i, 12 + i as u64);
        }
        prod.submit(3);

        // One left from the first batch plus the three new ones
        let mut rest = 0;
        assert_eq!(cons.peek(8, &mut rest), 4);
        for i in 0..4 {
            assert_eq!(cons.get(rest + i), 11 + i as u64);
        }
        cons.release(5);
        assert_eq!(cons.available(8), 0);
    }

    #[test]
    #[should_panic(expected = "not reserved")]
    fn set_outside_reservation_panics() {
        let (mut prod, _cons) = ring_pair::<u64>(8).unwrap();
        prod.set(0, 1);
    }

    #[test]
    #[should_panic(expected = "only 0 are peeked")]
    fn release_more_than_peeked_panics() {
        let (_prod, mut cons) = ring_pair::<u64>(8).unwrap();
        cons.release(1);
    }

    #[test]
    fn wakeup_flag() {
        let (prod, cons) = ring_pair::<u64>(8).unwrap();
        assert!(!prod.needs_wakeup());

        cons.set_needs_wakeup(true);
        assert!(prod.needs_wakeup());
        assert!(cons.needs_wakeup());

        cons.set_needs_wakeup(false);
        assert!(!prod.needs_wakeup());
    }

    #[test]
    fn threaded_fifo() {
        const COUNT: u64 = 100_000;
        let (mut prod, mut cons) = ring_pair::<u64>(64).unwrap();

        let producer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < COUNT {
                let want = std::cmp::min(16, (COUNT - next) as u32);
                let n = std::cmp::min(want, prod.free(want));
                let mut idx = 0;
                if n == 0 || prod.reserve(n, &mut idx) == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                for i in 0..n {
                    prod.set(idx.wrapping_add(i), next);
                    next += 1;
                }
                prod.submit(n);
            }
        });

        let mut expect = 0u64;
        while expect < COUNT {
            let mut idx = 0;
            let n = cons.peek(32, &mut idx);
            for i in 0..n {
                assert_eq!(cons.get(idx.wrapping_add(i)), expect);
                expect += 1;
            }
            if n > 0 {
                cons.release(n);
            } else {
                std::hint::spin_loop();
            }
        }

        producer.join().unwrap();
    }
}
