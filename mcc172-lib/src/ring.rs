//! Single-producer/single-consumer sample ring.
//!
//! The producer (scan thread) is the only writer of `write_index` and the
//! only incrementer of `depth`; the consumer (application thread) is the
//! only writer of `read_index` and the only decrementer of `depth`. Under
//! that discipline the storage never needs a mutex: index publication uses
//! release stores paired with acquire loads, so a consumer that observes a
//! depth increment also observes the samples behind it.
//!
//! Overrun is not masked by overwriting old data: the producer checks the
//! depth returned by [`push_burst`](SampleRing::push_burst) against the
//! capacity and terminates the scan when it is exceeded.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) struct SampleRing {
    storage: Box<[UnsafeCell<f64>]>,
    capacity: u32,
    write_index: AtomicU32,
    read_index: AtomicU32,
    depth: AtomicU32,
}

// SAFETY: the storage is only written by the single producer and only read
// by the single consumer, in regions handed over through the acquire/release
// depth counter; see the module invariants.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    pub fn new(capacity: u32) -> SampleRing {
        let storage: Vec<UnsafeCell<f64>> =
            (0..capacity).map(|_| UnsafeCell::new(0.0)).collect();
        SampleRing {
            storage: storage.into_boxed_slice(),
            capacity,
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
            depth: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Samples written but not yet consumed.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Samples until the write position wraps. Producer only.
    pub fn space_to_wrap(&self) -> u32 {
        self.capacity - self.write_index.load(Ordering::Relaxed)
    }

    /// Append a burst at the write position. The caller must have clamped
    /// `samples` to [`space_to_wrap`](SampleRing::space_to_wrap), so the
    /// burst never splits across the wrap. Returns the depth after the
    /// append; a result above [`capacity`](SampleRing::capacity) means the
    /// consumer has been overrun and the unread region was damaged.
    ///
    /// Producer only.
    pub fn push_burst(&self, samples: &[f64]) -> u32 {
        let count = samples.len() as u32;
        debug_assert!(count <= self.space_to_wrap());

        let start = self.write_index.load(Ordering::Relaxed) as usize;
        for (offset, &sample) in samples.iter().enumerate() {
            // SAFETY: sole producer; this region is unread until the depth
            // increment below publishes it (overrun is detected afterwards).
            unsafe { *self.storage[start + offset].get() = sample };
        }

        let mut next = start as u32 + count;
        if next >= self.capacity {
            next = 0;
        }
        self.write_index.store(next, Ordering::Relaxed);
        self.depth.fetch_add(count, Ordering::AcqRel) + count
    }

    /// Copy `out.len()` samples from the read position, handling the wrap
    /// with up to two copies. The caller must have bounded `out` by
    /// [`depth`](SampleRing::depth).
    ///
    /// Consumer only.
    pub fn pop_into(&self, out: &mut [f64]) {
        let count = out.len() as u32;
        debug_assert!(count <= self.depth());

        let start = self.read_index.load(Ordering::Relaxed);
        let until_wrap = (self.capacity - start).min(count);
        let start = start as usize;
        for offset in 0..until_wrap as usize {
            // SAFETY: sole consumer; the region was published by the
            // producer's depth increment observed by the caller.
            out[offset] = unsafe { *self.storage[start + offset].get() };
        }
        for offset in 0..(count - until_wrap) as usize {
            out[until_wrap as usize + offset] = unsafe { *self.storage[offset].get() };
        }

        let mut next = start as u32 + count;
        if next >= self.capacity {
            next -= self.capacity;
        }
        self.read_index.store(next, Ordering::Relaxed);
        self.depth.fetch_sub(count, Ordering::AcqRel);
    }
}
