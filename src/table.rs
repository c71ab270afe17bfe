//! Lock-free chunked hash table keyed by cell.
//!
//! # Architecture
//!
//! ```text
//!  buckets (Box<[AtomicPtr<Entry>]>)
//! ┌──────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ slot 0   │────►│ key=K1  next ───┼────►│ key=K7  next=∅  │
//! ├──────────┤     │ head            │     │ head            │
//! │ slot 1 ∅ │     └──┼──────────────┘     └──┼──────────────┘
//! │ ...      │        ▼                       ▼
//! └──────────┘     ┌────────────────┐      ┌────────────────┐
//!                  │ chunk (newest) │      │ chunk          │
//!                  │ used, [Point;C]│      └────────────────┘
//!                  │ next ──────────┼──► older chunk ──► ...
//!                  └────────────────┘
//! ```
//!
//! Writers only ever *prepend*: a new entry is published by a CAS on its
//! bucket head and a new chunk by a swap on its entry head. Nothing is
//! unlinked or freed until the table is dropped, so readers never see a
//! dangling pointer and there is no ABA.
//!
//! The table has two phases. [`ChunkedTable`] accepts concurrent inserts from
//! any number of threads; [`ChunkedTable::freeze`] consumes it and returns a
//! [`FrozenTable`] that exposes the stored points for reading. Taking `self`
//! by value guarantees no insert is still running when points are read.

use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::cell::Point;


#[cfg(not(test))]
mod sched {
    #[inline(always)]
    pub(super) fn preempt() {}
}

/// Points per chunk.
pub const CHUNK_CAPACITY: usize = 8;

const _: () = assert!(CHUNK_CAPACITY.is_power_of_two());

const FIBONACCI: u64 = 11_400_714_819_323_198_485;

/// Fibonacci hash of a cell key. Buckets come from the top bits.
#[inline(always)]
fn hash(key: u64) -> u64 {
    (key ^ (key >> 16)).wrapping_mul(FIBONACCI)
}

/// Compute bucket count (power of two) and the shift that selects a bucket
/// from the top bits of the hash. Sized to ~1.125n, minimum 16 buckets.
fn compute_table_params(expected_keys: usize) -> (usize, u32) {
    let min_size = 16_usize;
    let target = (expected_keys + (expected_keys / 8)).max(min_size);
    let table_size = target.next_power_of_two();
    let shift = 64 - table_size.trailing_zeros();
    (table_size, shift)
}

/// Fixed-capacity block of points belonging to one cell.
struct Chunk {
    /// Number of reserved slots. May briefly overshoot `CHUNK_CAPACITY` while
    /// racing inserters are bounced to the next chunk.
    used: AtomicUsize,
    points: [UnsafeCell<Point>; CHUNK_CAPACITY],
    /// Older chunk of the same cell. Written before the chunk is published.
    next: *mut Chunk,
}

impl Chunk {
    fn new(next: *mut Chunk) -> Box<Self> {
        Box::new(Self {
            used: AtomicUsize::new(0),
            points: std::array::from_fn(|_| UnsafeCell::new(Point::default())),
            next,
        })
    }

    /// A chunk whose first slot already holds `point`.
    fn with_point(point: Point) -> Box<Self> {
        let chunk = Self::new(ptr::null_mut());
        // SAFETY: the chunk is not shared yet.
        unsafe { *chunk.points[0].get() = point };
        chunk.used.store(1, Ordering::Relaxed);
        chunk
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.used.load(Ordering::Relaxed).min(CHUNK_CAPACITY)
    }
}

/// One key in a bucket chain.
struct Entry {
    key: u64,
    /// Newest chunk of this cell.
    head: AtomicPtr<Chunk>,
    /// Next entry in the bucket. Immutable once the entry is published.
    next: *mut Entry,
}

/// Concurrent insert phase of the table.
pub struct ChunkedTable {
    buckets: Box<[AtomicPtr<Entry>]>,
    shift: u32,
    len: AtomicUsize,
}

// SAFETY: every shared mutation goes through an atomic; point slots are only
// written by the thread that reserved them with `fetch_add`.
unsafe impl Send for ChunkedTable {}
unsafe impl Sync for ChunkedTable {}

impl ChunkedTable {
    /// Create a table sized for roughly `expected_keys` distinct cells.
    pub fn with_capacity(expected_keys: usize) -> Self {
        let (table_size, shift) = compute_table_params(expected_keys);
        Self {
            buckets: (0..table_size)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            shift,
            len: AtomicUsize::new(0),
        }
    }

    /// Number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of distinct keys inserted so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn bucket(&self, key: u64) -> &AtomicPtr<Entry> {
        let slot = (hash(key) >> self.shift) as usize;
        &self.buckets[slot]
    }

    /// Walk the chain from `from` until `until`, looking for `key`.
    #[inline(always)]
    fn find_in_chain<'a>(from: *mut Entry, until: *mut Entry, key: u64) -> Option<&'a Entry> {
        let mut cur = from;
        while cur != until {
            // SAFETY: published entries are never freed while the table lives
            // and their `key` and `next` fields never change. Callers tie 'a
            // to their borrow of the table.
            let entry = unsafe { &*cur };
            if entry.key == key {
                return Some(entry);
            }
            cur = entry.next;
        }
        None
    }

    fn find(&self, key: u64) -> Option<&Entry> {
        let head = self.bucket(key).load(Ordering::Acquire);
        Self::find_in_chain(head, ptr::null_mut(), key)
    }

    /// Whether `key` has an entry. Safe to call while other threads insert.
    pub fn contains_key(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    /// Add `point` to the chunk list of `key`, creating the entry if needed.
    ///
    /// Never blocks. If several threads race to create the same key exactly
    /// one entry becomes visible; the losers append to the winner's entry.
    pub fn insert(&self, key: u64, point: Point) {
        let bucket = self.bucket(key);
        let mut expected = bucket.load(Ordering::Acquire);
        sched::preempt();

        if let Some(entry) = Self::find_in_chain(expected, ptr::null_mut(), key) {
            Self::append(entry, point);
            return;
        }

        // Build the entry off to the side; it holds the point already.
        let entry = Box::into_raw(Box::new(Entry {
            key,
            head: AtomicPtr::new(Box::into_raw(Chunk::with_point(point))),
            next: expected,
        }));

        loop {
            sched::preempt();
            // Release publishes the entry and its first chunk together.
            match bucket.compare_exchange(expected, entry, Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(current) => {
                    // Only the entries in front of the one we last saw are new.
                    if let Some(existing) = Self::find_in_chain(current, expected, key) {
                        // SAFETY: `entry` was never published.
                        unsafe { drop_entry(entry) };
                        Self::append(existing, point);
                        return;
                    }
                    // SAFETY: still private to this thread.
                    unsafe { (*entry).next = current };
                    expected = current;
                }
            }
        }
    }

    /// Reserve a slot in the entry's newest chunk and write `point` into it.
    fn append(entry: &Entry, point: Point) {
        loop {
            let chunk_ptr = entry.head.load(Ordering::Acquire);
            // SAFETY: chunks are never freed while the table lives.
            let chunk = unsafe { &*chunk_ptr };
            sched::preempt();
            let used = chunk.used.fetch_add(1, Ordering::Relaxed) + 1;
            sched::preempt();

            if used > CHUNK_CAPACITY {
                // Raced past a full chunk before its replacement was linked.
                // Undo the overshoot and retry against the new head.
                chunk.used.store(CHUNK_CAPACITY, Ordering::Relaxed);
                sched::preempt();
                std::hint::spin_loop();
                continue;
            }

            if used == CHUNK_CAPACITY {
                // Filling the last slot elects this thread to link a fresh
                // chunk. Its `next` is written before the release swap.
                let fresh = Box::into_raw(Chunk::new(chunk_ptr));
                let old = entry.head.swap(fresh, Ordering::AcqRel);
                debug_assert_eq!(old, chunk_ptr, "only the filling thread replaces the head");
            }

            // SAFETY: slot `used - 1` was reserved exclusively by the
            // fetch_add above and is written exactly once.
            unsafe { *chunk.points[used - 1].get() = point };
            return;
        }
    }

    /// End the insert phase.
    pub fn freeze(self) -> FrozenTable {
        FrozenTable { inner: self }
    }
}

/// Free an entry and its chunks.
///
/// # Safety
/// `entry` must come from `Box::into_raw` and be unreachable by other threads.
unsafe fn drop_entry(entry: *mut Entry) {
    unsafe {
        let entry = Box::from_raw(entry);
        let mut chunk = entry.head.load(Ordering::Relaxed);
        while !chunk.is_null() {
            let boxed = Box::from_raw(chunk);
            chunk = boxed.next;
        }
    }
}

impl Drop for ChunkedTable {
    fn drop(&mut self) {
        for bucket in self.buckets.iter_mut() {
            let mut cur = *bucket.get_mut();
            while !cur.is_null() {
                // SAFETY: `&mut self` means no other thread can reach the table.
                let next = unsafe { (*cur).next };
                unsafe { drop_entry(cur) };
                cur = next;
            }
        }
    }
}

/// Read phase of the table: no more inserts, stored points are readable.
pub struct FrozenTable {
    inner: ChunkedTable,
}

impl FrozenTable {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Chunk list of `key`, newest chunk first.
    #[inline(always)]
    pub fn lookup(&self, key: u64) -> Option<ChunkList<'_>> {
        self.inner.find(key).map(|entry| ChunkList {
            next: entry.head.load(Ordering::Acquire),
            _table: std::marker::PhantomData,
        })
    }

    /// Every distinct key, in bucket order.
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        self.keys_into(&mut keys);
        keys
    }

    /// Write every distinct key into `out`, reusing its allocation.
    pub fn keys_into(&self, out: &mut Vec<u64>) {
        out.clear();
        out.reserve(self.len());
        for bucket in self.inner.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: frozen, nothing is mutated or freed.
                let entry = unsafe { &*cur };
                out.push(entry.key);
                cur = entry.next;
            }
        }
    }

    /// Total number of stored points, found by walking every chunk list.
    pub fn point_count(&self) -> usize {
        self.keys()
            .into_iter()
            .filter_map(|key| self.lookup(key))
            .map(|chunks| chunks.map(|points| points.len()).sum::<usize>())
            .sum()
    }

    /// Number of entries sharing a bucket with `key`'s bucket, including it.
    pub fn chain_len(&self, key: u64) -> usize {
        let mut cur = self.inner.bucket(key).load(Ordering::Acquire);
        let mut n = 0;
        while !cur.is_null() {
            n += 1;
            // SAFETY: frozen, nothing is mutated or freed.
            cur = unsafe { (*cur).next };
        }
        n
    }
}

/// Iterator over a cell's chunks, yielding each chunk's filled points.
#[derive(Clone)]
pub struct ChunkList<'a> {
    next: *mut Chunk,
    _table: std::marker::PhantomData<&'a FrozenTable>,
}

impl<'a> Iterator for ChunkList<'a> {
    type Item = &'a [Point];

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: the table is frozen and outlives 'a; no slot is written
        // any more. `UnsafeCell<Point>` has the layout of `Point`.
        let chunk = unsafe { &*self.next };
        self.next = chunk.next;
        let points = unsafe {
            std::slice::from_raw_parts(chunk.points.as_ptr() as *const Point, chunk.len())
        };
        Some(points)
    }
}
