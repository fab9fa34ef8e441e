//! Recycling pools.
//!
//! The trie constantly creates and retires branches and the hash bucket allocates a new slot array
//! on every resize. Instead of going to the allocator each time, the retired pieces are donated to
//! a bounded pool and taken out again later. The pools are lock-free and never grow beyond their
//! capacity; whatever doesn't fit is simply dropped.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use crossbeam_queue::ArrayQueue;
use smallvec::SmallVec;

/// How many items a pool holds by default.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

thread_local! {
    /// Pools this thread is donating to right now.
    ///
    /// A recycler may drop things that in turn get donated, possibly to the same pool. Such nested
    /// donations are refused and the item is just dropped.
    static DONATING: RefCell<SmallVec<[usize; 4]>> = RefCell::new(SmallVec::new());
}

/// Removes the pool from the thread's donation stack when done, even on panic.
struct Donation(usize);

impl Donation {
    fn start(id: usize) -> Option<Self> {
        DONATING
            .try_with(|donating| {
                let mut donating = donating.borrow_mut();
                if donating.contains(&id) {
                    None
                } else {
                    donating.push(id);
                    Some(Donation(id))
                }
            })
            // Thread is going away, no recycling any more.
            .unwrap_or(None)
    }
}

impl Drop for Donation {
    fn drop(&mut self) {
        let _ = DONATING.try_with(|donating| {
            let mut donating = donating.borrow_mut();
            if let Some(pos) = donating.iter().rposition(|id| *id == self.0) {
                donating.remove(pos);
            }
        });
    }
}

/// A bounded pool of recycled items.
///
/// Items are cleaned by the recycler when donated, so whatever [`take`][Pool::take] returns is
/// ready for reuse.
///
/// ```rust
/// use conbucket::pool::Pool;
///
/// let pool: Pool<Vec<u8>> = Pool::new(2, Vec::clear);
/// pool.donate(Box::new(vec![1, 2, 3]));
/// let reused = pool.take().unwrap();
/// assert!(reused.is_empty());
/// assert!(reused.capacity() >= 3);
/// assert!(pool.take().is_none());
/// ```
pub struct Pool<T: ?Sized> {
    entries: ArrayQueue<Box<T>>,
    recycle: fn(&mut T),
}

impl<T: ?Sized> Pool<T> {
    /// Creates a pool holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// If the capacity is 0.
    pub fn new(capacity: usize, recycle: fn(&mut T)) -> Self {
        assert!(capacity > 0, "Pool needs room for at least one item");
        Pool {
            entries: ArrayQueue::new(capacity),
            recycle,
        }
    }

    /// Takes a previously donated item out, if there's any.
    pub fn take(&self) -> Option<Box<T>> {
        self.entries.pop()
    }

    /// Gives an item back for reuse.
    ///
    /// The item is cleaned first. If the pool is full, or this is a donation nested inside another
    /// donation to this same pool, the item is dropped instead.
    pub fn donate(&self, mut item: Box<T>) {
        let id = self as *const Self as *const () as usize;
        let donation = match Donation::start(id) {
            Some(donation) => donation,
            None => return,
        };
        (self.recycle)(&mut item);
        drop(donation);
        // If it's full, the item is just dropped.
        let _ = self.entries.push(item);
    }

    /// Number of items currently waiting for reuse.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the pool empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most items the pool holds.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

impl<T: ?Sized> Debug for Pool<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_struct("Pool")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Log2 of the smallest pooled array.
const MIN_BITS: u32 = 4;
/// Log2 of the largest pooled array.
const MAX_BITS: u32 = 16;

/// The smallest array length the [`ArrayPool`] keeps.
pub const MIN_POOLED: usize = 1 << MIN_BITS;
/// The largest array length the [`ArrayPool`] keeps.
pub const MAX_POOLED: usize = 1 << MAX_BITS;

fn reset<T: Default>(array: &mut [T]) {
    for item in array {
        *item = T::default();
    }
}

/// Pool of fixed-size arrays, grouped by power-of-two length.
///
/// Requests are rounded up to the next power of two. Lengths outside of
/// [`MIN_POOLED`]`..=`[`MAX_POOLED`] are allocated and freed directly.
///
/// ```rust
/// use conbucket::pool::ArrayPool;
///
/// let pool: ArrayPool<u32> = ArrayPool::new(4);
/// let mut array = pool.take(20);
/// assert_eq!(32, array.len());
/// array[3] = 42;
/// pool.donate(array);
/// let array = pool.take(32);
/// assert!(array.iter().all(|item| *item == 0));
/// ```
pub struct ArrayPool<T> {
    classes: Vec<Pool<[T]>>,
}

impl<T: Default> ArrayPool<T> {
    /// Creates the pool, keeping up to `per_class` arrays of each length.
    pub fn new(per_class: usize) -> Self {
        ArrayPool {
            classes: (MIN_BITS..=MAX_BITS)
                .map(|_| Pool::new(per_class, reset::<T>))
                .collect(),
        }
    }

    fn class(&self, len: usize) -> Option<&Pool<[T]>> {
        if !len.is_power_of_two() || len < MIN_POOLED || len > MAX_POOLED {
            return None;
        }
        self.classes
            .get((len.trailing_zeros() - MIN_BITS) as usize)
    }

    /// Takes an array of at least `len` default items.
    ///
    /// The returned array has length of `len` rounded up to the next power of two.
    pub fn take(&self, len: usize) -> Box<[T]> {
        let len = len.max(1).next_power_of_two();
        match self.class(len) {
            Some(class) => class.take().unwrap_or_else(|| allocate(len)),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(len, "Array length outside of pooled range, allocating");
                allocate(len)
            }
        }
    }

    /// Returns an array for reuse.
    ///
    /// The items are reset to their defaults.
    pub fn donate(&self, array: Box<[T]>) {
        if let Some(class) = self.class(array.len()) {
            class.donate(array);
        }
    }

    /// Number of arrays of given length waiting for reuse.
    pub fn pooled(&self, len: usize) -> usize {
        self.class(len).map(Pool::len).unwrap_or(0)
    }
}

impl<T: Default> Default for ArrayPool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY / 8)
    }
}

impl<T> Debug for ArrayPool<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_list().entries(self.classes.iter()).finish()
    }
}

fn allocate<T: Default>(len: usize) -> Box<[T]> {
    (0..len).map(|_| T::default()).collect()
}
