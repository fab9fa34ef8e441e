//! The [`HashBucket`], an open-addressed hash table resized cooperatively.
//!
//! The table lives in a single [`Segment`] of fixed capacity. When an insert can't find a free
//! slot within the probing window, the table either widens the window (if it is mostly empty and
//! the trouble is clustering) or asks for a resize. The resize goes through these states:
//!
//! * `Free`: normal operation.
//! * `GrowRequested`: someone ran out of room.
//! * `Waiting`: the thread that won the request allocates a new segment and publishes it as
//!   current, the previous one becoming the old one. The new segment has double the capacity,
//!   unless most of the slots of the old one are held by removed keys. Then it keeps the capacity
//!   and the copy just leaves the removed keys behind.
//! * `Copy`: every thread that notices (including ones that only want to read) helps. Slots of the
//!   old segment are claimed through its cursor, frozen and their entries moved.
//! * `CopyCleanup`: the thread that copied the last slot detaches the old segment and opens the
//!   table again.
//!
//! Operations snapshot the revision and the current segment, do their work and validate the
//! snapshot before trusting a lookup. A write landing in an old segment is harmless: either the
//! slot it touches is frozen already (and the write is retried after helping) or the copy moves
//! its result along.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

mod segment;

use self::segment::{Claim, Entry, Removed, Segment, Stored};
use crate::config::{Options, DEFAULT_CAPACITY, DEFAULT_PROBING};
use crate::error::Error;
use crate::existing_or_new::ExistingOrNew;
use crate::pool::ArrayPool;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
enum Status {
    Free = 0,
    GrowRequested = 1,
    Waiting = 2,
    Copy = 3,
    CopyCleanup = 4,
}

impl Status {
    fn from_usize(status: usize) -> Self {
        match status {
            0 => Status::Free,
            1 => Status::GrowRequested,
            2 => Status::Waiting,
            3 => Status::Copy,
            4 => Status::CopyCleanup,
            _ => unreachable!("BUG: Invalid bucket status {}", status),
        }
    }
}

/// What an operation saw when it started.
struct Snapshot<'g, K, V> {
    revision: usize,
    segment: Shared<'g, Segment<K, V>>,
}

impl<'g, K, V> Snapshot<'g, K, V> {
    fn segment(&self) -> &'g Segment<K, V> {
        unsafe { self.segment.deref() }
    }
}

/// A concurrent hash table with cooperative resizing.
///
/// Unlike the other containers of this crate, the bucket stores its entries in a flat array of
/// slots. When it runs out of room, the threads using it grow it together: whoever notices a
/// resize in progress copies a share of the entries instead of waiting. The table never shrinks,
/// but slots of removed keys are reclaimed by the same copying, without growing.
///
/// Values are handed out as clones.
///
/// ```rust
/// use conbucket::HashBucket;
/// use crossbeam_utils::thread;
///
/// let bucket = HashBucket::new();
/// thread::scope(|s| {
///     s.spawn(|_| {
///         for i in 0..100 {
///             bucket.set(i, i * 2);
///         }
///     });
///     s.spawn(|_| {
///         for i in 100..200 {
///             bucket.set(i, i * 2);
///         }
///     });
/// }).unwrap();
///
/// assert_eq!(200, bucket.len());
/// assert_eq!(Some(84), bucket.get(&42));
/// assert!(bucket.capacity() >= 200);
/// ```
pub struct HashBucket<K, V, S = RandomState> {
    hash_builder: S,
    current: Atomic<Segment<K, V>>,
    old: Atomic<Segment<K, V>>,
    status: CachePadded<AtomicUsize>,
    revision: CachePadded<AtomicUsize>,
    copying: AtomicUsize,
    count: AtomicIsize,
    probing: AtomicUsize,
    arrays: Arc<ArrayPool<Atomic<Entry<K, V>>>>,
}

impl<K, V> HashBucket<K, V, RandomState>
where
    K: Hash + Eq,
{
    /// Creates an empty bucket with the default capacity.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> HashBucket<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty bucket with the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(DEFAULT_CAPACITY, DEFAULT_PROBING, hasher)
    }

    /// Creates an empty bucket with the given capacity and probing window.
    pub fn with_options(options: Options, hasher: S) -> Result<Self, Error> {
        Ok(Self::build(
            options.checked_capacity()?,
            options.checked_probing()?,
            hasher,
        ))
    }

    fn build(capacity: usize, probing: usize, hash_builder: S) -> Self {
        let arrays = Arc::new(ArrayPool::default());
        let segment = Segment::new(arrays.take(capacity));
        HashBucket {
            hash_builder,
            current: Atomic::new(segment),
            old: Atomic::null(),
            status: CachePadded::new(AtomicUsize::new(Status::Free as usize)),
            revision: CachePadded::new(AtomicUsize::new(0)),
            copying: AtomicUsize::new(0),
            count: AtomicIsize::new(0),
            probing: AtomicUsize::new(probing),
            arrays,
        }
    }

    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn status(&self) -> Status {
        Status::from_usize(self.status.load(Ordering::SeqCst))
    }

    fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(
                from as usize,
                to as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Waits (and helps) until the table is free, then takes a consistent look at it.
    fn snapshot<'g>(&'g self, pin: &'g Guard) -> Snapshot<'g, K, V> {
        loop {
            let revision = self.revision.load(Ordering::SeqCst);
            if self.status() != Status::Free {
                self.help(pin);
                continue;
            }
            let segment = self.current.load(Ordering::SeqCst, pin);
            if self.revision.load(Ordering::SeqCst) == revision {
                return Snapshot { revision, segment };
            }
        }
    }

    /// Checks nothing structural happened since the snapshot was taken.
    fn is_valid(&self, snapshot: &Snapshot<K, V>, pin: &Guard) -> bool {
        self.revision.load(Ordering::SeqCst) == snapshot.revision
            && self.status() == Status::Free
            && self.copying.load(Ordering::SeqCst) == 0
            && self.current.load(Ordering::SeqCst, pin) == snapshot.segment
    }

    /// Pushes an ongoing resize forward until the table is free again.
    fn help(&self, pin: &Guard) {
        let backoff = Backoff::new();
        loop {
            match self.status() {
                Status::Free => return,
                Status::GrowRequested => {
                    if self.transition(Status::GrowRequested, Status::Waiting) {
                        self.swap_segments(pin);
                    }
                }
                Status::Copy => {
                    if !self.copy(pin) {
                        backoff.snooze();
                    }
                }
                Status::Waiting | Status::CopyCleanup => backoff.snooze(),
            }
        }
    }

    /// Capacity of the segment to replace one of the given capacity.
    ///
    /// If most of the slots are taken by removed keys, the copy alone makes enough room.
    fn next_capacity(&self, capacity: usize) -> usize {
        if self.len() * 2 < capacity {
            capacity
        } else {
            capacity * 2
        }
    }

    /// Called by the single winner of the resize request.
    fn swap_segments(&self, pin: &Guard) {
        let old = self.current.load(Ordering::SeqCst, pin);
        let capacity = self.next_capacity(unsafe { old.deref() }.capacity());
        let new = Owned::new(Segment::new(self.arrays.take(capacity)));
        // Before the new segment shows up, so nobody takes a valid snapshot of it mid-copy.
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.old.store(old, Ordering::SeqCst);
        self.current.store(new, Ordering::SeqCst);
        let copying = self.transition(Status::Waiting, Status::Copy);
        assert!(copying, "BUG: Someone else swapped the segments");

        #[cfg(feature = "tracing")]
        tracing::debug!(capacity, "Swapped in a new segment");
    }

    /// Copies slots of the old segment as long as there are any unclaimed.
    ///
    /// Returns if it did anything.
    fn copy(&self, pin: &Guard) -> bool {
        let revision = self.revision.load(Ordering::SeqCst);
        if self.status() != Status::Copy {
            return false;
        }
        self.copying.fetch_add(1, Ordering::SeqCst);
        let old_ptr = self.old.load(Ordering::SeqCst, pin);
        let new = self.current.load(Ordering::SeqCst, pin);
        if self.revision.load(Ordering::SeqCst) != revision || old_ptr.is_null() {
            // The copy we've seen is over already.
            self.copying.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        let old = unsafe { old_ptr.deref() };
        let new = unsafe { new.deref() };

        let mut done = 0;
        while let Some(index) = old.next_to_copy() {
            old.copy_slot(index, new, pin);
            done += 1;
        }
        let finished = done > 0 && old.mark_copied(done) == old.capacity();
        self.copying.fetch_sub(1, Ordering::SeqCst);

        if finished {
            self.finish_copy(old_ptr, pin);
        }
        done > 0
    }

    fn finish_copy<'g>(&self, old: Shared<'g, Segment<K, V>>, pin: &'g Guard) {
        let cleaning = self.transition(Status::Copy, Status::CopyCleanup);
        assert!(cleaning, "BUG: Copy finished twice");
        self.old.store(Shared::null(), Ordering::SeqCst);
        self.retire(old, pin);
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.status.store(Status::Free as usize, Ordering::SeqCst);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            capacity = unsafe { self.current.load(Ordering::SeqCst, pin).deref() }.capacity(),
            "Resize finished"
        );
    }

    fn retire<'g>(&self, segment: Shared<'g, Segment<K, V>>, pin: &'g Guard) {
        let arrays = Arc::clone(&self.arrays);
        unsafe {
            pin.defer_unchecked(move || {
                let slots = segment.into_owned().into_box().release();
                arrays.donate(slots);
            });
        }
    }

    fn request_grow(&self, snapshot: &Snapshot<K, V>, pin: &Guard) {
        // Someone might have grown it since we looked.
        if self.current.load(Ordering::SeqCst, pin) == snapshot.segment
            && self.transition(Status::Free, Status::GrowRequested)
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                capacity = snapshot.segment().capacity(),
                len = self.len(),
                "Requested a resize"
            );
        }
        self.help(pin);
    }

    /// Called when there's no free slot in the probing window.
    fn on_full(&self, snapshot: &Snapshot<K, V>, pin: &Guard) {
        let capacity = snapshot.segment().capacity();
        let window = self.probing.load(Ordering::Acquire);
        if self.len() * 2 < capacity && window < capacity {
            // Mostly empty, the keys just cluster. More room wouldn't help with that.
            let wider = (window * 2).min(capacity);
            self.probing.fetch_max(wider, Ordering::AcqRel);

            #[cfg(feature = "tracing")]
            tracing::trace!(window = wider, "Widened the probing window");
        } else {
            self.request_grow(snapshot, pin);
        }
    }

    /// Puts the candidate into the table.
    ///
    /// If the key is there already, its value is replaced only if `replace` is set.
    fn store<'g>(
        &'g self,
        mut candidate: Owned<Entry<K, V>>,
        replace: bool,
        pin: &'g Guard,
    ) -> Stored<'g, V> {
        loop {
            let snapshot = self.snapshot(pin);
            let segment = snapshot.segment();
            let stored = match segment.find(candidate.hash, &candidate.key, pin) {
                Some(entry) => entry.store(&mut candidate, replace, pin),
                None => {
                    let ours = candidate.own_value(pin);
                    let window = self.probing.load(Ordering::Acquire);
                    match segment.claim(candidate, window, pin) {
                        Claim::Claimed(_) => {
                            self.count.fetch_add(1, Ordering::AcqRel);
                            return Stored::New(unsafe { &ours.deref().0 });
                        }
                        Claim::Found(entry, back) => {
                            candidate = back;
                            entry.store(&mut candidate, replace, pin)
                        }
                        Claim::Frozen(back) => {
                            candidate = back;
                            Stored::Frozen
                        }
                        Claim::Full(back) => {
                            candidate = back;
                            self.on_full(&snapshot, pin);
                            continue;
                        }
                    }
                }
            };
            match stored {
                Stored::Frozen => self.help(pin),
                Stored::New(value) => {
                    self.count.fetch_add(1, Ordering::AcqRel);
                    return Stored::New(value);
                }
                stored => return stored,
            }
        }
    }

    fn lookup<'g, Q>(&'g self, key: &Q, pin: &'g Guard) -> Option<&'g V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let hash = self.hash(key);
        loop {
            let snapshot = self.snapshot(pin);
            let found = snapshot
                .segment()
                .find(hash, key, pin)
                .and_then(|entry| entry.value(pin));
            if self.is_valid(&snapshot, pin) {
                return found;
            }
            self.help(pin);
        }
    }

    /// Adds a new key-value pair.
    ///
    /// Fails with [`Error::DuplicateKey`] if the key is present already, leaving the stored value
    /// alone.
    pub fn add(&self, key: K, value: V) -> Result<(), Error> {
        if self.try_add(key, value) {
            Ok(())
        } else {
            Err(Error::DuplicateKey)
        }
    }

    /// Adds a new key-value pair, unless the key is present.
    ///
    /// Returns whether it got added.
    pub fn try_add(&self, key: K, value: V) -> bool {
        let pin = crossbeam_epoch::pin();
        let hash = self.hash(&key);
        let candidate = Owned::new(Entry::new(hash, key, value));
        matches!(self.store(candidate, false, &pin), Stored::New(_))
    }

    /// Stores the value under the key, replacing the previous one.
    ///
    /// Returns the previous value.
    pub fn set(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let hash = self.hash(&key);
        let candidate = Owned::new(Entry::new(hash, key, value));
        match self.store(candidate, true, &pin) {
            Stored::Replaced(previous) => Some(previous.clone()),
            Stored::New(_) => None,
            Stored::Existing(_) | Stored::Frozen => {
                unreachable!("BUG: Replacing store left the value alone")
            }
        }
    }

    /// Looks up the value of the key, or adds one created by the closure.
    ///
    /// The closure is called only if the key is missing, but it still may lose to a concurrent
    /// add of the same key.
    pub fn get_or_add_with<F>(&self, key: K, create: F) -> ExistingOrNew<V>
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        if let Some(existing) = self.lookup(&key, &pin) {
            return ExistingOrNew::Existing(existing.clone());
        }
        let hash = self.hash(&key);
        let candidate = Owned::new(Entry::new(hash, key, create()));
        match self.store(candidate, false, &pin) {
            Stored::New(value) => ExistingOrNew::New(value.clone()),
            Stored::Existing(value) => ExistingOrNew::Existing(value.clone()),
            Stored::Replaced(_) | Stored::Frozen => {
                unreachable!("BUG: Non-replacing store replaced a value")
            }
        }
    }

    /// Looks up the value of the key, or adds the provided one.
    ///
    /// Either way, the value now stored is returned.
    pub fn get_or_add(&self, key: K, value: V) -> V
    where
        V: Clone,
    {
        self.get_or_add_with(key, || value).into_inner()
    }

    /// Looks up the value of a key.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.lookup(key, &pin).cloned()
    }

    /// Checks if the key is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.lookup(key, &pin).is_some()
    }

    /// Removes the key, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let hash = self.hash(key);
        loop {
            let snapshot = self.snapshot(&pin);
            let removed = match snapshot.segment().find(hash, key, &pin) {
                Some(entry) => entry.remove(&pin),
                None => Removed::Empty,
            };
            match removed {
                Removed::Value(value) => {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Some(value.clone());
                }
                Removed::Empty if self.is_valid(&snapshot, &pin) => return None,
                Removed::Empty | Removed::Frozen => self.help(&pin),
            }
        }
    }

    /// Removes all the values.
    ///
    /// This removes the entries one by one, values added concurrently may survive. The capacity
    /// stays the same.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        'retry: loop {
            let snapshot = self.snapshot(&pin);
            let segment = snapshot.segment();
            for index in 0..segment.capacity() {
                if let Some(entry) = segment.entry_at(index, &pin) {
                    match entry.remove(&pin) {
                        Removed::Value(_) => {
                            self.count.fetch_sub(1, Ordering::AcqRel);
                        }
                        Removed::Empty => (),
                        Removed::Frozen => {
                            self.help(&pin);
                            continue 'retry;
                        }
                    }
                }
            }
            return;
        }
    }

    /// Iterates through copies of the key-value pairs.
    ///
    /// The iterator walks the segment current at the time of the call. Changes made during the
    /// iteration may or may not show up. If the bucket grows meanwhile, values changed after the
    /// growth may be missed.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let pin = crossbeam_epoch::pin();
        let segment: *const Segment<K, V> = self.snapshot(&pin).segment();
        Iter {
            pin,
            segment,
            next: 0,
            _bucket: PhantomData,
        }
    }
}

impl<K, V, S> HashBucket<K, V, S> {
    /// Number of keys with a value.
    pub fn len(&self) -> usize {
        // Removal may be counted before the insert it removes.
        self.count.load(Ordering::Acquire).max(0) as usize
    }

    /// Checks if the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots in the current segment.
    pub fn capacity(&self) -> usize {
        let pin = crossbeam_epoch::pin();
        let segment = self.current.load(Ordering::Acquire, &pin);
        unsafe { segment.deref() }.capacity()
    }
}

impl<K, V> Default for HashBucket<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for HashBucket<K, V, S>
where
    K: Debug + Clone + Hash + Eq,
    V: Debug + Clone,
    S: BuildHasher,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Drop for HashBucket<K, V, S> {
    fn drop(&mut self) {
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            // An unfinished copy leaves entries in both, the old one frees only what wasn't moved.
            let old = self.old.load(Ordering::Relaxed, pin);
            if !old.is_null() {
                old.into_owned().free_entries();
            }
            self.current
                .load(Ordering::Relaxed, pin)
                .into_owned()
                .free_entries();
        }
    }
}

/// The iterator of the [`HashBucket`].
///
/// See the [`iter`][HashBucket::iter] method.
pub struct Iter<'a, K, V> {
    pin: Guard,
    // Kept alive by the pin, and the bucket can't drop it while borrowed.
    segment: *const Segment<K, V>,
    next: usize,
    _bucket: PhantomData<&'a Segment<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let segment = unsafe { &*self.segment };
        while self.next < segment.capacity() {
            let index = self.next;
            self.next += 1;
            if let Some(entry) = segment.entry_at(index, &self.pin) {
                if let Some(value) = entry.value(&self.pin) {
                    return Some((entry.key.clone(), value.clone()));
                }
            }
        }
        None
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashBucket<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a HashBucket<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in iter {
            self.set(k, v);
        }
    }
}

impl<K, V, S> Extend<(K, V)> for HashBucket<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &HashBucket<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for HashBucket<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = HashBucket::new();
        me.extend(iter);
        me
    }
}
