//! The core implementation of the concurrent trie-indexed array.
//!
//! This module contains the [`Mapper`][crate::raw::Mapper] type, which is the engine of the
//! dictionary, set and queue in this crate. This is exposed to allow wrapping it into further
//! APIs, but is probably not the best thing for general use.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

pub mod debug;
pub mod iterator;

use crate::guarded::{Guarded, GuardedSlot, UseCount};
use crate::pool::{Pool, DEFAULT_POOL_CAPACITY};

pub(crate) const LEVEL_BITS: usize = 4;
pub(crate) const LEVEL_MASK: u32 = 0b1111;
pub(crate) const LEVEL_CELLS: usize = 16;
pub(crate) const LEVELS: usize = mem::size_of::<u32>() * 8 / LEVEL_BITS;
/// The level whose cells hold the values.
pub(crate) const LEAF_DEPTH: usize = LEVELS - 1;

/// The cell of an index at given depth.
///
/// The most significant nibble selects the cell of the root.
fn nibble(index: u32, depth: usize) -> usize {
    ((index >> ((LEAF_DEPTH - depth) * LEVEL_BITS)) & LEVEL_MASK) as usize
}

pub(crate) enum Cells<V> {
    Inner([GuardedSlot<Branch<V>>; LEVEL_CELLS]),
    Leaf([Atomic<V>; LEVEL_CELLS]),
}

/// A node of the trie.
///
/// Branches at the last level hold the values directly, the ones above hold other branches.
pub(crate) struct Branch<V> {
    uses: UseCount,
    depth: usize,
    /// Which cell of the parent this branch occupies.
    index: usize,
    cells: Cells<V>,
}

impl<V> Guarded for Branch<V> {
    fn use_count(&self) -> &UseCount {
        &self.uses
    }
}

impl<V> Branch<V> {
    fn new(depth: usize, index: usize) -> Self {
        let cells = if depth == LEAF_DEPTH {
            Cells::Leaf(Default::default())
        } else {
            Cells::Inner(Default::default())
        };
        Branch {
            uses: UseCount::default(),
            depth,
            index,
            cells,
        }
    }

    fn children(&self) -> &[GuardedSlot<Branch<V>>; LEVEL_CELLS] {
        match &self.cells {
            Cells::Inner(children) => children,
            Cells::Leaf(_) => unreachable!("BUG: Descending below the last level"),
        }
    }

    fn values(&self) -> &[Atomic<V>; LEVEL_CELLS] {
        match &self.cells {
            Cells::Leaf(values) => values,
            Cells::Inner(_) => unreachable!("BUG: Looking for values above the last level"),
        }
    }

    /// Only empty branches get retired, so there's nothing to clean except the use count.
    fn recycle(branch: &mut Branch<V>) {
        branch.uses.reset();
    }

    /// Frees everything below this branch.
    ///
    /// Must have exclusive access to the whole sub-trie.
    unsafe fn free_children(&self) {
        let pin = crossbeam_epoch::unprotected();
        match &self.cells {
            Cells::Inner(children) => {
                for child in children {
                    let child = child.load(pin);
                    if !child.is_null() {
                        let child = child.into_owned();
                        child.free_children();
                        drop(child);
                    }
                }
            }
            Cells::Leaf(values) => {
                for value in values {
                    let value = value.load(Ordering::Relaxed, pin);
                    if !value.is_null() {
                        drop(value.into_owned());
                    }
                }
            }
        }
    }
}

/// Pools of retired branches, ready for reuse.
///
/// One of these may be shared by multiple [`Mapper`]s (eg. the old and new table of a cleared
/// dictionary).
pub struct BranchPools<V> {
    inner: Pool<Branch<V>>,
    leaves: Pool<Branch<V>>,
}

impl<V> BranchPools<V> {
    /// Creates the pools, each keeping at most `capacity` branches.
    pub fn new(capacity: usize) -> Self {
        BranchPools {
            inner: Pool::new(capacity, Branch::recycle),
            leaves: Pool::new(capacity, Branch::recycle),
        }
    }

    fn pool(&self, depth: usize) -> &Pool<Branch<V>> {
        if depth == LEAF_DEPTH {
            &self.leaves
        } else {
            &self.inner
        }
    }

    fn take(&self, depth: usize, index: usize) -> Owned<Branch<V>> {
        match self.pool(depth).take() {
            Some(mut branch) => {
                branch.depth = depth;
                branch.index = index;
                Owned::from(branch)
            }
            None => Owned::new(Branch::new(depth, index)),
        }
    }

    fn donate(&self, branch: Owned<Branch<V>>) {
        let branch = branch.into_box();
        self.pool(branch.depth).donate(branch);
    }

    /// Number of pooled inner (non-leaf) branches.
    pub fn inner_len(&self) -> usize {
        self.inner.len()
    }

    /// Number of pooled leaf branches.
    pub fn leaf_len(&self) -> usize {
        self.leaves.len()
    }
}

impl<V> Default for BranchPools<V> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl<V> Debug for BranchPools<V> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_struct("BranchPools")
            .field("inner", &self.inner)
            .field("leaves", &self.leaves)
            .finish()
    }
}

/// An insert found the index already taken.
///
/// The rejected value is handed back.
#[derive(Debug)]
pub struct Occupied<'g, V> {
    /// What is stored at the index.
    pub existing: &'g V,
    /// The value that didn't make it in.
    pub value: V,
}

/// Result of [`Mapper::try_get_check_set`].
#[derive(Debug)]
pub enum CheckSet<'g, V> {
    /// The index was empty, the value got stored.
    Inserted(&'g V),
    /// The check approved the previous value and it got replaced.
    Replaced {
        /// The value that was there before.
        previous: &'g V,
        /// The newly stored value.
        current: &'g V,
    },
    /// The check refused the stored value.
    Rejected(Occupied<'g, V>),
}

/// One step down the trie, remembered to leave it on the way back.
struct Step<'g, V> {
    slot: &'g GuardedSlot<Branch<V>>,
    parent: &'g Branch<V>,
    node: Shared<'g, Branch<V>>,
}

type Path<'g, V> = ArrayVec<Step<'g, V>, LEAF_DEPTH>;

/// The trie-indexed growable array.
///
/// Maps every 32-bit index to an optional value. The indices are split into 8 nibbles, each
/// selecting a cell of a 16-way branch. Branches are created on demand by the writers and retired
/// once they become empty, so the memory follows the occupied indices, not the largest one.
///
/// As a general rule, this data structure takes the [`crossbeam_epoch`] [`Guard`] and returns
/// borrowed data whenever appropriate. Even the methods that remove or replace values return them
/// borrowed, because some other thread might still be looking at them. They are scheduled for
/// destruction once the epoch ends.
///
/// Writers register in every branch on their way down (see the guarded slot), readers only follow
/// the pointers.
///
/// ```rust
/// use conbucket::raw::Mapper;
///
/// let mapper = Mapper::new();
/// let pin = crossbeam_epoch::pin();
/// assert!(mapper.insert(1 << 31, "hello", &pin).is_ok());
/// assert_eq!(Some(&"hello"), mapper.get(1 << 31, &pin));
/// assert_eq!(Some(&"hello"), mapper.remove_at(1 << 31, &pin));
/// assert!(mapper.is_empty());
/// ```
pub struct Mapper<V> {
    root: Branch<V>,
    count: AtomicUsize,
    pools: Arc<BranchPools<V>>,
}

impl<V> Mapper<V> {
    /// Creates an empty mapper with its own branch pools.
    pub fn new() -> Self {
        Self::with_pools(Arc::new(BranchPools::default()))
    }

    /// Creates an empty mapper recycling branches through the given pools.
    pub fn with_pools(pools: Arc<BranchPools<V>>) -> Self {
        Mapper {
            root: Branch::new(0, 0),
            count: AtomicUsize::new(0),
            pools,
        }
    }

    /// The pools this mapper recycles its branches through.
    pub fn pools(&self) -> &Arc<BranchPools<V>> {
        &self.pools
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Is the mapper empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the leaf for the index, without entering anything.
    fn leaf<'g>(&'g self, index: u32, pin: &'g Guard) -> Option<&'g Branch<V>> {
        let mut node = &self.root;
        for depth in 0..LEAF_DEPTH {
            let child = node.children()[nibble(index, depth)].load(pin);
            node = unsafe { child.as_ref() }?;
        }
        Some(node)
    }

    /// Enters all the branches down to the leaf for the index.
    ///
    /// If `create` is set, missing branches are created. Otherwise the descent stops at the first
    /// missing one and `None` is returned. Either way, whatever got entered is recorded in the
    /// path and needs to be left with [`ascend`][Mapper::ascend].
    fn descend<'g>(
        &'g self,
        index: u32,
        create: bool,
        path: &mut Path<'g, V>,
        pin: &'g Guard,
    ) -> Option<&'g Branch<V>> {
        let mut node = &self.root;
        for depth in 0..LEAF_DEPTH {
            let cell = nibble(index, depth);
            let slot = &node.children()[cell];
            let child = if create {
                slot.enter_or_create(
                    &node.uses,
                    pin,
                    || self.pools.take(depth + 1, cell),
                    |unused| self.pools.donate(unused),
                )
            } else {
                slot.enter(&node.uses, pin)?
            };
            path.push(Step {
                slot,
                parent: node,
                node: child,
            });
            node = unsafe { child.deref() };
        }
        Some(node)
    }

    /// Leaves the branches in reverse order, retiring the ones that ended up empty.
    fn ascend<'g>(&'g self, path: Path<'g, V>, pin: &'g Guard) {
        for step in path.into_iter().rev() {
            step.slot.leave(step.node, &step.parent.uses, pin, |branch| {
                self.retire(branch, pin)
            });
        }
    }

    fn retire<'g>(&self, branch: Shared<'g, Branch<V>>, pin: &'g Guard) {
        let pools = Arc::clone(&self.pools);
        unsafe {
            pin.defer_unchecked(move || pools.donate(branch.into_owned()));
        }
    }

    /// Runs `f` on the leaf of the index, creating the branches on the way as needed.
    fn with_leaf<'g, R, F>(&'g self, index: u32, pin: &'g Guard, f: F) -> R
    where
        F: FnOnce(&'g Branch<V>) -> R,
    {
        let mut path = Path::new();
        let leaf = self
            .descend(index, true, &mut path, pin)
            .expect("BUG: Creating descent doesn't stop early");
        let result = f(leaf);
        self.ascend(path, pin);
        result
    }

    /// Runs `f` on the leaf of the index, if the leaf exists.
    fn with_existing_leaf<'g, R, F>(&'g self, index: u32, pin: &'g Guard, f: F) -> Option<R>
    where
        F: FnOnce(&'g Branch<V>) -> R,
    {
        let mut path = Path::new();
        let result = self.descend(index, false, &mut path, pin).map(f);
        self.ascend(path, pin);
        result
    }

    /// Counts a value about to be stored.
    ///
    /// Must happen before the value is published, a concurrent removal may vacate it right away.
    fn occupy(&self, leaf: &Branch<V>) {
        leaf.uses.occupy();
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn vacated(&self, leaf: &Branch<V>) {
        leaf.uses.vacate();
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Looks up the value at the index.
    pub fn get<'g>(&'g self, index: u32, pin: &'g Guard) -> Option<&'g V> {
        let leaf = self.leaf(index, pin)?;
        let value = leaf.values()[nibble(index, LEAF_DEPTH)].load(Ordering::Acquire, pin);
        unsafe { value.as_ref() }
    }

    /// Stores the value, but only if the index is empty.
    pub fn insert<'g>(
        &'g self,
        index: u32,
        value: V,
        pin: &'g Guard,
    ) -> Result<&'g V, Occupied<'g, V>> {
        self.with_leaf(index, pin, |leaf| {
            let cell = &leaf.values()[nibble(index, LEAF_DEPTH)];
            let mut new = Owned::new(value);
            loop {
                self.occupy(leaf);
                match cell.compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                ) {
                    Ok(stored) => return Ok(unsafe { stored.deref() }),
                    Err(e) => {
                        self.vacated(leaf);
                        match unsafe { e.current.as_ref() } {
                            Some(existing) => {
                                return Err(Occupied {
                                    existing,
                                    value: *e.new.into_box(),
                                })
                            }
                            // Removed in the meantime, try again.
                            None => new = e.new,
                        }
                    }
                }
            }
        })
    }

    /// Stores the value, replacing whatever was there.
    ///
    /// Returns the previous value, if any.
    pub fn exchange<'g>(&'g self, index: u32, value: V, pin: &'g Guard) -> Option<&'g V> {
        self.with_leaf(index, pin, |leaf| {
            let cell = &leaf.values()[nibble(index, LEAF_DEPTH)];
            self.occupy(leaf);
            let previous = cell.swap(Owned::new(value), Ordering::AcqRel, pin);
            if previous.is_null() {
                None
            } else {
                self.vacated(leaf);
                unsafe {
                    let result = previous.deref();
                    pin.defer_destroy(previous);
                    Some(result)
                }
            }
        })
    }

    /// Stores the value unconditionally.
    ///
    /// Returns true if the index was empty before.
    pub fn set<'g>(&'g self, index: u32, value: V, pin: &'g Guard) -> bool {
        self.exchange(index, value, pin).is_none()
    }

    /// Empties the index.
    pub fn remove_at<'g>(&'g self, index: u32, pin: &'g Guard) -> Option<&'g V> {
        self.try_get_check_remove_at(index, |_| true, pin)
    }

    /// Stores the value if the index is empty or the `check` approves what is stored there.
    ///
    /// The check may be called multiple times, if the stored value keeps changing under our
    /// hands.
    pub fn try_get_check_set<'g, F>(
        &'g self,
        index: u32,
        value: V,
        mut check: F,
        pin: &'g Guard,
    ) -> CheckSet<'g, V>
    where
        F: FnMut(&V) -> bool,
    {
        self.with_leaf(index, pin, |leaf| {
            let cell = &leaf.values()[nibble(index, LEAF_DEPTH)];
            let mut new = Owned::new(value);
            loop {
                let current = cell.load(Ordering::Acquire, pin);
                let existing = unsafe { current.as_ref() };
                if let Some(existing) = existing {
                    if !check(existing) {
                        return CheckSet::Rejected(Occupied {
                            existing,
                            value: *new.into_box(),
                        });
                    }
                }
                if existing.is_none() {
                    self.occupy(leaf);
                }
                match cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, pin)
                {
                    Ok(stored) => {
                        let stored = unsafe { stored.deref() };
                        return match existing {
                            None => CheckSet::Inserted(stored),
                            Some(previous) => {
                                unsafe { pin.defer_destroy(current) };
                                CheckSet::Replaced {
                                    previous,
                                    current: stored,
                                }
                            }
                        };
                    }
                    Err(e) => {
                        if existing.is_none() {
                            self.vacated(leaf);
                        }
                        new = e.new;
                    }
                }
            }
        })
    }

    /// Empties the index if the `check` approves the stored value.
    pub fn try_get_check_remove_at<'g, F>(
        &'g self,
        index: u32,
        mut check: F,
        pin: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnMut(&V) -> bool,
    {
        self.with_existing_leaf(index, pin, |leaf| {
            let cell = &leaf.values()[nibble(index, LEAF_DEPTH)];
            loop {
                let current = cell.load(Ordering::Acquire, pin);
                let existing = unsafe { current.as_ref() }?;
                if !check(existing) {
                    return None;
                }
                if cell
                    .compare_exchange(
                        current,
                        Shared::null(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        pin,
                    )
                    .is_ok()
                {
                    self.vacated(leaf);
                    unsafe { pin.defer_destroy(current) };
                    return Some(existing);
                }
            }
        })
        .flatten()
    }

    /// Walks the stored values in the order of their indices.
    pub fn iter(&self) -> iterator::Iter<'_, V> {
        iterator::Iter::new(self)
    }

    /// Walks the stored values accepted by the predicate, in the order of their indices.
    pub fn filter<P>(&self, predicate: P) -> iterator::Where<'_, V, P>
    where
        P: FnMut(u32, &V) -> bool,
    {
        iterator::Where::new(self.iter(), predicate)
    }
}

impl<V> Drop for Mapper<V> {
    fn drop(&mut self) {
        // We are &mut, nobody else is looking. Deferring to the pools is pointless too, branches
        // freed here still carry stale pointers.
        unsafe { self.root.free_children() };
    }
}

impl<V> Default for Mapper<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Debug> Debug for Mapper<V> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut map = fmt.debug_map();
        let mut iter = self.iter();
        while let Some((index, value)) = iter.next() {
            map.entry(&index, value);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_epoch::Collector;
    use crossbeam_utils::thread;

    use super::*;

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10000;
    const TEST_REP: usize = 20;

    #[test]
    fn consts_consistent() {
        assert_eq!(LEVEL_BITS, LEVEL_MASK.count_ones() as usize);
        assert_eq!(LEVEL_BITS, (!LEVEL_MASK).trailing_zeros() as usize);
        assert_eq!(LEVEL_CELLS, 2usize.pow(LEVEL_BITS as u32));
        assert_eq!(8, LEVELS);
    }

    #[test]
    fn nibbles() {
        let index = 0x1234_5678;
        let nibbles = (0..LEVELS).map(|d| nibble(index, d)).collect::<Vec<_>>();
        assert_eq!(vec![1, 2, 3, 4, 5, 6, 7, 8], nibbles);
        assert_eq!(0xF, nibble(u32::MAX, 0));
        assert_eq!(0xF, nibble(u32::MAX, LEAF_DEPTH));
    }

    #[test]
    fn insert_get_remove() {
        let mut mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        assert!(mapper.get(42, &pin).is_none());
        assert_eq!(Ok(&"hello"), mapper.insert(42, "hello", &pin).map_err(|_| ()));
        assert_eq!(Some(&"hello"), mapper.get(42, &pin));
        assert!(mapper.get(43, &pin).is_none());
        assert_eq!(1, mapper.len());

        let occupied = mapper.insert(42, "world", &pin).unwrap_err();
        assert_eq!("hello", *occupied.existing);
        assert_eq!("world", occupied.value);

        assert_eq!(Some(&"hello"), mapper.remove_at(42, &pin));
        assert!(mapper.remove_at(42, &pin).is_none());
        assert!(mapper.is_empty());
        drop(pin);
        mapper.assert_pruned();
    }

    /// Indices spread all over the range, one at a time in the end.
    #[test]
    fn far_apart_indices() {
        let mut mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        let indices = [0, 1 << 16, (1 << 31) - 1, u32::MAX];
        for (i, index) in indices.iter().enumerate() {
            assert!(mapper.set(*index, i, &pin));
        }
        assert_eq!(indices.len(), mapper.len());
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(Some(&i), mapper.get(*index, &pin));
        }
        for index in &indices {
            assert!(mapper.remove_at(*index, &pin).is_some());
        }
        assert_eq!(0, mapper.len());
        drop(pin);
        mapper.assert_pruned();
    }

    #[test]
    fn exchange_and_set() {
        let mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        assert!(mapper.set(7, 1, &pin));
        assert!(!mapper.set(7, 2, &pin));
        assert_eq!(Some(&2), mapper.exchange(7, 3, &pin));
        assert_eq!(Some(&3), mapper.get(7, &pin));
        assert_eq!(1, mapper.len());
    }

    #[test]
    fn check_set() {
        let mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        match mapper.try_get_check_set(3, 10, |_| panic!("Nothing to check"), &pin) {
            CheckSet::Inserted(v) => assert_eq!(10, *v),
            other => panic!("Unexpected {:?}", other),
        }
        match mapper.try_get_check_set(3, 20, |v| *v == 10, &pin) {
            CheckSet::Replaced { previous, current } => {
                assert_eq!(10, *previous);
                assert_eq!(20, *current);
            }
            other => panic!("Unexpected {:?}", other),
        }
        match mapper.try_get_check_set(3, 30, |v| *v == 10, &pin) {
            CheckSet::Rejected(Occupied { existing, value }) => {
                assert_eq!(20, *existing);
                assert_eq!(30, value);
            }
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(1, mapper.len());

        assert!(mapper.try_get_check_remove_at(3, |v| *v == 10, &pin).is_none());
        assert_eq!(Some(&20), mapper.try_get_check_remove_at(3, |v| *v == 20, &pin));
        assert!(mapper.try_get_check_remove_at(3, |_| true, &pin).is_none());
        assert!(mapper.is_empty());
    }

    #[test]
    fn iter_in_index_order() {
        let mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        for index in &[u32::MAX, 5, 1 << 20, 0, 17] {
            mapper.set(*index, *index as u64 * 2, &pin);
        }
        let mut iter = mapper.iter();
        let mut seen = Vec::new();
        while let Some((index, value)) = iter.next() {
            assert_eq!(index as u64 * 2, *value);
            seen.push(index);
        }
        assert_eq!(vec![0, 5, 17, 1 << 20, u32::MAX], seen);

        let mut odd = mapper.filter(|index, _| index % 2 == 1);
        let mut seen = Vec::new();
        while let Some((index, _)) = odd.next() {
            seen.push(index);
        }
        assert_eq!(vec![5, 17, u32::MAX], seen);
    }

    #[test]
    fn debug_lists_values() {
        let mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        mapper.set(2, "b", &pin);
        mapper.set(1, "a", &pin);
        assert_eq!(r#"{1: "a", 2: "b"}"#, format!("{:?}", mapper));
    }

    /// Retired branches make it back into the pools and get reused.
    #[test]
    fn branches_recycled() {
        // A private collector, so the garbage is ours to collect.
        let collector = Collector::new();
        let handle = collector.register();
        let mut mapper = Mapper::new();

        {
            let pin = handle.pin();
            mapper.set(12345, 1, &pin);
            mapper.remove_at(12345, &pin);
        }
        for _ in 0..128 {
            handle.pin().flush();
            if mapper.pools().leaf_len() == 1 {
                break;
            }
        }
        assert_eq!(1, mapper.pools().leaf_len());
        assert_eq!(LEAF_DEPTH - 1, mapper.pools().inner_len());

        {
            let pin = handle.pin();
            mapper.set(999, 2, &pin);
            assert_eq!(Some(&2), mapper.get(999, &pin));
        }
        assert_eq!(0, mapper.pools().leaf_len());
        assert_eq!(0, mapper.pools().inner_len());
        mapper.assert_pruned();
    }

    /// Multiple threads inserting into and removing from neighbouring indices (sharing the leaf
    /// branches), the trie must end up pruned.
    #[test]
    fn par_insert_remove() {
        for _ in 0..TEST_REP {
            let mut mapper: Mapper<usize> = Mapper::new();
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let mapper = &mapper;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH / 10 {
                            let index = (i * TEST_THREADS + t) as u32;
                            let pin = crossbeam_epoch::pin();
                            assert!(mapper.insert(index, i, &pin).is_ok());
                            assert_eq!(Some(&i), mapper.get(index, &pin));
                            assert_eq!(Some(&i), mapper.remove_at(index, &pin));
                        }
                    });
                }
            })
            .unwrap();
            assert!(mapper.is_empty());
            mapper.assert_pruned();
        }
    }

    /// All the threads fight over the same few indices.
    #[test]
    fn par_same_indices() {
        let mut mapper: Mapper<usize> = Mapper::new();
        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let mapper = &mapper;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH {
                        let index = (i % 4) as u32 * 0x1000_0000;
                        let pin = crossbeam_epoch::pin();
                        if (i + t) % 2 == 0 {
                            mapper.set(index, i, &pin);
                        } else {
                            mapper.remove_at(index, &pin);
                        }
                    }
                });
            }
        })
        .unwrap();
        let pin = crossbeam_epoch::pin();
        let present = (0..4)
            .filter(|i| mapper.get(i * 0x1000_0000, &pin).is_some())
            .count();
        assert_eq!(present, mapper.len());
        drop(pin);
        mapper.assert_pruned();
    }
}
