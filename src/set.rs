//! The [`ConSet`] and other related structures.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::config::{checked_probing, Trivial as TrivialConfig, DEFAULT_PROBING};
use crate::error::Error;
use crate::probe::{home, Claim, Current, Pools, Probed, Record};
use crate::raw;

type Table<T> = Probed<TrivialConfig<T>>;

/// A concurrent lock-free set.
///
/// Values returned by looking up (or removing) are always copied using the `Clone` trait.
/// Therefore, the set is more suitable for types that are cheap to copy (eg. `u64` or `IpAddr`).
///
/// If you intend to store types that are more expensive to make copies of or are not `Clone`, you
/// can wrap them in an `Arc` (eg. `Arc<str>`).
///
/// ```rust
/// use conbucket::ConSet;
/// use crossbeam_utils::thread;
///
/// let set = ConSet::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         set.try_add("hello");
///     });
///     s.spawn(|_| {
///         set.try_add("world");
///     });
/// }).unwrap();
///
/// assert_eq!(Some("hello"), set.get("hello"));
/// assert_eq!(Some("world"), set.get("world"));
/// assert_eq!(None, set.get("universe"));
/// set.remove("world");
/// assert_eq!(None, set.get("world"));
/// ```
///
/// ```rust
/// use conbucket::set::ConSet;
/// let set: ConSet<usize> = ConSet::new();
///
/// set.add_new(0).unwrap();
/// set.add_new(1).unwrap();
/// assert!(set.add_new(1).is_err());
///
/// assert!(set.contains(&1));
///
/// set.remove(&1);
/// assert!(!set.contains(&1));
///
/// set.remove(&0);
/// assert!(set.is_empty());
/// ```
pub struct ConSet<T, S = RandomState>
where
    T: Hash + Eq,
{
    hash_builder: S,
    probing: usize,
    pools: Arc<Pools<T>>,
    table: Current<Table<T>>,
}

impl<T> ConSet<T, RandomState>
where
    T: Hash + Eq,
{
    /// Creates a new empty set.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<T, S> ConSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new empty set with the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(DEFAULT_PROBING, hasher)
    }

    /// Creates a new empty set with the given initial probing window and hasher.
    pub fn with_probing_and_hasher(probing: usize, hasher: S) -> Result<Self, Error> {
        Ok(Self::build(checked_probing(probing)?, hasher))
    }

    fn build(probing: usize, hash_builder: S) -> Self {
        let pools = Arc::new(Pools::default());
        let table = Current::new(Probed::new(probing, Arc::clone(&pools)));
        ConSet {
            hash_builder,
            probing,
            pools,
            table,
        }
    }

    /// Inserts a new value into the set.
    ///
    /// Fails with [`Error::DuplicateKey`] if an equal value is present already.
    pub fn add_new(&self, value: T) -> Result<(), Error> {
        if self.try_add(value) {
            Ok(())
        } else {
            Err(Error::DuplicateKey)
        }
    }

    /// Inserts a new value into the set, unless an equal one is there.
    ///
    /// Returns whether it got inserted.
    pub fn try_add(&self, value: T) -> bool {
        let pin = crossbeam_epoch::pin();
        let home = home(&self.hash_builder, &value);
        matches!(
            self.table.get(&pin).insert(home, value, &pin),
            Claim::New(_)
        )
    }

    /// Looks up a value in the set.
    ///
    /// This creates a copy of the original value.
    pub fn get<Q>(&self, key: &Q) -> Option<T>
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q> + Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .get(home(&self.hash_builder, key), key, &pin)
            .cloned()
    }

    /// Checks if a value identified by the given key is present in the set.
    ///
    /// Note that by the time you can act on it, the presence of the value can change (eg. other
    /// thread can add or remove it in the meantime).
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .get(home(&self.hash_builder, key), key, &pin)
            .is_some()
    }

    /// Removes an element identified by the given key, returning it.
    pub fn remove<Q>(&self, key: &Q) -> Option<T>
    where
        Q: ?Sized + Eq + Hash,
        T: Borrow<Q> + Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .remove(home(&self.hash_builder, key), key, &pin)
            .cloned()
    }

    /// Removes all the values matching the predicate.
    ///
    /// Returns how many this call removed.
    pub fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: FnMut(&T) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        self.table.get(&pin).remove_where(predicate, &pin)
    }
}

impl<T, S> ConSet<T, S>
where
    T: Hash + Eq,
{
    /// Number of values in the set.
    pub fn len(&self) -> usize {
        let pin = crossbeam_epoch::pin();
        self.table.get(&pin).len()
    }

    /// Checks if the set is currently empty.
    ///
    /// Note that due to being concurrent, the use-case of this method is mostly for debugging
    /// purposes, because the state can change between reading the value and acting on it.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all the values.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.table
            .replace(Probed::new(self.probing, Arc::clone(&self.pools)), &pin);
    }

    /// Returns an iterator through the elements of the set.
    pub fn iter(&self) -> Iter<'_, T> {
        let pin = crossbeam_epoch::pin();
        let table: *const Table<T> = self.table.get(&pin);
        // The pin moves into the iterator, keeping the table alive even if it is cleared.
        let inner = unsafe { raw::iterator::Iter::with_pin((*table).mapper(), pin) };
        Iter { inner }
    }
}

impl<T> Default for ConSet<T, RandomState>
where
    T: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> Debug for ConSet<T, S>
where
    T: Debug + Clone + Hash + Eq,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_set().entries(self.iter()).finish()
    }
}

/// The iterator of the [`ConSet`].
///
/// See the [`iter`][ConSet::iter] method for details.
pub struct Iter<'a, T> {
    inner: raw::iterator::Iter<'a, Record<T>>,
}

impl<'a, T> Iterator for Iter<'a, T>
where
    T: Clone,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let (_, record) = self.inner.next()?;
            if let Some(value) = record.visible() {
                return Some(value.clone());
            }
        }
    }
}

impl<'a, T, S> IntoIterator for &'a ConSet<T, S>
where
    T: Clone + Hash + Eq,
{
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, S> Extend<T> for &'a ConSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        for n in iter {
            self.try_add(n);
        }
    }
}

impl<T, S> Extend<T> for ConSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut me: &ConSet<_, _> = self;
        me.extend(iter);
    }
}

impl<T> FromIterator<T> for ConSet<T>
where
    T: Hash + Eq,
{
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut me = ConSet::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<T, S> ParallelExtend<T> for ConSet<T, S>
where
    T: Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = T>,
    {
        let mut me: &ConSet<_, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<'a, T, S> ParallelExtend<T> for &'a ConSet<T, S>
where
    T: Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = T>,
    {
        let me: &ConSet<_, _> = self;
        par_iter.into_par_iter().for_each(|n| {
            me.try_add(n);
        });
    }
}

#[cfg(feature = "rayon")]
impl<T> FromParallelIterator<T> for ConSet<T>
where
    T: Hash + Eq + Send + Sync,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = T>,
    {
        let mut me = ConSet::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_utils::thread;

    #[cfg(feature = "rayon")]
    use rayon::prelude::*;

    use super::*;
    use crate::probe::tests::{MakeSplatHasher, NoHasher};

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10000;
    const TEST_BATCH_SMALL: usize = 100;
    const TEST_REP: usize = 20;

    #[test]
    fn debug_when_empty() {
        let set: ConSet<String> = ConSet::new();
        assert_eq!("{}", &format!("{:?}", set));
    }

    #[test]
    fn debug_when_has_elements() {
        let set: ConSet<&str, _> = ConSet::with_hasher(NoHasher);
        assert!(set.try_add("hello"));
        assert!(set.try_add("world"));
        assert_eq!(r#"{"hello", "world"}"#, format!("{:?}", set));
    }

    #[test]
    fn create_destroy() {
        let set: ConSet<String> = ConSet::new();
        drop(set);
    }

    #[test]
    fn lookup_empty() {
        let set: ConSet<String> = ConSet::new();
        assert!(set.get("hello").is_none());
    }

    #[test]
    fn add_lookup() {
        let set = ConSet::new();
        assert!(set.try_add("hello"));
        assert!(set.get("world").is_none());
        let found = set.get("hello");
        assert_eq!(Some("hello"), found);
        assert!(!set.try_add("hello"));
        assert_eq!(Err(Error::DuplicateKey), set.add_new("hello"));
        assert_eq!(1, set.len());
    }

    // Insert a lot of things, to make sure the windows overlap a lot.
    #[test]
    fn add_many() {
        let set = ConSet::new();
        for i in 0..TEST_BATCH {
            assert!(set.try_add(i));
        }

        for i in 0..TEST_BATCH {
            assert_eq!(Some(i), set.get(&i));
        }
    }

    #[test]
    fn par_add_many() {
        for _ in 0..TEST_REP {
            let set: ConSet<usize> = ConSet::new();
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let set = &set;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert!(set.try_add(num));
                        }
                    });
                }
            })
            .unwrap();

            for i in 0..TEST_BATCH * TEST_THREADS {
                assert_eq!(set.get(&i).unwrap(), i);
            }
        }
    }

    #[test]
    fn par_get_many() {
        for _ in 0..TEST_REP {
            let set = ConSet::new();
            for i in 0..TEST_BATCH * TEST_THREADS {
                assert!(set.try_add(i));
            }
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let set = &set;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert_eq!(set.get(&num).unwrap(), num);
                        }
                    });
                }
            })
            .unwrap();
        }
    }

    #[test]
    fn collisions() {
        let set = ConSet::with_hasher(NoHasher);
        // While their hash is the same under the hasher, they don't kick each other out.
        for i in 0..TEST_BATCH_SMALL {
            assert!(set.try_add(i));
        }
        // And all are present.
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, set.get(&i).unwrap());
        }
        // But adding the same value again is refused.
        for i in 0..TEST_BATCH_SMALL {
            assert!(!set.try_add(i));
        }
    }

    #[test]
    fn bad_hasher() {
        let set = ConSet::with_hasher(MakeSplatHasher);
        for i in 0..TEST_BATCH_SMALL * 10 {
            assert!(set.try_add(i));
        }
        assert_eq!(TEST_BATCH_SMALL * 10, set.len());
        for i in 0..TEST_BATCH_SMALL * 10 {
            assert!(set.contains(&i));
        }
    }

    #[test]
    fn simple_remove() {
        let set = ConSet::new();
        assert!(set.remove(&42).is_none());
        assert!(set.try_add(42));
        assert_eq!(42, set.get(&42).unwrap());
        assert_eq!(42, set.remove(&42).unwrap());
        assert!(set.get(&42).is_none());
        assert!(set.is_empty());
        assert!(set.remove(&42).is_none());
        assert!(set.is_empty());
    }

    fn remove_many_inner<H: BuildHasher>(set: ConSet<usize, H>, len: usize) {
        for i in 0..len {
            assert!(set.try_add(i));
        }
        for i in 0..len {
            assert_eq!(i, set.get(&i).unwrap());
            assert_eq!(i, set.remove(&i).unwrap());
            assert!(set.get(&i).is_none());
        }

        assert!(set.is_empty());
    }

    #[test]
    fn remove_many() {
        remove_many_inner(ConSet::new(), TEST_BATCH);
    }

    #[test]
    fn remove_many_collision() {
        remove_many_inner(ConSet::with_hasher(NoHasher), TEST_BATCH_SMALL);
    }

    /// Colliding values get added and removed all the time. Every value may be added again only
    /// after someone removed it.
    #[test]
    fn par_add_remove_collisions() {
        const VALUES: usize = 16;
        for _ in 0..TEST_REP {
            let set = ConSet::with_hasher(NoHasher);
            let balances = thread::scope(|s| {
                let handles = (0..TEST_THREADS)
                    .map(|t| {
                        let set = &set;
                        s.spawn(move |_| {
                            let mut balance = [0isize; VALUES];
                            for i in 0..TEST_BATCH_SMALL * 10 {
                                let value = (i * 5 + t) % VALUES;
                                if set.try_add(value) {
                                    balance[value] += 1;
                                }
                                let other = (i + t * 7) % VALUES;
                                if set.remove(&other).is_some() {
                                    balance[other] -= 1;
                                }
                            }
                            balance
                        })
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .collect::<Vec<_>>()
            })
            .unwrap();

            for value in 0..VALUES {
                let balance: isize = balances.iter().map(|b| b[value]).sum();
                assert_eq!(set.contains(&value) as isize, balance, "Value {}", value);
            }
            let mut stored = set.iter().collect::<Vec<_>>();
            let len = stored.len();
            stored.sort_unstable();
            stored.dedup();
            assert_eq!(len, stored.len(), "Duplicate values stored");
            assert_eq!(len, set.len());
        }
    }

    #[test]
    fn remove_par() {
        let set = ConSet::new();
        for i in 0..TEST_THREADS * TEST_BATCH {
            set.try_add(i);
        }

        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let set = &set;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH {
                        let num = t * TEST_BATCH + i;
                        let val = set.remove(&num).unwrap();
                        assert_eq!(num, val);
                    }
                });
            }
        })
        .unwrap();

        assert!(set.is_empty());
    }

    #[test]
    fn remove_where_and_clear() {
        let set = (0..TEST_BATCH_SMALL).collect::<ConSet<_>>();
        assert_eq!(TEST_BATCH_SMALL / 2, set.remove_where(|v| v % 2 == 1));
        assert!(set.iter().all(|v| v % 2 == 0));
        set.clear();
        assert!(set.is_empty());
        assert!(set.iter().next().is_none());
        assert!(set.try_add(1));
    }

    #[test]
    fn extend_ignores_duplicates() {
        let mut set = ConSet::new();
        set.extend(vec![1, 2, 2, 3]);
        assert_eq!(3, set.len());
        let mut values = set.iter().collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(vec![1, 2, 3], values);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn rayon_extend() {
        let mut set = ConSet::new();
        set.par_extend((0..TEST_BATCH).into_par_iter());

        for n in 0..TEST_BATCH {
            assert!(set.contains(&n));
        }
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn rayon_from_par_iter() {
        let set = ConSet::from_par_iter((0..TEST_BATCH).into_par_iter());
        for n in 0..TEST_BATCH {
            assert!(set.contains(&n));
        }
    }
}
