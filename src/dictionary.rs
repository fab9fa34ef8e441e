//! The [`ConDictionary`][crate::ConDictionary] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::config::{checked_probing, Config, DEFAULT_PROBING};
use crate::error::Error;
use crate::existing_or_new::ExistingOrNew;
use crate::probe::{home, Claim, Current, Pools, Probed, Record};
use crate::raw;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
}

impl<K, V> Borrow<K> for Node<K, V> {
    fn borrow(&self) -> &K {
        &self.key
    }
}

struct DictConfig<K, V>(PhantomData<(K, V)>);

impl<K, V> Config for DictConfig<K, V>
where
    K: Hash + Eq,
{
    type Payload = Node<K, V>;
    type Key = K;
}

type Table<K, V> = Probed<DictConfig<K, V>>;

/// The iterator of the [`ConDictionary`].
///
/// See the [`iter`][ConDictionary::iter] method for details.
pub struct Iter<'a, K, V> {
    inner: raw::iterator::Iter<'a, Record<Node<K, V>>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let (_, record) = self.inner.next()?;
            if let Some(node) = record.visible() {
                return Some((node.key.clone(), node.value.clone()));
            }
        }
    }
}

/// A concurrent lock-free dictionary.
///
/// The entries live in a trie-indexed array, at the home index given by the hash of the key or
/// within a short probing window after it. The window widens on demand, so the dictionary never
/// needs to be resized.
///
/// The return values of its methods are clones of the stored values. This makes it suitable for
/// types cheap to clone; more expensive ones can be wrapped in an `Arc`.
///
/// # Examples
///
/// ```rust
/// use conbucket::ConDictionary;
/// use crossbeam_utils::thread;
///
/// let dict = ConDictionary::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         dict.add_new("hello", 1).unwrap();
///     });
///     s.spawn(|_| {
///         dict.add_new("world", 2).unwrap();
///     });
/// }).unwrap();
/// assert_eq!(Some(1), dict.get("hello"));
/// assert_eq!(Some(2), dict.get("world"));
/// assert!(dict.add_new("hello", 3).is_err());
/// assert_eq!(Some(1), dict.set("hello", 3));
/// assert_eq!(Some(3), dict.remove("hello"));
/// assert_eq!(1, dict.len());
/// ```
pub struct ConDictionary<K, V, S = RandomState>
where
    K: Hash + Eq,
{
    hash_builder: S,
    probing: usize,
    pools: Arc<Pools<Node<K, V>>>,
    table: Current<Table<K, V>>,
}

impl<K, V> ConDictionary<K, V>
where
    K: Hash + Eq,
{
    /// Creates a new empty dictionary.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> ConDictionary<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new empty dictionary, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(DEFAULT_PROBING, hasher)
    }

    /// Creates a new empty dictionary with the given initial probing window and hasher.
    ///
    /// The window is the number of consecutive indices searched for a key before giving up. It
    /// grows as needed, the initial value only saves some widening for densely colliding keys.
    pub fn with_probing_and_hasher(probing: usize, hasher: S) -> Result<Self, Error> {
        Ok(Self::build(checked_probing(probing)?, hasher))
    }

    fn build(probing: usize, hash_builder: S) -> Self {
        let pools = Arc::new(Pools::default());
        let table = Current::new(Probed::new(probing, Arc::clone(&pools)));
        ConDictionary {
            hash_builder,
            probing,
            pools,
            table,
        }
    }

    fn home<Q: ?Sized + Hash>(&self, key: &Q) -> u32 {
        home(&self.hash_builder, key)
    }

    /// Adds a new entry.
    ///
    /// Fails with [`Error::DuplicateKey`] if the key is present already, leaving the stored value
    /// intact.
    pub fn add_new(&self, key: K, value: V) -> Result<(), Error> {
        if self.try_add(key, value) {
            Ok(())
        } else {
            Err(Error::DuplicateKey)
        }
    }

    /// Adds a new entry if the key is not present yet.
    ///
    /// Returns whether it got added.
    pub fn try_add(&self, key: K, value: V) -> bool {
        let pin = crossbeam_epoch::pin();
        let home = self.home(&key);
        let table = self.table.get(&pin);
        matches!(table.insert(home, Node { key, value }, &pin), Claim::New(_))
    }

    /// Looks up the value of the key, or adds a newly created one.
    ///
    /// # Quirks
    ///
    /// Due to races in case of concurrent accesses, the closure may be called even if the value
    /// is not subsequently inserted and an existing one is returned.
    pub fn get_or_add_with<F>(&self, key: K, create: F) -> ExistingOrNew<V>
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let home = self.home(&key);
        self.table
            .get(&pin)
            .get_or_insert_with(
                home,
                key,
                |key| Node {
                    key,
                    value: create(),
                },
                &pin,
            )
            .map(|node| node.value.clone())
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

    /// Stores the value under the key, replacing any previous value.
    ///
    /// Returns the previous value.
    ///
    /// # Quirks
    ///
    /// If the key gets added concurrently by someone else, the new entry is copied before it
    /// replaces that one. Hence the `Clone` bound on the key.
    pub fn set(&self, key: K, value: V) -> Option<V>
    where
        K: Clone,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let home = self.home(&key);
        self.table
            .get(&pin)
            .set(home, Node { key, value }, &pin)
            .map(|node| node.value.clone())
    }

    /// Looks up the value of the key.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .get(self.home(key), key, &pin)
            .map(|node| node.value.clone())
    }

    /// Checks if the key is present.
    ///
    /// Note that by the time you can act on it, the presence of the key can change (eg. other
    /// thread can add or remove it in the meantime).
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .get(self.home(key), key, &pin)
            .is_some()
    }

    /// Removes the entry of the key, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .remove(self.home(key), key, &pin)
            .map(|node| node.value.clone())
    }

    /// Removes all the entries whose key matches the predicate.
    ///
    /// Entries added or changed while this runs may or may not be considered. Returns how many
    /// entries this call removed.
    pub fn remove_where_key<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .remove_where(|node| predicate(&node.key), &pin)
    }

    /// Removes all the entries whose value matches the predicate.
    ///
    /// See [`remove_where_key`][ConDictionary::remove_where_key].
    pub fn remove_where_value<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&V) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        self.table
            .get(&pin)
            .remove_where(|node| predicate(&node.value), &pin)
    }
}

impl<K, V, S> ConDictionary<K, V, S>
where
    K: Hash + Eq,
{
    /// Number of entries.
    ///
    /// Note that due to the nature of concurrent containers, this is inherently racy.
    pub fn len(&self) -> usize {
        let pin = crossbeam_epoch::pin();
        self.table.get(&pin).len()
    }

    /// Checks if the dictionary is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all the entries.
    ///
    /// The whole table is swapped for an empty one. Writes racing with this may land in either.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.table
            .replace(Probed::new(self.probing, Arc::clone(&self.pools)), &pin);
    }

    /// Returns an iterator through the entries, in no particular order.
    ///
    /// The iterator yields clones of the keys and values. It sees the entries present for its
    /// whole lifetime; the ones added or removed meanwhile may or may not show up.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let pin = crossbeam_epoch::pin();
        let table: *const Table<K, V> = self.table.get(&pin);
        // The pin moves into the iterator, keeping the table alive even if it is cleared.
        let inner = unsafe { raw::iterator::Iter::with_pin((*table).mapper(), pin) };
        Iter { inner }
    }
}

impl<K, V> Default for ConDictionary<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for ConDictionary<K, V, S>
where
    K: Debug + Clone + Hash + Eq,
    V: Debug + Clone,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a ConDictionary<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a ConDictionary<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in iter {
            let pin = crossbeam_epoch::pin();
            let home = self.home(&k);
            self.table
                .get(&pin)
                .set(home, Node { key: k, value: v }, &pin);
        }
    }
}

impl<K, V, S> Extend<(K, V)> for ConDictionary<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &ConDictionary<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for ConDictionary<K, V>
where
    K: Clone + Hash + Eq,
    V: Clone,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = ConDictionary::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<K, V, S> ParallelExtend<(K, V)> for ConDictionary<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
    V: Clone + Send + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &ConDictionary<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a ConDictionary<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync,
    S: BuildHasher + Sync,
    V: Clone + Send + Sync,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let me: &ConDictionary<_, _, _> = self;
        par_iter.into_par_iter().for_each(|(k, v)| {
            let mut me = me;
            me.extend(Some((k, v)));
        });
    }
}

#[cfg(feature = "rayon")]
impl<K, V> FromParallelIterator<(K, V)> for ConDictionary<K, V>
where
    K: Clone + Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = ConDictionary::new();
        me.par_extend(par_iter);
        me
    }
}
