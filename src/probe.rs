//! Bounded linear probing over the trie.
//!
//! The dictionary and the set store their payloads in a [`Mapper`]. The hash of the key picks the
//! home index and the payload lands into the first free index of the probing window starting
//! there. The window is shared by the whole table and only ever widens, up to the furthest index
//! any insert had to go.
//!
//! Two inserts of the same key may both miss each other in the lookup and store their payloads at
//! different indices. Therefore every stored payload is wrapped in a [`Record`] with a state word,
//! and a fresh record becomes visible only once it wins a contest against the other copies of its
//! key. The contest is decided by compare-and-swap on the state words, never by the positions
//! alone, because holes open and close in the window all the time.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::ptr;
use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned};
use crossbeam_utils::Backoff;

use crate::config::Config;
use crate::existing_or_new::ExistingOrNew;
use crate::raw::{BranchPools, CheckSet, Mapper};

/// The home index of a key.
pub(crate) fn home<S, Q>(hash_builder: &S, key: &Q) -> u32
where
    S: BuildHasher,
    Q: ?Sized + Hash,
{
    let mut hasher = hash_builder.build_hasher();
    key.hash(&mut hasher);
    hasher.finish() as u32
}

fn key_of<C: Config>(payload: &C::Payload) -> &C::Key {
    payload.borrow()
}

/// Where a stored record stands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum State {
    /// Stored, but it's not yet decided if this is the one copy of its key.
    Pending = 0,
    /// The one visible copy of its key.
    Settled = 1,
    /// Still visible, a newer copy is about to take its index.
    Replaced = 2,
    /// Lost to another copy of its key. Only its inserter may revive or unlink it.
    Killed = 3,
    /// Removed, about to be unlinked.
    Removed = 4,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Pending,
            1 => State::Settled,
            2 => State::Replaced,
            3 => State::Killed,
            4 => State::Removed,
            _ => unreachable!("BUG: Invalid record state {}", raw),
        }
    }
}

/// A payload together with its state.
pub(crate) struct Record<P> {
    payload: P,
    state: AtomicU8,
}

impl<P> Record<P> {
    fn new(payload: P, state: State) -> Self {
        Record {
            payload,
            state: AtomicU8::new(state as u8),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The payload, if readers are supposed to see it.
    pub(crate) fn visible(&self) -> Option<&P> {
        match self.state() {
            State::Settled | State::Replaced => Some(&self.payload),
            _ => None,
        }
    }
}

/// Pools of branches for tables of the given payload.
pub(crate) type Pools<P> = BranchPools<Record<P>>;

/// Outcome of inserting a payload with a fresh key.
pub(crate) enum Claim<'g, P> {
    /// Stored.
    New(&'g P),
    /// The key is present already, our payload is gone.
    Existing(&'g P),
}

/// A probing table over a trie.
pub(crate) struct Probed<C: Config> {
    mapper: Mapper<Record<C::Payload>>,
    probing: AtomicUsize,
}

impl<C: Config> Probed<C> {
    pub(crate) fn new(probing: usize, pools: Arc<Pools<C::Payload>>) -> Self {
        Probed {
            mapper: Mapper::with_pools(pools),
            probing: AtomicUsize::new(probing),
        }
    }

    pub(crate) fn mapper(&self) -> &Mapper<Record<C::Payload>> {
        &self.mapper
    }

    pub(crate) fn window(&self) -> usize {
        self.probing.load(Ordering::Acquire)
    }

    fn widen(&self, attempts: usize) {
        self.probing.fetch_max(attempts, Ordering::AcqRel);
    }

    /// Number of stored records.
    ///
    /// Counts also the records still in a contest or on their way out.
    pub(crate) fn len(&self) -> usize {
        self.mapper.len()
    }

    /// Looks for the visible copy of the key within the window.
    ///
    /// A replaced copy is returned only if its replacement is not there yet.
    fn find<'g, Q>(
        &'g self,
        home: u32,
        key: &Q,
        pin: &'g Guard,
    ) -> Option<(u32, &'g Record<C::Payload>)>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        let mut replaced = None;
        for attempt in 0..self.window() {
            let index = home.wrapping_add(attempt as u32);
            let record = match self.mapper.get(index, pin) {
                Some(record) if Borrow::<Q>::borrow(key_of::<C>(&record.payload)) == key => record,
                _ => continue,
            };
            match record.state() {
                State::Settled => return Some((index, record)),
                State::Replaced => replaced = replaced.or(Some((index, record))),
                _ => (),
            }
        }
        replaced
    }

    pub(crate) fn get<'g, Q>(&'g self, home: u32, key: &Q, pin: &'g Guard) -> Option<&'g C::Payload>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        self.find(home, key, pin).map(|(_, record)| &record.payload)
    }

    /// Stores a pending record into the first free index of the window, widening it as needed.
    fn publish<'g>(
        &'g self,
        home: u32,
        payload: C::Payload,
        pin: &'g Guard,
    ) -> (u32, &'g Record<C::Payload>) {
        let mut record = Record::new(payload, State::Pending);
        let mut attempt = 0;
        loop {
            // Widen first, so whoever looks for the key sees it as soon as it is stored.
            self.widen(attempt + 1);
            let index = home.wrapping_add(attempt as u32);
            match self.mapper.insert(index, record, pin) {
                Ok(stored) => return (index, stored),
                Err(occupied) => {
                    record = occupied.value;
                    attempt += 1;
                }
            }
        }
    }

    /// Decides if the freshly published record is the one copy of its key.
    ///
    /// On success the record is settled. Otherwise it's left killed in place (for the caller to
    /// unlink) and the visible copy it lost to is returned.
    ///
    /// The rules between two copies of the same key:
    /// * A visible copy always wins.
    /// * A pending copy closer to home is waited for until it decides.
    /// * A pending copy further from home gets killed.
    ///
    /// Whoever gets killed before settling revives and takes part again, so it learns who won.
    fn contest<'g>(
        &'g self,
        home: u32,
        own_index: u32,
        own: &'g Record<C::Payload>,
        pin: &'g Guard,
    ) -> Option<&'g Record<C::Payload>> {
        let claimed = own_index.wrapping_sub(home);
        let key = key_of::<C>(&own.payload);
        let backoff = Backoff::new();
        loop {
            // Either we see the other copy here, or it sees ours in its own contest.
            fence(Ordering::SeqCst);
            let mut replaced = None;
            for attempt in 0..self.window() as u32 {
                if attempt == claimed {
                    continue;
                }
                let other = match self.mapper.get(home.wrapping_add(attempt), pin) {
                    Some(other) if key_of::<C>(&other.payload) == key => other,
                    _ => continue,
                };
                loop {
                    match other.state() {
                        State::Settled => {
                            own.transition(State::Pending, State::Killed);
                            return Some(other);
                        }
                        State::Replaced => {
                            replaced = replaced.or(Some(other));
                            break;
                        }
                        State::Pending if attempt < claimed => backoff.snooze(),
                        State::Pending => {
                            if other.transition(State::Pending, State::Killed) {
                                break;
                            }
                        }
                        State::Killed | State::Removed => break,
                    }
                }
            }
            if let Some(other) = replaced {
                own.transition(State::Pending, State::Killed);
                return Some(other);
            }
            if own.transition(State::Pending, State::Settled) {
                return None;
            }
            // Killed by a copy closer to home.
            let revived = own.transition(State::Killed, State::Pending);
            assert!(revived, "BUG: Record changed state while owned");
            backoff.snooze();
        }
    }

    /// Takes a record owned by the caller out of the table.
    fn unlink(&self, index: u32, record: &Record<C::Payload>, pin: &Guard) {
        let unlinked = self
            .mapper
            .try_get_check_remove_at(index, |r| ptr::eq(r, record), pin);
        assert!(unlinked.is_some(), "BUG: Owned record moved");
    }

    /// Stores the payload unless its key is already present.
    pub(crate) fn insert<'g>(
        &'g self,
        home: u32,
        payload: C::Payload,
        pin: &'g Guard,
    ) -> Claim<'g, C::Payload> {
        if let Some((_, existing)) = self.find(home, key_of::<C>(&payload), pin) {
            return Claim::Existing(&existing.payload);
        }
        let (index, own) = self.publish(home, payload, pin);
        match self.contest(home, index, own, pin) {
            None => Claim::New(&own.payload),
            Some(winner) => {
                self.unlink(index, own, pin);
                Claim::Existing(&winner.payload)
            }
        }
    }

    /// Stores the payload, replacing the one with the same key.
    ///
    /// Returns the replaced payload.
    pub(crate) fn set<'g>(
        &'g self,
        home: u32,
        payload: C::Payload,
        pin: &'g Guard,
    ) -> Option<&'g C::Payload>
    where
        C::Payload: Clone,
    {
        let backoff = Backoff::new();
        let mut payload = payload;
        loop {
            match self.find(home, key_of::<C>(&payload), pin) {
                Some((index, existing)) => {
                    // Locks out removals and other writers of the key until the new one is in.
                    if !existing.transition(State::Settled, State::Replaced) {
                        backoff.snooze();
                        continue;
                    }
                    let replacement = Record::new(payload, State::Settled);
                    match self.mapper.try_get_check_set(
                        index,
                        replacement,
                        |r| ptr::eq(r, existing),
                        pin,
                    ) {
                        CheckSet::Replaced { previous, .. } => return Some(&previous.payload),
                        _ => unreachable!("BUG: Replaced record moved"),
                    }
                }
                None => {
                    let (index, own) = self.publish(home, payload, pin);
                    if self.contest(home, index, own, pin).is_none() {
                        return None;
                    }
                    // Someone stored the key meanwhile. Replace that one instead.
                    payload = own.payload.clone();
                    self.unlink(index, own, pin);
                }
            }
        }
    }

    /// Finds the payload for the key, creating it if it is not there.
    pub(crate) fn get_or_insert_with<'g, F>(
        &'g self,
        home: u32,
        key: C::Key,
        create: F,
        pin: &'g Guard,
    ) -> ExistingOrNew<&'g C::Payload>
    where
        F: FnOnce(C::Key) -> C::Payload,
    {
        if let Some(existing) = self.get(home, &key, pin) {
            return ExistingOrNew::Existing(existing);
        }
        match self.insert(home, create(key), pin) {
            Claim::New(stored) => ExistingOrNew::New(stored),
            Claim::Existing(existing) => ExistingOrNew::Existing(existing),
        }
    }

    /// Removes the payload with the key.
    pub(crate) fn remove<'g, Q>(
        &'g self,
        home: u32,
        key: &Q,
        pin: &'g Guard,
    ) -> Option<&'g C::Payload>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        let backoff = Backoff::new();
        loop {
            let (index, existing) = self.find(home, key, pin)?;
            if existing.transition(State::Settled, State::Removed) {
                self.unlink(index, existing, pin);
                return Some(&existing.payload);
            }
            // Being replaced or removed by someone else.
            backoff.snooze();
        }
    }

    /// Removes all the payloads the predicate accepts.
    ///
    /// Returns how many were removed by this call.
    pub(crate) fn remove_where<P>(&self, mut predicate: P, pin: &Guard) -> usize
    where
        P: FnMut(&C::Payload) -> bool,
    {
        let mut iter = self.mapper.iter();
        let mut removed = 0;
        while let Some((index, record)) = iter.next() {
            if record.state() == State::Settled
                && predicate(&record.payload)
                && record.transition(State::Settled, State::Removed)
            {
                self.unlink(index, record, pin);
                removed += 1;
            }
        }
        removed
    }
}

/// The table currently in use by a container.
///
/// Clearing a container swaps in a fresh table, the old one is destroyed once nobody can be
/// looking into it.
pub(crate) struct Current<T>(Atomic<T>);

impl<T> Current<T> {
    pub(crate) fn new(table: T) -> Self {
        Current(Atomic::new(table))
    }

    pub(crate) fn get<'g>(&'g self, pin: &'g Guard) -> &'g T {
        unsafe { self.0.load(Ordering::Acquire, pin).deref() }
    }

    pub(crate) fn replace(&self, table: T, pin: &Guard) {
        let old = self.0.swap(Owned::new(table), Ordering::AcqRel, pin);
        unsafe { pin.defer_destroy(old) };
    }
}

impl<T> Drop for Current<T> {
    fn drop(&mut self) {
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            drop(self.0.load(Ordering::Relaxed, pin).into_owned());
        }
    }
}
