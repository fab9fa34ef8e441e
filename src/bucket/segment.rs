//! The fixed-size open-addressed segment of the [`HashBucket`][super::HashBucket].
//!
//! A segment never grows. Slots are written once (from null to an entry) and never emptied while
//! the segment is in use; removing a key only empties the value of its entry. That keeps probing
//! simple: the first null slot ends every search. The slots of removed keys are reclaimed only by
//! moving to a new segment, which leaves the dead entries behind.
//!
//! When the bucket resizes, the slots of the old segment are *frozen* one by one. A frozen null slot
//! can't be claimed any more and an entry whose value is null at the time is marked dead so it
//! can't be revived. Live entries are moved into the new segment as they are, the same allocation
//! being shared by both segments until the old one is released.

use std::borrow::Borrow;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

bitflags! {
    /// Flags living in the unused low bits of the slot pointers.
    struct SlotFlags: usize {
        /// The slot got processed by a resize and must not be modified any more.
        const FROZEN = 0b01;
        /// The entry in the slot had no value when frozen and was not moved.
        ///
        /// The old segment owns it and frees it on release.
        const DEAD = 0b10;
    }
}

fn sf<T>(slot: Shared<T>) -> SlotFlags {
    SlotFlags::from_bits(slot.tag()).expect("BUG: Invalid slot flags")
}

/// Tag of a value pointer frozen by a resize.
const VALUE_FROZEN: usize = 1;

/// The value, aligned to leave room for the tag.
#[repr(align(4))]
pub(crate) struct Value<V>(pub(crate) V);

pub(crate) struct Entry<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<Value<V>>,
}

/// Outcome of removing the value from an entry.
pub(crate) enum Removed<'g, V> {
    Value(&'g V),
    Empty,
    Frozen,
}

/// Outcome of storing a value into an existing entry.
pub(crate) enum Stored<'g, V> {
    /// The entry had no value, now it has ours.
    New(&'g V),
    /// Someone else's value is there and we were asked not to replace it.
    Existing(&'g V),
    /// The previous value got replaced.
    Replaced(&'g V),
    /// The entry is frozen; our value is put back into the candidate.
    Frozen,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: V) -> Self {
        Entry {
            hash,
            key,
            value: Atomic::new(Value(value)),
        }
    }

    pub(crate) fn value<'g>(&self, pin: &'g Guard) -> Option<&'g V> {
        let value = self.value.load(Ordering::Acquire, pin);
        unsafe { value.as_ref() }.map(|v| &v.0)
    }

    /// Peeks at our own (not yet published) value.
    pub(crate) fn own_value<'g>(&self, pin: &'g Guard) -> Shared<'g, Value<V>> {
        self.value.load(Ordering::Relaxed, pin)
    }

    fn take_value(&mut self) -> Owned<Value<V>> {
        let value = mem::replace(&mut self.value, Atomic::null());
        unsafe { value.into_owned() }
    }

    fn put_value(&mut self, value: Owned<Value<V>>) {
        self.value = Atomic::from(value);
    }

    /// Moves the value of the `candidate` into this entry.
    ///
    /// An empty entry always takes it, an occupied one only if `replace` is set.
    pub(crate) fn store<'g>(
        &self,
        candidate: &mut Owned<Entry<K, V>>,
        replace: bool,
        pin: &'g Guard,
    ) -> Stored<'g, V> {
        let mut value = candidate.take_value();
        loop {
            let current = self.value.load(Ordering::Acquire, pin);
            if current.tag() == VALUE_FROZEN {
                candidate.put_value(value);
                return Stored::Frozen;
            }
            if let Some(existing) = unsafe { current.as_ref() } {
                if !replace {
                    candidate.put_value(value);
                    return Stored::Existing(&existing.0);
                }
            }
            match self
                .value
                .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, pin)
            {
                Ok(stored) => {
                    let stored = unsafe { &stored.deref().0 };
                    return match unsafe { current.as_ref() } {
                        None => Stored::New(stored),
                        Some(previous) => {
                            unsafe { pin.defer_destroy(current) };
                            Stored::Replaced(&previous.0)
                        }
                    };
                }
                Err(e) => value = e.new,
            }
        }
    }

    /// Empties the value.
    pub(crate) fn remove<'g>(&self, pin: &'g Guard) -> Removed<'g, V> {
        loop {
            let current = self.value.load(Ordering::Acquire, pin);
            if current.tag() == VALUE_FROZEN {
                return Removed::Frozen;
            }
            let existing = match unsafe { current.as_ref() } {
                Some(existing) => existing,
                None => return Removed::Empty,
            };
            if self
                .value
                .compare_exchange(
                    current,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                )
                .is_ok()
            {
                unsafe { pin.defer_destroy(current) };
                return Removed::Value(&existing.0);
            }
        }
    }

    /// Freezes the value if there's none, so nobody can put one in.
    ///
    /// Returns true if the entry is dead.
    fn freeze_empty(&self, pin: &Guard) -> bool {
        loop {
            let current = self.value.load(Ordering::Acquire, pin);
            if !current.is_null() {
                return false;
            }
            if self
                .value
                .compare_exchange(
                    current,
                    current.with_tag(VALUE_FROZEN),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let value = self.value.load(Ordering::Relaxed, pin);
            if !value.is_null() {
                drop(value.with_tag(0).into_owned());
            }
        }
    }
}

/// Outcome of claiming a slot for a new entry.
pub(crate) enum Claim<'g, K, V> {
    /// The entry got stored.
    Claimed(&'g Entry<K, V>),
    /// There's an entry with the same key already, the candidate is given back.
    Found(&'g Entry<K, V>, Owned<Entry<K, V>>),
    /// Hit a frozen slot, the segment is being copied.
    Frozen(Owned<Entry<K, V>>),
    /// No free slot in the probing window.
    Full(Owned<Entry<K, V>>),
}

pub(crate) type Slots<K, V> = Box<[Atomic<Entry<K, V>>]>;

pub(crate) struct Segment<K, V> {
    slots: Slots<K, V>,
    mask: usize,
    /// The longest distance from home any entry got placed at.
    reach: AtomicUsize,
    /// The next slot to be copied out during a resize.
    cursor: CachePadded<AtomicUsize>,
    /// How many slots got copied out.
    copied: AtomicUsize,
}

impl<K, V> Segment<K, V> {
    /// Creates a segment over the given (empty) slots.
    pub(crate) fn new(slots: Slots<K, V>) -> Self {
        assert!(
            slots.len().is_power_of_two(),
            "BUG: Segment size must be a power of two"
        );
        assert!(
            mem::align_of::<Entry<K, V>>() > SlotFlags::all().bits(),
            "BUG: No room for slot flags in the pointers"
        );
        Segment {
            mask: slots.len() - 1,
            slots,
            reach: AtomicUsize::new(0),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            copied: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, home: u64, distance: usize) -> &Atomic<Entry<K, V>> {
        &self.slots[(home as usize).wrapping_add(distance) & self.mask]
    }

    pub(crate) fn entry_at<'g>(&self, index: usize, pin: &'g Guard) -> Option<&'g Entry<K, V>> {
        let entry = self.slots[index].load(Ordering::Acquire, pin);
        unsafe { entry.as_ref() }
    }

    /// Looks up the entry with the key, no matter if it has a value.
    pub(crate) fn find<'g, Q>(&self, hash: u64, key: &Q, pin: &'g Guard) -> Option<&'g Entry<K, V>>
    where
        Q: ?Sized + Eq,
        K: Borrow<Q>,
    {
        let reach = self.reach.load(Ordering::Acquire).min(self.capacity());
        for distance in 0..reach {
            let entry = self.slot(hash, distance).load(Ordering::Acquire, pin);
            match unsafe { entry.as_ref() } {
                // Slots don't get emptied, so nothing of ours is placed past an empty one.
                None => return None,
                Some(entry) if entry.hash == hash && entry.key.borrow() == key => {
                    return Some(entry)
                }
                Some(_) => (),
            }
        }
        None
    }

    /// Stores the candidate into the first free slot within `window` from its home.
    pub(crate) fn claim<'g>(
        &self,
        mut candidate: Owned<Entry<K, V>>,
        window: usize,
        pin: &'g Guard,
    ) -> Claim<'g, K, V>
    where
        K: Eq,
    {
        let hash = candidate.hash;
        for distance in 0..window.min(self.capacity()) {
            let slot = self.slot(hash, distance);
            let mut current = slot.load(Ordering::Acquire, pin);
            loop {
                if let Some(entry) = unsafe { current.as_ref() } {
                    if entry.hash == hash && entry.key == candidate.key {
                        return Claim::Found(entry, candidate);
                    }
                    break;
                }
                if sf(current).contains(SlotFlags::FROZEN) {
                    return Claim::Frozen(candidate);
                }
                // Before the entry is visible, so lookups scan far enough to find it.
                self.reach.fetch_max(distance + 1, Ordering::AcqRel);
                match slot.compare_exchange(
                    current,
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                ) {
                    Ok(claimed) => return Claim::Claimed(unsafe { claimed.deref() }),
                    Err(e) => {
                        candidate = e.new;
                        current = e.current;
                    }
                }
            }
        }
        Claim::Full(candidate)
    }

    /// Places an entry moved from an older segment, ignoring the probing window.
    fn place(&self, entry: Shared<Entry<K, V>>, pin: &Guard) {
        let hash = unsafe { entry.deref() }.hash;
        for distance in 0..self.capacity() {
            let slot = self.slot(hash, distance);
            if !slot.load(Ordering::Acquire, pin).is_null() {
                continue;
            }
            self.reach.fetch_max(distance + 1, Ordering::AcqRel);
            if slot
                .compare_exchange(
                    Shared::null(),
                    entry,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                )
                .is_ok()
            {
                return;
            }
        }
        unreachable!("BUG: No room for a moved entry in the new segment");
    }

    /// Claims the next slot to be copied out, if any are left.
    pub(crate) fn next_to_copy(&self) -> Option<usize> {
        let index = self.cursor.fetch_add(1, Ordering::AcqRel);
        if index < self.capacity() {
            Some(index)
        } else {
            None
        }
    }

    /// Freezes the slot and moves its entry, if it's alive, into the new segment.
    pub(crate) fn copy_slot(&self, index: usize, into: &Segment<K, V>, pin: &Guard) {
        let slot = &self.slots[index];
        let current = slot.fetch_or(SlotFlags::FROZEN.bits(), Ordering::AcqRel, pin);
        let entry = match unsafe { current.as_ref() } {
            Some(entry) => entry,
            None => return,
        };
        if entry.freeze_empty(pin) {
            slot.fetch_or(SlotFlags::DEAD.bits(), Ordering::AcqRel, pin);
        } else {
            into.place(current.with_tag(0), pin);
        }
    }

    /// Records `done` more slots as copied, returns the total so far.
    pub(crate) fn mark_copied(&self, done: usize) -> usize {
        self.copied.fetch_add(done, Ordering::AcqRel) + done
    }

    /// Tears down a fully copied segment, freeing the dead entries.
    ///
    /// The live entries belong to the new segment now. The emptied slots are returned for
    /// reuse.
    ///
    /// # Safety
    ///
    /// Nobody may be looking at the segment or its dead entries any more.
    pub(crate) unsafe fn release(self: Box<Self>) -> Slots<K, V> {
        let pin = crossbeam_epoch::unprotected();
        let mut slots = self.slots;
        for slot in slots.iter_mut() {
            let entry = slot.load(Ordering::Relaxed, pin);
            if sf(entry).contains(SlotFlags::DEAD) {
                drop(entry.with_tag(0).into_owned());
            }
            *slot = Atomic::null();
        }
        slots
    }

    /// Frees the entries owned by this segment.
    ///
    /// If the segment was in the middle of being copied, the entries already moved are left to
    /// the new segment.
    ///
    /// # Safety
    ///
    /// Must have exclusive access to the segment and the entries.
    pub(crate) unsafe fn free_entries(&mut self) {
        let pin = crossbeam_epoch::unprotected();
        for slot in self.slots.iter_mut() {
            let entry = slot.load(Ordering::Relaxed, pin);
            let flags = sf(entry);
            if !entry.is_null() && (flags.contains(SlotFlags::DEAD) || flags.is_empty()) {
                drop(entry.with_tag(0).into_owned());
            }
            *slot = Atomic::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(capacity: usize) -> Segment<u32, u32> {
        Segment::new((0..capacity).map(|_| Atomic::null()).collect())
    }

    fn entry(hash: u64, key: u32) -> Owned<Entry<u32, u32>> {
        Owned::new(Entry::new(hash, key, key * 10))
    }

    #[test]
    fn claim_and_find() {
        let mut seg = segment(8);
        let pin = crossbeam_epoch::pin();
        assert!(seg.find(3, &1, &pin).is_none());
        assert!(matches!(seg.claim(entry(3, 1), 4, &pin), Claim::Claimed(_)));
        // Same home, different key, lands next to it.
        assert!(matches!(seg.claim(entry(3, 2), 4, &pin), Claim::Claimed(_)));
        match seg.claim(entry(3, 1), 4, &pin) {
            Claim::Found(found, _) => assert_eq!(1, found.key),
            _ => panic!("Should have found the key"),
        }
        assert_eq!(Some(&20), seg.find(3, &2, &pin).and_then(|e| e.value(&pin)));
        assert_eq!(2, seg.reach.load(Ordering::Relaxed));
        drop(pin);
        unsafe { seg.free_entries() };
    }

    #[test]
    fn window_exhausted() {
        let mut seg = segment(8);
        let pin = crossbeam_epoch::pin();
        for key in 0..2 {
            assert!(matches!(seg.claim(entry(0, key), 2, &pin), Claim::Claimed(_)));
        }
        assert!(matches!(seg.claim(entry(0, 5), 2, &pin), Claim::Full(_)));
        // A wider window still fits.
        assert!(matches!(seg.claim(entry(0, 5), 3, &pin), Claim::Claimed(_)));
        drop(pin);
        unsafe { seg.free_entries() };
    }

    #[test]
    fn store_and_remove() {
        let mut seg = segment(4);
        let pin = crossbeam_epoch::pin();
        let stored = match seg.claim(entry(1, 1), 4, &pin) {
            Claim::Claimed(stored) => stored,
            _ => panic!("Empty segment must take it"),
        };
        let mut candidate = entry(1, 1);
        assert!(matches!(
            stored.store(&mut candidate, false, &pin),
            Stored::Existing(&10)
        ));
        assert!(matches!(stored.remove(&pin), Removed::Value(&10)));
        assert!(matches!(stored.remove(&pin), Removed::Empty));
        assert!(matches!(
            stored.store(&mut candidate, false, &pin),
            Stored::New(&10)
        ));
        let mut candidate = Owned::new(Entry::new(1, 1, 42));
        assert!(matches!(
            stored.store(&mut candidate, true, &pin),
            Stored::Replaced(&10)
        ));
        assert_eq!(Some(&42), stored.value(&pin));
        drop(pin);
        unsafe { seg.free_entries() };
    }

    #[test]
    fn copy_moves_live_and_freezes_dead() {
        let old = Box::new(segment(4));
        let mut new = segment(8);
        let pin = crossbeam_epoch::pin();
        for key in 0..3 {
            assert!(matches!(
                old.claim(entry(key as u64, key), 1, &pin),
                Claim::Claimed(_)
            ));
        }
        let dead = old.find(1, &1, &pin).unwrap();
        assert!(matches!(dead.remove(&pin), Removed::Value(&10)));

        let mut done = 0;
        while let Some(index) = old.next_to_copy() {
            old.copy_slot(index, &new, &pin);
            done += 1;
        }
        assert_eq!(4, old.mark_copied(done));

        // Frozen, nothing more gets in.
        assert!(matches!(old.claim(entry(3, 3), 1, &pin), Claim::Frozen(_)));
        let mut candidate = entry(1, 1);
        assert!(matches!(
            dead.store(&mut candidate, false, &pin),
            Stored::Frozen
        ));
        assert!(matches!(dead.remove(&pin), Removed::Frozen));

        assert_eq!(Some(&0), new.find(0, &0, &pin).and_then(|e| e.value(&pin)));
        assert!(new.find(1, &1, &pin).is_none());
        assert_eq!(Some(&20), new.find(2, &2, &pin).and_then(|e| e.value(&pin)));

        drop(pin);
        let slots = unsafe { old.release() };
        assert_eq!(4, slots.len());
        unsafe { new.free_entries() };
    }
}
