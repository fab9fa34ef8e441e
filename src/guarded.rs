//! The guarded slot.
//!
//! Every node of the trie hangs off its parent through a [`GuardedSlot`]. Writers *enter* the
//! node before changing anything inside and *leave* it afterwards. The last one to leave a node
//! that has no children left retires it: the node is detached from the parent and handed over for
//! recycling.
//!
//! The bookkeeping lives in a single word per node ([`UseCount`]), so the decision "nobody is
//! inside and nothing is stored here" is one compare-and-swap. Readers never enter; they only load
//! the primary pointer. They are kept safe by the epoch the caller holds, the retire callback is
//! expected to defer the actual reuse of the node until the epoch ends.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

/// The in-flight uses, low 32 bits.
const USES: u64 = 0xFFFF_FFFF;
/// One occupied child.
const CHILD: u64 = 1 << 32;
/// The occupied children, 31 bits above the uses.
const CHILDREN: u64 = 0x7FFF_FFFF << 32;
/// Set once the node is retired. Never cleared until the node is recycled.
const RETIRED: u64 = 1 << 63;

/// The use-count word of a node.
///
/// Counts the threads currently working inside the node and the children the node holds, and
/// carries the retired mark. A node may be retired only when the whole word is zero.
#[derive(Debug, Default)]
pub(crate) struct UseCount(AtomicU64);

impl UseCount {
    /// Registers one more user, unless the node is already retired.
    pub(crate) fn try_enter(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current & RETIRED != 0 {
                return false;
            }
            assert!(current & USES != USES, "BUG: Too many threads inside one node");
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Unregisters a user.
    ///
    /// Returns true if it was the last one and there are no children, eg. the node is a candidate
    /// for retirement.
    pub(crate) fn leave(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & USES != 0, "BUG: Leaving a node nobody entered");
        previous == 1
    }

    /// A child got stored into the node.
    pub(crate) fn occupy(&self) {
        self.0.fetch_add(CHILD, Ordering::AcqRel);
    }

    /// A child got removed from the node.
    pub(crate) fn vacate(&self) {
        let previous = self.0.fetch_sub(CHILD, Ordering::AcqRel);
        debug_assert!(previous & CHILDREN != 0, "BUG: Vacating an empty node");
    }

    /// Marks the node retired, but only if it is unused and empty.
    pub(crate) fn try_retire(&self) -> bool {
        self.0
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Nobody inside, no children, not retired.
    pub(crate) fn is_vacant(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.0.load(Ordering::Acquire) & RETIRED != 0
    }

    #[cfg(test)]
    pub(crate) fn uses(&self) -> usize {
        (self.0.load(Ordering::Acquire) & USES) as usize
    }

    pub(crate) fn children(&self) -> usize {
        ((self.0.load(Ordering::Acquire) & CHILDREN) >> 32) as usize
    }

    /// Brings a recycled node back to the pristine state.
    pub(crate) fn reset(&mut self) {
        *self.0.get_mut() = 0;
    }
}

/// Something that can live behind a [`GuardedSlot`].
pub(crate) trait Guarded {
    fn use_count(&self) -> &UseCount;
}

/// The primary/shadow pair through which a node is published.
///
/// The primary is what everyone traverses. The shadow is a parking place used while a node is
/// being retired, so only one retirement at a time runs through a slot.
#[derive(Debug)]
pub(crate) struct GuardedSlot<T> {
    primary: Atomic<T>,
    shadow: Atomic<T>,
}

impl<T> Default for GuardedSlot<T> {
    fn default() -> Self {
        GuardedSlot {
            primary: Atomic::null(),
            shadow: Atomic::null(),
        }
    }
}

impl<T: Guarded> GuardedSlot<T> {
    /// Loads the primary without registering as a user.
    ///
    /// The node may get retired at any time, but not reused while the guard is held.
    pub(crate) fn load<'g>(&self, pin: &'g Guard) -> Shared<'g, T> {
        self.primary.load(Ordering::Acquire, pin)
    }

    /// Is some retirement parked in the shadow right now?
    #[cfg(test)]
    pub(crate) fn is_parked(&self, pin: &Guard) -> bool {
        !self.shadow.load(Ordering::Acquire, pin).is_null()
    }

    /// Enters the published node, if there's any.
    ///
    /// The `parent` is the use count of the node owning this slot. The caller must be inside the
    /// parent.
    pub(crate) fn enter<'g>(&self, parent: &UseCount, pin: &'g Guard) -> Option<Shared<'g, T>> {
        loop {
            let current = self.primary.load(Ordering::Acquire, pin);
            let node = unsafe { current.as_ref() }?;
            if node.use_count().try_enter() {
                return Some(current);
            }
            // Retired, but its retirer didn't get to unlink it yet. Do it for them and look again.
            self.unlink(current, parent, pin);
        }
    }

    /// Enters the published node, publishing a fresh one first if the slot is empty.
    ///
    /// The `create` is called at most once. A created node that lost the race for the slot is
    /// passed to `discard`.
    pub(crate) fn enter_or_create<'g, C, D>(
        &self,
        parent: &UseCount,
        pin: &'g Guard,
        mut create: C,
        discard: D,
    ) -> Shared<'g, T>
    where
        C: FnMut() -> Owned<T>,
        D: FnOnce(Owned<T>),
    {
        let mut candidate: Option<Owned<T>> = None;
        let entered = loop {
            let current = self.primary.load(Ordering::Acquire, pin);
            if let Some(node) = unsafe { current.as_ref() } {
                if node.use_count().try_enter() {
                    break current;
                }
                self.unlink(current, parent, pin);
                continue;
            }

            let fresh = candidate.take().unwrap_or_else(|| {
                let fresh = create();
                let entered = fresh.use_count().try_enter();
                debug_assert!(entered, "BUG: Fresh node is born retired");
                fresh
            });
            match self.primary.compare_exchange(
                Shared::null(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(published) => {
                    parent.occupy();
                    return published;
                }
                Err(e) => candidate = Some(e.new),
            }
        };

        if let Some(unused) = candidate {
            discard(unused);
        }
        entered
    }

    /// Leaves a node previously entered through this slot.
    ///
    /// If this was the last user and the node holds nothing, the node is parked into the shadow,
    /// verified to still be unused, detached and handed to `retire`. If somebody sneaked in
    /// meanwhile, the node stays where it is and the retirement is up to them.
    pub(crate) fn leave<'g, R>(
        &self,
        current: Shared<'g, T>,
        parent: &UseCount,
        pin: &'g Guard,
        retire: R,
    ) where
        R: FnOnce(Shared<'g, T>),
    {
        let node = unsafe { current.deref() };
        if !node.use_count().leave() {
            return;
        }

        loop {
            if self
                .shadow
                .compare_exchange(
                    Shared::null(),
                    current,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    pin,
                )
                .is_err()
            {
                // Another retirement is in progress here. It looks again once it is done.
                return;
            }

            let retired = node.use_count().try_retire();
            if retired {
                self.unlink(current, parent, pin);
            }
            self.shadow.store(Shared::null(), Ordering::Release);
            if retired {
                retire(current);
                return;
            }
            // Someone got inside while we were parked. If they left meanwhile, they may have
            // found the shadow occupied and given up, so it's on us to try again.
            if !node.use_count().is_vacant() {
                return;
            }
        }
    }

    /// Detaches a retired node, if it is still published.
    fn unlink<'g>(&self, current: Shared<'g, T>, parent: &UseCount, pin: &'g Guard) {
        debug_assert!(unsafe { current.deref() }.use_count().is_retired());
        if self
            .primary
            .compare_exchange(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            )
            .is_ok()
        {
            parent.vacate();
        }
    }
}
