//! Iteration through the values of a [`Mapper`].

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::Ordering;

use arrayvec::ArrayVec;
use crossbeam_epoch::{Guard, Shared};

use super::{Branch, Cells, Mapper, LEVELS, LEVEL_BITS, LEVEL_CELLS};

unsafe fn extend_lifetime<'a, 'b, T: 'a + 'b>(s: Shared<'a, T>) -> Shared<'b, T> {
    mem::transmute(s)
}

struct Level<'a, V> {
    node: &'a Branch<V>,
    /// The next cell to look at.
    cell: usize,
}

// Notes about the lifetimes:
// The 'a is a lie, similar to what a self-referential struct would need. The branches must not
// outlive the pin we hold, and we must not outlive the mapper (its drop frees everything outright).
// The pin moving around in memory doesn't matter, only when its destructor runs.
//
// The relation to the mapper is checked in the constructor, the rest is on us: never hand out a
// reference with the 'a lifetime, only ones bound to the borrow of self.
/// Iterator over the values stored in a [`Mapper`], in the order of their indices.
///
/// It holds a pin for its whole lifetime. It is a snapshot of nothing in particular: values
/// inserted or removed concurrently may or may not be seen.
pub struct Iter<'a, V> {
    pin: Guard,
    levels: ArrayVec<Level<'a, V>, LEVELS>,
    _map: PhantomData<&'a Mapper<V>>,
}

impl<'a, V> Iter<'a, V> {
    /// Creates an iterator over the mapper, pinning the current thread.
    pub fn new<'m: 'a>(map: &'m Mapper<V>) -> Self {
        unsafe { Self::with_pin(map, crossbeam_epoch::pin()) }
    }

    /// Creates the iterator reusing an existing pin.
    ///
    /// # Safety
    ///
    /// The mapper must stay alive for as long as the pin is held (eg. it was reached through that
    /// same pin).
    pub unsafe fn with_pin(map: &'a Mapper<V>, pin: Guard) -> Self {
        let mut levels = ArrayVec::new();
        levels.push(Level {
            node: &map.root,
            cell: 0,
        });
        Iter {
            pin,
            levels,
            _map: PhantomData,
        }
    }

    /// The index of the value just found at the top level.
    fn position(&self) -> u32 {
        self.levels
            .iter()
            .fold(0, |index, level| (index << LEVEL_BITS) | (level.cell as u32 - 1))
    }

    /// Finds the next value the predicate accepts.
    pub(crate) fn next_matching<P>(&mut self, predicate: &mut P) -> Option<(u32, &V)>
    where
        P: FnMut(u32, &V) -> bool,
    {
        loop {
            let top = self.levels.last_mut()?;
            if top.cell == LEVEL_CELLS {
                self.levels.pop();
                continue;
            }
            let node = top.node;
            let cell = top.cell;
            top.cell += 1;

            match &node.cells {
                Cells::Leaf(values) => {
                    let value = values[cell].load(Ordering::Acquire, &self.pin);
                    if let Some(value) = unsafe { value.as_ref() } {
                        let index = self.position();
                        if predicate(index, value) {
                            return Some((index, value));
                        }
                    }
                }
                Cells::Inner(children) => {
                    let child = children[cell].load(&self.pin);
                    let child = unsafe { extend_lifetime(child) };
                    if let Some(child) = unsafe { child.as_ref() } {
                        self.levels.push(Level {
                            node: child,
                            cell: 0,
                        });
                    }
                }
            }
        }
    }

    /// Returns the next stored value together with its index.
    // Not an iterator because this borrows out of the iterator itself (and effectively its pin).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(u32, &V)> {
        self.next_matching(&mut |_: u32, _: &V| true)
    }
}

/// Iterator over the values accepted by a predicate.
///
/// Created by [`Mapper::filter`].
pub struct Where<'a, V, P> {
    inner: Iter<'a, V>,
    predicate: P,
}

impl<'a, V, P> Where<'a, V, P>
where
    P: FnMut(u32, &V) -> bool,
{
    pub(crate) fn new(inner: Iter<'a, V>, predicate: P) -> Self {
        Where { inner, predicate }
    }

    /// Returns the next accepted value together with its index.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(u32, &V)> {
        self.inner.next_matching(&mut self.predicate)
    }
}
