//! The [`ConQueue`], a FIFO queue over the trie-indexed array.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::iter::FromIterator;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::raw::Mapper;

/// How many items may wait in the queue at once.
///
/// The positions are mapped onto the 32-bit index space of the trie, so more would collide.
const MAX_QUEUED: usize = u32::MAX as usize;

fn index(position: usize) -> u32 {
    // The cursors grow forever, only their low bits address the trie.
    position as u32
}

/// A concurrent unbounded FIFO queue.
///
/// Every added item gets the next position from an ever-increasing cursor and is stored at that
/// position in a [`Mapper`]. Taking advances the other cursor. There's no capacity to outgrow,
/// the trie creates (and prunes) its branches as the cursors move.
///
/// Like the other containers in this crate, items are handed out as clones.
///
/// ```rust
/// use conbucket::ConQueue;
///
/// let queue = ConQueue::new();
/// queue.add("hello");
/// queue.add("world");
/// assert_eq!(Some("hello"), queue.try_peek());
/// assert_eq!(Some("world"), queue.try_get(1));
/// assert_eq!(Some("hello"), queue.try_take());
/// assert_eq!(Some("world"), queue.try_take());
/// assert!(queue.try_take().is_none());
/// ```
pub struct ConQueue<T> {
    mapper: Mapper<T>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl<T> ConQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(position: usize) -> Self {
        ConQueue {
            mapper: Mapper::new(),
            head: CachePadded::new(AtomicUsize::new(position)),
            tail: CachePadded::new(AtomicUsize::new(position)),
        }
    }

    /// Appends an item to the end of the queue.
    ///
    /// If the queue is so full the positions wrap around onto a still occupied one, this waits
    /// until a consumer takes it.
    pub fn add(&self, item: T) {
        let position = self.tail.fetch_add(1, Ordering::AcqRel);
        self.store(position, item);
    }

    /// Appends an item, unless the queue already holds as many items as it can address.
    ///
    /// The item is given back in such case.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= MAX_QUEUED {
                return Err(item);
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }
        self.store(tail, item);
        Ok(())
    }

    fn store(&self, position: usize, mut item: T) {
        let backoff = Backoff::new();
        loop {
            let pin = crossbeam_epoch::pin();
            match self.mapper.insert(index(position), item, &pin) {
                Ok(_) => return,
                Err(occupied) => item = occupied.value,
            }
            drop(pin);
            backoff.snooze();
        }
    }

    /// Takes the first item and passes it to `f` before it is released.
    ///
    /// Returns `None` if the queue is empty, or if the producer of the first item hasn't finished
    /// storing it yet.
    fn take_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        let pin = crossbeam_epoch::pin();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == self.tail.load(Ordering::Acquire) {
                return None;
            }
            if self.mapper.get(index(head), &pin).is_none() {
                let current = self.head.load(Ordering::Acquire);
                if current == head {
                    // Not stored yet.
                    return None;
                }
                // Someone else took it meanwhile.
                head = current;
                continue;
            }
            match self.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let item = self
                        .mapper
                        .remove_at(index(head), &pin)
                        .expect("BUG: Claimed position lost its item");
                    return Some(f(item));
                }
                Err(current) => head = current,
            }
        }
    }

    /// Number of positions between the cursors.
    ///
    /// This counts the items still being stored by their producers too.
    pub fn len(&self) -> usize {
        // Head first. It never passes the tail, so the difference can't underflow.
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Checks if there's nothing in the queue.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes everything out of the queue.
    ///
    /// Stops at the first item still being stored.
    pub fn clear(&self) {
        while self.take_with(|_| ()).is_some() {}
    }
}

impl<T: Clone> ConQueue<T> {
    /// Removes the first item and returns it.
    pub fn try_take(&self) -> Option<T> {
        self.take_with(T::clone)
    }

    /// Returns a copy of the first item, without removing it.
    pub fn try_peek(&self) -> Option<T> {
        self.try_get(0)
    }

    /// Returns a copy of the item at given distance from the front of the queue.
    pub fn try_get(&self, position: usize) -> Option<T> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if position >= tail.wrapping_sub(head) {
            return None;
        }
        let pin = crossbeam_epoch::pin();
        self.mapper
            .get(index(head.wrapping_add(position)), &pin)
            .cloned()
    }

    /// Iterates through copies of the items, from the front.
    ///
    /// The range of positions is fixed when the iterator is created. Items taken or not yet
    /// stored by the time the iterator gets to them are skipped.
    pub fn iter(&self) -> Iter<'_, T> {
        let next = self.head.load(Ordering::Acquire);
        let end = self.tail.load(Ordering::Acquire);
        Iter {
            queue: self,
            next,
            end,
        }
    }
}

impl<T> Default for ConQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Debug> Debug for ConQueue<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_list().entries(self.iter()).finish()
    }
}

/// The iterator of the [`ConQueue`].
pub struct Iter<'a, T> {
    queue: &'a ConQueue<T>,
    next: usize,
    end: usize,
}

impl<'a, T: Clone> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let pin = crossbeam_epoch::pin();
        while self.next != self.end {
            let position = self.next;
            self.next = self.next.wrapping_add(1);
            if let Some(item) = self.queue.mapper.get(index(position), &pin) {
                return Some(item.clone());
            }
        }
        None
    }
}

impl<'a, T: Clone> IntoIterator for &'a ConQueue<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T> Extend<T> for &'a ConQueue<T> {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        for item in iter {
            self.add(item);
        }
    }
}

impl<T> Extend<T> for ConQueue<T> {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut me: &ConQueue<_> = self;
        me.extend(iter);
    }
}

impl<T> FromIterator<T> for ConQueue<T> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut me = ConQueue::new();
        me.extend(iter);
        me
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use crossbeam_utils::thread;

    use super::*;

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10000;
    const TEST_BATCH_SMALL: usize = 100;
    const TEST_REP: usize = 20;

    #[test]
    fn empty() {
        let queue: ConQueue<usize> = ConQueue::new();
        assert!(queue.is_empty());
        assert!(queue.try_take().is_none());
        assert!(queue.try_peek().is_none());
        assert!(queue.try_get(0).is_none());
        assert_eq!("[]", format!("{:?}", queue));
    }

    #[test]
    fn fifo() {
        let queue = ConQueue::new();
        for i in 0..TEST_BATCH {
            queue.add(i);
        }
        assert_eq!(TEST_BATCH, queue.len());
        for i in 0..TEST_BATCH {
            assert_eq!(Some(i), queue.try_take());
        }
        assert!(queue.try_take().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_and_get() {
        let queue = (0..TEST_BATCH_SMALL).collect::<ConQueue<_>>();
        assert_eq!(Some(0), queue.try_peek());
        assert_eq!(Some(42), queue.try_get(42));
        assert!(queue.try_get(TEST_BATCH_SMALL).is_none());
        assert_eq!(Some(0), queue.try_take());
        assert_eq!(Some(43), queue.try_get(42));
        assert_eq!(TEST_BATCH_SMALL - 1, queue.len());
    }

    #[test]
    fn iter_and_debug() {
        let queue = ConQueue::new();
        assert!(queue.try_add(1).is_ok());
        queue.add(2);
        queue.add(3);
        assert_eq!(vec![1, 2, 3], queue.iter().collect::<Vec<_>>());
        assert_eq!("[1, 2, 3]", format!("{:?}", queue));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.iter().next().is_none());
    }

    #[test]
    fn wraps_around_index_space() {
        let start = u32::MAX as usize - TEST_BATCH_SMALL / 2;
        let queue = ConQueue::starting_at(start);
        for i in 0..TEST_BATCH_SMALL {
            queue.add(i);
        }
        assert_eq!(TEST_BATCH_SMALL, queue.len());
        assert_eq!(
            (0..TEST_BATCH_SMALL).collect::<Vec<_>>(),
            queue.iter().collect::<Vec<_>>()
        );
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(Some(i), queue.try_take());
        }
        assert!(queue.mapper.is_empty());
    }

    #[test]
    fn full_refuses() {
        let queue = ConQueue::new();
        queue.tail.store(MAX_QUEUED, Ordering::Relaxed);
        assert_eq!(Err(1), queue.try_add(1));
    }

    #[test]
    fn par_producers() {
        for _ in 0..TEST_REP {
            let queue = ConQueue::new();
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let queue = &queue;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH_SMALL {
                            queue.add(t * TEST_BATCH_SMALL + i);
                        }
                    });
                }
            })
            .unwrap();

            let mut seen = Vec::new();
            while let Some(item) = queue.try_take() {
                seen.push(item);
            }
            // Each producer's own items keep their order.
            for t in 0..TEST_THREADS {
                let own = seen
                    .iter()
                    .filter(|i| *i / TEST_BATCH_SMALL == t)
                    .cloned()
                    .collect::<Vec<_>>();
                let expected = (0..TEST_BATCH_SMALL)
                    .map(|i| t * TEST_BATCH_SMALL + i)
                    .collect::<Vec<_>>();
                assert_eq!(expected, own);
            }
        }
    }

    #[test]
    fn par_producers_consumers() {
        let queue = ConQueue::new();
        let done = AtomicBool::new(false);
        let taken = AtomicUsize::new(0);
        let sum = AtomicUsize::new(0);
        thread::scope(|s| {
            let producers = (0..TEST_THREADS / 2)
                .map(|t| {
                    let queue = &queue;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            queue.add(t * TEST_BATCH + i);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for _ in 0..TEST_THREADS / 2 {
                let queue = &queue;
                let done = &done;
                let taken = &taken;
                let sum = &sum;
                s.spawn(move |_| loop {
                    let finished = done.load(Ordering::Acquire);
                    match queue.try_take() {
                        Some(item) => {
                            taken.fetch_add(1, Ordering::Relaxed);
                            sum.fetch_add(item, Ordering::Relaxed);
                        }
                        None if finished && queue.is_empty() => break,
                        None => (),
                    }
                });
            }
            for producer in producers {
                producer.join().unwrap();
            }
            done.store(true, Ordering::Release);
        })
        .unwrap();

        let count = TEST_BATCH * (TEST_THREADS / 2);
        assert_eq!(count, taken.load(Ordering::Relaxed));
        assert_eq!(count * (count - 1) / 2, sum.load(Ordering::Relaxed));
        assert!(queue.is_empty());
    }
}
