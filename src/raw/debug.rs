//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *trie itself*, but it is exposed as potentially
//! useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::sync::atomic::Ordering;

use crossbeam_epoch::Guard;

use super::{Branch, Cells, Mapper};

impl<V> Mapper<V> {
    // Hack: &mut to make sure it is not shared between threads and nobody is modifying the thing
    // right now.
    /// Panics if the trie is not in consistent state and pruned well.
    ///
    /// Every branch except the root must hold something, nothing may be retired or half-retired
    /// while still linked, and the child counts must match what is actually stored.
    #[cfg(test)]
    pub(crate) fn assert_pruned(&mut self) {
        fn check_branch<V>(branch: &Branch<V>, depth: usize, is_root: bool) -> usize {
            // Unprotected is fine, we are &mut so nobody else is allowed to do stuff to us at the
            // moment.
            let pin = unsafe { crossbeam_epoch::unprotected() };

            assert_eq!(depth, branch.depth, "Branch at a wrong level");
            assert!(!branch.uses.is_retired(), "Retired branch still linked");
            assert_eq!(0, branch.uses.uses(), "Nobody should be inside");

            let mut occupied = 0;
            let mut values = 0;
            match &branch.cells {
                Cells::Inner(children) => {
                    for (idx, slot) in children.iter().enumerate() {
                        assert!(!slot.is_parked(pin), "Leftover retirement");
                        let child = slot.load(pin);
                        if let Some(child) = unsafe { child.as_ref() } {
                            assert_eq!(idx, child.index, "Branch in a wrong cell");
                            occupied += 1;
                            values += check_branch(child, depth + 1, false);
                        }
                    }
                }
                Cells::Leaf(cells) => {
                    occupied = cells
                        .iter()
                        .filter(|cell| !cell.load(Ordering::Relaxed, pin).is_null())
                        .count();
                    values = occupied;
                }
            }

            assert_eq!(occupied, branch.uses.children(), "Child count out of sync");
            assert!(is_root || occupied > 0, "This branch should have been pruned");
            values
        }

        let values = check_branch(&self.root, 0, true);
        assert_eq!(values, self.len(), "Value count out of sync");
    }

    fn print_shape_branch(branch: &Branch<V>, fmt: &mut Formatter, pin: &Guard) -> FmtResult
    where
        V: Debug,
    {
        write!(fmt, "{:?}/{}", branch as *const _, branch.uses.children())?;
        write!(fmt, "(")?;
        match &branch.cells {
            Cells::Inner(children) => {
                for (idx, slot) in children.iter().enumerate() {
                    let child = slot.load(pin);
                    if let Some(child) = unsafe { child.as_ref() } {
                        write!(fmt, " {:X}:", idx)?;
                        Self::print_shape_branch(child, fmt, pin)?;
                    }
                }
            }
            Cells::Leaf(values) => {
                for (idx, value) in values.iter().enumerate() {
                    let value = value.load(Ordering::Acquire, pin);
                    if let Some(value) = unsafe { value.as_ref() } {
                        write!(fmt, " {:X}:{:?}", idx, value)?;
                    }
                }
            }
        }
        write!(fmt, " )")
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        V: Debug,
    {
        let pin = crossbeam_epoch::pin();
        Self::print_shape_branch(&self.root, fmt, &pin)
    }
}

/// A pretty-printing wrapper around the raw trie.
///
/// The structure, including the branch addresses and their child counts, is printed if this is
/// used to wrap the trie. Empty cells are skipped.
pub struct PrintShape<'a, V>(pub &'a Mapper<V>);

impl<V: Debug> Display for PrintShape<'_, V> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape() {
        let mapper = Mapper::new();
        let pin = crossbeam_epoch::pin();
        assert!(format!("{}", PrintShape(&mapper)).ends_with("/0( )"));

        mapper.set(0x1000_0002, "x", &pin);
        let shape = format!("{}", PrintShape(&mapper));
        assert!(shape.contains(" 1:"), "{}", shape);
        assert!(shape.contains(" 2:\"x\""), "{}", shape);
        // Root, 6 inner levels and the leaf.
        assert_eq!(8, shape.matches('(').count(), "{}", shape);
    }
}
