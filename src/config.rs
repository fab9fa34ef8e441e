//! Customization of the containers.
//!
//! There are two kinds of knobs. The [`Config`] trait describes, on the type level, what is stored
//! and what part of it identifies the entry. The [`Options`] are the runtime construction
//! parameters.

use std::borrow::Borrow;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::error::Error;

/// Default capacity of a fresh [`HashBucket`][crate::HashBucket] segment.
pub const DEFAULT_CAPACITY: usize = 64;

/// The largest initial capacity accepted.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Default number of consecutive slots probed before a table is considered full.
pub const DEFAULT_PROBING: usize = 4;

/// The largest initial probing window accepted.
pub const MAX_PROBING: usize = 1 << 16;

/// Shape of the payload stored by the probing containers.
///
/// Each payload carries its own key. The key is hashed to find the home index of the payload and
/// compared for equality to tell entries apart.
pub trait Config {
    /// The payload (eg. key-value pairs) stored inside the container.
    type Payload: Borrow<Self::Key>;

    /// The part of the payload used for hashing and identification.
    type Key: Hash + Eq;
}

/// A trivial config, where the payload and the key are the same thing.
pub struct Trivial<T>(PhantomData<T>);

impl<T> Config for Trivial<T>
where
    T: Hash + Eq,
{
    type Payload = T;
    type Key = T;
}

/// Construction parameters of the hash based containers.
///
/// ```rust
/// use conbucket::{HashBucket, Options};
///
/// let bucket: HashBucket<u32, &str> = HashBucket::with_options(
///     Options::new().capacity(16).probing(2),
///     Default::default(),
/// ).unwrap();
/// assert_eq!(16, bucket.capacity());
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Options {
    capacity: usize,
    probing: usize,
}

impl Options {
    /// The default options.
    pub fn new() -> Self {
        Options {
            capacity: DEFAULT_CAPACITY,
            probing: DEFAULT_PROBING,
        }
    }

    /// Sets the initial capacity.
    ///
    /// It is rounded up to the next power of two when used.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the initial probing window.
    pub fn probing(mut self, probing: usize) -> Self {
        self.probing = probing;
        self
    }

    /// The capacity, checked and rounded to a power of two.
    pub(crate) fn checked_capacity(&self) -> Result<usize, Error> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(Error::OutOfRange {
                name: "capacity",
                value: self.capacity,
                min: 1,
                max: MAX_CAPACITY,
            });
        }
        Ok(self.capacity.next_power_of_two())
    }

    /// The probing window, checked.
    pub(crate) fn checked_probing(&self) -> Result<usize, Error> {
        checked_probing(self.probing)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn checked_probing(probing: usize) -> Result<usize, Error> {
    if probing == 0 || probing > MAX_PROBING {
        Err(Error::OutOfRange {
            name: "probing",
            value: probing,
            min: 1,
            max: MAX_PROBING,
        })
    } else {
        Ok(probing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity() {
        assert_eq!(Ok(64), Options::new().checked_capacity());
        assert_eq!(Ok(32), Options::new().capacity(17).checked_capacity());
        assert_eq!(Ok(1), Options::new().capacity(1).checked_capacity());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Options::new().capacity(0).checked_capacity().is_err());
        assert!(Options::new()
            .capacity(MAX_CAPACITY + 1)
            .checked_capacity()
            .is_err());
        assert_eq!(
            Err(Error::OutOfRange {
                name: "probing",
                value: 0,
                min: 1,
                max: MAX_PROBING
            }),
            Options::new().probing(0).checked_probing()
        );
    }
}
