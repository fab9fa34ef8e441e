//! The [`ExistingOrNew`][crate::ExistingOrNew] enum.

use std::ops::{Deref, DerefMut};

/// Result of a get-or-add style operation.
///
/// Tells whether the returned value was already stored under the key or the call had to add it.
/// It dereferences to the value, so in most places it can be used as if it was the value itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ExistingOrNew<T> {
    /// Some other call stored the value before us.
    Existing(T),
    /// This call added the value.
    New(T),
}

impl<T> ExistingOrNew<T> {
    /// Extracts the value, forgetting where it came from.
    pub fn into_inner(self) -> T {
        match self {
            ExistingOrNew::Existing(value) | ExistingOrNew::New(value) => value,
        }
    }

    /// Transforms the value, keeping the information about its origin.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExistingOrNew<U> {
        match self {
            ExistingOrNew::Existing(value) => ExistingOrNew::Existing(f(value)),
            ExistingOrNew::New(value) => ExistingOrNew::New(f(value)),
        }
    }

    /// Was the value added by this call?
    pub fn is_new(&self) -> bool {
        matches!(self, ExistingOrNew::New(_))
    }

    /// Was the value already present?
    pub fn is_existing(&self) -> bool {
        !self.is_new()
    }
}

impl<T> Deref for ExistingOrNew<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            ExistingOrNew::Existing(value) | ExistingOrNew::New(value) => value,
        }
    }
}

impl<T> DerefMut for ExistingOrNew<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            ExistingOrNew::Existing(value) | ExistingOrNew::New(value) => value,
        }
    }
}
