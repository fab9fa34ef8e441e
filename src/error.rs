//! The [`Error`][crate::Error] type.

use std::error::Error as StdError;
use std::fmt;

/// Errors that cross the public boundary of the containers.
///
/// Races between threads never show up here, they are absorbed by retrying internally. What is
/// left are semantic conflicts and invalid construction options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// A strict add found the key already present.
    DuplicateKey,
    /// A construction option is outside of its allowed range.
    OutOfRange {
        /// Which option it was.
        name: &'static str,
        /// The rejected value.
        value: usize,
        /// Smallest accepted value.
        min: usize,
        /// Largest accepted value.
        max: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateKey => write!(f, "An item with the same key has already been added"),
            Error::OutOfRange {
                name,
                value,
                min,
                max,
            } => write!(
                f,
                "Option '{}' is out of range: {} not in {}..={}",
                name, value, min, max
            ),
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            "An item with the same key has already been added",
            Error::DuplicateKey.to_string()
        );
        let err = Error::OutOfRange {
            name: "probing",
            value: 0,
            min: 1,
            max: 32,
        };
        assert_eq!("Option 'probing' is out of range: 0 not in 1..=32", err.to_string());
    }
}
