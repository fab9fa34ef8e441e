#![doc(test(attr(deny(warnings))))]
#![warn(missing_docs)]

//! A concurrent trie-indexed array and the lock-free containers built on top of it.
//!
//! The core of this crate is the [`Mapper`], an unbounded array indexed by 32-bit integers. It is
//! a trie of fixed height: every level consumes 4 bits of the index and the branches get created
//! when first needed and pruned (and recycled) when they become empty again. As the index space
//! is always there, the containers on top of it never need to resize:
//!
//! * [`ConDictionary`] maps keys to values. The hash of a key picks the index, collisions are
//!   resolved by linear probing into the neighbouring indices.
//! * [`ConSet`] is the same thing, with just the keys.
//! * [`ConQueue`] is a FIFO queue placing the items at ever-increasing indices.
//!
//! Then there's the [`HashBucket`], a more traditional open-addressed hash table. It does need to
//! resize when it gets full, and it does so cooperatively: every thread that notices the resize
//! helps to copy the entries over instead of waiting for it.
//!
//! All of them can be shared between threads and used through shared references. No operation
//! ever takes a lock. Values are handed out as clones, so cheap-to-clone types (or [`Arc`]s) are
//! the best fit.
//!
//! ```rust
//! use conbucket::{ConDictionary, ConQueue};
//! use crossbeam_utils::thread;
//!
//! let dict = ConDictionary::new();
//! let queue = ConQueue::new();
//!
//! thread::scope(|s| {
//!     s.spawn(|_| {
//!         dict.set("hello", 1);
//!         queue.add("hello");
//!     });
//!     s.spawn(|_| {
//!         dict.set("world", 2);
//!         queue.add("world");
//!     });
//! }).unwrap();
//!
//! assert_eq!(Some(1), dict.get("hello"));
//! assert_eq!(2, queue.len());
//! ```
//!
//! # Features
//!
//! * `rayon`: parallel extension and collection of the dictionary and set.
//! * `tracing`: debug events about resizes of the [`HashBucket`].
//!
//! [`Arc`]: std::sync::Arc

pub mod bucket;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod existing_or_new;
mod guarded;
pub mod pool;
mod probe;
pub mod queue;
pub mod raw;
pub mod set;

pub use self::bucket::HashBucket;
pub use self::config::{Config, Options};
pub use self::dictionary::ConDictionary;
pub use self::error::Error;
pub use self::existing_or_new::ExistingOrNew;
pub use self::queue::ConQueue;
pub use self::raw::Mapper;
pub use self::set::ConSet;
