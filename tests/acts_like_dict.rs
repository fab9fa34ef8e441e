//! In these tests, we make sure the ConDictionary and the HashBucket work as a HashMap in single
//! threaded context, and sometimes in multithreaded too.
//!
//! To do that we simply generate a series of inserts, lookups and deletions and try them on both
//! maps. They need to return the same things.
//!
//! Furthermore, each test is run in several instances, with keys in differently sized universe.
//! The small ones are more likely to reuse the same key.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use conbucket::{ConDictionary, HashBucket, Options};
use proptest::collection::vec;
use proptest::prelude::*;
use rayon::prelude::*;

#[derive(Debug, Clone)]
enum Instruction<K, V> {
    Lookup(K),
    Remove(K),
    Set(K, V),
    GetOrAdd(K, V),
}

impl<K, V> Instruction<K, V>
where
    K: Arbitrary + Clone + Debug + Eq + Hash,
    V: Arbitrary + Clone + Debug + PartialEq,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            any::<K>().prop_map(Lookup),
            any::<K>().prop_map(Remove),
            any::<(K, V)>().prop_map(|(k, v)| Set(k, v)),
            any::<(K, V)>().prop_map(|(k, v)| GetOrAdd(k, v)),
        ]
    }

    fn run(instructions: Vec<Self>) -> Result<(), TestCaseError> {
        use Instruction::*;

        let dict = ConDictionary::new();
        let bucket = HashBucket::with_options(Options::new().capacity(4), RandomState::new())
            .expect("Valid options");
        let mut map = HashMap::new();
        for ins in instructions {
            match ins {
                Lookup(key) => {
                    let expected = map.get(&key).cloned();
                    prop_assert_eq!(&expected, &dict.get(&key));
                    prop_assert_eq!(&expected, &bucket.get(&key));
                }
                Remove(key) => {
                    let expected = map.remove(&key);
                    prop_assert_eq!(&expected, &dict.remove(&key));
                    prop_assert_eq!(&expected, &bucket.remove(&key));
                }
                Set(key, value) => {
                    let expected = map.insert(key.clone(), value.clone());
                    prop_assert_eq!(&expected, &dict.set(key.clone(), value.clone()));
                    prop_assert_eq!(&expected, &bucket.set(key, value));
                }
                GetOrAdd(key, value) => {
                    let expected = map.entry(key.clone()).or_insert(value.clone()).clone();
                    prop_assert_eq!(&expected, &dict.get_or_add(key.clone(), value.clone()));
                    prop_assert_eq!(&expected, &bucket.get_or_add(key, value));
                }
            }
        }
        prop_assert_eq!(map.len(), dict.len());
        prop_assert_eq!(map.len(), bucket.len());

        Ok(())
    }
}

fn insert_parallel_test<T: Clone + Hash + Eq + Send + Sync>(
    values: Vec<T>,
) -> Result<(), TestCaseError> {
    let set: HashSet<_> = values.iter().cloned().collect();
    let dict = ConDictionary::new();
    let bucket = HashBucket::new();
    values.into_par_iter().for_each(|v| {
        dict.set(v.clone(), ());
        bucket.set(v, ());
    });
    prop_assert_eq!(set.len(), dict.len());
    prop_assert_eq!(set.len(), bucket.len());
    for v in set {
        prop_assert!(dict.get(&v).is_some());
        prop_assert!(bucket.get(&v).is_some());
    }

    Ok(())
}

proptest! {
    #[test]
    fn small_keys(instructions in vec(Instruction::<u8, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn mid_keys(instructions in vec(Instruction::<u16, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn large_keys(instructions in vec(Instruction::<usize, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn string_keys(instructions in vec(Instruction::<String, usize>::strategy(), 1..100)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn insert_all_small_parallel(values in vec(any::<u8>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_mid_parallel(values in vec(any::<u16>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_large_parallel(values in vec(any::<usize>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }
}
