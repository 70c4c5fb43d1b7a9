//! This module contains the concurrent hashmap backends the observable
//! layer is built on.

mod sharded_map;
mod striped_map;

pub use sharded_map::{ShardRef, ShardedMap};
pub use striped_map::{ElemRef, StripedHashMap};

use std::fmt;
use std::hash::Hash;
use std::ops::Deref;

use tracing::trace;

/// Position of a committed mutation in a map's modification history.
///
/// Every map keeps one counter; it is bumped while the mutated entry is
/// still locked, so for a single key the revision order is the commit
/// order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Revision {
    fn from(raw: u64) -> Self {
        Revision(raw)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A stored value together with the revision that last wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub revision: Revision,
}

/// Outcome of a successful [`ConcurrentMap::swap_if`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Swapped<V> {
    /// The value that was replaced, `None` if the key was vacant.
    pub previous: Option<V>,
    pub revision: Revision,
}

/// Outcome of [`ConcurrentMap::get_or_try_insert_with`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetched<V> {
    /// The key was already mapped; the factory result (if any) was dropped.
    Existing(V),
    /// This call's value was inserted.
    Inserted { value: V, revision: Revision },
}

impl<V> Fetched<V> {
    pub fn into_value(self) -> V {
        match self {
            Fetched::Existing(value) | Fetched::Inserted { value, .. } => value,
        }
    }
}

/// Outcome of [`ConcurrentMap::try_upsert`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upserted<V> {
    Inserted {
        value: V,
        revision: Revision,
    },
    Updated {
        previous: V,
        value: V,
        revision: Revision,
    },
}

impl<V> Upserted<V> {
    pub fn revision(&self) -> Revision {
        match self {
            Upserted::Inserted { revision, .. } | Upserted::Updated { revision, .. } => *revision,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            Upserted::Inserted { value, .. } | Upserted::Updated { value, .. } => value,
        }
    }
}

/// Atomic primitives of a concurrent hash map.
///
/// Every mutating primitive is atomic with respect to the other
/// primitives on the same key and stamps a fresh [`Revision`] while the
/// entry is locked. None of them notify anybody.
pub trait ConcurrentMap {
    /// Key type for a HashMap implementation.
    type Key: Hash + Eq + Clone;
    /// Value type for a HashMap implementation.
    type Val: Clone;
    /// HashMap entry reference type.
    type ValueRef<'a>: Deref<Target = Self::Val>
    where
        Self: 'a;

    /// Get reference to a value associated with a key, if it exists.
    ///
    /// The returned reference keeps the entry's lock, and `clear` or a
    /// table resize waits for it. Calling into the same map from the same
    /// thread while holding it may deadlock.
    fn get(&self, key: &Self::Key) -> Option<Self::ValueRef<'_>>;

    /// Clone of the value and the revision that wrote it.
    fn load(&self, key: &Self::Key) -> Option<Versioned<Self::Val>>;

    fn len(&self) -> usize;

    /// Revision of the most recent commit, [`Revision::ZERO`] for a map
    /// that was never mutated.
    fn revision(&self) -> Revision;

    /// Maps `key` to `value` if the entry's current revision equals
    /// `expected`, where `None` means "vacant". Hands `value` back on
    /// mismatch.
    fn swap_if(
        &self,
        key: &Self::Key,
        expected: Option<Revision>,
        value: Self::Val,
    ) -> Result<Swapped<Self::Val>, Self::Val>;

    /// Replaces the value mapped to `key` if it equals `expected`.
    ///
    /// Returns the displaced value, or hands `value` back if the key is
    /// absent or its value differs.
    fn replace_if_eq(
        &self,
        key: &Self::Key,
        value: Self::Val,
        expected: &Self::Val,
    ) -> Result<(Self::Val, Revision), Self::Val>
    where
        Self::Val: PartialEq;

    /// Attempts to remove a key-value pair, returning the removed value.
    fn remove(&self, key: &Self::Key) -> Option<(Self::Val, Revision)>;

    /// Removes every entry at once. Multi-key readers (`len`, `snapshot`)
    /// see the map either before or after, never in between.
    fn clear(&self) -> Revision;

    /// Copies every entry out of the map.
    fn snapshot(&self) -> Vec<(Self::Key, Self::Val)>;

    /// Check whether the map contains a value mapped to the given key.
    fn contains(&self, key: &Self::Key) -> bool {
        self.get(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts only if `key` is vacant.
    fn try_insert(&self, key: &Self::Key, value: Self::Val) -> Result<Revision, Self::Val> {
        self.swap_if(key, None, value).map(|swapped| swapped.revision)
    }

    /// Returns the value mapped to `key`, inserting the factory's result
    /// if there is none.
    ///
    /// The factory runs without any lock held and at most once per call.
    /// Racing callers may each run their factory; only one result is
    /// inserted and the others observe it as [`Fetched::Existing`].
    fn get_or_try_insert_with<E, F>(
        &self,
        key: &Self::Key,
        factory: F,
    ) -> Result<Fetched<Self::Val>, E>
    where
        F: FnOnce(&Self::Key) -> Result<Self::Val, E>,
    {
        if let Some(current) = self.load(key) {
            return Ok(Fetched::Existing(current.value));
        }

        let mut candidate = factory(key)?;
        loop {
            match self.swap_if(key, None, candidate.clone()) {
                Ok(swapped) => {
                    return Ok(Fetched::Inserted {
                        value: candidate,
                        revision: swapped.revision,
                    })
                }
                Err(rejected) => {
                    if let Some(current) = self.load(key) {
                        return Ok(Fetched::Existing(current.value));
                    }
                    // the winner was removed again before we could read it
                    trace!("get_or_insert lost a race, retrying");
                    candidate = rejected;
                }
            }
        }
    }

    /// Inserts `add(key)` if `key` is vacant, otherwise replaces the
    /// current value with `update(key, current)`.
    ///
    /// Optimistic: the factories run without any lock held and the result
    /// is committed only if the entry was not written in the meantime.
    /// Under contention either factory may therefore run several times.
    fn try_upsert<E, A, U>(
        &self,
        key: &Self::Key,
        mut add: A,
        mut update: U,
    ) -> Result<Upserted<Self::Val>, E>
    where
        A: FnMut(&Self::Key) -> Result<Self::Val, E>,
        U: FnMut(&Self::Key, &Self::Val) -> Result<Self::Val, E>,
    {
        loop {
            let (expected, value) = match self.load(key) {
                None => (None, add(key)?),
                Some(current) => (Some(current.revision), update(key, &current.value)?),
            };

            match self.swap_if(key, expected, value.clone()) {
                Ok(Swapped {
                    previous: None,
                    revision,
                }) => return Ok(Upserted::Inserted { value, revision }),
                Ok(Swapped {
                    previous: Some(previous),
                    revision,
                }) => {
                    return Ok(Upserted::Updated {
                        previous,
                        value,
                        revision,
                    })
                }
                Err(_) => trace!(?expected, "upsert lost a race, retrying"),
            }
        }
    }
}

/// Contract tests every backend has to pass.
#[cfg(test)]
pub(crate) mod contract {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    pub(crate) fn insert_and_get<M: ConcurrentMap<Key = String, Val = String>>(map: M) {
        let key = "hello".to_string();
        let val = "world".to_string();
        assert!(map.try_insert(&key, val.clone()).is_ok());
        assert!(map.contains(&key));
        assert_eq!(*map.get(&key).unwrap(), val);
        assert_eq!(map.len(), 1);

        assert_eq!(map.try_insert(&key, "again".to_string()), Err("again".to_string()));
        assert_eq!(*map.get(&key).unwrap(), val);
    }

    pub(crate) fn revisions_increase<M: ConcurrentMap<Key = u32, Val = u32>>(map: M) {
        assert_eq!(map.revision(), Revision::ZERO);
        let first = map.try_insert(&1, 10).unwrap();
        let second = map.try_insert(&2, 20).unwrap();
        assert!(first < second);
        assert_eq!(map.revision(), second);
        assert_eq!(map.load(&1).unwrap().revision, first);

        let (displaced, third) = map.replace_if_eq(&1, 11, &10).unwrap();
        assert_eq!(displaced, 10);
        assert!(second < third);

        let cleared = map.clear();
        assert!(third < cleared);
    }

    pub(crate) fn swap_if_checks_revision<M: ConcurrentMap<Key = u32, Val = u32>>(map: M) {
        let inserted = map.swap_if(&7, None, 1).unwrap();
        assert_eq!(inserted.previous, None);

        // stale revision
        assert_eq!(map.swap_if(&7, Some(Revision::ZERO), 2), Err(2));
        // vacant expected but occupied
        assert_eq!(map.swap_if(&7, None, 3), Err(3));

        let swapped = map.swap_if(&7, Some(inserted.revision), 4).unwrap();
        assert_eq!(swapped.previous, Some(1));
        assert_eq!(map.load(&7).unwrap().value, 4);

        // occupied expected but vacant
        assert_eq!(map.swap_if(&8, Some(swapped.revision), 5), Err(5));
        assert!(!map.contains(&8));
    }

    pub(crate) fn replace_and_remove<M: ConcurrentMap<Key = u32, Val = u32>>(map: M) {
        assert_eq!(map.replace_if_eq(&1, 2, &1), Err(2));
        map.try_insert(&1, 1).unwrap();
        assert_eq!(map.replace_if_eq(&1, 3, &2), Err(3));
        assert_eq!(map.load(&1).unwrap().value, 1);
        assert_eq!(map.replace_if_eq(&1, 3, &1).map(|(old, _)| old), Ok(1));

        assert_eq!(map.remove(&1).map(|(value, _)| value), Some(3));
        assert_eq!(map.remove(&1), None);
        assert!(map.is_empty());
    }

    pub(crate) fn factories<M: ConcurrentMap<Key = u32, Val = u32>>(map: M) {
        let fetched = map
            .get_or_try_insert_with(&1, |k| Ok::<_, Infallible>(k * 100))
            .unwrap();
        assert!(matches!(fetched, Fetched::Inserted { value: 100, .. }));

        let fetched = map
            .get_or_try_insert_with(&1, |_| -> Result<u32, Infallible> {
                panic!("factory must not run for a present key")
            })
            .unwrap();
        assert_eq!(fetched, Fetched::Existing(100));

        let failed = map.get_or_try_insert_with(&2, |_| Err("nope"));
        assert_eq!(failed, Err("nope"));
        assert!(!map.contains(&2));

        let upserted = map
            .try_upsert(&1, |_| Ok::<_, Infallible>(0), |_, old| Ok(old + 1))
            .unwrap();
        assert!(matches!(
            upserted,
            Upserted::Updated {
                previous: 100,
                value: 101,
                ..
            }
        ));
        let upserted = map
            .try_upsert(&3, |_| Ok::<_, Infallible>(30), |_, old| Ok(old + 1))
            .unwrap();
        assert!(matches!(upserted, Upserted::Inserted { value: 30, .. }));

        let failed = map.try_upsert(&3, |_| Ok(0), |_, _| Err("nope"));
        assert_eq!(failed, Err("nope"));
        assert_eq!(map.load(&3).unwrap().value, 30);
    }

    pub(crate) fn clear_and_snapshot<M: ConcurrentMap<Key = u32, Val = u32>>(map: M) {
        for i in 0..100 {
            map.try_insert(&i, i * 2).unwrap();
        }
        let mut entries = map.snapshot();
        entries.sort_unstable();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[42], (42, 84));

        map.clear();
        assert!(map.is_empty());
        assert!(map.snapshot().is_empty());
        // clearing an empty map still commits
        let before = map.revision();
        assert!(map.clear() > before);
    }

    pub(crate) fn concurrent_upserts<M>(map: M)
    where
        M: ConcurrentMap<Key = u32, Val = u32> + Sync,
    {
        const THREADS: u32 = 8;
        const ROUNDS: u32 = 500;

        crossbeam::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|_| {
                    for _ in 0..ROUNDS {
                        map.try_upsert(&0, |_| Ok::<_, Infallible>(1), |_, old| Ok(old + 1))
                            .unwrap();
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(map.load(&0).unwrap().value, THREADS * ROUNDS);
    }

    /// `clear` must get through while readers keep hammering the map.
    pub(crate) fn clear_under_read_load<M>(map: M)
    where
        M: ConcurrentMap<Key = u32, Val = u32> + Sync,
    {
        const READERS: u32 = 8;
        const KEYS: u32 = 64;
        for i in 0..KEYS {
            map.try_insert(&i, i).unwrap();
        }
        let done = AtomicBool::new(false);

        let elapsed = crossbeam::scope(|s| {
            for t in 0..READERS {
                let map = &map;
                let done = &done;
                s.spawn(move |_| {
                    let mut i = t;
                    while !done.load(Ordering::Relaxed) {
                        map.load(&(i % KEYS));
                        map.get(&((i + 1) % KEYS));
                        i = i.wrapping_add(1);
                    }
                });
            }

            thread::sleep(Duration::from_millis(20));
            let started = Instant::now();
            map.clear();
            let elapsed = started.elapsed();
            done.store(true, Ordering::Relaxed);
            elapsed
        })
        .unwrap();

        assert!(map.is_empty());
        assert!(elapsed < Duration::from_secs(2), "clear took {:?}", elapsed);
    }
}
