use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard};

use super::{ConcurrentMap, Revision, Swapped, Versioned};
use crate::error::Result;
use crate::options::MapOptions;

/// A concurrent hashmap built on `DashMap` shards.
///
/// Single-key primitives only lock the key's shard. `clear` has to empty
/// every shard at once, so all primitives pass through a shared gate that
/// `clear` takes exclusively. The gate is fair: once `clear` is waiting,
/// new primitives queue behind it instead of starving it.
pub struct ShardedMap<K, V, S = RandomState> {
    gate: RwLock<()>,
    shards: DashMap<K, Versioned<V>, S>,
    revision: AtomicU64,
}

/// Reference to a value inside a [`ShardedMap`].
///
/// Holds the shard's read lock and keeps `clear` out until dropped. While
/// a `clear` is pending, any other call into the map from the thread
/// holding it blocks forever.
pub struct ShardRef<'a, K, V, S> {
    // declared first so the shard lock is released before the gate
    inner: Ref<'a, K, Versioned<V>, S>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl<'a, K, V, S> Deref for ShardRef<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.inner.value().value
    }
}

impl<K, V> Default for ShardedMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ShardedMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::from_shards(DashMap::new())
    }

    pub fn with_options(options: MapOptions) -> Result<Self> {
        Self::with_options_and_hasher(options, RandomState::default())
    }
}

impl<K, V, S> ShardedMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::from_shards(DashMap::with_hasher(hasher))
    }

    pub fn with_options_and_hasher(options: MapOptions, hasher: S) -> Result<Self> {
        options.validate()?;
        let shards = match options.shard_amount {
            Some(amount) => DashMap::with_capacity_and_hasher_and_shard_amount(
                options.capacity,
                hasher,
                amount,
            ),
            None => DashMap::with_capacity_and_hasher(options.capacity, hasher),
        };
        Ok(Self::from_shards(shards))
    }

    fn from_shards(shards: DashMap<K, Versioned<V>, S>) -> Self {
        ShardedMap {
            gate: RwLock::new(()),
            shards,
            revision: AtomicU64::new(0),
        }
    }

    /// Must only be called while the entry being mutated is locked.
    fn next_revision(&self) -> Revision {
        Revision(self.revision.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl<K, V, S> FromIterator<(K, V)> for ShardedMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let shards = iter
            .into_iter()
            .map(|(key, value)| {
                let slot = Versioned {
                    value,
                    revision: Revision::ZERO,
                };
                (key, slot)
            })
            .collect();
        Self::from_shards(shards)
    }
}

impl<K, V, S> ConcurrentMap for ShardedMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    type Key = K;
    type Val = V;
    type ValueRef<'a> = ShardRef<'a, K, V, S> where Self: 'a;

    fn get(&self, key: &K) -> Option<ShardRef<'_, K, V, S>> {
        let gate = self.gate.read();
        self.shards.get(key).map(|inner| ShardRef { inner, _gate: gate })
    }

    fn load(&self, key: &K) -> Option<Versioned<V>> {
        let _gate = self.gate.read();
        self.shards.get(key).map(|slot| slot.value().clone())
    }

    fn len(&self) -> usize {
        let _gate = self.gate.read();
        self.shards.len()
    }

    fn revision(&self) -> Revision {
        Revision(self.revision.load(Ordering::SeqCst))
    }

    fn swap_if(
        &self,
        key: &K,
        expected: Option<Revision>,
        value: V,
    ) -> std::result::Result<Swapped<V>, V> {
        let _gate = self.gate.read();
        match self.shards.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Err(value);
                }
                let revision = self.next_revision();
                vacant.insert(Versioned { value, revision });
                Ok(Swapped {
                    previous: None,
                    revision,
                })
            }
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().revision) {
                    return Err(value);
                }
                let revision = self.next_revision();
                let previous = occupied.insert(Versioned { value, revision });
                Ok(Swapped {
                    previous: Some(previous.value),
                    revision,
                })
            }
        }
    }

    fn replace_if_eq(
        &self,
        key: &K,
        value: V,
        expected: &V,
    ) -> std::result::Result<(V, Revision), V>
    where
        V: PartialEq,
    {
        let _gate = self.gate.read();
        match self.shards.get_mut(key) {
            Some(mut slot) if slot.value == *expected => {
                let revision = self.next_revision();
                let previous = std::mem::replace(&mut *slot, Versioned { value, revision });
                Ok((previous.value, revision))
            }
            _ => Err(value),
        }
    }

    fn remove(&self, key: &K) -> Option<(V, Revision)> {
        let _gate = self.gate.read();
        match self.shards.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let revision = self.next_revision();
                Some((occupied.remove().value, revision))
            }
            Entry::Vacant(_) => None,
        }
    }

    fn clear(&self) -> Revision {
        let _gate = self.gate.write();
        let revision = self.next_revision();
        self.shards.clear();
        revision
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        let _gate = self.gate.read();
        self.shards
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::contract;

    #[test]
    fn test_hashtable() {
        contract::insert_and_get(ShardedMap::new());
    }

    #[test]
    fn revisions() {
        contract::revisions_increase(ShardedMap::new());
        contract::swap_if_checks_revision(ShardedMap::new());
    }

    #[test]
    fn conditional_primitives() {
        contract::replace_and_remove(ShardedMap::new());
        contract::factories(ShardedMap::new());
    }

    #[test]
    fn clear_and_snapshot() {
        contract::clear_and_snapshot(ShardedMap::new());
    }

    #[test]
    fn concurrent_upserts() {
        contract::concurrent_upserts(ShardedMap::new());
    }

    #[test]
    fn clear_is_not_starved_by_readers() {
        contract::clear_under_read_load(ShardedMap::new());
    }

    #[test]
    fn built_from_options() {
        let options = MapOptions::new().with_capacity(64).with_shard_amount(4);
        let map = ShardedMap::<u32, u32>::with_options(options).unwrap();
        contract::clear_and_snapshot(map);

        let bad = MapOptions::new().with_shard_amount(3);
        assert!(ShardedMap::<u32, u32>::with_options(bad).is_err());
    }

    #[test]
    fn initial_contents_start_at_revision_zero() {
        let map: ShardedMap<u32, &str> = vec![(1, "a"), (2, "b")].into_iter().collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map.revision(), Revision::ZERO);
        assert_eq!(map.load(&1).unwrap().revision, Revision::ZERO);
        assert!(map.swap_if(&1, Some(Revision::ZERO), "c").is_ok());
    }

    #[test]
    fn clear_waits_for_outstanding_refs() {
        let map = ShardedMap::new();
        map.try_insert(&1u32, 1u32).unwrap();

        crossbeam::scope(|s| {
            let held = map.get(&1).unwrap();
            let clearer = s.spawn(|_| map.clear());
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(*held, 1);
            drop(held);
            clearer.join().unwrap();
        })
        .unwrap();

        assert!(map.is_empty());
    }
}
