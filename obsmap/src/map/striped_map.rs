use crossbeam::utils::CachePadded;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{ConcurrentMap, Revision, Swapped, Versioned};
use crate::error::Result;
use crate::options::MapOptions;

const DEFAULT_NUM_BUCKETS: usize = 16;
const DEFAULT_MAX_AVG_BUCKET_SIZE: usize = 8;

type Bucket<K, V> = Vec<(K, Versioned<V>)>;

type ProtectedBucket<K, V> = Arc<RwLock<Bucket<K, V>>>;

type BucketReadGuard<K, V> = ArcRwLockReadGuard<RawRwLock, Bucket<K, V>>;

struct MaybeElemRef<K: PartialEq, V> {
    guard: BucketReadGuard<K, V>,
}

impl<K: PartialEq, V> MaybeElemRef<K, V> {
    fn find(self, key: &K) -> Option<ElemRef<K, V>> {
        let idx = self.guard.iter().position(|entry| entry.0 == *key)?;
        Some(ElemRef {
            idx,
            guard: self.guard,
        })
    }
}

/// Reference to a value inside a [`StripedHashMap`], holding its stripe's
/// read lock.
pub struct ElemRef<K: PartialEq, V> {
    idx: usize,
    guard: BucketReadGuard<K, V>,
}

impl<K: PartialEq, V> Deref for ElemRef<K, V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.guard[self.idx].1.value
    }
}

/// A concurrent hashmap implemented with lock striping.
///
/// Every single-key primitive holds the bucket table's read lock and
/// exactly one stripe lock; `clear`, `len` and `snapshot` take all stripes
/// in index order. Once the average stripe holds more than
/// `DEFAULT_MAX_AVG_BUCKET_SIZE` entries the table is doubled and rehashed
/// under its write lock, after every outstanding [`ElemRef`] is dropped.
pub struct StripedHashMap<K, V, S = RandomState> {
    buckets: RwLock<Box<[ProtectedBucket<K, V>]>>,
    num_entries: CachePadded<AtomicUsize>,
    max_avg_bucket_size: usize,
    revision: CachePadded<AtomicU64>,
    state: S,
}

impl<K, V> Default for StripedHashMap<K, V, RandomState>
where
    K: Hash + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StripedHashMap<K, V, RandomState>
where
    K: Hash + PartialEq,
{
    pub fn new() -> Self {
        StripedHashMap::build(DEFAULT_NUM_BUCKETS, 0, RandomState::default())
    }

    pub fn with_num_buckets(num_buckets: usize) -> Self {
        StripedHashMap::build(num_buckets.max(1), 0, RandomState::default())
    }

    pub fn with_options(options: MapOptions) -> Result<Self> {
        Self::with_options_and_hasher(options, RandomState::default())
    }
}

impl<K, V, S> StripedHashMap<K, V, S>
where
    K: Hash + PartialEq,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        StripedHashMap::build(DEFAULT_NUM_BUCKETS, 0, hasher)
    }

    /// `shard_amount` is the initial stripe count; the table still grows
    /// past it under load.
    pub fn with_options_and_hasher(options: MapOptions, hasher: S) -> Result<Self> {
        options.validate()?;
        let num_buckets = options.shard_amount.unwrap_or(DEFAULT_NUM_BUCKETS);
        let per_bucket = options.capacity_per_shard(num_buckets);
        Ok(StripedHashMap::build(num_buckets, per_bucket, hasher))
    }

    fn build(num_buckets: usize, per_bucket: usize, hasher: S) -> Self {
        let buckets = (0..num_buckets)
            .map(|_| Arc::new(RwLock::new(Vec::with_capacity(per_bucket))))
            .collect();

        StripedHashMap {
            buckets: RwLock::new(buckets),
            num_entries: CachePadded::new(AtomicUsize::new(0)),
            max_avg_bucket_size: DEFAULT_MAX_AVG_BUCKET_SIZE,
            revision: CachePadded::new(AtomicU64::new(0)),
            state: hasher,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.read().len()
    }

    fn hash(&self, key: &K) -> usize {
        let mut hasher = self.state.build_hasher();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    fn bucket_index(&self, key: &K, num_buckets: usize) -> usize {
        self.hash(key) % num_buckets
    }

    /// Must only be called while the entry being mutated is locked.
    fn next_revision(&self) -> Revision {
        Revision(self.revision.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn should_resize(&self, num_buckets: usize) -> bool {
        self.num_entries.load(Ordering::Relaxed) > num_buckets * self.max_avg_bucket_size
    }

    /// Doubles the table if it still has `seen_buckets` stripes and is
    /// still crowded. Must be called without any lock of this map held.
    fn resize(&self, seen_buckets: usize) {
        let mut buckets = self.buckets.write();
        if buckets.len() != seen_buckets || !self.should_resize(seen_buckets) {
            return;
        }

        let new_len = seen_buckets * 2;
        let mut rehashed: Vec<Bucket<K, V>> = (0..new_len).map(|_| Vec::new()).collect();
        // locking each old stripe waits out readers still holding an ElemRef
        for bucket in buckets.iter() {
            for (key, slot) in std::mem::take(&mut *bucket.write()) {
                let idx = self.bucket_index(&key, new_len);
                rehashed[idx].push((key, slot));
            }
        }
        *buckets = rehashed
            .into_iter()
            .map(|bucket| Arc::new(RwLock::new(bucket)))
            .collect();
        debug!(from = seen_buckets, to = new_len, "striped map resized");
    }
}

impl<K, V, S> FromIterator<(K, V)> for StripedHashMap<K, V, S>
where
    K: Hash + PartialEq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let entries: Vec<(K, V)> = iter.into_iter().collect();
        let mut num_buckets = DEFAULT_NUM_BUCKETS;
        while entries.len() > num_buckets * DEFAULT_MAX_AVG_BUCKET_SIZE {
            num_buckets *= 2;
        }

        let map = StripedHashMap::build(num_buckets, 0, S::default());
        {
            let buckets = map.buckets.read();
            for (key, value) in entries {
                let mut bucket = buckets[map.bucket_index(&key, num_buckets)].write();
                let slot = Versioned {
                    value,
                    revision: Revision::ZERO,
                };
                match bucket.iter().position(|entry| entry.0 == key) {
                    Some(i) => bucket[i].1 = slot,
                    None => {
                        bucket.push((key, slot));
                        map.num_entries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        map
    }
}

impl<K, V, S> ConcurrentMap for StripedHashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    type Key = K;
    type Val = V;
    type ValueRef<'a> = ElemRef<K, V> where Self: 'a;

    fn get(&self, key: &K) -> Option<ElemRef<K, V>> {
        let buckets = self.buckets.read();
        let searcher = MaybeElemRef {
            guard: buckets[self.bucket_index(key, buckets.len())].read_arc(),
        };
        drop(buckets);
        searcher.find(key)
    }

    fn load(&self, key: &K) -> Option<Versioned<V>> {
        let buckets = self.buckets.read();
        let bucket = buckets[self.bucket_index(key, buckets.len())].read();
        bucket
            .iter()
            .find(|entry| entry.0 == *key)
            .map(|entry| entry.1.clone())
    }

    fn len(&self) -> usize {
        let buckets = self.buckets.read();
        let guards: Vec<_> = buckets.iter().map(|bucket| bucket.read()).collect();
        guards.iter().map(|bucket| bucket.len()).sum()
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
        let buckets = self.buckets.read();
        let seen_buckets = buckets.len();
        let mut bucket = buckets[self.bucket_index(key, seen_buckets)].write();
        let position = bucket.iter().position(|entry| entry.0 == *key);
        match (position, expected) {
            (None, None) => {
                let revision = self.next_revision();
                bucket.push((key.clone(), Versioned { value, revision }));
                self.num_entries.fetch_add(1, Ordering::Relaxed);
                drop(bucket);
                drop(buckets);

                if self.should_resize(seen_buckets) {
                    self.resize(seen_buckets);
                }
                Ok(Swapped {
                    previous: None,
                    revision,
                })
            }
            (Some(i), Some(expected)) if bucket[i].1.revision == expected => {
                let revision = self.next_revision();
                let previous = std::mem::replace(&mut bucket[i].1, Versioned { value, revision });
                Ok(Swapped {
                    previous: Some(previous.value),
                    revision,
                })
            }
            _ => Err(value),
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
        let buckets = self.buckets.read();
        let mut bucket = buckets[self.bucket_index(key, buckets.len())].write();
        match bucket.iter_mut().find(|entry| entry.0 == *key) {
            Some(entry) if entry.1.value == *expected => {
                let revision = self.next_revision();
                let previous = std::mem::replace(&mut entry.1, Versioned { value, revision });
                Ok((previous.value, revision))
            }
            _ => Err(value),
        }
    }

    fn remove(&self, key: &K) -> Option<(V, Revision)> {
        let buckets = self.buckets.read();
        let mut bucket = buckets[self.bucket_index(key, buckets.len())].write();
        let i = bucket.iter().position(|entry| entry.0 == *key)?;
        let revision = self.next_revision();
        let (_, slot) = bucket.swap_remove(i);
        self.num_entries.fetch_sub(1, Ordering::Relaxed);
        Some((slot.value, revision))
    }

    fn clear(&self) -> Revision {
        let buckets = self.buckets.read();
        let mut guards: Vec<_> = buckets.iter().map(|bucket| bucket.write()).collect();
        let revision = self.next_revision();
        for bucket in guards.iter_mut() {
            bucket.clear();
        }
        self.num_entries.store(0, Ordering::Relaxed);
        revision
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        let buckets = self.buckets.read();
        let guards: Vec<_> = buckets.iter().map(|bucket| bucket.read()).collect();
        guards
            .iter()
            .flat_map(|bucket| bucket.iter())
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::map::contract;

    #[test]
    fn test_hashtable() {
        contract::insert_and_get(StripedHashMap::new());
    }

    #[test]
    fn revisions() {
        contract::revisions_increase(StripedHashMap::new());
        contract::swap_if_checks_revision(StripedHashMap::new());
    }

    #[test]
    fn conditional_primitives() {
        contract::replace_and_remove(StripedHashMap::new());
        contract::factories(StripedHashMap::new());
    }

    #[test]
    fn clear_and_snapshot() {
        contract::clear_and_snapshot(StripedHashMap::new());
        // a single stripe degenerates into a coarse-locked map
        contract::clear_and_snapshot(StripedHashMap::with_num_buckets(1));
    }

    #[test]
    fn concurrent_upserts() {
        contract::concurrent_upserts(StripedHashMap::with_num_buckets(4));
    }

    #[test]
    fn clear_is_not_starved_by_readers() {
        contract::clear_under_read_load(StripedHashMap::new());
    }

    #[test]
    fn grows_past_load_threshold() {
        let map = StripedHashMap::with_num_buckets(2);
        for i in 0..1000u32 {
            map.try_insert(&i, i).unwrap();
        }

        // 2 -> 4 -> ... -> 128 once each average passes the threshold
        assert_eq!(map.num_buckets(), 128);
        assert_eq!(map.len(), 1000);
        for i in 0..1000u32 {
            assert_eq!(map.load(&i).map(|slot| slot.value), Some(i));
        }
        // rehashing is not a commit
        assert_eq!(map.revision(), Revision::from(1000));
    }

    #[test]
    fn resize_waits_for_outstanding_refs() {
        let map = StripedHashMap::with_num_buckets(2);
        let threshold = 2 * DEFAULT_MAX_AVG_BUCKET_SIZE as u32;
        for i in 0..threshold {
            map.try_insert(&i, i).unwrap();
        }
        let held_bucket = map.bucket_index(&0, 2);
        let other = (threshold..)
            .find(|key| map.bucket_index(key, 2) != held_bucket)
            .unwrap();
        let inserted = AtomicBool::new(false);

        crossbeam::scope(|s| {
            let held = map.get(&0).unwrap();
            let grower = s.spawn(|_| {
                map.try_insert(&other, other).unwrap();
                inserted.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!inserted.load(Ordering::SeqCst));
            assert_eq!(*held, 0);
            drop(held);
            grower.join().unwrap();
        })
        .unwrap();

        assert_eq!(map.num_buckets(), 4);
        assert_eq!(map.load(&0).unwrap().value, 0);
        assert_eq!(map.load(&other).unwrap().value, other);
    }

    #[test]
    fn stripes_follow_options() {
        let options = MapOptions::new().with_capacity(100).with_shard_amount(8);
        let map = StripedHashMap::<u32, u32>::with_options(options).unwrap();
        assert_eq!(map.num_buckets(), 8);
        assert_eq!(map.len(), 0);
        assert!(StripedHashMap::<u32, u32>::with_options(MapOptions::new().with_shard_amount(6))
            .is_err());
    }

    #[test]
    fn from_iter_keeps_last_duplicate() {
        let map: StripedHashMap<&str, u32> = vec![("a", 1), ("b", 2), ("a", 3)].into_iter().collect();
        assert_eq!(map.len(), 2);
        assert_eq!(*map.get(&"a").unwrap(), 3);
        assert_eq!(map.revision(), Revision::ZERO);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        let map = StripedHashMap::with_num_buckets(8);
        crossbeam::scope(|s| {
            for t in 0..4u32 {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..250u32 {
                        map.try_insert(&(t * 1000 + i), i).unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(map.len(), 1000);
        assert_eq!(map.revision(), Revision::from(1000));
        // resized while the writers were running
        assert!(map.num_buckets() > 8);
        for t in 0..4u32 {
            assert!((0..250u32).all(|i| map.load(&(t * 1000 + i)).is_some()));
        }
    }
}
