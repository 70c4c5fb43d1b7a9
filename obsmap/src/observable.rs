use std::collections::hash_map::RandomState;
use std::convert::Infallible;
use std::fmt;

use tracing::debug;

use crate::bridge::{ObservableValue, ValueChangeBridge};
use crate::error::Result;
use crate::event::{Change, ChangeEvent, PropertyChanged};
use crate::hub::{NotificationHub, SubscriptionId};
use crate::map::{ConcurrentMap, Fetched, Revision, ShardedMap, Upserted};
use crate::options::MapOptions;

/// The default observable map: [`ObservableMap`] over [`ShardedMap`].
pub type ObservableConcurrentMap<K, V, S = RandomState> = ObservableMap<ShardedMap<K, V, S>>;

/// A concurrent map that reports every committed mutation.
///
/// Each mutating operation first commits through the backend's atomic
/// primitive. Only if that commit happened is a [`ChangeEvent`] built,
/// from the values actually stored, and handed to every change
/// subscriber before the operation returns. Operations whose
/// precondition fails return `false` or `None` and publish nothing.
///
/// Subscribers run on the mutating thread with no lock of the map held,
/// so they may call back into the map. A slow subscriber stalls the
/// mutating caller. A panicking subscriber unwinds into the caller after
/// the mutation has already committed, and the subscribers after it miss
/// that event.
pub struct ObservableMap<M: ConcurrentMap> {
    map: M,
    hub: NotificationHub<M::Key, M::Val>,
    bridge: Option<ValueChangeBridge<M::Key, M::Val>>,
}

impl<K, V> Default for ObservableConcurrentMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ObservableConcurrentMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::from_map(ShardedMap::new())
    }

    pub fn with_options(options: MapOptions) -> Result<Self> {
        Ok(Self::from_map(ShardedMap::with_options(options)?))
    }
}

impl<M: ConcurrentMap> ObservableMap<M> {
    /// Wraps an existing backend. Its current contents are not reported.
    pub fn from_map(map: M) -> Self {
        ObservableMap {
            map,
            hub: NotificationHub::new(),
            bridge: None,
        }
    }

    /// Forwards property changes of the stored values to the property
    /// channel of this map.
    ///
    /// Values already in the map are linked right away.
    pub fn with_value_bridge(mut self) -> Self
    where
        M::Val: ObservableValue,
    {
        let bridge = ValueChangeBridge::new(self.hub.property_forwarder());
        let revision = self.map.revision();
        for (key, value) in self.map.snapshot() {
            bridge.value_committed(&key, &value, revision);
        }
        debug!(linked = bridge.attached_count(), "value bridge enabled");
        self.bridge = Some(bridge);
        self
    }

    /// The backend. Mutating it directly bypasses notifications.
    pub fn inner(&self) -> &M {
        &self.map
    }

    /// Subscriber bookkeeping of this map. Events only enter it through
    /// the map's own commits and its value bridge:
    ///
    /// ```compile_fail
    /// use obsmap::{Change, ChangeEvent, ObservableConcurrentMap, Revision};
    ///
    /// let map = ObservableConcurrentMap::<u32, u32>::new();
    /// map.hub().publish_change(&ChangeEvent::new(Revision::ZERO, Change::Reset));
    /// ```
    pub fn hub(&self) -> &NotificationHub<M::Key, M::Val> {
        &self.hub
    }

    /// See [`ConcurrentMap::get`]: the reference holds a lock, do not
    /// mutate the map while keeping it.
    pub fn get(&self, key: &M::Key) -> Option<M::ValueRef<'_>> {
        self.map.get(key)
    }

    pub fn get_cloned(&self, key: &M::Key) -> Option<M::Val> {
        self.map.load(key).map(|slot| slot.value)
    }

    pub fn contains_key(&self, key: &M::Key) -> bool {
        self.map.contains(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(M::Key, M::Val)> {
        self.map.snapshot()
    }

    /// Revision of the latest commit.
    pub fn revision(&self) -> Revision {
        self.map.revision()
    }

    /// Inserts `value` only if `key` is vacant. Publishes `Add` on success.
    pub fn try_add(&self, key: M::Key, value: M::Val) -> bool {
        match self.map.try_insert(&key, value.clone()) {
            Ok(revision) => {
                self.committed(revision, Change::Add { key, value });
                true
            }
            Err(_) => false,
        }
    }

    /// Removes `key`. Publishes `Remove` with the removed value on success.
    pub fn try_remove(&self, key: &M::Key) -> Option<M::Val> {
        let (value, revision) = self.map.remove(key)?;
        self.committed(
            revision,
            Change::Remove {
                key: key.clone(),
                value: value.clone(),
            },
        );
        Some(value)
    }

    /// Replaces the value of `key` with `value` if it currently equals
    /// `expected`. Publishes `Replace` carrying the displaced value.
    pub fn try_update(&self, key: &M::Key, value: M::Val, expected: &M::Val) -> bool
    where
        M::Val: PartialEq,
    {
        match self.map.replace_if_eq(key, value.clone(), expected) {
            Ok((previous, revision)) => {
                let change = Change::Replace {
                    key: key.clone(),
                    value,
                    previous: Some(previous),
                };
                self.committed(revision, change);
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the value of `key`, inserting `value` if there is none.
    pub fn get_or_add(&self, key: M::Key, value: M::Val) -> M::Val {
        self.get_or_add_with(key, |_| value)
    }

    /// Returns the value of `key`, inserting `factory(key)` if there is
    /// none. Publishes `Add` only if this call's value was inserted.
    ///
    /// The factory runs without any lock held. Racing callers may each
    /// run theirs; only one result is kept and reported.
    pub fn get_or_add_with<F>(&self, key: M::Key, factory: F) -> M::Val
    where
        F: FnOnce(&M::Key) -> M::Val,
    {
        into_ok(self.try_get_or_add_with(key, |k| Ok(factory(k))))
    }

    /// Fallible [`get_or_add_with`](Self::get_or_add_with). A factory
    /// error leaves the map untouched and publishes nothing.
    pub fn try_get_or_add_with<E, F>(&self, key: M::Key, factory: F) -> std::result::Result<M::Val, E>
    where
        F: FnOnce(&M::Key) -> std::result::Result<M::Val, E>,
    {
        match self.map.get_or_try_insert_with(&key, factory)? {
            Fetched::Existing(value) => Ok(value),
            Fetched::Inserted { value, revision } => {
                self.committed(
                    revision,
                    Change::Add {
                        key,
                        value: value.clone(),
                    },
                );
                Ok(value)
            }
        }
    }

    /// Inserts `add_value` or replaces the current value with
    /// `update(key, current)`.
    pub fn add_or_update<U>(&self, key: M::Key, add_value: M::Val, update: U) -> M::Val
    where
        U: FnMut(&M::Key, &M::Val) -> M::Val,
    {
        self.add_or_update_with(key, |_| add_value.clone(), update)
    }

    /// Inserts `add(key)` or replaces the current value with
    /// `update(key, current)`, returning the stored value.
    ///
    /// Publishes `Add` when inserting and `Replace` (without a previous
    /// value) when updating. Both factories run without any lock held and
    /// may run more than once if other threads write the key meanwhile.
    pub fn add_or_update_with<A, U>(&self, key: M::Key, mut add: A, mut update: U) -> M::Val
    where
        A: FnMut(&M::Key) -> M::Val,
        U: FnMut(&M::Key, &M::Val) -> M::Val,
    {
        into_ok(self.try_add_or_update_with(
            key,
            |k| Ok(add(k)),
            |k, current| Ok(update(k, current)),
        ))
    }

    /// Fallible [`add_or_update_with`](Self::add_or_update_with). A
    /// factory error leaves the map untouched and publishes nothing.
    pub fn try_add_or_update_with<E, A, U>(
        &self,
        key: M::Key,
        add: A,
        update: U,
    ) -> std::result::Result<M::Val, E>
    where
        A: FnMut(&M::Key) -> std::result::Result<M::Val, E>,
        U: FnMut(&M::Key, &M::Val) -> std::result::Result<M::Val, E>,
    {
        match self.map.try_upsert(&key, add, update)? {
            Upserted::Inserted { value, revision } => {
                self.committed(
                    revision,
                    Change::Add {
                        key,
                        value: value.clone(),
                    },
                );
                Ok(value)
            }
            Upserted::Updated {
                value, revision, ..
            } => {
                let change = Change::Replace {
                    key,
                    value: value.clone(),
                    previous: None,
                };
                self.committed(revision, change);
                Ok(value)
            }
        }
    }

    /// Empties the map. Always publishes `Reset`, even if it was empty.
    pub fn clear(&self) {
        let revision = self.map.clear();
        debug!(%revision, "map cleared");
        self.committed(revision, Change::Reset);
    }

    pub fn subscribe_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent<M::Key, M::Val>) + Send + Sync + 'static,
    {
        self.hub.subscribe_changed(handler)
    }

    pub fn unsubscribe_changed(&self, id: SubscriptionId) -> Result<()> {
        self.hub.unsubscribe_changed(id)
    }

    pub fn subscribe_property_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChanged) + Send + Sync + 'static,
    {
        self.hub.subscribe_property_changed(handler)
    }

    pub fn unsubscribe_property_changed(&self, id: SubscriptionId) -> Result<()> {
        self.hub.unsubscribe_property_changed(id)
    }

    /// Runs after every successful commit, with no map lock held.
    fn committed(&self, revision: Revision, change: Change<M::Key, M::Val>) {
        if let Some(bridge) = &self.bridge {
            match &change {
                Change::Add { key, value } | Change::Replace { key, value, .. } => {
                    bridge.value_committed(key, value, revision)
                }
                Change::Remove { key, .. } => bridge.value_removed(key, revision),
                Change::Reset => bridge.map_cleared(revision),
            }
        }
        self.hub.publish_change(&ChangeEvent::new(revision, change));
    }
}

impl<M> FromIterator<(M::Key, M::Val)> for ObservableMap<M>
where
    M: ConcurrentMap + FromIterator<(M::Key, M::Val)>,
{
    fn from_iter<I: IntoIterator<Item = (M::Key, M::Val)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl<M: ConcurrentMap> fmt::Debug for ObservableMap<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableMap")
            .field("len", &self.len())
            .field("revision", &self.revision())
            .field("change_subscribers", &self.hub.changed_subscriber_count())
            .field("property_subscribers", &self.hub.property_subscriber_count())
            .field("bridged", &self.bridge.is_some())
            .finish()
    }
}

fn into_ok<T>(result: std::result::Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}
