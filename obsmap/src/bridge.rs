//! Forwarding of property changes raised by the stored values themselves.
//!
//! A map built with [`ObservableMap::with_value_bridge`] subscribes to each
//! value at the moment it becomes current for its key and re-publishes
//! whatever that value raises on the map's property channel. When the
//! value stops being current (replaced, removed, cleared) the subscription
//! is dropped again.
//!
//! [`ObservableMap::with_value_bridge`]: crate::ObservableMap::with_value_bridge

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::event::PropertyChanged;
use crate::hub::{PropertyHandler, Subscribers, SubscriptionId};
use crate::map::Revision;

/// A value that can report changes to its own properties.
///
/// Implementors that are only sometimes observable (an enum with a plain
/// variant, say) return `None` from `subscribe_property_changed` for the
/// plain case; the bridge then leaves that value alone.
pub trait ObservableValue {
    fn subscribe_property_changed(&self, handler: PropertyHandler) -> Option<SubscriptionId>;

    /// Unknown or already removed ids are ignored.
    fn unsubscribe_property_changed(&self, id: SubscriptionId);
}

impl<T: ObservableValue + ?Sized> ObservableValue for Arc<T> {
    fn subscribe_property_changed(&self, handler: PropertyHandler) -> Option<SubscriptionId> {
        (**self).subscribe_property_changed(handler)
    }

    fn unsubscribe_property_changed(&self, id: SubscriptionId) {
        (**self).unsubscribe_property_changed(id)
    }
}

/// Ready-made property channel for types that want to implement
/// [`ObservableValue`] by delegation.
pub struct PropertyNotifier {
    sender: u64,
    subscribers: Subscribers<PropertyChanged>,
}

impl PropertyNotifier {
    /// `sender` is stamped on every event this notifier raises.
    pub fn new(sender: u64) -> Self {
        PropertyNotifier {
            sender,
            subscribers: Subscribers::new(),
        }
    }

    pub fn sender(&self) -> u64 {
        self.sender
    }

    pub fn notify(&self, property: impl Into<Arc<str>>) {
        let event = PropertyChanged::new(self.sender, property);
        self.subscribers.publish(&event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl fmt::Debug for PropertyNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyNotifier")
            .field("sender", &self.sender)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ObservableValue for PropertyNotifier {
    fn subscribe_property_changed(&self, handler: PropertyHandler) -> Option<SubscriptionId> {
        Some(self.subscribers.subscribe(handler))
    }

    fn unsubscribe_property_changed(&self, id: SubscriptionId) {
        if self.subscribers.unsubscribe(id).is_err() {
            trace!(%id, sender = self.sender, "property subscription already gone");
        }
    }
}

fn attach_value<V: ObservableValue>(value: &V, handler: PropertyHandler) -> Option<SubscriptionId> {
    value.subscribe_property_changed(handler)
}

fn detach_value<V: ObservableValue>(value: &V, id: SubscriptionId) {
    value.unsubscribe_property_changed(id)
}

/// What the bridge knows about one key: the revision of the last commit
/// it has seen for it and the subscription on the value that commit
/// made current. Removals leave a link without a subscription behind so
/// a late, older attach for the same key can be recognised.
struct Link<V> {
    revision: Revision,
    attached: Option<(V, SubscriptionId)>,
}

struct Links<K, V> {
    /// Revision of the last clear; anything older is gone.
    floor: Revision,
    by_key: HashMap<K, Link<V>>,
}

/// Keeps exactly the current value of every key subscribed.
///
/// Commits reach the bridge after the map has released the entry, so two
/// racing commits on one key can arrive in either order. Every link
/// remembers its revision and an older commit arriving late never wins.
/// Values' own subscribe and unsubscribe calls are made outside the
/// bridge's lock.
pub(crate) struct ValueChangeBridge<K, V> {
    attach: fn(&V, PropertyHandler) -> Option<SubscriptionId>,
    detach: fn(&V, SubscriptionId),
    forwarder: PropertyHandler,
    links: Mutex<Links<K, V>>,
}

impl<K, V> ValueChangeBridge<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new(forwarder: PropertyHandler) -> Self
    where
        V: ObservableValue,
    {
        ValueChangeBridge {
            attach: attach_value::<V>,
            detach: detach_value::<V>,
            forwarder,
            links: Mutex::new(Links {
                floor: Revision::ZERO,
                by_key: HashMap::new(),
            }),
        }
    }

    /// `value` became current for `key` at `revision`.
    pub(crate) fn value_committed(&self, key: &K, value: &V, revision: Revision) {
        let subscription = (self.attach)(value, Arc::clone(&self.forwarder));
        let fresh = subscription.map(|id| (value.clone(), id));

        let outgoing = {
            let mut links = self.links.lock();
            let superseded = revision < links.floor
                || links
                    .by_key
                    .get(key)
                    .map_or(false, |link| link.revision > revision);
            if superseded {
                trace!(%revision, "value was replaced before it could be linked");
                fresh
            } else {
                let link = Link {
                    revision,
                    attached: fresh,
                };
                links.by_key.insert(key.clone(), link).and_then(|old| old.attached)
            }
        };

        if let Some((value, id)) = outgoing {
            (self.detach)(&value, id);
        }
    }

    /// `key` was removed at `revision`.
    pub(crate) fn value_removed(&self, key: &K, revision: Revision) {
        let outgoing = {
            let mut guard = self.links.lock();
            let links = &mut *guard;
            if revision < links.floor {
                return;
            }
            match links.by_key.get_mut(key) {
                Some(link) if link.revision > revision => None,
                Some(link) => {
                    link.revision = revision;
                    link.attached.take()
                }
                None => {
                    let tombstone = Link {
                        revision,
                        attached: None,
                    };
                    links.by_key.insert(key.clone(), tombstone);
                    None
                }
            }
        };

        if let Some((value, id)) = outgoing {
            (self.detach)(&value, id);
        }
    }

    /// The whole map was cleared at `revision`.
    pub(crate) fn map_cleared(&self, revision: Revision) {
        let mut outgoing = Vec::new();
        {
            let mut guard = self.links.lock();
            let links = &mut *guard;
            if revision < links.floor {
                return;
            }
            links.floor = revision;
            let previous = std::mem::take(&mut links.by_key);
            for (key, link) in previous {
                if link.revision > revision {
                    links.by_key.insert(key, link);
                } else if let Some(attached) = link.attached {
                    outgoing.push(attached);
                }
            }
        }

        trace!(%revision, detached = outgoing.len(), "bridge reset");
        for (value, id) in outgoing {
            (self.detach)(&value, id);
        }
    }

    /// Number of values currently subscribed to.
    pub(crate) fn attached_count(&self) -> usize {
        self.links
            .lock()
            .by_key
            .values()
            .filter(|link| link.attached.is_some())
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hub::NotificationHub;

    /// A stored value with an observable property channel.
    #[derive(Debug)]
    pub(crate) struct Item {
        pub(crate) id: u64,
        pub(crate) notifier: PropertyNotifier,
    }

    impl Item {
        pub(crate) fn shared(id: u64) -> Arc<Item> {
            Arc::new(Item {
                id,
                notifier: PropertyNotifier::new(id),
            })
        }
    }

    impl PartialEq for Item {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }

    impl ObservableValue for Item {
        fn subscribe_property_changed(&self, handler: PropertyHandler) -> Option<SubscriptionId> {
            self.notifier.subscribe_property_changed(handler)
        }

        fn unsubscribe_property_changed(&self, id: SubscriptionId) {
            self.notifier.unsubscribe_property_changed(id)
        }
    }

    fn bridge() -> (NotificationHub<u32, Arc<Item>>, ValueChangeBridge<u32, Arc<Item>>) {
        let hub = NotificationHub::new();
        let bridge = ValueChangeBridge::new(hub.property_forwarder());
        (hub, bridge)
    }

    #[test]
    fn notifier_delivers_to_subscribers() {
        let notifier = PropertyNotifier::new(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = notifier
            .subscribe_property_changed(Arc::new(move |event: &PropertyChanged| {
                sink.lock().push(event.clone())
            }))
            .unwrap();

        notifier.notify("name");
        notifier.unsubscribe_property_changed(id);
        notifier.notify("age");
        // unknown ids are ignored
        notifier.unsubscribe_property_changed(id);

        assert_eq!(*seen.lock(), vec![PropertyChanged::new(3, "name")]);
    }

    #[test]
    fn replacing_moves_the_subscription() {
        let (_hub, bridge) = bridge();
        let first = Item::shared(1);
        let second = Item::shared(2);

        bridge.value_committed(&0, &first, Revision::from(1));
        assert_eq!(first.notifier.subscriber_count(), 1);

        bridge.value_committed(&0, &second, Revision::from(2));
        assert_eq!(first.notifier.subscriber_count(), 0);
        assert_eq!(second.notifier.subscriber_count(), 1);
        assert_eq!(bridge.attached_count(), 1);
    }

    #[test]
    fn late_older_commit_is_undone() {
        let (_hub, bridge) = bridge();
        let older = Item::shared(1);
        let newer = Item::shared(2);

        bridge.value_committed(&0, &newer, Revision::from(5));
        bridge.value_committed(&0, &older, Revision::from(3));

        assert_eq!(older.notifier.subscriber_count(), 0);
        assert_eq!(newer.notifier.subscriber_count(), 1);
    }

    #[test]
    fn removal_blocks_older_attach() {
        let (_hub, bridge) = bridge();
        let item = Item::shared(1);

        bridge.value_removed(&0, Revision::from(4));
        bridge.value_committed(&0, &item, Revision::from(3));
        assert_eq!(item.notifier.subscriber_count(), 0);

        // an older removal does not touch a newer value
        bridge.value_committed(&0, &item, Revision::from(6));
        bridge.value_removed(&0, Revision::from(5));
        assert_eq!(item.notifier.subscriber_count(), 1);

        bridge.value_removed(&0, Revision::from(7));
        assert_eq!(item.notifier.subscriber_count(), 0);
    }

    #[test]
    fn clear_detaches_everything_older() {
        let (_hub, bridge) = bridge();
        let items: Vec<_> = (0..4).map(Item::shared).collect();
        for (i, item) in items.iter().enumerate() {
            bridge.value_committed(&(i as u32), item, Revision::from(i as u64 + 1));
        }

        bridge.map_cleared(Revision::from(3));
        let counts: Vec<_> = items.iter().map(|i| i.notifier.subscriber_count()).collect();
        assert_eq!(counts, vec![0, 0, 0, 1]);

        let late = Item::shared(9);
        bridge.value_committed(&9, &late, Revision::from(2));
        assert_eq!(late.notifier.subscriber_count(), 0);
    }

    #[test]
    fn forwarded_events_reach_the_hub_unchanged() {
        let (hub, bridge) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.subscribe_property_changed(move |event| sink.lock().push(event.clone()));

        let item = Item::shared(42);
        bridge.value_committed(&0, &item, Revision::from(1));
        item.notifier.notify("title");

        assert_eq!(*seen.lock(), vec![PropertyChanged::new(42, "title")]);
    }
}
