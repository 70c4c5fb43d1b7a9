//! Subscriber lists and synchronous fan-out.
//!
//! Every list is copy-on-write: `subscribe` and `unsubscribe` swap in a
//! new slice under a short write lock, and `publish` clones the current
//! slice and drops the lock before it calls anybody. Handlers can
//! therefore subscribe, unsubscribe or mutate the map from inside a
//! notification without deadlocking. Changes to the list made during a
//! dispatch take effect from the next dispatch on.
//!
//! Dispatch runs on the publishing thread, in registration order. If a
//! handler panics, the panic unwinds to the publisher and the handlers
//! after it are skipped for that event.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::{ChangeEvent, PropertyChanged};

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type PropertyHandler = Arc<dyn Fn(&PropertyChanged) + Send + Sync>;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// One channel's subscriber list.
pub(crate) struct Subscribers<E> {
    next_id: AtomicU64,
    list: RwLock<Arc<[(SubscriptionId, Handler<E>)]>>,
}

impl<E> Subscribers<E> {
    pub(crate) fn new() -> Self {
        Subscribers {
            next_id: AtomicU64::new(1),
            list: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub(crate) fn subscribe(&self, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut list = self.list.write();
        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push((id, handler));
        *list = next.into();
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut list = self.list.write();
        if !list.iter().any(|(registered, _)| *registered == id) {
            return Err(Error::UnknownSubscription(id));
        }
        let next: Vec<_> = list
            .iter()
            .filter(|(registered, _)| *registered != id)
            .cloned()
            .collect();
        *list = next.into();
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }

    pub(crate) fn publish(&self, event: &E) {
        let snapshot = Arc::clone(&self.list.read());
        for (_, handler) in snapshot.iter() {
            handler(event);
        }
    }
}

/// Fan-out point for everything an observable map reports.
///
/// Two channels: structural changes of the map, and property changes
/// forwarded from stored values.
pub struct NotificationHub<K, V> {
    changed: Subscribers<ChangeEvent<K, V>>,
    property_changed: Arc<Subscribers<PropertyChanged>>,
}

impl<K, V> Default for NotificationHub<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> NotificationHub<K, V> {
    pub fn new() -> Self {
        NotificationHub {
            changed: Subscribers::new(),
            property_changed: Arc::new(Subscribers::new()),
        }
    }

    pub fn subscribe_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent<K, V>) + Send + Sync + 'static,
    {
        let id = self.changed.subscribe(Arc::new(handler));
        debug!(%id, "change subscriber added");
        id
    }

    pub fn unsubscribe_changed(&self, id: SubscriptionId) -> Result<()> {
        self.changed.unsubscribe(id)?;
        debug!(%id, "change subscriber removed");
        Ok(())
    }

    pub fn subscribe_property_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChanged) + Send + Sync + 'static,
    {
        let id = self.property_changed.subscribe(Arc::new(handler));
        debug!(%id, "property subscriber added");
        id
    }

    pub fn unsubscribe_property_changed(&self, id: SubscriptionId) -> Result<()> {
        self.property_changed.unsubscribe(id)?;
        debug!(%id, "property subscriber removed");
        Ok(())
    }

    pub fn changed_subscriber_count(&self) -> usize {
        self.changed.len()
    }

    pub fn property_subscriber_count(&self) -> usize {
        self.property_changed.len()
    }

    /// Calls every change subscriber with `event`. Only the owning map
    /// publishes, and only for mutations that committed.
    pub(crate) fn publish_change(&self, event: &ChangeEvent<K, V>) {
        trace!(revision = %event.revision(), kind = %event.kind(), "publishing change");
        self.changed.publish(event);
    }

    /// A handler that re-publishes into this hub's property channel. It is
    /// the only way property events enter the hub.
    ///
    /// It only holds a weak reference, so values that keep the handler
    /// do not keep the subscriber list alive; once the hub is gone the
    /// handler does nothing.
    pub(crate) fn property_forwarder(&self) -> PropertyHandler {
        let target: Weak<Subscribers<PropertyChanged>> = Arc::downgrade(&self.property_changed);
        Arc::new(move |event: &PropertyChanged| {
            if let Some(subscribers) = target.upgrade() {
                trace!(sender = event.sender(), property = event.property(), "forwarding property change");
                subscribers.publish(event);
            }
        })
    }
}
