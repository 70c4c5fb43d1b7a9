//! A concurrent hash map that tells observers about every committed change.
//!
//! [`ObservableMap`] wraps a [`ConcurrentMap`] backend and publishes a
//! [`ChangeEvent`] for each successful mutation: `Add`, `Remove`,
//! `Replace` or `Reset`. Events are delivered synchronously on the
//! mutating thread, after the commit and before the call returns, to every
//! subscriber in registration order.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use obsmap::{ChangeKind, ObservableConcurrentMap};
//!
//! let map = ObservableConcurrentMap::<&str, i32>::new();
//! let kinds = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&kinds);
//! map.subscribe_changed(move |event| sink.lock().unwrap().push(event.kind()));
//!
//! assert!(map.try_add("x", 1));
//! assert!(map.try_update(&"x", 2, &1));
//! assert!(!map.try_update(&"x", 3, &1));
//! assert_eq!(map.try_remove(&"x"), Some(2));
//! map.clear();
//!
//! assert_eq!(
//!     *kinds.lock().unwrap(),
//!     vec![ChangeKind::Add, ChangeKind::Replace, ChangeKind::Remove, ChangeKind::Reset]
//! );
//! ```
//!
//! Stored values that implement [`ObservableValue`] can have their own
//! property changes forwarded through the map, see
//! [`ObservableMap::with_value_bridge`].

pub mod bridge;
pub mod error;
pub mod event;
pub mod hub;
pub mod map;
pub mod options;

mod observable;

pub use bridge::{ObservableValue, PropertyNotifier};
pub use error::{Error, Result};
pub use event::{Change, ChangeEvent, ChangeKind, PropertyChanged};
pub use hub::{NotificationHub, PropertyHandler, SubscriptionId};
pub use map::{ConcurrentMap, Revision, ShardedMap, StripedHashMap};
pub use observable::{ObservableConcurrentMap, ObservableMap};
pub use options::MapOptions;
