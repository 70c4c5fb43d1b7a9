//! Change notifications published by an observable map.

use std::fmt;
use std::sync::Arc;

use crate::map::Revision;

/// What happened to the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Remove,
    Replace,
    Reset,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
            ChangeKind::Replace => "replace",
            ChangeKind::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Payload of a [`ChangeEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change<K, V> {
    Add {
        key: K,
        value: V,
    },
    Remove {
        key: K,
        value: V,
    },
    /// `previous` is only filled in by the compare-based update, where
    /// the caller named the value it expected to displace.
    Replace {
        key: K,
        value: V,
        previous: Option<V>,
    },
    Reset,
}

/// One committed mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent<K, V> {
    revision: Revision,
    change: Change<K, V>,
}

impl<K, V> ChangeEvent<K, V> {
    pub fn new(revision: Revision, change: Change<K, V>) -> Self {
        ChangeEvent { revision, change }
    }

    /// Revision stamped when the mutation committed. Events of one map
    /// compare in commit order by revision, even if racing threads
    /// delivered them in a different order.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn kind(&self) -> ChangeKind {
        match self.change {
            Change::Add { .. } => ChangeKind::Add,
            Change::Remove { .. } => ChangeKind::Remove,
            Change::Replace { .. } => ChangeKind::Replace,
            Change::Reset => ChangeKind::Reset,
        }
    }

    pub fn change(&self) -> &Change<K, V> {
        &self.change
    }

    pub fn into_change(self) -> Change<K, V> {
        self.change
    }

    pub fn key(&self) -> Option<&K> {
        match &self.change {
            Change::Add { key, .. } | Change::Remove { key, .. } | Change::Replace { key, .. } => {
                Some(key)
            }
            Change::Reset => None,
        }
    }

    /// The value the key maps to after this change.
    pub fn new_value(&self) -> Option<&V> {
        match &self.change {
            Change::Add { value, .. } | Change::Replace { value, .. } => Some(value),
            Change::Remove { .. } | Change::Reset => None,
        }
    }

    /// The value this change took out of the map, when known.
    pub fn old_value(&self) -> Option<&V> {
        match &self.change {
            Change::Remove { value, .. } => Some(value),
            Change::Replace { previous, .. } => previous.as_ref(),
            Change::Add { .. } | Change::Reset => None,
        }
    }
}

/// A property of some stored value changed.
///
/// Created by the value itself and forwarded through the map untouched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PropertyChanged {
    sender: u64,
    property: Arc<str>,
}

impl PropertyChanged {
    pub fn new(sender: u64, property: impl Into<Arc<str>>) -> Self {
        PropertyChanged {
            sender,
            property: property.into(),
        }
    }

    /// Identity of the object that raised the change, chosen by that object.
    pub fn sender(&self) -> u64 {
        self.sender
    }

    pub fn property(&self) -> &str {
        &self.property
    }
}
