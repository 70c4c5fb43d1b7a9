//! Construction parameters shared by the map backends.

use crate::error::{Error, Result};

/// Sizing hints for a concurrent map.
///
/// Both fields are hints only: the backends never refuse an insertion
/// because `capacity` was exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapOptions {
    /// Number of entries to pre-allocate room for.
    pub capacity: usize,
    /// Number of independently locked shards (stripes). `None` lets the
    /// backend pick its default.
    pub shard_amount: Option<usize>,
}

impl MapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_shard_amount(mut self, shard_amount: usize) -> Self {
        self.shard_amount = Some(shard_amount);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.shard_amount {
            Some(n) if n < 2 || !n.is_power_of_two() => Err(Error::InvalidShardAmount(n)),
            _ => Ok(()),
        }
    }

    /// Capacity a single shard should reserve when `shards` shards share
    /// the total.
    pub(crate) fn capacity_per_shard(&self, shards: usize) -> usize {
        if shards == 0 {
            return self.capacity;
        }
        self.capacity.div_ceil(shards)
    }
}
