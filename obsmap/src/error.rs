//! Crate error types.

use thiserror::Error;

use crate::hub::SubscriptionId;

/// Errors surfaced by map construction and subscription management.
///
/// Failed preconditions of the mutating operations (key already present,
/// key absent, comparand mismatch) are not errors; they are reported as
/// `false` or `None` by the operation itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Shard counts must be a power of two greater than one.
    #[error("shard amount must be a power of two greater than one, got {0}")]
    InvalidShardAmount(usize),

    /// The subscription was never registered or was already removed.
    #[error("no subscription with id {0}")]
    UnknownSubscription(SubscriptionId),
}

pub type Result<T> = std::result::Result<T, Error>;
