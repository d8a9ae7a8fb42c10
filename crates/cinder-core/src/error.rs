//! Engine error types.

use thiserror::Error;

/// Errors from routing a request to a shard.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// The shard task has stopped and can no longer accept requests.
    /// Only happens during shutdown.
    #[error("shard is unavailable")]
    Unavailable,
}
