//! The cinder engine: a sharded in-memory keyspace.
//!
//! Keys hash to a fixed set of shards; each shard is an independent tokio
//! task owning its slice of the keyspace with no internal locking. The
//! [`Engine`] routes requests to the owning shard over bounded channels,
//! which both serializes per-key operations and provides natural
//! backpressure under load.
//!
//! Expiration is lazy-plus-active: every touch of a key checks its
//! deadline, and a per-shard sampling task cleans up keys nobody reads.
//! Time comes from an injected [`Clock`] so tests can drive expiration
//! deterministically.

pub mod clock;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod keyspace;
pub mod shard;

pub use clock::Clock;
pub use engine::{shard_index, Engine, EngineConfig};
pub use error::ShardError;
pub use keyspace::{
    ExpirePolicy, IncrError, Keyspace, KeyspaceStats, SetCondition, SetOutcome, TtlResult,
};
pub use shard::{ShardConfig, ShardHandle, ShardRequest, ShardResponse};
