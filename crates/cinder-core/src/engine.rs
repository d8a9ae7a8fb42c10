//! The engine: coordinator for the sharded keyspace.
//!
//! Routes single-key operations to the owning shard via an FNV-1a hash of
//! the key bytes. Each shard is an independent tokio task - no locks on
//! the hot path. Multi-key commands fan out to their shards concurrently
//! and collect results in input order; the compound result is a set of
//! independent point observations, not an atomic snapshot.

use std::time::Duration;

use bytes::Bytes;

use crate::clock::Clock;
use crate::error::ShardError;
use crate::shard::{self, ShardConfig, ShardHandle, ShardRequest, ShardResponse};

/// Inbox capacity per shard. Large enough to absorb bursts without
/// letting a flooding pipeline queue unbounded work.
const SHARD_BUFFER: usize = 256;

/// Configuration for the engine, fanned out to each shard.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shards. Fixed at startup; need not be a power of two.
    pub shards: usize,
    /// Active-expiration cycle period; `None` for lazy-only expiry.
    pub active_expiry: Option<Duration>,
    /// Time source shared by all shards.
    pub clock: Clock,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            shards: 8,
            active_expiry: Some(Duration::from_millis(50)),
            clock: Clock::system(),
        }
    }
}

/// The sharded engine. Owns handles to all shard tasks and routes
/// requests by key hash.
///
/// `Clone` is cheap - it clones the `Vec<ShardHandle>` (mpsc senders).
#[derive(Debug, Clone)]
pub struct Engine {
    shards: Vec<ShardHandle>,
}

impl Engine {
    /// Spawns the shard tasks and returns the routing handle.
    ///
    /// Panics if the configured shard count is zero; the config layer
    /// validates that before we get here.
    pub fn new(config: EngineConfig) -> Engine {
        assert!(config.shards > 0, "shard count must be at least 1");

        let shards = (0..config.shards)
            .map(|shard_id| {
                shard::spawn_shard(
                    SHARD_BUFFER,
                    ShardConfig {
                        shard_id,
                        active_expiry: config.active_expiry,
                        clock: config.clock.clone(),
                    },
                )
            })
            .collect();

        Engine { shards }
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Routes a request to the shard that owns `key`.
    pub async fn route(
        &self,
        key: &[u8],
        request: ShardRequest,
    ) -> Result<ShardResponse, ShardError> {
        let idx = shard_index(key, self.shards.len());
        self.shards[idx].send(request).await
    }

    /// Fans one request per key out to the owning shards concurrently and
    /// returns the responses in input order. Used by MGET, MSET, and
    /// multi-key DEL/EXISTS; not atomic across shards.
    pub async fn route_multi<F>(
        &self,
        keys: &[Bytes],
        make_req: F,
    ) -> Result<Vec<ShardResponse>, ShardError>
    where
        F: Fn(Bytes) -> ShardRequest,
    {
        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let idx = shard_index(key, self.shards.len());
            pending.push(self.shards[idx].dispatch(make_req(key.clone())).await?);
        }

        let mut responses = Vec::with_capacity(pending.len());
        for rx in pending {
            responses.push(rx.await.map_err(|_| ShardError::Unavailable)?);
        }
        Ok(responses)
    }

    /// Sends a request to every shard and collects all responses. Used by
    /// DBSIZE, INFO, and the metrics poller. The counts are sampled
    /// without cross-shard synchronization - a weak total by contract.
    pub async fn broadcast<F>(&self, make_req: F) -> Result<Vec<ShardResponse>, ShardError>
    where
        F: Fn() -> ShardRequest,
    {
        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            pending.push(shard.dispatch(make_req()).await?);
        }

        let mut responses = Vec::with_capacity(pending.len());
        for rx in pending {
            responses.push(rx.await.map_err(|_| ShardError::Unavailable)?);
        }
        Ok(responses)
    }
}

/// Pure function: maps a key to a shard index as
/// `fnv1a(key) mod shard_count`.
pub fn shard_index(key: &[u8], shard_count: usize) -> usize {
    (fnv1a(key) as usize) % shard_count
}

/// FNV-1a 32-bit hash over the raw key bytes. Deterministic across
/// processes, so shard assignment survives restarts with the same
/// shard count.
fn fnv1a(key: &[u8]) -> u32 {
    const FNV_BASIS: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;

    let mut hash = FNV_BASIS;
    for &b in key {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{ExpirePolicy, SetCondition};

    #[test]
    fn fnv1a_reference_vectors() {
        // published FNV-1a 32-bit test vectors
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn same_key_same_shard() {
        assert_eq!(shard_index(b"foo", 8), shard_index(b"foo", 8));
    }

    #[test]
    fn keys_spread_across_shards() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let key = format!("key:{i}");
            seen.insert(shard_index(key.as_bytes(), 4));
        }
        assert!(seen.len() > 1, "expected keys to spread across shards");
    }

    #[test]
    fn single_shard_always_zero() {
        assert_eq!(shard_index(b"anything", 1), 0);
        assert_eq!(shard_index(b"", 1), 0);
    }

    fn test_engine(shards: usize) -> Engine {
        Engine::new(EngineConfig {
            shards,
            active_expiry: None,
            clock: Clock::system(),
        })
    }

    fn set_request(key: Bytes, value: &'static [u8]) -> ShardRequest {
        ShardRequest::Set {
            key,
            value: Bytes::from_static(value),
            expire: ExpirePolicy::Clear,
            condition: SetCondition::Always,
            want_previous: false,
        }
    }

    #[tokio::test]
    async fn engine_round_trip() {
        let engine = test_engine(4);

        engine
            .route(b"greeting", set_request(Bytes::from_static(b"greeting"), b"hello"))
            .await
            .unwrap();

        let resp = engine
            .route(
                b"greeting",
                ShardRequest::Get {
                    key: Bytes::from_static(b"greeting"),
                },
            )
            .await
            .unwrap();
        match resp {
            ShardResponse::Value(Some(data)) => assert_eq!(data, Bytes::from_static(b"hello")),
            other => panic!("expected Value(Some), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn route_multi_preserves_input_order() {
        let engine = test_engine(4);

        for key in [&b"a"[..], b"b"] {
            engine
                .route(key, set_request(Bytes::copy_from_slice(key), b"x"))
                .await
                .unwrap();
        }

        let keys = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"missing"),
            Bytes::from_static(b"b"),
        ];
        let responses = engine
            .route_multi(&keys, |key| ShardRequest::Get { key })
            .await
            .unwrap();

        assert_eq!(responses.len(), 3);
        assert!(matches!(&responses[0], ShardResponse::Value(Some(_))));
        assert!(matches!(&responses[1], ShardResponse::Value(None)));
        assert!(matches!(&responses[2], ShardResponse::Value(Some(_))));
    }

    #[tokio::test]
    async fn broadcast_sums_to_dbsize() {
        let engine = test_engine(4);

        for i in 0..20 {
            let key = Bytes::from(format!("key:{i}"));
            engine.route(&key.clone(), set_request(key, b"v")).await.unwrap();
        }

        let responses = engine.broadcast(|| ShardRequest::DbSize).await.unwrap();
        let total: usize = responses
            .iter()
            .map(|r| match r {
                ShardResponse::KeyCount(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 20);
    }

    #[test]
    #[should_panic(expected = "shard count must be at least 1")]
    fn zero_shards_panics() {
        Engine::new(EngineConfig {
            shards: 0,
            active_expiry: None,
            clock: Clock::system(),
        });
    }
}
