//! Shard: an independent partition of the keyspace.
//!
//! Each shard runs as its own tokio task, owning a [`Keyspace`] with no
//! internal locking. Requests arrive over a bounded mpsc channel and
//! responses go back on a per-request oneshot; the bounded inbox is the
//! engine's backpressure. A background tick drives active expiration of
//! TTL'd keys when configured.
//!
//! A caller that goes away (connection closed) just drops its reply
//! receiver - the operation still completes, its response is discarded.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::clock::Clock;
use crate::error::ShardError;
use crate::expiry;
use crate::keyspace::{
    ExpirePolicy, IncrError, Keyspace, KeyspaceStats, SetCondition, SetOutcome, TtlResult,
};

/// A single operation against one shard's keyspace.
#[derive(Debug)]
pub enum ShardRequest {
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        expire: ExpirePolicy,
        condition: SetCondition,
        want_previous: bool,
    },
    Del {
        key: Bytes,
    },
    Exists {
        key: Bytes,
    },
    Expire {
        key: Bytes,
        ms: i64,
    },
    Ttl {
        key: Bytes,
    },
    /// Shard-serialized read-modify-write for INCR/DECR/INCRBY/DECRBY.
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    /// Returns the key count for this shard (weak DBSIZE contribution).
    DbSize,
    /// Returns keyspace stats for this shard.
    Stats,
}

/// The shard's response to a request.
#[derive(Debug)]
pub enum ShardResponse {
    /// A value, or `None` for a missing/expired key.
    Value(Option<Bytes>),
    /// Outcome of a SET (applied flag + optional prior value).
    Set(SetOutcome),
    /// Boolean result (DEL, EXISTS, EXPIRE).
    Bool(bool),
    /// New counter value after an INCR-family write.
    Integer(i64),
    /// TTL query result.
    Ttl(TtlResult),
    /// Key count for this shard.
    KeyCount(usize),
    /// Full stats for this shard.
    Stats(KeyspaceStats),
    /// A failed counter operation.
    IncrError(IncrError),
}

/// A request bundled with its reply channel.
#[derive(Debug)]
pub struct ShardMessage {
    pub request: ShardRequest,
    pub reply: oneshot::Sender<ShardResponse>,
}

/// Per-shard configuration.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Numeric identifier, used only for log context.
    pub shard_id: usize,
    /// Active-expiration cycle period. `None` disables the sweep
    /// (ttl.strategy = "lazy").
    pub active_expiry: Option<Duration>,
    /// Time source for all expiration decisions.
    pub clock: Clock,
}

impl Default for ShardConfig {
    fn default() -> ShardConfig {
        ShardConfig {
            shard_id: 0,
            active_expiry: Some(Duration::from_millis(50)),
            clock: Clock::system(),
        }
    }
}

/// A cloneable handle for sending requests to a shard task.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    tx: mpsc::Sender<ShardMessage>,
}

impl ShardHandle {
    /// Sends a request and waits for the response.
    ///
    /// Blocks (asynchronously) when the shard inbox is full - overload
    /// backpressure rather than dropped commands. Returns
    /// `ShardError::Unavailable` if the shard task has stopped.
    pub async fn send(&self, request: ShardRequest) -> Result<ShardResponse, ShardError> {
        let rx = self.dispatch(request).await?;
        rx.await.map_err(|_| ShardError::Unavailable)
    }

    /// Sends a request and returns the reply channel without waiting.
    /// Used by the engine to fan a multi-key command out to its shards
    /// before collecting results in input order.
    pub(crate) async fn dispatch(
        &self,
        request: ShardRequest,
    ) -> Result<oneshot::Receiver<ShardResponse>, ShardError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = ShardMessage {
            request,
            reply: reply_tx,
        };
        self.tx.send(msg).await.map_err(|_| ShardError::Unavailable)?;
        Ok(reply_rx)
    }
}

/// Spawns a shard task and returns the handle for communicating with it.
///
/// `buffer` controls the inbox capacity - higher values absorb burst
/// traffic at the cost of memory and tail latency.
pub fn spawn_shard(buffer: usize, config: ShardConfig) -> ShardHandle {
    let (tx, rx) = mpsc::channel(buffer);
    tokio::spawn(run_shard(rx, config));
    ShardHandle { tx }
}

/// The shard's main loop. Processes messages and runs periodic active
/// expiration until the channel closes.
async fn run_shard(mut rx: mpsc::Receiver<ShardMessage>, config: ShardConfig) {
    let shard_id = config.shard_id;
    let mut keyspace = Keyspace::new(config.clock.clone());

    // the interval only fires when active expiry is enabled; the fallback
    // period is never observed because of the select guard
    let mut expiry_tick =
        tokio::time::interval(config.active_expiry.unwrap_or(Duration::from_secs(3600)));
    expiry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        let response = execute(&mut keyspace, msg.request);
                        // receiver gone = client disconnected; the write
                        // has already happened, so just drop the reply
                        let _ = msg.reply.send(response);
                    }
                    None => break, // all handles dropped, shard shutting down
                }
            }
            _ = expiry_tick.tick(), if config.active_expiry.is_some() => {
                let removed = expiry::run_expiration_cycle(&mut keyspace);
                if removed > 0 {
                    debug!(shard_id, removed, "active expiration cycle");
                }
            }
        }
    }
}

/// Executes a single request against the keyspace.
fn execute(ks: &mut Keyspace, req: ShardRequest) -> ShardResponse {
    match req {
        ShardRequest::Get { key } => ShardResponse::Value(ks.get(&key)),
        ShardRequest::Set {
            key,
            value,
            expire,
            condition,
            want_previous,
        } => ShardResponse::Set(ks.set(key, value, expire, condition, want_previous)),
        ShardRequest::Del { key } => ShardResponse::Bool(ks.del(&key)),
        ShardRequest::Exists { key } => ShardResponse::Bool(ks.exists(&key)),
        ShardRequest::Expire { key, ms } => ShardResponse::Bool(ks.expire_in(&key, ms)),
        ShardRequest::Ttl { key } => ShardResponse::Ttl(ks.ttl(&key)),
        ShardRequest::IncrBy { key, delta } => match ks.incr_by(&key, delta) {
            Ok(n) => ShardResponse::Integer(n),
            Err(e) => ShardResponse::IncrError(e),
        },
        ShardRequest::DbSize => ShardResponse::KeyCount(ks.len()),
        ShardRequest::Stats => ShardResponse::Stats(ks.stats()),
    }
}
