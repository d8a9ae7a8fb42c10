//! The keyspace: one shard's slice of the key-value store.
//!
//! A `Keyspace` owns a flat `AHashMap<Bytes, Entry>` and handles get, set,
//! delete, existence checks, TTL management, and the counter operations.
//! All operations are single-threaded per shard - no internal locking.
//!
//! Expired keys are removed lazily on access: every path that touches a
//! key goes through [`Keyspace::live_entry`] (or `remove_if_expired`), so
//! the "delete on read" rule lives in exactly one place.

use ahash::AHashMap;
use bytes::Bytes;
use rand::seq::IteratorRandom;
use thiserror::Error;

use crate::clock::Clock;

/// Sentinel deadline meaning "no expiry".
pub const NO_EXPIRY: u64 = 0;

/// A stored record: the payload plus expiration and version metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The payload. Counter commands parse and re-format this on demand.
    pub data: Bytes,
    /// Absolute deadline in clock milliseconds. 0 = no expiry.
    pub expires_at_ms: u64,
    /// Monotonically increasing write counter, bumped on every mutating
    /// write to the key. Reserved for optimistic concurrency and
    /// replication deltas; nothing in the core reads it back yet.
    pub version: u64,
}

impl Entry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms != NO_EXPIRY && now_ms >= self.expires_at_ms
    }
}

/// What a write does to the key's expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// Drop any existing expiration (plain SET).
    Clear,
    /// Retain the existing expiration (SET ... KEEPTTL, counter updates).
    Keep,
    /// Expire this many milliseconds from now (SET ... EX/PX).
    RelativeMs(u64),
    /// Expire at this absolute clock deadline.
    AtMs(u64),
}

/// Existence precondition for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    /// Unconditional write.
    #[default]
    Always,
    /// Only write if the key is absent (SET ... NX).
    IfAbsent,
    /// Only write if the key is present (SET ... XX).
    IfPresent,
}

/// Result of a set: whether the write applied, and the prior value when
/// the caller asked for it (SET ... GET).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub applied: bool,
    pub previous: Option<Bytes>,
}

/// Result of a TTL query, following Redis sentinel semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlResult {
    /// Key does not exist (wire value -2).
    NotFound,
    /// Key exists with no expiration (wire value -1).
    NoExpiry,
    /// Remaining whole seconds; a positive sub-second remainder reports 1.
    Seconds(i64),
}

impl TtlResult {
    /// The integer a TTL reply carries on the wire.
    pub fn as_integer(self) -> i64 {
        match self {
            TtlResult::NotFound => -2,
            TtlResult::NoExpiry => -1,
            TtlResult::Seconds(s) => s,
        }
    }
}

/// Errors from the counter operations. Both conditions report the same
/// client-facing message: overflow is an error here, never a silent wrap.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IncrError {
    /// Stored bytes are not a canonical signed 64-bit decimal.
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    /// The add would leave the i64 range.
    #[error("value is not an integer or out of range")]
    Overflow,
}

/// Aggregated per-shard statistics, all tracked incrementally (O(1)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyspaceStats {
    /// Number of keys, including logically-expired but not-yet-swept ones.
    pub key_count: usize,
    /// Number of keys with an expiration set.
    pub keys_with_expiry: usize,
    /// Cumulative count of keys removed by expiration (lazy + active).
    pub keys_expired: u64,
}

/// One shard's key-value map.
pub struct Keyspace {
    entries: AHashMap<Bytes, Entry>,
    clock: Clock,
    next_version: u64,
    expiry_count: usize,
    expired_total: u64,
}

impl Keyspace {
    pub fn new(clock: Clock) -> Keyspace {
        Keyspace {
            entries: AHashMap::new(),
            clock,
            next_version: 0,
            expiry_count: 0,
            expired_total: 0,
        }
    }

    /// Returns the stored bytes, or `None` if the key is missing or
    /// expired. An expired record is removed before returning absence.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        self.live_entry(key).map(|e| e.data.clone())
    }

    /// Like `get` without returning the payload.
    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.live_entry(key).is_some()
    }

    /// Creates or overwrites a record, subject to `condition`.
    ///
    /// The version counter is bumped on every applied write. When
    /// `want_previous` is set, the outcome carries the prior live value
    /// whether or not the write applied (SET ... GET semantics).
    pub fn set(
        &mut self,
        key: Bytes,
        value: Bytes,
        expire: ExpirePolicy,
        condition: SetCondition,
        want_previous: bool,
    ) -> SetOutcome {
        self.remove_if_expired(&key);

        let (exists, old_expires, previous) = match self.entries.get(&key) {
            Some(e) => (true, e.expires_at_ms, want_previous.then(|| e.data.clone())),
            None => (false, NO_EXPIRY, None),
        };

        let blocked = match condition {
            SetCondition::Always => false,
            SetCondition::IfAbsent => exists,
            SetCondition::IfPresent => !exists,
        };
        if blocked {
            return SetOutcome {
                applied: false,
                previous,
            };
        }

        let expires_at_ms = match expire {
            ExpirePolicy::Clear => NO_EXPIRY,
            ExpirePolicy::Keep => old_expires,
            ExpirePolicy::RelativeMs(ms) => self.clock.now_ms().saturating_add(ms),
            ExpirePolicy::AtMs(at) => at,
        };

        self.adjust_expiry_count(old_expires != NO_EXPIRY, expires_at_ms != NO_EXPIRY);
        self.next_version += 1;
        self.entries.insert(
            key,
            Entry {
                data: value,
                expires_at_ms,
                version: self.next_version,
            },
        );
        SetOutcome {
            applied: true,
            previous,
        }
    }

    /// Removes a key. Returns `true` only if a live record was removed -
    /// an expired record counts as absent (and is still removed).
    pub fn del(&mut self, key: &[u8]) -> bool {
        if self.remove_if_expired(key) {
            return false;
        }
        match self.entries.remove(key) {
            Some(entry) => {
                if entry.expires_at_ms != NO_EXPIRY {
                    self.expiry_count = self.expiry_count.saturating_sub(1);
                }
                true
            }
            None => false,
        }
    }

    /// Attaches or replaces an expiration `ms` milliseconds from now.
    /// Returns `false` iff the key is absent.
    ///
    /// A non-positive duration lands the deadline in the past, making the
    /// key logically absent on its next touch or sweep. Does not bump the
    /// version counter.
    pub fn expire_in(&mut self, key: &[u8], ms: i64) -> bool {
        if self.remove_if_expired(key) {
            return false;
        }
        let now = self.clock.now_ms();
        let deadline = if ms > 0 {
            now.saturating_add(ms as u64)
        } else {
            // already past; max(1) keeps clear of the NO_EXPIRY sentinel
            now.saturating_sub(ms.unsigned_abs()).max(1)
        };
        match self.entries.get_mut(key) {
            Some(entry) => {
                if entry.expires_at_ms == NO_EXPIRY {
                    self.expiry_count += 1;
                }
                entry.expires_at_ms = deadline;
                true
            }
            None => false,
        }
    }

    /// TTL in whole seconds with Redis sentinels. A live key's sub-second
    /// remainder rounds up to 1; an expired-but-unswept key is removed and
    /// reports `NotFound`.
    pub fn ttl(&mut self, key: &[u8]) -> TtlResult {
        let now = self.clock.now_ms();
        match self.live_entry(key) {
            None => TtlResult::NotFound,
            Some(e) if e.expires_at_ms == NO_EXPIRY => TtlResult::NoExpiry,
            Some(e) => {
                let secs = ((e.expires_at_ms - now) / 1000) as i64;
                TtlResult::Seconds(if secs == 0 { 1 } else { secs })
            }
        }
    }

    /// Adds `delta` to the key's integer value, creating the key at 0 if
    /// absent. The whole read-modify-write runs under the shard's
    /// serialization, so concurrent increments never lose updates.
    ///
    /// The result is stored as canonical base-10; the existing TTL is
    /// preserved. Overflow is rejected and leaves the value unchanged.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64, IncrError> {
        let current = match self.live_entry(key) {
            Some(e) => std::str::from_utf8(&e.data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(IncrError::NotAnInteger)?,
            None => 0,
        };

        let next = current.checked_add(delta).ok_or(IncrError::Overflow)?;
        self.set(
            Bytes::copy_from_slice(key),
            Bytes::from(next.to_string()),
            ExpirePolicy::Keep,
            SetCondition::Always,
            false,
        );
        Ok(next)
    }

    /// Number of keys, counting logically-expired but not-yet-swept ones.
    /// This is the published DBSIZE contract: a weak total.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> KeyspaceStats {
        KeyspaceStats {
            key_count: self.entries.len(),
            keys_with_expiry: self.expiry_count,
            keys_expired: self.expired_total,
        }
    }

    /// Randomly samples up to `count` keys and removes the expired ones.
    /// Returns how many were removed. Driven by the active expiration
    /// cycle to clean up keys no one is reading.
    pub fn expire_sample(&mut self, count: usize) -> usize {
        if self.entries.is_empty() {
            return 0;
        }

        let mut rng = rand::rng();
        let sampled: Vec<Bytes> = self
            .entries
            .keys()
            .cloned()
            .choose_multiple(&mut rng, count);

        let mut removed = 0;
        for key in &sampled {
            if self.remove_if_expired(key) {
                removed += 1;
            }
        }
        removed
    }

    /// Point-in-time iterator over live entries, in unspecified order.
    /// Runs under the shard's serialization; this is the hook a snapshot
    /// collaborator consumes.
    pub fn iter_live(&self) -> impl Iterator<Item = (&Bytes, &Entry)> {
        let now = self.clock.now_ms();
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_expired(now))
    }

    /// The lazy-expiration primitive all read paths share: drops the
    /// record if its deadline has passed, then returns the live entry.
    fn live_entry(&mut self, key: &[u8]) -> Option<&Entry> {
        if self.remove_if_expired(key) {
            return None;
        }
        self.entries.get(key)
    }

    /// Removes the record if expired, counting one expiration event.
    /// Returns whether a removal happened.
    fn remove_if_expired(&mut self, key: &[u8]) -> bool {
        let now = self.clock.now_ms();
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);

        if expired {
            self.entries.remove(key);
            self.expiry_count = self.expiry_count.saturating_sub(1);
            self.expired_total += 1;
        }
        expired
    }

    fn adjust_expiry_count(&mut self, had_expiry: bool, has_expiry: bool) {
        match (had_expiry, has_expiry) {
            (false, true) => self.expiry_count += 1,
            (true, false) => self.expiry_count = self.expiry_count.saturating_sub(1),
            _ => {}
        }
    }
}
