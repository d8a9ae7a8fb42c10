//! Active expiration via random sampling.
//!
//! Instead of maintaining a timing wheel or sorted expiry index, each
//! shard periodically samples random keys and deletes any that have
//! expired. The trade is up to one cycle of staleness for zero index
//! memory and a bounded per-cycle cost regardless of dataset size.

use crate::keyspace::Keyspace;

/// Keys sampled per round.
const SAMPLE_SIZE: usize = 20;

/// If more than this fraction of the sample was expired, go again.
const EXPIRED_THRESHOLD: f64 = 0.25;

/// Maximum rounds per cycle, so a mass expiration can't starve the
/// shard's command loop.
const MAX_ROUNDS: usize = 4;

/// Runs one active expiration cycle on the keyspace.
///
/// Samples up to [`SAMPLE_SIZE`] random keys per round and removes the
/// expired ones. Repeats while more than 25% of the sample was expired,
/// up to [`MAX_ROUNDS`] rounds, to amortize cleanup when many keys expire
/// together. Returns the total number of keys removed.
pub fn run_expiration_cycle(ks: &mut Keyspace) -> usize {
    let mut total_removed = 0;

    for _ in 0..MAX_ROUNDS {
        let removed = ks.expire_sample(SAMPLE_SIZE);
        total_removed += removed;

        if (removed as f64) <= (SAMPLE_SIZE as f64) * EXPIRED_THRESHOLD {
            break;
        }
    }

    total_removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::keyspace::{ExpirePolicy, SetCondition};
    use bytes::Bytes;

    fn set(ks: &mut Keyspace, key: String, expire: ExpirePolicy) {
        ks.set(
            Bytes::from(key),
            Bytes::from_static(b"val"),
            expire,
            SetCondition::Always,
            false,
        );
    }

    #[test]
    fn empty_keyspace_is_fine() {
        let mut ks = Keyspace::new(Clock::manual(0));
        assert_eq!(run_expiration_cycle(&mut ks), 0);
    }

    #[test]
    fn no_expired_keys_removes_nothing() {
        let mut ks = Keyspace::new(Clock::manual(0));
        for i in 0..10 {
            set(&mut ks, format!("key:{i}"), ExpirePolicy::Clear);
        }
        assert_eq!(run_expiration_cycle(&mut ks), 0);
        assert_eq!(ks.len(), 10);
    }

    #[test]
    fn leaves_unexpired_ttl_keys_alone() {
        let mut ks = Keyspace::new(Clock::manual(0));
        for i in 0..10 {
            set(
                &mut ks,
                format!("key:{i}"),
                ExpirePolicy::RelativeMs(3_600_000),
            );
        }
        assert_eq!(run_expiration_cycle(&mut ks), 0);
        assert_eq!(ks.len(), 10);
    }

    #[test]
    fn removes_expired_keys_in_a_small_keyspace() {
        let clock = Clock::manual(1_000);
        let mut ks = Keyspace::new(clock.clone());
        for i in 0..10 {
            set(&mut ks, format!("temp:{i}"), ExpirePolicy::RelativeMs(5));
        }
        for i in 0..5 {
            set(&mut ks, format!("keep:{i}"), ExpirePolicy::Clear);
        }
        clock.advance_ms(5);

        // 15 keys total and a 20-key sample per round: everything is
        // sampled in round one, so all 10 expired keys go
        assert_eq!(run_expiration_cycle(&mut ks), 10);
        assert_eq!(ks.len(), 5);
    }

    #[test]
    fn mass_expiration_converges_over_cycles() {
        let clock = Clock::manual(1_000);
        let mut ks = Keyspace::new(clock.clone());
        for i in 0..500 {
            set(&mut ks, format!("temp:{i}"), ExpirePolicy::RelativeMs(5));
        }
        clock.advance_ms(5);

        // every key is expired, so each cycle runs its full round budget;
        // repeated cycles must eventually drain the keyspace
        let mut cycles = 0;
        while !ks.is_empty() {
            let removed = run_expiration_cycle(&mut ks);
            assert!(removed > 0, "expired keys remain but nothing was removed");
            assert!(removed <= SAMPLE_SIZE * MAX_ROUNDS);
            cycles += 1;
            assert!(cycles < 100, "expiration failed to converge");
        }
    }
}
