//! Injectable millisecond clock.
//!
//! The keyspace never reads ambient time: every component that needs "now"
//! takes a [`Clock`] at construction. Production code uses the monotonic
//! system clock; TTL tests use a manual clock they advance by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A cheaply cloneable time source reporting milliseconds since an
/// arbitrary fixed epoch (process start for the system clock).
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

#[derive(Debug)]
enum Inner {
    System { epoch: Instant },
    Manual { now_ms: AtomicU64 },
}

impl Clock {
    /// Monotonic system clock. Immune to wall-clock adjustments, so a
    /// stored deadline can never jump backwards.
    pub fn system() -> Clock {
        Clock {
            inner: Arc::new(Inner::System {
                epoch: Instant::now(),
            }),
        }
    }

    /// Manual clock for tests, starting at `start_ms` and only moving when
    /// [`Clock::advance_ms`] is called.
    pub fn manual(start_ms: u64) -> Clock {
        Clock {
            inner: Arc::new(Inner::Manual {
                now_ms: AtomicU64::new(start_ms),
            }),
        }
    }

    /// Current time in milliseconds since the clock's epoch.
    pub fn now_ms(&self) -> u64 {
        match &*self.inner {
            Inner::System { epoch } => epoch.elapsed().as_millis() as u64,
            Inner::Manual { now_ms } => now_ms.load(Ordering::Relaxed),
        }
    }

    /// Moves a manual clock forward by `delta` milliseconds.
    ///
    /// # Panics
    ///
    /// Panics on a system clock - only tests drive time by hand.
    pub fn advance_ms(&self, delta: u64) {
        match &*self.inner {
            Inner::Manual { now_ms } => {
                now_ms.fetch_add(delta, Ordering::Relaxed);
            }
            Inner::System { .. } => panic!("cannot advance a system clock"),
        }
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::system()
    }
}
