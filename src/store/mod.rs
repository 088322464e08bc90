//! Counter storage backends.
//!
//! Every rate limiting strategy keeps its state in a [`CounterStore`]. Three
//! backends are provided:
//! - [`MemoryStore`]: process-local, lazily expiring map
//! - [`RedisStore`]: a single networked Redis node
//! - [`ClusterStore`]: counters gossiped across a chitchat mesh

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

mod cluster;
mod memory;
mod redis;

pub use cluster::ClusterStore;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Atomic counters with expiry, keyed by string.
///
/// Implementations must never lose an increment on a single key when called
/// concurrently. Transport failures surface as
/// [`RatekeeperError::StoreUnavailable`](crate::error::RatekeeperError::StoreUnavailable),
/// except from [`check`](CounterStore::check) which reports them as `false`.
#[async_trait]
pub trait CounterStore: Debug + Send + Sync {
    /// Current value of the counter, 0 if absent or expired.
    async fn get(&self, key: &str) -> Result<i64>;

    /// Add `amount` to the counter and return the new value.
    ///
    /// An absent counter is first created at 0 with a TTL of `expiry`
    /// seconds. With `elastic` set the TTL is refreshed on every call,
    /// otherwise it is only set on creation.
    async fn incr(&self, key: &str, expiry: i64, elastic: bool, amount: i64) -> Result<i64>;

    /// When the counter expires; "now" if the counter is absent.
    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>>;

    /// Remove the counter unconditionally.
    async fn clear(&self, key: &str) -> Result<()>;

    /// Liveness check. Never fails; an unreachable backend reports `false`.
    async fn check(&self) -> bool;

    /// The time this store measures expiry against.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Short backend name for logging.
    fn name(&self) -> &'static str;
}

/// How often stores without a dedicated sweeper drop expired counters.
pub(crate) const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Hands out the right to purge expired counters at most once per interval
/// of store time, so cleanup can piggyback on increments.
#[derive(Debug)]
pub(crate) struct PurgeSchedule {
    interval_ms: i64,
    next_ms: AtomicI64,
}

impl PurgeSchedule {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            next_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Whether the caller should purge now. Only one caller wins per interval.
    pub(crate) fn claim(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let due = self.next_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        self.next_ms
            .compare_exchange(
                due,
                now_ms.saturating_add(self.interval_ms),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
