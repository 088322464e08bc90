//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::identifier::Identifier;
use super::rate::RateSpec;
use super::strategy::Strategy;
use crate::error::Result;
use crate::store::CounterStore;

/// Snapshot of a limit's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    /// Hits still allowed before the limit is reached, in `[0, amount]`.
    pub remaining: u64,
    /// When the window resets.
    pub reset_time: DateTime<Utc>,
}

/// Decides whether hits against a rate are allowed.
///
/// The limiter itself is stateless: every counter lives in the
/// [`CounterStore`], so a limiter can be cloned freely and shared across
/// tasks. A denied hit still counts against the window.
#[derive(Clone)]
pub struct RateLimiter {
    strategy: Strategy,
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("strategy", &self.strategy)
            .field("store", &self.store.name())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter applying `strategy` to counters in `store`.
    pub fn new(strategy: Strategy, store: Arc<dyn CounterStore>) -> Self {
        Self { strategy, store }
    }

    /// Create a limiter from a strategy name such as `"moving-window"`.
    pub fn from_name(strategy: &str, store: Arc<dyn CounterStore>) -> Result<Self> {
        Ok(Self::new(strategy.parse()?, store))
    }

    /// The strategy this limiter applies.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The backing counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Record one hit and report whether it is within the limit.
    pub async fn hit(&self, rate: &RateSpec, identifier: &Identifier) -> Result<bool> {
        self.hit_cost(rate, identifier, 1).await
    }

    /// Record a hit weighing `cost` slots and report whether it is within the limit.
    pub async fn hit_cost(
        &self,
        rate: &RateSpec,
        identifier: &Identifier,
        cost: u64,
    ) -> Result<bool> {
        let key = identifier.storage_key(rate);
        let cost = to_i64(cost);

        trace!(
            key = %key,
            strategy = %self.strategy,
            cost = cost,
            "Checking rate limit"
        );

        let (allowed, count) = match self.strategy {
            Strategy::FixedWindow | Strategy::FixedWindowElasticExpiry => {
                let elastic = self.strategy == Strategy::FixedWindowElasticExpiry;
                let value = self
                    .store
                    .incr(&key, rate.expiry_seconds(), elastic, cost)
                    .await?;
                (value <= to_i64(rate.amount()), value)
            }
            Strategy::MovingWindow => {
                let window = MovingWindow::at(rate, self.store.now());
                let current = self
                    .store
                    .incr(&window.current_key(&key), window.expiry_seconds(), false, cost)
                    .await?;
                let previous = self.store.get(&window.previous_key(&key)).await?;
                let estimate = window.estimate(previous, current);
                (estimate <= to_i64(rate.amount()), estimate)
            }
        };

        if !allowed {
            debug!(
                key = %key,
                count = count,
                limit = rate.amount(),
                "Rate limit exceeded"
            );
        }

        Ok(allowed)
    }

    /// Whether a single hit would currently be allowed, without recording it.
    pub async fn test(&self, rate: &RateSpec, identifier: &Identifier) -> Result<bool> {
        let count = self.current_count(rate, identifier).await?;
        Ok(count.saturating_add(1) <= to_i64(rate.amount()))
    }

    /// Report the remaining hits and reset time of the limit's window.
    pub async fn get_window_stats(
        &self,
        rate: &RateSpec,
        identifier: &Identifier,
    ) -> Result<WindowStats> {
        let key = identifier.storage_key(rate);

        let (count, reset_time) = match self.strategy {
            Strategy::FixedWindow | Strategy::FixedWindowElasticExpiry => {
                let count = self.store.get(&key).await?;
                let reset_time = self.store.get_expiry(&key).await?;
                (count, reset_time)
            }
            Strategy::MovingWindow => {
                let now = self.store.now();
                let window = MovingWindow::at(rate, now);
                let current = self.store.get(&window.current_key(&key)).await?;
                let previous = self.store.get(&window.previous_key(&key)).await?;
                let reset_time = window.drained_at(previous, current).unwrap_or(now);
                (window.estimate(previous, current), reset_time)
            }
        };

        Ok(WindowStats {
            remaining: remaining(rate.amount(), count),
            reset_time,
        })
    }

    /// Reset the limit, discarding every hit recorded against it.
    pub async fn clear(&self, rate: &RateSpec, identifier: &Identifier) -> Result<()> {
        let key = identifier.storage_key(rate);
        match self.strategy {
            Strategy::FixedWindow | Strategy::FixedWindowElasticExpiry => {
                self.store.clear(&key).await
            }
            Strategy::MovingWindow => {
                let window = MovingWindow::at(rate, self.store.now());
                self.store.clear(&window.current_key(&key)).await?;
                self.store.clear(&window.previous_key(&key)).await
            }
        }
    }

    async fn current_count(&self, rate: &RateSpec, identifier: &Identifier) -> Result<i64> {
        let key = identifier.storage_key(rate);
        match self.strategy {
            Strategy::FixedWindow | Strategy::FixedWindowElasticExpiry => {
                self.store.get(&key).await
            }
            Strategy::MovingWindow => {
                let window = MovingWindow::at(rate, self.store.now());
                let current = self.store.get(&window.current_key(&key)).await?;
                let previous = self.store.get(&window.previous_key(&key)).await?;
                Ok(window.estimate(previous, current))
            }
        }
    }
}

/// Position of "now" within the fixed sub-windows a moving window is built from.
///
/// Hits are counted per fixed window index. The trailing window ending now
/// overlaps the current index fully and the previous index partially; the
/// previous count is weighted by that overlap, assuming its hits were spread
/// evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MovingWindow {
    window_ms: i64,
    index: i64,
    elapsed_ms: i64,
}

impl MovingWindow {
    fn at(rate: &RateSpec, now: DateTime<Utc>) -> Self {
        let window_ms = to_i64(rate.window_seconds()).saturating_mul(1000).max(1);
        let now_ms = now.timestamp_millis();
        Self {
            window_ms,
            index: now_ms.div_euclid(window_ms),
            elapsed_ms: now_ms.rem_euclid(window_ms),
        }
    }

    fn current_key(&self, key: &str) -> String {
        format!("{}/{}", key, self.index)
    }

    fn previous_key(&self, key: &str) -> String {
        format!("{}/{}", key, self.index - 1)
    }

    /// Sub-window counters live long enough to serve as "previous" for the
    /// whole of the following window.
    fn expiry_seconds(&self) -> i64 {
        (self.window_ms / 1000).saturating_mul(2)
    }

    /// Previous count scaled by how much of the previous window still
    /// overlaps the trailing window.
    fn weighted_previous(&self, previous: i64) -> i64 {
        let previous = previous.max(0) as i128;
        let overlap = (self.window_ms - self.elapsed_ms) as i128;
        (previous * overlap / self.window_ms as i128) as i64
    }

    fn estimate(&self, previous: i64, current: i64) -> i64 {
        self.weighted_previous(previous).saturating_add(current)
    }

    /// When the estimate decays to zero if no further hits arrive.
    fn drained_at(&self, previous: i64, current: i64) -> Option<DateTime<Utc>> {
        let windows_ahead = if current > 0 {
            2
        } else if self.weighted_previous(previous) > 0 {
            1
        } else {
            return None;
        };
        let ms = (self.index + windows_ahead).saturating_mul(self.window_ms);
        DateTime::<Utc>::from_timestamp_millis(ms)
    }
}

fn remaining(amount: u64, count: i64) -> u64 {
    let count = u64::try_from(count).unwrap_or(0);
    amount.saturating_sub(count).min(amount)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
