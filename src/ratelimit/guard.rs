//! Guard-then-call composition around a protected operation.
//!
//! A [`Guard`] is configured once (rate, base identifier, methods filter,
//! strategy and store) and then consulted before every call. When the hit is
//! denied the operation is never run and the caller gets the window stats
//! back to build its own "too many requests" answer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::identifier::{build_identifier, Identifier};
use super::limiter::{RateLimiter, WindowStats};
use super::rate::{parse, IntoRateSpec, RateSpec};
use super::strategy::Strategy;
use crate::error::{RatekeeperError, Result};
use crate::registry::{self, StoreRegistry};
use crate::store::CounterStore;

/// Per-call facts a guard needs: the request method and the caller's key.
///
/// The caller resolves its own key (user id, client address, API token...)
/// and passes it as a plain string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext<'a> {
    /// Request method, matched against a guard's methods filter.
    pub method: Option<&'a str>,
    /// Appended to the identifier so each caller gets its own counter.
    pub caller_key: Option<&'a str>,
}

impl<'a> CallContext<'a> {
    /// A context with neither method nor caller key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request method.
    pub fn method(mut self, method: &'a str) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the caller key.
    pub fn caller_key(mut self, key: &'a str) -> Self {
        self.caller_key = Some(key);
        self
    }
}

type RateFn = dyn Fn(&CallContext<'_>) -> Option<String> + Send + Sync;

/// Where a guard gets its rate from.
#[derive(Clone)]
enum RateSource {
    Fixed(RateSpec),
    /// Evaluated on every call; `None` exempts the call.
    Dynamic(Arc<RateFn>),
}

impl fmt::Debug for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSource::Fixed(rate) => f.debug_tuple("Fixed").field(rate).finish(),
            RateSource::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl RateSource {
    fn resolve(&self, ctx: &CallContext<'_>) -> Result<Option<RateSpec>> {
        match self {
            RateSource::Fixed(rate) => Ok(Some(*rate)),
            RateSource::Dynamic(rate_fn) => rate_fn(ctx).map(parse).transpose(),
        }
    }
}

/// Outcome of consulting a guard without running anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The hit was recorded and is within the limit.
    Allowed,
    /// The call is not subject to this guard; nothing was recorded.
    Exempt,
    /// The hit was recorded and exceeds the limit.
    Limited(WindowStats),
}

/// Result of [`Guard::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The operation ran and produced a value.
    Completed(T),
    /// The operation was short-circuited.
    Limited(WindowStats),
}

impl<T> Guarded<T> {
    /// Whether the operation was short-circuited.
    pub fn is_limited(&self) -> bool {
        matches!(self, Guarded::Limited(_))
    }

    /// The operation's output, if it ran.
    pub fn completed(self) -> Option<T> {
        match self {
            Guarded::Completed(value) => Some(value),
            Guarded::Limited(_) => None,
        }
    }
}

/// Builder for [`Guard`].
pub struct GuardBuilder {
    base: Vec<String>,
    rate: Option<Result<RateSource>>,
    methods: Option<Vec<String>>,
    strategy: Option<Strategy>,
    store: Option<Arc<dyn CounterStore>>,
    cache: Option<String>,
}

impl GuardBuilder {
    /// Limit calls to `rate`, e.g. `"5/minute"`.
    pub fn rate<R: IntoRateSpec>(mut self, rate: R) -> Self {
        self.rate = Some(parse(rate).map(RateSource::Fixed));
        self
    }

    /// Choose the rate per call. Returning `None` exempts the call.
    pub fn rate_fn<F>(mut self, rate_fn: F) -> Self
    where
        F: Fn(&CallContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.rate = Some(Ok(RateSource::Dynamic(Arc::new(rate_fn))));
        self
    }

    /// Only limit calls whose method is in `methods`. The methods also become
    /// part of the identifier, so guards with different filters never share
    /// counters.
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Use `strategy` instead of the registry default.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Count hits in `store` instead of a configured cache.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Count hits in the named cache.
    pub fn cache(mut self, cache: impl Into<String>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    /// Build against the process-wide registry.
    pub async fn build(self) -> Result<Guard> {
        self.build_with(registry::global()).await
    }

    /// Build against a specific registry.
    pub async fn build_with(self, registry: &StoreRegistry) -> Result<Guard> {
        let rate = self
            .rate
            .ok_or_else(|| RatekeeperError::Config("a guard needs a rate".to_string()))??;

        let methods = self.methods.filter(|methods| !methods.is_empty());
        let base = build_identifier(&self.base, methods.as_deref(), None)?;

        let store = registry.resolve(self.cache.as_deref(), self.store).await?;
        let strategy = self.strategy.unwrap_or_else(|| registry.default_strategy());

        debug!(
            identifier = %base,
            strategy = %strategy,
            store = store.name(),
            "Built rate limit guard"
        );

        Ok(Guard {
            rate,
            base,
            methods,
            limiter: RateLimiter::new(strategy, store),
        })
    }
}

/// Rate limit applied in front of a protected operation.
#[derive(Debug, Clone)]
pub struct Guard {
    rate: RateSource,
    base: Identifier,
    methods: Option<Vec<String>>,
    limiter: RateLimiter,
}

impl Guard {
    /// Start building a guard for the operation named by `base`,
    /// e.g. `["billing", "create_invoice"]`.
    pub fn builder<I, S>(base: I) -> GuardBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GuardBuilder {
            base: base.into_iter().map(Into::into).collect(),
            rate: None,
            methods: None,
            strategy: None,
            store: None,
            cache: None,
        }
    }

    /// The limiter hits are recorded with.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Whether a call with `method` is subject to this guard.
    pub fn applies_to(&self, method: Option<&str>) -> bool {
        match &self.methods {
            None => true,
            Some(methods) => method.is_some_and(|method| {
                methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            }),
        }
    }

    /// The identifier hits for `caller_key` are counted under.
    pub fn identifier(&self, caller_key: Option<&str>) -> Identifier {
        match caller_key {
            Some(key) => self.base.clone().with(key),
            None => self.base.clone(),
        }
    }

    /// The rate a call is held to, or `None` if it is exempt.
    pub fn rate_for(&self, ctx: &CallContext<'_>) -> Result<Option<RateSpec>> {
        self.rate.resolve(ctx)
    }

    /// Record a hit for `ctx` and report the verdict.
    pub async fn check(&self, ctx: &CallContext<'_>) -> Result<Verdict> {
        let Some(rate) = self.rate_for(ctx)? else {
            return Ok(Verdict::Exempt);
        };
        if !self.applies_to(ctx.method) {
            return Ok(Verdict::Exempt);
        }

        let identifier = self.identifier(ctx.caller_key);
        if self.limiter.hit(&rate, &identifier).await? {
            Ok(Verdict::Allowed)
        } else {
            let stats = self.limiter.get_window_stats(&rate, &identifier).await?;
            Ok(Verdict::Limited(stats))
        }
    }

    /// Run `op` unless the call is rate limited.
    pub async fn call<F, Fut, T>(&self, ctx: &CallContext<'_>, op: F) -> Result<Guarded<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.check(ctx).await? {
            Verdict::Limited(stats) => Ok(Guarded::Limited(stats)),
            Verdict::Allowed | Verdict::Exempt => Ok(Guarded::Completed(op().await)),
        }
    }
}
