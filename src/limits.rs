//! Per-tenant query limits and the limits middleware.
//!
//! Limits are read-only process-wide state owned by a collaborator
//! (typically refreshed out of band); the frontend only reads them.
//! Multi-tenant requests combine durations by smallest positive
//! non-zero value and integer limits by smallest positive value, with
//! zero meaning unlimited in both cases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{to_unix_millis, Clock};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, RejectionReason};
use crate::middleware::{Handler, Middleware, RequestContext};
use crate::parser::Parser;
use crate::request::QueryRequest;
use crate::response::{empty_response, QueryResponse};

/// Per-tenant limit knobs consumed by the frontend.
pub trait Limits: Send + Sync {
    /// How far back a query may reach. Zero disables the limit.
    fn max_query_lookback(&self, tenant: &str) -> Duration;
    /// Maximum `end - start` span of a query. Zero disables the limit.
    fn max_query_length(&self, tenant: &str) -> Duration;
    /// Maximum distinct series a single query may touch. Zero
    /// disables the limit.
    fn max_query_series(&self, tenant: &str) -> usize;
    /// Maximum entries a log query may request. Zero disables the
    /// limit.
    fn max_entries_limit_per_query(&self, tenant: &str) -> usize;
    /// Maximum concurrent sub-requests per outer request.
    fn max_query_parallelism(&self, tenant: &str) -> usize;
    /// Interval range queries are split into for caching and fan-out.
    /// Zero disables splitting.
    fn query_split_duration(&self, tenant: &str) -> Duration;
    /// Minimum lookback below which sharding is skipped.
    fn min_sharding_lookback(&self, tenant: &str) -> Duration;
}

/// Smallest positive non-zero duration across tenants; zero when every
/// tenant reports zero (unlimited).
pub fn smallest_positive_nonzero_duration(
    tenants: &[String],
    get: impl Fn(&str) -> Duration,
) -> Duration {
    tenants
        .iter()
        .map(|t| get(t))
        .filter(|d| !d.is_zero())
        .min()
        .unwrap_or(Duration::ZERO)
}

/// Smallest positive integer limit across tenants; zero when every
/// tenant reports zero (unlimited).
pub fn smallest_positive(tenants: &[String], get: impl Fn(&str) -> usize) -> usize {
    tenants.iter().map(|t| get(t)).filter(|v| *v > 0).min().unwrap_or(0)
}

/// Limits wrapper that supplies a default split duration when the
/// per-tenant override reports zero.
pub struct SplitByOverride {
    inner: Arc<dyn Limits>,
    default_split: Duration,
}

impl SplitByOverride {
    pub fn new(inner: Arc<dyn Limits>, default_split: Duration) -> Self {
        Self {
            inner,
            default_split,
        }
    }
}

impl Limits for SplitByOverride {
    fn max_query_lookback(&self, tenant: &str) -> Duration {
        self.inner.max_query_lookback(tenant)
    }

    fn max_query_length(&self, tenant: &str) -> Duration {
        self.inner.max_query_length(tenant)
    }

    fn max_query_series(&self, tenant: &str) -> usize {
        self.inner.max_query_series(tenant)
    }

    fn max_entries_limit_per_query(&self, tenant: &str) -> usize {
        self.inner.max_entries_limit_per_query(tenant)
    }

    fn max_query_parallelism(&self, tenant: &str) -> usize {
        self.inner.max_query_parallelism(tenant)
    }

    fn query_split_duration(&self, tenant: &str) -> Duration {
        let split = self.inner.query_split_duration(tenant);
        if split.is_zero() {
            self.default_split
        } else {
            split
        }
    }

    fn min_sharding_lookback(&self, tenant: &str) -> Duration {
        self.inner.min_sharding_lookback(tenant)
    }
}

/// Derive the cache key for a request under the tenant's split
/// duration.
///
/// The key is a total function of
/// `{tenant, query, step, floor(start/split), split}`; carrying both
/// the interval index and the split duration keeps keys from colliding
/// after an operator changes the split. The split must be strictly
/// positive whenever caching is enabled; enabling caching with a zero
/// split violates that precondition.
pub struct CacheKeyGenerator {
    limits: Arc<dyn Limits>,
}

impl CacheKeyGenerator {
    pub fn new(limits: Arc<dyn Limits>) -> Self {
        Self { limits }
    }

    pub fn cache_key(&self, tenant: &str, req: &QueryRequest) -> String {
        let split_ms = self.limits.query_split_duration(tenant).as_millis() as i64;
        debug_assert!(split_ms > 0, "caching requires a non-zero split duration");
        let current_interval = req.start_ms() / split_ms;
        format!(
            "{}:{}:{}:{}:{}",
            tenant,
            req.query(),
            req.step_ms(),
            current_interval,
            split_ms
        )
    }
}

/// Middleware enforcing the lookback and length limits.
///
/// Requests entirely outside the lookback window short-circuit with an
/// empty response of the matching shape; requests straddling it get
/// their start clamped; requests longer than the maximum length are
/// rejected.
pub struct LimitsMiddleware {
    limits: Arc<dyn Limits>,
    clock: Arc<dyn Clock>,
    parser: Arc<dyn Parser>,
    metrics: Arc<Metrics>,
}

impl LimitsMiddleware {
    pub fn new(
        limits: Arc<dyn Limits>,
        clock: Arc<dyn Clock>,
        parser: Arc<dyn Parser>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            limits,
            clock,
            parser,
            metrics,
        }
    }
}

impl Middleware for LimitsMiddleware {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(LimitsHandler {
            limits: self.limits.clone(),
            clock: self.clock.clone(),
            parser: self.parser.clone(),
            metrics: self.metrics.clone(),
            next,
        })
    }
}

struct LimitsHandler {
    limits: Arc<dyn Limits>,
    clock: Arc<dyn Clock>,
    parser: Arc<dyn Parser>,
    metrics: Arc<Metrics>,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for LimitsHandler {
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
        let tenants = ctx.tenants();
        if tenants.is_empty() {
            return Err(Error::bad_request("no org id"));
        }

        let mut req = req;

        // Clamp the time range based on the max query lookback.
        let max_lookback =
            smallest_positive_nonzero_duration(tenants, |t| self.limits.max_query_lookback(t));
        if !max_lookback.is_zero() {
            let min_start_ms = to_unix_millis(self.clock.now()) - max_lookback.as_millis() as i64;

            if req.end_ms() < min_start_ms {
                // the whole range is before the lookback window
                tracing::debug!(
                    start_ms = req.start_ms(),
                    end_ms = req.end_ms(),
                    ?max_lookback,
                    "skipping query entirely outside the max query lookback"
                );
                return empty_response(&req, self.parser.as_ref());
            }

            if req.start_ms() < min_start_ms {
                tracing::debug!(
                    original_ms = req.start_ms(),
                    updated_ms = min_start_ms,
                    "clamping query start to the max query lookback"
                );
                req = req.with_start_end(min_start_ms, req.end_ms());
            }
        }

        // Enforce the max query length.
        let max_length =
            smallest_positive_nonzero_duration(tenants, |t| self.limits.max_query_length(t));
        if !max_length.is_zero() {
            let query_len_ms = req.end_ms() - req.start_ms();
            if query_len_ms > max_length.as_millis() as i64 {
                self.metrics.record_rejection(RejectionReason::QueryTooLong);
                return Err(Error::bad_request(format!(
                    "the query time range exceeds the limit (query length: {}ms, limit: {}ms)",
                    query_len_ms,
                    max_length.as_millis()
                )));
            }
        }

        self.next.call(ctx, req).await
    }
}
