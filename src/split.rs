//! Split-by-interval middleware.
//!
//! Range queries are partitioned on split-duration boundaries into
//! sub-queries whose windows union exactly to the original
//! `[start, end)`: the first sub-query starts at `start`, each
//! subsequent one starts where the previous ended, and the last ends
//! at `end`. Sub-queries run concurrently (the bounded round-tripper
//! supplies the parallelism cap) and are reassembled by the merger.
//! Other shapes, and range queries when splitting is disabled, pass
//! through untouched.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::limits::{smallest_positive_nonzero_duration, Limits};
use crate::merge::merge_responses;
use crate::middleware::{Handler, Middleware, RequestContext};
use crate::model::Direction;
use crate::request::QueryRequest;
use crate::response::QueryResponse;

pub struct SplitByIntervalMiddleware {
    limits: Arc<dyn Limits>,
}

impl SplitByIntervalMiddleware {
    pub fn new(limits: Arc<dyn Limits>) -> Self {
        Self { limits }
    }
}

impl Middleware for SplitByIntervalMiddleware {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(SplitByInterval {
            limits: self.limits.clone(),
            next,
        })
    }
}

struct SplitByInterval {
    limits: Arc<dyn Limits>,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for SplitByInterval {
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
        if !matches!(req, QueryRequest::Range(_)) {
            return self.next.call(ctx, req).await;
        }

        let interval =
            smallest_positive_nonzero_duration(ctx.tenants(), |t| {
                self.limits.query_split_duration(t)
            });
        if interval.is_zero() {
            return self.next.call(ctx, req).await;
        }

        let mut subs = split_by_interval(&req, interval.as_millis() as i64);
        if subs.len() <= 1 {
            return self.next.call(ctx, req).await;
        }
        // backward queries want the newest entries, so the merger must
        // see the newest sub-windows first for its limit cutoff
        if req.direction() == Direction::Backward {
            subs.reverse();
        }

        tracing::debug!(
            subqueries = subs.len(),
            interval_ms = interval.as_millis() as i64,
            "splitting range query"
        );

        let calls = subs.into_iter().map(|sub| self.next.call(ctx, sub));
        let responses = futures::future::try_join_all(calls).await?;
        merge_responses(responses)
    }
}

/// Partition `req` on absolute `interval_ms` boundaries.
///
/// Boundaries are aligned to multiples of the interval so equal
/// sub-windows recur across requests (which is what makes them
/// cacheable); the first and last sub-query are clipped to the
/// original range.
fn split_by_interval(req: &QueryRequest, interval_ms: i64) -> Vec<QueryRequest> {
    let end = req.end_ms();
    let mut start = req.start_ms();
    let mut subs = Vec::new();

    while start < end {
        let boundary = (start / interval_ms + 1) * interval_ms;
        let sub_end = boundary.min(end);
        subs.push(req.with_start_end(start, sub_end));
        start = sub_end;
    }

    if subs.is_empty() {
        // zero-width range, nothing to split
        subs.push(req.clone());
    }
    subs
}
