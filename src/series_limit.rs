//! Per-request series limiter.
//!
//! Wrapping creates fresh limiter state, so the middleware must be
//! wrapped once per outer request; the resulting handler is shared by
//! that request's sub-requests and is thread safe.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::limits::{smallest_positive, Limits};
use crate::metrics::{Metrics, RejectionReason};
use crate::middleware::{Handler, Middleware, RequestContext};
use crate::model::SampleStream;
use crate::request::QueryRequest;
use crate::response::QueryResponse;

/// Middleware enforcing the per-tenant cap on distinct series touched
/// by one outer request.
pub struct SeriesLimiterMiddleware {
    limits: Arc<dyn Limits>,
    metrics: Arc<Metrics>,
}

impl SeriesLimiterMiddleware {
    pub fn new(limits: Arc<dyn Limits>, metrics: Arc<Metrics>) -> Self {
        Self { limits, metrics }
    }
}

impl Middleware for SeriesLimiterMiddleware {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(SeriesLimiter {
            state: RwLock::new(LimiterState {
                hashes: HashSet::new(),
                buf: String::with_capacity(1_024),
            }),
            limits: self.limits.clone(),
            metrics: self.metrics.clone(),
            next,
        })
    }
}

struct LimiterState {
    hashes: HashSet<u64>,
    // scratch buffer reused across fingerprint computations
    buf: String,
}

/// Stateful limiter for one outer request.
struct SeriesLimiter {
    state: RwLock<LimiterState>,
    limits: Arc<dyn Limits>,
    metrics: Arc<Metrics>,
    next: Arc<dyn Handler>,
}

impl SeriesLimiter {
    /// Read-lock fast path.
    ///
    /// The trigger is exclusive: the limit counts as reached once
    /// strictly more than `max_series` distinct series have been
    /// observed, so exactly `max_series + 1` series trip it.
    fn is_limit_reached(&self, max_series: usize) -> bool {
        self.state.read().expect("lock poisoned").hashes.len() > max_series
    }
}

#[async_trait]
impl Handler for SeriesLimiter {
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
        let max_series = smallest_positive(ctx.tenants(), |t| self.limits.max_query_series(t));
        if max_series == 0 {
            return self.next.call(ctx, req).await;
        }

        // no need to fire a sub-request once the limit is reached
        if self.is_limit_reached(max_series) {
            self.metrics.record_rejection(RejectionReason::TooManySeries);
            return Err(Error::too_many_series(max_series));
        }

        let res = self.next.call(ctx, req).await?;

        if let QueryResponse::Metric(metric) = &res {
            let mut state = self.state.write().expect("lock poisoned");
            let LimiterState { hashes, buf } = &mut *state;
            for series in &metric.result {
                hashes.insert(fingerprint(series, buf));
            }
        }

        if self.is_limit_reached(max_series) {
            self.metrics.record_rejection(RejectionReason::TooManySeries);
            return Err(Error::too_many_series(max_series));
        }
        Ok(res)
    }
}

/// Hash a series' full label set, reusing `buf` to avoid a per-call
/// allocation.
fn fingerprint(series: &SampleStream, buf: &mut String) -> u64 {
    buf.clear();
    for (name, value) in &series.labels {
        buf.push_str(name);
        buf.push('\u{1}');
        buf.push_str(value);
        buf.push('\u{2}');
    }
    let mut hasher = DefaultHasher::new();
    buf.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::limits::test_support::FakeLimits;
    use crate::model::{Sample, Statistics};
    use crate::request::LabelNamesQuery;
    use crate::response::{MetricKind, MetricResponse, STATUS_SUCCESS};

    fn test_request() -> QueryRequest {
        QueryRequest::Labels(LabelNamesQuery {
            start: UNIX_EPOCH,
            end: UNIX_EPOCH,
            path: "/loki/api/v1/labels".to_string(),
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(vec!["t".to_string()], CancellationToken::new())
    }

    fn series(app: &str) -> SampleStream {
        SampleStream {
            labels: [("app".to_string(), app.to_string())].into_iter().collect(),
            samples: vec![Sample {
                timestamp_ms: 1_000,
                value: 1.0,
            }],
        }
    }

    fn metric_response(result: Vec<SampleStream>) -> QueryResponse {
        QueryResponse::Metric(MetricResponse {
            status: STATUS_SUCCESS.to_string(),
            kind: MetricKind::Matrix,
            result,
            statistics: Statistics::default(),
            headers: vec![],
        })
    }

    /// Handler returning a scripted metric response per call and
    /// counting invocations.
    struct Scripted {
        responses: std::sync::Mutex<Vec<QueryResponse>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut responses: Vec<QueryResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for Scripted {
        async fn call(&self, _ctx: &RequestContext, _req: QueryRequest) -> Result<QueryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .responses
                .lock()
                .expect("lock poisoned")
                .pop()
                .expect("scripted response available"))
        }
    }

    fn limiter(max_series: usize, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        limiter_with_metrics(max_series, next, Arc::new(Metrics::new()))
    }

    fn limiter_with_metrics(
        max_series: usize,
        next: Arc<dyn Handler>,
        metrics: Arc<Metrics>,
    ) -> Arc<dyn Handler> {
        SeriesLimiterMiddleware::new(
            Arc::new(FakeLimits {
                max_query_series: max_series,
                ..Default::default()
            }),
            metrics,
        )
        .wrap(next)
    }

    #[tokio::test]
    async fn should_pass_responses_under_the_limit() {
        // given
        let next = Scripted::new(vec![metric_response(vec![series("a"), series("b")])]);
        let handler = limiter(2, next.clone());

        // when
        let result = handler.call(&ctx(), test_request()).await;

        // then
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_allow_exactly_max_plus_one_series_before_failing() {
        // given - the trigger is strict greater-than
        let next = Scripted::new(vec![
            metric_response(vec![series("a"), series("b")]),
            metric_response(vec![series("c")]),
        ]);
        let handler = limiter(2, next.clone());

        // when - first call observes 2 series (== max, passes), the
        // second pushes the distinct count to 3
        let first = handler.call(&ctx(), test_request()).await;
        let second = handler.call(&ctx(), test_request()).await;

        // then
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), Error::too_many_series(2));
    }

    #[tokio::test]
    async fn should_skip_dispatch_once_limit_reached() {
        // given
        let next = Scripted::new(vec![
            metric_response(vec![series("a"), series("b"), series("c")]),
            metric_response(vec![]),
        ]);
        let handler = limiter(2, next.clone());

        // when - first call trips the limit, second must not dispatch
        let first = handler.call(&ctx(), test_request()).await;
        let second = handler.call(&ctx(), test_request()).await;

        // then
        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(next.calls(), 1);
    }

    #[tokio::test]
    async fn should_count_distinct_series_only() {
        // given - the same series repeated across sub-responses
        let next = Scripted::new(vec![
            metric_response(vec![series("a")]),
            metric_response(vec![series("a")]),
            metric_response(vec![series("a")]),
        ]);
        let handler = limiter(1, next.clone());

        // when
        for _ in 0..3 {
            handler.call(&ctx(), test_request()).await.unwrap();
        }

        // then
        assert_eq!(next.calls(), 3);
    }

    #[tokio::test]
    async fn should_ignore_non_metric_responses() {
        // given
        let next = Scripted::new(vec![
            QueryResponse::Labels(crate::response::LabelNamesResponse {
                status: STATUS_SUCCESS.to_string(),
                version: crate::response::WireVersion::V1,
                names: vec!["a".to_string()],
                headers: vec![],
            }),
        ]);
        let handler = limiter(1, next.clone());

        // when
        let result = handler.call(&ctx(), test_request()).await;

        // then
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_not_limit_when_max_series_is_zero() {
        // given
        let next = Scripted::new(vec![metric_response(vec![
            series("a"),
            series("b"),
            series("c"),
        ])]);
        let handler = limiter(0, next.clone());

        // when
        let result = handler.call(&ctx(), test_request()).await;

        // then
        assert!(result.is_ok());
    }

    #[test]
    fn should_fingerprint_equal_label_sets_identically() {
        // given
        let mut buf = String::new();
        let a = series("nginx");
        let b = series("nginx");
        let c = series("apache");

        // when/then
        assert_eq!(fingerprint(&a, &mut buf), fingerprint(&b, &mut buf));
        assert_ne!(fingerprint(&a, &mut buf), fingerprint(&c, &mut buf));
    }

    #[tokio::test]
    async fn should_count_rejections_in_metrics() {
        // given
        let metrics = Arc::new(Metrics::new());
        let next = Scripted::new(vec![metric_response(vec![
            series("a"),
            series("b"),
            series("c"),
        ])]);
        let handler = limiter_with_metrics(2, next, metrics.clone());

        // when
        let result = handler.call(&ctx(), test_request()).await;

        // then
        assert!(result.is_err());
        assert_eq!(
            metrics
                .rejected_queries_total
                .get_or_create(&crate::metrics::RejectionLabels {
                    reason: RejectionReason::TooManySeries,
                })
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn should_create_fresh_state_per_wrap() {
        // given - one wrap per outer request
        let mw = SeriesLimiterMiddleware::new(
            Arc::new(FakeLimits {
                max_query_series: 1,
                ..Default::default()
            }),
            Arc::new(Metrics::new()),
        );
        let first_next = Scripted::new(vec![metric_response(vec![series("a"), series("b")])]);
        let second_next = Scripted::new(vec![metric_response(vec![series("c")])]);

        // when - the first request trips its limiter
        let first = mw.wrap(first_next).call(&ctx(), test_request()).await;
        // a fresh wrap starts from an empty set
        let second = mw.wrap(second_next).call(&ctx(), test_request()).await;

        // then
        assert!(first.is_err());
        assert!(second.is_ok());
    }
}
