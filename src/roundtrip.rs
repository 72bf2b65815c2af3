//! The parallelism-bounded round-tripper.
//!
//! One outer HTTP round-trip spawns `MaxQueryParallelism(tenant)`
//! worker tasks over a shared bounded work channel. The composed
//! middleware chain sees a handler that offers work items to that
//! channel and waits on a single-shot reply, so it can emit
//! arbitrarily many logical sub-requests while at most `parallelism`
//! are in flight downstream. Cancelling the outer scope unblocks every
//! worker, and the round-trip joins all of them before returning.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Request, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::limits::{smallest_positive, Limits};
use crate::metrics::Metrics;
use crate::middleware::{Handler, Middleware, RequestContext};
use crate::request::QueryRequest;
use crate::response::QueryResponse;
use crate::tenant::{self, QUERY_TAGS_HEADER};

/// The raw HTTP transport to the downstream query backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// One queued sub-request: its context, the request, and the
/// single-shot reply channel back to the originating caller.
struct Work {
    ctx: RequestContext,
    request: QueryRequest,
    reply: oneshot::Sender<Result<QueryResponse>>,
}

/// Round-tripper enforcing per-tenant parallelism across the composed
/// middlewares.
pub struct BoundedRoundTripper {
    dispatcher: Arc<Dispatcher>,
    codec: Arc<Codec>,
    limits: Arc<dyn Limits>,
    middleware: Arc<dyn Middleware>,
}

impl BoundedRoundTripper {
    pub fn new(
        next: Arc<dyn Transport>,
        codec: Arc<Codec>,
        limits: Arc<dyn Limits>,
        middlewares: Vec<Arc<dyn Middleware>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                next,
                codec: codec.clone(),
                metrics,
            }),
            codec,
            limits,
            middleware: crate::middleware::merge_middlewares(middlewares),
        }
    }

    /// Serve one outer HTTP request under a fresh cancellation scope.
    pub async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        self.round_trip_with_cancel(req, CancellationToken::new())
            .await
    }

    /// Serve one outer HTTP request; cancelling `cancel` aborts every
    /// in-flight sub-request and unblocks the workers.
    pub async fn round_trip_with_cancel(
        &self,
        req: Request<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Response<Bytes>> {
        let tenants = tenant::tenants_from_headers(req.headers())?;
        let query_tags = req
            .headers()
            .get(QUERY_TAGS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let ctx = RequestContext::new(tenants, cancel.clone()).with_query_tags(query_tags);

        let request = self.codec.decode_request(&req)?;

        let parallelism =
            smallest_positive(ctx.tenants(), |t| self.limits.max_query_parallelism(t)).max(1);

        // capacity-1 hand-off channel shared by all workers; an idle
        // worker parks in recv and senders suspend until one takes the
        // item
        let (work_tx, work_rx) = mpsc::channel::<Work>(1);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::with_capacity(parallelism);
        for _ in 0..parallelism {
            workers.push(tokio::spawn(worker_loop(
                self.dispatcher.clone(),
                work_rx.clone(),
                cancel.clone(),
            )));
        }

        let handler: Arc<dyn Handler> = Arc::new(WorkSender { work_tx });
        let result = self.middleware.wrap(handler).call(&ctx, request).await;

        // tear down the scope before surfacing the result: cancel,
        // then wait for every worker to observe it
        cancel.cancel();
        for worker in workers {
            let _ = worker.await;
        }

        self.codec.encode_response(&result?)
    }
}

/// Encode, inject the tenant header, call the downstream transport,
/// decode.
struct Dispatcher {
    next: Arc<dyn Transport>,
    codec: Arc<Codec>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    async fn dispatch_one(
        &self,
        ctx: &RequestContext,
        req: &QueryRequest,
    ) -> Result<QueryResponse> {
        let mut http_req = self.codec.encode_request(ctx, req)?;
        tenant::inject_org_id(http_req.headers_mut(), ctx.tenants())?;
        self.metrics.downstream_subrequests_total.inc();
        let resp = self.next.round_trip(http_req).await?;
        self.codec.decode_response(resp, req)
    }
}

/// Worker states: idle in the channel select, dispatching one work
/// item, or exiting on cancellation / channel close.
async fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    work_rx: Arc<Mutex<mpsc::Receiver<Work>>>,
    cancel: CancellationToken,
) {
    loop {
        let work = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                work = rx.recv() => match work {
                    Some(work) => work,
                    None => return,
                },
                _ = cancel.cancelled() => return,
            }
        };

        let result = tokio::select! {
            result = dispatcher.dispatch_one(&work.ctx, &work.request) => result,
            _ = work.ctx.cancel_token().cancelled() => Err(Error::Cancelled),
        };
        // the caller may have given up; dropping the reply is fine
        let _ = work.reply.send(result);
    }
}

/// Handler adapter the composed middleware bottoms out in: offers a
/// work item to the channel and waits for the reply, bailing out when
/// the context fires.
struct WorkSender {
    work_tx: mpsc::Sender<Work>,
}

#[async_trait]
impl Handler for WorkSender {
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let work = Work {
            ctx: ctx.clone(),
            request: req,
            reply: reply_tx,
        };

        tokio::select! {
            sent = self.work_tx.send(work) => {
                if sent.is_err() {
                    return Err(Error::Cancelled);
                }
            }
            _ = ctx.cancel_token().cancelled() => return Err(Error::Cancelled),
        }

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| Error::Cancelled)?,
            _ = ctx.cancel_token().cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Reqwest-backed transport resolving requests against a base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = self
            .base
            .join(path_and_query)
            .map_err(|e| Error::internal(format!("invalid downstream url: {}", e)))?;

        let mut builder = self.client.get(url);
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                builder = builder.header(name.as_str(), value);
            }
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::internal(format!("downstream request failed: {}", e)))?;

        let status = resp.status().as_u16();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::internal(format!("error reading downstream body: {}", e)))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
            .body(body)
            .map_err(|e| Error::internal(format!("error building downstream response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::{header, Method, StatusCode};
    use futures::FutureExt;

    use super::*;
    use crate::clock::MockClock;
    use crate::limits::test_support::FakeLimits;
    use crate::middleware::HandlerFn;
    use crate::tenant::ORG_ID_HEADER;

    /// Transport that answers every sub-request with an empty labels
    /// body while tracking peak concurrency.
    struct ProbeTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
        delay: Duration,
    }

    impl ProbeTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                delay,
            })
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn total(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ProbeTransport {
        async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
            assert!(req.headers().contains_key(ORG_ID_HEADER));

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Bytes::from_static(br#"{"status":"success","data":[]}"#))
                .map_err(|e| Error::internal(e.to_string()))
        }
    }

    /// Middleware that fans one request out into `n` identical
    /// sub-requests and returns the first response.
    struct FanOut {
        n: usize,
    }

    impl Middleware for FanOut {
        fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
            let n = self.n;
            Arc::new(FanOutHandler { n, next })
        }
    }

    struct FanOutHandler {
        n: usize,
        next: Arc<dyn Handler>,
    }

    #[async_trait]
    impl Handler for FanOutHandler {
        async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
            let calls = (0..self.n).map(|_| self.next.call(ctx, req.clone()));
            let mut responses = futures::future::try_join_all(calls).await?;
            Ok(responses.pop().expect("at least one response"))
        }
    }

    fn round_tripper(
        transport: Arc<dyn Transport>,
        parallelism: usize,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> BoundedRoundTripper {
        let codec = Arc::new(Codec::new(Arc::new(MockClock::with_time(
            std::time::UNIX_EPOCH + Duration::from_secs(1_000),
        ))));
        BoundedRoundTripper::new(
            transport,
            codec,
            Arc::new(FakeLimits {
                max_query_parallelism: parallelism,
                ..Default::default()
            }),
            middlewares,
            Arc::new(Metrics::new()),
        )
    }

    fn labels_request() -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri("/loki/api/v1/labels?start=0&end=1000000000")
            .header(ORG_ID_HEADER, "tenant")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_cap_concurrent_subrequests_at_parallelism() {
        // given - parallelism 2, middleware emits 10 sub-requests
        let transport = ProbeTransport::new(Duration::from_millis(20));
        let rt = round_tripper(
            transport.clone(),
            2,
            vec![Arc::new(FanOut { n: 10 })],
        );

        // when
        let resp = rt.round_trip(labels_request()).await.unwrap();

        // then - all ten completed, never more than two at once
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.total(), 10);
        assert!(transport.peak() <= 2, "peak was {}", transport.peak());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_complete_when_subrequests_exceed_worker_count() {
        // given - a single worker drains everything
        let transport = ProbeTransport::new(Duration::from_millis(1));
        let rt = round_tripper(transport.clone(), 1, vec![Arc::new(FanOut { n: 5 })]);

        // when
        rt.round_trip(labels_request()).await.unwrap();

        // then
        assert_eq!(transport.total(), 5);
        assert_eq!(transport.peak(), 1);
    }

    #[tokio::test]
    async fn should_fail_without_tenant_header() {
        // given
        let transport = ProbeTransport::new(Duration::ZERO);
        let rt = round_tripper(transport, 2, vec![]);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/loki/api/v1/labels?start=0&end=1000000000")
            .body(Bytes::new())
            .unwrap();

        // when
        let result = rt.round_trip(req).await;

        // then
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_unblock_workers_on_outer_cancellation() {
        // given - a transport that never answers
        struct StuckTransport;

        #[async_trait]
        impl Transport for StuckTransport {
            async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Bytes>> {
                std::future::pending().await
            }
        }

        let rt = round_tripper(Arc::new(StuckTransport), 2, vec![]);
        let cancel = CancellationToken::new();

        // when - cancel shortly after dispatch
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            rt.round_trip_with_cancel(labels_request(), cancel),
        )
        .await
        .expect("round trip must terminate after cancellation");

        // then
        assert_eq!(result.unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn should_surface_first_error_from_middleware() {
        // given - a middleware that always fails
        struct Failing;

        impl Middleware for Failing {
            fn wrap(&self, _next: Arc<dyn Handler>) -> Arc<dyn Handler> {
                Arc::new(HandlerFn(|_ctx, _req| {
                    async { Err(Error::bad_request("rejected")) }.boxed()
                }))
            }
        }

        let transport = ProbeTransport::new(Duration::ZERO);
        let rt = round_tripper(transport.clone(), 2, vec![Arc::new(Failing)]);

        // when
        let result = rt.round_trip(labels_request()).await;

        // then - no downstream call was made
        assert!(matches!(result, Err(Error::BadRequest(_))));
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn should_round_trip_without_middlewares() {
        // given
        let transport = ProbeTransport::new(Duration::ZERO);
        let rt = round_tripper(transport.clone(), 3, vec![]);

        // when
        let resp = rt.round_trip(labels_request()).await.unwrap();

        // then
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.total(), 1);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "success");
    }
}
