//! Middleware composition over typed query handlers.
//!
//! A [`Handler`] turns a typed request into a typed response; a
//! [`Middleware`] wraps a handler with extra behavior. Composition is
//! right-to-left associative: `merge([m1, m2]).wrap(h)` equals
//! `m1.wrap(m2.wrap(h))`, so the first middleware in the list is the
//! outermost. Wrapping happens once per outer request because some
//! middleware (the series limiter) keeps per-request state.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::request::QueryRequest;
use crate::response::QueryResponse;

/// Ambient state of one outer request: the resolved tenant set, the
/// optional query tags, and the cancellation scope every sub-request
/// observes. Cloning is cheap and shares the scope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    tenants: Vec<String>,
    query_tags: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Build a context from a resolved (sorted, deduplicated,
    /// non-empty) tenant set.
    pub fn new(tenants: Vec<String>, cancel: CancellationToken) -> Self {
        Self {
            tenants,
            query_tags: None,
            cancel,
        }
    }

    pub fn with_query_tags(mut self, tags: Option<String>) -> Self {
        self.query_tags = tags;
        self
    }

    pub fn tenants(&self) -> &[String] {
        &self.tenants
    }

    pub fn query_tags(&self) -> Option<&str> {
        self.query_tags.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An async request handler. Implementations must be shareable across
/// the sub-requests of one outer request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse>;
}

/// Adapter turning a closure into a [`Handler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(RequestContext, QueryRequest) -> BoxFuture<'static, Result<QueryResponse>>
        + Send
        + Sync,
{
    async fn call(&self, ctx: &RequestContext, req: QueryRequest) -> Result<QueryResponse> {
        (self.0)(ctx.clone(), req).await
    }
}

/// Wraps a handler with additional behavior.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Compose middlewares into one, outermost first.
pub fn merge_middlewares(middlewares: Vec<Arc<dyn Middleware>>) -> Arc<dyn Middleware> {
    Arc::new(Merged(middlewares))
}

struct Merged(Vec<Arc<dyn Middleware>>);

impl Middleware for Merged {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        self.0.iter().rev().fold(next, |h, m| m.wrap(h))
    }
}
