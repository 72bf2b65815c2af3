//! Query-range middleware for a distributed log-query service.
//!
//! The frontend sits between the HTTP front door and the downstream
//! query backend. An inbound tenant query is decoded into one of four
//! typed shapes, clamped against per-tenant limits, split into
//! cacheable sub-queries, fanned out to the backend under a bounded
//! parallelism, and the sub-responses are merged back into a single
//! limited, directionally-sorted result.
//!
//! # Architecture
//!
//! - [`codec`] translates between HTTP and the typed
//!   [`request::QueryRequest`] / [`response::QueryResponse`] sum types.
//! - [`middleware`] defines the `Handler`/`Middleware` seam and its
//!   right-to-left composition.
//! - [`limits`] clamps time ranges and rejects over-length queries;
//!   [`series_limit`] caps distinct series per request; [`split`]
//!   partitions range queries on split-duration boundaries.
//! - [`roundtrip`] bounds downstream concurrency with a worker pool
//!   over a shared hand-off channel.
//! - [`merge`] reassembles sub-responses, including the ordered
//!   non-overlapping k-way stream merge.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use query_frontend::clock::SystemClock;
//! use query_frontend::codec::Codec;
//! use query_frontend::limits::{LimitsMiddleware, SplitByOverride};
//! use query_frontend::roundtrip::{BoundedRoundTripper, HttpTransport};
//!
//! let clock = Arc::new(SystemClock);
//! let codec = Arc::new(Codec::new(clock.clone()));
//! let frontend = BoundedRoundTripper::new(transport, codec, limits, middlewares, metrics);
//! let response = frontend.round_trip(http_request).await?;
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod limits;
pub mod merge;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod parser;
pub mod request;
pub mod response;
pub mod roundtrip;
pub mod series_limit;
pub mod server;
pub mod split;
pub mod tenant;

pub use error::{Error, Result};
pub use request::QueryRequest;
pub use response::QueryResponse;
