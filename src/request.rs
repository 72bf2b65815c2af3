//! Typed query requests.
//!
//! One request value exists per inbound HTTP request and flows through
//! the middleware chain. Requests are never mutated in place: every
//! `with_*` mutator returns a fresh value, so concurrently running
//! sub-requests cannot alias parent state. Shards and matchers are
//! shared structurally (`Arc<[String]>`) since they are read-only.
//!
//! Timestamps are held as wall-clock instants with nanosecond
//! resolution; the getters expose milliseconds, which is the unit the
//! middleware (and the cache key) operates in.

use std::sync::Arc;
use std::time::SystemTime;

use crate::clock::{from_unix_millis, to_unix_millis};
use crate::model::Direction;

/// A range query over `[start, end]` with a step, limit and direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub query: String,
    pub start: SystemTime,
    pub end: SystemTime,
    pub step_ms: i64,
    pub limit: u32,
    pub direction: Direction,
    pub shards: Arc<[String]>,
    pub path: String,
}

/// An instant query evaluated at a single point in time. Step is zero
/// by contract.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantQuery {
    pub query: String,
    pub time: SystemTime,
    pub limit: u32,
    pub direction: Direction,
    pub shards: Arc<[String]>,
    pub path: String,
}

/// A series query carrying label matchers instead of a query string.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub matchers: Arc<[String]>,
    pub start: SystemTime,
    pub end: SystemTime,
    pub shards: Arc<[String]>,
    pub path: String,
}

/// A label-names query over a time range.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelNamesQuery {
    pub start: SystemTime,
    pub end: SystemTime,
    pub path: String,
}

/// The four query shapes accepted by the frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRequest {
    Range(RangeQuery),
    Instant(InstantQuery),
    Series(SeriesQuery),
    Labels(LabelNamesQuery),
}

impl QueryRequest {
    /// Start of the queried range in milliseconds since the epoch.
    /// For instant queries this is the evaluation time.
    pub fn start_ms(&self) -> i64 {
        match self {
            QueryRequest::Range(r) => to_unix_millis(r.start),
            QueryRequest::Instant(r) => to_unix_millis(r.time),
            QueryRequest::Series(r) => to_unix_millis(r.start),
            QueryRequest::Labels(r) => to_unix_millis(r.start),
        }
    }

    /// End of the queried range in milliseconds since the epoch.
    /// For instant queries this is the evaluation time.
    pub fn end_ms(&self) -> i64 {
        match self {
            QueryRequest::Range(r) => to_unix_millis(r.end),
            QueryRequest::Instant(r) => to_unix_millis(r.time),
            QueryRequest::Series(r) => to_unix_millis(r.end),
            QueryRequest::Labels(r) => to_unix_millis(r.end),
        }
    }

    /// Query step in milliseconds. Zero for everything but range
    /// queries.
    pub fn step_ms(&self) -> i64 {
        match self {
            QueryRequest::Range(r) => r.step_ms,
            _ => 0,
        }
    }

    /// The query string. Series and label-names queries carry none.
    pub fn query(&self) -> &str {
        match self {
            QueryRequest::Range(r) => &r.query,
            QueryRequest::Instant(r) => &r.query,
            QueryRequest::Series(_) | QueryRequest::Labels(_) => "",
        }
    }

    /// The inbound URL path, which selects the wire version on encode.
    pub fn path(&self) -> &str {
        match self {
            QueryRequest::Range(r) => &r.path,
            QueryRequest::Instant(r) => &r.path,
            QueryRequest::Series(r) => &r.path,
            QueryRequest::Labels(r) => &r.path,
        }
    }

    /// Entry limit for log queries; zero for shapes without one.
    pub fn limit(&self) -> u32 {
        match self {
            QueryRequest::Range(r) => r.limit,
            QueryRequest::Instant(r) => r.limit,
            _ => 0,
        }
    }

    /// Sort direction for log queries; backward for shapes without one.
    pub fn direction(&self) -> Direction {
        match self {
            QueryRequest::Range(r) => r.direction,
            QueryRequest::Instant(r) => r.direction,
            _ => Direction::default(),
        }
    }

    /// Shard tokens forwarded to the downstream, if any.
    pub fn shards(&self) -> &[String] {
        match self {
            QueryRequest::Range(r) => &r.shards,
            QueryRequest::Instant(r) => &r.shards,
            QueryRequest::Series(r) => &r.shards,
            QueryRequest::Labels(_) => &[],
        }
    }

    /// A copy of this request with the time range replaced
    /// (milliseconds since the epoch). Instant queries move their
    /// evaluation time to `start_ms`.
    pub fn with_start_end(&self, start_ms: i64, end_ms: i64) -> Self {
        match self {
            QueryRequest::Range(r) => QueryRequest::Range(RangeQuery {
                start: from_unix_millis(start_ms),
                end: from_unix_millis(end_ms),
                ..r.clone()
            }),
            QueryRequest::Instant(r) => QueryRequest::Instant(InstantQuery {
                time: from_unix_millis(start_ms),
                ..r.clone()
            }),
            QueryRequest::Series(r) => QueryRequest::Series(SeriesQuery {
                start: from_unix_millis(start_ms),
                end: from_unix_millis(end_ms),
                ..r.clone()
            }),
            QueryRequest::Labels(r) => QueryRequest::Labels(LabelNamesQuery {
                start: from_unix_millis(start_ms),
                end: from_unix_millis(end_ms),
                ..r.clone()
            }),
        }
    }

    /// A copy of this request with the query string replaced. Shapes
    /// without a query string are returned unchanged.
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        match self {
            QueryRequest::Range(r) => QueryRequest::Range(RangeQuery {
                query: query.into(),
                ..r.clone()
            }),
            QueryRequest::Instant(r) => QueryRequest::Instant(InstantQuery {
                query: query.into(),
                ..r.clone()
            }),
            QueryRequest::Series(_) | QueryRequest::Labels(_) => self.clone(),
        }
    }

    /// A copy of this request with the shard tokens replaced. Shapes
    /// without shards are returned unchanged.
    pub fn with_shards(&self, shards: Arc<[String]>) -> Self {
        match self {
            QueryRequest::Range(r) => QueryRequest::Range(RangeQuery {
                shards,
                ..r.clone()
            }),
            QueryRequest::Instant(r) => QueryRequest::Instant(InstantQuery {
                shards,
                ..r.clone()
            }),
            QueryRequest::Series(r) => QueryRequest::Series(SeriesQuery {
                shards,
                ..r.clone()
            }),
            QueryRequest::Labels(_) => self.clone(),
        }
    }
}
