//! Typed query responses.

use crate::error::{Error, Result};
use crate::model::{Direction, SampleStream, SeriesIdentifier, Statistics, Stream};
use crate::parser::Parser;
use crate::request::QueryRequest;

/// Response status reported on the happy path.
pub const STATUS_SUCCESS: &str = "success";

/// Which JSON body format a response renders as.
///
/// The legacy format is selected by inbound requests on the old
/// `/api/prom/*` paths and preserved through decode, merge and encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireVersion {
    Legacy,
    #[default]
    V1,
}

impl WireVersion {
    /// Version implied by the inbound request path.
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/api/prom") {
            WireVersion::Legacy
        } else {
            WireVersion::V1
        }
    }
}

/// The result shape of a metric response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Matrix,
    Vector,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Matrix => "matrix",
            MetricKind::Vector => "vector",
        }
    }
}

/// An HTTP response header captured from the downstream, name
/// preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub name: String,
    pub values: Vec<String>,
}

/// Log lines grouped into streams, ordered per `direction`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogStreamResponse {
    pub status: String,
    pub direction: Direction,
    pub limit: u32,
    pub version: WireVersion,
    pub statistics: Statistics,
    pub streams: Vec<Stream>,
    pub headers: Vec<ResponseHeader>,
}

impl LogStreamResponse {
    /// Total number of entries across all streams.
    pub fn count(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }
}

/// A prometheus-shaped metric payload (matrix or vector) plus merged
/// statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResponse {
    pub status: String,
    pub kind: MetricKind,
    pub result: Vec<SampleStream>,
    pub statistics: Statistics,
    pub headers: Vec<ResponseHeader>,
}

/// Distinct series identities for a series query.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesResponse {
    pub status: String,
    pub version: WireVersion,
    pub series: Vec<SeriesIdentifier>,
    pub headers: Vec<ResponseHeader>,
}

/// Distinct label names for a label-names query.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelNamesResponse {
    pub status: String,
    pub version: WireVersion,
    pub names: Vec<String>,
    pub headers: Vec<ResponseHeader>,
}

/// The four response shapes, matching the request shapes on the happy
/// path.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Streams(LogStreamResponse),
    Metric(MetricResponse),
    Series(SeriesResponse),
    Labels(LabelNamesResponse),
}

/// Build the empty response matching the request's shape.
///
/// Used by the limits middleware to short-circuit requests whose whole
/// range falls outside the lookback window. Range queries consult the
/// parser: sample expressions get an empty matrix, log expressions an
/// empty stream response. An unparsable range query is a bad request.
pub fn empty_response(req: &QueryRequest, parser: &dyn Parser) -> Result<QueryResponse> {
    match req {
        QueryRequest::Series(r) => Ok(QueryResponse::Series(SeriesResponse {
            status: STATUS_SUCCESS.to_string(),
            version: WireVersion::from_path(&r.path),
            series: vec![],
            headers: vec![],
        })),
        QueryRequest::Labels(r) => Ok(QueryResponse::Labels(LabelNamesResponse {
            status: STATUS_SUCCESS.to_string(),
            version: WireVersion::from_path(&r.path),
            names: vec![],
            headers: vec![],
        })),
        // instant queries in the frontend are always metric queries
        QueryRequest::Instant(_) => Ok(QueryResponse::Metric(MetricResponse {
            status: STATUS_SUCCESS.to_string(),
            kind: MetricKind::Vector,
            result: vec![],
            statistics: Statistics::default(),
            headers: vec![],
        })),
        QueryRequest::Range(r) => {
            // a range query can produce either metrics or logs
            let expr = parser
                .parse(&r.query)
                .map_err(|e| Error::bad_request(e.to_string()))?;
            if expr.is_sample() {
                Ok(QueryResponse::Metric(MetricResponse {
                    status: STATUS_SUCCESS.to_string(),
                    kind: MetricKind::Matrix,
                    result: vec![],
                    statistics: Statistics::default(),
                    headers: vec![],
                }))
            } else {
                Ok(QueryResponse::Streams(LogStreamResponse {
                    status: STATUS_SUCCESS.to_string(),
                    direction: r.direction,
                    limit: r.limit,
                    version: WireVersion::from_path(&r.path),
                    statistics: Statistics::default(),
                    streams: vec![],
                    headers: vec![],
                }))
            }
        }
    }
}
