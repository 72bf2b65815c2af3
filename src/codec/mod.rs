//! HTTP codec for the four query shapes.
//!
//! Inbound requests are dispatched on their URL path suffix; outbound
//! requests always use the canonical `/loki/api/v1/*` paths. Wire
//! timestamps are nanoseconds, the step is float seconds, and the
//! internal representation keeps wall-clock instants (getters expose
//! milliseconds, see [`crate::request`]).

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use url::form_urlencoded;

use crate::clock::{to_unix_nanos, Clock};
use crate::error::{Error, Result};
use crate::middleware::RequestContext;
use crate::model::SeriesIdentifier;
use crate::request::{InstantQuery, LabelNamesQuery, QueryRequest, RangeQuery, SeriesQuery};
use crate::response::{
    LabelNamesResponse, LogStreamResponse, MetricKind, MetricResponse, QueryResponse,
    ResponseHeader, SeriesResponse, WireVersion,
};
use crate::tenant::QUERY_TAGS_HEADER;

mod params;
pub(crate) mod wire;

use params::{default_step_ms, Form};

/// Canonical downstream paths.
pub const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";
pub const INSTANT_QUERY_PATH: &str = "/loki/api/v1/query";
pub const SERIES_PATH: &str = "/loki/api/v1/series";
pub const LABELS_PATH: &str = "/loki/api/v1/labels";

/// Default entry limit when the request does not carry one.
const DEFAULT_LIMIT: u32 = 100;

/// Default range when start is absent: one hour back from end.
const DEFAULT_RANGE: Duration = Duration::from_secs(3_600);

enum Operation {
    QueryRange,
    InstantQuery,
    Series,
    LabelNames,
}

/// The legacy range path is `/api/prom/query`; the instant query only
/// exists under the V1 API, so the bare `/query` suffix is checked
/// after the range forms.
fn operation(path: &str) -> Option<Operation> {
    if path.ends_with("/query_range") || path.ends_with("/prom/query") {
        Some(Operation::QueryRange)
    } else if path.ends_with("/query") {
        Some(Operation::InstantQuery)
    } else if path.ends_with("/series") {
        Some(Operation::Series)
    } else if path.ends_with("/labels") || path.ends_with("/label") {
        Some(Operation::LabelNames)
    } else {
        None
    }
}

/// Translates between HTTP and typed requests/responses.
pub struct Codec {
    clock: Arc<dyn Clock>,
}

impl Codec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Decode an inbound HTTP request into a typed request, dispatching
    /// on the URL path suffix.
    pub fn decode_request(&self, req: &Request<Bytes>) -> Result<QueryRequest> {
        let path = req.uri().path().to_string();
        let form = Form::parse(req.uri().query().unwrap_or(""));

        match operation(&path) {
            Some(Operation::QueryRange) => self.decode_range(&form, path),
            Some(Operation::InstantQuery) => self.decode_instant(&form, path),
            Some(Operation::Series) => self.decode_series(&form, path),
            Some(Operation::LabelNames) => self.decode_labels(&form, path),
            None => Err(Error::bad_request(format!(
                "unknown request path: {}",
                path
            ))),
        }
    }

    fn decode_range(&self, form: &Form, path: String) -> Result<QueryRequest> {
        let query = required(form, "query")?;
        let end = form
            .nanos_time("end")?
            .unwrap_or_else(|| self.clock.now());
        let start = form.nanos_time("start")?.unwrap_or(end - DEFAULT_RANGE);
        if start > end {
            return Err(Error::bad_request(
                "end timestamp must not be before start time",
            ));
        }
        let step_ms = match form.seconds_millis("step")? {
            Some(step) => step,
            None => default_step_ms(start, end),
        };

        Ok(QueryRequest::Range(RangeQuery {
            query,
            start,
            end,
            step_ms,
            limit: form.limit("limit")?.unwrap_or(DEFAULT_LIMIT),
            direction: form.direction("direction")?.unwrap_or_default(),
            shards: Arc::from(form.all("shards")),
            path,
        }))
    }

    fn decode_instant(&self, form: &Form, path: String) -> Result<QueryRequest> {
        Ok(QueryRequest::Instant(InstantQuery {
            query: required(form, "query")?,
            time: form
                .nanos_time("time")?
                .unwrap_or_else(|| self.clock.now()),
            limit: form.limit("limit")?.unwrap_or(DEFAULT_LIMIT),
            direction: form.direction("direction")?.unwrap_or_default(),
            shards: Arc::from(form.all("shards")),
            path,
        }))
    }

    fn decode_series(&self, form: &Form, path: String) -> Result<QueryRequest> {
        let mut matchers = form.all("match[]");
        matchers.extend(form.all("match"));
        if matchers.is_empty() {
            return Err(Error::bad_request("at least one matcher is required"));
        }
        let end = form
            .nanos_time("end")?
            .unwrap_or_else(|| self.clock.now());
        let start = form.nanos_time("start")?.unwrap_or(end - DEFAULT_RANGE);
        if start > end {
            return Err(Error::bad_request(
                "end timestamp must not be before start time",
            ));
        }

        Ok(QueryRequest::Series(SeriesQuery {
            matchers: Arc::from(matchers),
            start,
            end,
            shards: Arc::from(form.all("shards")),
            path,
        }))
    }

    fn decode_labels(&self, form: &Form, path: String) -> Result<QueryRequest> {
        let end = form
            .nanos_time("end")?
            .unwrap_or_else(|| self.clock.now());
        let start = form.nanos_time("start")?.unwrap_or(end - DEFAULT_RANGE);
        if start > end {
            return Err(Error::bad_request(
                "end timestamp must not be before start time",
            ));
        }

        Ok(QueryRequest::Labels(LabelNamesQuery { start, end, path }))
    }

    /// Encode a typed request as a downstream GET request on its
    /// canonical path. The optional query tags from the context are
    /// forwarded as a header; the body is empty.
    pub fn encode_request(
        &self,
        ctx: &RequestContext,
        req: &QueryRequest,
    ) -> Result<Request<Bytes>> {
        let (path, query_string) = match req {
            QueryRequest::Range(r) => {
                let mut form = form_urlencoded::Serializer::new(String::new());
                form.append_pair("direction", r.direction.as_str());
                form.append_pair("end", &to_unix_nanos(r.end).to_string());
                form.append_pair("limit", &r.limit.to_string());
                form.append_pair("query", &r.query);
                for shard in r.shards.iter() {
                    form.append_pair("shards", shard);
                }
                form.append_pair("start", &to_unix_nanos(r.start).to_string());
                if r.step_ms != 0 {
                    form.append_pair("step", &format_step(r.step_ms));
                }
                (QUERY_RANGE_PATH, form.finish())
            }
            QueryRequest::Instant(r) => {
                let mut form = form_urlencoded::Serializer::new(String::new());
                form.append_pair("direction", r.direction.as_str());
                form.append_pair("limit", &r.limit.to_string());
                form.append_pair("query", &r.query);
                for shard in r.shards.iter() {
                    form.append_pair("shards", shard);
                }
                form.append_pair("time", &to_unix_nanos(r.time).to_string());
                (INSTANT_QUERY_PATH, form.finish())
            }
            QueryRequest::Series(r) => {
                let mut form = form_urlencoded::Serializer::new(String::new());
                form.append_pair("end", &to_unix_nanos(r.end).to_string());
                for matcher in r.matchers.iter() {
                    form.append_pair("match[]", matcher);
                }
                for shard in r.shards.iter() {
                    form.append_pair("shards", shard);
                }
                form.append_pair("start", &to_unix_nanos(r.start).to_string());
                (SERIES_PATH, form.finish())
            }
            QueryRequest::Labels(r) => {
                let mut form = form_urlencoded::Serializer::new(String::new());
                form.append_pair("end", &to_unix_nanos(r.end).to_string());
                form.append_pair("start", &to_unix_nanos(r.start).to_string());
                (LABELS_PATH, form.finish())
            }
        };

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(format!("{}?{}", path, query_string));
        if let Some(tags) = ctx.query_tags() {
            builder = builder.header(QUERY_TAGS_HEADER, tags);
        }
        builder
            .body(Bytes::new())
            .map_err(|e| Error::internal(format!("error encoding request: {}", e)))
    }

    /// Decode a downstream HTTP response into the typed response
    /// matching the request's shape. Non-2xx statuses are preserved as
    /// upstream errors.
    pub fn decode_response(
        &self,
        resp: Response<Bytes>,
        req: &QueryRequest,
    ) -> Result<QueryResponse> {
        if !resp.status().is_success() {
            return Err(Error::Upstream {
                status: resp.status().as_u16(),
                body: String::from_utf8_lossy(resp.body()).into_owned(),
            });
        }

        let headers = response_headers(resp.headers());
        match req {
            QueryRequest::Series(r) => {
                let body: wire::SeriesResponse = decode_json(resp.body())?;
                Ok(QueryResponse::Series(SeriesResponse {
                    status: body.status,
                    version: WireVersion::from_path(&r.path),
                    series: body
                        .data
                        .into_iter()
                        .map(|labels| SeriesIdentifier { labels })
                        .collect(),
                    headers,
                }))
            }
            QueryRequest::Labels(r) => {
                let body: wire::LabelsResponse = decode_json(resp.body())?;
                Ok(QueryResponse::Labels(LabelNamesResponse {
                    status: body.status,
                    version: WireVersion::from_path(&r.path),
                    names: body.data,
                    headers,
                }))
            }
            QueryRequest::Range(_) | QueryRequest::Instant(_) => {
                let body: wire::QueryResponse = decode_json(resp.body())?;
                match body.data.result_type.as_str() {
                    wire::RESULT_TYPE_MATRIX => Ok(QueryResponse::Metric(MetricResponse {
                        status: body.status,
                        kind: MetricKind::Matrix,
                        result: wire::matrix_from_wire(decode_result(body.data.result)?),
                        statistics: body.data.stats,
                        headers,
                    })),
                    wire::RESULT_TYPE_VECTOR => Ok(QueryResponse::Metric(MetricResponse {
                        status: body.status,
                        kind: MetricKind::Vector,
                        result: wire::vector_from_wire(decode_result(body.data.result)?),
                        statistics: body.data.stats,
                        headers,
                    })),
                    wire::RESULT_TYPE_STREAMS => Ok(QueryResponse::Streams(LogStreamResponse {
                        status: body.status,
                        direction: req.direction(),
                        limit: req.limit(),
                        version: WireVersion::from_path(req.path()),
                        statistics: body.data.stats,
                        streams: wire::streams_from_wire(decode_result(body.data.result)?),
                        headers,
                    })),
                    other => Err(Error::internal(format!(
                        "unsupported response type, got {:?}",
                        other
                    ))),
                }
            }
        }
    }

    /// Encode a typed response as an HTTP 200 with a JSON body. Log
    /// stream responses select the legacy body for `/api/prom/*`
    /// requests and the V1 body otherwise.
    pub fn encode_response(&self, resp: &QueryResponse) -> Result<Response<Bytes>> {
        let body = match resp {
            QueryResponse::Streams(r) => match r.version {
                WireVersion::Legacy => encode_json(&wire::LegacyQueryResponse {
                    streams: wire::streams_to_legacy(&r.streams),
                    stats: r.statistics,
                })?,
                WireVersion::V1 => encode_json(&wire::QueryResponse {
                    status: r.status.clone(),
                    data: wire::QueryData {
                        result_type: wire::RESULT_TYPE_STREAMS.to_string(),
                        result: encode_result(&wire::streams_to_wire(&r.streams)?)?,
                        stats: r.statistics,
                    },
                })?,
            },
            QueryResponse::Metric(r) => {
                let result = match r.kind {
                    MetricKind::Matrix => encode_result(&wire::matrix_to_wire(&r.result))?,
                    MetricKind::Vector => encode_result(&wire::vector_to_wire(&r.result))?,
                };
                encode_json(&wire::QueryResponse {
                    status: r.status.clone(),
                    data: wire::QueryData {
                        result_type: r.kind.as_str().to_string(),
                        result,
                        stats: r.statistics,
                    },
                })?
            }
            QueryResponse::Series(r) => encode_json(&wire::SeriesResponse {
                status: r.status.clone(),
                data: r.series.iter().map(|s| s.labels.clone()).collect(),
            })?,
            QueryResponse::Labels(r) => match r.version {
                WireVersion::Legacy => encode_json(&wire::LegacyLabelsResponse {
                    values: r.names.clone(),
                })?,
                WireVersion::V1 => encode_json(&wire::LabelsResponse {
                    status: r.status.clone(),
                    data: r.names.clone(),
                })?,
            },
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .map_err(|e| Error::internal(format!("error encoding response: {}", e)))
    }
}

fn required(form: &Form, key: &str) -> Result<String> {
    form.get(key)
        .map(str::to_string)
        .ok_or_else(|| Error::bad_request(format!("{} is required", key)))
}

fn format_step(step_ms: i64) -> String {
    (step_ms as f64 / 1_000.0).to_string()
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::internal(format!("error decoding response: {}", e)))
}

fn decode_result<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::internal(format!("error decoding response: {}", e)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::internal(format!("error encoding response: {}", e)))
}

fn encode_result<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::internal(format!("error encoding response: {}", e)))
}

fn response_headers(headers: &HeaderMap) -> Vec<ResponseHeader> {
    headers
        .keys()
        .map(|name| ResponseHeader {
            name: name.as_str().to_string(),
            values: headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(String::from))
                .collect(),
        })
        .collect()
}
