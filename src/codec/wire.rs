//! JSON wire bodies for the query endpoints.
//!
//! The downstream backend speaks the V1 format; the frontend decodes
//! V1 only, and encodes either V1 or the legacy body depending on the
//! inbound request path.
//!
//! Log entries travel as `["<ns>", "<line>"]` tuples and metric
//! samples as `[<seconds>, "<value>"]` tuples, so both get handwritten
//! serde impls.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat};
use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::model::{self, format_label_set, parse_label_string, Statistics};

pub(crate) const RESULT_TYPE_STREAMS: &str = "streams";
pub(crate) const RESULT_TYPE_MATRIX: &str = "matrix";
pub(crate) const RESULT_TYPE_VECTOR: &str = "vector";

/// Envelope of a V1 query response.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct QueryResponse {
    pub status: String,
    pub data: QueryData,
}

/// Payload of a V1 query response. The `result` value is dispatched on
/// `resultType` by the codec.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: serde_json::Value,
    #[serde(default)]
    pub stats: Statistics,
}

/// A V1 log stream: label map plus entry tuples.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Stream {
    pub stream: BTreeMap<String, String>,
    pub values: Vec<Entry>,
}

/// A log entry on the wire: `["<timestamp ns>", "<line>"]`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub timestamp_ns: i64,
    pub line: String,
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.timestamp_ns.to_string())?;
        tuple.serialize_element(&self.line)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Entry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (ts, line) = <(String, String)>::deserialize(deserializer)?;
        let timestamp_ns = ts
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid entry timestamp: {:?}", ts)))?;
        Ok(Entry { timestamp_ns, line })
    }
}

/// A matrix series: label map plus sample tuples.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MatrixSeries {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<Sample>,
}

/// A vector element: label map plus a single sample tuple.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VectorSample {
    pub metric: BTreeMap<String, String>,
    pub value: Sample,
}

/// A metric sample on the wire: `[<seconds>, "<value>"]`.
#[derive(Debug, PartialEq)]
pub(crate) struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&(self.timestamp_ms as f64 / 1_000.0))?;
        tuple.serialize_element(&self.value.to_string())?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Sample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (seconds, value) = <(f64, String)>::deserialize(deserializer)?;
        let value = value
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid sample value: {:?}", value)))?;
        Ok(Sample {
            timestamp_ms: (seconds * 1_000.0).round() as i64,
            value,
        })
    }
}

/// Body of a series response.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SeriesResponse {
    pub status: String,
    #[serde(default)]
    pub data: Vec<BTreeMap<String, String>>,
}

/// Body of a label-names response.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LabelsResponse {
    pub status: String,
    #[serde(default)]
    pub data: Vec<String>,
}

/// Legacy log query body (`/api/prom/*`).
#[derive(Debug, Serialize)]
pub(crate) struct LegacyQueryResponse {
    pub streams: Vec<LegacyStream>,
    pub stats: Statistics,
}

#[derive(Debug, Serialize)]
pub(crate) struct LegacyStream {
    pub labels: String,
    pub entries: Vec<LegacyEntry>,
}

/// Legacy entries carry RFC3339 timestamps.
#[derive(Debug, Serialize)]
pub(crate) struct LegacyEntry {
    pub ts: String,
    pub line: String,
}

/// Legacy label-names body.
#[derive(Debug, Serialize)]
pub(crate) struct LegacyLabelsResponse {
    pub values: Vec<String>,
}

/// Convert wire streams into the internal layout, rendering label maps
/// as canonical label strings.
pub(crate) fn streams_from_wire(streams: Vec<Stream>) -> Vec<model::Stream> {
    streams
        .into_iter()
        .map(|s| model::Stream {
            labels: format_label_set(&s.stream),
            entries: s
                .values
                .into_iter()
                .map(|e| model::Entry {
                    timestamp_ns: e.timestamp_ns,
                    line: e.line,
                })
                .collect(),
        })
        .collect()
}

/// Convert internal streams into the V1 wire layout, parsing the
/// canonical label strings back into maps.
pub(crate) fn streams_to_wire(streams: &[model::Stream]) -> Result<Vec<Stream>> {
    streams
        .iter()
        .map(|s| {
            Ok(Stream {
                stream: parse_label_string(&s.labels)?,
                values: s
                    .entries
                    .iter()
                    .map(|e| Entry {
                        timestamp_ns: e.timestamp_ns,
                        line: e.line.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

/// Convert internal streams into the legacy wire layout.
pub(crate) fn streams_to_legacy(streams: &[model::Stream]) -> Vec<LegacyStream> {
    streams
        .iter()
        .map(|s| LegacyStream {
            labels: s.labels.clone(),
            entries: s
                .entries
                .iter()
                .map(|e| LegacyEntry {
                    ts: DateTime::from_timestamp_nanos(e.timestamp_ns)
                        .to_rfc3339_opts(SecondsFormat::Nanos, true),
                    line: e.line.clone(),
                })
                .collect(),
        })
        .collect()
}

pub(crate) fn matrix_from_wire(series: Vec<MatrixSeries>) -> Vec<model::SampleStream> {
    series
        .into_iter()
        .map(|s| model::SampleStream {
            labels: s.metric,
            samples: s
                .values
                .into_iter()
                .map(|v| model::Sample {
                    timestamp_ms: v.timestamp_ms,
                    value: v.value,
                })
                .collect(),
        })
        .collect()
}

pub(crate) fn matrix_to_wire(series: &[model::SampleStream]) -> Vec<MatrixSeries> {
    series
        .iter()
        .map(|s| MatrixSeries {
            metric: s.labels.clone(),
            values: s
                .samples
                .iter()
                .map(|v| Sample {
                    timestamp_ms: v.timestamp_ms,
                    value: v.value,
                })
                .collect(),
        })
        .collect()
}

pub(crate) fn vector_from_wire(samples: Vec<VectorSample>) -> Vec<model::SampleStream> {
    samples
        .into_iter()
        .map(|s| model::SampleStream {
            labels: s.metric,
            samples: vec![model::Sample {
                timestamp_ms: s.value.timestamp_ms,
                value: s.value.value,
            }],
        })
        .collect()
}

/// Vector elements carry exactly one sample; series without samples
/// are skipped.
pub(crate) fn vector_to_wire(series: &[model::SampleStream]) -> Vec<VectorSample> {
    series
        .iter()
        .filter_map(|s| {
            s.samples.first().map(|v| VectorSample {
                metric: s.labels.clone(),
                value: Sample {
                    timestamp_ms: v.timestamp_ms,
                    value: v.value,
                },
            })
        })
        .collect()
}
