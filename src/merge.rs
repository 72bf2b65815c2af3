//! Merging of sub-responses into a single typed response.
//!
//! All inputs must share one response shape; the shape of the first
//! response selects the merge strategy. Metric payloads merge through
//! a prometheus-style group/dedup/sort; series and label names merge
//! by set union preserving first appearance; log streams go through
//! the ordered non-overlapping k-way merge below.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::model::{format_label_set, Direction, Entry, SampleStream, Statistics, Stream};
use crate::response::{
    LabelNamesResponse, LogStreamResponse, MetricKind, MetricResponse, QueryResponse,
    SeriesResponse, STATUS_SUCCESS,
};

fn mixed_shapes() -> Error {
    Error::internal("cannot merge responses of mixed shapes")
}

/// Merge `responses` into one response of the same shape.
///
/// Fails on an empty input and on inputs of differing shapes.
pub fn merge_responses(responses: Vec<QueryResponse>) -> Result<QueryResponse> {
    let Some(first) = responses.first() else {
        return Err(Error::internal(
            "merging responses requires at least one response",
        ));
    };

    match first {
        QueryResponse::Metric(_) => {
            let mut metric = Vec::with_capacity(responses.len());
            for r in responses {
                match r {
                    QueryResponse::Metric(m) => metric.push(m),
                    _ => return Err(mixed_shapes()),
                }
            }
            Ok(QueryResponse::Metric(merge_metric(metric)?))
        }
        QueryResponse::Streams(_) => {
            let mut streams = Vec::with_capacity(responses.len());
            for r in responses {
                match r {
                    QueryResponse::Streams(s) => streams.push(s),
                    _ => return Err(mixed_shapes()),
                }
            }
            Ok(QueryResponse::Streams(merge_streams(streams)))
        }
        QueryResponse::Series(_) => {
            let mut series = Vec::with_capacity(responses.len());
            for r in responses {
                match r {
                    QueryResponse::Series(s) => series.push(s),
                    _ => return Err(mixed_shapes()),
                }
            }
            Ok(QueryResponse::Series(merge_series(series)))
        }
        QueryResponse::Labels(_) => {
            let mut labels = Vec::with_capacity(responses.len());
            for r in responses {
                match r {
                    QueryResponse::Labels(l) => labels.push(l),
                    _ => return Err(mixed_shapes()),
                }
            }
            Ok(QueryResponse::Labels(merge_labels(labels)))
        }
    }
}

/// Prometheus-style metric merge: matrix series with equal label sets
/// are concatenated, then de-duplicated and sorted by timestamp;
/// vector results are concatenated. Series order is first appearance.
fn merge_metric(responses: Vec<MetricResponse>) -> Result<MetricResponse> {
    let kind = responses[0].kind;
    let status = responses[0].status.clone();
    let mut statistics = Statistics::default();

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, SampleStream> = HashMap::new();
    for resp in responses {
        if resp.kind != kind {
            return Err(mixed_shapes());
        }
        statistics.merge(&resp.statistics);
        for series in resp.result {
            let key = format_label_set(&series.labels);
            match grouped.get_mut(&key) {
                Some(existing) => existing.samples.extend(series.samples),
                None => {
                    order.push(key.clone());
                    grouped.insert(key, series);
                }
            }
        }
    }

    let mut result = Vec::with_capacity(order.len());
    for key in order {
        let mut series = grouped.remove(&key).expect("grouped series present");
        if kind == MetricKind::Matrix {
            series.samples.sort_by_key(|s| s.timestamp_ms);
            series.samples.dedup_by_key(|s| s.timestamp_ms);
        }
        result.push(series);
    }

    Ok(MetricResponse {
        status,
        kind,
        result,
        statistics,
        headers: vec![],
    })
}

fn merge_series(responses: Vec<SeriesResponse>) -> SeriesResponse {
    let status = responses[0].status.clone();
    let version = responses[0].version;

    let mut seen = std::collections::HashSet::new();
    let mut series = Vec::new();
    for resp in responses {
        for identifier in resp.series {
            if seen.insert(identifier.canonical()) {
                series.push(identifier);
            }
        }
    }

    SeriesResponse {
        status,
        version,
        series,
        headers: vec![],
    }
}

fn merge_labels(responses: Vec<LabelNamesResponse>) -> LabelNamesResponse {
    let status = responses[0].status.clone();
    let version = responses[0].version;

    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for resp in responses {
        for name in resp.names {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
    }

    LabelNamesResponse {
        status,
        version,
        names,
        headers: vec![],
    }
}

fn merge_streams(responses: Vec<LogStreamResponse>) -> LogStreamResponse {
    let direction = responses[0].direction;
    let limit = responses[0].limit;
    let version = responses[0].version;

    let mut statistics = Statistics::default();
    for resp in &responses {
        statistics.merge(&resp.statistics);
    }

    LogStreamResponse {
        status: STATUS_SUCCESS.to_string(),
        direction,
        limit,
        version,
        statistics,
        streams: merge_ordered_nonoverlapping_streams(responses, limit, direction),
        headers: vec![],
    }
}

/// Merge ordered, pairwise non-overlapping stream responses.
///
/// Entries are grouped by label string into runs, label keys are
/// sorted per direction, and the result is truncated to `limit` total
/// entries. When everything fits under the limit each label's runs
/// are concatenated by a per-label k-way merge; otherwise a priority
/// queue keyed by `(timestamp, label)` pops exactly
/// `min(limit, total)` entries. Runs `O(E log L)` for `E` merged
/// entries over `L` labels.
fn merge_ordered_nonoverlapping_streams(
    responses: Vec<LogStreamResponse>,
    limit: u32,
    direction: Direction,
) -> Vec<Stream> {
    let limit = limit as usize;
    let mut total = 0usize;

    // labels -> list of entry runs
    let mut groups: BTreeMap<String, Vec<Vec<Entry>>> = BTreeMap::new();
    for resp in responses {
        for stream in resp.streams {
            total += stream.entries.len();
            groups
                .entry(stream.labels)
                .or_default()
                .push(stream.entries);
        }
        // the limit has been reached, subsequent responses cannot
        // contribute entries
        if total >= limit {
            break;
        }
    }

    let keys: Vec<String> = match direction {
        Direction::Forward => groups.keys().cloned().collect(),
        Direction::Backward => groups.keys().rev().cloned().collect(),
    };

    // escape hatch, everything fits under the limit
    if total <= limit {
        return keys
            .into_iter()
            .map(|key| {
                let runs = groups.remove(&key).unwrap_or_default();
                Stream {
                    entries: merge_runs(runs, direction),
                    labels: key,
                }
            })
            .collect();
    }

    let mut heap = BinaryHeap::with_capacity(keys.len());
    for key in &keys {
        let entries = merge_runs(groups.remove(key).unwrap_or_default(), direction);
        if !entries.is_empty() {
            heap.push(Cursor {
                labels: key.clone(),
                entries,
                pos: 0,
                direction,
            });
        }
    }

    let mut picked: HashMap<String, Vec<Entry>> = HashMap::new();
    for _ in 0..limit.min(total) {
        let Some(mut cursor) = heap.pop() else {
            break;
        };
        picked
            .entry(cursor.labels.clone())
            .or_default()
            .push(cursor.entries[cursor.pos].clone());
        cursor.pos += 1;
        if cursor.pos < cursor.entries.len() {
            heap.push(cursor);
        }
    }

    keys.into_iter()
        .filter_map(|key| {
            picked.remove(&key).map(|entries| Stream {
                labels: key,
                entries,
            })
        })
        .collect()
}

/// K-way merge of sorted, mutually non-overlapping entry runs for a
/// single label. Ties on timestamp break stably on run insertion
/// order.
fn merge_runs(mut runs: Vec<Vec<Entry>>, direction: Direction) -> Vec<Entry> {
    if runs.len() <= 1 {
        return runs.pop().unwrap_or_default();
    }

    let total: usize = runs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut positions = vec![0usize; runs.len()];

    while out.len() < total {
        let mut best: Option<usize> = None;
        for (i, run) in runs.iter().enumerate() {
            if positions[i] >= run.len() {
                continue;
            }
            let ts = run[positions[i]].timestamp_ns;
            let better = match best {
                None => true,
                Some(b) => {
                    let best_ts = runs[b][positions[b]].timestamp_ns;
                    match direction {
                        Direction::Forward => ts < best_ts,
                        Direction::Backward => ts > best_ts,
                    }
                }
            };
            if better {
                best = Some(i);
            }
        }
        let i = best.expect("a run with remaining entries exists");
        out.push(runs[i][positions[i]].clone());
        positions[i] += 1;
    }
    out
}

/// Head of one label's merged entries, ordered so the heap pops the
/// next entry per direction with a `(timestamp, label)` tie-break.
struct Cursor {
    labels: String,
    entries: Vec<Entry>,
    pos: usize,
    direction: Direction,
}

impl Cursor {
    fn head_ts(&self) -> i64 {
        self.entries[self.pos].timestamp_ns
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        let this = (self.head_ts(), &self.labels);
        let that = (other.head_ts(), &other.labels);
        match self.direction {
            // BinaryHeap pops the greatest element, so forward order
            // is reversed to pop the smallest (timestamp, label) pair
            Direction::Forward => that.cmp(&this),
            Direction::Backward => this.cmp(&that),
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SeriesIdentifier;
    use crate::response::WireVersion;

    fn entry(ts: i64, line: &str) -> Entry {
        Entry {
            timestamp_ns: ts,
            line: line.to_string(),
        }
    }

    fn stream_response(
        streams: Vec<(&str, Vec<Entry>)>,
        limit: u32,
        direction: Direction,
    ) -> QueryResponse {
        QueryResponse::Streams(LogStreamResponse {
            status: STATUS_SUCCESS.to_string(),
            direction,
            limit,
            version: WireVersion::V1,
            statistics: Statistics::default(),
            streams: streams
                .into_iter()
                .map(|(labels, entries)| Stream {
                    labels: labels.to_string(),
                    entries,
                })
                .collect(),
            headers: vec![],
        })
    }

    fn unwrap_streams(resp: QueryResponse) -> LogStreamResponse {
        match resp {
            QueryResponse::Streams(s) => s,
            other => panic!("expected stream response, got {:?}", other),
        }
    }

    #[test]
    fn should_require_at_least_one_response() {
        // given/when
        let result = merge_responses(vec![]);

        // then
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn should_reject_mixed_shapes() {
        // given
        let streams = stream_response(vec![], 10, Direction::Backward);
        let labels = QueryResponse::Labels(LabelNamesResponse {
            status: STATUS_SUCCESS.to_string(),
            version: WireVersion::V1,
            names: vec![],
            headers: vec![],
        });

        // when
        let result = merge_responses(vec![streams, labels]);

        // then
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn should_merge_backward_streams_and_truncate_to_limit() {
        // given - two non-overlapping backward responses, limit 3
        let a = stream_response(
            vec![("{foo=\"1\"}", vec![entry(10, "a"), entry(9, "b")])],
            3,
            Direction::Backward,
        );
        let b = stream_response(
            vec![("{foo=\"1\"}", vec![entry(8, "c"), entry(7, "d")])],
            3,
            Direction::Backward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then - newest three entries survive
        assert_eq!(merged.streams.len(), 1);
        assert_eq!(merged.streams[0].labels, "{foo=\"1\"}");
        let lines: Vec<&str> = merged.streams[0]
            .entries
            .iter()
            .map(|e| e.line.as_str())
            .collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(merged.count(), 3);
    }

    #[test]
    fn should_return_all_entries_when_under_limit() {
        // given
        let a = stream_response(
            vec![("{foo=\"1\"}", vec![entry(1, "a"), entry(3, "c")])],
            10,
            Direction::Forward,
        );
        let b = stream_response(
            vec![("{foo=\"1\"}", vec![entry(2, "b")])],
            10,
            Direction::Forward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then - interleaved runs come out sorted forward
        let ts: Vec<i64> = merged.streams[0]
            .entries
            .iter()
            .map(|e| e.timestamp_ns)
            .collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn should_sort_labels_ascending_for_forward_queries() {
        // given
        let a = stream_response(
            vec![("{b=\"2\"}", vec![entry(1, "x")])],
            10,
            Direction::Forward,
        );
        let b = stream_response(
            vec![("{a=\"1\"}", vec![entry(2, "y")])],
            10,
            Direction::Forward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then
        let labels: Vec<&str> = merged.streams.iter().map(|s| s.labels.as_str()).collect();
        assert_eq!(labels, vec!["{a=\"1\"}", "{b=\"2\"}"]);
    }

    #[test]
    fn should_sort_labels_descending_for_backward_queries() {
        // given
        let a = stream_response(
            vec![
                ("{a=\"1\"}", vec![entry(5, "x")]),
                ("{b=\"2\"}", vec![entry(6, "y")]),
            ],
            10,
            Direction::Backward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a]).unwrap());

        // then
        let labels: Vec<&str> = merged.streams.iter().map(|s| s.labels.as_str()).collect();
        assert_eq!(labels, vec!["{b=\"2\"}", "{a=\"1\"}"]);
    }

    #[test]
    fn should_truncate_across_labels_by_timestamp() {
        // given - limit 3, entries spread over two labels
        let a = stream_response(
            vec![("{a=\"1\"}", vec![entry(1, "a1"), entry(4, "a4")])],
            3,
            Direction::Forward,
        );
        let b = stream_response(
            vec![("{b=\"2\"}", vec![entry(2, "b2"), entry(3, "b3")])],
            3,
            Direction::Forward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then - globally earliest three entries survive, grouped by label
        assert_eq!(merged.count(), 3);
        assert_eq!(merged.streams.len(), 2);
        assert_eq!(merged.streams[0].labels, "{a=\"1\"}");
        assert_eq!(merged.streams[0].entries.len(), 1);
        assert_eq!(merged.streams[1].entries.len(), 2);
    }

    #[test]
    fn should_mark_merged_stream_response_as_success() {
        // given
        let a = QueryResponse::Streams(LogStreamResponse {
            status: "error".to_string(),
            direction: Direction::Backward,
            limit: 10,
            version: WireVersion::Legacy,
            statistics: Statistics {
                bytes_processed: 5,
                lines_processed: 1,
                exec_time_seconds: 0.5,
            },
            streams: vec![],
            headers: vec![],
        });
        let b = stream_response(vec![], 10, Direction::Backward);

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then - status resets, version and statistics carry over
        assert_eq!(merged.status, STATUS_SUCCESS);
        assert_eq!(merged.version, WireVersion::Legacy);
        assert_eq!(merged.statistics.bytes_processed, 5);
    }

    #[test]
    fn should_dedup_series_preserving_first_appearance() {
        // given - overlapping series across responses
        let series = |pairs: Vec<(&str, &str)>| SeriesIdentifier {
            labels: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let a = QueryResponse::Series(SeriesResponse {
            status: STATUS_SUCCESS.to_string(),
            version: WireVersion::V1,
            series: vec![
                series(vec![("a", "1"), ("b", "2")]),
                series(vec![("a", "1"), ("b", "3")]),
            ],
            headers: vec![],
        });
        let b = QueryResponse::Series(SeriesResponse {
            status: STATUS_SUCCESS.to_string(),
            version: WireVersion::V1,
            series: vec![
                series(vec![("a", "1"), ("b", "2")]),
                series(vec![("a", "1"), ("b", "4")]),
            ],
            headers: vec![],
        });

        // when
        let merged = merge_responses(vec![a, b]).unwrap();

        // then
        let QueryResponse::Series(s) = merged else {
            panic!("expected series response");
        };
        let canonical: Vec<String> = s.series.iter().map(|i| i.canonical()).collect();
        assert_eq!(
            canonical,
            vec![
                "{a=\"1\", b=\"2\"}",
                "{a=\"1\", b=\"3\"}",
                "{a=\"1\", b=\"4\"}"
            ]
        );
    }

    #[test]
    fn should_dedup_label_names_preserving_first_appearance() {
        // given
        let resp = |names: Vec<&str>| {
            QueryResponse::Labels(LabelNamesResponse {
                status: STATUS_SUCCESS.to_string(),
                version: WireVersion::V1,
                names: names.into_iter().map(String::from).collect(),
                headers: vec![],
            })
        };

        // when
        let merged = merge_responses(vec![resp(vec!["b", "a"]), resp(vec!["a", "c"])]).unwrap();

        // then
        let QueryResponse::Labels(l) = merged else {
            panic!("expected labels response");
        };
        assert_eq!(l.names, vec!["b", "a", "c"]);
    }

    #[test]
    fn should_merge_matrix_series_deduping_timestamps() {
        // given - the same series split across two responses with one
        // overlapping sample
        let sample = |ts, v| crate::model::Sample {
            timestamp_ms: ts,
            value: v,
        };
        let series = |samples: Vec<crate::model::Sample>| SampleStream {
            labels: [("app".to_string(), "nginx".to_string())]
                .into_iter()
                .collect(),
            samples,
        };
        let metric = |result: Vec<SampleStream>, bytes| {
            QueryResponse::Metric(MetricResponse {
                status: STATUS_SUCCESS.to_string(),
                kind: MetricKind::Matrix,
                result,
                statistics: Statistics {
                    bytes_processed: bytes,
                    ..Default::default()
                },
                headers: vec![],
            })
        };
        let a = metric(vec![series(vec![sample(2_000, 2.0), sample(1_000, 1.0)])], 3);
        let b = metric(vec![series(vec![sample(2_000, 2.0), sample(3_000, 3.0)])], 4);

        // when
        let merged = merge_responses(vec![a, b]).unwrap();

        // then
        let QueryResponse::Metric(m) = merged else {
            panic!("expected metric response");
        };
        assert_eq!(m.result.len(), 1);
        let ts: Vec<i64> = m.result[0].samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![1_000, 2_000, 3_000]);
        assert_eq!(m.statistics.bytes_processed, 7);
    }

    #[test]
    fn should_concatenate_vector_results() {
        // given
        let series = |name: &str| SampleStream {
            labels: [("app".to_string(), name.to_string())].into_iter().collect(),
            samples: vec![crate::model::Sample {
                timestamp_ms: 1_000,
                value: 1.0,
            }],
        };
        let vector = |result| {
            QueryResponse::Metric(MetricResponse {
                status: STATUS_SUCCESS.to_string(),
                kind: MetricKind::Vector,
                result,
                statistics: Statistics::default(),
                headers: vec![],
            })
        };

        // when
        let merged =
            merge_responses(vec![vector(vec![series("a")]), vector(vec![series("b")])]).unwrap();

        // then
        let QueryResponse::Metric(m) = merged else {
            panic!("expected metric response");
        };
        assert_eq!(m.result.len(), 2);
    }

    #[test]
    fn should_keep_entry_count_at_min_of_limit_and_total() {
        // given - total 4, limit 10
        let a = stream_response(
            vec![("{a=\"1\"}", vec![entry(4, "w"), entry(3, "x")])],
            10,
            Direction::Backward,
        );
        let b = stream_response(
            vec![("{a=\"1\"}", vec![entry(2, "y"), entry(1, "z")])],
            10,
            Direction::Backward,
        );

        // when
        let merged = unwrap_streams(merge_responses(vec![a, b]).unwrap());

        // then
        assert_eq!(merged.count(), 4);
        let ts: Vec<i64> = merged.streams[0]
            .entries
            .iter()
            .map(|e| e.timestamp_ns)
            .collect();
        assert_eq!(ts, vec![4, 3, 2, 1]);
    }
}
