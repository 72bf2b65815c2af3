//! Core data types shared by requests, responses, and the merger.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sort direction for log entries within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Forward,
    #[default]
    Backward,
}

impl Direction {
    /// Wire representation (`forward` / `backward`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }

    /// Parse the wire representation, case-insensitively.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            other => Err(Error::bad_request(format!(
                "invalid direction: {}",
                other
            ))),
        }
    }
}

/// A single log line with its timestamp in nanoseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp_ns: i64,
    pub line: String,
}

/// An ordered run of entries carrying a unique label set.
///
/// `labels` is the canonical label string (sorted keys, quoted values),
/// which is also the stream's identity: two streams with the same
/// label string are the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub labels: String,
    pub entries: Vec<Entry>,
}

/// A metric sample: millisecond timestamp plus value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// A metric series as returned by the backend in matrix or vector form.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

/// Identity of a log series, as reported by the series endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesIdentifier {
    pub labels: BTreeMap<String, String>,
}

impl SeriesIdentifier {
    /// Canonical string form, used for de-duplication during merge.
    pub fn canonical(&self) -> String {
        format_label_set(&self.labels)
    }
}

/// Summary statistics attached to query responses.
///
/// Merging sub-responses adds statistics field-wise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub bytes_processed: u64,
    pub lines_processed: u64,
    pub exec_time_seconds: f64,
}

impl Statistics {
    pub fn merge(&mut self, other: &Statistics) {
        self.bytes_processed += other.bytes_processed;
        self.lines_processed += other.lines_processed;
        self.exec_time_seconds += other.exec_time_seconds;
    }
}

/// Render a label set as the canonical string `{a="1", b="2"}`.
///
/// Keys come out sorted (the map is ordered) and values are quoted with
/// backslash escaping, so equal label sets always render identically.
pub fn format_label_set(labels: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(16 * labels.len() + 2);
    out.push('{');
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push('=');
        out.push('"');
        for c in value.chars() {
            match c {
                '"' | '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        out.push('"');
    }
    out.push('}');
    out
}

/// Parse a canonical label string back into a label set.
///
/// Accepts the format emitted by [`format_label_set`]. Failure is an
/// internal error: label strings inside the frontend always originate
/// from decoded label maps.
pub fn parse_label_string(s: &str) -> Result<BTreeMap<String, String>> {
    let inner = s
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| invalid_labels(s))?;

    let mut labels = BTreeMap::new();
    let mut chars = inner.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(invalid_labels(s));
        }

        if chars.next() != Some('"') {
            return Err(invalid_labels(s));
        }
        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => value.push(escaped),
                    None => return Err(invalid_labels(s)),
                },
                '"' => {
                    closed = true;
                    break;
                }
                _ => value.push(c),
            }
        }
        if !closed {
            return Err(invalid_labels(s));
        }

        labels.insert(name, value);
    }
    Ok(labels)
}

fn invalid_labels(s: &str) -> Error {
    let mut msg = String::from("invalid label string: ");
    let _ = write!(msg, "{:?}", s);
    Error::internal(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn should_parse_direction_case_insensitively() {
        // given/when/then
        assert_eq!(Direction::parse("FORWARD").unwrap(), Direction::Forward);
        assert_eq!(Direction::parse("backward").unwrap(), Direction::Backward);
        assert!(Direction::parse("sideways").is_err());
    }

    #[test]
    fn should_format_label_set_with_sorted_keys() {
        // given
        let set = labels(&[("b", "2"), ("a", "1")]);

        // when
        let s = format_label_set(&set);

        // then
        assert_eq!(s, r#"{a="1", b="2"}"#);
    }

    #[test]
    fn should_round_trip_label_string() {
        // given
        let set = labels(&[("app", "nginx"), ("pod", "web-0")]);

        // when
        let parsed = parse_label_string(&format_label_set(&set)).unwrap();

        // then
        assert_eq!(parsed, set);
    }

    #[test]
    fn should_escape_quotes_and_backslashes_in_values() {
        // given
        let set = labels(&[("msg", r#"say "hi" \now"#)]);

        // when
        let s = format_label_set(&set);
        let parsed = parse_label_string(&s).unwrap();

        // then
        assert_eq!(parsed, set);
    }

    #[test]
    fn should_reject_unbraced_label_string() {
        // given/when
        let result = parse_label_string(r#"a="1""#);

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_merge_statistics_field_wise() {
        // given
        let mut a = Statistics {
            bytes_processed: 10,
            lines_processed: 2,
            exec_time_seconds: 0.5,
        };
        let b = Statistics {
            bytes_processed: 5,
            lines_processed: 3,
            exec_time_seconds: 0.25,
        };

        // when
        a.merge(&b);

        // then
        assert_eq!(a.bytes_processed, 15);
        assert_eq!(a.lines_processed, 5);
        assert_eq!(a.exec_time_seconds, 0.75);
    }

    #[test]
    fn should_use_canonical_form_for_series_identity() {
        // given
        let a = SeriesIdentifier {
            labels: labels(&[("a", "1"), ("b", "2")]),
        };
        let b = SeriesIdentifier {
            labels: labels(&[("b", "2"), ("a", "1")]),
        };

        // when/then
        assert_eq!(a.canonical(), b.canonical());
    }
}
