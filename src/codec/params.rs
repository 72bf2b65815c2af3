//! Url-encoded form parsing for query requests.
//!
//! The query endpoints use repeated keys (`shards`, `match[]`), which
//! rules out a plain derived struct, so parameters are collected as
//! pairs and read through typed accessors. Unknown parameters are
//! ignored.

use std::time::{Duration, SystemTime};

use url::form_urlencoded;

use crate::clock::from_unix_nanos;
use crate::error::{Error, Result};
use crate::model::Direction;

/// Parsed url-encoded form, preserving repeated keys in order.
pub(crate) struct Form {
    pairs: Vec<(String, String)>,
}

impl Form {
    pub(crate) fn parse(query: &str) -> Self {
        Self {
            pairs: form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    /// First value for `key`, if present.
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in order of appearance.
    pub(crate) fn all(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Parse `key` as integer nanoseconds since the epoch.
    pub(crate) fn nanos_time(&self, key: &str) -> Result<Option<SystemTime>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let ns: i64 = raw
                    .parse()
                    .map_err(|_| invalid(key, raw))?;
                Ok(Some(from_unix_nanos(ns)))
            }
        }
    }

    /// Parse `key` as a float number of seconds, returned as
    /// milliseconds. Must be strictly positive when present.
    pub(crate) fn seconds_millis(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let secs: f64 = raw.parse().map_err(|_| invalid(key, raw))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(Error::bad_request(format!(
                        "{} must be a positive value, got {}",
                        key, raw
                    )));
                }
                Ok(Some((secs * 1_000.0).round() as i64))
            }
        }
    }

    /// Parse `key` as a positive entry limit.
    pub(crate) fn limit(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let limit: u32 = raw.parse().map_err(|_| invalid(key, raw))?;
                if limit == 0 {
                    return Err(Error::bad_request(format!(
                        "{} must be a positive value",
                        key
                    )));
                }
                Ok(Some(limit))
            }
        }
    }

    /// Parse `key` as a sort direction.
    pub(crate) fn direction(&self, key: &str) -> Result<Option<Direction>> {
        self.get(key).map(Direction::parse).transpose()
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::bad_request(format!("invalid parameter {}: {:?}", key, value))
}

/// Default step for a range query: the range divided into 250 buckets,
/// floored to whole seconds, at least one second.
pub(crate) fn default_step_ms(start: SystemTime, end: SystemTime) -> i64 {
    let range = end
        .duration_since(start)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    let step_secs = (range / 250.0).floor().max(1.0);
    (step_secs * 1_000.0) as i64
}
