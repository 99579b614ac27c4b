//! Response expectations for the http probe.
//!
//! Expectations are evaluated in order once the status code is
//! acceptable; the first failing expectation fails the check.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use crate::config::{parse_duration, MatchExpectation, MatchOp, MatchSource};

/// Response view handed to the matcher: body bytes and lowercased
/// header names.
pub struct ResponseData<'a> {
    pub body: &'a [u8],
    pub headers: &'a HashMap<String, String>,
}

pub fn evaluate(exp: &MatchExpectation, data: &ResponseData<'_>) -> Result<(), String> {
    match exp.source {
        MatchSource::Body => {
            let actual = String::from_utf8_lossy(data.body);
            compare_one(&actual, exp).map_err(|e| format!("body {}", e))
        }
        MatchSource::Header => {
            let name = exp
                .selector
                .as_deref()
                .ok_or_else(|| "header expectation without a header name".to_string())?;
            let actual = data
                .headers
                .get(&name.to_ascii_lowercase())
                .ok_or_else(|| format!("header {:?} not present", name))?;
            compare_one(actual, exp).map_err(|e| format!("header {:?} {}", name, e))
        }
        MatchSource::Json => {
            let path = exp.selector.as_deref().unwrap_or("");
            let root: Value = serde_json::from_slice(data.body)
                .map_err(|e| format!("response is not valid json: {}", e))?;
            let candidates = select_path(&root, path);
            if candidates.is_empty() {
                return Err(format!("json path {:?} matched nothing", path));
            }
            // Any candidate satisfying the operator passes.
            let mut last_err = String::new();
            for candidate in &candidates {
                match compare_one(&value_to_string(candidate), exp) {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = e,
                }
            }
            Err(format!("json path {:?} {}", path, last_err))
        }
    }
}

/// Walk a dot-separated path with numeric indexes and `*` wildcards.
/// A terminal array fans out into its elements.
fn select_path<'a>(root: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![root];
    if !path.is_empty() {
        for part in path.split('.') {
            current = current
                .into_iter()
                .flat_map(|value| step(value, part))
                .collect();
            if current.is_empty() {
                return current;
            }
        }
    }
    // Aggregate over terminal arrays.
    current
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

fn step<'a>(value: &'a Value, part: &str) -> Vec<&'a Value> {
    match value {
        Value::Object(map) => {
            if part == "*" {
                map.values().collect()
            } else {
                map.get(part).into_iter().collect()
            }
        }
        Value::Array(items) => {
            if part == "*" {
                items.iter().collect()
            } else if let Ok(index) = part.parse::<usize>() {
                items.get(index).into_iter().collect()
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_one(actual: &str, exp: &MatchExpectation) -> Result<(), String> {
    let expected = exp.value.as_str();
    let ok = match exp.op {
        MatchOp::Eq => actual == expected,
        MatchOp::Contains => actual.contains(expected),
        MatchOp::Matches => Regex::new(expected)
            .map_err(|e| format!("invalid pattern {:?}: {}", expected, e))?
            .is_match(actual),
        MatchOp::Less => ordered(actual, expected)?.is_lt(),
        MatchOp::Greater => ordered(actual, expected)?.is_gt(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "{:?} did not satisfy {} {:?}",
            truncate(actual),
            op_symbol(exp.op),
            expected
        ))
    }
}

/// Three-way semantics for `<` / `>`:
/// duration target -> actual is a timestamp, compare its age;
/// numeric target  -> numeric comparison;
/// otherwise       -> both sides are timestamps.
fn ordered(actual: &str, expected: &str) -> Result<std::cmp::Ordering, String> {
    if let Ok(window) = parse_duration(expected) {
        if !window.is_zero() {
            let at = parse_timestamp(actual)
                .ok_or_else(|| format!("{:?} is not a timestamp", truncate(actual)))?;
            let age = Utc::now()
                .signed_duration_since(at)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            return Ok(age.cmp(&window));
        }
    }
    if let (Ok(a), Ok(b)) = (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| "numeric comparison with NaN".to_string());
    }
    match (parse_timestamp(actual), parse_timestamp(expected)) {
        (Some(a), Some(b)) => Ok(a.cmp(&b)),
        _ => Err(format!(
            "cannot order {:?} against {:?}",
            truncate(actual),
            expected
        )),
    }
}

/// RFC3339 plus the usual timestamp spellings.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

fn truncate(s: &str) -> String {
    const LIMIT: usize = 64;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        format!("{}...", &s[..LIMIT])
    }
}

fn op_symbol(op: MatchOp) -> &'static str {
    match op {
        MatchOp::Eq => "==",
        MatchOp::Contains => "contains",
        MatchOp::Matches => "matches",
        MatchOp::Less => "<",
        MatchOp::Greater => ">",
    }
}
