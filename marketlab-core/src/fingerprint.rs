//! Canonical values and deterministic fingerprinting.
//!
//! `CanonicalValue` is a small sum type for anything that needs a stable
//! identity: provider requests, config payloads, universe snapshots. The
//! canonical JSON encoding sorts map keys, sorts set members by their own
//! encoding, keeps list order, and escapes to ASCII — so two logically
//! equal values always hash to the same SHA-256 digest no matter how they
//! were assembled.

use crate::error::{DataError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Number;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Tagged canonical value tree.
///
/// `Set` is the one variant plain JSON lacks: an unordered collection whose
/// member order must not affect the fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<CanonicalValue>),
    Set(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

impl CanonicalValue {
    pub fn string(value: impl Into<String>) -> Self {
        CanonicalValue::String(value.into())
    }

    pub fn int(value: i64) -> Self {
        CanonicalValue::Number(Number::from(value))
    }

    /// Non-finite floats have no canonical JSON form and are rejected.
    pub fn float(value: f64) -> Result<Self> {
        Number::from_f64(value)
            .map(CanonicalValue::Number)
            .ok_or_else(|| {
                DataError::validation("canonical number must be finite")
                    .with("value", value.to_string())
            })
    }

    /// UTC timestamps encode as ISO-8601 with an explicit offset.
    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        CanonicalValue::String(format_utc(value))
    }

    pub fn from_date(value: NaiveDate) -> Self {
        CanonicalValue::String(value.format("%Y-%m-%d").to_string())
    }

    /// Convert a JSON tree. Objects become sorted maps; arrays stay lists.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CanonicalValue::Null,
            serde_json::Value::Bool(b) => CanonicalValue::Bool(*b),
            serde_json::Value::Number(n) => CanonicalValue::Number(n.clone()),
            serde_json::Value::String(s) => CanonicalValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                CanonicalValue::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => CanonicalValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Total normalization: sets become lists sorted by canonical encoding.
    pub fn normalized(&self) -> CanonicalValue {
        match self {
            CanonicalValue::Null => CanonicalValue::Null,
            CanonicalValue::Bool(b) => CanonicalValue::Bool(*b),
            CanonicalValue::Number(n) => CanonicalValue::Number(n.clone()),
            CanonicalValue::String(s) => CanonicalValue::String(s.clone()),
            CanonicalValue::List(items) => {
                CanonicalValue::List(items.iter().map(Self::normalized).collect())
            }
            CanonicalValue::Set(items) => {
                let mut normalized: Vec<CanonicalValue> =
                    items.iter().map(Self::normalized).collect();
                normalized.sort_by(|a, b| canonical_json(a).cmp(&canonical_json(b)));
                CanonicalValue::List(normalized)
            }
            CanonicalValue::Map(entries) => CanonicalValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.normalized()))
                    .collect(),
            ),
        }
    }
}

/// Serialize a canonical value: sorted keys, no insignificant whitespace,
/// ASCII-safe escaping.
pub fn canonical_json(value: &CanonicalValue) -> String {
    let mut out = String::new();
    write_value(&value.normalized(), &mut out);
    out
}

/// Lowercase hex SHA-256 of the canonical encoding. Pure: equal logical
/// values yield equal fingerprints regardless of construction order.
pub fn fingerprint(value: &CanonicalValue) -> String {
    let encoded = canonical_json(value);
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// Fingerprint an already-built JSON payload (seed files, config maps).
pub fn fingerprint_json(value: &serde_json::Value) -> String {
    fingerprint(&CanonicalValue::from_json(value))
}

/// Deterministic ingestion run identifier: `ing_{YYYYMMDD_HHMMSS}Z_{seq:04}`.
pub fn generate_run_id(started_at: DateTime<Utc>, sequence: u32) -> Result<String> {
    if sequence < 1 {
        return Err(DataError::validation("sequence must be >= 1")
            .with("sequence", sequence));
    }
    Ok(format!(
        "ing_{}Z_{sequence:04}",
        started_at.format("%Y%m%d_%H%M%S")
    ))
}

/// Render a UTC timestamp with an explicit `+00:00` offset.
pub fn format_utc(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Parse an ISO-8601 timestamp that must carry an offset; normalized to UTC.
pub fn parse_utc(value: &str, name: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            DataError::validation(format!("{name} must be an ISO-8601 datetime with offset"))
                .with("value", value)
                .with_cause(e)
        })
}

fn write_value(value: &CanonicalValue, out: &mut String) {
    match value {
        CanonicalValue::Null => out.push_str("null"),
        CanonicalValue::Bool(true) => out.push_str("true"),
        CanonicalValue::Bool(false) => out.push_str("false"),
        CanonicalValue::Number(n) => out.push_str(&n.to_string()),
        CanonicalValue::String(s) => write_escaped(s, out),
        CanonicalValue::List(items) | CanonicalValue::Set(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        CanonicalValue::Map(entries) => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_value(item, out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if (ch as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", ch as u32));
            }
            ch if ch.is_ascii() => out.push(ch),
            ch => {
                // Non-ASCII escapes as UTF-16 code units, surrogate pairs
                // included, so the encoding is pure ASCII.
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
        }
    }
    out.push('"');
}
