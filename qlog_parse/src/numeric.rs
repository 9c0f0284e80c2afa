//! Numeric normalization for trace values.
//!
//! Producers disagree on how numbers are written: times and counters show up
//! as JSON numbers, decimal strings, or `0x`-prefixed hex strings. Connection
//! IDs are the exception. They can exceed 53 bits and are always kept as
//! opaque hex strings.

use serde_json::{Map, Number, Value};

/// Data keys whose values are protocol counters and get normalized to numbers.
const COUNT_FIELDS: &[&str] = &[
    "ack_delay",
    "bytes_in_flight",
    "congestion_window",
    "count",
    "error_code",
    "header_length",
    "largest_acknowledged",
    "latest_rtt",
    "length",
    "max_data",
    "max_stream_data",
    "max_streams",
    "min_rtt",
    "offset",
    "packet_number",
    "packet_size",
    "payload_length",
    "rtt_variance",
    "size",
    "smoothed_rtt",
    "ssthresh",
    "stream_id",
    "window",
];

/// Parse a time or counter value into an `f64`.
///
/// Accepts JSON numbers, decimal strings (integer or fractional) and
/// `0x`-prefixed hex strings. Non-finite results are rejected.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_str(s),
        _ => None,
    }
}

/// Parse an unsigned integer value without going through `f64`.
pub fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            match hex_digits(s) {
                Some(digits) => u64::from_str_radix(digits, 16).ok(),
                None => s.parse::<u64>().ok(),
            }
        }
        _ => None,
    }
}

fn parse_numeric_str(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(digits) = hex_digits(s) {
        return u64::from_str_radix(digits, 16).ok().map(|n| n as f64);
    }
    // `f64::from_str` also accepts "inf" and "NaN"; only plain decimals count.
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn hex_digits(s: &str) -> Option<&str> {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .filter(|digits| !digits.is_empty())
}

/// Convert a numeric-looking value into a JSON number.
///
/// Integers stay integers (no precision loss below `u64::MAX`); everything
/// else goes through `f64`. Returns `None` if the value is not numeric.
pub fn to_json_number(value: &Value) -> Option<Value> {
    if let Some(n) = parse_u64(value) {
        return Some(Value::Number(Number::from(n)));
    }
    if let Value::Number(n) = value {
        return Some(Value::Number(n.clone()));
    }
    parse_number(value)
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Whether a data key names a connection identifier.
pub fn is_connection_id_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.ends_with("cid") || key.contains("connection_id")
}

/// Render a connection ID as an opaque hex string.
///
/// Strings are kept verbatim; integers are rendered as lowercase hex.
pub fn connection_id_to_hex(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            let id = n.as_u64().map(u128::from).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f < u128::MAX as f64)
                    .map(|f| f as u128)
            });
            match id {
                Some(id) => Value::String(format!("{:x}", id)),
                None => {
                    log::warn!("connection ID {} is not a non-negative integer", n);
                    Value::String(n.to_string())
                }
            }
        }
        other => other.clone(),
    }
}

/// Normalize the numeric fields of an event's `data` map.
///
/// Counter fields become JSON numbers, connection IDs become hex strings,
/// and nested objects (including objects inside arrays) are normalized the
/// same way. Everything else is left untouched.
pub fn normalize_data(data: &Map<String, Value>) -> Map<String, Value> {
    data.iter()
        .map(|(key, value)| (key.clone(), normalize_field(key, value)))
        .collect()
}

fn normalize_field(key: &str, value: &Value) -> Value {
    if is_connection_id_key(key) {
        return connection_id_to_hex(value);
    }
    match value {
        Value::Object(map) => Value::Object(normalize_data(map)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Value::Object(normalize_data(map)),
                    other => other.clone(),
                })
                .collect(),
        ),
        Value::String(_) if COUNT_FIELDS.contains(&key) => {
            to_json_number(value).unwrap_or_else(|| value.clone())
        }
        other => other.clone(),
    }
}
