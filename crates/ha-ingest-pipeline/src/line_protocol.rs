//! Influx line protocol encoding.
//!
//! One line per point:
//! `<measurement>,<tag>=<v>,... <field>=<v>,... <nanos>`
//!
//! Escaping rules: measurements escape commas and spaces; tag and field keys
//! and tag values additionally escape equals signs; string field values are
//! double-quoted with backslash escapes. Points keep their slice order, which
//! is what preserves enqueue order inside a batch on the wire.

use std::fmt::Write;

use ha_ingest_core::point::{FieldValue, Point};

/// Encode a batch; points without fields are skipped (the store rejects
/// field-less lines wholesale).
pub fn encode_batch(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 128);
    for point in points {
        if !point.has_fields() {
            continue;
        }
        encode_point(point, &mut out);
        out.push('\n');
    }
    // No trailing newline.
    if out.ends_with('\n') {
        out.pop();
    }
    out
}

fn encode_point(point: &Point, out: &mut String) {
    escape_measurement(&point.measurement, out);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        out.push(',');
        escape_key(key, out);
        out.push('=');
        escape_key(value, out);
    }
    out.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if !first {
            out.push(',');
        }
        first = false;
        escape_key(key, out);
        out.push('=');
        encode_field_value(value, out);
    }
    out.push(' ');
    let nanos = point
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| point.timestamp.timestamp_millis() * 1_000_000);
    let _ = write!(out, "{}", nanos);
}

fn encode_field_value(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::Float(v) => {
            let _ = write!(out, "{}", v);
        }
        FieldValue::Integer(v) => {
            let _ = write!(out, "{}i", v);
        }
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::Text(v) => {
            out.push('"');
            for c in v.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
    }
}

fn escape_measurement(measurement: &str, out: &mut String) {
    for c in measurement.chars() {
        match c {
            ',' => out.push_str("\\,"),
            ' ' => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
}

/// Tag keys, tag values and field keys share the same escape set.
fn escape_key(key: &str, out: &mut String) {
    for c in key.chars() {
        match c {
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            ' ' => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
}
