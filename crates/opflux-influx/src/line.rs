//! InfluxDB Line Protocol rendering.
//!
//! Format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
//! ```
//!
//! The timestamp is an integer in the batch's precision unit. Tags render
//! in key order (core points keep them in a sorted map), which gives the
//! server its canonical form.

use opflux_core::point::{Batch, FieldValue, Point, Precision};

/// Renders one batch into newline-separated Line Protocol.
#[must_use]
pub fn encode_batch(batch: &Batch) -> String {
    let mut out = String::new();
    for point in &batch.points {
        if !out.is_empty() {
            out.push('\n');
        }
        encode_point(point, batch.precision, &mut out);
    }
    out
}

/// Renders one point (without a trailing newline) into `out`.
pub fn encode_point(point: &Point, precision: Precision, out: &mut String) {
    out.push_str(&escape_measurement(&point.measurement));

    for (key, value) in &point.tags {
        out.push(',');
        out.push_str(&escape_key(key));
        out.push('=');
        out.push_str(&escape_key(value));
    }

    out.push(' ');
    for (i, (key, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_key(key));
        out.push('=');
        encode_field_value(value, out);
    }

    out.push(' ');
    out.push_str(&precision.encode(point.time).to_string());
}

/// The precision value the v1 API expects in `?precision=`; microseconds
/// are spelled `u` there.
#[must_use]
pub fn precision_param(precision: Precision) -> &'static str {
    match precision {
        Precision::Microseconds => "u",
        other => other.as_str(),
    }
}

fn encode_field_value(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::Float(v) => out.push_str(&v.to_string()),
        FieldValue::Integer(v) => {
            out.push_str(&v.to_string());
            out.push('i');
        }
        FieldValue::String(v) => {
            out.push('"');
            out.push_str(&v.replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
        }
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
    }
}

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values, and field keys escape commas, equals signs, and
/// spaces.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
