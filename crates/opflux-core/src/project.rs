//! Projection of one change event into one point.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::ProjectionError;
use crate::event::ChangeEvent;
use crate::point::{FieldValue, Point};
use crate::schema::Measurement;
use crate::value::{flatten, Value, MAX_FLATTEN_DEPTH};

/// The document identifier key; never contributes to a point.
pub const ID_FIELD: &str = "_id";

/// Projects an event through its measurement spec.
///
/// Returns `Ok(None)` when no usable fields survived type checking: the
/// sink would reject such a point, so it is dropped here with a warning.
///
/// # Errors
///
/// [`ProjectionError::MissingTimeField`] when the spec names a time field
/// that is absent or not a time type, and
/// [`ProjectionError::NestingTooDeep`] when a sub-document exceeds the
/// flattening depth bound. Both fail only this event.
pub fn project(
    event: &ChangeEvent,
    spec: &Measurement,
) -> Result<Option<Point>, ProjectionError> {
    let mut time: Option<DateTime<Utc>> = match spec.time_field {
        None => Some(event.timestamp.to_datetime()),
        Some(_) => None,
    };
    let mut tags = BTreeMap::new();
    let mut fields = BTreeMap::new();

    for (key, value) in &event.data {
        if key == ID_FIELD {
            continue;
        }
        match value {
            Value::Time(t) => {
                if spec.time_field.as_deref() == Some(key.as_str()) {
                    time = Some(*t);
                }
            }
            Value::Stamp(ts) => {
                if spec.time_field.as_deref() == Some(key.as_str()) {
                    time = Some(ts.to_datetime());
                }
            }
            Value::Map(child) => {
                let prefix = format!("{key}.");
                let flat = flatten(&prefix, child).map_err(|_| {
                    ProjectionError::NestingTooDeep {
                        namespace: event.ns.qualified(),
                        limit: MAX_FLATTEN_DEPTH,
                    }
                })?;
                for (flat_key, flat_value) in &flat {
                    classify(event, spec, flat_key, flat_value, &mut tags, &mut fields);
                }
            }
            other => classify(event, spec, key, other, &mut tags, &mut fields),
        }
    }

    let Some(time) = time else {
        return Err(ProjectionError::MissingTimeField {
            namespace: event.ns.qualified(),
            field: spec.time_field.clone().unwrap_or_default(),
        });
    };

    if fields.is_empty() {
        warn!(
            namespace = %event.ns,
            "no usable fields in document, dropping point"
        );
        return Ok(None);
    }

    Ok(Some(Point {
        measurement: spec.measurement_name(&event.ns.collection).to_string(),
        tags,
        fields,
        time,
    }))
}

/// Routes one (possibly flattened) key into the tag or field map according
/// to the spec's sets. Type mismatches are logged and dropped; keys in
/// neither set are ignored.
fn classify(
    event: &ChangeEvent,
    spec: &Measurement,
    key: &str,
    value: &Value,
    tags: &mut BTreeMap<String, String>,
    fields: &mut BTreeMap<String, FieldValue>,
) {
    if spec.tags.contains(key) {
        if let Value::String(s) = value {
            tags.insert(key.to_string(), s.clone());
        } else {
            warn!(
                namespace = %event.ns,
                key,
                value_type = value.type_name(),
                "unsupported type for tag, dropping"
            );
        }
    } else if spec.fields.contains(key) {
        if let Some(field) = value.as_field() {
            fields.insert(key.to_string(), field);
        } else {
            warn!(
                namespace = %event.ns,
                key,
                value_type = value.type_name(),
                "unsupported type for field, dropping"
            );
        }
    }
}
