//! The value space of source documents.
//!
//! Projection is driven by pattern dispatch over [`Value`]: the sink accepts
//! string tags and four scalar field types; wall-clock times and replication
//! timestamps are only meaningful as a point's time; nested maps are
//! flattened into dotted-key leaves; everything else is dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::event::ReplTimestamp;
use crate::point::FieldValue;

/// A document: field name to value.
pub type ValueMap = BTreeMap<String, Value>;

/// Maximum nesting depth accepted by [`flatten`]. Deeper documents fail the
/// event rather than risk unbounded recursion.
pub const MAX_FLATTEN_DEPTH: usize = 64;

/// A single value read from a source document.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string.
    String(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Wall-clock time.
    Time(DateTime<Utc>),
    /// Replication timestamp.
    Stamp(ReplTimestamp),
    /// Nested sub-document.
    Map(ValueMap),
    /// Array. Never projected, even when the elements are scalars.
    Array(Vec<Value>),
    /// Explicit null.
    Null,
    /// A source type with no counterpart here; carries the source type name
    /// for log messages.
    Other(&'static str),
}

impl Value {
    /// True when the value may be used as a tag. The sink requires string
    /// tags; nothing is coerced.
    #[must_use]
    pub fn is_tag(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// True when the value may be used as a field: string, 64-bit integer,
    /// 64-bit float, or bool.
    #[must_use]
    pub fn is_field(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)
        )
    }

    /// The value as a sink field scalar, when [`is_field`](Self::is_field)
    /// holds.
    #[must_use]
    pub fn as_field(&self) -> Option<FieldValue> {
        match self {
            Value::String(s) => Some(FieldValue::String(s.clone())),
            Value::Int(i) => Some(FieldValue::Integer(*i)),
            Value::Float(f) => Some(FieldValue::Float(*f)),
            Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            _ => None,
        }
    }

    /// A short name for the value's type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int(_) => "int64",
            Value::Float(_) => "float64",
            Value::Bool(_) => "bool",
            Value::Time(_) => "time",
            Value::Stamp(_) => "timestamp",
            Value::Map(_) => "document",
            Value::Array(_) => "array",
            Value::Null => "null",
            Value::Other(name) => name,
        }
    }
}

/// The document exceeded [`MAX_FLATTEN_DEPTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthExceeded;

/// Flattens a nested map into dotted-key scalar leaves.
///
/// Keys are `prefix + k1 + "." + k2 + …`; only leaves that satisfy
/// [`Value::is_field`] are emitted, so arrays and unsupported types vanish
/// silently. Already-flat maps come back unchanged (minus non-field leaves).
///
/// # Errors
///
/// [`DepthExceeded`] when nesting passes [`MAX_FLATTEN_DEPTH`]; callers fail
/// the whole event.
pub fn flatten(prefix: &str, map: &ValueMap) -> Result<ValueMap, DepthExceeded> {
    let mut out = ValueMap::new();
    flatten_into(prefix, map, &mut out, 0)?;
    Ok(out)
}

fn flatten_into(
    prefix: &str,
    map: &ValueMap,
    out: &mut ValueMap,
    depth: usize,
) -> Result<(), DepthExceeded> {
    if depth >= MAX_FLATTEN_DEPTH {
        return Err(DepthExceeded);
    }
    for (key, value) in map {
        match value {
            Value::Map(child) => {
                let child_prefix = format!("{prefix}{key}.");
                flatten_into(&child_prefix, child, out, depth + 1)?;
            }
            leaf if leaf.is_field() => {
                out.insert(format!("{prefix}{key}"), leaf.clone());
            }
            _ => {}
        }
    }
    Ok(())
}
