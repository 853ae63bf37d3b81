//! Points, batches, and timestamp precision.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// A value stored in a point field. The sink accepts exactly these four
/// scalar types.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit float.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean.
    Boolean(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Timestamp precision of a batch, as understood by the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    /// Nanoseconds since the epoch.
    Nanoseconds,
    /// Microseconds since the epoch.
    Microseconds,
    /// Milliseconds since the epoch.
    Milliseconds,
    /// Seconds since the epoch.
    #[default]
    Seconds,
    /// Minutes since the epoch.
    Minutes,
    /// Hours since the epoch.
    Hours,
}

impl Precision {
    /// The canonical spelling used in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "us",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }

    /// Encodes a wall-clock time as an integer timestamp in this precision.
    #[must_use]
    pub fn encode(self, time: DateTime<Utc>) -> i64 {
        match self {
            Precision::Nanoseconds => time.timestamp_nanos_opt().unwrap_or(i64::MAX),
            Precision::Microseconds => time.timestamp_micros(),
            Precision::Milliseconds => time.timestamp_millis(),
            Precision::Seconds => time.timestamp(),
            Precision::Minutes => time.timestamp() / 60,
            Precision::Hours => time.timestamp() / 3600,
        }
    }
}

/// An unrecognized precision spelling.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid precision {0:?}, expected one of ns, us, ms, s, m, h")]
pub struct InvalidPrecision(pub String);

impl FromStr for Precision {
    type Err = InvalidPrecision;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" => Ok(Precision::Nanoseconds),
            // "u" is the sink's own v1 spelling; accept both.
            "us" | "u" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(InvalidPrecision(other.to_string())),
        }
    }
}

/// One time-series point bound for the sink.
///
/// Invariants: `fields` is non-empty, tag values are strings, field values
/// are the four scalar types. Both maps iterate in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Target measurement name.
    pub measurement: String,
    /// Indexed tag columns.
    pub tags: BTreeMap<String, String>,
    /// Value columns.
    pub fields: BTreeMap<String, FieldValue>,
    /// The point's time, UTC.
    pub time: DateTime<Utc>,
}

/// A buffer of points sharing target database, retention policy, and
/// precision: the unit of a sink write.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Target database.
    pub database: String,
    /// Retention policy; empty means the sink's default.
    pub retention_policy: String,
    /// Timestamp precision for every point in the batch.
    pub precision: Precision,
    /// Points in the order they were added.
    pub points: Vec<Point>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>, precision: Precision) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            precision,
            points: Vec::new(),
        }
    }

    /// Appends a point, preserving arrival order.
    pub fn add(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Number of buffered points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_parses_both_micro_spellings() {
        assert_eq!("ns".parse::<Precision>().unwrap(), Precision::Nanoseconds);
        assert_eq!("us".parse::<Precision>().unwrap(), Precision::Microseconds);
        assert_eq!("u".parse::<Precision>().unwrap(), Precision::Microseconds);
        assert_eq!("s".parse::<Precision>().unwrap(), Precision::Seconds);
        assert!("sec".parse::<Precision>().is_err());
    }

    #[test]
    fn precision_encodes_in_its_unit() {
        let t = DateTime::from_timestamp(3600, 500_000_000).unwrap();
        assert_eq!(Precision::Seconds.encode(t), 3600);
        assert_eq!(Precision::Milliseconds.encode(t), 3_600_500);
        assert_eq!(Precision::Microseconds.encode(t), 3_600_500_000);
        assert_eq!(Precision::Nanoseconds.encode(t), 3_600_500_000_000);
        assert_eq!(Precision::Minutes.encode(t), 60);
        assert_eq!(Precision::Hours.encode(t), 1);
    }

    #[test]
    fn batch_preserves_insertion_order() {
        let mut batch = Batch::new("db", "", Precision::Seconds);
        for i in 0..3 {
            batch.add(Point {
                measurement: "m".into(),
                tags: BTreeMap::new(),
                fields: [("v".to_string(), FieldValue::Integer(i))].into(),
                time: DateTime::UNIX_EPOCH,
            });
        }
        assert_eq!(batch.len(), 3);
        let order: Vec<_> = batch
            .points
            .iter()
            .map(|p| p.fields["v"].clone())
            .collect();
        assert_eq!(
            order,
            vec![
                FieldValue::Integer(0),
                FieldValue::Integer(1),
                FieldValue::Integer(2)
            ]
        );
    }
}
