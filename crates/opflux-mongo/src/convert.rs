//! BSON to core value conversion.

use chrono::DateTime;
use mongodb::bson::{Bson, Document, Timestamp};

use opflux_core::event::ReplTimestamp;
use opflux_core::value::{Value, ValueMap};

/// A BSON timestamp as a replication timestamp.
#[must_use]
pub fn repl_from_bson(ts: Timestamp) -> ReplTimestamp {
    ReplTimestamp::new(ts.time, ts.increment)
}

/// A replication timestamp as a BSON timestamp.
#[must_use]
pub fn repl_to_bson(ts: ReplTimestamp) -> Timestamp {
    Timestamp {
        time: ts.seconds(),
        increment: ts.ordinal(),
    }
}

/// Maps one BSON value into the core value space. 32-bit integers widen to
/// 64 bits; types with no counterpart become [`Value::Other`] carrying the
/// source type name for diagnostics.
#[must_use]
pub fn value_from_bson(bson: &Bson) -> Value {
    match bson {
        Bson::String(s) => Value::String(s.clone()),
        Bson::Int32(i) => Value::Int(i64::from(*i)),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(f) => Value::Float(*f),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::DateTime(dt) => Value::Time(
            DateTime::from_timestamp_millis(dt.timestamp_millis())
                .unwrap_or(DateTime::UNIX_EPOCH),
        ),
        Bson::Timestamp(ts) => Value::Stamp(repl_from_bson(*ts)),
        Bson::Document(doc) => Value::Map(document_values(doc)),
        Bson::Array(items) => Value::Array(items.iter().map(value_from_bson).collect()),
        Bson::Null => Value::Null,
        Bson::ObjectId(_) => Value::Other("objectId"),
        Bson::Binary(_) => Value::Other("binary"),
        Bson::Decimal128(_) => Value::Other("decimal128"),
        Bson::RegularExpression(_) => Value::Other("regex"),
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => Value::Other("javascript"),
        Bson::Symbol(_) => Value::Other("symbol"),
        Bson::Undefined => Value::Other("undefined"),
        Bson::MaxKey => Value::Other("maxKey"),
        Bson::MinKey => Value::Other("minKey"),
        Bson::DbPointer(_) => Value::Other("dbPointer"),
    }
}

/// Maps a whole BSON document into a core value map.
#[must_use]
pub fn document_values(doc: &Document) -> ValueMap {
    doc.iter()
        .map(|(key, value)| (key.clone(), value_from_bson(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn timestamps_round_trip() {
        let ts = ReplTimestamp::new(1_600_000_000, 7);
        assert_eq!(repl_from_bson(repl_to_bson(ts)), ts);

        let bson_ts = Timestamp {
            time: 0x5F00_0000,
            increment: 1,
        };
        assert_eq!(
            repl_from_bson(bson_ts).raw(),
            0x5F00_0000_0000_0001
        );
    }

    #[test]
    fn scalars_map_directly() {
        assert_eq!(
            value_from_bson(&Bson::String("x".into())),
            Value::String("x".into())
        );
        assert_eq!(value_from_bson(&Bson::Int64(9)), Value::Int(9));
        assert_eq!(value_from_bson(&Bson::Double(2.5)), Value::Float(2.5));
        assert_eq!(value_from_bson(&Bson::Boolean(true)), Value::Bool(true));
        assert_eq!(value_from_bson(&Bson::Null), Value::Null);
    }

    #[test]
    fn int32_widens_to_int64() {
        assert_eq!(value_from_bson(&Bson::Int32(3)), Value::Int(3));
    }

    #[test]
    fn datetimes_become_utc_wall_clock() {
        let dt = mongodb::bson::DateTime::from_millis(1_704_067_200_000);
        let Value::Time(t) = value_from_bson(&Bson::DateTime(dt)) else {
            panic!("expected time");
        };
        assert_eq!(t.timestamp(), 1_704_067_200);
    }

    #[test]
    fn unsupported_types_carry_their_name() {
        let v = value_from_bson(&Bson::ObjectId(ObjectId::new()));
        assert_eq!(v, Value::Other("objectId"));
        assert_eq!(v.type_name(), "objectId");
    }

    #[test]
    fn documents_map_recursively() {
        let doc = doc! {
            "host": "h1",
            "cpu": { "user": 0.5, "cores": 8_i64 },
            "samples": [1_i64, 2_i64],
        };
        let values = document_values(&doc);
        assert_eq!(values["host"], Value::String("h1".into()));
        let Value::Map(cpu) = &values["cpu"] else {
            panic!("expected nested map");
        };
        assert_eq!(cpu["user"], Value::Float(0.5));
        assert_eq!(cpu["cores"], Value::Int(8));
        assert!(matches!(values["samples"], Value::Array(_)));
    }
}
