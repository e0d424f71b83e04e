//! Generic grouping and reduction over field records
//!
//! Query rows of different shapes (single station, all stations, whole
//! system) share one reducer: sort by the key fields, cut into contiguous
//! groups, reduce every other field with its `Reducer`.

use super::time_bucket::wall_clock_key;
use chrono::DateTime;
use chrono_tz::Tz;
use serde::ser::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Field name treated specially: grouped by its naive wall-clock rendering
pub const DATETIME_FIELD: &str = "datetime";

/// A single field value in a query record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Text(String),
    Time(DateTime<Tz>),
}

impl FieldValue {
    fn rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Int(_) => 1,
            FieldValue::Text(_) => 2,
            FieldValue::Time(_) => 3,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<&DateTime<Tz>> {
        match self {
            FieldValue::Time(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Option<u32>> for FieldValue {
    fn from(v: Option<u32>) -> Self {
        v.map_or(FieldValue::Null, |v| FieldValue::Int(i64::from(v)))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<DateTime<Tz>> for FieldValue {
    fn from(v: DateTime<Tz>) -> Self {
        FieldValue::Time(v)
    }
}

impl Eq for FieldValue {}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Time(a), FieldValue::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_none(),
            FieldValue::Int(v) => serializer.serialize_i64(*v),
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Time(t) => {
                serializer.serialize_str(&t.format("%Y-%m-%d %H:%M:%S%:z").to_string())
            }
        }
    }
}

/// One query row: field name -> value, serialized as a JSON object
pub type Record = BTreeMap<String, FieldValue>;

/// Per-field reduction applied to the values of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Sum of integer values, nulls skipped
    Sum,
    /// Integer mean truncated toward zero, nulls skipped, 0 when empty
    Mean,
    /// Value from the first record of the group
    First,
}

impl Reducer {
    pub fn apply(&self, values: &[&FieldValue]) -> FieldValue {
        match self {
            Reducer::Sum => FieldValue::Int(values.iter().filter_map(|v| v.as_int()).sum()),
            Reducer::Mean => {
                let ints: Vec<i64> = values.iter().filter_map(|v| v.as_int()).collect();
                if ints.is_empty() {
                    FieldValue::Int(0)
                } else {
                    FieldValue::Int(ints.iter().sum::<i64>() / ints.len() as i64)
                }
            }
            Reducer::First => values.first().map_or(FieldValue::Null, |v| (*v).clone()),
        }
    }
}

/// Key component for one record; `datetime` keys use the wall-clock string
fn key_value(record: &Record, field: &str) -> FieldValue {
    match record.get(field) {
        Some(FieldValue::Time(t)) if field == DATETIME_FIELD => FieldValue::Text(wall_clock_key(t)),
        Some(v) => v.clone(),
        None => FieldValue::Null,
    }
}

/// Group records by `key_fields` and reduce the remaining fields
///
/// - Records are sorted by their key tuple and split into contiguous groups.
/// - Each output record holds the key fields (taken from the group's first
///   record) plus every reducer whose field is present in the first record.
/// - A `datetime` key compares by its naive local rendering; the emitted
///   `datetime` value is the first record's aware datetime.
pub fn group_by(records: Vec<Record>, key_fields: &[&str], reducers: &[(&str, Reducer)]) -> Vec<Record> {
    let mut keyed: Vec<(Vec<FieldValue>, Record)> = records
        .into_iter()
        .map(|r| {
            let key = key_fields.iter().map(|f| key_value(&r, f)).collect();
            (key, r)
        })
        .collect();

    // stable sort keeps input order inside a group, so `First` is deterministic
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    let mut start = 0;
    while start < keyed.len() {
        let mut end = start + 1;
        while end < keyed.len() && keyed[end].0 == keyed[start].0 {
            end += 1;
        }

        let group = &keyed[start..end];
        let first = &group[0].1;
        let mut row = Record::new();

        for field in key_fields {
            row.insert(
                field.to_string(),
                first.get(*field).cloned().unwrap_or(FieldValue::Null),
            );
        }

        for (field, reducer) in reducers {
            if key_fields.contains(field) || !first.contains_key(*field) {
                continue;
            }
            let values: Vec<&FieldValue> = group.iter().filter_map(|(_, r)| r.get(*field)).collect();
            row.insert(field.to_string(), reducer.apply(&values));
        }

        out.push(row);
        start = end;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use chrono_tz::America::New_York;

    fn record(fields: &[(&str, FieldValue)]) -> Record {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_mean_truncates_and_handles_empty() {
        let three = FieldValue::Int(3);
        let four = FieldValue::Int(4);
        assert_eq!(Reducer::Mean.apply(&[&three, &four]), FieldValue::Int(3));
        assert_eq!(Reducer::Mean.apply(&[]), FieldValue::Int(0));
        assert_eq!(Reducer::Mean.apply(&[&FieldValue::Null]), FieldValue::Int(0));
    }

    #[test]
    fn test_sum_skips_nulls() {
        let values = [FieldValue::Int(2), FieldValue::Null, FieldValue::Int(5)];
        let refs: Vec<&FieldValue> = values.iter().collect();
        assert_eq!(Reducer::Sum.apply(&refs), FieldValue::Int(7));
    }

    #[test]
    fn test_first_takes_first_record() {
        let values = [FieldValue::from("Main St"), FieldValue::from("Other")];
        let refs: Vec<&FieldValue> = values.iter().collect();
        assert_eq!(Reducer::First.apply(&refs), FieldValue::from("Main St"));
    }

    #[test]
    fn test_group_by_multiple_keys() {
        let records = vec![
            record(&[("station_id", "B".into()), ("day", 1u32.into()), ("trips", 4u32.into())]),
            record(&[("station_id", "A".into()), ("day", 1u32.into()), ("trips", 1u32.into())]),
            record(&[("station_id", "A".into()), ("day", 1u32.into()), ("trips", 2u32.into())]),
            record(&[("station_id", "A".into()), ("day", 2u32.into()), ("trips", 7u32.into())]),
        ];

        let out = group_by(records, &["station_id", "day"], &[("trips", Reducer::Sum)]);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["station_id"], FieldValue::from("A"));
        assert_eq!(out[0]["trips"], FieldValue::Int(3));
        assert_eq!(out[1]["trips"], FieldValue::Int(7));
        assert_eq!(out[2]["station_id"], FieldValue::from("B"));
    }

    #[test]
    fn test_reducer_for_missing_field_is_skipped() {
        let records = vec![record(&[("k", 1u32.into()), ("trips", 1u32.into())])];
        let out = group_by(records, &["k"], &[("trips", Reducer::Sum), ("station", Reducer::First)]);
        assert!(!out[0].contains_key("station"));
    }

    #[test]
    fn test_datetime_groups_by_wall_clock_across_fall_back() {
        // 01:00 EDT and 01:00 EST render to the same local hour
        let edt = New_York.from_utc_datetime(&Utc.with_ymd_and_hms(2023, 11, 5, 5, 0, 0).unwrap().naive_utc());
        let est = New_York.from_utc_datetime(&Utc.with_ymd_and_hms(2023, 11, 5, 6, 0, 0).unwrap().naive_utc());

        let records = vec![
            record(&[(DATETIME_FIELD, edt.into()), ("trips", 2u32.into())]),
            record(&[(DATETIME_FIELD, est.into()), ("trips", 3u32.into())]),
        ];

        let out = group_by(records, &[DATETIME_FIELD], &[("trips", Reducer::Sum)]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["trips"], FieldValue::Int(5));
        assert_eq!(out[0][DATETIME_FIELD], FieldValue::Time(edt));
    }

    #[test]
    fn test_serialize_record() {
        let t = New_York.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let r = record(&[
            (DATETIME_FIELD, t.into()),
            ("station", "Main St".into()),
            ("num_docks_available", FieldValue::Null),
        ]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["datetime"], "2024-07-01 09:00:00-04:00");
        assert_eq!(json["station"], "Main St");
        assert!(json["num_docks_available"].is_null());
    }
}
