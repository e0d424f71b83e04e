//! Activity queries over stored measurements
//!
//! ```text
//! MeasurementStore::range_query (UTC, hour-floored)
//!     ↓
//! to_local_time → floor_to_frequency (or Instant collapse)
//!     ↓
//! group_by (sum counts, mean gauges, first labels)
//! ```

use super::group::{group_by, FieldValue, Record, Reducer, DATETIME_FIELD};
use super::request::{ActivityRequest, ActivityScope, QueryError};
use super::time_bucket::{floor_to_frequency, to_local_time, wall_clock_key, Frequency};
use crate::pipeline::engine::TrackerContext;
use crate::pipeline::types::{MeasurementRow, StationFilter, System};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;

pub const FREE_BIKE_TRIPS_FIELD: &str = "free_bike_trips";

const MEASUREMENT_REDUCERS: [(&str, Reducer); 6] = [
    ("trips", Reducer::Sum),
    ("returns", Reducer::Sum),
    ("num_bikes_available", Reducer::Mean),
    ("num_docks_available", Reducer::Mean),
    ("station", Reducer::First),
    ("station_id", Reducer::First),
];

fn to_record(row: &MeasurementRow, local: DateTime<Tz>) -> Record {
    let mut record = Record::new();
    record.insert(DATETIME_FIELD.to_string(), FieldValue::from(local));
    record.insert("station_id".to_string(), FieldValue::from(row.station_id.as_str()));
    record.insert("station".to_string(), FieldValue::from(row.station.as_str()));
    record.insert("trips".to_string(), FieldValue::from(row.trips));
    record.insert("returns".to_string(), FieldValue::from(row.returns));
    record.insert("num_bikes_available".to_string(), FieldValue::from(row.num_bikes_available));
    record.insert("num_docks_available".to_string(), FieldValue::from(row.num_docks_available));
    record
}

fn aggregate_with_anchor(
    rows: &[MeasurementRow],
    key_fields: &[&str],
    frequency: Frequency,
    tz: Tz,
    anchor: Option<DateTime<Utc>>,
) -> Vec<Record> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let instant = to_local_time(anchor.unwrap_or(first.datetime), tz);

    let records = rows
        .iter()
        .map(|row| {
            let local = match frequency {
                Frequency::Instant => instant,
                _ => floor_to_frequency(to_local_time(row.datetime, tz), frequency),
            };
            to_record(row, local)
        })
        .collect();

    group_by(records, key_fields, &MEASUREMENT_REDUCERS)
}

/// Localize, bucket and reduce measurement rows
///
/// With `Frequency::Instant` every row takes the first row's local time, so
/// the whole range becomes one bucket.
pub fn aggregate(rows: &[MeasurementRow], key_fields: &[&str], frequency: Frequency, tz: Tz) -> Vec<Record> {
    aggregate_with_anchor(rows, key_fields, frequency, tz, None)
}

/// One record per bucket for a single station
pub fn station_activity(
    ctx: &TrackerContext,
    req: &ActivityRequest,
    station_id: &str,
) -> Result<Vec<Record>, QueryError> {
    let rows = ctx.measurements.range_query(
        &req.system.name,
        req.start,
        req.end,
        &StationFilter::One(station_id.to_string()),
    )?;
    Ok(aggregate(&rows, &[DATETIME_FIELD], req.frequency, req.tz))
}

/// One record per bucket per station, free bikes excluded
pub fn all_stations_activity(ctx: &TrackerContext, req: &ActivityRequest) -> Result<Vec<Record>, QueryError> {
    let rows = ctx
        .measurements
        .range_query(&req.system.name, req.start, req.end, &StationFilter::AllStations)?;
    Ok(aggregate(&rows, &[DATETIME_FIELD, "station_id"], req.frequency, req.tz))
}

/// System totals per bucket: station trips/returns plus free-bike trips
///
/// Buckets come from the station series. A bucket with no free-bike
/// measurement reports `free_bike_trips: 0`. For `Instant`, both series
/// collapse onto the earliest row of either.
pub fn system_activity(ctx: &TrackerContext, req: &ActivityRequest) -> Result<Vec<Record>, QueryError> {
    let station_rows = ctx
        .measurements
        .range_query(&req.system.name, req.start, req.end, &StationFilter::AllStations)?;
    let bike_rows = ctx
        .measurements
        .range_query(&req.system.name, req.start, req.end, &StationFilter::FreeBikesOnly)?;

    let anchor = station_rows
        .first()
        .into_iter()
        .chain(bike_rows.first())
        .map(|r| r.datetime)
        .min();

    let stations = aggregate_with_anchor(&station_rows, &[DATETIME_FIELD], req.frequency, req.tz, anchor);
    let bikes = aggregate_with_anchor(&bike_rows, &[DATETIME_FIELD], req.frequency, req.tz, anchor);

    let bike_trips: HashMap<String, FieldValue> = bikes
        .into_iter()
        .filter_map(|mut r| {
            let key = r.get(DATETIME_FIELD)?.as_time().map(wall_clock_key)?;
            Some((key, r.remove("trips").unwrap_or(FieldValue::Int(0))))
        })
        .collect();

    let out = stations
        .into_iter()
        .map(|r| {
            let mut row = Record::new();
            let key = r.get(DATETIME_FIELD).and_then(|t| t.as_time()).map(wall_clock_key);
            for field in [DATETIME_FIELD, "trips", "returns"] {
                row.insert(field.to_string(), r.get(field).cloned().unwrap_or(FieldValue::Int(0)));
            }
            let free = key
                .and_then(|k| bike_trips.get(&k).cloned())
                .unwrap_or(FieldValue::Int(0));
            row.insert(FREE_BIKE_TRIPS_FIELD.to_string(), free);
            row
        })
        .collect();

    Ok(out)
}

/// Run the query selected by the request's scope
pub fn run_activity(ctx: &TrackerContext, req: &ActivityRequest) -> Result<Vec<Record>, QueryError> {
    match &req.scope {
        ActivityScope::System => system_activity(ctx, req),
        ActivityScope::AllStations => all_stations_activity(ctx, req),
        ActivityScope::Station(id) => station_activity(ctx, req, id),
    }
}

/// Station listing entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationListing {
    pub station_id: String,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub created_date: DateTime<Utc>,
    pub system: String,
}

pub fn list_systems(ctx: &TrackerContext) -> Result<Vec<System>, QueryError> {
    Ok(ctx.systems.list_systems()?)
}

/// Stations of a system, latest row per station id, free bikes excluded
pub fn list_stations(ctx: &TrackerContext, system: &str) -> Result<Vec<StationListing>, QueryError> {
    if ctx.systems.get_system(system)?.is_none() {
        return Err(QueryError::UnknownSystem(system.to_string()));
    }

    // rows come ordered by (station_id, created_date); later rows win
    let mut latest: Vec<StationListing> = Vec::new();
    for station in ctx.stations.list_stations(system)? {
        if station.is_free_bikes() {
            continue;
        }
        let listing = StationListing {
            station_id: station.station_id,
            name: station.name,
            lat: station.lat,
            lon: station.lon,
            created_date: station.created_date,
            system: system.to_string(),
        };
        match latest.last_mut() {
            Some(prev) if prev.station_id == listing.station_id => *prev = listing,
            _ => latest.push(listing),
        }
    }

    Ok(latest)
}
