//! Core data types for the differencing pipeline
//!
//! Each stage of the pipeline has its own row type:
//! - `RawStationSnapshot` / `RawFreeBikeSnapshot` - polled feed rows (raw store)
//! - `DerivedEventRow` - hourly trips/returns computed from consecutive snapshots
//! - `Measurement` - durable per-(hour, station) running totals
//!
//! `Station` and `System` mirror the persisted identity tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved station identifier for the free-floating fleet of a system
pub const FREE_BIKES_STATION_ID: &str = "free_bikes";

/// One station observation from a `station_status` poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStationSnapshot {
    pub datetime: DateTime<Utc>,
    pub station_id: String,
    pub num_bikes_available: u32,
    pub num_docks_available: u32,
    pub is_renting: bool,
}

/// One free-floating bike observation from a `free_bike_status` poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFreeBikeSnapshot {
    pub datetime: DateTime<Utc>,
    pub bike_id: String,
    pub lat: f64,
    pub lon: f64,
}

/// Hour-bucketed trips/returns inferred from snapshot differences
///
/// Never persisted directly; consumed by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedEventRow {
    /// Hour-floored UTC bucket
    pub datetime: DateTime<Utc>,
    /// External station id, or `FREE_BIKES_STATION_ID`
    pub station_id: String,
    pub trips: u32,
    pub returns: u32,
    pub num_bikes_available: Option<u32>,
    pub num_docks_available: Option<u32>,
}

/// Durable measurement row, unique per `(datetime, station)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Measurement {
    /// Primary key (None until inserted)
    pub id: Option<i64>,
    pub datetime: DateTime<Utc>,
    /// Primary key of the owning `Station` row
    pub station: i64,
    pub trips: u32,
    pub returns: u32,
    pub num_bikes_available: Option<u32>,
    pub num_docks_available: Option<u32>,
}

impl Measurement {
    /// Build a fresh (not yet stored) measurement from a derived row
    pub fn from_derived(row: &DerivedEventRow, station: i64) -> Self {
        Self {
            id: None,
            datetime: row.datetime,
            station,
            trips: row.trips,
            returns: row.returns,
            num_bikes_available: row.num_bikes_available,
            num_docks_available: row.num_docks_available,
        }
    }

    /// Fold another derived row for the same key into this measurement
    ///
    /// Counts accumulate. Gauges are point-in-time values: the incoming row
    /// replaces them when it carries one.
    pub fn accumulate(&mut self, row: &DerivedEventRow) {
        self.trips += row.trips;
        self.returns += row.returns;
        if row.num_bikes_available.is_some() {
            self.num_bikes_available = row.num_bikes_available;
        }
        if row.num_docks_available.is_some() {
            self.num_docks_available = row.num_docks_available;
        }
    }
}

/// Summary of one merge cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    /// Derived rows fed into the merge (free-bike + station)
    pub rows_derived: usize,
    pub created: usize,
    pub updated: usize,
    pub trips: u64,
    pub returns: u64,
}

/// Measurement joined with its station, as returned by range queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRow {
    pub datetime: DateTime<Utc>,
    /// External station id
    pub station_id: String,
    /// Station display name
    pub station: String,
    pub trips: u32,
    pub returns: u32,
    pub num_bikes_available: Option<u32>,
    pub num_docks_available: Option<u32>,
}

/// Which stations a range query covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationFilter {
    /// One external station id
    One(String),
    /// Every real station, sentinel excluded
    AllStations,
    /// Only the `free_bikes` sentinel
    FreeBikesOnly,
    Everything,
}

/// Station descriptor from a `station_information` feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub station_id: String,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Persisted station identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub id: i64,
    pub station_id: String,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub created_date: DateTime<Utc>,
    pub system_id: i64,
}

impl Station {
    pub fn is_free_bikes(&self) -> bool {
        self.station_id == FREE_BIKES_STATION_ID
    }
}

/// Persisted bike-share system
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct System {
    pub id: i64,
    pub name: String,
    /// IANA timezone name, e.g. `America/Toronto`
    pub tz: String,
    /// GBFS auto-discovery URL (`gbfs.json`)
    pub url: String,
    pub is_tracking: bool,
    pub tracking_start: Option<DateTime<Utc>>,
    pub tracking_end: Option<DateTime<Utc>>,
}

impl System {
    /// Parse the system's timezone
    pub fn timezone(&self) -> Option<chrono_tz::Tz> {
        self.tz.parse().ok()
    }
}

/// Raw snapshot tables kept per system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawTable {
    Stations,
    FreeBikes,
}

impl RawTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawTable::Stations => "stations",
            RawTable::FreeBikes => "bikes",
        }
    }

    /// Physical table name, e.g. `mobi_stations_raw`
    pub fn table_name(&self, system_name: &str) -> String {
        format!("{}_{}_raw", system_name, self.as_str())
    }

    pub fn all() -> [RawTable; 2] {
        [RawTable::Stations, RawTable::FreeBikes]
    }
}

/// System names end up in raw table names, so only identifier characters are allowed
pub fn is_valid_system_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn derived(trips: u32, returns: u32, bikes: Option<u32>) -> DerivedEventRow {
        DerivedEventRow {
            datetime: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            station_id: "7001".to_string(),
            trips,
            returns,
            num_bikes_available: bikes,
            num_docks_available: None,
        }
    }

    #[test]
    fn test_accumulate_adds_counts_and_replaces_gauges() {
        let mut m = Measurement::from_derived(&derived(2, 1, Some(10)), 1);
        m.num_docks_available = Some(4);

        m.accumulate(&derived(3, 0, Some(7)));

        assert_eq!(m.trips, 5);
        assert_eq!(m.returns, 1);
        assert_eq!(m.num_bikes_available, Some(7));
        // Incoming row had no dock gauge, existing one is kept
        assert_eq!(m.num_docks_available, Some(4));
    }

    #[test]
    fn test_raw_table_names() {
        assert_eq!(RawTable::Stations.table_name("mobi"), "mobi_stations_raw");
        assert_eq!(RawTable::FreeBikes.table_name("mobi"), "mobi_bikes_raw");
    }

    #[test]
    fn test_system_name_validation() {
        assert!(is_valid_system_name("bike_share_toronto"));
        assert!(!is_valid_system_name(""));
        assert!(!is_valid_system_name("mobi; DROP TABLE station"));
    }
}
