//! Activity request validation
//!
//! Turns raw query parameters into a typed request. `start`/`end` are
//! `YYYYMMDDHH` hours on the system's local wall clock.

use super::time_bucket::{local_hour_end_to_utc, local_hour_to_utc, Frequency};
use crate::pipeline::engine::TrackerContext;
use crate::pipeline::error::StoreError;
use crate::pipeline::types::{System, FREE_BIKES_STATION_ID};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Station parameter value selecting one row per bucket per station
pub const ALL_STATIONS: &str = "all";

#[derive(Debug)]
pub enum QueryError {
    MissingParameter(&'static str),
    /// Not a `YYYYMMDDHH` hour, or an hour skipped by DST
    InvalidTime(String),
    InvalidRange { start: String, end: String },
    InvalidFrequency(String),
    UnknownSystem(String),
    UnknownStation(String),
    Store(StoreError),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        QueryError::Store(err)
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::MissingParameter(p) => write!(f, "Missing required parameter {}", p),
            QueryError::InvalidTime(t) => write!(f, "Invalid time '{}' (expected YYYYMMDDHH)", t),
            QueryError::InvalidRange { start, end } => write!(f, "Start {} is after end {}", start, end),
            QueryError::InvalidFrequency(freq) => {
                write!(f, "Invalid frequency '{}' (expected one of t, h, d, m, y)", freq)
            }
            QueryError::UnknownSystem(s) => write!(f, "Unknown system '{}'", s),
            QueryError::UnknownStation(s) => write!(f, "Unknown station '{}'", s),
            QueryError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for QueryError {}

impl QueryError {
    /// Error body returned instead of data: `{"error": "..."}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

/// Which activity shape was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityScope {
    /// Whole system: station trips joined with free-bike trips
    System,
    AllStations,
    Station(String),
}

#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub system: System,
    pub tz: Tz,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub frequency: Frequency,
    pub scope: ActivityScope,
}

impl ActivityRequest {
    /// Validate raw parameters against the registry
    ///
    /// `frequency` defaults to hourly. `station` is absent for the whole
    /// system, `"all"` for every station, otherwise a station id.
    pub fn parse(
        ctx: &TrackerContext,
        system: &str,
        start: &str,
        end: &str,
        frequency: Option<&str>,
        station: Option<&str>,
    ) -> Result<Self, QueryError> {
        let frequency_str = frequency.unwrap_or("h");
        let frequency = Frequency::from_str(frequency_str)
            .ok_or_else(|| QueryError::InvalidFrequency(frequency_str.to_string()))?;

        let system = ctx
            .systems
            .get_system(system)?
            .ok_or_else(|| QueryError::UnknownSystem(system.to_string()))?;
        let tz = system.timezone().ok_or_else(|| {
            QueryError::Store(StoreError::InvalidData(format!(
                "system {} has invalid timezone {}",
                system.name, system.tz
            )))
        })?;

        let start_utc = local_hour_to_utc(start, tz).ok_or_else(|| QueryError::InvalidTime(start.to_string()))?;
        let end_utc = local_hour_end_to_utc(end, tz).ok_or_else(|| QueryError::InvalidTime(end.to_string()))?;
        if start_utc > end_utc {
            return Err(QueryError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let scope = match station {
            None => ActivityScope::System,
            Some(ALL_STATIONS) => ActivityScope::AllStations,
            Some(FREE_BIKES_STATION_ID) => return Err(QueryError::UnknownStation(FREE_BIKES_STATION_ID.to_string())),
            Some(id) => {
                if ctx.stations.resolve_station(&system.name, id)?.is_none() {
                    return Err(QueryError::UnknownStation(id.to_string()));
                }
                ActivityScope::Station(id.to_string())
            }
        };

        Ok(Self {
            system,
            tz,
            start: start_utc,
            end: end_utc,
            frequency,
            scope,
        })
    }
}
