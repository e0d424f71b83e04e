//! Station snapshot differencing
//!
//! Turns a polling window of station snapshots into hourly trips/returns per
//! station. A drop in `num_bikes_available` between two consecutive polls
//! counts as trips, a rise counts as returns. A station missing from a poll
//! contributes no delta on either side of that poll.
//!
//! ```text
//! t0: 10 bikes ─┐ delta +2 → 2 trips
//! t1:  8 bikes ─┤ delta -1 → 1 return
//! t2:  9 bikes ─┘ delta  0 (last observation)
//! ```

use super::types::{DerivedEventRow, RawStationSnapshot};
use crate::aggregator_core::time_bucket::truncate_to_hour;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

/// Per-station time series of bike counts plus window-wide gauges
#[derive(Debug, Default)]
struct StationSeries {
    /// snapshot time -> (sum of bike counts, observations at that time)
    points: BTreeMap<DateTime<Utc>, (u64, u64)>,
    max_bikes: u32,
    max_docks: u32,
}

impl StationSeries {
    fn push(&mut self, snapshot: &RawStationSnapshot) {
        let entry = self.points.entry(snapshot.datetime).or_insert((0, 0));
        entry.0 += u64::from(snapshot.num_bikes_available);
        entry.1 += 1;
        self.max_bikes = self.max_bikes.max(snapshot.num_bikes_available);
        self.max_docks = self.max_docks.max(snapshot.num_docks_available);
    }

    /// Mean bike count observed at `t`, if the station reported in that poll
    fn value_at(&self, t: &DateTime<Utc>) -> Option<f64> {
        self.points.get(t).map(|(sum, n)| *sum as f64 / *n as f64)
    }

    /// Backward differences against the next poll of the whole window
    ///
    /// `value[t] - value[next poll]`, truncated toward zero. The delta is zero
    /// when the station is missing from the next poll or `t` is the last poll,
    /// so a gap in a station's reports is never bridged.
    fn backward_deltas(&self, polls: &BTreeSet<DateTime<Utc>>) -> Vec<(DateTime<Utc>, i64)> {
        self.points
            .keys()
            .map(|t| {
                let next = polls.range((Excluded(*t), Unbounded)).next();
                let delta = match (self.value_at(t), next.and_then(|n| self.value_at(n))) {
                    (Some(v), Some(next)) => (v - next).trunc() as i64,
                    _ => 0,
                };
                (*t, delta)
            })
            .collect()
    }
}

/// Split a delta into (trips, returns); at most one side is non-zero
pub fn split_delta(delta: i64) -> (u32, u32) {
    if delta > 0 {
        (delta as u32, 0)
    } else {
        (0, delta.unsigned_abs() as u32)
    }
}

/// Compute hourly station trips from raw station snapshots
///
/// Returns one row per (hour, station_id), sorted by hour then station.
/// Gauges are the maximum bikes/docks observed for the station across the
/// whole input window. Stations with a single observation produce no rows.
pub fn make_station_trips(snapshots: &[RawStationSnapshot]) -> Vec<DerivedEventRow> {
    if snapshots.is_empty() {
        return Vec::new();
    }

    let mut by_station: BTreeMap<&str, StationSeries> = BTreeMap::new();
    for snapshot in snapshots {
        by_station
            .entry(snapshot.station_id.as_str())
            .or_default()
            .push(snapshot);
    }

    // (hour, station_id) -> (trips, returns, max bikes, max docks)
    let mut buckets: BTreeMap<(DateTime<Utc>, &str), (u32, u32, u32, u32)> = BTreeMap::new();

    let polls: BTreeSet<DateTime<Utc>> = snapshots.iter().map(|s| s.datetime).collect();

    for (&station_id, series) in &by_station {
        if series.points.len() < 2 {
            log::debug!("Station {} has a single observation, no deltas", station_id);
            continue;
        }

        for (t, delta) in series.backward_deltas(&polls) {
            let (trips, returns) = split_delta(delta);
            let entry = buckets
                .entry((truncate_to_hour(t), station_id))
                .or_insert((0, 0, series.max_bikes, series.max_docks));
            entry.0 += trips;
            entry.1 += returns;
        }
    }

    buckets
        .into_iter()
        .map(
            |((datetime, station_id), (trips, returns, bikes, docks))| DerivedEventRow {
                datetime,
                station_id: station_id.to_string(),
                trips,
                returns,
                num_bikes_available: Some(bikes),
                num_docks_available: Some(docks),
            },
        )
        .collect()
}
