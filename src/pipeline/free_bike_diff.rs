//! Free-floating bike differencing
//!
//! Free bikes have no dock to count against, so trips are inferred from the
//! set of bike ids visible in consecutive polls:
//! - bikes present at `t_i` but gone at `t_{i+1}` started a trip
//! - bikes absent at `t_i` but present at `t_{i+1}` ended one
//!
//! This is lossier than station differencing: a trip that starts and ends
//! between two polls is invisible.

use super::types::{DerivedEventRow, RawFreeBikeSnapshot, FREE_BIKES_STATION_ID};
use crate::aggregator_core::time_bucket::truncate_to_hour;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Compute hourly free-bike trips for the whole system
///
/// Every row is labelled with the `free_bikes` sentinel station and carries the
/// largest fleet seen in any single poll as `num_bikes_available`.
/// Fewer than two distinct poll times yields no rows.
pub fn make_free_bike_trips(snapshots: &[RawFreeBikeSnapshot]) -> Vec<DerivedEventRow> {
    let mut active: BTreeMap<DateTime<Utc>, HashSet<&str>> = BTreeMap::new();
    for snapshot in snapshots {
        active
            .entry(snapshot.datetime)
            .or_default()
            .insert(snapshot.bike_id.as_str());
    }

    if active.len() < 2 {
        return Vec::new();
    }

    let fleet_size = active.values().map(HashSet::len).max().unwrap_or(0) as u32;

    let polls: Vec<(&DateTime<Utc>, &HashSet<&str>)> = active.iter().collect();
    let mut buckets: BTreeMap<DateTime<Utc>, (u32, u32)> = BTreeMap::new();

    for pair in polls.windows(2) {
        let (t, before) = pair[0];
        let (_, after) = pair[1];

        let started = before.difference(after).count() as u32;
        let ended = after.difference(before).count() as u32;

        let entry = buckets.entry(truncate_to_hour(*t)).or_insert((0, 0));
        entry.0 += started;
        entry.1 += ended;
    }

    log::debug!(
        "Free bikes: {} polls, fleet size {}, {} hourly buckets",
        active.len(),
        fleet_size,
        buckets.len()
    );

    buckets
        .into_iter()
        .map(|(datetime, (trips, returns))| DerivedEventRow {
            datetime,
            station_id: FREE_BIKES_STATION_ID.to_string(),
            trips,
            returns,
            num_bikes_available: Some(fleet_size),
            num_docks_available: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn poll(h: u32, m: u32, bikes: &[&str]) -> Vec<RawFreeBikeSnapshot> {
        bikes
            .iter()
            .map(|id| RawFreeBikeSnapshot {
                datetime: Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap(),
                bike_id: id.to_string(),
                lat: 49.28,
                lon: -123.12,
            })
            .collect()
    }

    #[test]
    fn test_single_poll_yields_nothing() {
        assert!(make_free_bike_trips(&poll(10, 0, &["1", "2"])).is_empty());
        assert!(make_free_bike_trips(&[]).is_empty());
    }

    #[test]
    fn test_set_difference_counts() {
        let mut snapshots = poll(10, 0, &["A", "B", "C"]);
        snapshots.extend(poll(10, 20, &["B", "C", "D"]));

        let rows = make_free_bike_trips(&snapshots);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trips, 1);
        assert_eq!(rows[0].returns, 1);
        assert_eq!(rows[0].station_id, FREE_BIKES_STATION_ID);
        assert_eq!(rows[0].num_bikes_available, Some(3));
        assert_eq!(rows[0].num_docks_available, None);
    }

    #[test]
    fn test_fleet_size_gauge_is_max_poll() {
        let mut snapshots = poll(10, 0, &["1", "2"]);
        snapshots.extend(poll(10, 20, &["2", "3"]));

        let rows = make_free_bike_trips(&snapshots);

        assert_eq!((rows[0].trips, rows[0].returns), (1, 1));
        assert_eq!(rows[0].num_bikes_available, Some(2));
    }

    #[test]
    fn test_hourly_buckets_use_earlier_poll() {
        let mut snapshots = poll(10, 40, &["1", "2", "3", "4"]);
        snapshots.extend(poll(11, 0, &["1", "2"]));
        snapshots.extend(poll(11, 20, &["1", "2", "5"]));

        let rows = make_free_bike_trips(&snapshots);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].datetime, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert_eq!((rows[0].trips, rows[0].returns), (2, 0));
        assert_eq!(rows[1].datetime, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
        assert_eq!((rows[1].trips, rows[1].returns), (0, 1));
        assert!(rows.iter().all(|r| r.num_bikes_available == Some(4)));
    }

    #[test]
    fn test_polls_are_ordered_by_time_not_input_order() {
        let mut snapshots = poll(10, 30, &["B"]);
        snapshots.extend(poll(10, 0, &["A"]));

        let rows = make_free_bike_trips(&snapshots);

        // A departed, B arrived
        assert_eq!((rows[0].trips, rows[0].returns), (1, 1));
    }
}
