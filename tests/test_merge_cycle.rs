//! End-to-end tests: registry → raw snapshots → merge cycles → activity queries
//!
//! Key integration points tested:
//! - Deltas spanning two merge cycles join through the retained snapshot
//! - Merged counts and gauges read back through the query path
//! - Free-bike trips land on the sentinel and join into system activity

#[cfg(test)]
mod merge_cycle_tests {
    use bikeflow::aggregator_core::{run_activity, ActivityRequest, FieldValue, Record};
    use bikeflow::config::TrackerConfig;
    use bikeflow::pipeline::engine::{run_merge_cycle, TrackerContext};
    use bikeflow::pipeline::types::{RawFreeBikeSnapshot, RawStationSnapshot, StationInfo};
    use bikeflow::systems::{add_system, merge_station_list, SystemDefinition};
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, h, m, 0).unwrap()
    }

    fn snap(h: u32, m: u32, bikes: u32) -> RawStationSnapshot {
        RawStationSnapshot {
            datetime: at(h, m),
            station_id: "7001".to_string(),
            num_bikes_available: bikes,
            num_docks_available: 20 - bikes,
            is_renting: true,
        }
    }

    fn bikes(h: u32, m: u32, ids: &[&str]) -> Vec<RawFreeBikeSnapshot> {
        ids.iter()
            .map(|id| RawFreeBikeSnapshot {
                datetime: at(h, m),
                bike_id: id.to_string(),
                lat: 43.65,
                lon: -79.38,
            })
            .collect()
    }

    fn setup() -> (TempDir, TrackerContext) {
        let dir = TempDir::new().unwrap();
        let config = TrackerConfig {
            db_path: dir.path().join("bikeflow.db").to_string_lossy().into_owned(),
            raw_db_path: dir.path().join("bikeflow-raw.db").to_string_lossy().into_owned(),
            schema_dir: SCHEMA_DIR.to_string(),
            ..TrackerConfig::default()
        };
        let ctx = TrackerContext::open(&config).unwrap();

        let def = SystemDefinition {
            name: "bike_share_toronto".to_string(),
            tz: "America/Toronto".to_string(),
            url: "https://tor.publicbikesystem.net/ube/gbfs/v1/".to_string(),
        };
        let system = add_system(&ctx, &def, at(0, 0)).unwrap();
        let info = StationInfo {
            station_id: "7001".to_string(),
            name: "Wellesley Station".to_string(),
            lat: Some(43.665),
            lon: Some(-79.383),
        };
        merge_station_list(&ctx, &system, &[info], at(0, 0)).unwrap();

        (dir, ctx)
    }

    fn int(r: &Record, field: &str) -> i64 {
        r.get(field).and_then(FieldValue::as_int).unwrap()
    }

    fn query(ctx: &TrackerContext, freq: &str, station: Option<&str>) -> Vec<Record> {
        // 10:00-11:00 EDT is 14:00-15:00 UTC
        let req = ActivityRequest::parse(ctx, "bike_share_toronto", "2024071510", "2024071511", Some(freq), station)
            .unwrap();
        run_activity(ctx, &req).unwrap()
    }

    #[test]
    fn test_two_cycles_accumulate_into_measurements() {
        let (_dir, ctx) = setup();

        ctx.raw
            .append_stations("bike_share_toronto", &[snap(14, 0, 10), snap(14, 20, 8), snap(14, 40, 9), snap(15, 0, 6)])
            .unwrap();
        let first = run_merge_cycle(&ctx, "bike_share_toronto").unwrap();
        assert_eq!((first.trips, first.returns), (5, 1));

        // 15:00 survives the trim and seeds the next cycle's first delta
        ctx.raw
            .append_stations("bike_share_toronto", &[snap(15, 20, 4), snap(15, 40, 7)])
            .unwrap();
        let second = run_merge_cycle(&ctx, "bike_share_toronto").unwrap();
        assert_eq!((second.trips, second.returns), (2, 3));
        assert_eq!(second.updated, 1);

        let hourly = query(&ctx, "h", Some("7001"));
        assert_eq!(hourly.len(), 2);
        assert_eq!((int(&hourly[0], "trips"), int(&hourly[0], "returns")), (5, 1));
        assert_eq!((int(&hourly[1], "trips"), int(&hourly[1], "returns")), (2, 3));
        assert_eq!(int(&hourly[1], "num_bikes_available"), 7);
        assert_eq!(hourly[0]["station"], FieldValue::Text("Wellesley Station".to_string()));

        let daily = query(&ctx, "d", Some("7001"));
        assert_eq!(daily.len(), 1);
        assert_eq!((int(&daily[0], "trips"), int(&daily[0], "returns")), (7, 4));
    }

    #[test]
    fn test_system_activity_joins_free_bike_trips() {
        let (_dir, ctx) = setup();

        ctx.raw
            .append_stations("bike_share_toronto", &[snap(14, 0, 10), snap(14, 30, 7), snap(15, 10, 7)])
            .unwrap();
        let mut polls = bikes(14, 0, &["a", "b", "c"]);
        polls.extend(bikes(14, 30, &["c"]));
        ctx.raw.append_free_bikes("bike_share_toronto", &polls).unwrap();

        run_merge_cycle(&ctx, "bike_share_toronto").unwrap();

        // both raw series are cut back to their latest poll
        assert_eq!(ctx.raw.read_free_bikes("bike_share_toronto").unwrap(), bikes(14, 30, &["c"]));
        assert_eq!(ctx.raw.read_stations("bike_share_toronto").unwrap(), vec![snap(15, 10, 7)]);

        let system = query(&ctx, "h", None);
        assert_eq!(system.len(), 2);
        assert_eq!(int(&system[0], "trips"), 3);
        assert_eq!(int(&system[0], "free_bike_trips"), 2);
        // no free-bike measurement at 15:00 UTC
        assert_eq!(int(&system[1], "trips"), 0);
        assert_eq!(int(&system[1], "free_bike_trips"), 0);

        let per_station = query(&ctx, "h", Some("all"));
        assert!(per_station
            .iter()
            .all(|r| r["station_id"] == FieldValue::Text("7001".to_string())));
    }

    #[test]
    fn test_snapshots_from_one_poll_merge_nothing() {
        let (_dir, ctx) = setup();
        ctx.raw.append_stations("bike_share_toronto", &[snap(14, 0, 10)]).unwrap();

        let result = run_merge_cycle(&ctx, "bike_share_toronto").unwrap();

        assert_eq!(result.rows_derived, 0);
        assert!(query(&ctx, "h", Some("7001")).is_empty());
        assert_eq!(ctx.raw.read_stations("bike_share_toronto").unwrap().len(), 1);
    }
}
