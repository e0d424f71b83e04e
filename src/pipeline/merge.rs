//! Trip merge & upsert
//!
//! Folds freshly derived rows into the durable measurement totals:
//!
//! ```text
//! raw stations ──► make_station_trips ──┐
//!                                        ├─► resolve stations ─► [tx] find / accumulate / upsert ─► commit
//! raw bikes ─────► make_free_bike_trips ─┘
//! ```
//!
//! Merging is not idempotent: re-merging the same raw window counts its
//! trips twice. The engine trims the raw tables right after every
//! successful merge so each delta is merged once.

use super::engine::TrackerContext;
use super::error::PipelineError;
use super::free_bike_diff::make_free_bike_trips;
use super::station_diff::make_station_trips;
use super::types::{DerivedEventRow, Measurement, MergeResult, RawFreeBikeSnapshot, RawStationSnapshot};
use std::collections::HashMap;

/// Derive hourly rows from both raw sets and merge them in one transaction
///
/// Free-bike rows are processed before station rows. Every distinct
/// `station_id` is resolved before the transaction starts, so an unknown
/// station aborts the cycle with nothing written.
pub fn derive_and_merge(
    ctx: &TrackerContext,
    system: &str,
    raw_station_rows: &[RawStationSnapshot],
    raw_bike_rows: &[RawFreeBikeSnapshot],
) -> Result<MergeResult, PipelineError> {
    let mut rows = make_free_bike_trips(raw_bike_rows);
    rows.extend(make_station_trips(raw_station_rows));

    if rows.is_empty() {
        log::debug!("{}: no derived rows ({} station / {} bike snapshots)",
            system, raw_station_rows.len(), raw_bike_rows.len());
        return Ok(MergeResult::default());
    }

    let station_keys = resolve_station_keys(ctx, system, &rows)?;
    merge_rows(ctx, system, &rows, &station_keys)
}

/// Map each external station id to its station primary key
fn resolve_station_keys(
    ctx: &TrackerContext,
    system: &str,
    rows: &[DerivedEventRow],
) -> Result<HashMap<String, i64>, PipelineError> {
    let mut keys = HashMap::new();
    for row in rows {
        if keys.contains_key(&row.station_id) {
            continue;
        }
        match ctx.stations.resolve_station(system, &row.station_id)? {
            Some(station) => {
                keys.insert(row.station_id.clone(), station.id);
            }
            None => {
                return Err(PipelineError::UnresolvedStation {
                    system: system.to_string(),
                    station_id: row.station_id.clone(),
                })
            }
        }
    }
    Ok(keys)
}

fn merge_rows(
    ctx: &TrackerContext,
    system: &str,
    rows: &[DerivedEventRow],
    station_keys: &HashMap<String, i64>,
) -> Result<MergeResult, PipelineError> {
    ctx.measurements.in_transaction(&mut |tx| {
        let mut result = MergeResult {
            rows_derived: rows.len(),
            ..MergeResult::default()
        };

        for row in rows {
            let station = station_keys.get(&row.station_id).copied().ok_or_else(|| {
                PipelineError::UnresolvedStation {
                    system: system.to_string(),
                    station_id: row.station_id.clone(),
                }
            })?;

            match tx.find(row.datetime, station)? {
                Some(mut existing) => {
                    existing.accumulate(row);
                    tx.upsert(&existing)?;
                    result.updated += 1;
                }
                None => {
                    tx.upsert(&Measurement::from_derived(row, station))?;
                    result.created += 1;
                }
            }

            result.trips += u64::from(row.trips);
            result.returns += u64::from(row.returns);
        }

        Ok(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{StationRepository, SqliteStore, SystemRepository, MeasurementStore};
    use crate::pipeline::raw_store::SqliteRawStore;
    use crate::pipeline::types::{StationFilter, StationInfo, FREE_BIKES_STATION_ID};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    fn setup(stations: &[&str]) -> (TempDir, TrackerContext, Arc<SqliteStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("main.db"), SCHEMA_DIR).unwrap());
        let raw = Arc::new(SqliteRawStore::open(dir.path().join("raw.db")).unwrap());
        let sys = store.insert_system("mobi", "America/Vancouver", "u").unwrap();
        for id in stations {
            let info = StationInfo {
                station_id: id.to_string(),
                name: format!("Station {}", id),
                lat: None,
                lon: None,
            };
            store.insert_station(sys.id, &info, at(0, 0)).unwrap();
        }
        let ctx = TrackerContext::from_stores(store.clone(), raw);
        (dir, ctx, store)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn snap(h: u32, m: u32, id: &str, bikes: u32) -> RawStationSnapshot {
        RawStationSnapshot {
            datetime: at(h, m),
            station_id: id.to_string(),
            num_bikes_available: bikes,
            num_docks_available: 15 - bikes,
            is_renting: true,
        }
    }

    fn bike(h: u32, m: u32, id: &str) -> RawFreeBikeSnapshot {
        RawFreeBikeSnapshot {
            datetime: at(h, m),
            bike_id: id.to_string(),
            lat: 49.28,
            lon: -123.12,
        }
    }

    #[test]
    fn test_merge_creates_then_accumulates() {
        let (_dir, ctx, store) = setup(&["A"]);

        // 10 -> 8 -> 9: (2, 1)
        let first = derive_and_merge(&ctx, "mobi", &[snap(10, 0, "A", 10), snap(10, 20, "A", 8), snap(10, 40, "A", 9)], &[]).unwrap();
        assert_eq!(first.created, 1);
        assert_eq!((first.trips, first.returns), (2, 1));

        // 9 -> 6: (3, 0) in the same hour
        let second = derive_and_merge(&ctx, "mobi", &[snap(10, 40, "A", 9), snap(10, 50, "A", 6)], &[]).unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(second.created, 0);

        let rows = store.range_query("mobi", at(0, 0), at(23, 0), &StationFilter::One("A".into())).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].trips, rows[0].returns), (5, 1));
        assert_eq!(rows[0].num_bikes_available, Some(9));
    }

    #[test]
    fn test_unresolved_station_writes_nothing() {
        let (_dir, ctx, store) = setup(&["A", FREE_BIKES_STATION_ID]);

        let err = derive_and_merge(
            &ctx,
            "mobi",
            &[snap(10, 0, "A", 5), snap(10, 20, "A", 3), snap(10, 0, "ghost", 2), snap(10, 20, "ghost", 1)],
            &[bike(10, 0, "1"), bike(10, 20, "2")],
        )
        .unwrap_err();

        match err {
            PipelineError::UnresolvedStation { system, station_id } => {
                assert_eq!(system, "mobi");
                assert_eq!(station_id, "ghost");
            }
            other => panic!("unexpected error: {}", other),
        }

        let rows = store.range_query("mobi", at(0, 0), at(23, 0), &StationFilter::Everything).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_free_bikes_merge_into_sentinel() {
        let (_dir, ctx, store) = setup(&[FREE_BIKES_STATION_ID]);

        let result = derive_and_merge(
            &ctx,
            "mobi",
            &[],
            &[bike(9, 0, "A"), bike(9, 0, "B"), bike(9, 0, "C"), bike(9, 20, "B"), bike(9, 20, "C"), bike(9, 20, "D")],
        )
        .unwrap();

        assert_eq!(result.rows_derived, 1);
        let rows = store.range_query("mobi", at(0, 0), at(23, 0), &StationFilter::FreeBikesOnly).unwrap();
        assert_eq!((rows[0].trips, rows[0].returns), (1, 1));
        assert_eq!(rows[0].num_bikes_available, Some(3));
        assert_eq!(rows[0].num_docks_available, None);
    }

    #[test]
    fn test_empty_input_is_noop() {
        let (_dir, ctx, _store) = setup(&[]);
        let result = derive_and_merge(&ctx, "mobi", &[snap(10, 0, "A", 3)], &[]).unwrap();
        assert_eq!(result, MergeResult::default());
    }
}
